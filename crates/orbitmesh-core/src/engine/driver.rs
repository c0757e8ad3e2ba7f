//! Per-instance driver: the single writer that walks an instance from start
//! to a terminal status.
//!
//! The driver loops over a scan-apply-wait cycle: scan the step tree for
//! skips, ready steps, and foldable branch parents; apply the transitions and
//! persist; then wait for the next happening (a finished executor task, a
//! mailbox signal, or a timer). Compensation runs sequentially at the end of
//! a failing instance, in reverse completion order.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_types::error::StoreError;
use orbitmesh_types::instance::{
    BranchInstance, InstanceStatus, StepInstance, StepStatus, WorkflowInstance,
};
use orbitmesh_types::job::{Job, JobOutcome, JobStatus};
use orbitmesh_types::workflow::{StepConfig, StepType, WorkflowDefinition, WorkflowStep};

use crate::dispatch::JobDispatcher;
use crate::executor::{StepExecution, WaitKind};
use crate::expr;
use crate::notify::Notifier;
use crate::store::Store;

use super::path::{StepPath, branch_list, find_definition, find_step, find_step_mut};
use super::{EngineError, EngineShared, InstanceSignal};

// ---------------------------------------------------------------------------
// Internal types
// ---------------------------------------------------------------------------

/// Outcome of one spawned step-execution task.
struct TaskOutcome {
    path: StepPath,
    result: TaskResult,
}

enum TaskResult {
    Executed(StepExecution),
    TimedOut,
    Cancelled,
    Store(StoreError),
}

/// Transition discovered by a scan pass.
enum Action {
    Skip(StepPath, &'static str),
    Fail(StepPath, String),
    Execute(StepPath),
    FoldBranches(StepPath),
    CancelJob(Uuid),
    CancelChild(Uuid),
}

#[derive(Debug, Clone)]
enum TimerKind {
    /// Wakes the loop so the scan re-checks a retry-scheduled step.
    Retry,
    DelayWake(StepPath),
    JobDeadline { path: StepPath, job_id: Uuid },
    WaitDeadline(StepPath),
}

#[derive(Debug, Clone)]
struct TimerEntry {
    at: DateTime<Utc>,
    kind: TimerKind,
}

enum Completion {
    Completed,
    ReadyToCompensate,
}

/// Delay before re-running attempt `attempt + 1`. A configured fixed delay
/// wins; otherwise exponential backoff, base 1s doubling, capped at 60s.
fn retry_delay_secs(step: &WorkflowStep, attempt: u32) -> u64 {
    match step.retry_delay_secs {
        Some(fixed) => fixed,
        None => 1u64 << (attempt.saturating_sub(1)).min(6),
    }
    .min(60)
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

pub(crate) struct InstanceDriver<S, D, N> {
    shared: Arc<EngineShared<S, D, N>>,
    def: WorkflowDefinition,
    instance: WorkflowInstance,
    mailbox: mpsc::UnboundedReceiver<InstanceSignal>,
    cancel: CancellationToken,
    tasks: JoinSet<TaskOutcome>,
    timers: Vec<TimerEntry>,
    /// Terminal results that arrived before the dispatching task recorded
    /// the job id on its step. Folded as soon as the id lands.
    early_results: std::collections::HashMap<Uuid, JobOutcome>,
    recovered: bool,
}

impl<S, D, N> InstanceDriver<S, D, N>
where
    S: Store + 'static,
    D: JobDispatcher + 'static,
    N: Notifier + 'static,
{
    pub(crate) fn new(
        shared: Arc<EngineShared<S, D, N>>,
        def: WorkflowDefinition,
        instance: WorkflowInstance,
        mailbox: mpsc::UnboundedReceiver<InstanceSignal>,
        recovered: bool,
    ) -> Self {
        let cancel = shared.shutdown.child_token();
        Self {
            shared,
            def,
            instance,
            mailbox,
            cancel,
            tasks: JoinSet::new(),
            timers: Vec::new(),
            early_results: std::collections::HashMap::new(),
            recovered,
        }
    }

    pub(crate) async fn run(
        mut self,
    ) -> Result<(InstanceStatus, IndexMap<String, Value>), EngineError> {
        if self.recovered {
            self.normalize_after_restart().await?;
        }
        if self.instance.status == InstanceStatus::Pending {
            self.instance.status = InstanceStatus::Running;
            self.persist().await?;
        }

        // Crashed mid-compensation: resume the walk instead of scheduling.
        if self.instance.status == InstanceStatus::Compensating {
            let all_ok = self.run_compensation().await?;
            self.finish_compensation(all_ok).await?;
            return Ok((self.instance.status, self.instance.variables.clone()));
        }

        loop {
            let changed = self.scan_and_apply().await?;
            if changed {
                continue;
            }

            match self.completion_state() {
                Some(Completion::Completed) => {
                    self.instance.status = InstanceStatus::Completed;
                    self.instance.ended_at = Some(Utc::now());
                    self.persist().await?;
                    tracing::info!(instance_id = %self.instance.id, "instance completed");
                    break;
                }
                Some(Completion::ReadyToCompensate) if self.tasks.is_empty() => {
                    self.record_failure();
                    if self.has_compensation_targets() {
                        let all_ok = self.run_compensation().await?;
                        self.finish_compensation(all_ok).await?;
                    } else {
                        // No compensation applies: plain failure.
                        self.instance.status = InstanceStatus::Failed;
                        self.instance.ended_at = Some(Utc::now());
                        self.persist().await?;
                        tracing::warn!(
                            instance_id = %self.instance.id,
                            failed_step = self.instance.failed_step_id.as_deref().unwrap_or(""),
                            "instance failed"
                        );
                    }
                    break;
                }
                _ => {}
            }

            self.update_wait_status().await?;

            let next_timer = self.timers.iter().map(|t| t.at).min();
            let sleep_for = next_timer
                .map(|at| (at - Utc::now()).to_std().unwrap_or_default())
                .unwrap_or(Duration::from_secs(3600));

            tokio::select! {
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    match joined {
                        Ok(outcome) => self.apply_task_outcome(outcome).await?,
                        Err(err) if err.is_cancelled() => {}
                        Err(err) => {
                            tracing::error!(
                                instance_id = %self.instance.id,
                                error = %err,
                                "step task panicked"
                            );
                        }
                    }
                }
                signal = self.mailbox.recv() => {
                    match signal {
                        Some(InstanceSignal::Cancel) | None => {
                            self.handle_cancel().await?;
                            break;
                        }
                        Some(signal) => self.apply_signal(signal).await?,
                    }
                }
                _ = tokio::time::sleep(sleep_for), if next_timer.is_some() => {
                    self.fire_due_timers().await?;
                }
                _ = self.cancel.cancelled() => {
                    self.handle_cancel().await?;
                    break;
                }
            }
        }

        Ok((self.instance.status, self.instance.variables.clone()))
    }

    /// Persist the instance, retrying a store conflict once.
    async fn persist(&self) -> Result<(), EngineError> {
        match self.shared.store.save_instance(&self.instance).await {
            Err(StoreError::Conflict(reason)) => {
                tracing::warn!(
                    instance_id = %self.instance.id,
                    reason = reason.as_str(),
                    "instance save conflicted; retrying once"
                );
                Ok(self.shared.store.save_instance(&self.instance).await?)
            }
            other => Ok(other?),
        }
    }

    // -----------------------------------------------------------------------
    // Scan
    // -----------------------------------------------------------------------

    /// One scan pass: collect transitions, apply and persist them, and spawn
    /// executor tasks for ready steps. Returns true when a fold/skip/fail
    /// transition happened (the caller should re-scan before waiting).
    async fn scan_and_apply(&mut self) -> Result<bool, EngineError> {
        let actions = self.collect_actions();
        if actions.is_empty() {
            return Ok(false);
        }

        let mut changed = false;
        let mut to_execute = Vec::new();
        let mut jobs_to_cancel = Vec::new();
        for action in actions {
            match action {
                Action::Skip(path, reason) => {
                    if let Some(step) = find_step_mut(&mut self.instance, &path) {
                        step.status = StepStatus::Skipped;
                        step.ended_at = Some(Utc::now());
                        tracing::debug!(
                            instance_id = %self.instance.id,
                            step = %path,
                            reason,
                            "step skipped"
                        );
                        changed = true;
                    }
                }
                Action::Fail(path, error) => {
                    if let Some(step) = find_step_mut(&mut self.instance, &path) {
                        step.status = StepStatus::Failed;
                        step.last_error = Some(error);
                        step.ended_at = Some(Utc::now());
                        changed = true;
                    }
                }
                Action::FoldBranches(path) => {
                    self.fold_branches(&path).await?;
                    changed = true;
                }
                Action::Execute(path) => to_execute.push(path),
                Action::CancelJob(job_id) => jobs_to_cancel.push(job_id),
                Action::CancelChild(child_id) => {
                    if let Some(mailbox) = self.shared.mailboxes.get(&child_id) {
                        let _ = mailbox.send(InstanceSignal::Cancel);
                    }
                }
            }
        }

        // Mark every launched step Running before any executor side effect.
        for path in &to_execute {
            if let Some(step) = find_step_mut(&mut self.instance, path) {
                step.status = StepStatus::Ready;
                step.scheduled_at = None;
                step.status = StepStatus::Running;
                step.attempt += 1;
                step.started_at = Some(Utc::now());
            }
        }
        if changed || !to_execute.is_empty() {
            self.persist().await?;
        }
        for job_id in jobs_to_cancel {
            self.shared.dispatcher.cancel(job_id).await;
        }
        for path in to_execute {
            self.launch(path);
        }
        Ok(changed)
    }

    /// Walk the whole step tree and collect pending transitions.
    fn collect_actions(&self) -> Vec<Action> {
        let mut actions = Vec::new();
        let fatal = self.has_fatal_failure();
        for inst in &self.instance.steps {
            self.scan_step(
                &self.def.steps,
                &self.instance.steps,
                inst,
                StepPath::top(&inst.step_id),
                fatal,
                &mut actions,
            );
        }
        actions
    }

    /// Scan one step (and recurse into its branches). `siblings` is the step
    /// list the step belongs to; dependencies resolve against it.
    fn scan_step(
        &self,
        defs: &[WorkflowStep],
        siblings: &[StepInstance],
        inst: &StepInstance,
        path: StepPath,
        fatal: bool,
        actions: &mut Vec<Action>,
    ) {
        let now = Utc::now();
        let Some(def) = defs.iter().find(|d| d.id == inst.step_id) else {
            return;
        };

        match inst.status {
            StepStatus::Pending => {
                // A non-recoverable failure anywhere poisons further
                // scheduling; a failure among siblings poisons this list.
                let list_failed = fatal
                    || siblings.iter().any(|s| {
                        s.status == StepStatus::Failed
                            && defs
                                .iter()
                                .find(|d| d.id == s.step_id)
                                .is_none_or(|d| !d.continue_on_error)
                    });
                if list_failed {
                    actions.push(Action::Skip(path, "instance failing"));
                    return;
                }
                if inst.scheduled_at.is_some_and(|t| t > now) {
                    return; // retry backoff still pending
                }
                for dep_id in &def.depends_on {
                    let dep_inst = siblings.iter().find(|s| &s.step_id == dep_id);
                    let dep_def = defs.iter().find(|d| &d.id == dep_id);
                    let (Some(dep_inst), Some(dep_def)) = (dep_inst, dep_def) else {
                        return;
                    };
                    if dep_inst.status == StepStatus::Failed && !dep_def.continue_on_error {
                        actions.push(Action::Skip(path, "dependency failed"));
                        return;
                    }
                    let settled = dep_inst.status.is_settled()
                        || (dep_inst.status == StepStatus::Failed && dep_def.continue_on_error);
                    if !settled {
                        return;
                    }
                }
                if let Some(condition) = &def.condition {
                    let scope = self.scope_for(&path);
                    match expr::parse(condition)
                        .and_then(|parsed| expr::evaluate_bool(&parsed, &scope))
                    {
                        Ok(true) => actions.push(Action::Execute(path)),
                        Ok(false) => actions.push(Action::Skip(path, "condition false")),
                        Err(err) => {
                            actions.push(Action::Fail(path, format!("condition failed: {err}")));
                        }
                    }
                } else {
                    actions.push(Action::Execute(path));
                }
            }
            StepStatus::Running => {
                if fatal {
                    if let Some(job_id) = inst.job_id {
                        actions.push(Action::CancelJob(job_id));
                    }
                    if let Some(child) = inst.sub_workflow_instance_id {
                        actions.push(Action::CancelChild(child));
                    }
                }
                if !inst.branches.is_empty() {
                    let mut all_terminal = true;
                    for branch in &inst.branches {
                        let Some(branch_defs) = branch_list(&def.config, &branch.key) else {
                            continue;
                        };
                        for branch_step in &branch.steps {
                            let child_path = path.child(&branch.key, &branch_step.step_id);
                            self.scan_step(
                                branch_defs,
                                branch.steps.as_slice(),
                                branch_step,
                                child_path,
                                fatal,
                                actions,
                            );
                            if !branch_step.status.is_terminal() {
                                all_terminal = false;
                            }
                        }
                    }
                    if all_terminal {
                        actions.push(Action::FoldBranches(path));
                    }
                }
            }
            StepStatus::WaitingForEvent | StepStatus::WaitingForApproval => {
                if fatal {
                    actions.push(Action::Skip(path, "instance failing"));
                }
            }
            _ => {}
        }
    }

    /// Any top-level step terminally Failed without continue_on_error.
    fn has_fatal_failure(&self) -> bool {
        self.instance.steps.iter().any(|s| {
            s.status == StepStatus::Failed
                && self
                    .def
                    .steps
                    .iter()
                    .find(|d| d.id == s.step_id)
                    .is_none_or(|d| !d.continue_on_error)
        })
    }

    fn completion_state(&self) -> Option<Completion> {
        if self.instance.status.is_terminal() {
            return None;
        }
        if !self.instance.steps.iter().all(|s| s.status.is_terminal()) {
            return None;
        }
        if self.has_fatal_failure() {
            Some(Completion::ReadyToCompensate)
        } else {
            Some(Completion::Completed)
        }
    }

    fn record_failure(&mut self) {
        let failed = self.instance.steps.iter().find(|s| {
            s.status == StepStatus::Failed
                && self
                    .def
                    .steps
                    .iter()
                    .find(|d| d.id == s.step_id)
                    .is_none_or(|d| !d.continue_on_error)
        });
        if let Some(failed) = failed {
            self.instance.failed_step_id = Some(failed.step_id.clone());
            self.instance.error = failed.last_error.clone();
        }
    }

    /// Reflect waiting steps in the instance status.
    async fn update_wait_status(&mut self) -> Result<(), EngineError> {
        if self.instance.status.is_terminal()
            || self.instance.status == InstanceStatus::Compensating
        {
            return Ok(());
        }
        let mut waiting_event = false;
        let mut waiting_approval = false;
        let mut stack: Vec<&StepInstance> = self.instance.steps.iter().collect();
        while let Some(step) = stack.pop() {
            match step.status {
                StepStatus::WaitingForEvent => waiting_event = true,
                StepStatus::WaitingForApproval => waiting_approval = true,
                _ => {}
            }
            for branch in &step.branches {
                stack.extend(branch.steps.iter());
            }
        }
        let next = if waiting_approval {
            InstanceStatus::WaitingForApproval
        } else if waiting_event {
            InstanceStatus::WaitingForEvent
        } else {
            InstanceStatus::Running
        };
        if self.instance.status != next {
            self.instance.status = next;
            self.persist().await?;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Execution
    // -----------------------------------------------------------------------

    /// Spawn the executor task for a step already marked Running.
    fn launch(&mut self, path: StepPath) {
        let Some(def_step) = find_definition(&self.def.steps, &path).cloned() else {
            return;
        };
        let scope = self.scope_for(&path);
        let shared = Arc::clone(&self.shared);
        let cancel = self.cancel.clone();
        let instance_id = self.instance.id;

        tracing::debug!(
            %instance_id,
            step = %path,
            step_type = ?def_step.step_type,
            "launching step"
        );

        self.tasks.spawn(async move {
            let _permit = shared.workers.clone().acquire_owned().await;
            if cancel.is_cancelled() {
                return TaskOutcome {
                    path,
                    result: TaskResult::Cancelled,
                };
            }

            let execution = shared
                .executors
                .execute(instance_id, &def_step, &scope, &cancel);
            // The attempt deadline applies to in-process work; dispatched
            // jobs get their own deadline timer from the driver.
            let result = match def_step.timeout_secs {
                Some(secs) if def_step.step_type != StepType::Job => {
                    match tokio::time::timeout(Duration::from_secs(secs), execution).await {
                        Ok(inner) => inner.map(TaskResult::Executed),
                        Err(_) => {
                            return TaskOutcome {
                                path,
                                result: TaskResult::TimedOut,
                            };
                        }
                    }
                }
                _ => execution.await.map(TaskResult::Executed),
            };
            TaskOutcome {
                path,
                result: result.unwrap_or_else(TaskResult::Store),
            }
        });
    }

    async fn apply_task_outcome(&mut self, outcome: TaskOutcome) -> Result<(), EngineError> {
        let TaskOutcome { path, result } = outcome;
        match result {
            TaskResult::Executed(StepExecution::Completed { output }) => {
                self.complete_step(&path, output).await?;
            }
            TaskResult::Executed(StepExecution::Failed { error }) => {
                self.fail_attempt(&path, error).await?;
            }
            TaskResult::Executed(StepExecution::JobDispatched { job_id, timeout_secs }) => {
                if let Some(step) = find_step_mut(&mut self.instance, &path) {
                    step.job_id = Some(job_id);
                }
                self.timers.push(TimerEntry {
                    at: Utc::now() + chrono::Duration::seconds(timeout_secs as i64),
                    kind: TimerKind::JobDeadline {
                        path: path.clone(),
                        job_id,
                    },
                });
                self.persist().await?;
                // The terminal frame may have beaten us here.
                if let Some(outcome) = self.early_results.remove(&job_id) {
                    self.apply_signal(InstanceSignal::JobResult { job_id, outcome })
                        .await?;
                }
            }
            TaskResult::Executed(StepExecution::StartSubWorkflow {
                workflow_id,
                version,
                input,
            }) => {
                let input = sub_workflow_input(input);
                match EngineShared::start_instance(
                    &self.shared,
                    &workflow_id,
                    version,
                    input,
                    Some(self.instance.id),
                )
                .await
                {
                    Ok(child_id) => {
                        if let Some(step) = find_step_mut(&mut self.instance, &path) {
                            step.sub_workflow_instance_id = Some(child_id);
                        }
                        self.persist().await?;
                    }
                    Err(EngineError::DefinitionNotFound { id, version }) => {
                        self.fail_attempt(
                            &path,
                            format!("sub-workflow '{id}' version {version:?} not found"),
                        )
                        .await?;
                    }
                    Err(other) => return Err(other),
                }
            }
            TaskResult::Executed(StepExecution::Branches { branches }) => {
                let no_branches = branches.is_empty();
                if let Some(step) = find_step_mut(&mut self.instance, &path) {
                    step.branches = branches
                        .into_iter()
                        .map(|seed| BranchInstance {
                            key: seed.key,
                            steps: seed.steps.iter().map(|s| StepInstance::new(&s.id)).collect(),
                            variables: seed.variables,
                        })
                        .collect();
                }
                self.persist().await?;
                // A ForEach over an empty sequence (or a Parallel with no
                // branches) folds straight to its empty result.
                if no_branches {
                    self.fold_branches(&path).await?;
                }
            }
            TaskResult::Executed(StepExecution::Waiting { kind }) => {
                self.suspend_step(&path, kind).await?;
            }
            TaskResult::TimedOut => {
                self.fail_attempt(&path, "step timed out".to_string()).await?;
            }
            TaskResult::Cancelled => {}
            TaskResult::Store(err) => return Err(err.into()),
        }
        Ok(())
    }

    /// Park a step in a waiting status and arm the matching timer.
    async fn suspend_step(&mut self, path: &StepPath, kind: WaitKind) -> Result<(), EngineError> {
        let def_timeout = find_definition(&self.def.steps, path).and_then(|d| d.timeout_secs);
        match kind {
            WaitKind::Timer { wake_at } => {
                if let Some(step) = find_step_mut(&mut self.instance, path) {
                    step.status = StepStatus::WaitingForEvent;
                    step.wake_at = Some(wake_at);
                }
                self.timers.push(TimerEntry {
                    at: wake_at,
                    kind: TimerKind::DelayWake(path.clone()),
                });
            }
            WaitKind::Event { .. } | WaitKind::Approval => {
                let status = match kind {
                    WaitKind::Approval => StepStatus::WaitingForApproval,
                    _ => StepStatus::WaitingForEvent,
                };
                if let Some(step) = find_step_mut(&mut self.instance, path) {
                    step.status = status;
                }
                if let Some(secs) = def_timeout {
                    self.timers.push(TimerEntry {
                        at: Utc::now() + chrono::Duration::seconds(secs as i64),
                        kind: TimerKind::WaitDeadline(path.clone()),
                    });
                }
            }
        }
        self.persist().await
    }

    /// Mark a step Completed, assign its commit sequence, and publish its
    /// output variable into the enclosing scope.
    async fn complete_step(
        &mut self,
        path: &StepPath,
        output: Option<Value>,
    ) -> Result<(), EngineError> {
        let seq = self.instance.take_completion_seq();
        let output_variable =
            find_definition(&self.def.steps, path).and_then(|d| d.output_variable.clone());

        if let Some(step) = find_step_mut(&mut self.instance, path) {
            step.status = StepStatus::Completed;
            step.output = output.clone();
            step.ended_at = Some(Utc::now());
            step.wake_at = None;
            step.completion_seq = Some(seq);
        }
        if let Some(var) = output_variable {
            self.write_variable(path, &var, output.unwrap_or(Value::Null));
        }
        tracing::debug!(
            instance_id = %self.instance.id,
            step = %path,
            completion_seq = seq,
            "step completed"
        );
        self.persist().await
    }

    /// Apply the retry policy to a failed attempt.
    async fn fail_attempt(&mut self, path: &StepPath, error: String) -> Result<(), EngineError> {
        let Some(def) = find_definition(&self.def.steps, path).cloned() else {
            return Ok(());
        };
        // While the instance is failing, retries are pointless noise.
        let retriable = !self.has_fatal_failure();
        let instance_id = self.instance.id;
        if let Some(step) = find_step_mut(&mut self.instance, path) {
            step.last_error = Some(error.clone());
            if retriable && step.attempt <= def.max_retries {
                let delay = retry_delay_secs(&def, step.attempt);
                let resume_at = Utc::now() + chrono::Duration::seconds(delay as i64);
                step.status = StepStatus::Pending;
                step.scheduled_at = Some(resume_at);
                step.job_id = None;
                step.sub_workflow_instance_id = None;
                step.branches.clear();
                step.wake_at = None;
                self.timers.push(TimerEntry {
                    at: resume_at,
                    kind: TimerKind::Retry,
                });
                tracing::warn!(
                    instance_id = %instance_id,
                    step = %path,
                    attempt = step.attempt,
                    max_retries = def.max_retries,
                    retry_in_secs = delay,
                    error = error.as_str(),
                    "step attempt failed; retrying"
                );
            } else {
                step.status = StepStatus::Failed;
                step.ended_at = Some(Utc::now());
                tracing::warn!(
                    instance_id = %instance_id,
                    step = %path,
                    attempt = step.attempt,
                    error = error.as_str(),
                    "step failed"
                );
            }
        }
        self.persist().await
    }

    /// Fold a branch parent whose branch steps are all terminal.
    async fn fold_branches(&mut self, path: &StepPath) -> Result<(), EngineError> {
        let Some(def) = find_definition(&self.def.steps, path).cloned() else {
            return Ok(());
        };
        let Some(step) = find_step(&self.instance, path) else {
            return Ok(());
        };

        // Propagate the first non-recoverable branch failure.
        let mut failure: Option<String> = None;
        'outer: for branch in &step.branches {
            let Some(branch_defs) = branch_list(&def.config, &branch.key) else {
                continue;
            };
            for branch_step in &branch.steps {
                if branch_step.status == StepStatus::Failed {
                    let coe = branch_defs
                        .iter()
                        .find(|d| d.id == branch_step.step_id)
                        .is_some_and(|d| d.continue_on_error);
                    if !coe {
                        failure = Some(format!(
                            "branch '{}' step '{}' failed: {}",
                            branch.key,
                            branch_step.step_id,
                            branch_step.last_error.as_deref().unwrap_or("unknown error")
                        ));
                        break 'outer;
                    }
                }
            }
        }

        if let Some(error) = failure {
            return self.fail_attempt(path, error).await;
        }

        let output = match &def.config {
            StepConfig::Parallel { .. } => {
                let mut map = Map::new();
                for branch in &step.branches {
                    map.insert(branch.key.clone(), branch_result(branch));
                }
                Value::Object(map)
            }
            StepConfig::ForEach { .. } => {
                Value::Array(step.branches.iter().map(branch_result).collect())
            }
            // Conditional has exactly one branch instance.
            _ => step.branches.first().map(branch_result).unwrap_or(Value::Null),
        };
        self.complete_step(path, Some(output)).await
    }

    /// Write a value into the scope that encloses the step: the instance bag
    /// for top-level steps, the owning branch bag for nested ones.
    fn write_variable(&mut self, path: &StepPath, name: &str, value: Value) {
        match path.parent() {
            None => {
                self.instance.variables.insert(name.to_string(), value);
            }
            Some((parent_path, key)) => {
                let key = key.to_string();
                if let Some(parent) = find_step_mut(&mut self.instance, &parent_path) {
                    if let Some(branch) = parent.branches.iter_mut().find(|b| b.key == key) {
                        branch.variables.insert(name.to_string(), value);
                    }
                }
            }
        }
    }

    /// Expression scope for a step: the instance bag overlaid with every
    /// branch bag along the path, innermost last.
    fn scope_for(&self, path: &StepPath) -> Value {
        let mut map: Map<String, Value> = self
            .instance
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let mut chain = Vec::new();
        let mut cursor = path.clone();
        while let Some((parent, key)) = cursor.parent() {
            chain.push((parent.clone(), key.to_string()));
            cursor = parent;
        }
        chain.reverse();
        for (parent_path, key) in &chain {
            if let Some(parent) = find_step(&self.instance, parent_path) {
                if let Some(branch) = parent.branches.iter().find(|b| &b.key == key) {
                    for (k, v) in &branch.variables {
                        map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        Value::Object(map)
    }

    // -----------------------------------------------------------------------
    // Signals
    // -----------------------------------------------------------------------

    async fn apply_signal(&mut self, signal: InstanceSignal) -> Result<(), EngineError> {
        match signal {
            InstanceSignal::JobResult { job_id, outcome } => {
                // Idempotent fold: only a Running step holding this job id
                // accepts the result; duplicates find nothing.
                let Some(path) = self.find_path(|_, inst| {
                    inst.status == StepStatus::Running && inst.job_id == Some(job_id)
                }) else {
                    // Either a duplicate (already folded) or a result that
                    // outran the dispatch bookkeeping. Stash it; a stash hit
                    // on fold resolves the race, duplicates age out.
                    if self.early_results.len() < 256 {
                        self.early_results.entry(job_id).or_insert(outcome);
                    }
                    tracing::debug!(
                        instance_id = %self.instance.id,
                        %job_id,
                        "job result without a matching running step; stashed"
                    );
                    return Ok(());
                };
                self.timers.retain(|t| {
                    !matches!(&t.kind, TimerKind::JobDeadline { job_id: deadline_job, .. }
                        if *deadline_job == job_id)
                });
                match outcome {
                    JobOutcome::Succeeded { output } => {
                        self.complete_step(&path, Some(output)).await?;
                    }
                    JobOutcome::Failed { error } => {
                        self.fail_attempt(&path, error).await?;
                    }
                    JobOutcome::TimedOut => {
                        self.fail_attempt(&path, "job timed out".to_string()).await?;
                    }
                    JobOutcome::Cancelled => {
                        self.fail_attempt(&path, "job cancelled".to_string()).await?;
                    }
                }
            }
            InstanceSignal::Event { name, payload } => {
                let waiting = self.find_paths(|def, inst| {
                    inst.status == StepStatus::WaitingForEvent
                        && inst.wake_at.is_none()
                        && matches!(&def.config, StepConfig::WaitForEvent { event } if *event == name)
                });
                if waiting.is_empty() {
                    tracing::debug!(
                        instance_id = %self.instance.id,
                        event = name.as_str(),
                        "event signalled but no step is waiting for it"
                    );
                }
                for path in waiting {
                    self.complete_step(&path, payload.clone()).await?;
                }
            }
            InstanceSignal::Approval {
                step_id,
                approver,
                approved,
                comment,
            } => {
                let Some(path) = self.find_path(|_, inst| {
                    inst.step_id == step_id && inst.status == StepStatus::WaitingForApproval
                }) else {
                    tracing::debug!(
                        instance_id = %self.instance.id,
                        step_id = step_id.as_str(),
                        "approval for a step that is not waiting"
                    );
                    return Ok(());
                };
                if approved {
                    let output = json!({
                        "approver": approver,
                        "approved": true,
                        "comment": comment,
                    });
                    self.complete_step(&path, Some(output)).await?;
                } else {
                    self.fail_attempt(&path, format!("approval denied by {approver}"))
                        .await?;
                }
            }
            InstanceSignal::SubWorkflowFinished {
                instance_id,
                status,
                variables,
            } => {
                let Some(path) = self.find_path(|_, inst| {
                    inst.status == StepStatus::Running
                        && inst.sub_workflow_instance_id == Some(instance_id)
                }) else {
                    return Ok(());
                };
                if status == InstanceStatus::Completed {
                    let output = Value::Object(variables.into_iter().collect());
                    self.complete_step(&path, Some(output)).await?;
                } else {
                    self.fail_attempt(&path, format!("sub-workflow ended {status:?}"))
                        .await?;
                }
            }
            InstanceSignal::Cancel => {}
        }
        Ok(())
    }

    fn find_path(&self, pred: impl Fn(&WorkflowStep, &StepInstance) -> bool) -> Option<StepPath> {
        self.find_paths(pred).into_iter().next()
    }

    fn find_paths(&self, pred: impl Fn(&WorkflowStep, &StepInstance) -> bool) -> Vec<StepPath> {
        fn recurse(
            defs: &[WorkflowStep],
            inst: &StepInstance,
            path: StepPath,
            pred: &dyn Fn(&WorkflowStep, &StepInstance) -> bool,
            found: &mut Vec<StepPath>,
        ) {
            let Some(def) = defs.iter().find(|d| d.id == inst.step_id) else {
                return;
            };
            if pred(def, inst) {
                found.push(path.clone());
            }
            for branch in &inst.branches {
                if let Some(branch_defs) = branch_list(&def.config, &branch.key) {
                    for branch_step in &branch.steps {
                        let child = path.child(&branch.key, &branch_step.step_id);
                        recurse(branch_defs, branch_step, child, pred, found);
                    }
                }
            }
        }

        let mut found = Vec::new();
        for inst in &self.instance.steps {
            recurse(
                &self.def.steps,
                inst,
                StepPath::top(&inst.step_id),
                &pred,
                &mut found,
            );
        }
        found
    }

    // -----------------------------------------------------------------------
    // Timers
    // -----------------------------------------------------------------------

    async fn fire_due_timers(&mut self) -> Result<(), EngineError> {
        let now = Utc::now();
        let due: Vec<TimerEntry> = self.timers.iter().filter(|t| t.at <= now).cloned().collect();
        self.timers.retain(|t| t.at > now);

        for timer in due {
            match timer.kind {
                TimerKind::Retry => {} // waking the loop is enough
                TimerKind::DelayWake(path) => {
                    let due_now = find_step(&self.instance, &path).is_some_and(|s| {
                        s.status == StepStatus::WaitingForEvent
                            && s.wake_at.is_some_and(|at| at <= now)
                    });
                    if due_now {
                        self.complete_step(&path, None).await?;
                    }
                }
                TimerKind::JobDeadline { path, job_id } => {
                    let still_running = find_step(&self.instance, &path)
                        .is_some_and(|s| s.status == StepStatus::Running && s.job_id == Some(job_id));
                    if still_running {
                        self.shared.dispatcher.cancel(job_id).await;
                        self.mark_job_timed_out(job_id).await;
                        self.fail_attempt(&path, "step timed out".to_string()).await?;
                    }
                }
                TimerKind::WaitDeadline(path) => {
                    let still_waiting = find_step(&self.instance, &path).is_some_and(|s| {
                        matches!(
                            s.status,
                            StepStatus::WaitingForEvent | StepStatus::WaitingForApproval
                        ) && s.wake_at.is_none()
                    });
                    if still_waiting {
                        self.fail_attempt(&path, "step timed out".to_string()).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Best-effort terminal mark for a job whose deadline elapsed.
    async fn mark_job_timed_out(&self, job_id: Uuid) {
        let Ok(Some(job)) = self.shared.store.get_job(job_id).await else {
            return;
        };
        if job.status.is_terminal() {
            return;
        }
        if let Err(err) = self
            .shared
            .store
            .compare_and_set_job_status(job_id, job.status, JobStatus::TimedOut)
            .await
        {
            tracing::warn!(%job_id, error = %err, "failed to record job timeout");
        }
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    async fn handle_cancel(&mut self) -> Result<(), EngineError> {
        if self.instance.status.is_terminal() {
            return Ok(());
        }
        self.cancel.cancel();

        // Best-effort propagation to outstanding jobs and children.
        let outstanding =
            self.find_paths(|_, inst| inst.status == StepStatus::Running && inst.job_id.is_some());
        for path in outstanding {
            if let Some(job_id) = find_step(&self.instance, &path).and_then(|s| s.job_id) {
                self.shared.dispatcher.cancel(job_id).await;
            }
        }
        let children = self.find_paths(|_, inst| {
            inst.status == StepStatus::Running && inst.sub_workflow_instance_id.is_some()
        });
        for path in children {
            if let Some(child) =
                find_step(&self.instance, &path).and_then(|s| s.sub_workflow_instance_id)
            {
                if let Some(mailbox) = self.shared.mailboxes.get(&child) {
                    let _ = mailbox.send(InstanceSignal::Cancel);
                }
            }
        }

        self.instance.status = InstanceStatus::Cancelled;
        self.instance.ended_at = Some(Utc::now());
        self.persist().await?;
        tracing::info!(instance_id = %self.instance.id, "instance cancelled");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Crash recovery
    // -----------------------------------------------------------------------

    /// Repair in-flight state after a restart: interrupted in-process steps
    /// re-run, dispatched jobs re-anchor to their deadline (or fold
    /// immediately when the result landed while we were down), delays re-arm
    /// with the remaining duration.
    async fn normalize_after_restart(&mut self) -> Result<(), EngineError> {
        let running = self
            .find_paths(|_, inst| matches!(inst.status, StepStatus::Ready | StepStatus::Running));
        let waiting = self.find_paths(|_, inst| {
            matches!(
                inst.status,
                StepStatus::WaitingForEvent | StepStatus::WaitingForApproval
            )
        });

        let mut pending_folds: Vec<(StepPath, FoldAfterRestart)> = Vec::new();

        for path in running {
            let Some(step) = find_step(&self.instance, &path) else {
                continue;
            };
            if let Some(job_id) = step.job_id {
                match self.shared.store.get_job(job_id).await? {
                    Some(job) if job.status.is_terminal() => {
                        pending_folds.push((path, FoldAfterRestart::Job(job_outcome_of(&job))));
                    }
                    Some(job) => {
                        self.timers.push(TimerEntry {
                            at: job.created_at + chrono::Duration::seconds(job.timeout_secs as i64),
                            kind: TimerKind::JobDeadline {
                                path: path.clone(),
                                job_id,
                            },
                        });
                    }
                    None => {
                        // Job row lost: rerun the attempt.
                        if let Some(step) = find_step_mut(&mut self.instance, &path) {
                            step.status = StepStatus::Pending;
                            step.attempt = step.attempt.saturating_sub(1);
                            step.job_id = None;
                        }
                    }
                }
            } else if let Some(child_id) = step.sub_workflow_instance_id {
                if let Some(child) = self.shared.store.get_instance(child_id).await? {
                    if child.status.is_terminal() {
                        pending_folds.push((
                            path,
                            FoldAfterRestart::Child(child.status, child.variables),
                        ));
                    }
                }
            } else if step.branches.is_empty() {
                // Interrupted in-process attempt: run it again without
                // double-counting.
                if let Some(step) = find_step_mut(&mut self.instance, &path) {
                    step.status = StepStatus::Pending;
                    step.attempt = step.attempt.saturating_sub(1);
                    step.started_at = None;
                }
            }
        }

        for path in waiting {
            let Some(step) = find_step(&self.instance, &path) else {
                continue;
            };
            if let Some(wake_at) = step.wake_at {
                self.timers.push(TimerEntry {
                    at: wake_at,
                    kind: TimerKind::DelayWake(path.clone()),
                });
            } else if let Some(secs) =
                find_definition(&self.def.steps, &path).and_then(|d| d.timeout_secs)
            {
                let anchor = step.started_at.unwrap_or_else(Utc::now);
                self.timers.push(TimerEntry {
                    at: anchor + chrono::Duration::seconds(secs as i64),
                    kind: TimerKind::WaitDeadline(path.clone()),
                });
            }
        }

        self.persist().await?;
        for (path, fold) in pending_folds {
            match fold {
                FoldAfterRestart::Job(outcome) => {
                    let job_id = find_step(&self.instance, &path).and_then(|s| s.job_id);
                    if let Some(job_id) = job_id {
                        self.apply_signal(InstanceSignal::JobResult { job_id, outcome })
                            .await?;
                    }
                }
                FoldAfterRestart::Child(status, variables) => {
                    if status == InstanceStatus::Completed {
                        self.complete_step(
                            &path,
                            Some(Value::Object(variables.into_iter().collect())),
                        )
                        .await?;
                    } else {
                        self.fail_attempt(&path, format!("sub-workflow ended {status:?}"))
                            .await?;
                    }
                }
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Compensation
    // -----------------------------------------------------------------------

    fn has_compensation_targets(&self) -> bool {
        !self
            .find_paths(|def, inst| {
                matches!(inst.status, StepStatus::Failed | StepStatus::Completed)
                    && def.compensation.is_some()
            })
            .is_empty()
    }

    /// Walk compensation targets in reverse completion order. The failed
    /// pivot step (if it carries a compensation) runs first, since its
    /// partial side effects are the most recent.
    async fn run_compensation(&mut self) -> Result<bool, EngineError> {
        if self.instance.status != InstanceStatus::Compensating {
            self.instance.status = InstanceStatus::Compensating;
            self.persist().await?;
        }
        tracing::info!(instance_id = %self.instance.id, "entering compensation");

        let mut failed_targets = self
            .find_paths(|def, inst| inst.status == StepStatus::Failed && def.compensation.is_some());
        let mut completed_targets: Vec<(StepPath, u64)> = self
            .find_paths(|def, inst| {
                inst.status == StepStatus::Completed && def.compensation.is_some()
            })
            .into_iter()
            .filter_map(|path| {
                find_step(&self.instance, &path)
                    .and_then(|s| s.completion_seq)
                    .map(|seq| (path, seq))
            })
            .collect();
        completed_targets.sort_by(|a, b| b.1.cmp(&a.1));

        let mut targets: Vec<StepPath> = Vec::new();
        targets.append(&mut failed_targets);
        targets.extend(completed_targets.into_iter().map(|(path, _)| path));

        let mut all_ok = true;
        for path in targets {
            if !self.compensate_one(&path).await? {
                all_ok = false;
            }
        }
        Ok(all_ok)
    }

    async fn compensate_one(&mut self, path: &StepPath) -> Result<bool, EngineError> {
        let Some(def) = find_definition(&self.def.steps, path).cloned() else {
            return Ok(true);
        };
        let Some(spec) = def.compensation.clone() else {
            return Ok(true);
        };

        if let Some(step) = find_step_mut(&mut self.instance, path) {
            step.status = StepStatus::Compensating;
        }
        self.persist().await?;

        // The recorded output of the original step is in scope.
        let mut scope = self.scope_for(path);
        if let Value::Object(map) = &mut scope {
            let output = find_step(&self.instance, path)
                .and_then(|s| s.output.clone())
                .unwrap_or(Value::Null);
            map.insert("compensated_output".to_string(), output);
        }

        let undo_step = WorkflowStep {
            id: format!("{}::undo", def.id),
            name: format!("{} (compensation)", def.name),
            step_type: spec.config.step_type(),
            config: spec.config,
            depends_on: vec![],
            condition: None,
            timeout_secs: spec.timeout_secs,
            max_retries: spec.max_retries,
            retry_delay_secs: None,
            continue_on_error: false,
            compensation: None,
            output_variable: None,
        };

        let max_attempts = spec.max_retries + 1;
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.run_compensation_attempt(&undo_step, &scope).await? {
                if let Some(step) = find_step_mut(&mut self.instance, path) {
                    step.status = StepStatus::Compensated;
                }
                self.persist().await?;
                tracing::info!(
                    instance_id = %self.instance.id,
                    step = %path,
                    "compensation completed"
                );
                return Ok(true);
            }
            if attempt < max_attempts {
                let delay = retry_delay_secs(&undo_step, attempt);
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
        }

        if let Some(step) = find_step_mut(&mut self.instance, path) {
            step.status = StepStatus::Failed;
            step.last_error = Some("compensation failed".to_string());
        }
        self.persist().await?;
        tracing::error!(
            instance_id = %self.instance.id,
            step = %path,
            attempts = max_attempts,
            "compensation failed"
        );
        Ok(false)
    }

    /// One compensation attempt. Dispatched jobs and sub-workflows are
    /// awaited inline on the mailbox; unrelated signals arriving meanwhile
    /// are discarded (main-plan work is already terminal).
    async fn run_compensation_attempt(
        &mut self,
        undo_step: &WorkflowStep,
        scope: &Value,
    ) -> Result<bool, EngineError> {
        let execution = self
            .shared
            .executors
            .execute(self.instance.id, undo_step, scope, &self.cancel)
            .await?;

        match execution {
            StepExecution::Completed { .. } => Ok(true),
            StepExecution::Failed { error } => {
                tracing::warn!(
                    instance_id = %self.instance.id,
                    error = error.as_str(),
                    "compensation attempt failed"
                );
                Ok(false)
            }
            StepExecution::JobDispatched { job_id, timeout_secs } => {
                self.await_compensation_job(job_id, timeout_secs).await
            }
            StepExecution::StartSubWorkflow {
                workflow_id,
                version,
                input,
            } => {
                let input = sub_workflow_input(input);
                let child_id = match EngineShared::start_instance(
                    &self.shared,
                    &workflow_id,
                    version,
                    input,
                    Some(self.instance.id),
                )
                .await
                {
                    Ok(child_id) => child_id,
                    Err(EngineError::DefinitionNotFound { .. }) => return Ok(false),
                    Err(other) => return Err(other),
                };
                self.await_compensation_child(child_id).await
            }
            StepExecution::Waiting {
                kind: WaitKind::Timer { wake_at },
            } => {
                let delay = (wake_at - Utc::now()).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;
                Ok(true)
            }
            StepExecution::Waiting { .. } | StepExecution::Branches { .. } => {
                // Validation keeps these out of compensation configs.
                Ok(false)
            }
        }
    }

    async fn await_compensation_job(
        &mut self,
        job_id: Uuid,
        timeout_secs: u64,
    ) -> Result<bool, EngineError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let signal = tokio::select! {
                signal = self.mailbox.recv() => signal,
                _ = tokio::time::sleep_until(deadline) => {
                    self.shared.dispatcher.cancel(job_id).await;
                    return Ok(false);
                }
                _ = self.cancel.cancelled() => return Ok(false),
            };
            match signal {
                Some(InstanceSignal::JobResult { job_id: got, outcome }) if got == job_id => {
                    return Ok(matches!(outcome, JobOutcome::Succeeded { .. }));
                }
                Some(_) => continue,
                None => return Ok(false),
            }
        }
    }

    async fn await_compensation_child(&mut self, child_id: Uuid) -> Result<bool, EngineError> {
        loop {
            let signal = tokio::select! {
                signal = self.mailbox.recv() => signal,
                _ = self.cancel.cancelled() => return Ok(false),
            };
            match signal {
                Some(InstanceSignal::SubWorkflowFinished { instance_id, status, .. })
                    if instance_id == child_id =>
                {
                    return Ok(status == InstanceStatus::Completed);
                }
                Some(_) => continue,
                None => return Ok(false),
            }
        }
    }

    async fn finish_compensation(&mut self, all_ok: bool) -> Result<(), EngineError> {
        self.instance.status = if all_ok {
            InstanceStatus::Compensated
        } else {
            InstanceStatus::Failed
        };
        self.instance.ended_at = Some(Utc::now());
        self.persist().await?;
        tracing::info!(
            instance_id = %self.instance.id,
            status = ?self.instance.status,
            failed_step = self.instance.failed_step_id.as_deref().unwrap_or(""),
            "instance finished after compensation"
        );
        Ok(())
    }
}

enum FoldAfterRestart {
    Job(JobOutcome),
    Child(InstanceStatus, IndexMap<String, Value>),
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// The folded result of a branch: the output of its last step.
fn branch_result(branch: &BranchInstance) -> Value {
    branch
        .steps
        .last()
        .and_then(|s| s.output.clone())
        .unwrap_or(Value::Null)
}

/// Turn a SubWorkflow input value into the child's initial variable bag.
fn sub_workflow_input(input: Option<Value>) -> IndexMap<String, Value> {
    match input {
        Some(Value::Object(map)) => map.into_iter().collect(),
        Some(other) => {
            let mut bag = IndexMap::new();
            bag.insert("input".to_string(), other);
            bag
        }
        None => IndexMap::new(),
    }
}

fn job_outcome_of(job: &Job) -> JobOutcome {
    match job.status {
        JobStatus::Succeeded => JobOutcome::Succeeded {
            output: job.result.clone().unwrap_or(Value::Null),
        },
        JobStatus::Failed => JobOutcome::Failed {
            error: job.error.clone().unwrap_or_else(|| "job failed".to_string()),
        },
        JobStatus::TimedOut => JobOutcome::TimedOut,
        _ => JobOutcome::Cancelled,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
