//! Workflow engine: the orchestrator driving instances to a terminal state.
//!
//! One driver task per live instance keeps every instance single-writer; a
//! bounded worker pool (default 16 permits) is shared across instances for
//! step execution. External happenings -- job results, signalled events,
//! approvals, cancellation, sub-workflow completion -- reach a driver through
//! its signal mailbox. Every state transition is persisted before any
//! externally observable side effect.

mod driver;
mod path;

pub use path::StepPath;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_types::error::StoreError;
use orbitmesh_types::instance::{EventRecord, InstanceStatus, WorkflowInstance};
use orbitmesh_types::job::JobOutcome;
use orbitmesh_types::workflow::WorkflowDefinition;

use crate::dispatch::JobDispatcher;
use crate::executor::ExecutorSet;
use crate::notify::Notifier;
use crate::store::Store;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Engine tuning knobs, usually derived from `ServerConfig`.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent step executions across all instances.
    pub worker_pool_size: usize,
    /// Deadline for one notifier delivery.
    pub notifier_timeout: Duration,
    /// Job timeout when the step does not set one.
    pub default_job_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            worker_pool_size: 16,
            notifier_timeout: Duration::from_secs(10),
            default_job_timeout_secs: 3_600,
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow '{id}' version {version:?} not found")]
    DefinitionNotFound { id: String, version: Option<u32> },

    #[error("instance {0} not found or not live")]
    InstanceNotFound(Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("internal engine error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Signals
// ---------------------------------------------------------------------------

/// External happenings routed to an instance driver.
#[derive(Debug, Clone)]
pub enum InstanceSignal {
    JobResult {
        job_id: Uuid,
        outcome: JobOutcome,
    },
    Event {
        name: String,
        payload: Option<Value>,
    },
    Approval {
        step_id: String,
        approver: String,
        approved: bool,
        comment: Option<String>,
    },
    SubWorkflowFinished {
        instance_id: Uuid,
        status: InstanceStatus,
        variables: IndexMap<String, Value>,
    },
    Cancel,
}

/// Handle the session layer (or a test harness) uses to report terminal job
/// results. Reports are at-least-once; the engine's fold is idempotent keyed
/// by job id.
#[derive(Clone)]
pub struct JobResultSink {
    tx: mpsc::UnboundedSender<(Uuid, JobOutcome)>,
}

impl JobResultSink {
    pub fn report(&self, job_id: Uuid, outcome: JobOutcome) {
        // A closed engine drops reports; reconciliation replays them later.
        let _ = self.tx.send((job_id, outcome));
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct WorkflowEngine<S, D, N> {
    shared: Arc<EngineShared<S, D, N>>,
}

impl<S, D, N> Clone for WorkflowEngine<S, D, N> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

pub(crate) struct EngineShared<S, D, N> {
    pub(crate) store: Arc<S>,
    pub(crate) dispatcher: Arc<D>,
    pub(crate) executors: ExecutorSet<S, D, N>,
    pub(crate) workers: Arc<Semaphore>,
    pub(crate) mailboxes: DashMap<Uuid, mpsc::UnboundedSender<InstanceSignal>>,
    pub(crate) shutdown: CancellationToken,
    result_tx: mpsc::UnboundedSender<(Uuid, JobOutcome)>,
}

impl<S, D, N> WorkflowEngine<S, D, N>
where
    S: Store + 'static,
    D: JobDispatcher + 'static,
    N: Notifier + 'static,
{
    /// Construct the engine and start its result-routing task.
    pub fn new(store: Arc<S>, dispatcher: Arc<D>, notifier: Arc<N>, config: EngineConfig) -> Self {
        let (result_tx, result_rx) = mpsc::unbounded_channel();
        let executors = ExecutorSet::new(
            Arc::clone(&store),
            Arc::clone(&dispatcher),
            notifier,
            config.notifier_timeout,
            config.default_job_timeout_secs,
        );
        let shared = Arc::new(EngineShared {
            store,
            dispatcher,
            executors,
            workers: Arc::new(Semaphore::new(config.worker_pool_size)),
            mailboxes: DashMap::new(),
            shutdown: CancellationToken::new(),
            result_tx,
        });
        tokio::spawn(route_job_results(Arc::clone(&shared), result_rx));
        Self { shared }
    }

    /// Start a new instance of a registered workflow. Returns the instance
    /// id once the instance row is persisted and the driver is running.
    pub async fn start(
        &self,
        workflow_id: &str,
        version: Option<u32>,
        input: IndexMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        EngineShared::start_instance(&self.shared, workflow_id, version, input, None).await
    }

    /// Request cancellation. Live instances are cancelled through their
    /// driver; a non-terminal instance without a driver (e.g. before
    /// rehydration) is cancelled directly in the store.
    pub async fn cancel(&self, instance_id: Uuid) -> Result<(), EngineError> {
        if let Some(mailbox) = self.shared.mailboxes.get(&instance_id) {
            let _ = mailbox.send(InstanceSignal::Cancel);
            return Ok(());
        }
        let Some(mut instance) = self.shared.store.get_instance(instance_id).await? else {
            return Err(EngineError::InstanceNotFound(instance_id));
        };
        if instance.status.is_terminal() {
            return Ok(());
        }
        instance.status = InstanceStatus::Cancelled;
        instance.ended_at = Some(Utc::now());
        self.shared.store.save_instance(&instance).await?;
        tracing::info!(%instance_id, "instance cancelled (no live driver)");
        Ok(())
    }

    /// Deliver a named event to a waiting instance. The event is persisted
    /// before delivery.
    pub async fn signal_event(
        &self,
        instance_id: Uuid,
        name: &str,
        payload: Option<Value>,
    ) -> Result<(), EngineError> {
        // Clone the sender out so no map guard is held across the store
        // write.
        let mailbox = self
            .shared
            .mailboxes
            .get(&instance_id)
            .map(|entry| entry.clone())
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let record = EventRecord {
            id: Uuid::now_v7(),
            instance_id,
            name: name.to_string(),
            payload: payload.clone(),
            received_at: Utc::now(),
        };
        self.shared.store.append_event(&record).await?;
        let _ = mailbox.send(InstanceSignal::Event {
            name: name.to_string(),
            payload,
        });
        Ok(())
    }

    /// Resolve an approval gate.
    pub async fn approve_step(
        &self,
        instance_id: Uuid,
        step_id: &str,
        approver: &str,
        approved: bool,
        comment: Option<String>,
    ) -> Result<(), EngineError> {
        let mailbox = self
            .shared
            .mailboxes
            .get(&instance_id)
            .ok_or(EngineError::InstanceNotFound(instance_id))?;
        let _ = mailbox.send(InstanceSignal::Approval {
            step_id: step_id.to_string(),
            approver: approver.to_string(),
            approved,
            comment,
        });
        Ok(())
    }

    /// Sink for terminal job results.
    pub fn result_sink(&self) -> JobResultSink {
        JobResultSink {
            tx: self.shared.result_tx.clone(),
        }
    }

    /// Reload every non-terminal instance and re-enter its scheduling loop.
    /// Returns the number of instances resumed.
    pub async fn rehydrate(&self) -> Result<usize, EngineError> {
        let instances = self.shared.store.list_non_terminal_instances().await?;
        let mut resumed = 0;
        for instance in instances {
            if self.shared.mailboxes.contains_key(&instance.id) {
                continue;
            }
            let def = self
                .shared
                .store
                .get_definition(&instance.workflow_id, Some(instance.workflow_version))
                .await?;
            let Some(def) = def else {
                tracing::error!(
                    instance_id = %instance.id,
                    workflow_id = instance.workflow_id.as_str(),
                    "definition missing for persisted instance; leaving it untouched"
                );
                continue;
            };
            tracing::info!(
                instance_id = %instance.id,
                workflow_id = instance.workflow_id.as_str(),
                status = ?instance.status,
                "rehydrating instance"
            );
            EngineShared::spawn_driver(&self.shared, def, instance, true);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// Fetch the current instance record.
    pub async fn get_instance(&self, instance_id: Uuid) -> Result<WorkflowInstance, EngineError> {
        self.shared
            .store
            .get_instance(instance_id)
            .await?
            .ok_or(EngineError::InstanceNotFound(instance_id))
    }

    /// Poll the store until the instance reaches a terminal status or the
    /// deadline passes. Intended for callers that need a synchronous answer
    /// (tests, CLI waits).
    pub async fn await_terminal(
        &self,
        instance_id: Uuid,
        timeout: Duration,
    ) -> Result<InstanceStatus, EngineError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let instance = self.get_instance(instance_id).await?;
            if instance.status.is_terminal() {
                return Ok(instance.status);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(EngineError::Internal(format!(
                    "instance {instance_id} still {:?} after {timeout:?}",
                    instance.status
                )));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Stop accepting work and cancel every live driver.
    pub fn shutdown(&self) {
        self.shared.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Shared internals
// ---------------------------------------------------------------------------

impl<S, D, N> EngineShared<S, D, N>
where
    S: Store + 'static,
    D: JobDispatcher + 'static,
    N: Notifier + 'static,
{
    /// Create and persist a fresh instance, then hand it to a driver task.
    pub(crate) async fn start_instance(
        shared: &Arc<Self>,
        workflow_id: &str,
        version: Option<u32>,
        input: IndexMap<String, Value>,
        parent_instance_id: Option<Uuid>,
    ) -> Result<Uuid, EngineError> {
        let def = shared
            .store
            .get_definition(workflow_id, version)
            .await?
            .ok_or_else(|| EngineError::DefinitionNotFound {
                id: workflow_id.to_string(),
                version,
            })?;

        let instance = WorkflowInstance::new(
            &def.id,
            def.version,
            def.steps.iter().map(|s| s.id.clone()),
            input,
            parent_instance_id,
        );
        let instance_id = instance.id;
        shared.store.create_instance(&instance).await?;

        tracing::info!(
            %instance_id,
            workflow_id = def.id.as_str(),
            version = def.version,
            "starting workflow instance"
        );
        Self::spawn_driver(shared, def, instance, false);
        Ok(instance_id)
    }

    /// Register a mailbox and run the driver to completion in its own task.
    pub(crate) fn spawn_driver(
        shared: &Arc<Self>,
        def: WorkflowDefinition,
        instance: WorkflowInstance,
        recovered: bool,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let instance_id = instance.id;
        let parent = instance.parent_instance_id;
        shared.mailboxes.insert(instance_id, tx);

        let shared = Arc::clone(shared);
        tokio::spawn(async move {
            let driver = driver::InstanceDriver::new(Arc::clone(&shared), def, instance, rx, recovered);
            let final_state = driver.run().await;
            shared.mailboxes.remove(&instance_id);

            match final_state {
                Ok((status, variables)) => {
                    if let Some(parent_id) = parent {
                        shared.notify_parent(parent_id, instance_id, status, variables);
                    }
                }
                Err(err) => {
                    tracing::error!(%instance_id, error = %err, "instance driver aborted");
                }
            }
        });
    }

    fn notify_parent(
        &self,
        parent_id: Uuid,
        child_id: Uuid,
        status: InstanceStatus,
        variables: IndexMap<String, Value>,
    ) {
        if let Some(mailbox) = self.mailboxes.get(&parent_id) {
            let _ = mailbox.send(InstanceSignal::SubWorkflowFinished {
                instance_id: child_id,
                status,
                variables,
            });
        } else {
            tracing::debug!(
                %parent_id,
                %child_id,
                "parent driver not live; sub-workflow completion will be folded on rehydration"
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Result routing
// ---------------------------------------------------------------------------

/// Consume terminal job reports: record the result on the job row (first
/// terminal wins) and forward the signal to the owning driver.
async fn route_job_results<S, D, N>(
    shared: Arc<EngineShared<S, D, N>>,
    mut rx: mpsc::UnboundedReceiver<(Uuid, JobOutcome)>,
) where
    S: Store + 'static,
    D: JobDispatcher + 'static,
    N: Notifier + 'static,
{
    loop {
        let (job_id, outcome) = tokio::select! {
            next = rx.recv() => match next {
                Some(pair) => pair,
                None => return,
            },
            _ = shared.shutdown.cancelled() => return,
        };

        let job = match shared.store.get_job(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::warn!(%job_id, "terminal result for unknown job");
                continue;
            }
            Err(err) => {
                tracing::error!(%job_id, error = %err, "failed to load job for result fold");
                continue;
            }
        };

        // Record the terminal state unless someone (the session layer, or an
        // earlier duplicate) already did. CAS keyed on the observed status
        // keeps the first terminal write authoritative.
        if !job.status.is_terminal() {
            match shared
                .store
                .compare_and_set_job_status(job_id, job.status, outcome.status())
                .await
            {
                Ok(true) => {
                    let mut updated = job.clone();
                    updated.status = outcome.status();
                    updated.ended_at = Some(Utc::now());
                    match &outcome {
                        JobOutcome::Succeeded { output } => updated.result = Some(output.clone()),
                        JobOutcome::Failed { error } => updated.error = Some(error.clone()),
                        JobOutcome::TimedOut => {
                            updated.error = Some("job timed out".to_string());
                        }
                        JobOutcome::Cancelled => {}
                    }
                    if let Err(err) = shared.store.save_job(&updated).await {
                        tracing::error!(%job_id, error = %err, "failed to persist job result");
                    }
                }
                Ok(false) => {
                    tracing::debug!(%job_id, "job result already recorded; duplicate discarded");
                }
                Err(err) => {
                    tracing::error!(%job_id, error = %err, "job status CAS failed");
                }
            }
        }

        if let Some(mailbox) = shared.mailboxes.get(&job.instance_id) {
            let _ = mailbox.send(InstanceSignal::JobResult { job_id, outcome });
        } else {
            tracing::debug!(
                %job_id,
                instance_id = %job.instance_id,
                "no live driver for job result; folded on rehydration"
            );
        }
    }
}
