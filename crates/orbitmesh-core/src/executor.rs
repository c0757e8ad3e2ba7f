//! Step executor set: one handler per step type.
//!
//! `ExecutorSet::execute` dispatches on the `StepConfig` variant and returns
//! a `StepExecution` describing what the engine should record next. Handlers
//! never touch instance rows -- the driver owns those -- but the Job handler
//! does persist the job row before the dispatch side effect, and the Notify
//! handler talks to the notifier port under its deadline.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_types::error::StoreError;
use orbitmesh_types::job::{AgentSelector, Job};
use orbitmesh_types::workflow::{StepConfig, WorkflowStep};

use crate::dispatch::JobDispatcher;
use crate::expr;
use crate::notify::Notifier;
use crate::store::JobStore;

// ---------------------------------------------------------------------------
// StepExecution
// ---------------------------------------------------------------------------

/// What a step execution produced. The driver folds this into the step
/// instance and persists the transition.
#[derive(Debug)]
pub enum StepExecution {
    Completed {
        output: Option<Value>,
    },
    Failed {
        error: String,
    },
    /// A job row was persisted and handed to the dispatcher; terminal state
    /// arrives later through the result sink.
    JobDispatched {
        job_id: Uuid,
        timeout_secs: u64,
    },
    /// The driver should create a child instance and suspend this step until
    /// the child reaches a terminal status.
    StartSubWorkflow {
        workflow_id: String,
        version: Option<u32>,
        input: Option<Value>,
    },
    /// Branch bodies to materialize as `BranchInstance`s.
    Branches {
        branches: Vec<BranchSeed>,
    },
    Waiting {
        kind: WaitKind,
    },
}

/// Seed for one branch instance.
#[derive(Debug)]
pub struct BranchSeed {
    pub key: String,
    pub steps: Vec<WorkflowStep>,
    /// Branch-local bindings (the ForEach loop variable).
    pub variables: IndexMap<String, Value>,
}

/// Why a step is suspended.
#[derive(Debug, Clone, PartialEq)]
pub enum WaitKind {
    Timer { wake_at: DateTime<Utc> },
    Event { name: String },
    Approval,
}

// ---------------------------------------------------------------------------
// ExecutorSet
// ---------------------------------------------------------------------------

/// Closed dispatch over the ten step types. New kinds are added by extending
/// the `StepConfig` variant and the match below.
pub struct ExecutorSet<S, D, N> {
    job_store: Arc<S>,
    dispatcher: Arc<D>,
    notifier: Arc<N>,
    notifier_timeout: Duration,
    default_job_timeout_secs: u64,
}

impl<S, D, N> ExecutorSet<S, D, N>
where
    S: JobStore,
    D: JobDispatcher,
    N: Notifier,
{
    pub fn new(
        job_store: Arc<S>,
        dispatcher: Arc<D>,
        notifier: Arc<N>,
        notifier_timeout: Duration,
        default_job_timeout_secs: u64,
    ) -> Self {
        Self {
            job_store,
            dispatcher,
            notifier,
            notifier_timeout,
            default_job_timeout_secs,
        }
    }

    /// Execute one step attempt against the given expression scope.
    ///
    /// Only store failures bubble as `Err`; everything else -- including
    /// expression errors and notifier failures -- folds into
    /// `StepExecution::Failed` so the retry policy applies.
    pub async fn execute(
        &self,
        instance_id: Uuid,
        step: &WorkflowStep,
        scope: &Value,
        cancel: &CancellationToken,
    ) -> Result<StepExecution, StoreError> {
        match &step.config {
            StepConfig::Job { selector, payload } => {
                self.execute_job(instance_id, step, selector, payload, scope)
                    .await
            }
            StepConfig::Parallel { branches } => Ok(StepExecution::Branches {
                branches: branches
                    .iter()
                    .map(|b| BranchSeed {
                        key: b.name.clone(),
                        steps: b.steps.clone(),
                        variables: IndexMap::new(),
                    })
                    .collect(),
            }),
            StepConfig::Conditional {
                condition,
                then_steps,
                else_steps,
            } => Ok(execute_conditional(condition, then_steps, else_steps, scope)),
            StepConfig::Delay { duration_secs } => Ok(StepExecution::Waiting {
                kind: WaitKind::Timer {
                    wake_at: Utc::now() + chrono::Duration::seconds(*duration_secs as i64),
                },
            }),
            StepConfig::WaitForEvent { event } => Ok(StepExecution::Waiting {
                kind: WaitKind::Event {
                    name: event.clone(),
                },
            }),
            StepConfig::SubWorkflow {
                workflow_id,
                version,
                input,
            } => Ok(execute_sub_workflow(workflow_id, *version, input.as_ref(), scope)),
            StepConfig::ForEach {
                items,
                item_var,
                steps,
            } => Ok(execute_for_each(items, item_var, steps, scope)),
            StepConfig::Transform { expression } => Ok(execute_transform(expression, scope)),
            StepConfig::Notify { target, message } => {
                Ok(self.execute_notify(target, message, scope, cancel).await)
            }
            StepConfig::Approval { .. } => Ok(StepExecution::Waiting {
                kind: WaitKind::Approval,
            }),
        }
    }

    /// Construct the job record, persist it, then enqueue it with the
    /// dispatcher. Persist-before-dispatch: a crash between the two leaves a
    /// Queued job row that reconciliation re-dispatches.
    async fn execute_job(
        &self,
        instance_id: Uuid,
        step: &WorkflowStep,
        selector: &AgentSelector,
        payload: &Value,
        scope: &Value,
    ) -> Result<StepExecution, StoreError> {
        let payload = match expr::interpolate_value(payload, scope) {
            Ok(payload) => payload,
            Err(err) => {
                return Ok(StepExecution::Failed {
                    error: format!("payload interpolation failed: {err}"),
                });
            }
        };

        let timeout = step.timeout_secs.unwrap_or(self.default_job_timeout_secs);
        let job = Job::new(instance_id, &step.id, selector.clone(), payload, Some(timeout));
        let job_id = job.id;

        self.job_store.create_job(&job).await?;

        match self.dispatcher.dispatch(&job).await {
            Ok(()) => {
                tracing::debug!(%instance_id, step_id = step.id.as_str(), %job_id, "job dispatched");
                Ok(StepExecution::JobDispatched {
                    job_id,
                    timeout_secs: timeout,
                })
            }
            Err(err) => Ok(StepExecution::Failed {
                error: format!("dispatch failed: {err}"),
            }),
        }
    }

    async fn execute_notify(
        &self,
        target: &str,
        message: &str,
        scope: &Value,
        cancel: &CancellationToken,
    ) -> StepExecution {
        let message = match expr::interpolate(message, scope) {
            Ok(message) => message,
            Err(err) => {
                return StepExecution::Failed {
                    error: format!("message interpolation failed: {err}"),
                };
            }
        };
        let target = match expr::interpolate(target, scope) {
            Ok(target) => target,
            Err(err) => {
                return StepExecution::Failed {
                    error: format!("target interpolation failed: {err}"),
                };
            }
        };

        let delivery = self.notifier.notify(&target, &message);
        tokio::select! {
            _ = cancel.cancelled() => StepExecution::Failed {
                error: "notification cancelled".to_string(),
            },
            result = tokio::time::timeout(self.notifier_timeout, delivery) => match result {
                Ok(Ok(())) => StepExecution::Completed {
                    output: Some(Value::String(target)),
                },
                Ok(Err(err)) => StepExecution::Failed {
                    error: format!("notification failed: {err}"),
                },
                Err(_) => StepExecution::Failed {
                    error: "notification timed out".to_string(),
                },
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Pure handlers
// ---------------------------------------------------------------------------

fn execute_conditional(
    condition: &str,
    then_steps: &[WorkflowStep],
    else_steps: &[WorkflowStep],
    scope: &Value,
) -> StepExecution {
    let parsed = match expr::parse(condition) {
        Ok(parsed) => parsed,
        Err(err) => {
            return StepExecution::Failed {
                error: format!("condition failed: {err}"),
            };
        }
    };
    match expr::evaluate_bool(&parsed, scope) {
        Ok(true) => StepExecution::Branches {
            branches: vec![BranchSeed {
                key: "then".to_string(),
                steps: then_steps.to_vec(),
                variables: IndexMap::new(),
            }],
        },
        Ok(false) => StepExecution::Branches {
            branches: vec![BranchSeed {
                key: "else".to_string(),
                steps: else_steps.to_vec(),
                variables: IndexMap::new(),
            }],
        },
        Err(err) => StepExecution::Failed {
            error: format!("condition failed: {err}"),
        },
    }
}

fn execute_sub_workflow(
    workflow_id: &str,
    version: Option<u32>,
    input: Option<&Value>,
    scope: &Value,
) -> StepExecution {
    let input = match input {
        Some(raw) => match expr::interpolate_value(raw, scope) {
            Ok(input) => Some(input),
            Err(err) => {
                return StepExecution::Failed {
                    error: format!("input interpolation failed: {err}"),
                };
            }
        },
        None => None,
    };
    StepExecution::StartSubWorkflow {
        workflow_id: workflow_id.to_string(),
        version,
        input,
    }
}

fn execute_for_each(
    items: &str,
    item_var: &str,
    steps: &[WorkflowStep],
    scope: &Value,
) -> StepExecution {
    let parsed = match expr::parse(items) {
        Ok(parsed) => parsed,
        Err(err) => {
            return StepExecution::Failed {
                error: format!("items expression failed: {err}"),
            };
        }
    };
    let value = match expr::evaluate(&parsed, scope) {
        Ok(value) => value,
        Err(err) => {
            return StepExecution::Failed {
                error: format!("items expression failed: {err}"),
            };
        }
    };
    let Value::Array(elements) = value else {
        return StepExecution::Failed {
            error: format!("items expression '{items}' did not evaluate to an array"),
        };
    };

    let branches = elements
        .into_iter()
        .enumerate()
        .map(|(index, element)| {
            let mut variables = IndexMap::new();
            variables.insert(item_var.to_string(), element);
            variables.insert(
                format!("{item_var}_index"),
                Value::Number((index as i64).into()),
            );
            BranchSeed {
                key: index.to_string(),
                steps: steps.to_vec(),
                variables,
            }
        })
        .collect();
    StepExecution::Branches { branches }
}

fn execute_transform(expression: &str, scope: &Value) -> StepExecution {
    let parsed = match expr::parse(expression) {
        Ok(parsed) => parsed,
        Err(err) => {
            return StepExecution::Failed {
                error: format!("transform failed: {err}"),
            };
        }
    };
    match expr::evaluate(&parsed, scope) {
        Ok(value) => StepExecution::Completed {
            output: Some(value),
        },
        Err(err) => StepExecution::Failed {
            error: format!("transform failed: {err}"),
        },
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::DispatchError;
    use crate::notify::NotifyError;
    use orbitmesh_types::job::JobStatus;
    use orbitmesh_types::workflow::{ParallelBranch, StepType};
    use serde_json::json;
    use std::sync::Mutex;

    // -- fakes ------------------------------------------------------------

    #[derive(Default)]
    struct FakeJobStore {
        jobs: Mutex<Vec<Job>>,
    }

    impl JobStore for FakeJobStore {
        async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
            self.jobs.lock().unwrap().push(job.clone());
            Ok(())
        }
        async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
            Ok(self.jobs.lock().unwrap().iter().find(|j| j.id == id).cloned())
        }
        async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
            let mut jobs = self.jobs.lock().unwrap();
            if let Some(slot) = jobs.iter_mut().find(|j| j.id == job.id) {
                *slot = job.clone();
            }
            Ok(())
        }
        async fn compare_and_set_job_status(
            &self,
            id: Uuid,
            expected: JobStatus,
            next: JobStatus,
        ) -> Result<bool, StoreError> {
            let mut jobs = self.jobs.lock().unwrap();
            match jobs.iter_mut().find(|j| j.id == id) {
                Some(job) if job.status == expected => {
                    job.status = next;
                    Ok(true)
                }
                Some(_) => Ok(false),
                None => Err(StoreError::NotFound),
            }
        }
        async fn list_jobs_for_agent(&self, _agent_id: Uuid) -> Result<Vec<Job>, StoreError> {
            Ok(vec![])
        }
        async fn list_outstanding_jobs(&self) -> Result<Vec<Job>, StoreError> {
            Ok(vec![])
        }
    }

    /// Dispatcher that records dispatched jobs; optionally refuses them.
    struct FakeDispatcher {
        dispatched: Mutex<Vec<Uuid>>,
        refuse: bool,
    }

    impl FakeDispatcher {
        fn accepting() -> Self {
            Self {
                dispatched: Mutex::new(vec![]),
                refuse: false,
            }
        }
        fn refusing() -> Self {
            Self {
                dispatched: Mutex::new(vec![]),
                refuse: true,
            }
        }
    }

    impl JobDispatcher for FakeDispatcher {
        async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
            if self.refuse {
                return Err(DispatchError::AgentUnavailable { job_id: job.id });
            }
            self.dispatched.lock().unwrap().push(job.id);
            Ok(())
        }
        async fn cancel(&self, _job_id: Uuid) {}
    }

    struct FakeNotifier {
        deliveries: Mutex<Vec<(String, String)>>,
        fail: bool,
    }

    impl FakeNotifier {
        fn ok() -> Self {
            Self {
                deliveries: Mutex::new(vec![]),
                fail: false,
            }
        }
        fn failing() -> Self {
            Self {
                deliveries: Mutex::new(vec![]),
                fail: true,
            }
        }
    }

    impl Notifier for FakeNotifier {
        async fn notify(&self, target: &str, message: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Delivery("endpoint refused".to_string()));
            }
            self.deliveries
                .lock()
                .unwrap()
                .push((target.to_string(), message.to_string()));
            Ok(())
        }
    }

    fn executors(
        store: Arc<FakeJobStore>,
        dispatcher: Arc<FakeDispatcher>,
        notifier: Arc<FakeNotifier>,
    ) -> ExecutorSet<FakeJobStore, FakeDispatcher, FakeNotifier> {
        ExecutorSet::new(store, dispatcher, notifier, Duration::from_secs(10), 3_600)
    }

    fn step(id: &str, step_type: StepType, config: StepConfig) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            step_type,
            config,
            depends_on: vec![],
            condition: None,
            timeout_secs: None,
            max_retries: 0,
            retry_delay_secs: None,
            continue_on_error: false,
            compensation: None,
            output_variable: None,
        }
    }

    // -- Job --------------------------------------------------------------

    #[tokio::test]
    async fn job_persists_before_dispatch_and_interpolates_payload() {
        let store = Arc::new(FakeJobStore::default());
        let dispatcher = Arc::new(FakeDispatcher::accepting());
        let set = executors(store.clone(), dispatcher.clone(), Arc::new(FakeNotifier::ok()));

        let s = step(
            "run",
            StepType::Job,
            StepConfig::Job {
                selector: AgentSelector::default(),
                payload: json!({"cmd": "deploy ${$.release}"}),
            },
        );
        let scope = json!({"release": "v42"});
        let result = set
            .execute(Uuid::now_v7(), &s, &scope, &CancellationToken::new())
            .await
            .unwrap();

        let StepExecution::JobDispatched { job_id, timeout_secs } = result else {
            panic!("expected JobDispatched");
        };
        assert_eq!(timeout_secs, 3_600);
        let jobs = store.jobs.lock().unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].id, job_id);
        assert_eq!(jobs[0].payload, json!({"cmd": "deploy v42"}));
        assert_eq!(*dispatcher.dispatched.lock().unwrap(), vec![job_id]);
    }

    #[tokio::test]
    async fn job_dispatch_refusal_is_a_failed_attempt() {
        let store = Arc::new(FakeJobStore::default());
        let set = executors(
            store.clone(),
            Arc::new(FakeDispatcher::refusing()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "run",
            StepType::Job,
            StepConfig::Job {
                selector: AgentSelector::default(),
                payload: json!({}),
            },
        );
        let result = set
            .execute(Uuid::now_v7(), &s, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        let StepExecution::Failed { error } = result else {
            panic!("expected Failed");
        };
        assert!(error.contains("dispatch failed"));
        // The job row still exists (persist-before-dispatch).
        assert_eq!(store.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn job_step_timeout_overrides_default() {
        let store = Arc::new(FakeJobStore::default());
        let set = executors(
            store.clone(),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let mut s = step(
            "run",
            StepType::Job,
            StepConfig::Job {
                selector: AgentSelector::default(),
                payload: json!({}),
            },
        );
        s.timeout_secs = Some(90);
        let result = set
            .execute(Uuid::now_v7(), &s, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        let StepExecution::JobDispatched { timeout_secs, .. } = result else {
            panic!("expected JobDispatched");
        };
        assert_eq!(timeout_secs, 90);
        assert_eq!(store.jobs.lock().unwrap()[0].timeout_secs, 90);
    }

    // -- Branching --------------------------------------------------------

    #[tokio::test]
    async fn parallel_materializes_named_branches() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "fan",
            StepType::Parallel,
            StepConfig::Parallel {
                branches: vec![
                    ParallelBranch {
                        name: "east".to_string(),
                        steps: vec![],
                    },
                    ParallelBranch {
                        name: "west".to_string(),
                        steps: vec![],
                    },
                ],
            },
        );
        let result = set
            .execute(Uuid::now_v7(), &s, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        let StepExecution::Branches { branches } = result else {
            panic!("expected Branches");
        };
        let keys: Vec<&str> = branches.iter().map(|b| b.key.as_str()).collect();
        assert_eq!(keys, vec!["east", "west"]);
    }

    #[tokio::test]
    async fn conditional_selects_then_or_else() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "check",
            StepType::Conditional,
            StepConfig::Conditional {
                condition: "$.x > 10".to_string(),
                then_steps: vec![],
                else_steps: vec![],
            },
        );

        for (x, expected) in [(5, "else"), (11, "then")] {
            let result = set
                .execute(
                    Uuid::now_v7(),
                    &s,
                    &json!({"x": x}),
                    &CancellationToken::new(),
                )
                .await
                .unwrap();
            let StepExecution::Branches { branches } = result else {
                panic!("expected Branches");
            };
            assert_eq!(branches.len(), 1);
            assert_eq!(branches[0].key, expected, "x = {x}");
        }
    }

    #[tokio::test]
    async fn for_each_binds_loop_variable_per_element() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "fan",
            StepType::ForEach,
            StepConfig::ForEach {
                items: "$.hosts".to_string(),
                item_var: "host".to_string(),
                steps: vec![],
            },
        );
        let result = set
            .execute(
                Uuid::now_v7(),
                &s,
                &json!({"hosts": ["a", "b"]}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let StepExecution::Branches { branches } = result else {
            panic!("expected Branches");
        };
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].variables["host"], json!("a"));
        assert_eq!(branches[0].variables["host_index"], json!(0));
        assert_eq!(branches[1].variables["host"], json!("b"));
    }

    #[tokio::test]
    async fn for_each_non_array_fails() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "fan",
            StepType::ForEach,
            StepConfig::ForEach {
                items: "$.hosts".to_string(),
                item_var: "host".to_string(),
                steps: vec![],
            },
        );
        let result = set
            .execute(
                Uuid::now_v7(),
                &s,
                &json!({"hosts": "oops"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result, StepExecution::Failed { .. }));
    }

    // -- Waits ------------------------------------------------------------

    #[tokio::test]
    async fn delay_returns_future_wake_deadline() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "pause",
            StepType::Delay,
            StepConfig::Delay { duration_secs: 60 },
        );
        let before = Utc::now();
        let result = set
            .execute(Uuid::now_v7(), &s, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        let StepExecution::Waiting {
            kind: WaitKind::Timer { wake_at },
        } = result
        else {
            panic!("expected Timer wait");
        };
        assert!(wake_at >= before + chrono::Duration::seconds(59));
    }

    #[tokio::test]
    async fn wait_for_event_and_approval_suspend() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let wait = step(
            "wait",
            StepType::WaitForEvent,
            StepConfig::WaitForEvent {
                event: "release-ready".to_string(),
            },
        );
        let result = set
            .execute(Uuid::now_v7(), &wait, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            result,
            StepExecution::Waiting { kind: WaitKind::Event { ref name } } if name == "release-ready"
        ));

        let gate = step(
            "gate",
            StepType::Approval,
            StepConfig::Approval {
                prompt: "ok?".to_string(),
                approvers: vec![],
            },
        );
        let result = set
            .execute(Uuid::now_v7(), &gate, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            result,
            StepExecution::Waiting {
                kind: WaitKind::Approval
            }
        ));
    }

    // -- Transform / Notify ----------------------------------------------

    #[tokio::test]
    async fn transform_evaluates_against_scope() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::ok()),
        );
        let s = step(
            "double",
            StepType::Transform,
            StepConfig::Transform {
                expression: "$.n * 2".to_string(),
            },
        );
        let result = set
            .execute(
                Uuid::now_v7(),
                &s,
                &json!({"n": 21}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        let StepExecution::Completed { output } = result else {
            panic!("expected Completed");
        };
        assert_eq!(output, Some(json!(42)));
    }

    #[tokio::test]
    async fn notify_interpolates_and_delivers() {
        let notifier = Arc::new(FakeNotifier::ok());
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            notifier.clone(),
        );
        let s = step(
            "ping",
            StepType::Notify,
            StepConfig::Notify {
                target: "https://hooks.example.com".to_string(),
                message: "release ${$.tag} done".to_string(),
            },
        );
        let result = set
            .execute(
                Uuid::now_v7(),
                &s,
                &json!({"tag": "v7"}),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(result, StepExecution::Completed { .. }));
        let deliveries = notifier.deliveries.lock().unwrap();
        assert_eq!(deliveries[0].1, "release v7 done");
    }

    #[tokio::test]
    async fn notify_delivery_failure_is_retriable_failure() {
        let set = executors(
            Arc::new(FakeJobStore::default()),
            Arc::new(FakeDispatcher::accepting()),
            Arc::new(FakeNotifier::failing()),
        );
        let s = step(
            "ping",
            StepType::Notify,
            StepConfig::Notify {
                target: "https://hooks.example.com".to_string(),
                message: "hi".to_string(),
            },
        );
        let result = set
            .execute(Uuid::now_v7(), &s, &json!({}), &CancellationToken::new())
            .await
            .unwrap();
        let StepExecution::Failed { error } = result else {
            panic!("expected Failed");
        };
        assert!(error.contains("notification failed"));
    }
}
