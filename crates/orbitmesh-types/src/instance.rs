//! Runtime execution records: workflow instances, step instances, branches.
//!
//! Instances are created by the engine on `start` and mutated only by the
//! engine (single-writer per instance). The variable bag is insertion-ordered
//! so expression scopes and serialized snapshots are deterministic.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Status enums
// ---------------------------------------------------------------------------

/// Overall status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    WaitingForEvent,
    WaitingForApproval,
    Completed,
    Failed,
    Compensating,
    Compensated,
    Cancelled,
}

impl InstanceStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Compensated
                | InstanceStatus::Cancelled
        )
    }
}

/// Status of an individual step instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
    Skipped,
    WaitingForEvent,
    WaitingForApproval,
    Compensating,
    Compensated,
}

impl StepStatus {
    /// Settled means downstream dependencies may proceed.
    pub fn is_settled(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Skipped)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StepStatus::Completed
                | StepStatus::Failed
                | StepStatus::Skipped
                | StepStatus::Compensated
        )
    }
}

// ---------------------------------------------------------------------------
// Instance records
// ---------------------------------------------------------------------------

/// A live execution of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// UUIDv7 instance ID.
    pub id: Uuid,
    /// Definition identity this instance executes.
    pub workflow_id: String,
    pub workflow_version: u32,
    pub status: InstanceStatus,
    /// Ordered name -> JSON value bag visible to expressions.
    #[serde(default)]
    pub variables: IndexMap<String, Value>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Set when this instance was started by a SubWorkflow step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_instance_id: Option<Uuid>,
    /// On failure, the step that caused it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_step_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Per-step runtime state, one entry per top-level definition step.
    pub steps: Vec<StepInstance>,
    /// Monotonic commit counter; the next value assigned to a completing
    /// step's `completion_seq`.
    #[serde(default)]
    pub next_completion_seq: u64,
}

impl WorkflowInstance {
    /// Create a fresh instance with one Pending step entry per step id.
    pub fn new(
        workflow_id: &str,
        workflow_version: u32,
        step_ids: impl IntoIterator<Item = String>,
        input: IndexMap<String, Value>,
        parent_instance_id: Option<Uuid>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            workflow_id: workflow_id.to_string(),
            workflow_version,
            status: InstanceStatus::Pending,
            variables: input,
            started_at: Utc::now(),
            ended_at: None,
            parent_instance_id,
            failed_step_id: None,
            error: None,
            steps: step_ids.into_iter().map(|id| StepInstance::new(&id)).collect(),
            next_completion_seq: 0,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&StepInstance> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut StepInstance> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    /// Allocate the next completion sequence number.
    pub fn take_completion_seq(&mut self) -> u64 {
        let seq = self.next_completion_seq;
        self.next_completion_seq += 1;
        seq
    }
}

/// Runtime state of a single step within an instance (or branch).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepInstance {
    /// Matches `WorkflowStep.id`.
    pub step_id: String,
    pub status: StepStatus,
    /// 1-based once execution starts; 0 means never attempted.
    #[serde(default)]
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Set for Job steps while the dispatched job is outstanding.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<Uuid>,
    /// Set for SubWorkflow steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_workflow_instance_id: Option<Uuid>,
    /// Nested mini-plans for Parallel / Conditional / ForEach steps.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub branches: Vec<BranchInstance>,
    /// For Delay steps: the absolute wake deadline, persisted so crash
    /// recovery can re-arm the remaining duration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wake_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Commit order among Completed steps; drives compensation order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_seq: Option<u64>,
}

impl StepInstance {
    pub fn new(step_id: &str) -> Self {
        Self {
            step_id: step_id.to_string(),
            status: StepStatus::Pending,
            attempt: 0,
            last_error: None,
            output: None,
            job_id: None,
            sub_workflow_instance_id: None,
            branches: Vec::new(),
            wake_at: None,
            scheduled_at: None,
            started_at: None,
            ended_at: None,
            completion_seq: None,
        }
    }
}

/// A nested mini-plan under a Parallel / Conditional / ForEach step.
///
/// `key` is the branch name (Parallel), the selected arm ("then"/"else"), or
/// the element index (ForEach).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchInstance {
    pub key: String,
    pub steps: Vec<StepInstance>,
    /// Branch-local bindings layered over the instance bag when branch steps
    /// evaluate expressions: the ForEach loop variable plus outputs of branch
    /// steps. Persisted so branch scopes survive a crash.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub variables: IndexMap<String, Value>,
}

// ---------------------------------------------------------------------------
// Signalled events
// ---------------------------------------------------------------------------

/// An external event delivered to a waiting instance via `SignalEvent`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub instance_id: Uuid,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub received_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_instance_has_pending_steps() {
        let inst = WorkflowInstance::new(
            "wf",
            1,
            vec!["a".to_string(), "b".to_string()],
            IndexMap::new(),
            None,
        );
        assert_eq!(inst.status, InstanceStatus::Pending);
        assert_eq!(inst.steps.len(), 2);
        assert!(inst.steps.iter().all(|s| s.status == StepStatus::Pending));
        assert!(inst.ended_at.is_none());
    }

    #[test]
    fn completion_seq_is_monotonic() {
        let mut inst = WorkflowInstance::new("wf", 1, vec!["a".to_string()], IndexMap::new(), None);
        assert_eq!(inst.take_completion_seq(), 0);
        assert_eq!(inst.take_completion_seq(), 1);
        assert_eq!(inst.take_completion_seq(), 2);
    }

    #[test]
    fn terminal_statuses() {
        assert!(InstanceStatus::Completed.is_terminal());
        assert!(InstanceStatus::Compensated.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
        assert!(!InstanceStatus::Compensating.is_terminal());
        assert!(!InstanceStatus::WaitingForApproval.is_terminal());

        assert!(StepStatus::Skipped.is_settled());
        assert!(StepStatus::Completed.is_settled());
        assert!(!StepStatus::Failed.is_settled());
        assert!(StepStatus::Failed.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
    }

    #[test]
    fn variable_bag_preserves_insertion_order() {
        let mut inst = WorkflowInstance::new("wf", 1, vec![], IndexMap::new(), None);
        inst.variables.insert("zeta".to_string(), json!(1));
        inst.variables.insert("alpha".to_string(), json!(2));
        inst.variables.insert("mid".to_string(), json!(3));

        let keys: Vec<&str> = inst.variables.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);

        // Order survives a serde roundtrip.
        let round: WorkflowInstance =
            serde_json::from_str(&serde_json::to_string(&inst).unwrap()).unwrap();
        let keys: Vec<&str> = round.variables.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn instance_json_roundtrip_with_branches() {
        let mut inst =
            WorkflowInstance::new("wf", 2, vec!["fan".to_string()], IndexMap::new(), None);
        let step = inst.step_mut("fan").unwrap();
        step.status = StepStatus::Running;
        step.branches = vec![BranchInstance {
            key: "0".to_string(),
            steps: vec![StepInstance::new("body")],
            variables: IndexMap::new(),
        }];

        let round: WorkflowInstance =
            serde_json::from_str(&serde_json::to_string(&inst).unwrap()).unwrap();
        let fan = round.step("fan").unwrap();
        assert_eq!(fan.branches.len(), 1);
        assert_eq!(fan.branches[0].key, "0");
        assert_eq!(fan.branches[0].steps[0].step_id, "body");
    }

    #[test]
    fn step_lookup_by_id() {
        let inst = WorkflowInstance::new(
            "wf",
            1,
            vec!["a".to_string(), "b".to_string()],
            IndexMap::new(),
            None,
        );
        assert!(inst.step("b").is_some());
        assert!(inst.step("missing").is_none());
    }
}
