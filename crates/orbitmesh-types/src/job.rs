//! Job records: the unit of work dispatched to a remote agent.
//!
//! Jobs are created by the engine (persisted before dispatch), assigned by
//! the session layer, and folded back into the owning instance when a
//! terminal result arrives. The fold is idempotent keyed by job id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::agent::AgentRecord;

/// Default job timeout when the step does not override it (1 hour).
pub const DEFAULT_JOB_TIMEOUT_SECS: u64 = 3_600;

// ---------------------------------------------------------------------------
// Job
// ---------------------------------------------------------------------------

/// Status of a dispatched job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Assigned,
    Running,
    Succeeded,
    Failed,
    TimedOut,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::TimedOut | JobStatus::Cancelled
        )
    }
}

/// A unit of remote work owned by the engine until terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUIDv7 job ID; also the idempotency key for result folding.
    pub id: Uuid,
    /// Owning workflow instance and step.
    pub instance_id: Uuid,
    pub step_id: String,
    pub selector: AgentSelector,
    pub payload: Value,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Agent currently holding the assignment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<Uuid>,
    pub timeout_secs: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        instance_id: Uuid,
        step_id: &str,
        selector: AgentSelector,
        payload: Value,
        timeout_secs: Option<u64>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            instance_id,
            step_id: step_id.to_string(),
            selector,
            payload,
            status: JobStatus::Queued,
            result: None,
            error: None,
            assigned_agent: None,
            timeout_secs: timeout_secs.unwrap_or(DEFAULT_JOB_TIMEOUT_SECS),
            created_at: Utc::now(),
            assigned_at: None,
            ended_at: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Terminal outcome
// ---------------------------------------------------------------------------

/// Terminal result of a job, as reported by the session layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOutcome {
    Succeeded {
        #[serde(default)]
        output: Value,
    },
    Failed {
        error: String,
    },
    TimedOut,
    Cancelled,
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Succeeded { .. } => JobStatus::Succeeded,
            JobOutcome::Failed { .. } => JobStatus::Failed,
            JobOutcome::TimedOut => JobStatus::TimedOut,
            JobOutcome::Cancelled => JobStatus::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Agent selector
// ---------------------------------------------------------------------------

/// Capability + tag predicate used to pick a candidate agent for a job.
///
/// An empty selector matches every agent. When `agent_id` is set the job is
/// directly targeted and no fallback candidate is considered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSelector {
    /// Every listed capability must be present on the agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Every listed tag must be present on the agent.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<Uuid>,
}

impl AgentSelector {
    pub fn is_direct(&self) -> bool {
        self.agent_id.is_some()
    }

    /// Whether the agent satisfies this selector (ignores session state;
    /// liveness is the dispatcher's concern).
    pub fn matches(&self, agent: &AgentRecord) -> bool {
        if let Some(id) = self.agent_id {
            return agent.id == id;
        }
        self.capabilities
            .iter()
            .all(|c| agent.capabilities.iter().any(|have| have == c))
            && self.tags.iter().all(|t| agent.tags.iter().any(|have| have == t))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{AgentRecord, SessionState};
    use serde_json::json;

    fn agent(caps: &[&str], tags: &[&str]) -> AgentRecord {
        AgentRecord {
            id: Uuid::now_v7(),
            name: "worker".to_string(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            capabilities: caps.iter().map(|s| s.to_string()).collect(),
            last_seen: Utc::now(),
            session_state: SessionState::Online,
            credential_fingerprint: None,
            load: 0.0,
        }
    }

    #[test]
    fn new_job_is_queued_with_default_timeout() {
        let job = Job::new(
            Uuid::now_v7(),
            "build",
            AgentSelector::default(),
            json!({"cmd": "make"}),
            None,
        );
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.timeout_secs, DEFAULT_JOB_TIMEOUT_SECS);
        assert!(job.assigned_agent.is_none());
    }

    #[test]
    fn job_status_terminality() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::TimedOut.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn outcome_maps_to_status() {
        assert_eq!(
            JobOutcome::Succeeded { output: json!(1) }.status(),
            JobStatus::Succeeded
        );
        assert_eq!(
            JobOutcome::Failed {
                error: "boom".to_string()
            }
            .status(),
            JobStatus::Failed
        );
        assert_eq!(JobOutcome::TimedOut.status(), JobStatus::TimedOut);
    }

    #[test]
    fn empty_selector_matches_anything() {
        let sel = AgentSelector::default();
        assert!(sel.matches(&agent(&[], &[])));
        assert!(sel.matches(&agent(&["shell"], &["east"])));
    }

    #[test]
    fn selector_requires_all_capabilities_and_tags() {
        let sel = AgentSelector {
            capabilities: vec!["shell".to_string(), "docker".to_string()],
            tags: vec!["east".to_string()],
            agent_id: None,
        };
        assert!(sel.matches(&agent(&["shell", "docker"], &["east", "prod"])));
        assert!(!sel.matches(&agent(&["shell"], &["east"])));
        assert!(!sel.matches(&agent(&["shell", "docker"], &["west"])));
    }

    #[test]
    fn direct_selector_matches_only_that_agent() {
        let target = agent(&[], &[]);
        let other = agent(&[], &[]);
        let sel = AgentSelector {
            capabilities: vec![],
            tags: vec![],
            agent_id: Some(target.id),
        };
        assert!(sel.is_direct());
        assert!(sel.matches(&target));
        assert!(!sel.matches(&other));
    }

    #[test]
    fn outcome_serde_roundtrip() {
        let outcome = JobOutcome::Failed {
            error: "agent lost".to_string(),
        };
        let json_str = serde_json::to_string(&outcome).unwrap();
        assert!(json_str.contains("\"kind\":\"failed\""));
        let parsed: JobOutcome = serde_json::from_str(&json_str).unwrap();
        assert_eq!(parsed, outcome);
    }
}
