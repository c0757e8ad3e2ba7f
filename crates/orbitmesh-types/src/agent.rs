//! Registered agent records and session state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection lifecycle state of an agent session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Offline,
    Connecting,
    Online,
    /// Still connected but refusing new assignments.
    Draining,
}

impl SessionState {
    /// Whether the dispatcher may hand this agent new jobs.
    pub fn accepts_work(self) -> bool {
        matches!(self, SessionState::Online)
    }
}

/// A remote executor registered with the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub last_seen: DateTime<Utc>,
    pub session_state: SessionState,
    /// SHA-256 fingerprint of the agent's access credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_fingerprint: Option<String>,
    /// Load factor reported with heartbeats; used for inverse-load weighting.
    #[serde(default)]
    pub load: f64,
}

impl AgentRecord {
    pub fn new(name: &str, tags: Vec<String>, capabilities: Vec<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.to_string(),
            tags,
            capabilities,
            last_seen: Utc::now(),
            session_state: SessionState::Connecting,
            credential_fingerprint: None,
            load: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_online_accepts_work() {
        assert!(SessionState::Online.accepts_work());
        assert!(!SessionState::Draining.accepts_work());
        assert!(!SessionState::Offline.accepts_work());
        assert!(!SessionState::Connecting.accepts_work());
    }

    #[test]
    fn new_agent_starts_connecting() {
        let agent = AgentRecord::new("builder-1", vec!["east".to_string()], vec![]);
        assert_eq!(agent.session_state, SessionState::Connecting);
        assert_eq!(agent.load, 0.0);
        assert!(agent.credential_fingerprint.is_none());
    }

    #[test]
    fn record_serde_roundtrip() {
        let agent = AgentRecord::new("a", vec![], vec!["shell".to_string()]);
        let round: AgentRecord =
            serde_json::from_str(&serde_json::to_string(&agent).unwrap()).unwrap();
        assert_eq!(round.id, agent.id);
        assert_eq!(round.capabilities, vec!["shell"]);
    }
}
