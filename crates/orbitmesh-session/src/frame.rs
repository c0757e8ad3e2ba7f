//! Wire frames for the agent protocol.
//!
//! Frames are MessagePack maps (named fields), so unknown fields are ignored
//! on decode and the schema can grow without breaking older peers. Each frame
//! carries a per-direction monotonic sequence number; within one job, frames
//! are FIFO on the session.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::SessionError;

/// Protocol revision spoken by this build.
pub const PROTOCOL_VERSION: u32 = 1;

/// Envelope: sequence number plus the typed body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub seq: u64,
    pub body: FrameBody,
}

/// The thirteen frame kinds of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameBody {
    /// First frame on a connection, agent -> server.
    Hello {
        /// Present after enrollment; None on first bootstrap connect.
        agent_id: Option<Uuid>,
        name: String,
        #[serde(default)]
        tags: Vec<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default)]
        bootstrap_token: Option<String>,
        protocol_version: u32,
    },
    /// Handshake acceptance, server -> agent.
    HelloAck {
        agent_id: Uuid,
        heartbeat_interval_secs: u64,
        /// Durable credential minted for a bootstrap connect.
        #[serde(default)]
        issued_credential: Option<String>,
    },
    Heartbeat {
        /// Load factor the dispatcher weighs against.
        load: f64,
    },
    /// Reconnect reconciliation: every job id the agent remembers holding.
    Resume { job_ids: Vec<Uuid> },
    JobAssigned {
        job_id: Uuid,
        instance_id: Uuid,
        step_id: String,
        payload: Value,
        timeout_secs: u64,
    },
    JobAck { job_id: Uuid },
    JobProgress {
        job_id: Uuid,
        progress: f64,
        #[serde(default)]
        message: Option<String>,
    },
    JobSucceeded { job_id: Uuid, output: Value },
    JobFailed { job_id: Uuid, error: String },
    JobTimedOut { job_id: Uuid },
    JobCancelled { job_id: Uuid },
    CancelJob { job_id: Uuid },
    Goodbye { reason: String },
}

impl Frame {
    /// Encode as a MessagePack map (named fields, forward compatible).
    pub fn encode(&self) -> Result<Vec<u8>, SessionError> {
        rmp_serde::to_vec_named(self).map_err(|e| SessionError::Encoding(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SessionError> {
        rmp_serde::from_slice(bytes).map_err(|e| SessionError::Encoding(e.to_string()))
    }
}

impl FrameBody {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            FrameBody::Hello { .. } => "hello",
            FrameBody::HelloAck { .. } => "hello_ack",
            FrameBody::Heartbeat { .. } => "heartbeat",
            FrameBody::Resume { .. } => "resume",
            FrameBody::JobAssigned { .. } => "job_assigned",
            FrameBody::JobAck { .. } => "job_ack",
            FrameBody::JobProgress { .. } => "job_progress",
            FrameBody::JobSucceeded { .. } => "job_succeeded",
            FrameBody::JobFailed { .. } => "job_failed",
            FrameBody::JobTimedOut { .. } => "job_timed_out",
            FrameBody::JobCancelled { .. } => "job_cancelled",
            FrameBody::CancelJob { .. } => "cancel_job",
            FrameBody::Goodbye { .. } => "goodbye",
        }
    }

    /// Terminal job frames, in the at-least-once delivery set.
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            FrameBody::JobSucceeded { .. }
                | FrameBody::JobFailed { .. }
                | FrameBody::JobTimedOut { .. }
                | FrameBody::JobCancelled { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
