//! Job dispatch port: how the engine hands work to the session layer.
//!
//! The engine persists the job first, then calls `dispatch`. Terminal results
//! come back through the engine's [`JobResultSink`](crate::engine::JobResultSink),
//! not through this trait, so the two layers stay decoupled.

use thiserror::Error;
use uuid::Uuid;

use orbitmesh_types::job::Job;

/// Errors surfaced by a dispatch attempt. All of them count as a failed step
/// attempt and feed the retry policy.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No online agent matches the job's selector.
    #[error("no agent available for job {job_id}")]
    AgentUnavailable { job_id: Uuid },

    /// The directly-targeted agent's outbound queue is full.
    #[error("agent busy for job {job_id}")]
    AgentBusy { job_id: Uuid },

    /// The session layer is shutting down.
    #[error("dispatcher closed")]
    Closed,

    #[error("dispatch failed: {0}")]
    Internal(String),
}

/// Port implemented by the session layer (and by scripted fakes in tests).
pub trait JobDispatcher: Send + Sync {
    /// Assign the job to an agent and send the `JobAssigned` frame. Returns
    /// once the job is queued to a session; completion is reported
    /// asynchronously.
    fn dispatch(&self, job: &Job) -> impl Future<Output = Result<(), DispatchError>> + Send;

    /// Best-effort cancel: forwards `CancelJob` to the assigned agent. An
    /// already-terminal job stays terminal.
    fn cancel(&self, job_id: Uuid) -> impl Future<Output = ()> + Send;
}
