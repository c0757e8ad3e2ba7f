//! Agent session layer for OrbitMesh.
//!
//! A persistent bidirectional control plane between the server and each
//! agent: length-prefixed MessagePack frames over TCP, one reader and one
//! writer task per connected agent, heartbeat liveness, selector-based job
//! dispatch with bounded per-agent queues, and resume reconciliation after
//! disconnects.
//!
//! - `frame` -- the typed frame enum and its binary encoding
//! - `codec` -- length-delimited framing codec
//! - `auth` -- access-token and one-time bootstrap-token authentication
//! - `server` -- listener, per-session task pair, heartbeat watchdog
//! - `dispatch` -- the engine's `JobDispatcher` port, implemented on sessions
//! - `client` -- agent-side client with HA endpoint rotation and backoff

pub mod auth;
pub mod client;
pub mod codec;
pub mod dispatch;
pub mod frame;
pub mod server;

use thiserror::Error;

/// Errors across the session layer.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed")]
    AuthFailed,

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("frame encoding error: {0}")]
    Encoding(String),

    #[error("connection timed out")]
    Timeout,

    #[error("session closed")]
    Closed,

    #[error("store error: {0}")]
    Store(#[from] orbitmesh_types::error::StoreError),
}
