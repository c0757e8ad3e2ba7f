//! Configuration records for the server, agents, and the store.
//!
//! Every recognized option carries a serde default so a partial (or missing)
//! `orbitmesh.toml` still yields a usable configuration.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Server-side configuration: engine pool sizing, session layer limits, and
/// the store connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP address the session listener binds to.
    pub listen_addr: String,
    /// Bounded worker pool for step execution.
    pub worker_pool_size: usize,
    /// Per-agent outbound frame queue depth.
    pub outbound_queue_depth: usize,
    /// Heartbeat cadence expected from agents, seconds.
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before an agent is marked offline.
    pub heartbeat_miss_limit: u32,
    /// Deadline for a single notifier delivery, seconds.
    pub notifier_timeout_secs: u64,
    /// Default job timeout when a step does not override it, seconds.
    pub default_job_timeout_secs: u64,
    pub store: StoreConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:7443".to_string(),
            worker_pool_size: 16,
            outbound_queue_depth: 256,
            heartbeat_interval_secs: 15,
            heartbeat_miss_limit: 3,
            notifier_timeout_secs: 10,
            default_job_timeout_secs: 3_600,
            store: StoreConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Agent-side configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Primary server endpoint (host:port).
    pub server_url: String,
    /// Display name registered with the server.
    pub agent_name: String,
    /// Long-lived credential. Exactly one of `access_token` /
    /// `bootstrap_token` should be set.
    pub access_token: Option<String>,
    /// One-time enrollment token, exchanged for a durable credential on
    /// first connect.
    pub bootstrap_token: Option<String>,
    pub tags: Vec<String>,
    pub capabilities: Vec<String>,
    /// Gate for shell-command job handlers (off by default).
    pub enable_shell_execution: bool,
    /// Optional endpoint rotation for hot-standby servers.
    pub high_availability: Option<HighAvailabilityConfig>,
    /// Seconds before an in-flight connect attempt is abandoned.
    pub connection_timeout_secs: u64,
    /// Seconds between heartbeats.
    pub heartbeat_interval_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_url: "127.0.0.1:7443".to_string(),
            agent_name: "agent".to_string(),
            access_token: None,
            bootstrap_token: None,
            tags: Vec::new(),
            capabilities: Vec::new(),
            enable_shell_execution: false,
            high_availability: None,
            connection_timeout_secs: 30,
            heartbeat_interval_secs: 15,
        }
    }
}

/// Endpoint rotation with exponential backoff and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HighAvailabilityConfig {
    /// Endpoints tried in rotation; the primary `server_url` is implicit
    /// first.
    pub endpoints: Vec<String>,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    /// Fractional jitter applied to each backoff delay (0.2 = +-20%).
    pub jitter_ratio: f64,
}

impl Default for HighAvailabilityConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            backoff_base_secs: 1,
            backoff_cap_secs: 60,
            jitter_ratio: 0.2,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Store backend options. The core engine only sees the store contract; these
/// options are passed through to whichever backend the composition root
/// constructs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Backend connection string. The in-memory backend ignores it.
    pub connection_string: String,
    pub enable_wal_mode: bool,
    pub auto_migrate: bool,
    /// Milliseconds a backend waits on a locked row before failing.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            connection_string: "orbitmesh.db".to_string(),
            enable_wal_mode: true,
            auto_migrate: true,
            busy_timeout_ms: 5_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
