//! OrbitMesh server: the composition root.
//!
//! Construction and start order: store -> engine (with rehydration) ->
//! session listener. Shutdown runs in reverse with a short drain. Exit
//! codes: 0 normal, 1 fatal startup error, 7 when a staged update asks the
//! supervisor to restart us.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use orbitmesh_core::engine::{EngineConfig, WorkflowEngine};
use orbitmesh_infra::memory::MemoryStore;
use orbitmesh_infra::webhook::WebhookNotifier;
use orbitmesh_session::auth::TokenAuthenticator;
use orbitmesh_session::dispatch::SessionDispatcher;
use orbitmesh_session::server::{SessionManager, SessionServer, SessionServerConfig};
use orbitmesh_types::config::ServerConfig;

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
/// A staged self-update wants the supervisor to swap binaries and restart.
const EXIT_UPDATE_PENDING: i32 = 7;

#[derive(Parser, Debug)]
#[command(name = "orbitmesh-server", version, about = "OrbitMesh workload orchestration server")]
struct Cli {
    /// Configuration file path.
    #[arg(long, default_value = "orbitmesh.toml")]
    config: PathBuf,

    /// Override the session listener address from the config file.
    #[arg(long)]
    listen: Option<String>,
}

fn main() {
    let filter = EnvFilter::try_from_env("ORBITMESH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("fatal: failed to start runtime: {err}");
            std::process::exit(EXIT_FATAL);
        }
    };
    let code = match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = ?err, "fatal startup error");
            eprintln!("fatal: {err:#}");
            EXIT_FATAL
        }
    };
    std::process::exit(code);
}

/// Load `ServerConfig` from a TOML file, falling back to defaults when the
/// file is missing and warning when it is malformed.
fn load_config(path: &Path) -> ServerConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => config,
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "config file malformed; using defaults"
                );
                ServerConfig::default()
            }
        },
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            ServerConfig::default()
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "config file unreadable; using defaults"
            );
            ServerConfig::default()
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    // The updater stages a marker next to the config; honoring it here lets
    // the supervisor swap binaries before we take any traffic.
    let update_marker = cli
        .config
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join("update.pending");
    if update_marker.exists() {
        tracing::info!(marker = %update_marker.display(), "update pending; asking for restart");
        return Ok(EXIT_UPDATE_PENDING);
    }

    let mut config = load_config(&cli.config);
    if let Some(listen) = cli.listen {
        config.listen_addr = listen;
    }

    // Store first.
    let store = Arc::new(MemoryStore::new());

    // Engine over the store, dispatching through the session layer.
    let sessions = Arc::new(SessionManager::default());
    let dispatcher = Arc::new(SessionDispatcher::new(Arc::clone(&store), Arc::clone(&sessions)));
    let notifier = Arc::new(
        WebhookNotifier::new(Duration::from_secs(config.notifier_timeout_secs))
            .map_err(|e| anyhow::anyhow!("notifier construction failed: {e}"))?,
    );
    let engine = WorkflowEngine::new(
        Arc::clone(&store),
        dispatcher,
        notifier,
        EngineConfig {
            worker_pool_size: config.worker_pool_size,
            notifier_timeout: Duration::from_secs(config.notifier_timeout_secs),
            default_job_timeout_secs: config.default_job_timeout_secs,
        },
    );
    let resumed = engine
        .rehydrate()
        .await
        .context("rehydrating persisted instances")?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed non-terminal instances");
    }

    // Session layer last, once the engine can fold results.
    let auth = Arc::new(TokenAuthenticator::new());
    for token in std::env::var("ORBITMESH_BOOTSTRAP_TOKENS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        auth.add_bootstrap_token(token);
        tracing::info!("registered bootstrap token");
    }

    let session_server = Arc::new(SessionServer::new(
        Arc::clone(&store),
        auth,
        engine.result_sink(),
        sessions,
        SessionServerConfig {
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            heartbeat_miss_limit: config.heartbeat_miss_limit,
            outbound_queue_depth: config.outbound_queue_depth,
            ..SessionServerConfig::default()
        },
    ));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("binding session listener on {}", config.listen_addr))?;
    let serve_task = tokio::spawn(Arc::clone(&session_server).serve(listener));

    tracing::info!(
        listen = config.listen_addr.as_str(),
        workers = config.worker_pool_size,
        "orbitmesh server up"
    );

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("shutdown requested; draining");

    // Reverse order: stop accepting sessions, then the engine, then drop the
    // store with everything persisted.
    session_server.shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), serve_task).await;
    engine.shutdown();
    tokio::time::sleep(Duration::from_millis(200)).await;

    tracing::info!("shutdown complete");
    Ok(EXIT_OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let config = load_config(Path::new("/nonexistent/orbitmesh.toml"));
        assert_eq!(config.worker_pool_size, 16);
        assert_eq!(config.listen_addr, "0.0.0.0:7443");
    }

    #[test]
    fn malformed_config_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orbitmesh.toml");
        std::fs::write(&path, "not { valid !!").unwrap();
        let config = load_config(&path);
        assert_eq!(config.worker_pool_size, 16);
    }

    #[test]
    fn valid_config_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orbitmesh.toml");
        std::fs::write(
            &path,
            r#"
listen_addr = "127.0.0.1:9001"
worker_pool_size = 4
"#,
        )
        .unwrap();
        let config = load_config(&path);
        assert_eq!(config.listen_addr, "127.0.0.1:9001");
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.outbound_queue_depth, 256);
    }

    #[test]
    fn exit_codes_are_distinct()  {
        assert_ne!(EXIT_OK, EXIT_FATAL);
        assert_ne!(EXIT_FATAL, EXIT_UPDATE_PENDING);
    }
}
