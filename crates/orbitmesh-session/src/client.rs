//! Agent-side session client.
//!
//! Connects to the server (rotating across HA endpoints with exponential
//! backoff and jitter), authenticates, resumes any jobs it still remembers,
//! then runs the session loop: execute assignments through the `JobHandler`,
//! stream terminal results back, heartbeat on the configured cadence.
//! Handler tasks survive disconnects; their results are delivered after the
//! next successful resume.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_types::config::{AgentConfig, HighAvailabilityConfig};

use crate::SessionError;
use crate::codec::FrameCodec;
use crate::frame::{Frame, FrameBody, PROTOCOL_VERSION};

/// Remembered terminal job ids, bounded so a long-lived agent does not grow
/// without limit.
const TERMINATED_MEMORY: usize = 4096;

// ---------------------------------------------------------------------------
// Job handler
// ---------------------------------------------------------------------------

/// A job as handed to the handler.
#[derive(Debug, Clone)]
pub struct AssignedJob {
    pub job_id: Uuid,
    pub instance_id: Uuid,
    pub step_id: String,
    pub payload: Value,
    pub timeout_secs: u64,
}

/// Agent-side job execution. Implementations must watch the cancellation
/// token; a cancelled job should return promptly.
pub trait JobHandler: Send + Sync + 'static {
    fn execute(
        &self,
        job: AssignedJob,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, String>> + Send;
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Exponential backoff with jitter for reconnect attempts.
struct Backoff {
    base: Duration,
    cap: Duration,
    jitter_ratio: f64,
    current: Duration,
}

impl Backoff {
    fn new(base_secs: u64, cap_secs: u64, jitter_ratio: f64) -> Self {
        let base = Duration::from_secs(base_secs.max(1));
        Self {
            base,
            cap: Duration::from_secs(cap_secs.max(1)),
            jitter_ratio: jitter_ratio.clamp(0.0, 0.9),
            current: base,
        }
    }

    fn reset(&mut self) {
        self.current = self.base;
    }

    /// Next delay, doubling up to the cap, with +-jitter applied.
    fn next_delay(&mut self) -> Duration {
        let raw = self.current;
        self.current = (self.current * 2).min(self.cap);
        let jitter = rand::thread_rng()
            .gen_range(1.0 - self.jitter_ratio..=1.0 + self.jitter_ratio);
        raw.mul_f64(jitter)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// What the client remembers across reconnects.
struct Identity {
    agent_id: Option<Uuid>,
    credential: Option<String>,
    bootstrap: Option<String>,
}

pub struct AgentClient<H> {
    config: AgentConfig,
    handler: Arc<H>,
}

impl<H: JobHandler> AgentClient<H> {
    pub fn new(config: AgentConfig, handler: Arc<H>) -> Self {
        Self { config, handler }
    }

    /// Run until shutdown. Returns an error only for terminal conditions
    /// (authentication failure); transient failures reconnect with backoff.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SessionError> {
        let ha = self
            .config
            .high_availability
            .clone()
            .unwrap_or_else(HighAvailabilityConfig::default);
        let mut endpoints = vec![self.config.server_url.clone()];
        endpoints.extend(ha.endpoints.iter().cloned());
        let mut backoff = Backoff::new(ha.backoff_base_secs, ha.backoff_cap_secs, ha.jitter_ratio);
        let connect_timeout = Duration::from_secs(self.config.connection_timeout_secs);

        let mut identity = Identity {
            agent_id: None,
            credential: self.config.access_token.clone(),
            bootstrap: self.config.bootstrap_token.clone(),
        };

        // Shared across reconnects: running jobs, finished-job memory, and
        // terminal frames not yet handed to a socket.
        let mut active: HashMap<Uuid, CancellationToken> = HashMap::new();
        let mut terminated: VecDeque<Uuid> = VecDeque::new();
        let mut terminated_set: HashSet<Uuid> = HashSet::new();
        let mut pending_terminals: VecDeque<FrameBody> = VecDeque::new();
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<(Uuid, Result<Value, String>)>();

        let mut endpoint_idx = 0usize;
        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let endpoint = endpoints[endpoint_idx % endpoints.len()].clone();
            endpoint_idx += 1;

            let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(&endpoint))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(err)) => {
                    tracing::warn!(endpoint = endpoint.as_str(), error = %err, "connect failed");
                    sleep_backoff(&mut backoff, &shutdown).await;
                    continue;
                }
                Err(_) => {
                    tracing::warn!(endpoint = endpoint.as_str(), "connect timed out");
                    sleep_backoff(&mut backoff, &shutdown).await;
                    continue;
                }
            };
            let mut framed = Framed::new(stream, FrameCodec::new());
            let mut seq = 0u64;

            // Handshake.
            let hello = FrameBody::Hello {
                agent_id: identity.agent_id,
                name: self.config.agent_name.clone(),
                tags: self.config.tags.clone(),
                capabilities: self.config.capabilities.clone(),
                access_token: identity.credential.clone(),
                bootstrap_token: if identity.credential.is_none() {
                    identity.bootstrap.clone()
                } else {
                    None
                },
                protocol_version: PROTOCOL_VERSION,
            };
            if send_frame(&mut framed, &mut seq, hello).await.is_err() {
                sleep_backoff(&mut backoff, &shutdown).await;
                continue;
            }

            let ack = tokio::time::timeout(connect_timeout, framed.next()).await;
            let heartbeat_secs = match ack {
                Ok(Some(Ok(Frame {
                    body:
                        FrameBody::HelloAck {
                            agent_id,
                            heartbeat_interval_secs,
                            issued_credential,
                        },
                    ..
                }))) => {
                    identity.agent_id = Some(agent_id);
                    if let Some(credential) = issued_credential {
                        tracing::info!("bootstrap token exchanged for durable credential");
                        identity.credential = Some(credential);
                        identity.bootstrap = None;
                    }
                    heartbeat_interval_secs.max(1)
                }
                Ok(Some(Ok(Frame {
                    body: FrameBody::Goodbye { reason },
                    ..
                }))) => {
                    // Authentication failure is terminal for this session's
                    // credentials; the operator must issue new ones.
                    tracing::error!(reason = reason.as_str(), "server refused handshake");
                    return Err(SessionError::AuthFailed);
                }
                _ => {
                    tracing::warn!(endpoint = endpoint.as_str(), "handshake failed");
                    sleep_backoff(&mut backoff, &shutdown).await;
                    continue;
                }
            };
            backoff.reset();
            tracing::info!(
                endpoint = endpoint.as_str(),
                agent_id = %identity.agent_id.unwrap_or_default(),
                "session established"
            );

            // Resume: everything we remember holding or having finished.
            let remembered: Vec<Uuid> = active
                .keys()
                .copied()
                .chain(terminated_set.iter().copied())
                .collect();
            if send_frame(&mut framed, &mut seq, FrameBody::Resume { job_ids: remembered })
                .await
                .is_err()
            {
                sleep_backoff(&mut backoff, &shutdown).await;
                continue;
            }

            // Terminal frames that never made it onto a socket go first.
            let mut resend_failed = false;
            while let Some(frame) = pending_terminals.pop_front() {
                if send_frame(&mut framed, &mut seq, frame.clone()).await.is_err() {
                    pending_terminals.push_front(frame);
                    resend_failed = true;
                    break;
                }
            }
            if resend_failed {
                sleep_backoff(&mut backoff, &shutdown).await;
                continue;
            }

            // Session loop.
            let mut heartbeat = tokio::time::interval(Duration::from_secs(heartbeat_secs));
            heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            let disconnect = loop {
                tokio::select! {
                    frame = framed.next() => {
                        let frame = match frame {
                            Some(Ok(frame)) => frame,
                            _ => break true,
                        };
                        match frame.body {
                            FrameBody::JobAssigned { job_id, instance_id, step_id, payload, timeout_secs } => {
                                // Idempotency: never re-run a job we already
                                // terminated, or are already running.
                                if terminated_set.contains(&job_id) || active.contains_key(&job_id) {
                                    tracing::debug!(%job_id, "duplicate assignment ignored");
                                    continue;
                                }
                                if send_frame(&mut framed, &mut seq, FrameBody::JobAck { job_id }).await.is_err() {
                                    break true;
                                }
                                let token = CancellationToken::new();
                                active.insert(job_id, token.clone());
                                let handler = Arc::clone(&self.handler);
                                let done = done_tx.clone();
                                let job = AssignedJob { job_id, instance_id, step_id, payload, timeout_secs };
                                tokio::spawn(async move {
                                    let result = handler.execute(job, token).await;
                                    let _ = done.send((job_id, result));
                                });
                            }
                            FrameBody::CancelJob { job_id } => {
                                if let Some(token) = active.get(&job_id) {
                                    token.cancel();
                                } else if !terminated_set.contains(&job_id) {
                                    // Unknown to us: confirm the cancel.
                                    remember_terminated(&mut terminated, &mut terminated_set, job_id);
                                    if send_frame(&mut framed, &mut seq, FrameBody::JobCancelled { job_id }).await.is_err() {
                                        pending_terminals.push_back(FrameBody::JobCancelled { job_id });
                                        break true;
                                    }
                                }
                            }
                            FrameBody::Goodbye { reason } => {
                                tracing::info!(reason = reason.as_str(), "server closed session");
                                break true;
                            }
                            other => {
                                tracing::debug!(kind = other.kind(), "ignoring unexpected frame");
                            }
                        }
                    }
                    Some((job_id, result)) = done_rx.recv() => {
                        let was_cancelled = active
                            .remove(&job_id)
                            .is_some_and(|token| token.is_cancelled());
                        remember_terminated(&mut terminated, &mut terminated_set, job_id);
                        let body = if was_cancelled {
                            FrameBody::JobCancelled { job_id }
                        } else {
                            match result {
                                Ok(output) => FrameBody::JobSucceeded { job_id, output },
                                Err(error) => FrameBody::JobFailed { job_id, error },
                            }
                        };
                        if send_frame(&mut framed, &mut seq, body.clone()).await.is_err() {
                            pending_terminals.push_back(body);
                            break true;
                        }
                    }
                    _ = heartbeat.tick() => {
                        let load = active.len() as f64;
                        if send_frame(&mut framed, &mut seq, FrameBody::Heartbeat { load }).await.is_err() {
                            break true;
                        }
                    }
                    _ = shutdown.cancelled() => {
                        let _ = send_frame(&mut framed, &mut seq, FrameBody::Goodbye {
                            reason: "shutting down".to_string(),
                        }).await;
                        return Ok(());
                    }
                }
            };

            if disconnect {
                tracing::warn!(
                    in_flight = active.len(),
                    "session lost; reconnecting (jobs keep running)"
                );
                sleep_backoff(&mut backoff, &shutdown).await;
            }
        }
    }
}

async fn send_frame(
    framed: &mut Framed<TcpStream, FrameCodec>,
    seq: &mut u64,
    body: FrameBody,
) -> Result<(), std::io::Error> {
    let frame = Frame { seq: *seq, body };
    *seq += 1;
    framed.send(frame).await
}

fn remember_terminated(order: &mut VecDeque<Uuid>, set: &mut HashSet<Uuid>, job_id: Uuid) {
    if set.insert(job_id) {
        order.push_back(job_id);
        while order.len() > TERMINATED_MEMORY {
            if let Some(evicted) = order.pop_front() {
                set.remove(&evicted);
            }
        }
    }
}

async fn sleep_backoff(backoff: &mut Backoff, shutdown: &CancellationToken) {
    let delay = backoff.next_delay();
    tracing::debug!(delay_ms = delay.as_millis() as u64, "backing off");
    tokio::select! {
        _ = tokio::time::sleep(delay) => {}
        _ = shutdown.cancelled() => {}
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_to_cap() {
        // Zero jitter makes delays exact.
        let mut backoff = Backoff::new(1, 60, 0.0);
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.next_delay();
        }
        assert_eq!(backoff.next_delay(), Duration::from_secs(60));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn backoff_jitter_stays_within_band() {
        let mut backoff = Backoff::new(10, 60, 0.2);
        for _ in 0..50 {
            backoff.reset();
            let delay = backoff.next_delay();
            assert!(delay >= Duration::from_secs(8), "got {delay:?}");
            assert!(delay <= Duration::from_secs(12), "got {delay:?}");
        }
    }

    #[test]
    fn terminated_memory_is_bounded() {
        let mut order = VecDeque::new();
        let mut set = HashSet::new();
        let first = Uuid::now_v7();
        remember_terminated(&mut order, &mut set, first);
        for _ in 0..TERMINATED_MEMORY {
            remember_terminated(&mut order, &mut set, Uuid::now_v7());
        }
        assert_eq!(set.len(), TERMINATED_MEMORY);
        assert!(!set.contains(&first), "oldest entry evicted");
    }
}
