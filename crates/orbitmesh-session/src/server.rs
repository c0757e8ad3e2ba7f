//! Server side of the agent session layer.
//!
//! One TCP connection per agent: the handshake authenticates, then the
//! connection splits into a reader loop (this task) and a writer task fed by
//! a bounded outbound queue. A watchdog marks agents offline after missed
//! heartbeats. Terminal job frames are recorded on the job row (first
//! terminal wins) and forwarded to the engine's result sink.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use orbitmesh_core::engine::JobResultSink;
use orbitmesh_core::store::{AgentStore, JobStore};
use orbitmesh_types::agent::{AgentRecord, SessionState};
use orbitmesh_types::job::{Job, JobOutcome, JobStatus};

use crate::SessionError;
use crate::auth::{AuthDecision, TokenAuthenticator, credential_fingerprint};
use crate::codec::FrameCodec;
use crate::frame::{Frame, FrameBody, PROTOCOL_VERSION};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SessionServerConfig {
    /// Heartbeat cadence agents are told to use.
    pub heartbeat_interval_secs: u64,
    /// Missed heartbeats before an agent is marked offline.
    pub heartbeat_miss_limit: u32,
    /// Per-agent outbound queue depth; a full queue is backpressure.
    pub outbound_queue_depth: usize,
    /// Deadline for the Hello/HelloAck exchange.
    pub handshake_timeout: Duration,
}

impl Default for SessionServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            heartbeat_miss_limit: 3,
            outbound_queue_depth: 256,
            handshake_timeout: Duration::from_secs(30),
        }
    }
}

// ---------------------------------------------------------------------------
// Session registry
// ---------------------------------------------------------------------------

/// Why a queued send was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendRefused {
    /// The agent's outbound queue is full (backpressure).
    QueueFull,
    /// No live session for the agent.
    NotConnected,
}

pub(crate) struct AgentSession {
    outbound: mpsc::Sender<FrameBody>,
    cancel: CancellationToken,
    /// Unix millis of the last frame seen from the agent.
    last_seen_ms: AtomicI64,
    /// Distinguishes this connection from a replacement.
    session_nonce: Uuid,
}

/// Registry of live agent sessions; the dispatcher's view of the world.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<Uuid, Arc<AgentSession>>,
}

impl SessionManager {
    pub fn is_connected(&self, agent_id: Uuid) -> bool {
        self.sessions.contains_key(&agent_id)
    }

    pub fn connected_count(&self) -> usize {
        self.sessions.len()
    }

    /// Non-blocking enqueue onto the agent's bounded outbound queue.
    pub fn try_send(&self, agent_id: Uuid, body: FrameBody) -> Result<(), SendRefused> {
        let Some(session) = self.sessions.get(&agent_id) else {
            return Err(SendRefused::NotConnected);
        };
        session.outbound.try_send(body).map_err(|err| match err {
            mpsc::error::TrySendError::Full(_) => SendRefused::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SendRefused::NotConnected,
        })
    }

    fn install(&self, agent_id: Uuid, session: Arc<AgentSession>) {
        if let Some(previous) = self.sessions.insert(agent_id, session) {
            // A reconnect replaces the old session; tear the old one down.
            previous.cancel.cancel();
        }
    }

    fn remove_if_current(&self, agent_id: Uuid, nonce: Uuid) {
        self.sessions
            .remove_if(&agent_id, |_, session| session.session_nonce == nonce);
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub struct SessionServer<S> {
    store: Arc<S>,
    auth: Arc<TokenAuthenticator>,
    sessions: Arc<SessionManager>,
    sink: JobResultSink,
    config: SessionServerConfig,
    shutdown: CancellationToken,
}

impl<S> SessionServer<S>
where
    S: JobStore + AgentStore + 'static,
{
    /// `sessions` is shared with the dispatcher so selection sees exactly
    /// the sessions this server owns.
    pub fn new(
        store: Arc<S>,
        auth: Arc<TokenAuthenticator>,
        sink: JobResultSink,
        sessions: Arc<SessionManager>,
        config: SessionServerConfig,
    ) -> Self {
        Self {
            store,
            auth,
            sessions,
            sink,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn sessions(&self) -> Arc<SessionManager> {
        Arc::clone(&self.sessions)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Accept loop. Runs until shutdown.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), SessionError> {
        let local = listener.local_addr()?;
        tracing::info!(addr = %local, "session listener up");
        tokio::spawn(Self::watchdog(Arc::clone(&self)));

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = self.shutdown.cancelled() => {
                    tracing::info!("session listener shutting down");
                    return Ok(());
                }
            };
            tracing::debug!(%peer, "agent connecting");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(err) = server.handle_connection(stream).await {
                    tracing::debug!(%peer, error = %err, "session ended with error");
                }
            });
        }
    }

    /// Mark agents offline after `heartbeat_miss_limit` missed intervals.
    async fn watchdog(server: Arc<Self>) {
        let interval = Duration::from_secs(server.config.heartbeat_interval_secs);
        let cutoff_ms = (server.config.heartbeat_interval_secs
            * u64::from(server.config.heartbeat_miss_limit)
            * 1000) as i64;
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = server.shutdown.cancelled() => return,
            }
            let now_ms = Utc::now().timestamp_millis();
            let stale: Vec<Uuid> = server
                .sessions
                .sessions
                .iter()
                .filter(|entry| {
                    now_ms - entry.value().last_seen_ms.load(Ordering::Relaxed) > cutoff_ms
                })
                .map(|entry| *entry.key())
                .collect();
            for agent_id in stale {
                tracing::warn!(%agent_id, "agent missed heartbeats; marking offline");
                // Re-check staleness under the removal so a session that
                // reconnected since the snapshot survives.
                let removed = server.sessions.sessions.remove_if(&agent_id, |_, session| {
                    now_ms - session.last_seen_ms.load(Ordering::Relaxed) > cutoff_ms
                });
                if let Some((_, session)) = removed {
                    session.cancel.cancel();
                    server.set_agent_state(agent_id, SessionState::Offline).await;
                }
            }
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), SessionError> {
        let mut framed = Framed::new(stream, FrameCodec::new());

        // Handshake: exactly one Hello within the deadline.
        let hello = tokio::time::timeout(self.config.handshake_timeout, framed.next())
            .await
            .map_err(|_| SessionError::Timeout)?
            .ok_or(SessionError::Closed)??;

        let first_kind = hello.body.kind();
        let FrameBody::Hello {
            agent_id: claimed_id,
            name,
            tags,
            capabilities,
            access_token,
            bootstrap_token,
            protocol_version,
        } = hello.body
        else {
            let _ = framed.send(goodbye(0, "expected hello")).await;
            return Err(SessionError::Protocol(format!(
                "first frame was {first_kind}"
            )));
        };

        if protocol_version != PROTOCOL_VERSION {
            tracing::debug!(
                their_version = protocol_version,
                "protocol version differs; fields are forward compatible, continuing"
            );
        }

        let decision = self
            .auth
            .authenticate(access_token.as_deref(), bootstrap_token.as_deref());
        let (agent_id, issued_credential) = match decision {
            AuthDecision::Known { agent_id } => (agent_id, None),
            AuthDecision::Enrolled { agent_id, credential } => (agent_id, Some(credential)),
            AuthDecision::Denied => {
                tracing::warn!(name = name.as_str(), "agent authentication failed");
                let _ = framed.send(goodbye(0, "authentication failed")).await;
                return Err(SessionError::AuthFailed);
            }
        };
        if let Some(claimed) = claimed_id {
            if claimed != agent_id {
                tracing::warn!(%claimed, %agent_id, "agent id claim does not match credential");
            }
        }

        self.upsert_agent_record(
            agent_id,
            &name,
            tags,
            capabilities,
            issued_credential.as_deref(),
        )
        .await;

        // Install the session before HelloAck so dispatch can reach the
        // agent the moment it considers itself online.
        let (outbound_tx, mut outbound_rx) =
            mpsc::channel::<FrameBody>(self.config.outbound_queue_depth);
        let cancel = self.shutdown.child_token();
        let session = Arc::new(AgentSession {
            outbound: outbound_tx,
            cancel: cancel.clone(),
            last_seen_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            session_nonce: Uuid::new_v4(),
        });
        let nonce = session.session_nonce;
        self.sessions.install(agent_id, Arc::clone(&session));

        framed
            .send(Frame {
                seq: 0,
                body: FrameBody::HelloAck {
                    agent_id,
                    heartbeat_interval_secs: self.config.heartbeat_interval_secs,
                    issued_credential,
                },
            })
            .await?;
        tracing::info!(%agent_id, name = name.as_str(), "agent online");

        let (mut frame_sink, mut frame_stream) = framed.split();

        // Writer task: drains the bounded queue, stamping sequence numbers.
        let writer_cancel = cancel.clone();
        let writer = tokio::spawn(async move {
            let mut seq = 1u64; // 0 was the HelloAck
            loop {
                let body = tokio::select! {
                    body = outbound_rx.recv() => match body {
                        Some(body) => body,
                        None => break,
                    },
                    _ = writer_cancel.cancelled() => break,
                };
                let frame = Frame { seq, body };
                seq += 1;
                if let Err(err) = frame_sink.send(frame).await {
                    tracing::debug!(error = %err, "writer send failed");
                    writer_cancel.cancel();
                    break;
                }
            }
        });

        // Reader loop: sequence-checked inbound frames.
        let mut last_seq: Option<u64> = None;
        let result = loop {
            let frame = tokio::select! {
                frame = frame_stream.next() => frame,
                _ = cancel.cancelled() => break Ok(()),
            };
            let frame = match frame {
                Some(Ok(frame)) => frame,
                Some(Err(err)) => break Err(SessionError::Io(err)),
                None => break Ok(()),
            };
            if let Some(last) = last_seq {
                if frame.seq <= last {
                    let _ = self.sessions.try_send(
                        agent_id,
                        FrameBody::Goodbye {
                            reason: "sequence regression".to_string(),
                        },
                    );
                    break Err(SessionError::Protocol(format!(
                        "sequence regression: {} after {}",
                        frame.seq, last
                    )));
                }
            }
            last_seq = Some(frame.seq);
            session
                .last_seen_ms
                .store(Utc::now().timestamp_millis(), Ordering::Relaxed);

            match self.handle_frame(agent_id, frame.body).await {
                Ok(true) => continue,
                Ok(false) => break Ok(()),
                Err(err) => {
                    let _ = self.sessions.try_send(
                        agent_id,
                        FrameBody::Goodbye {
                            reason: err.to_string(),
                        },
                    );
                    break Err(err);
                }
            }
        };

        cancel.cancel();
        let _ = writer.await;
        self.sessions.remove_if_current(agent_id, nonce);
        // A replacement session may already be online; don't clobber it.
        if !self.sessions.is_connected(agent_id) {
            self.set_agent_state(agent_id, SessionState::Offline).await;
        }
        tracing::info!(%agent_id, "agent session closed");
        result
    }

    /// Dispatch one inbound frame. Returns false to close the session.
    async fn handle_frame(
        &self,
        agent_id: Uuid,
        body: FrameBody,
    ) -> Result<bool, SessionError> {
        match body {
            FrameBody::Heartbeat { load } => {
                if let Ok(Some(mut agent)) = self.store.get_agent(agent_id).await {
                    agent.last_seen = Utc::now();
                    agent.load = load;
                    let _ = self.store.upsert_agent(&agent).await;
                }
                Ok(true)
            }
            FrameBody::Resume { job_ids } => {
                self.reconcile(agent_id, job_ids).await?;
                Ok(true)
            }
            FrameBody::JobAck { job_id } => {
                if let Some(mut job) = self.store.get_job(job_id).await? {
                    if job.status == JobStatus::Assigned && job.assigned_agent == Some(agent_id) {
                        job.status = JobStatus::Running;
                        self.store.save_job(&job).await?;
                        tracing::debug!(%job_id, %agent_id, "job running");
                    }
                }
                Ok(true)
            }
            FrameBody::JobProgress {
                job_id,
                progress,
                message,
            } => {
                tracing::debug!(
                    %job_id,
                    progress,
                    message = message.as_deref().unwrap_or(""),
                    "job progress"
                );
                Ok(true)
            }
            terminal if terminal.is_job_terminal() => {
                self.record_terminal(agent_id, terminal).await?;
                Ok(true)
            }
            FrameBody::Goodbye { reason } => {
                tracing::info!(%agent_id, reason = reason.as_str(), "agent said goodbye");
                // Draining until the teardown marks it offline; the
                // dispatcher stops handing it work immediately.
                self.set_agent_state(agent_id, SessionState::Draining).await;
                Ok(false)
            }
            other => Err(SessionError::Protocol(format!(
                "unexpected {} frame from agent",
                other.kind()
            ))),
        }
    }

    /// Record a terminal job frame (first terminal wins) and notify the
    /// engine. Duplicates fall out of the status CAS and the engine's
    /// idempotent fold.
    async fn record_terminal(
        &self,
        agent_id: Uuid,
        body: FrameBody,
    ) -> Result<(), SessionError> {
        let (job_id, outcome) = match body {
            FrameBody::JobSucceeded { job_id, output } => {
                (job_id, JobOutcome::Succeeded { output })
            }
            FrameBody::JobFailed { job_id, error } => (job_id, JobOutcome::Failed { error }),
            FrameBody::JobTimedOut { job_id } => (job_id, JobOutcome::TimedOut),
            FrameBody::JobCancelled { job_id } => (job_id, JobOutcome::Cancelled),
            other => {
                return Err(SessionError::Protocol(format!(
                    "{} is not a terminal frame",
                    other.kind()
                )));
            }
        };

        let Some(job) = self.store.get_job(job_id).await? else {
            tracing::warn!(%job_id, %agent_id, "terminal frame for unknown job");
            return Ok(());
        };

        if job.status.is_terminal() {
            tracing::debug!(%job_id, "duplicate terminal frame discarded");
        } else if self
            .store
            .compare_and_set_job_status(job_id, job.status, outcome.status())
            .await?
        {
            let mut updated = job;
            updated.status = outcome.status();
            updated.ended_at = Some(Utc::now());
            match &outcome {
                JobOutcome::Succeeded { output } => updated.result = Some(output.clone()),
                JobOutcome::Failed { error } => updated.error = Some(error.clone()),
                JobOutcome::TimedOut => updated.error = Some("job timed out".to_string()),
                JobOutcome::Cancelled => {}
            }
            self.store.save_job(&updated).await?;
            tracing::info!(%job_id, status = ?updated.status, "job result recorded");
        }

        // Forward regardless; the engine's fold is idempotent by job id.
        self.sink.report(job_id, outcome);
        Ok(())
    }

    /// Resume reconciliation: cancel jobs the server does not know, re-send
    /// assignments the agent forgot. Known in-flight jobs are acknowledged by
    /// leaving them alone.
    async fn reconcile(
        &self,
        agent_id: Uuid,
        remembered: Vec<Uuid>,
    ) -> Result<(), SessionError> {
        let remembered: HashSet<Uuid> = remembered.into_iter().collect();
        let assigned: Vec<Job> = self
            .store
            .list_jobs_for_agent(agent_id)
            .await?
            .into_iter()
            .filter(|job| !job.status.is_terminal())
            .collect();
        let assigned_ids: HashSet<Uuid> = assigned.iter().map(|job| job.id).collect();

        let mut cancelled = 0usize;
        for unknown in remembered.difference(&assigned_ids) {
            cancelled += 1;
            if self
                .sessions
                .try_send(agent_id, FrameBody::CancelJob { job_id: *unknown })
                .is_err()
            {
                tracing::warn!(%agent_id, job_id = %unknown, "could not queue cancel on resume");
            }
        }

        let mut reassigned = 0usize;
        for job in assigned
            .iter()
            .filter(|job| !remembered.contains(&job.id))
        {
            reassigned += 1;
            if self
                .sessions
                .try_send(
                    agent_id,
                    FrameBody::JobAssigned {
                        job_id: job.id,
                        instance_id: job.instance_id,
                        step_id: job.step_id.clone(),
                        payload: job.payload.clone(),
                        timeout_secs: job.timeout_secs,
                    },
                )
                .is_err()
            {
                tracing::warn!(%agent_id, job_id = %job.id, "could not queue reassign on resume");
            }
        }

        tracing::info!(
            %agent_id,
            remembered = remembered.len(),
            acknowledged = assigned_ids.intersection(&remembered).count(),
            cancelled,
            reassigned,
            "resume reconciliation"
        );
        Ok(())
    }

    async fn upsert_agent_record(
        &self,
        agent_id: Uuid,
        name: &str,
        tags: Vec<String>,
        capabilities: Vec<String>,
        issued_credential: Option<&str>,
    ) {
        let existing = self.store.get_agent(agent_id).await.ok().flatten();
        let record = AgentRecord {
            id: agent_id,
            name: name.to_string(),
            tags,
            capabilities,
            last_seen: Utc::now(),
            session_state: SessionState::Online,
            credential_fingerprint: issued_credential
                .map(credential_fingerprint)
                .or_else(|| existing.as_ref().and_then(|a| a.credential_fingerprint.clone())),
            load: existing.map(|a| a.load).unwrap_or(0.0),
        };
        if let Err(err) = self.store.upsert_agent(&record).await {
            tracing::error!(%agent_id, error = %err, "failed to persist agent record");
        }
    }

    async fn set_agent_state(&self, agent_id: Uuid, state: SessionState) {
        if let Ok(Some(mut agent)) = self.store.get_agent(agent_id).await {
            agent.session_state = state;
            agent.last_seen = Utc::now();
            if let Err(err) = self.store.upsert_agent(&agent).await {
                tracing::error!(%agent_id, error = %err, "failed to update agent state");
            }
        }
    }
}

fn goodbye(seq: u64, reason: &str) -> Frame {
    Frame {
        seq,
        body: FrameBody::Goodbye {
            reason: reason.to_string(),
        },
    }
}
