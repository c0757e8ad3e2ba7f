//! Session-backed implementation of the engine's `JobDispatcher` port.
//!
//! Selection: Online agents matching the job's capability+tag selector,
//! ordered by inverse load with earliest-last-seen as the tie break. The
//! assignment is persisted before the `JobAssigned` frame is queued; a full
//! outbound queue falls through to the next candidate, or fails fast with
//! `AgentBusy` for directly-targeted jobs.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use orbitmesh_core::dispatch::{DispatchError, JobDispatcher};
use orbitmesh_core::store::{AgentStore, JobStore};
use orbitmesh_types::agent::AgentRecord;
use orbitmesh_types::job::{Job, JobStatus};

use crate::frame::FrameBody;
use crate::server::{SendRefused, SessionManager};

pub struct SessionDispatcher<S> {
    store: Arc<S>,
    sessions: Arc<SessionManager>,
}

impl<S> SessionDispatcher<S>
where
    S: JobStore + AgentStore,
{
    pub fn new(store: Arc<S>, sessions: Arc<SessionManager>) -> Self {
        Self { store, sessions }
    }

    /// Candidate agents for a job, best first.
    async fn candidates(&self, job: &Job) -> Result<Vec<AgentRecord>, DispatchError> {
        let mut agents: Vec<AgentRecord> = self
            .store
            .list_agents()
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))?
            .into_iter()
            .filter(|agent| {
                agent.session_state.accepts_work()
                    && job.selector.matches(agent)
                    && self.sessions.is_connected(agent.id)
            })
            .collect();
        // Inverse-load weighting; earliest last-seen breaks ties so equally
        // idle agents rotate round-robin as their last_seen advances.
        agents.sort_by(|a, b| {
            a.load
                .total_cmp(&b.load)
                .then_with(|| a.last_seen.cmp(&b.last_seen))
        });
        Ok(agents)
    }

    async fn persist_assignment(&self, job: &Job, agent_id: Uuid) -> Result<(), DispatchError> {
        let mut assigned = job.clone();
        assigned.assigned_agent = Some(agent_id);
        assigned.status = JobStatus::Assigned;
        assigned.assigned_at = Some(Utc::now());
        self.store
            .save_job(&assigned)
            .await
            .map_err(|e| DispatchError::Internal(e.to_string()))
    }

    async fn revert_assignment(&self, job: &Job) {
        let mut queued = job.clone();
        queued.assigned_agent = None;
        queued.status = JobStatus::Queued;
        queued.assigned_at = None;
        if let Err(err) = self.store.save_job(&queued).await {
            tracing::error!(job_id = %job.id, error = %err, "failed to revert assignment");
        }
    }
}

impl<S> JobDispatcher for SessionDispatcher<S>
where
    S: JobStore + AgentStore,
{
    async fn dispatch(&self, job: &Job) -> Result<(), DispatchError> {
        let candidates = self.candidates(job).await?;
        if candidates.is_empty() {
            return Err(DispatchError::AgentUnavailable { job_id: job.id });
        }
        let direct = job.selector.is_direct();

        for agent in &candidates {
            // The assignment row lands before the frame goes out.
            self.persist_assignment(job, agent.id).await?;

            let frame = FrameBody::JobAssigned {
                job_id: job.id,
                instance_id: job.instance_id,
                step_id: job.step_id.clone(),
                payload: job.payload.clone(),
                timeout_secs: job.timeout_secs,
            };
            match self.sessions.try_send(agent.id, frame) {
                Ok(()) => {
                    tracing::info!(
                        job_id = %job.id,
                        agent_id = %agent.id,
                        agent = agent.name.as_str(),
                        "job assigned"
                    );
                    return Ok(());
                }
                Err(SendRefused::QueueFull) => {
                    self.revert_assignment(job).await;
                    if direct {
                        return Err(DispatchError::AgentBusy { job_id: job.id });
                    }
                    tracing::debug!(
                        job_id = %job.id,
                        agent_id = %agent.id,
                        "agent queue full; trying next candidate"
                    );
                }
                Err(SendRefused::NotConnected) => {
                    self.revert_assignment(job).await;
                    tracing::debug!(
                        job_id = %job.id,
                        agent_id = %agent.id,
                        "agent vanished mid-dispatch; trying next candidate"
                    );
                }
            }
        }

        // Matching agents existed but none could take the frame.
        Err(DispatchError::AgentBusy { job_id: job.id })
    }

    async fn cancel(&self, job_id: Uuid) {
        let assigned_agent = match self.store.get_job(job_id).await {
            Ok(Some(job)) => job.assigned_agent,
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(%job_id, error = %err, "cancel lookup failed");
                None
            }
        };
        let Some(agent_id) = assigned_agent else {
            return;
        };
        if self
            .sessions
            .try_send(agent_id, FrameBody::CancelJob { job_id })
            .is_err()
        {
            tracing::debug!(%job_id, %agent_id, "cancel not deliverable; job deadline governs");
        }
    }
}
