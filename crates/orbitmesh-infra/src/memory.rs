//! In-memory store: the reference implementation of the store contract.
//!
//! Rows live in concurrent maps; every operation touches exactly one row
//! under its shard lock, which gives the single-row transactionality and the
//! per-instance serialization point the contract requires. Read-your-writes
//! holds trivially: a write is visible the moment the entry lock releases.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use uuid::Uuid;

use orbitmesh_core::store::{
    AgentStore, DefinitionStore, InstanceQuery, InstanceStore, JobStore,
};
use orbitmesh_types::agent::AgentRecord;
use orbitmesh_types::error::StoreError;
use orbitmesh_types::instance::{EventRecord, InstanceStatus, WorkflowInstance};
use orbitmesh_types::job::{Job, JobStatus};
use orbitmesh_types::workflow::WorkflowDefinition;

/// In-memory store backend.
#[derive(Default)]
pub struct MemoryStore {
    /// Keyed by workflow id; versions sorted ascending inside.
    definitions: DashMap<String, Vec<WorkflowDefinition>>,
    instances: DashMap<Uuid, WorkflowInstance>,
    jobs: DashMap<Uuid, Job>,
    agents: DashMap<Uuid, AgentRecord>,
    events: DashMap<Uuid, Vec<EventRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

impl DefinitionStore for MemoryStore {
    async fn put_definition(&self, def: &WorkflowDefinition) -> Result<(), StoreError> {
        let mut versions = self.definitions.entry(def.id.clone()).or_default();
        if versions.iter().any(|d| d.version == def.version) {
            return Err(StoreError::Conflict(format!(
                "definition '{}' version {} exists",
                def.id, def.version
            )));
        }
        versions.push(def.clone());
        versions.sort_by_key(|d| d.version);
        Ok(())
    }

    async fn get_definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.definitions.get(id).and_then(|versions| match version {
            Some(v) => versions.iter().find(|d| d.version == v).cloned(),
            None => versions.last().cloned(),
        }))
    }

    async fn list_definitions(&self) -> Result<Vec<WorkflowDefinition>, StoreError> {
        let mut all: Vec<WorkflowDefinition> = self
            .definitions
            .iter()
            .flat_map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id).then(a.version.cmp(&b.version)));
        Ok(all)
    }
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

impl InstanceStore for MemoryStore {
    async fn create_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        match self.instances.entry(instance.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!(
                "instance {} exists",
                instance.id
            ))),
            Entry::Vacant(slot) => {
                slot.insert(instance.clone());
                Ok(())
            }
        }
    }

    async fn save_instance(&self, instance: &WorkflowInstance) -> Result<(), StoreError> {
        match self.instances.get_mut(&instance.id) {
            Some(mut row) => {
                *row = instance.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn get_instance(&self, id: Uuid) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.instances.get(&id).map(|row| row.clone()))
    }

    async fn compare_and_set_instance_status(
        &self,
        id: Uuid,
        expected: InstanceStatus,
        next: InstanceStatus,
    ) -> Result<bool, StoreError> {
        match self.instances.get_mut(&id) {
            Some(mut row) => {
                if row.status == expected {
                    row.status = next;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn query_instances(
        &self,
        query: &InstanceQuery,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut rows: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|row| {
                query
                    .workflow_id
                    .as_deref()
                    .is_none_or(|id| row.workflow_id == id)
                    && query.status.is_none_or(|status| row.status == status)
                    && query
                        .started_after
                        .is_none_or(|after| row.started_at >= after)
                    && query
                        .started_before
                        .is_none_or(|before| row.started_at <= before)
            })
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.started_at);
        Ok(rows)
    }

    async fn list_non_terminal_instances(&self) -> Result<Vec<WorkflowInstance>, StoreError> {
        let mut rows: Vec<WorkflowInstance> = self
            .instances
            .iter()
            .filter(|row| !row.status.is_terminal())
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.started_at);
        Ok(rows)
    }

    async fn append_event(&self, event: &EventRecord) -> Result<(), StoreError> {
        self.events
            .entry(event.instance_id)
            .or_default()
            .push(event.clone());
        Ok(())
    }

    async fn list_events(&self, instance_id: Uuid) -> Result<Vec<EventRecord>, StoreError> {
        Ok(self
            .events
            .get(&instance_id)
            .map(|events| events.clone())
            .unwrap_or_default())
    }
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.entry(job.id) {
            Entry::Occupied(_) => Err(StoreError::Conflict(format!("job {} exists", job.id))),
            Entry::Vacant(slot) => {
                slot.insert(job.clone());
                Ok(())
            }
        }
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.get(&id).map(|row| row.clone()))
    }

    async fn save_job(&self, job: &Job) -> Result<(), StoreError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut row) => {
                *row = job.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn compare_and_set_job_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> Result<bool, StoreError> {
        match self.jobs.get_mut(&id) {
            Some(mut row) => {
                if row.status == expected {
                    row.status = next;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            None => Err(StoreError::NotFound),
        }
    }

    async fn list_jobs_for_agent(&self, agent_id: Uuid) -> Result<Vec<Job>, StoreError> {
        let mut rows: Vec<Job> = self
            .jobs
            .iter()
            .filter(|row| row.assigned_agent == Some(agent_id))
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }

    async fn list_outstanding_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let mut rows: Vec<Job> = self
            .jobs
            .iter()
            .filter(|row| !row.status.is_terminal())
            .map(|row| row.clone())
            .collect();
        rows.sort_by_key(|row| row.created_at);
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

impl AgentStore for MemoryStore {
    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<(), StoreError> {
        self.agents.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<AgentRecord>, StoreError> {
        Ok(self.agents.get(&id).map(|row| row.clone()))
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>, StoreError> {
        let mut rows: Vec<AgentRecord> = self.agents.iter().map(|row| row.clone()).collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(rows)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
