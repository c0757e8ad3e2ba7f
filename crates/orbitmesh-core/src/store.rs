//! Store contract: the persistence interface the engine and session layer
//! consume.
//!
//! Four entity families behind narrow traits, implemented by the
//! infrastructure layer (in-memory reference backend in `orbitmesh-infra`;
//! relational backends plug in behind the same traits). Requirements on any
//! implementation:
//!
//! - single-row transactionality and a serialization point per instance
//! - read-your-writes within one instance
//! - atomic compare-and-set on instance and job status
//!
//! Uses native async fn in traits (Rust 2024 edition, no async_trait macro).

use chrono::{DateTime, Utc};
use uuid::Uuid;

use orbitmesh_types::agent::AgentRecord;
use orbitmesh_types::error::StoreError;
use orbitmesh_types::instance::{EventRecord, InstanceStatus, WorkflowInstance};
use orbitmesh_types::job::{Job, JobStatus};
use orbitmesh_types::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Definitions
// ---------------------------------------------------------------------------

pub trait DefinitionStore: Send + Sync {
    /// Insert a definition; `Conflict` if `(id, version)` already exists.
    fn put_definition(
        &self,
        def: &WorkflowDefinition,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Fetch a definition; `None` version means the highest registered one.
    fn get_definition(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> impl Future<Output = Result<Option<WorkflowDefinition>, StoreError>> + Send;

    /// List every registered definition (all versions).
    fn list_definitions(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowDefinition>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Instances
// ---------------------------------------------------------------------------

/// Query filter for instances.
#[derive(Debug, Clone, Default)]
pub struct InstanceQuery {
    pub workflow_id: Option<String>,
    pub status: Option<InstanceStatus>,
    pub started_after: Option<DateTime<Utc>>,
    pub started_before: Option<DateTime<Utc>>,
}

pub trait InstanceStore: Send + Sync {
    /// Insert a fresh instance; `Conflict` on duplicate id.
    fn create_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Full-row write. Only the owning engine driver calls this.
    fn save_instance(
        &self,
        instance: &WorkflowInstance,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_instance(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<WorkflowInstance>, StoreError>> + Send;

    /// Atomic status transition; returns false when the current status is
    /// not `expected` (the caller lost the race).
    fn compare_and_set_instance_status(
        &self,
        id: Uuid,
        expected: InstanceStatus,
        next: InstanceStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn query_instances(
        &self,
        query: &InstanceQuery,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, StoreError>> + Send;

    /// Instances not yet in a terminal status (crash recovery).
    fn list_non_terminal_instances(
        &self,
    ) -> impl Future<Output = Result<Vec<WorkflowInstance>, StoreError>> + Send;

    /// Record a signalled event before it is delivered to the driver.
    fn append_event(
        &self,
        event: &EventRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn list_events(
        &self,
        instance_id: Uuid,
    ) -> impl Future<Output = Result<Vec<EventRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

pub trait JobStore: Send + Sync {
    /// Insert a job; `Conflict` on duplicate id. The engine persists the job
    /// before any dispatch side effect.
    fn create_job(&self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_job(&self, id: Uuid) -> impl Future<Output = Result<Option<Job>, StoreError>> + Send;

    /// Full-row write. The session layer owns assignment/progress fields.
    fn save_job(&self, job: &Job) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Atomic status transition keyed on the current status. A terminal
    /// status never transitions again; the first terminal write wins.
    fn compare_and_set_job_status(
        &self,
        id: Uuid,
        expected: JobStatus,
        next: JobStatus,
    ) -> impl Future<Output = Result<bool, StoreError>> + Send;

    fn list_jobs_for_agent(
        &self,
        agent_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;

    /// Jobs not yet terminal (session-layer reconciliation after restart).
    fn list_outstanding_jobs(&self) -> impl Future<Output = Result<Vec<Job>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Agents
// ---------------------------------------------------------------------------

pub trait AgentStore: Send + Sync {
    fn upsert_agent(
        &self,
        agent: &AgentRecord,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    fn get_agent(
        &self,
        id: Uuid,
    ) -> impl Future<Output = Result<Option<AgentRecord>, StoreError>> + Send;

    fn list_agents(&self) -> impl Future<Output = Result<Vec<AgentRecord>, StoreError>> + Send;
}

// ---------------------------------------------------------------------------
// Combined store
// ---------------------------------------------------------------------------

/// Convenience bound for components that need the whole store surface.
pub trait Store: DefinitionStore + InstanceStore + JobStore + AgentStore {}

impl<T: DefinitionStore + InstanceStore + JobStore + AgentStore> Store for T {}
