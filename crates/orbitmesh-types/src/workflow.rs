//! Workflow definition types for OrbitMesh.
//!
//! Defines the canonical intermediate representation for workflows: YAML
//! documents and API payloads both convert to and from `WorkflowDefinition`.
//! A definition is immutable after registration; identity is `(id, version)`
//! and new revisions are registered as new versions.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::job::AgentSelector;

// ---------------------------------------------------------------------------
// Workflow Definition (canonical IR)
// ---------------------------------------------------------------------------

/// The canonical workflow definition.
///
/// Immutable once registered: the registry rejects a second registration of
/// the same `(id, version)` pair. All structural validation happens at
/// admission, so a stored definition is guaranteed to be well-formed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow identifier (e.g. "deploy-fleet").
    pub id: String,
    /// Monotonic version; `(id, version)` is the registry key.
    pub version: u32,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Declared input schema (JSON Schema fragment, advisory).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
    /// Ordered list of step definitions forming the workflow DAG.
    pub steps: Vec<WorkflowStep>,
}

// ---------------------------------------------------------------------------
// Step Definition
// ---------------------------------------------------------------------------

/// A single declarative step in a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    /// User-defined step ID, unique within the definition (branches included).
    pub id: String,
    /// Human-readable step name.
    pub name: String,
    /// The kind of step.
    #[serde(rename = "type")]
    pub step_type: StepType,
    /// Step-specific configuration payload. Its variant must agree with
    /// `step_type`; the registry rejects mismatches.
    pub config: StepConfig,
    /// Step IDs this step depends on (DAG edges within the same step list).
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Optional boolean guard expression; false means the step is Skipped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum retries after the first attempt (default 0).
    #[serde(default)]
    pub max_retries: u32,
    /// Fixed delay between retries in seconds. When absent, exponential
    /// backoff applies (base 1s, capped at 60s).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_secs: Option<u64>,
    /// When true, a terminal failure of this step does not fail the instance.
    #[serde(default)]
    pub continue_on_error: bool,
    /// Saga-style undo action, run in reverse completion order when the
    /// instance fails after this step completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compensation: Option<CompensationSpec>,
    /// Variable name the step's output is assigned to on completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_variable: Option<String>,
}

/// The kind of step in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Job,
    Parallel,
    Conditional,
    Delay,
    WaitForEvent,
    SubWorkflow,
    ForEach,
    Transform,
    Notify,
    Approval,
}

/// Step-specific configuration payload, internally tagged by `type`:
///
/// ```yaml
/// config:
///   type: job
///   selector:
///     capabilities: [shell]
///   payload:
///     command: "df -h"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepConfig {
    /// Dispatch a payload to a remote agent via the session layer.
    Job {
        selector: AgentSelector,
        payload: Value,
    },
    /// Run several named branches concurrently.
    Parallel { branches: Vec<ParallelBranch> },
    /// Evaluate a condition and run the then- or else-branch.
    Conditional {
        condition: String,
        #[serde(default)]
        then_steps: Vec<WorkflowStep>,
        #[serde(default)]
        else_steps: Vec<WorkflowStep>,
    },
    /// Suspend the step for a fixed duration.
    Delay { duration_secs: u64 },
    /// Suspend until a named event is signalled on the instance.
    WaitForEvent { event: String },
    /// Start another registered workflow as a child instance.
    SubWorkflow {
        workflow_id: String,
        /// Pinned child version; latest when absent.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        input: Option<Value>,
    },
    /// Run the body once per element of the evaluated source sequence.
    ForEach {
        /// Expression evaluating to an array.
        items: String,
        /// Loop variable bound per branch (default "item").
        #[serde(default = "default_item_var")]
        item_var: String,
        steps: Vec<WorkflowStep>,
    },
    /// Evaluate an expression and assign it to the output variable.
    Transform { expression: String },
    /// Deliver a message through the notifier contract.
    Notify { target: String, message: String },
    /// Human approval gate.
    Approval {
        prompt: String,
        #[serde(default)]
        approvers: Vec<String>,
    },
}

fn default_item_var() -> String {
    "item".to_string()
}

impl StepConfig {
    /// The step type this config variant belongs to.
    pub fn step_type(&self) -> StepType {
        match self {
            StepConfig::Job { .. } => StepType::Job,
            StepConfig::Parallel { .. } => StepType::Parallel,
            StepConfig::Conditional { .. } => StepType::Conditional,
            StepConfig::Delay { .. } => StepType::Delay,
            StepConfig::WaitForEvent { .. } => StepType::WaitForEvent,
            StepConfig::SubWorkflow { .. } => StepType::SubWorkflow,
            StepConfig::ForEach { .. } => StepType::ForEach,
            StepConfig::Transform { .. } => StepType::Transform,
            StepConfig::Notify { .. } => StepType::Notify,
            StepConfig::Approval { .. } => StepType::Approval,
        }
    }

    /// Nested step lists carried by this config (branch bodies).
    pub fn nested_steps(&self) -> Vec<&[WorkflowStep]> {
        match self {
            StepConfig::Parallel { branches } => {
                branches.iter().map(|b| b.steps.as_slice()).collect()
            }
            StepConfig::Conditional {
                then_steps,
                else_steps,
                ..
            } => vec![then_steps.as_slice(), else_steps.as_slice()],
            StepConfig::ForEach { steps, .. } => vec![steps.as_slice()],
            _ => vec![],
        }
    }
}

/// A named branch of a Parallel step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelBranch {
    pub name: String,
    pub steps: Vec<WorkflowStep>,
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// Undo action attached to a Job, SubWorkflow, or Notify step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensationSpec {
    /// What to run; the completed step's recorded output is in scope as
    /// `$.compensated_output`.
    pub config: StepConfig,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Maximum retries for the compensation itself (default 3).
    #[serde(default = "default_compensation_retries")]
    pub max_retries: u32,
}

fn default_compensation_retries() -> u32 {
    3
}

impl WorkflowStep {
    /// Walk this step and every step nested in its branches.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a WorkflowStep)) {
        visit(self);
        for list in self.config.nested_steps() {
            for step in list {
                step.walk(visit);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
