//! Definition registry: admission validation and versioned lookup.
//!
//! Definitions are validated structurally on `register` and never mutated
//! afterwards -- a new revision is a new `(id, version)` row. Validation is
//! all-or-nothing: any failed check rejects the whole definition.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use thiserror::Error;

use orbitmesh_types::error::StoreError;
use orbitmesh_types::workflow::{StepConfig, StepType, WorkflowDefinition, WorkflowStep};

use crate::expr;
use crate::store::DefinitionStore;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum RegistryError {
    /// Structural validation failure; the message names the offending step.
    #[error("invalid definition: {0}")]
    InvalidDefinition(String),

    #[error("workflow '{id}' version {version:?} not found")]
    DefinitionNotFound { id: String, version: Option<u32> },

    /// `(id, version)` already registered.
    #[error("workflow '{id}' version {version} already registered")]
    Conflict { id: String, version: u32 },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Versioned store of immutable workflow definitions.
pub struct DefinitionRegistry<S> {
    store: Arc<S>,
}

impl<S: DefinitionStore> DefinitionRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Validate and persist a definition.
    pub async fn register(&self, def: WorkflowDefinition) -> Result<(), RegistryError> {
        validate_definition(&def)?;
        match self.store.put_definition(&def).await {
            Ok(()) => {
                tracing::info!(
                    workflow_id = def.id.as_str(),
                    version = def.version,
                    steps = def.steps.len(),
                    "registered workflow definition"
                );
                Ok(())
            }
            Err(StoreError::Conflict(_)) => Err(RegistryError::Conflict {
                id: def.id,
                version: def.version,
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// Fetch a definition; `None` version resolves to the highest registered.
    pub async fn get(
        &self,
        id: &str,
        version: Option<u32>,
    ) -> Result<WorkflowDefinition, RegistryError> {
        self.store
            .get_definition(id, version)
            .await?
            .ok_or_else(|| RegistryError::DefinitionNotFound {
                id: id.to_string(),
                version,
            })
    }

    pub async fn list(&self) -> Result<Vec<WorkflowDefinition>, RegistryError> {
        Ok(self.store.list_definitions().await?)
    }

    /// Parse a YAML document and register it.
    pub async fn register_yaml(&self, yaml: &str) -> Result<WorkflowDefinition, RegistryError> {
        let def: WorkflowDefinition = serde_yaml_ng::from_str(yaml)
            .map_err(|e| RegistryError::InvalidDefinition(format!("parse error: {e}")))?;
        self.register(def.clone()).await?;
        Ok(def)
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a definition.
///
/// Checks, all of which must pass:
/// - non-empty id and at least one step
/// - step ids unique across the whole tree (branch bodies included)
/// - `depends_on` references resolve within the same step list
/// - each step list is acyclic (topological-sort pass)
/// - `output_variable` names unique across all steps
/// - condition / transform / for-each expressions parse
/// - `step_type` agrees with the config variant
/// - compensation only on Job, SubWorkflow, or Notify steps
pub fn validate_definition(def: &WorkflowDefinition) -> Result<(), RegistryError> {
    if def.id.is_empty() {
        return Err(RegistryError::InvalidDefinition(
            "workflow id must not be empty".to_string(),
        ));
    }
    if def.version == 0 {
        return Err(RegistryError::InvalidDefinition(
            "workflow version must be >= 1".to_string(),
        ));
    }
    if def.steps.is_empty() {
        return Err(RegistryError::InvalidDefinition(
            "workflow must have at least one step".to_string(),
        ));
    }

    // Unique ids and output variables across the whole tree.
    let mut seen_ids = HashSet::new();
    let mut seen_outputs = HashSet::new();
    let mut all_steps: Vec<&WorkflowStep> = Vec::new();
    for step in &def.steps {
        step.walk(&mut |s| all_steps.push(s));
    }
    for step in &all_steps {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(RegistryError::InvalidDefinition(format!(
                "duplicate step id: '{}'",
                step.id
            )));
        }
        if let Some(output) = &step.output_variable {
            if !seen_outputs.insert(output.as_str()) {
                return Err(RegistryError::InvalidDefinition(format!(
                    "step '{}' reuses output variable '{}'",
                    step.id, output
                )));
            }
        }
    }

    validate_step_list(&def.steps)?;

    for step in &all_steps {
        validate_step(step)?;
    }

    Ok(())
}

/// Validate one step list: dependency resolution plus acyclicity, then
/// recurse into branch bodies.
fn validate_step_list(steps: &[WorkflowStep]) -> Result<(), RegistryError> {
    let id_to_idx: HashMap<&str, usize> = steps
        .iter()
        .enumerate()
        .map(|(i, s)| (s.id.as_str(), i))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let node_indices: Vec<_> = steps.iter().map(|s| graph.add_node(s.id.as_str())).collect();

    for step in steps {
        let to_idx = id_to_idx[step.id.as_str()];
        for dep in &step.depends_on {
            let from_idx = id_to_idx.get(dep.as_str()).ok_or_else(|| {
                RegistryError::InvalidDefinition(format!(
                    "step '{}' depends on unknown step '{}'",
                    step.id, dep
                ))
            })?;
            graph.add_edge(node_indices[*from_idx], node_indices[to_idx], ());
        }
    }

    toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        RegistryError::InvalidDefinition(format!("cycle detected involving step '{node_id}'"))
    })?;

    for step in steps {
        for list in step.config.nested_steps() {
            validate_step_list(list)?;
        }
    }
    Ok(())
}

/// Per-step checks: type/config agreement, expression parsing, compensation
/// placement.
fn validate_step(step: &WorkflowStep) -> Result<(), RegistryError> {
    if step.config.step_type() != step.step_type {
        return Err(RegistryError::InvalidDefinition(format!(
            "step '{}' declares type {:?} but its config is {:?}",
            step.id,
            step.step_type,
            step.config.step_type()
        )));
    }

    if let Some(condition) = &step.condition {
        parse_checked(&step.id, "condition", condition)?;
    }

    match &step.config {
        StepConfig::Transform { expression } => {
            parse_checked(&step.id, "transform expression", expression)?;
        }
        StepConfig::Conditional { condition, .. } => {
            parse_checked(&step.id, "branch condition", condition)?;
        }
        StepConfig::ForEach { items, .. } => {
            parse_checked(&step.id, "items expression", items)?;
        }
        StepConfig::Delay { duration_secs } => {
            if *duration_secs == 0 {
                return Err(RegistryError::InvalidDefinition(format!(
                    "step '{}' has a zero-length delay",
                    step.id
                )));
            }
        }
        _ => {}
    }

    if let Some(compensation) = &step.compensation {
        if !matches!(
            step.step_type,
            StepType::Job | StepType::SubWorkflow | StepType::Notify
        ) {
            return Err(RegistryError::InvalidDefinition(format!(
                "step '{}' has a compensation but type {:?} does not allow one",
                step.id, step.step_type
            )));
        }
        // A compensation may not itself branch or wait.
        if matches!(
            compensation.config.step_type(),
            StepType::Parallel
                | StepType::Conditional
                | StepType::ForEach
                | StepType::WaitForEvent
                | StepType::Approval
        ) {
            return Err(RegistryError::InvalidDefinition(format!(
                "step '{}' compensation must be a Job, SubWorkflow, Notify, Delay, or Transform",
                step.id
            )));
        }
    }

    Ok(())
}

fn parse_checked(step_id: &str, what: &str, source: &str) -> Result<(), RegistryError> {
    expr::parse(source).map(|_| ()).map_err(|e| {
        RegistryError::InvalidDefinition(format!("step '{step_id}' {what} does not parse: {e}"))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
