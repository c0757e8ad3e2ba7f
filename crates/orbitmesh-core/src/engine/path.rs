//! Addressing for steps nested inside branch instances.
//!
//! A `StepPath` alternates step ids and branch keys from the instance root:
//! `["rollout"]` is a top-level step, `["rollout", "east", "push"]` is step
//! `push` inside branch `east` of step `rollout`. Paths resolve against both
//! the definition tree and the runtime instance tree.

use orbitmesh_types::instance::{StepInstance, WorkflowInstance};
use orbitmesh_types::workflow::{StepConfig, WorkflowStep};

/// Path to a (possibly nested) step. Even indices are step ids, odd indices
/// are branch keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepPath(Vec<String>);

impl StepPath {
    pub fn top(step_id: &str) -> Self {
        Self(vec![step_id.to_string()])
    }

    /// Extend into a branch of this step.
    pub fn child(&self, branch_key: &str, step_id: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(branch_key.to_string());
        segments.push(step_id.to_string());
        Self(segments)
    }

    pub fn step_id(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn is_top_level(&self) -> bool {
        self.0.len() == 1
    }

    /// Path of the branch parent, with the branch key, for nested steps.
    pub fn parent(&self) -> Option<(StepPath, &str)> {
        if self.0.len() < 3 {
            return None;
        }
        let parent = StepPath(self.0[..self.0.len() - 2].to_vec());
        let key = &self.0[self.0.len() - 2];
        Some((parent, key))
    }
}

impl std::fmt::Display for StepPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

// ---------------------------------------------------------------------------
// Instance-tree resolution
// ---------------------------------------------------------------------------

pub fn find_step<'a>(instance: &'a WorkflowInstance, path: &StepPath) -> Option<&'a StepInstance> {
    let mut segments = path.0.iter();
    let first = segments.next()?;
    let mut current = instance.steps.iter().find(|s| &s.step_id == first)?;
    while let Some(branch_key) = segments.next() {
        let step_id = segments.next()?;
        let branch = current.branches.iter().find(|b| &b.key == branch_key)?;
        current = branch.steps.iter().find(|s| &s.step_id == step_id)?;
    }
    Some(current)
}

pub fn find_step_mut<'a>(
    instance: &'a mut WorkflowInstance,
    path: &StepPath,
) -> Option<&'a mut StepInstance> {
    let mut segments = path.0.iter();
    let first = segments.next()?;
    let mut current = instance.steps.iter_mut().find(|s| &s.step_id == first)?;
    while let Some(branch_key) = segments.next() {
        let step_id = segments.next()?;
        let branch = current
            .branches
            .iter_mut()
            .find(|b| &b.key == branch_key)?;
        current = branch.steps.iter_mut().find(|s| &s.step_id == step_id)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Definition-tree resolution
// ---------------------------------------------------------------------------

/// Find the step definition a path refers to. Branch keys select the matching
/// nested list: Parallel by branch name, Conditional by "then"/"else",
/// ForEach bodies for any index key.
pub fn find_definition<'a>(steps: &'a [WorkflowStep], path: &StepPath) -> Option<&'a WorkflowStep> {
    let mut segments = path.0.iter();
    let first = segments.next()?;
    let mut current = steps.iter().find(|s| &s.id == first)?;
    while let Some(branch_key) = segments.next() {
        let step_id = segments.next()?;
        let list = branch_list(&current.config, branch_key)?;
        current = list.iter().find(|s| &s.id == step_id)?;
    }
    Some(current)
}

/// The definition step list behind a branch key of a config.
pub fn branch_list<'a>(config: &'a StepConfig, branch_key: &str) -> Option<&'a [WorkflowStep]> {
    match config {
        StepConfig::Parallel { branches } => branches
            .iter()
            .find(|b| b.name == branch_key)
            .map(|b| b.steps.as_slice()),
        StepConfig::Conditional {
            then_steps,
            else_steps,
            ..
        } => match branch_key {
            "then" => Some(then_steps.as_slice()),
            "else" => Some(else_steps.as_slice()),
            _ => None,
        },
        StepConfig::ForEach { steps, .. } => Some(steps.as_slice()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;
    use orbitmesh_types::instance::{BranchInstance, StepInstance};
    use orbitmesh_types::job::AgentSelector;
    use orbitmesh_types::workflow::{ParallelBranch, StepType};
    use serde_json::json;

    fn job_step(id: &str) -> WorkflowStep {
        WorkflowStep {
            id: id.to_string(),
            name: id.to_string(),
            step_type: StepType::Job,
            config: StepConfig::Job {
                selector: AgentSelector::default(),
                payload: json!({}),
            },
            depends_on: vec![],
            condition: None,
            timeout_secs: None,
            max_retries: 0,
            retry_delay_secs: None,
            continue_on_error: false,
            compensation: None,
            output_variable: None,
        }
    }

    #[test]
    fn path_display_and_accessors() {
        let path = StepPath::top("fan").child("east", "push");
        assert_eq!(path.to_string(), "fan/east/push");
        assert_eq!(path.step_id(), "push");
        assert!(!path.is_top_level());

        let (parent, key) = path.parent().unwrap();
        assert_eq!(parent, StepPath::top("fan"));
        assert_eq!(key, "east");
        assert!(parent.parent().is_none());
    }

    #[test]
    fn resolve_nested_instance_step() {
        let mut instance = WorkflowInstance::new(
            "wf",
            1,
            vec!["fan".to_string()],
            IndexMap::new(),
            None,
        );
        instance.step_mut("fan").unwrap().branches = vec![BranchInstance {
            key: "east".to_string(),
            steps: vec![StepInstance::new("push")],
            variables: IndexMap::new(),
        }];

        let path = StepPath::top("fan").child("east", "push");
        assert_eq!(find_step(&instance, &path).unwrap().step_id, "push");
        assert!(find_step(&instance, &StepPath::top("fan").child("west", "push")).is_none());

        find_step_mut(&mut instance, &path).unwrap().attempt = 2;
        assert_eq!(find_step(&instance, &path).unwrap().attempt, 2);
    }

    #[test]
    fn resolve_definition_through_parallel_and_conditional() {
        let steps = vec![WorkflowStep {
            config: StepConfig::Parallel {
                branches: vec![ParallelBranch {
                    name: "east".to_string(),
                    steps: vec![WorkflowStep {
                        config: StepConfig::Conditional {
                            condition: "true".to_string(),
                            then_steps: vec![job_step("inner")],
                            else_steps: vec![],
                        },
                        step_type: StepType::Conditional,
                        ..job_step("check")
                    }],
                }],
            },
            step_type: StepType::Parallel,
            ..job_step("fan")
        }];

        let path = StepPath::top("fan")
            .child("east", "check")
            .child("then", "inner");
        assert_eq!(find_definition(&steps, &path).unwrap().id, "inner");

        let bad = StepPath::top("fan").child("east", "check").child("else", "inner");
        assert!(find_definition(&steps, &bad).is_none());
    }

    #[test]
    fn foreach_branch_list_ignores_key() {
        let config = StepConfig::ForEach {
            items: "$.xs".to_string(),
            item_var: "x".to_string(),
            steps: vec![job_step("body")],
        };
        assert_eq!(branch_list(&config, "0").unwrap()[0].id, "body");
        assert_eq!(branch_list(&config, "17").unwrap()[0].id, "body");
    }
}
