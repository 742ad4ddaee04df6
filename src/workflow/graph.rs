//! Step Graph
//!
//! Parses and validates the step-dependency configuration of a
//! workflow and answers structural queries: step parameters,
//! predecessor/dependent lookup, topological step enumeration, and
//! the per-step required subdirectories.
//!
//! # Example Configuration
//!
//! The configuration file maps configuration IDs to workflows. YAML is
//! a superset of JSON, so both formats parse:
//!
//! ```yaml
//! default:
//!   initial_step: opt
//!   steps:
//!     opt:
//!       program: gaussian16
//!       route: "#p pm7 opt"
//!       opt: true
//!       conformers: true
//!       dependents: [sp]
//!     sp:
//!       program: gaussian16
//!       route: "#p b3lyp/6-31G* sp"
//!       single_point: true
//! ```

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::path::Path;

use log::{debug, info};
use serde_yaml::Value;

use crate::error::{FlowError, Result};
use crate::workflow::params::{Program, StepParams, RESERVED_SEPARATOR};

/// Well-known name of the step configuration file.
pub const CONFIG_FILENAME: &str = ".flow_config";

/// A validated workflow step graph.
///
/// Owns the step/DAG data for the lifetime of one engine invocation;
/// every invocation reloads the configuration fresh, so there is no
/// cross-process shared mutable state.
#[derive(Debug, Clone)]
pub struct StepGraph {
    initial_step_id: String,
    steps: HashMap<String, StepParams>,
    /// Step IDs in configuration order, for stable enumeration
    step_order: Vec<String>,
}

impl StepGraph {
    /// Loads and validates the workflow with ID `config_id` from the
    /// given configuration file.
    pub fn load(config_path: &Path, config_id: &str) -> Result<Self> {
        info!(
            "Loading workflow configuration '{}' from {}",
            config_id,
            config_path.display()
        );

        let text = fs::read_to_string(config_path).map_err(|e| {
            FlowError::Config(format!(
                "failed to read configuration file '{}': {}",
                config_path.display(),
                e
            ))
        })?;

        let root: Value = serde_yaml::from_str(&text)
            .map_err(|e| FlowError::Config(format!("failed to parse configuration: {}", e)))?;

        let workflow = root
            .get(config_id)
            .ok_or_else(|| {
                FlowError::Config(format!(
                    "configuration ID '{}' not found in '{}'",
                    config_id,
                    config_path.display()
                ))
            })?;

        Self::from_value(workflow)
    }

    /// Builds a step graph from a parsed workflow mapping.
    pub fn from_value(workflow: &Value) -> Result<Self> {
        let initial_step_id = match workflow.get("initial_step") {
            Some(Value::String(s)) => s.clone(),
            Some(_) => {
                return Err(FlowError::Config(
                    "'initial_step' must be a step ID string".to_string(),
                ))
            }
            None => {
                return Err(FlowError::Config(
                    "missing required key 'initial_step'".to_string(),
                ))
            }
        };

        let steps_value = workflow
            .get("steps")
            .ok_or_else(|| FlowError::Config("missing required key 'steps'".to_string()))?;

        let steps_map = steps_value.as_mapping().ok_or_else(|| {
            FlowError::Config("'steps' must be a mapping of step IDs to parameters".to_string())
        })?;

        let mut steps = HashMap::new();
        let mut step_order = Vec::new();

        for (key, value) in steps_map {
            let step_id = key
                .as_str()
                .ok_or_else(|| FlowError::Config("step IDs must be strings".to_string()))?
                .to_string();

            Self::validate_step_id(&step_id)?;

            let raw: BTreeMap<String, Value> = match value.as_mapping() {
                Some(m) => m
                    .iter()
                    .filter_map(|(k, v)| k.as_str().map(|k| (k.to_string(), v.clone())))
                    .collect(),
                None => {
                    return Err(FlowError::Config(format!(
                        "step '{}' must be a mapping of parameters",
                        step_id
                    )))
                }
            };

            let params = StepParams::from_raw(&step_id, &raw)?;
            steps.insert(step_id.clone(), params);
            step_order.push(step_id);
        }

        if !steps.contains_key(&initial_step_id) {
            return Err(FlowError::Config(format!(
                "initial step '{}' is not defined under 'steps'",
                initial_step_id
            )));
        }

        // Every dependent must reference a defined step.
        for (step_id, params) in &steps {
            for dep in &params.dependents {
                if !steps.contains_key(dep) {
                    return Err(FlowError::Config(format!(
                        "step '{}' lists unknown dependent '{}'",
                        step_id, dep
                    )));
                }
            }
        }

        let graph = Self {
            initial_step_id,
            steps,
            step_order,
        };

        // A cycle would make the BFS miss its own members; reject any
        // graph where a reachable step can reach itself.
        graph.check_acyclic()?;

        debug!("Step graph loaded: {:?}", graph.topological_step_ids());

        Ok(graph)
    }

    /// Validates a step ID: non-empty and free of the reserved
    /// artifact-name separator.
    fn validate_step_id(step_id: &str) -> Result<()> {
        if step_id.trim().is_empty() {
            return Err(FlowError::Config("step IDs must not be empty".to_string()));
        }
        if step_id.contains(RESERVED_SEPARATOR) {
            return Err(FlowError::Config(format!(
                "step ID '{}' contains the reserved separator '{}'",
                step_id, RESERVED_SEPARATOR
            )));
        }
        Ok(())
    }

    fn check_acyclic(&self) -> Result<()> {
        // DFS from the initial step with an on-stack set.
        let mut visiting = HashSet::new();
        let mut done = HashSet::new();

        fn visit(
            graph: &StepGraph,
            id: &str,
            visiting: &mut HashSet<String>,
            done: &mut HashSet<String>,
        ) -> Result<()> {
            if done.contains(id) {
                return Ok(());
            }
            if !visiting.insert(id.to_string()) {
                return Err(FlowError::Config(format!(
                    "step dependency cycle detected through '{}'",
                    id
                )));
            }
            if let Some(params) = graph.steps.get(id) {
                for dep in &params.dependents {
                    visit(graph, dep, visiting, done)?;
                }
            }
            visiting.remove(id);
            done.insert(id.to_string());
            Ok(())
        }

        visit(self, &self.initial_step_id, &mut visiting, &mut done)
    }

    /// ID of the designated initial step.
    pub fn initial_step_id(&self) -> &str {
        &self.initial_step_id
    }

    /// Parameters for the given step.
    pub fn step(&self, step_id: &str) -> Result<&StepParams> {
        self.steps
            .get(step_id)
            .ok_or_else(|| FlowError::StepNotFound(step_id.to_string()))
    }

    /// All defined step IDs in configuration order.
    pub fn step_ids(&self) -> &[String] {
        &self.step_order
    }

    /// Ordered dependents of the given step.
    pub fn dependents(&self, step_id: &str) -> Result<&[String]> {
        Ok(&self.step(step_id)?.dependents)
    }

    /// ID of the step that lists `step_id` as a dependent.
    ///
    /// Fails with [`FlowError::NoPredecessor`] for the initial step and
    /// [`FlowError::StepNotFound`] when no step lists `step_id`.
    pub fn previous_step(&self, step_id: &str) -> Result<&str> {
        if step_id == self.initial_step_id {
            return Err(FlowError::NoPredecessor(step_id.to_string()));
        }

        // Scan in configuration order so diamond-shaped graphs resolve
        // deterministically.
        for candidate in &self.step_order {
            if self.steps[candidate]
                .dependents
                .iter()
                .any(|d| d == step_id)
            {
                return Ok(candidate);
            }
        }

        Err(FlowError::StepNotFound(step_id.to_string()))
    }

    /// Step IDs reachable from the initial step, breadth-first along
    /// `dependents` edges. Each step appears exactly once even when it
    /// is reachable via multiple paths.
    pub fn topological_step_ids(&self) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut order = Vec::new();
        let mut queue = VecDeque::new();

        queue.push_back(self.initial_step_id.clone());
        visited.insert(self.initial_step_id.clone());

        while let Some(id) = queue.pop_front() {
            if let Some(params) = self.steps.get(&id) {
                for dep in &params.dependents {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
            order.push(id);
        }

        order
    }

    /// Subdirectory names a wave of the given step requires.
    ///
    /// Union, over "all" and the step's program, of directory names
    /// gated by boolean step flags. `completed` and `failed` are
    /// always required.
    pub fn required_subdirectories(&self, step_id: &str) -> Result<Vec<&'static str>> {
        let params = self.step(step_id)?;
        let mut dirs = vec!["completed", "failed"];

        match params.program {
            Program::Gaussian16 => {
                if params.attempt_restart {
                    dirs.push("rwf");
                }
            }
            Program::Gamess => {
                dirs.push("scratch");
            }
        }

        Ok(dirs)
    }
}
