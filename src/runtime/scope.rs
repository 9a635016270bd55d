// Scope layering and single-pass interpolation for step arguments

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};

use crate::parser::ast::{Step, StepKind, TaskDefinition};

static VAR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)").unwrap()
});

/// Key/value layers consulted during interpolation, highest precedence first:
/// task parameters, then `env` lines seen so far, then the process environment.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    params: HashMap<String, String>,
    /// Task `env` assignments in first-assignment order
    task_env: Vec<(String, String)>,
    process: HashMap<String, String>,
}

impl Scope {
    pub fn new(params: HashMap<String, String>, process: HashMap<String, String>) -> Self {
        Scope {
            params,
            task_env: Vec::new(),
            process,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.params
            .get(name)
            .or_else(|| {
                self.task_env
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v)
            })
            .or_else(|| self.process.get(name))
            .map(|s| s.as_str())
    }

    /// Record an `env` assignment; a repeated key keeps its slot, new value
    pub fn set_env(&mut self, key: &str, value: String) {
        match self.task_env.iter_mut().find(|(k, _)| k == key) {
            Some(slot) => slot.1 = value,
            None => self.task_env.push((key.to_string(), value)),
        }
    }

    /// Assignments from `env` lines active at this point
    pub fn task_env(&self) -> &[(String, String)] {
        &self.task_env
    }
}

/// Replace `$NAME` and `${NAME}` with values from `scope`
///
/// Unknown names become the empty string. Substituted values are not
/// scanned again.
pub fn interpolate(text: &str, scope: &Scope) -> String {
    VAR_RE
        .replace_all(text, |caps: &Captures| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            scope.get(name).unwrap_or_default().to_string()
        })
        .into_owned()
}

/// A task with every step's arguments interpolated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTask {
    pub name: String,
    pub steps: Vec<ResolvedStep>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    pub step: Step,
    /// `env` assignments active when this step runs, for export on remote targets
    pub env: Vec<(String, String)>,
}

impl ResolvedStep {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Resolve every step of `task` in order
///
/// `params` are the invocation's task parameters; they override the task's
/// declared defaults. An `env` line only affects the steps after it.
pub fn resolve_task(
    task: &TaskDefinition,
    params: &HashMap<String, String>,
    process: &HashMap<String, String>,
) -> ResolvedTask {
    let mut merged: HashMap<String, String> = task.params.iter().cloned().collect();
    merged.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

    let mut scope = Scope::new(merged, process.clone());
    let mut steps = Vec::with_capacity(task.steps.len());

    for step in &task.steps {
        let kind = match &step.kind {
            StepKind::EnvSet { assignments } => {
                let mut resolved = Vec::with_capacity(assignments.len());
                for (key, value) in assignments {
                    let value = interpolate(value, &scope);
                    scope.set_env(key, value.clone());
                    resolved.push((key.clone(), value));
                }
                StepKind::EnvSet {
                    assignments: resolved,
                }
            }
            other => other.map_args(|arg| interpolate(arg, &scope)),
        };

        steps.push(ResolvedStep {
            step: Step {
                kind,
                line: step.line,
            },
            env: scope.task_env().to_vec(),
        });
    }

    ResolvedTask {
        name: task.name.clone(),
        steps,
    }
}
