// Document model for .pf task files

use std::path::{Path, PathBuf};

use indexmap::IndexMap;

/// A parsed .pf file before includes are expanded
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub tasks: Vec<TaskDefinition>,
    pub includes: Vec<IncludeDirective>,
}

/// Top-level `include <path>` directive, recorded but not expanded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeDirective {
    pub path: String,
    pub line: usize,
}

/// A named, ordered sequence of steps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub name: String,
    /// First `describe` line wins
    pub description: Option<String>,
    /// Default parameter values declared on the `task` line
    pub params: Vec<(String, String)>,
    pub steps: Vec<Step>,
    /// File the task was defined in (empty for in-memory sources)
    pub source: PathBuf,
    pub line: usize,
}

impl TaskDefinition {
    pub fn new(name: impl Into<String>, line: usize) -> Self {
        TaskDefinition {
            name: name.into(),
            description: None,
            params: Vec::new(),
            steps: Vec::new(),
            source: PathBuf::new(),
            line,
        }
    }
}

/// One DSL line inside a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    /// Line of the first physical line of the (possibly continued) step
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepKind {
    ShellCommand {
        command: String,
        sudo: Option<bool>,
        sudo_user: Option<String>,
    },
    PackagesInstall {
        packages: Vec<String>,
    },
    PackagesRemove {
        packages: Vec<String>,
    },
    ServiceAction {
        action: ServiceAction,
        name: String,
    },
    DirectoryEnsure {
        path: String,
        mode: Option<String>,
    },
    CopyFile {
        local: String,
        remote: String,
        mode: Option<String>,
        user: Option<String>,
        group: Option<String>,
    },
    Describe {
        text: String,
    },
    EnvSet {
        assignments: Vec<(String, String)>,
    },
}

impl StepKind {
    /// Steps that never touch a target
    pub fn is_directive(&self) -> bool {
        matches!(self, StepKind::Describe { .. } | StepKind::EnvSet { .. })
    }

    /// Apply `f` to every argument string the step carries
    pub fn map_args(&self, mut f: impl FnMut(&str) -> String) -> StepKind {
        fn opt(v: &Option<String>, f: &mut dyn FnMut(&str) -> String) -> Option<String> {
            v.as_deref().map(|s| f(s))
        }

        match self {
            StepKind::ShellCommand {
                command,
                sudo,
                sudo_user,
            } => StepKind::ShellCommand {
                command: f(command),
                sudo: *sudo,
                sudo_user: opt(sudo_user, &mut f),
            },
            StepKind::PackagesInstall { packages } => StepKind::PackagesInstall {
                packages: packages.iter().map(|p| f(p)).collect(),
            },
            StepKind::PackagesRemove { packages } => StepKind::PackagesRemove {
                packages: packages.iter().map(|p| f(p)).collect(),
            },
            StepKind::ServiceAction { action, name } => StepKind::ServiceAction {
                action: *action,
                name: f(name),
            },
            StepKind::DirectoryEnsure { path, mode } => StepKind::DirectoryEnsure {
                path: f(path),
                mode: opt(mode, &mut f),
            },
            StepKind::CopyFile {
                local,
                remote,
                mode,
                user,
                group,
            } => StepKind::CopyFile {
                local: f(local),
                remote: f(remote),
                mode: opt(mode, &mut f),
                user: opt(user, &mut f),
                group: opt(group, &mut f),
            },
            StepKind::Describe { text } => StepKind::Describe { text: f(text) },
            StepKind::EnvSet { assignments } => StepKind::EnvSet {
                assignments: assignments.iter().map(|(k, v)| (k.clone(), f(v))).collect(),
            },
        }
    }

    /// Short human label used in output and reports
    pub fn label(&self) -> String {
        match self {
            StepKind::ShellCommand { command, .. } => format!("shell {}", command),
            StepKind::PackagesInstall { packages } => {
                format!("packages install {}", packages.join(" "))
            }
            StepKind::PackagesRemove { packages } => {
                format!("packages remove {}", packages.join(" "))
            }
            StepKind::ServiceAction { action, name } => {
                format!("service {} {}", action.as_str(), name)
            }
            StepKind::DirectoryEnsure { path, .. } => format!("directory {}", path),
            StepKind::CopyFile { local, remote, .. } => format!("copy {} {}", local, remote),
            StepKind::Describe { text } => format!("describe {}", text),
            StepKind::EnvSet { assignments } => format!(
                "env {}",
                assignments
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
        }
    }
}

/// Init-system actions accepted by `service`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceAction {
    Start,
    Stop,
    Enable,
    Disable,
    Restart,
}

impl ServiceAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "start" => Some(ServiceAction::Start),
            "stop" => Some(ServiceAction::Stop),
            "enable" => Some(ServiceAction::Enable),
            "disable" => Some(ServiceAction::Disable),
            "restart" => Some(ServiceAction::Restart),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceAction::Start => "start",
            ServiceAction::Stop => "stop",
            ServiceAction::Enable => "enable",
            ServiceAction::Disable => "disable",
            ServiceAction::Restart => "restart",
        }
    }
}

/// Merged set of tasks from a root file and everything it includes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    tasks: IndexMap<String, TaskDefinition>,
    files: Vec<PathBuf>,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    /// Insert a task; returns the already-present definition on a name clash
    pub fn insert(&mut self, task: TaskDefinition) -> Result<(), Box<TaskDefinition>> {
        if let Some(existing) = self.tasks.get(&task.name) {
            return Err(Box::new(existing.clone()));
        }
        self.tasks.insert(task.name.clone(), task);
        Ok(())
    }

    pub(crate) fn record_file(&mut self, path: &Path) {
        self.files.push(path.to_path_buf());
    }

    pub fn get(&self, name: &str) -> Option<&TaskDefinition> {
        self.tasks.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }

    /// Find a task by exact name, else by normalized alias
    ///
    /// The alias of a name is its lowercase form with everything outside
    /// `[a-z0-9]` removed, so `nginx-install` and `nginxinstall` both find
    /// `nginx_install`.
    pub fn lookup(&self, name: &str) -> Option<&TaskDefinition> {
        if let Some(task) = self.tasks.get(name) {
            return Some(task);
        }
        let wanted = normalize_name(name);
        if wanted.is_empty() {
            return None;
        }
        self.tasks
            .values()
            .find(|task| normalize_name(&task.name) == wanted)
    }

    /// Up to three task names close to `name`, nearest first
    pub fn suggestions(&self, name: &str) -> Vec<String> {
        let wanted = normalize_name(name);
        let mut scored: Vec<(usize, &str)> = self
            .names()
            .filter_map(|candidate| {
                let normalized = normalize_name(candidate);
                let distance = super::dsl::edit_distance(&wanted, &normalized);
                let prefix = !wanted.is_empty()
                    && (normalized.starts_with(&wanted) || wanted.starts_with(&normalized));
                let limit = (normalized.len().max(wanted.len()) / 2).max(1);
                (prefix || distance <= limit).then_some((distance, candidate))
            })
            .collect();
        scored.sort_by_key(|(distance, _)| *distance);
        scored
            .into_iter()
            .take(3)
            .map(|(_, name)| name.to_string())
            .collect()
    }

    /// Tasks in load order (root file first, then includes depth-first)
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.values()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tasks.keys().map(|k| k.as_str())
    }

    /// Files that contributed to this catalog, in load order
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

fn normalize_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect()
}
