// Tasks that ship with pf, and the task file used when none is found

use std::path::{Path, PathBuf};

use tracing::debug;

use super::ast::{Catalog, TaskDefinition};
use super::dsl::parse_document;
use crate::output::errors::PfError;

/// `source` recorded on built-in task definitions
pub const BUILTIN_ORIGIN: &str = "<builtin>";

/// `source` recorded on tasks from the embedded task file
pub const EMBEDDED_ORIGIN: &str = "<embedded>";

const BUILTIN_TASKS: &str = r#"
task update
  describe Refresh package metadata via the system setup script
  shell ./scripts/system-setup.sh update
end

task upgrade
  describe Upgrade installed packages via the system setup script
  shell ./scripts/system-setup.sh upgrade
end

task install-base
  describe Install the base toolchain via the system setup script
  shell ./scripts/system-setup.sh install-base
end

task setup-venv
  describe Create the Python virtualenv via the system setup script
  shell ./scripts/system-setup.sh setup-venv
end

task reboot
  describe Reboot the host in one minute
  shell sudo shutdown -r +1 'pf reboot requested'
end

task podman_install
  describe Install podman and enable the user socket
  packages install podman
  shell sudo usermod -aG podman "$(id -un)" || true
  shell systemctl --user enable podman.socket || true
end

task docker_compat
  describe Make podman answer to docker
  packages install podman-docker
  shell sudo touch /etc/containers/nodocker
end

task nginx_install
  describe Install, enable and start nginx
  packages install nginx
  service enable nginx
  service start nginx
end
"#;

const EMBEDDED_PFYFILE: &str = r#"
task include_demo
  describe Shows that pf works even without a Pfyfile.pf
  shell echo "Include demo task ran."
end
"#;

impl TaskDefinition {
    pub fn is_builtin(&self) -> bool {
        self.source == Path::new(BUILTIN_ORIGIN)
    }
}

fn parse_fixed(source: &str, origin: &str) -> Result<Vec<TaskDefinition>, PfError> {
    let origin = PathBuf::from(origin);
    let doc = parse_document(source).map_err(|mut err| {
        err.file = Some(origin.clone());
        PfError::from(err)
    })?;

    Ok(doc
        .tasks
        .into_iter()
        .map(|mut task| {
            task.source = origin.clone();
            task
        })
        .collect())
}

/// The built-in task definitions, in listing order
pub fn builtin_tasks() -> Result<Vec<TaskDefinition>, PfError> {
    parse_fixed(BUILTIN_TASKS, BUILTIN_ORIGIN)
}

/// Catalog used when no task file exists
pub fn embedded_catalog() -> Result<Catalog, PfError> {
    let mut catalog = Catalog::new();
    for task in parse_fixed(EMBEDDED_PFYFILE, EMBEDDED_ORIGIN)? {
        let (name, line) = (task.name.clone(), task.line);
        catalog.insert(task).map_err(|existing| PfError::DuplicateTask {
            name,
            first: existing.source.clone(),
            first_line: existing.line,
            second: PathBuf::from(EMBEDDED_ORIGIN),
            second_line: line,
        })?;
    }
    Ok(catalog)
}

impl Catalog {
    /// Add the built-in tasks underneath the loaded ones
    ///
    /// A task file may define a task with a built-in's name; its definition
    /// is kept and the built-in is skipped.
    pub fn with_builtins(mut self) -> Result<Catalog, PfError> {
        for task in builtin_tasks()? {
            if self.contains(&task.name) {
                debug!(task = %task.name, "task file overrides built-in");
                continue;
            }
            // Cannot clash: presence was checked above
            let _ = self.insert(task);
        }
        Ok(self)
    }

    /// Tasks that came from a task file or the embedded fallback
    pub fn user_tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks().filter(|task| !task.is_builtin())
    }

    /// Built-in tasks still visible in this catalog
    pub fn builtin_tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks().filter(|task| task.is_builtin())
    }
}
