// Execution context for one target: elevation and command rendering

use crate::inventory::Target;
use crate::modules::PackageManager;

/// How a command is elevated
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Elevation {
    None,
    Root,
    User(String),
}

impl Elevation {
    pub fn is_elevated(&self) -> bool {
        !matches!(self, Elevation::None)
    }
}

/// A command ready to hand to a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedCommand {
    /// What the target's shell executes
    pub command: String,
    /// Variables for the local process environment (empty for remote targets)
    pub env: Vec<(String, String)>,
    /// Operator-facing form for the `$ ...` echo line
    pub display: String,
}

/// Per-target state for one run
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub target: Target,
    /// Elevate every step unless a step says otherwise
    pub sudo: bool,
    /// User to run commands as (via sudo -u)
    pub sudo_user: Option<String>,
    /// Resolved package manager; `None` until detected
    pub package_manager: Option<PackageManager>,
}

impl ExecutionContext {
    pub fn new(target: Target) -> Self {
        ExecutionContext {
            target,
            sudo: false,
            sudo_user: None,
            package_manager: None,
        }
    }

    /// `sudo_user` implies `sudo`
    pub fn with_sudo(mut self, sudo: bool, sudo_user: Option<String>) -> Self {
        self.sudo = sudo || sudo_user.is_some();
        self.sudo_user = sudo_user;
        self
    }

    pub fn with_package_manager(mut self, manager: Option<PackageManager>) -> Self {
        self.package_manager = manager;
        self
    }

    /// Elevation for the run-wide settings
    pub fn default_elevation(&self) -> Elevation {
        match (self.sudo, &self.sudo_user) {
            (false, _) => Elevation::None,
            (true, Some(user)) => Elevation::User(user.clone()),
            (true, None) => Elevation::Root,
        }
    }

    /// Elevation for a step that carries its own `sudo=`/`sudo_user=` modifiers
    pub fn step_elevation(&self, sudo: Option<bool>, sudo_user: Option<&str>) -> Elevation {
        let user = sudo_user
            .map(String::from)
            .or_else(|| self.sudo_user.clone());

        let elevate = match (sudo, sudo_user) {
            (Some(flag), _) => flag,
            (None, Some(_)) => true,
            (None, None) => self.sudo,
        };

        match (elevate, user) {
            (false, _) => Elevation::None,
            (true, Some(user)) => Elevation::User(user),
            (true, None) => Elevation::Root,
        }
    }

    /// Build the final command for this target
    ///
    /// Remote targets get `export K=V;` prefixes in front of the command.
    /// Local targets get the variables as process environment, plus the
    /// prefixes when elevated since sudo resets the environment. Elevation
    /// wraps everything in `sudo [-u U -H] bash -lc '...'`.
    pub fn render(
        &self,
        command: &str,
        env: &[(String, String)],
        elevation: &Elevation,
    ) -> RenderedCommand {
        let exports = export_prefix(env);
        let inline_exports = !self.target.is_local() || elevation.is_elevated();

        let body = if inline_exports && !exports.is_empty() {
            format!("{} {}", exports, command)
        } else {
            command.to_string()
        };

        let final_command = wrap_elevation(&body, elevation);

        let display = match elevation {
            Elevation::None => command.to_string(),
            Elevation::Root => format!("(sudo) {}", command),
            Elevation::User(user) => format!("(sudo -u {}) {}", user, command),
        };

        RenderedCommand {
            command: final_command,
            env: if self.target.is_local() {
                env.to_vec()
            } else {
                Vec::new()
            },
            display,
        }
    }
}

/// `export K='V'; export K2='V2';`
pub fn export_prefix(env: &[(String, String)]) -> String {
    env.iter()
        .map(|(k, v)| format!("export {}={};", k, shell_quote(v)))
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn wrap_elevation(command: &str, elevation: &Elevation) -> String {
    match elevation {
        Elevation::None => command.to_string(),
        Elevation::Root => format!("sudo bash -lc {}", shell_quote(command)),
        Elevation::User(user) => format!(
            "sudo -u {} -H bash -lc {}",
            shell_quote(user),
            shell_quote(command)
        ),
    }
}

/// Single-quote `s` for a POSIX shell
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}
