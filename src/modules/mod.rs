// Built-in step modules for pf

mod file;
mod package;
mod service;
mod shell;

pub use file::{directory_command, ownership_command};
pub use package::package_command;
pub use service::service_command;

use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::executor::{Connection, Elevation, ExecutionContext};
use crate::output::errors::PfError;
use crate::output::multiplex::{HostSink, MarkerKind};
use crate::parser::ast::StepKind;
use crate::runtime::ResolvedStep;

/// The connection, output sink and cancellation token a step runs with
#[derive(Clone, Copy)]
pub struct StepIo<'a> {
    pub conn: &'a dyn Connection,
    pub sink: &'a HostSink,
    pub cancel: &'a CancellationToken,
}

/// Module executor that dispatches to the appropriate module
#[derive(Debug, Clone, Default)]
pub struct ModuleExecutor {
    package_manager: PackageManagerSetting,
}

impl ModuleExecutor {
    pub fn new(package_manager: PackageManagerSetting) -> Self {
        ModuleExecutor { package_manager }
    }

    /// Package manager fixed by configuration, if any
    pub fn configured_package_manager(&self) -> Option<PackageManager> {
        match self.package_manager {
            PackageManagerSetting::Fixed(manager) => Some(manager),
            PackageManagerSetting::Auto => None,
        }
    }

    /// Run one resolved step; returns the exit status of its command
    ///
    /// `describe` and `env` steps touch nothing and report 0.
    pub async fn execute(
        &self,
        step: &ResolvedStep,
        ctx: &mut ExecutionContext,
        io: StepIo<'_>,
    ) -> Result<i32, PfError> {
        let env = step.env.as_slice();

        match &step.step.kind {
            StepKind::ShellCommand {
                command,
                sudo,
                sudo_user,
            } => shell::execute(ctx, io, env, command, *sudo, sudo_user.as_deref()).await,

            StepKind::PackagesInstall { packages } => {
                let manager = self.package_manager_for(ctx, io.conn).await?;
                let cmd = package_command(manager, true, packages);
                run_command(ctx, io, env, &cmd, &ctx.default_elevation()).await
            }

            StepKind::PackagesRemove { packages } => {
                let manager = self.package_manager_for(ctx, io.conn).await?;
                let cmd = package_command(manager, false, packages);
                run_command(ctx, io, env, &cmd, &ctx.default_elevation()).await
            }

            StepKind::ServiceAction { action, name } => {
                let cmd = service_command(*action, name);
                run_command(ctx, io, env, &cmd, &ctx.default_elevation()).await
            }

            StepKind::DirectoryEnsure { path, mode } => {
                file::check_mode(mode.as_deref(), step.step.line)?;
                let cmd = directory_command(path, mode.as_deref());
                run_command(ctx, io, env, &cmd, &ctx.default_elevation()).await
            }

            StepKind::CopyFile {
                local,
                remote,
                mode,
                user,
                group,
            } => {
                file::check_mode(mode.as_deref(), step.step.line)?;
                file::copy(
                    ctx,
                    io,
                    env,
                    file::CopySpec {
                        local,
                        remote,
                        mode: mode.as_deref(),
                        user: user.as_deref(),
                        group: group.as_deref(),
                    },
                )
                .await
            }

            StepKind::Describe { .. } | StepKind::EnvSet { .. } => Ok(0),
        }
    }

    /// The target's package manager, detecting and caching it when set to auto
    async fn package_manager_for(
        &self,
        ctx: &mut ExecutionContext,
        conn: &dyn Connection,
    ) -> Result<PackageManager, PfError> {
        if let Some(manager) = ctx.package_manager {
            return Ok(manager);
        }

        let manager = match self.package_manager {
            PackageManagerSetting::Fixed(manager) => manager,
            PackageManagerSetting::Auto => detect_package_manager(conn).await?,
        };
        debug!(target = %ctx.target, manager = manager.as_str(), "package manager selected");
        ctx.package_manager = Some(manager);
        Ok(manager)
    }
}

/// Render `command` for the target, echo it, and stream it
pub(crate) async fn run_command(
    ctx: &ExecutionContext,
    io: StepIo<'_>,
    env: &[(String, String)],
    command: &str,
    elevation: &Elevation,
) -> Result<i32, PfError> {
    let rendered = ctx.render(command, env, elevation);
    io.sink.marker(MarkerKind::Command, rendered.display.as_str());
    debug!(target = %ctx.target, command = %rendered.command, "dispatching");
    io.conn.exec_streaming(&rendered, io.sink, io.cancel).await
}

/// Detect the package manager on a system
pub async fn detect_package_manager(conn: &dyn Connection) -> Result<PackageManager, PfError> {
    let checks = [
        ("which dnf 2>/dev/null", PackageManager::Dnf),
        ("which yum 2>/dev/null", PackageManager::Yum),
        ("which apt-get 2>/dev/null", PackageManager::Apt),
        ("which zypper 2>/dev/null", PackageManager::Zypper),
        ("which pacman 2>/dev/null", PackageManager::Pacman),
        ("which apk 2>/dev/null", PackageManager::Apk),
    ];

    for (cmd, manager) in checks {
        let result = conn.exec(cmd).await?;
        if result.success() && !result.stdout.trim().is_empty() {
            return Ok(manager);
        }
    }

    Err(PfError::Io {
        message: format!(
            "Could not detect a package manager on {}",
            conn.target()
        ),
        path: None,
    })
}

/// Supported package managers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dnf,
    Yum,
    Apt,
    Zypper,
    Pacman,
    Apk,
}

impl PackageManager {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "dnf" => Some(PackageManager::Dnf),
            "yum" => Some(PackageManager::Yum),
            "apt" | "apt-get" => Some(PackageManager::Apt),
            "zypper" => Some(PackageManager::Zypper),
            "pacman" => Some(PackageManager::Pacman),
            "apk" => Some(PackageManager::Apk),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apt => "apt",
            PackageManager::Zypper => "zypper",
            PackageManager::Pacman => "pacman",
            PackageManager::Apk => "apk",
        }
    }

    pub fn install_cmd(&self, packages: &str) -> String {
        match self {
            PackageManager::Dnf => format!("dnf install -y {}", packages),
            PackageManager::Yum => format!("yum install -y {}", packages),
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get install -y {}",
                packages
            ),
            PackageManager::Zypper => format!("zypper --non-interactive install {}", packages),
            PackageManager::Pacman => format!("pacman -S --noconfirm {}", packages),
            PackageManager::Apk => format!("apk add {}", packages),
        }
    }

    pub fn remove_cmd(&self, packages: &str) -> String {
        match self {
            PackageManager::Dnf => format!("dnf remove -y {}", packages),
            PackageManager::Yum => format!("yum remove -y {}", packages),
            PackageManager::Apt => format!(
                "DEBIAN_FRONTEND=noninteractive apt-get remove -y {}",
                packages
            ),
            PackageManager::Zypper => format!("zypper --non-interactive remove {}", packages),
            PackageManager::Pacman => format!("pacman -R --noconfirm {}", packages),
            PackageManager::Apk => format!("apk del {}", packages),
        }
    }
}

/// `package_manager:` in pf.yaml: a fixed manager or `auto`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PackageManagerSetting {
    Fixed(PackageManager),
    Auto,
}

impl Default for PackageManagerSetting {
    fn default() -> Self {
        PackageManagerSetting::Fixed(PackageManager::Apt)
    }
}

impl TryFrom<String> for PackageManagerSetting {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim().to_lowercase();
        if value == "auto" {
            return Ok(PackageManagerSetting::Auto);
        }
        PackageManager::parse(&value)
            .map(PackageManagerSetting::Fixed)
            .ok_or_else(|| {
                format!(
                    "unknown package manager '{}' (expected apt, dnf, yum, zypper, pacman, apk or auto)",
                    value
                )
            })
    }
}
