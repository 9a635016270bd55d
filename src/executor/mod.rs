// Executor module - runs resolved tasks against targets

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::SshSettings;
use crate::inventory::Target;
use crate::output::errors::PfError;
use crate::output::multiplex::HostSink;

pub mod context;
pub mod local;
pub mod scheduler;
pub mod ssh;

pub use context::{Elevation, ExecutionContext, RenderedCommand};
pub use local::LocalConnection;
pub use scheduler::{Invocation, Scheduler, SchedulerConfig};
pub use ssh::{SshConnection, SshOptions};

/// Common trait for all connection types (SSH, local, etc.)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a command and capture its output
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PfError>;

    /// Execute a command, streaming each output line to `sink`
    ///
    /// Returns the exit status. When `cancel` fires the command is terminated
    /// and `PfError::Cancelled` is returned.
    async fn exec_streaming(
        &self,
        cmd: &RenderedCommand,
        sink: &HostSink,
        cancel: &CancellationToken,
    ) -> Result<i32, PfError>;

    /// Copy a local file to `remote` on the target
    ///
    /// Stops with `PfError::Cancelled` once `cancel` fires.
    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PfError>;

    /// The target this connection reaches
    fn target(&self) -> &Target;
}

/// Opens connections for targets
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn Connection>, PfError>;
}

/// Local targets get a [`LocalConnection`], remote ones an [`SshConnection`]
#[derive(Debug, Clone, Default)]
pub struct DefaultConnector {
    options: SshOptions,
}

impl DefaultConnector {
    pub fn new(settings: &SshSettings) -> Self {
        DefaultConnector {
            options: SshOptions::from_settings(settings),
        }
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnector {
    async fn connect(&self, target: &Target) -> Result<Arc<dyn Connection>, PfError> {
        match target {
            Target::Local => Ok(Arc::new(LocalConnection::new())),
            Target::Remote { .. } => {
                let conn = SshConnection::connect(target.clone(), self.options.clone()).await?;
                Ok(Arc::new(conn))
            }
        }
    }
}

/// Result of executing a command
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}
