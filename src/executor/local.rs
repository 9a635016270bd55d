// Local command execution without SSH

use async_trait::async_trait;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{CommandResult, Connection, RenderedCommand};
use crate::inventory::Target;
use crate::output::errors::PfError;
use crate::output::multiplex::{HostSink, LineBuffer, Stream};

/// How long output may keep arriving after the command itself exited.
/// Background jobs that inherit the pipes would otherwise hold the step open.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// Local connection for executing commands on this machine
pub struct LocalConnection {
    target: Target,
}

impl LocalConnection {
    pub fn new() -> Self {
        LocalConnection {
            target: Target::Local,
        }
    }
}

impl Default for LocalConnection {
    fn default() -> Self {
        Self::new()
    }
}

fn spawn_error(e: std::io::Error) -> PfError {
    PfError::Io {
        message: format!("Failed to spawn local command: {}", e),
        path: None,
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PfError> {
        // Execute command using sh -c
        let output = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .output()
            .await
            .map_err(spawn_error)?;

        Ok(CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    async fn exec_streaming(
        &self,
        cmd: &RenderedCommand,
        sink: &HostSink,
        cancel: &CancellationToken,
    ) -> Result<i32, PfError> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&cmd.command)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_error)?;

        let stdout_task = child
            .stdout
            .take()
            .map(|out| tokio::spawn(forward_lines(out, sink.clone(), Stream::Stdout)));
        let stderr_task = child
            .stderr
            .take()
            .map(|err| tokio::spawn(forward_lines(err, sink.clone(), Stream::Stderr)));

        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = cancel.cancelled() => None,
        };

        let status = match finished {
            Some(status) => status.map_err(|e| PfError::Io {
                message: format!("Failed to wait for command: {}", e),
                path: None,
            })?,
            None => {
                debug!(command = %cmd.display, "killing local command");
                let _ = child.start_kill();
                let _ = child.wait().await;
                for task in [stdout_task, stderr_task].into_iter().flatten() {
                    task.abort();
                }
                return Err(PfError::Cancelled {
                    operation: cmd.display.clone(),
                });
            }
        };

        // Drain whatever the pipes still hold before reporting the status
        let readers: Vec<_> = [stdout_task, stderr_task].into_iter().flatten().collect();
        let aborts: Vec<_> = readers.iter().map(|task| task.abort_handle()).collect();
        let drained = tokio::select! {
            _ = futures::future::join_all(readers) => true,
            _ = tokio::time::sleep(DRAIN_GRACE) => false,
            _ = cancel.cancelled() => false,
        };
        if !drained {
            debug!(command = %cmd.display, "output still open after exit, detaching");
            for handle in aborts {
                handle.abort();
            }
        }

        Ok(status.code().unwrap_or(-1))
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PfError> {
        if cancel.is_cancelled() {
            return Err(PfError::Cancelled {
                operation: format!("upload {}", remote),
            });
        }

        let dest = Path::new(remote);
        if let Some(parent) = dest.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| PfError::Io {
                    message: format!("Failed to create directory: {}", e),
                    path: Some(parent.to_path_buf()),
                })?;
        }

        let copied = tokio::select! {
            res = tokio::fs::copy(local, dest) => Some(res),
            _ = cancel.cancelled() => None,
        };

        match copied {
            Some(res) => res.map(|_| ()).map_err(|e| PfError::Io {
                message: format!("Failed to copy {}: {}", local.display(), e),
                path: Some(dest.to_path_buf()),
            }),
            None => Err(PfError::Cancelled {
                operation: format!("upload {}", remote),
            }),
        }
    }

    fn target(&self) -> &Target {
        &self.target
    }
}

async fn forward_lines<R>(mut reader: R, sink: HostSink, stream: Stream)
where
    R: AsyncRead + Unpin,
{
    let mut lines = LineBuffer::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in lines.push(&chunk[..n]) {
                    sink.line(stream, line);
                }
            }
        }
    }
    if let Some(rest) = lines.finish() {
        sink.line(stream, rest);
    }
}
