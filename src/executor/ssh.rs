// SSH connections: libssh2 sessions driven from blocking worker threads

use async_trait::async_trait;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ssh2::{Channel, KeyboardInteractivePrompt, Session};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CommandResult, Connection, RenderedCommand};
use crate::config::SshSettings;
use crate::inventory::Target;
use crate::output::errors::PfError;
use crate::output::multiplex::{HostSink, LineBuffer, Stream};

/// Authentication and timeout settings shared by all SSH targets
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub private_key: Option<PathBuf>,
    pub password: Option<String>,
    pub connect_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        SshOptions {
            private_key: None,
            password: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl SshOptions {
    pub fn from_settings(settings: &SshSettings) -> Self {
        SshOptions {
            private_key: settings.private_key_path(),
            password: settings.password.clone(),
            connect_timeout: settings.connect_timeout(),
        }
    }
}

/// An authenticated session to one remote target
pub struct SshConnection {
    target: Target,
    label: String,
    session: Session,
}

impl SshConnection {
    /// Connect and authenticate without blocking the runtime
    pub async fn connect(target: Target, options: SshOptions) -> Result<Self, PfError> {
        let label = target.label();
        let session = {
            let target = target.clone();
            tokio::task::spawn_blocking(move || open_session(&target, &options))
                .await
                .map_err(|e| join_error(&label, e))??
        };

        debug!(target = %label, "ssh session established");
        Ok(SshConnection {
            target,
            label,
            session,
        })
    }
}

fn join_error(label: &str, e: tokio::task::JoinError) -> PfError {
    PfError::Ssh {
        host: label.to_string(),
        message: format!("SSH worker failed: {}", e),
        suggestion: None,
    }
}

fn open_session(target: &Target, options: &SshOptions) -> Result<Session, PfError> {
    let (user, host, port) = match target {
        Target::Remote { user, host, port } => (user, host, *port),
        Target::Local => {
            return Err(PfError::Ssh {
                host: target.label(),
                message: "Local target has no SSH endpoint".to_string(),
                suggestion: None,
            })
        }
    };
    let label = target.label();

    let address = (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| PfError::Ssh {
            host: label.clone(),
            message: format!("Cannot resolve {}: {}", host, e),
            suggestion: Some("Check the host name or use an IP address".to_string()),
        })?
        .next()
        .ok_or_else(|| PfError::Ssh {
            host: label.clone(),
            message: format!("No address found for {}", host),
            suggestion: None,
        })?;

    // TCP connection with timeout
    let tcp = TcpStream::connect_timeout(&address, options.connect_timeout).map_err(|e| {
        PfError::Ssh {
            host: label.clone(),
            message: format!("Connection failed: {}", e),
            suggestion: ssh_connection_suggestion(&e),
        }
    })?;

    let mut session = Session::new().map_err(|e| PfError::Ssh {
        host: label.clone(),
        message: format!("Failed to create SSH session: {}", e),
        suggestion: None,
    })?;

    session.set_tcp_stream(tcp);
    session.set_timeout(options.connect_timeout.as_millis() as u32);

    session.handshake().map_err(|e| PfError::Ssh {
        host: label.clone(),
        message: format!("SSH handshake failed: {}", e),
        suggestion: Some("Check SSH service is running on the target".to_string()),
    })?;

    if !authenticate(&session, user, options) {
        return Err(PfError::Ssh {
            host: label,
            message: "Authentication failed".to_string(),
            suggestion: Some(
                "Add your key to ssh-agent, or set ssh.private_key / ssh.password in pf.yaml"
                    .to_string(),
            ),
        });
    }

    // Commands may run for as long as they like; step timeouts are enforced above
    session.set_timeout(0);
    Ok(session)
}

/// Agent identities, then key files, then password / keyboard-interactive
fn authenticate(session: &Session, user: &str, options: &SshOptions) -> bool {
    if let Ok(mut agent) = session.agent() {
        if agent.connect().is_ok() {
            agent.list_identities().ok();
            for identity in agent.identities().unwrap_or_default() {
                if agent.userauth(user, &identity).is_ok() {
                    return true;
                }
            }
        }
    }

    let home = std::env::var("HOME").ok().map(PathBuf::from);
    let key_paths = options.private_key.iter().cloned().chain(
        [".ssh/id_ed25519", ".ssh/id_rsa"]
            .iter()
            .filter_map(|rel| home.as_ref().map(|h| h.join(rel))),
    );

    for key_path in key_paths {
        if key_path.exists()
            && session
                .userauth_pubkey_file(user, None, &key_path, None)
                .is_ok()
        {
            return true;
        }
    }

    if let Some(ref password) = options.password {
        if session.userauth_password(user, password).is_ok() {
            return true;
        }
        // Fall back to keyboard-interactive auth (used by some PAM configurations)
        let mut prompter = PasswordPrompter(password.clone());
        if session
            .userauth_keyboard_interactive(user, &mut prompter)
            .is_ok()
        {
            return true;
        }
    }

    session.authenticated()
}

fn open_channel(session: &Session, label: &str) -> Result<Channel, PfError> {
    session.channel_session().map_err(|e| PfError::Ssh {
        host: label.to_string(),
        message: format!("Failed to open channel: {}", e),
        suggestion: None,
    })
}

fn exec_error(label: &str, e: ssh2::Error) -> PfError {
    PfError::Ssh {
        host: label.to_string(),
        message: format!("Failed to execute command: {}", e),
        suggestion: None,
    }
}

fn run_captured(session: &Session, label: &str, command: &str) -> Result<CommandResult, PfError> {
    let mut channel = open_channel(session, label)?;
    channel.exec(command).map_err(|e| exec_error(label, e))?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    channel.read_to_string(&mut stdout).ok();
    channel.stderr().read_to_string(&mut stderr).ok();

    channel.wait_close().ok();
    let exit_code = channel.exit_status().unwrap_or(-1);

    Ok(CommandResult {
        stdout,
        stderr,
        exit_code,
    })
}

enum StreamEnd {
    Finished,
    Cancelled,
    Broken(std::io::Error),
}

/// Run `command` on a PTY, forwarding lines to `sink` until EOF or cancel
///
/// Closing the channel on cancel hangs up the PTY, which delivers SIGHUP to
/// the remote process group.
fn run_streaming(
    session: &Session,
    label: &str,
    command: &str,
    sink: &HostSink,
    cancel: &CancellationToken,
) -> Result<i32, PfError> {
    let mut channel = open_channel(session, label)?;
    channel
        .request_pty("xterm", None, None)
        .map_err(|e| exec_error(label, e))?;
    channel.exec(command).map_err(|e| exec_error(label, e))?;

    session.set_blocking(false);

    let mut buf = [0u8; 4096];
    let mut stdout_lines = LineBuffer::new();
    let mut stderr_lines = LineBuffer::new();

    let end = loop {
        if cancel.is_cancelled() {
            break StreamEnd::Cancelled;
        }

        let mut activity = false;

        match channel.read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in stdout_lines.push(&buf[..n]) {
                    sink.line(Stream::Stdout, line);
                }
                activity = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => break StreamEnd::Broken(e),
        }

        match channel.stderr().read(&mut buf) {
            Ok(0) => {}
            Ok(n) => {
                for line in stderr_lines.push(&buf[..n]) {
                    sink.line(Stream::Stderr, line);
                }
                activity = true;
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(e) => break StreamEnd::Broken(e),
        }

        if channel.eof() {
            break StreamEnd::Finished;
        }

        if !activity {
            std::thread::sleep(Duration::from_millis(10));
        }
    };

    session.set_blocking(true);

    if let Some(rest) = stdout_lines.finish() {
        sink.line(Stream::Stdout, rest);
    }
    if let Some(rest) = stderr_lines.finish() {
        sink.line(Stream::Stderr, rest);
    }

    match end {
        StreamEnd::Finished => {
            channel.wait_close().ok();
            Ok(channel.exit_status().unwrap_or(-1))
        }
        StreamEnd::Cancelled => {
            debug!(target = %label, "closing remote channel");
            if let Err(e) = channel.close() {
                warn!(target = %label, error = %e, "failed to close remote channel");
            }
            Err(PfError::Cancelled {
                operation: command.to_string(),
            })
        }
        StreamEnd::Broken(e) => Err(PfError::Ssh {
            host: label.to_string(),
            message: format!("Lost connection while reading output: {}", e),
            suggestion: None,
        }),
    }
}

const UPLOAD_CHUNK: usize = 32 * 1024;

fn upload(
    session: &Session,
    label: &str,
    local: &Path,
    remote: &str,
    cancel: &CancellationToken,
) -> Result<(), PfError> {
    let sftp = session.sftp().map_err(|e| PfError::Ssh {
        host: label.to_string(),
        message: format!("Failed to open SFTP: {}", e),
        suggestion: None,
    })?;

    let content = std::fs::read(local).map_err(|e| PfError::Io {
        message: format!("Failed to read local file: {}", e),
        path: Some(local.to_path_buf()),
    })?;

    let mut remote_file = sftp
        .create(Path::new(remote))
        .map_err(|e| PfError::Ssh {
            host: label.to_string(),
            message: format!("Failed to create remote file {}: {}", remote, e),
            suggestion: None,
        })?;

    write_chunks(&mut remote_file, &content, cancel).map_err(|e| match e {
        ChunkError::Cancelled => PfError::Cancelled {
            operation: format!("upload {}", remote),
        },
        ChunkError::Io(e) => PfError::Ssh {
            host: label.to_string(),
            message: format!("Failed to write remote file {}: {}", remote, e),
            suggestion: None,
        },
    })
}

enum ChunkError {
    Cancelled,
    Io(std::io::Error),
}

fn write_chunks<W: Write>(
    dst: &mut W,
    content: &[u8],
    cancel: &CancellationToken,
) -> Result<(), ChunkError> {
    for chunk in content.chunks(UPLOAD_CHUNK) {
        if cancel.is_cancelled() {
            return Err(ChunkError::Cancelled);
        }
        dst.write_all(chunk).map_err(ChunkError::Io)?;
    }
    dst.flush().map_err(ChunkError::Io)
}

#[async_trait]
impl Connection for SshConnection {
    async fn exec(&self, cmd: &str) -> Result<CommandResult, PfError> {
        let session = self.session.clone();
        let label = self.label.clone();
        let cmd = cmd.to_string();
        tokio::task::spawn_blocking(move || run_captured(&session, &label, &cmd))
            .await
            .map_err(|e| join_error(&self.label, e))?
    }

    async fn exec_streaming(
        &self,
        cmd: &RenderedCommand,
        sink: &HostSink,
        cancel: &CancellationToken,
    ) -> Result<i32, PfError> {
        let session = self.session.clone();
        let label = self.label.clone();
        let command = cmd.command.clone();
        let sink = sink.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || {
            run_streaming(&session, &label, &command, &sink, &cancel)
        })
        .await
        .map_err(|e| join_error(&self.label, e))?
    }

    async fn upload_file(
        &self,
        local: &Path,
        remote: &str,
        cancel: &CancellationToken,
    ) -> Result<(), PfError> {
        let session = self.session.clone();
        let label = self.label.clone();
        let local = local.to_path_buf();
        let remote = remote.to_string();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || upload(&session, &label, &local, &remote, &cancel))
            .await
            .map_err(|e| join_error(&self.label, e))?
    }

    fn target(&self) -> &Target {
        &self.target
    }
}

fn ssh_connection_suggestion(e: &std::io::Error) -> Option<String> {
    match e.kind() {
        std::io::ErrorKind::ConnectionRefused => {
            Some("Ensure SSH service is running on the target host".to_string())
        }
        std::io::ErrorKind::TimedOut => {
            Some("Check network connectivity and firewall rules".to_string())
        }
        std::io::ErrorKind::PermissionDenied => {
            Some("Check SSH key permissions and authentication".to_string())
        }
        _ => None,
    }
}

/// Helper for keyboard-interactive authentication
struct PasswordPrompter(String);

impl KeyboardInteractivePrompt for PasswordPrompter {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[ssh2::Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.0.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_settings() {
        let settings = SshSettings {
            private_key: Some("/keys/id".to_string()),
            password: Some("secret".to_string()),
            connect_timeout: 7,
        };
        let options = SshOptions::from_settings(&settings);
        assert_eq!(options.private_key, Some(PathBuf::from("/keys/id")));
        assert_eq!(options.connect_timeout, Duration::from_secs(7));
    }

    #[tokio::test]
    async fn test_connect_refused_is_ssh_error() {
        // Port 1 on loopback is closed on any sane test machine
        let target = Target::remote("nobody", "127.0.0.1", 1);
        let options = SshOptions {
            connect_timeout: Duration::from_secs(2),
            ..SshOptions::default()
        };

        match SshConnection::connect(target, options).await {
            Err(PfError::Ssh { host, .. }) => assert_eq!(host, "nobody@127.0.0.1:1"),
            Err(other) => panic!("expected ssh error, got {:?}", other),
            Ok(_) => panic!("connection to a closed port succeeded"),
        }
    }

    #[test]
    fn test_refused_has_suggestion() {
        let e = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(ssh_connection_suggestion(&e).is_some());
    }

    /// Fires the token once the first chunk has been written
    struct CancelAfterFirst {
        written: Vec<u8>,
        cancel: CancellationToken,
    }

    impl Write for CancelAfterFirst {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.written.extend_from_slice(buf);
            self.cancel.cancel();
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_upload_stops_between_chunks_on_interrupt() {
        let content = vec![b'x'; UPLOAD_CHUNK * 3];
        let cancel = CancellationToken::new();
        let mut dst = CancelAfterFirst {
            written: Vec::new(),
            cancel: cancel.clone(),
        };

        let result = write_chunks(&mut dst, &content, &cancel);
        assert!(matches!(result, Err(ChunkError::Cancelled)));
        assert_eq!(dst.written.len(), UPLOAD_CHUNK);
    }

    #[test]
    fn test_upload_writes_everything_when_not_interrupted() {
        let content = vec![b'y'; UPLOAD_CHUNK * 2 + 17];
        let mut dst = Vec::new();

        assert!(write_chunks(&mut dst, &content, &CancellationToken::new()).is_ok());
        assert_eq!(dst, content);
    }
}
