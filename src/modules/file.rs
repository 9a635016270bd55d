// File module - directories and file copies

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::debug;

use super::{run_command, StepIo};
use crate::executor::context::shell_quote;
use crate::executor::{Elevation, ExecutionContext};
use crate::output::errors::{ParseError, ParseErrorKind, PfError};
use crate::output::multiplex::MarkerKind;
use crate::parser::dsl::is_octal_mode;

/// Mode applied by `directory` when none is given
pub const DEFAULT_DIRECTORY_MODE: &str = "0755";

static UPLOAD_SEQ: AtomicUsize = AtomicUsize::new(0);

/// `mkdir -p` followed by `chmod`
pub fn directory_command(path: &str, mode: Option<&str>) -> String {
    let path = shell_quote(path);
    format!(
        "mkdir -p {} && chmod {} {}",
        path,
        mode.unwrap_or(DEFAULT_DIRECTORY_MODE),
        path
    )
}

/// Reject a `mode` that did not interpolate to an octal permission
pub(super) fn check_mode(mode: Option<&str>, line: usize) -> Result<(), PfError> {
    match mode {
        Some(mode) if !is_octal_mode(mode) => Err(ParseError::new(
            ParseErrorKind::InvalidModifier,
            line,
            format!("mode '{}' is not an octal permission", mode),
        )
        .with_suggestion("mode=0755")
        .into()),
        _ => Ok(()),
    }
}

/// `chmod`/`chown` to run after a copy, if any modifier asks for one
pub fn ownership_command(
    path: &str,
    mode: Option<&str>,
    user: Option<&str>,
    group: Option<&str>,
) -> Option<String> {
    let quoted = shell_quote(path);
    let mut parts = Vec::new();

    if let Some(mode) = mode {
        parts.push(format!("chmod {} {}", mode, quoted));
    }

    let ownership = match (user, group) {
        (Some(u), Some(g)) => Some(format!("{}:{}", u, g)),
        (Some(u), None) => Some(u.to_string()),
        (None, Some(g)) => Some(format!(":{}", g)),
        (None, None) => None,
    };
    if let Some(ownership) = ownership {
        parts.push(format!("chown {} {}", shell_quote(&ownership), quoted));
    }

    if parts.is_empty() {
        None
    } else {
        Some(parts.join(" && "))
    }
}

pub(super) struct CopySpec<'a> {
    pub local: &'a str,
    pub remote: &'a str,
    pub mode: Option<&'a str>,
    pub user: Option<&'a str>,
    pub group: Option<&'a str>,
}

/// Push a local file to the target, then apply mode and ownership
///
/// Without elevation the file is written straight to its destination. With
/// elevation it is uploaded to a staging path and moved into place under sudo.
pub(super) async fn copy(
    ctx: &ExecutionContext,
    io: StepIo<'_>,
    env: &[(String, String)],
    spec: CopySpec<'_>,
) -> Result<i32, PfError> {
    let source = Path::new(spec.local);
    if !source.is_file() {
        return Err(PfError::Io {
            message: format!("Source file not found: {}", spec.local),
            path: Some(source.to_path_buf()),
        });
    }

    let elevation = ctx.default_elevation();
    let parent = Path::new(spec.remote)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty());

    io.sink.marker(
        MarkerKind::Command,
        format!("copy {} -> {}", spec.local, spec.remote),
    );

    let mut finish = Vec::new();

    if elevation.is_elevated() {
        let staging = staging_path(ctx);
        debug!(target = %ctx.target, staging = %staging, "uploading via staging path");
        io.conn.upload_file(source, &staging, io.cancel).await?;

        if let Some(ref parent) = parent {
            finish.push(format!("mkdir -p {}", shell_quote(parent)));
        }
        finish.push(format!(
            "mv {} {}",
            shell_quote(&staging),
            shell_quote(spec.remote)
        ));
    } else {
        // Local uploads create their own parent directories
        let remote_parent = parent.as_ref().filter(|_| !ctx.target.is_local());
        if let Some(parent) = remote_parent {
            let code = run_command(
                ctx,
                io,
                env,
                &format!("mkdir -p {}", shell_quote(parent)),
                &Elevation::None,
            )
            .await?;
            if code != 0 {
                return Ok(code);
            }
        }
        io.conn.upload_file(source, spec.remote, io.cancel).await?;
    }

    if let Some(cmd) = ownership_command(spec.remote, spec.mode, spec.user, spec.group) {
        finish.push(cmd);
    }

    if finish.is_empty() {
        return Ok(0);
    }

    run_command(ctx, io, env, &finish.join(" && "), &elevation).await
}

fn staging_path(ctx: &ExecutionContext) -> String {
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!(".pf-upload-{}-{}", std::process::id(), seq);
    if ctx.target.is_local() {
        std::env::temp_dir().join(name).to_string_lossy().into_owned()
    } else {
        format!("/tmp/{}", name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::LocalConnection;
    use crate::inventory::Target;
    use crate::output::multiplex::HostSink;
    use pretty_assertions::assert_eq;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_directory_command_defaults_mode() {
        assert_eq!(
            directory_command("/srv/app", None),
            "mkdir -p '/srv/app' && chmod 0755 '/srv/app'"
        );
        assert_eq!(
            directory_command("/srv/app", Some("0700")),
            "mkdir -p '/srv/app' && chmod 0700 '/srv/app'"
        );
    }

    #[test]
    fn test_ownership_command_forms() {
        assert_eq!(ownership_command("/etc/app.conf", None, None, None), None);
        assert_eq!(
            ownership_command("/etc/app.conf", Some("0640"), Some("root"), Some("app")),
            Some("chmod 0640 '/etc/app.conf' && chown 'root:app' '/etc/app.conf'".to_string())
        );
        assert_eq!(
            ownership_command("/etc/app.conf", None, None, Some("app")),
            Some("chown ':app' '/etc/app.conf'".to_string())
        );
        assert_eq!(
            ownership_command("/etc/app.conf", None, Some("app;reboot"), None),
            Some("chown 'app;reboot' '/etc/app.conf'".to_string())
        );
    }

    #[tokio::test]
    async fn test_local_copy_applies_mode() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("app.conf");
        std::fs::write(&src, "key=value\n").unwrap();
        let dest = dir.path().join("conf.d/app.conf");

        let conn = LocalConnection::new();
        let sink = HostSink::discard("@local");
        let cancel = CancellationToken::new();
        let io = StepIo {
            conn: &conn,
            sink: &sink,
            cancel: &cancel,
        };
        let ctx = ExecutionContext::new(Target::Local);

        let code = copy(
            &ctx,
            io,
            &[],
            CopySpec {
                local: src.to_str().unwrap(),
                remote: dest.to_str().unwrap(),
                mode: Some("0600"),
                user: None,
                group: None,
            },
        )
        .await
        .unwrap();

        assert_eq!(code, 0);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "key=value\n");
        let mode = std::fs::metadata(&dest).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_missing_source_is_an_error() {
        let conn = LocalConnection::new();
        let sink = HostSink::discard("@local");
        let cancel = CancellationToken::new();
        let io = StepIo {
            conn: &conn,
            sink: &sink,
            cancel: &cancel,
        };
        let ctx = ExecutionContext::new(Target::Local);

        let result = copy(
            &ctx,
            io,
            &[],
            CopySpec {
                local: "/nonexistent/pf/source",
                remote: "/tmp/pf-never-written",
                mode: None,
                user: None,
                group: None,
            },
        )
        .await;
        assert!(matches!(result, Err(PfError::Io { .. })));
    }
}
