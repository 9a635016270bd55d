// Shell module - run a command line through the target's shell

use super::{run_command, StepIo};
use crate::executor::ExecutionContext;
use crate::output::errors::PfError;

/// Run a `shell` step; its own `sudo=`/`sudo_user=` override the run-wide elevation
pub(super) async fn execute(
    ctx: &ExecutionContext,
    io: StepIo<'_>,
    env: &[(String, String)],
    command: &str,
    sudo: Option<bool>,
    sudo_user: Option<&str>,
) -> Result<i32, PfError> {
    let elevation = ctx.step_elevation(sudo, sudo_user);
    run_command(ctx, io, env, command, &elevation).await
}
