//! Subprocess helpers shared by the resolvers.

use crate::resolver::ResolverError;
use std::ffi::OsStr;
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

/// True if `command` can be found on `PATH`.
#[must_use]
pub fn command_exists(command: &str) -> bool {
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(command).is_file())
}

/// Run a command and capture stdout, failing on a non-zero exit.
pub async fn run_command(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
) -> Result<Vec<u8>, ResolverError> {
    run_command_tolerant(program, args, cwd, &[]).await
}

/// Like [`run_command`], but exit codes in `tolerated` yield empty output
/// instead of an error (`apt show` exits 100 for "no such package").
pub async fn run_command_tolerant(
    program: &str,
    args: &[&str],
    cwd: Option<&Path>,
    tolerated: &[i32],
) -> Result<Vec<u8>, ResolverError> {
    debug!(program, ?args, "running command");
    let mut command = Command::new(program);
    command.args(args.iter().map(OsStr::new));
    if let Some(cwd) = cwd {
        command.current_dir(cwd);
    }
    let output = command
        .output()
        .await
        .map_err(|e| ResolverError::failed(format!("failed to spawn {program}: {e}")))?;
    if output.status.success() {
        return Ok(output.stdout);
    }
    match output.status.code() {
        Some(code) if tolerated.contains(&code) => Ok(Vec::new()),
        _ => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(ResolverError::failed(format!(
                "{program} {} exited with {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            )))
        }
    }
}
