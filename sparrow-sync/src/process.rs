use std::ffi::OsStr;
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;

use sparrow_user::config::CommandLine;

/// For commands that take nothing beyond their configured command line.
pub const NO_ARGS: [&str; 0] = [];

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,
    #[error("unable to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {}", .stderr.trim())]
    Failed {
        program: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },
}

/// What a successful command printed on its standard output.
#[derive(Debug, Default)]
pub struct Captured {
    pub stdout: String,
}

/// Run `command` with `args` appended and wait for it. No timeout, no retry.
///
/// Arguments are never logged, some of them are passwords.
pub async fn run<I, S>(command: &CommandLine, args: I) -> Result<Captured, CommandError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let (program, base_args) = command.split_first().ok_or(CommandError::Empty)?;
    tracing::debug!(program=%program, "running command");

    let output = Command::new(program)
        .args(base_args)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    if !output.status.success() {
        tracing::debug!(program=%program, status=%output.status, "command failed");
        return Err(CommandError::Failed {
            program: program.clone(),
            status: output.status,
            stdout,
            stderr,
        });
    }

    // postmap and doveadm warn on stderr and still succeed
    if !stderr.trim().is_empty() {
        tracing::debug!(program=%program, stderr=%stderr.trim(), "command succeeded with warnings");
    }
    Ok(Captured { stdout })
}
