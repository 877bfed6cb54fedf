use std::process::Stdio;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

use crate::errors::{BackupError, Result};

/// Output of a finished external command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stderr when the command wrote any, stdout otherwise.
    pub fn error_text(&self) -> String {
        let text = if !self.stderr.trim().is_empty() {
            &self.stderr
        } else {
            &self.stdout
        };
        text.trim().to_string()
    }
}

/// Runs `program` with `args` without a shell and captures its output.
///
/// A non-zero exit is not an error here; callers map it to the error kind
/// that fits the call.
pub async fn execute_command(program: &str, args: &[String]) -> Result<CommandOutput> {
    debug!("Executing command: {} {}", program, args.join(" "));

    let output = AsyncCommand::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| BackupError::Command {
            program: program.to_string(),
            reason: format!("failed to spawn: {}", e),
        })?;

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    };

    if !result.success {
        debug!(
            "Command {} exited with {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            result.error_text()
        );
    }

    Ok(result)
}

/// Runs a command and returns its stdout, failing on a non-zero exit.
pub async fn execute_checked(program: &str, args: &[String]) -> Result<String> {
    let output = execute_command(program, args).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(BackupError::Command {
            program: program.to_string(),
            reason: output.error_text(),
        })
    }
}
