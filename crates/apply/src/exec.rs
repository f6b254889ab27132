//! Subprocess seam for `helm` and `kubectl`.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{ApplyError, Result};

/// Exit status and combined stdout+stderr of one command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub output: String,
}

impl CommandOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self { success: true, output: output.into() }
    }

    pub fn failed(output: impl Into<String>) -> Self {
        Self { success: false, output: output.into() }
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.output.contains(needle)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. A non-zero exit is reported in [`CommandOutput::success`], not as `Err`.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Run through `runner` unless `cancel` fires first; the child is dropped on cancellation.
pub async fn run_cancellable(
    runner: &dyn CommandRunner,
    cancel: &CancellationToken,
    program: &str,
    args: &[String],
) -> Result<CommandOutput> {
    tokio::select! {
        _ = cancel.cancelled() => Err(ApplyError::Cancelled { what: format!("{} {}", program, args.join(" ")) }),
        out = runner.run(program, args) => out,
    }
}

/// Runs real processes. Dropping the future kills the child.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program, ?args, "exec");
        let out = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ApplyError::Spawn { program: program.to_string(), source })?;
        let mut output = String::from_utf8_lossy(&out.stdout).into_owned();
        output.push_str(&String::from_utf8_lossy(&out.stderr));
        Ok(CommandOutput { success: out.status.success(), output })
    }
}
