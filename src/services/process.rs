//! Spawning of external tools (`kubectl`, `rbd`, `gpg`).

use std::{
    ffi::{OsStr, OsString},
    path::PathBuf,
    process::{Output, Stdio},
};

use tokio::process::Command;
use tracing::debug;

use crate::{
    errors::{PipelineError, PipelineResult},
    services::control::CallControl,
};

/// A fully assembled tool invocation.
#[derive(Debug, Clone)]
pub struct ToolCommand {
    program: PathBuf,
    label: String,
    args: Vec<OsString>,
}

impl ToolCommand {
    /// `label` names the invocation in logs and errors, e.g. `rbd export`.
    pub fn new(program: impl Into<PathBuf>, label: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            label: label.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn opt_flag(self, flag: &str, value: Option<impl AsRef<OsStr>>) -> Self {
        match value {
            Some(value) => self.arg(flag).arg(value),
            None => self,
        }
    }

    /// Run to completion and return the raw output, whatever the exit status.
    pub async fn output(&self, control: &CallControl, operation: &'static str) -> PipelineResult<Output> {
        debug!(program = %self.program.display(), args = ?self.args, "running {}", self.label);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        control
            .run(operation, async {
                let child = command
                    .spawn()
                    .map_err(|err| PipelineError::io(operation, &self.program, err))?;
                child
                    .wait_with_output()
                    .await
                    .map_err(|err| PipelineError::io(operation, &self.program, err))
            })
            .await
    }

    /// Run and require a zero exit status.
    pub async fn run(&self, control: &CallControl, operation: &'static str) -> PipelineResult<Output> {
        let output = self.output(control, operation).await?;
        if output.status.success() {
            Ok(output)
        } else {
            Err(self.failure(&output))
        }
    }

    pub fn failure(&self, output: &Output) -> PipelineError {
        let status = match output.status.code() {
            Some(code) => format!("status {code}"),
            None => "a signal".to_string(),
        };
        PipelineError::Tool {
            tool: self.label.clone(),
            status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}
