//! External command execution for drivers that shell out to hypervisor tools.

use std::fmt;
use std::io;
use std::path::Path;
use std::process::{Command, Stdio};

use tracing::trace;

/// Captured result of one command invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Whether the command exited successfully.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Best human-readable explanation of a failed invocation.
    pub fn failure_detail(&self) -> String {
        let stderr = self.stderr.trim();
        let message = if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        };

        match (self.code, message.is_empty()) {
            (Some(code), true) => format!("exited with status {code}"),
            (None, true) => "terminated by signal".to_string(),
            (Some(code), false) => format!("exited with status {code}: {message}"),
            (None, false) => message.to_string(),
        }
    }
}

/// Runs a program to completion and captures its output.
pub trait CommandRunner: fmt::Debug {
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<CommandOutput>;
}

/// Runs commands on the local host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &Path, args: &[&str]) -> io::Result<CommandOutput> {
        trace!(program = %program.display(), ?args, "Running command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
