//! Narrow seam for running external build tools.
//!
//! Stage plugins never touch `std::process::Command` directly. They describe
//! an invocation as a [`CommandSpec`] and hand it to a [`CommandRunner`], so
//! tests can substitute a recording runner and assert on the exact commands
//! a stage would issue.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::debug;

/// One external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Single-line rendering for logs and error messages.
    pub fn display_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Executes [`CommandSpec`]s. Implemented by the real host runner and by
/// recording mocks in tests.
pub trait CommandRunner {
    /// Run to completion; a non-zero exit status is an error.
    fn run(&self, spec: &CommandSpec) -> Result<()>;

    /// Run to completion and capture stdout.
    fn run_capture(&self, spec: &CommandSpec) -> Result<String>;
}

/// Runner that executes commands on the host.
#[derive(Debug, Default)]
pub struct HostRunner;

impl HostRunner {
    fn output(&self, spec: &CommandSpec) -> Result<std::process::Output> {
        debug!("running: {}", spec.display_line());
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.output()
            .with_context(|| format!("spawning '{}'", spec.program))
    }
}

impl CommandRunner for HostRunner {
    fn run(&self, spec: &CommandSpec) -> Result<()> {
        let output = self.output(spec)?;
        if !output.status.success() {
            bail!(
                "command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn run_capture(&self, spec: &CommandSpec) -> Result<String> {
        let output = self.output(spec)?;
        if !output.status.success() {
            bail!(
                "command failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
