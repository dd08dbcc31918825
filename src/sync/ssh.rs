//! Remote connection backed by the OpenSSH client tools.
//!
//! Each operation runs as its own `ssh` or `scp` process, so "connected"
//! here means a probe command succeeded, not that a session is held open.
//! Authentication relies on the user's SSH agent or key files; batch mode is
//! forced so a missing key fails fast instead of prompting.

use std::path::Path;
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use super::{quoted, RemoteConnection, RemoteStat};

/// Connection parameters for an SSH-reachable host.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub host: String,
    pub username: String,
    pub port: u16,
}

impl SshOptions {
    pub fn new(host: &str, username: &str) -> Self {
        Self {
            host: host.to_string(),
            username: username.to_string(),
            port: 22,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

/// [`RemoteConnection`] implementation using `ssh` for remote commands and
/// `scp` for file content.
pub struct SshConnection {
    options: SshOptions,
    connected: bool,
}

impl SshConnection {
    pub fn new(options: SshOptions) -> Self {
        Self {
            options,
            connected: false,
        }
    }

    fn ssh_command(&self) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-p")
            .arg(self.options.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(self.options.destination());
        cmd
    }

    fn run_remote(&self, command: &str) -> Result<std::process::Output> {
        debug!("remote command on {}: {}", self.options.host, command);
        self.ssh_command()
            .arg(command)
            .output()
            .with_context(|| format!("running ssh to '{}'", self.options.host))
    }
}

impl RemoteConnection for SshConnection {
    fn connect(&mut self) -> Result<()> {
        info!(
            "connecting to {}@{}:{}",
            self.options.username, self.options.host, self.options.port
        );
        let output = self.run_remote("true")?;
        if !output.status.success() {
            bail!(
                "could not establish an SSH connection to '{}': {}",
                self.options.destination(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        self.connected = true;
        Ok(())
    }

    fn disconnect(&mut self) -> Result<()> {
        // Per-operation processes, nothing held open to tear down.
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn stat(&mut self, remote: &str) -> Result<RemoteStat> {
        let output = self.run_remote(&format!("test -e {}", quoted(remote)))?;
        match output.status.code() {
            Some(0) => Ok(RemoteStat::Exists),
            // `test` answers 1 for "no such file".
            Some(1) => Ok(RemoteStat::NotFound),
            Some(code) => Ok(RemoteStat::Status(code)),
            None => bail!("ssh to '{}' was killed by a signal", self.options.host),
        }
    }

    fn execute(&mut self, command: &str) -> Result<String> {
        let output = self.run_remote(command)?;
        if !output.status.success() {
            bail!(
                "remote command '{}' failed on '{}': {}",
                command,
                self.options.host,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn upload(
        &mut self,
        local: &Path,
        remote: &str,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<()> {
        let size = std::fs::metadata(local)
            .map(|m| m.len())
            .with_context(|| format!("sizing '{}'", local.display()))?;
        let output = Command::new("scp")
            .arg("-P")
            .arg(self.options.port.to_string())
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-q")
            .arg(local)
            .arg(format!("{}:{}", self.options.destination(), quoted(remote)))
            .output()
            .with_context(|| format!("running scp to '{}'", self.options.host))?;
        if !output.status.success() {
            bail!(
                "uploading '{}' to '{}' failed: {}",
                local.display(),
                remote,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        // scp exposes no byte-level callbacks; report completion in one step.
        on_progress(size);
        Ok(())
    }

    fn set_permissions(&mut self, remote: &str, mode: u32) -> Result<()> {
        self.execute(&format!("chmod {mode:o} {}", quoted(remote)))?;
        Ok(())
    }
}
