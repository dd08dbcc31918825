//! SFTP delivery plugin.
//!
//! Packages the previous stage's deliverables into one archive and pushes it
//! to a remote host over SSH, reusing the incremental uploader so unchanged
//! packages are skipped. Configured through the `[plugins.sftp]` table.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use crate::package::package_deliverables;
use crate::plugin::{
    PluginDescriptor, PluginInfo, PluginRegistry, RunArg, StageContext, StageKind, StagePlugin,
};
use crate::sync::ssh::{SshConnection, SshOptions};
use crate::sync::{RemoteConnection, SyncUploader, TransferManifest, TransferSummary};

pub const PLUGIN_NAME: &str = "sftp";

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(PluginDescriptor::new(
        PluginInfo::new(StageKind::Delivery, PLUGIN_NAME, "SFTP Delivery"),
        || Box::new(SftpPlugin::new()),
    ))?;
    Ok(())
}

/// Settings from the `[plugins.sftp]` configuration table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SftpConfig {
    pub host: String,
    pub username: String,
    /// Remote directory uploads land in.
    pub path: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Present for completeness; authentication goes through SSH keys.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    /// Octal permission string applied to uploaded files.
    #[serde(default = "default_permissions")]
    pub default_permissions: String,
}

fn default_port() -> u16 {
    22
}

fn default_permissions() -> String {
    "0644".to_string()
}

impl SftpConfig {
    fn from_context(ctx: &StageContext) -> Result<Self> {
        let table = ctx.config.plugin_config(PLUGIN_NAME).with_context(|| {
            format!(
                "the SFTP plugin is not configured; add a [plugins.{PLUGIN_NAME}] table with \
                 host, username and path"
            )
        })?;
        let config: SftpConfig = table
            .clone()
            .try_into()
            .context("parsing the [plugins.sftp] configuration table")?;
        if config.host.trim().is_empty() || config.path.trim().is_empty() {
            bail!("the [plugins.sftp] table needs non-empty host and path values");
        }
        Ok(config)
    }

    /// Permission bits parsed from the octal string.
    pub fn mode(&self) -> Result<u32> {
        let raw = self.default_permissions.trim_start_matches("0o");
        u32::from_str_radix(raw, 8).with_context(|| {
            format!(
                "default_permissions '{}' is not an octal mode",
                self.default_permissions
            )
        })
    }
}

pub struct SftpPlugin {
    ctx: Option<StageContext>,
    config: Option<SftpConfig>,
}

impl SftpPlugin {
    pub fn new() -> Self {
        Self {
            ctx: None,
            config: None,
        }
    }

    fn ctx(&self) -> Result<&StageContext> {
        self.ctx
            .as_ref()
            .context("SFTP plugin used before initialization")
    }

    fn config(&self) -> Result<&SftpConfig> {
        self.config
            .as_ref()
            .context("SFTP plugin used before initialization")
    }

    /// Archive name: `<appliance>-<version>-<arch>`.
    fn package_name(&self) -> Result<String> {
        let spec = &self.ctx()?.spec;
        Ok(format!(
            "{}-{}-{}",
            spec.name,
            spec.os.version.as_deref().unwrap_or("current"),
            spec.hardware.arch
        ))
    }

    /// Package the previous deliverables and push them through `conn`.
    /// The connection must already be established.
    fn deliver_over(&self, conn: &mut dyn RemoteConnection) -> Result<TransferSummary> {
        let ctx = self.ctx()?;
        let config = self.config()?;

        if ctx.previous_deliverables.is_empty() {
            bail!("nothing to deliver: the previous stage produced no deliverables");
        }

        let package_dir = ctx.spec.paths.build.join(PLUGIN_NAME);
        let archive = package_deliverables(
            &self.package_name()?,
            &ctx.previous_deliverables,
            &package_dir,
        )?;

        let manifest = TransferManifest::from_deliverables(&config.path, &[archive])?;
        let uploader = SyncUploader::new()
            .with_overwrite(config.overwrite)
            .with_default_permissions(config.mode()?);
        let summary = uploader
            .upload(conn, &manifest)
            .context("uploading the appliance package")?;
        info!(
            "delivered {} file(s) to {}:{} ({} skipped)",
            summary.files_uploaded, config.host, config.path, summary.files_skipped
        );
        Ok(summary)
    }
}

impl Default for SftpPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl StagePlugin for SftpPlugin {
    fn init(&mut self, ctx: StageContext) -> Result<()> {
        let config = SftpConfig::from_context(&ctx)?;
        config.mode()?;
        if config.password.is_some() {
            warn!("password authentication is not supported; configure SSH keys or an agent");
        }
        self.config = Some(config);
        self.ctx = Some(ctx);
        Ok(())
    }

    /// Delivery always runs; there is no local artifact whose presence could
    /// prove the remote side is up to date.
    fn deliverables_exist(&self) -> bool {
        false
    }

    fn deliverables(&self) -> Vec<PathBuf> {
        Vec::new()
    }

    fn run(&mut self, arg: RunArg<'_>) -> Result<()> {
        let method = match arg {
            RunArg::Deliver(method) => method,
            other => bail!("SFTP plugin cannot handle stage argument {other:?}"),
        };
        if method != PLUGIN_NAME {
            bail!("SFTP plugin does not provide delivery method '{method}'");
        }
        let config = self.config()?.clone();

        let mut conn = SshConnection::new(
            SshOptions::new(&config.host, &config.username).with_port(config.port),
        );
        conn.connect()
            .with_context(|| format!("connecting to '{}'", config.host))?;
        let result = self.deliver_over(&mut conn);
        conn.disconnect()?;
        result.map(|_| ())
    }
}
