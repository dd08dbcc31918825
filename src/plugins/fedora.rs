//! Fedora operating system plugin.
//!
//! Builds a raw disk image with `appliance-creator`. The appliance
//! definition is rendered into a kickstart file, the tool is invoked against
//! it, and the resulting disk image plus libvirt descriptor become the
//! stage's deliverables. Can also consume a plain kickstart file directly in
//! place of a definition file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info};

use crate::exec::{CommandRunner, CommandSpec, HostRunner};
use crate::plugin::{
    PluginDescriptor, PluginInfo, PluginRegistry, RunArg, StageContext, StageKind, StagePlugin,
};
use crate::preflight::check_required_tools;
use crate::spec::{ApplianceSpec, AppliancePaths, Hardware, OsSelector};

pub const PLUGIN_NAME: &str = "fedora";
const SUPPORTED_VERSIONS: &[&str] = &["40", "41", "42", "rawhide"];
const DEFAULT_VERSION: &str = "41";

const REQUIRED_TOOLS: &[(&str, &str)] = &[("appliance-creator", "appliance-tools")];

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(PluginDescriptor::new(
        PluginInfo::new(StageKind::Os, PLUGIN_NAME, "Fedora Appliance Builder")
            .with_versions(SUPPORTED_VERSIONS)
            .reads_native_definitions(),
        || Box::new(FedoraPlugin::new()),
    ))?;
    Ok(())
}

pub struct FedoraPlugin {
    ctx: Option<StageContext>,
    runner: Box<dyn CommandRunner>,
    // Host tool checks only make sense when commands actually reach the host.
    check_tools: bool,
}

impl FedoraPlugin {
    pub fn new() -> Self {
        Self {
            ctx: None,
            runner: Box::new(HostRunner),
            check_tools: true,
        }
    }

    #[cfg(test)]
    fn with_runner(runner: Box<dyn CommandRunner>) -> Self {
        Self {
            ctx: None,
            runner,
            check_tools: false,
        }
    }

    fn ctx(&self) -> Result<&StageContext> {
        self.ctx
            .as_ref()
            .context("Fedora plugin used before initialization")
    }

    /// Stage output directory under the appliance build directory.
    fn image_dir(&self) -> Result<PathBuf> {
        Ok(self.ctx()?.spec.paths.build.join("os"))
    }

    fn disk_path(&self) -> Result<PathBuf> {
        let ctx = self.ctx()?;
        Ok(self.image_dir()?.join(format!("{}-sda.raw", ctx.spec.name)))
    }

    fn descriptor_path(&self) -> Result<PathBuf> {
        let ctx = self.ctx()?;
        Ok(self.image_dir()?.join(format!("{}.xml", ctx.spec.name)))
    }
}

impl Default for FedoraPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl StagePlugin for FedoraPlugin {
    fn init(&mut self, ctx: StageContext) -> Result<()> {
        let version = ctx.spec.os.version.as_deref().unwrap_or(DEFAULT_VERSION);
        if !SUPPORTED_VERSIONS.contains(&version) {
            bail!(
                "Fedora version '{}' is not supported; supported versions are: {}",
                version,
                SUPPORTED_VERSIONS.join(", ")
            );
        }
        self.ctx = Some(ctx);
        Ok(())
    }

    fn deliverables_exist(&self) -> bool {
        match (self.disk_path(), self.descriptor_path()) {
            (Ok(disk), Ok(descriptor)) => disk.is_file() && descriptor.is_file(),
            _ => false,
        }
    }

    fn deliverables(&self) -> Vec<PathBuf> {
        match (self.disk_path(), self.descriptor_path()) {
            (Ok(disk), Ok(descriptor)) => vec![disk, descriptor],
            _ => Vec::new(),
        }
    }

    fn run(&mut self, arg: RunArg<'_>) -> Result<()> {
        let definition = match arg {
            RunArg::Definition(path) => path,
            other => bail!("Fedora plugin cannot handle stage argument {other:?}"),
        };
        let ctx = self.ctx()?.clone();
        if self.check_tools {
            check_required_tools(REQUIRED_TOOLS)?;
        }

        let image_dir = self.image_dir()?;
        fs::create_dir_all(&image_dir)
            .with_context(|| format!("creating image directory '{}'", image_dir.display()))?;

        let kickstart_path = if definition.extension().and_then(|e| e.to_str()) == Some("ks") {
            // A native kickstart was supplied; use it as-is.
            definition.to_path_buf()
        } else {
            let path = image_dir.join(format!("{}.ks", ctx.spec.name));
            fs::write(&path, render_kickstart(&ctx.spec))
                .with_context(|| format!("writing kickstart '{}'", path.display()))?;
            path
        };
        debug!("using kickstart {}", kickstart_path.display());

        info!(
            "building {} (Fedora {}) disk image",
            ctx.spec.name,
            ctx.spec.os.version.as_deref().unwrap_or(DEFAULT_VERSION)
        );
        self.runner.run(
            &CommandSpec::new("appliance-creator")
                .arg("--config")
                .arg(kickstart_path.display().to_string())
                .arg("--name")
                .arg(&ctx.spec.name)
                .arg("--format")
                .arg("raw")
                .arg("--vmem")
                .arg(ctx.spec.hardware.memory_mb.to_string())
                .arg("--vcpu")
                .arg(ctx.spec.hardware.cpus.to_string())
                .arg("--cache")
                .arg(image_dir.join("cache").display().to_string())
                .arg("--outdir")
                .arg(image_dir.display().to_string()),
        )?;

        // appliance-creator nests its output one directory deep.
        let nested = image_dir.join(&ctx.spec.name);
        if nested.is_dir() {
            for target in [self.disk_path()?, self.descriptor_path()?] {
                let produced = nested.join(target.file_name().unwrap_or_default());
                if produced.is_file() {
                    fs::rename(&produced, &target).with_context(|| {
                        format!("moving '{}' into place", produced.display())
                    })?;
                }
            }
            let _ = fs::remove_dir(&nested);
        }

        for required in [self.disk_path()?, self.descriptor_path()?] {
            if !required.is_file() {
                bail!(
                    "appliance-creator finished but '{}' was not produced",
                    required.display()
                );
            }
        }
        Ok(())
    }

    /// Treat a `.ks` file as a native definition: the appliance takes the
    /// file's name and the plugin's defaults.
    fn read_native_definition(
        &self,
        definition: &Path,
        build_root: &Path,
    ) -> Result<Option<ApplianceSpec>> {
        if definition.extension().and_then(|e| e.to_str()) != Some("ks") {
            return Ok(None);
        }
        let name = definition
            .file_stem()
            .and_then(|s| s.to_str())
            .with_context(|| format!("kickstart '{}' has no usable name", definition.display()))?
            .to_string();
        fs::metadata(definition)
            .with_context(|| format!("reading kickstart '{}'", definition.display()))?;

        let hardware = Hardware {
            arch: default_arch(),
            cpus: 1,
            memory_mb: 1024,
            disk_gb: 2,
        };
        let os = OsSelector {
            name: PLUGIN_NAME.to_string(),
            version: None,
        };
        let paths = AppliancePaths {
            build: build_root
                .join(&hardware.arch)
                .join(&os.name)
                .join("current")
                .join(&name),
        };
        Ok(Some(ApplianceSpec {
            name,
            summary: None,
            os,
            hardware,
            paths,
        }))
    }
}

fn default_arch() -> String {
    if std::env::consts::ARCH == "x86" {
        "i386".to_string()
    } else {
        "x86_64".to_string()
    }
}

/// Render the kickstart appliance-creator consumes.
fn render_kickstart(spec: &ApplianceSpec) -> String {
    let version = spec.os.version.as_deref().unwrap_or(DEFAULT_VERSION);
    let disk_mb = spec.hardware.disk_gb * 1024;
    format!(
        "install\n\
         text\n\
         reboot\n\
         lang en_US.UTF-8\n\
         keyboard us\n\
         timezone --utc UTC\n\
         network --bootproto=dhcp --device=eth0 --onboot=on\n\
         rootpw --lock\n\
         zerombr\n\
         clearpart --all\n\
         part / --size {disk_mb} --fstype ext4 --ondisk sda\n\
         repo --name=fedora --mirrorlist=https://mirrors.fedoraproject.org/mirrorlist?repo=fedora-{version}&arch={arch}\n\
         repo --name=updates --mirrorlist=https://mirrors.fedoraproject.org/mirrorlist?repo=updates-released-f{version}&arch={arch}\n\
         \n\
         %packages\n\
         @core\n\
         %end\n",
        arch = spec.hardware.arch,
    )
}
