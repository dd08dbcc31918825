//! VMware platform plugin.
//!
//! Converts the raw disk image produced by the OS stage into a VMDK with
//! `qemu-img` and renders a `.vmx` machine descriptor sized from the
//! appliance definition.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::exec::{CommandRunner, CommandSpec, HostRunner};
use crate::plugin::{
    PluginDescriptor, PluginInfo, PluginRegistry, RunArg, StageContext, StageKind, StagePlugin,
};
use crate::preflight::check_required_tools;
use crate::spec::ApplianceSpec;

pub const PLUGIN_NAME: &str = "vmware";

const REQUIRED_TOOLS: &[(&str, &str)] = &[("qemu-img", "qemu-img")];

pub fn register(registry: &mut PluginRegistry) -> Result<()> {
    registry.register(PluginDescriptor::new(
        PluginInfo::new(StageKind::Platform, PLUGIN_NAME, "VMware Platform Converter"),
        || Box::new(VmwarePlugin::new()),
    ))?;
    Ok(())
}

pub struct VmwarePlugin {
    ctx: Option<StageContext>,
    runner: Box<dyn CommandRunner>,
    check_tools: bool,
}

impl VmwarePlugin {
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
            .context("VMware plugin used before initialization")
    }

    fn image_dir(&self) -> Result<PathBuf> {
        Ok(self.ctx()?.spec.paths.build.join("vmware"))
    }

    fn vmdk_path(&self) -> Result<PathBuf> {
        let ctx = self.ctx()?;
        Ok(self.image_dir()?.join(format!("{}.vmdk", ctx.spec.name)))
    }

    fn vmx_path(&self) -> Result<PathBuf> {
        let ctx = self.ctx()?;
        Ok(self.image_dir()?.join(format!("{}.vmx", ctx.spec.name)))
    }

    /// The raw disk image among the previous stage's deliverables.
    fn source_disk(&self) -> Result<PathBuf> {
        let ctx = self.ctx()?;
        ctx.previous_deliverables
            .iter()
            .find(|p| p.extension().and_then(|e| e.to_str()) == Some("raw"))
            .cloned()
            .context("previous stage produced no raw disk image to convert")
    }
}

impl Default for VmwarePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl StagePlugin for VmwarePlugin {
    fn init(&mut self, ctx: StageContext) -> Result<()> {
        self.ctx = Some(ctx);
        Ok(())
    }

    fn deliverables_exist(&self) -> bool {
        match (self.vmdk_path(), self.vmx_path()) {
            (Ok(vmdk), Ok(vmx)) => vmdk.is_file() && vmx.is_file(),
            _ => false,
        }
    }

    fn deliverables(&self) -> Vec<PathBuf> {
        match (self.vmdk_path(), self.vmx_path()) {
            (Ok(vmdk), Ok(vmx)) => vec![vmdk, vmx],
            _ => Vec::new(),
        }
    }

    fn run(&mut self, arg: RunArg<'_>) -> Result<()> {
        if !matches!(arg, RunArg::Convert) {
            bail!("VMware plugin cannot handle stage argument {arg:?}");
        }
        let ctx = self.ctx()?.clone();
        if self.check_tools {
            check_required_tools(REQUIRED_TOOLS)?;
        }

        let source = self.source_disk()?;
        let image_dir = self.image_dir()?;
        fs::create_dir_all(&image_dir)
            .with_context(|| format!("creating image directory '{}'", image_dir.display()))?;

        let vmdk = self.vmdk_path()?;
        info!(
            "converting {} to VMDK at {}",
            source.display(),
            vmdk.display()
        );
        self.runner.run(
            &CommandSpec::new("qemu-img")
                .arg("convert")
                .arg("-f")
                .arg("raw")
                .arg("-O")
                .arg("vmdk")
                .arg(source.display().to_string())
                .arg(vmdk.display().to_string()),
        )?;

        let vmx = self.vmx_path()?;
        fs::write(&vmx, render_vmx(&ctx.spec))
            .with_context(|| format!("writing machine descriptor '{}'", vmx.display()))?;
        Ok(())
    }
}

/// Render the `.vmx` descriptor for the converted image.
fn render_vmx(spec: &ApplianceSpec) -> String {
    let guest_os = if spec.hardware.arch == "x86_64" {
        "otherlinux-64"
    } else {
        "otherlinux"
    };
    format!(
        "#!/usr/bin/vmware\n\
         .encoding = \"UTF-8\"\n\
         config.version = \"8\"\n\
         virtualHW.version = \"7\"\n\
         displayName = \"{name}\"\n\
         annotation = \"{summary}\"\n\
         guestOS = \"{guest_os}\"\n\
         memsize = \"{memory}\"\n\
         numvcpus = \"{cpus}\"\n\
         scsi0.present = \"true\"\n\
         scsi0.virtualDev = \"lsilogic\"\n\
         scsi0:0.present = \"true\"\n\
         scsi0:0.fileName = \"{name}.vmdk\"\n\
         ethernet0.present = \"true\"\n\
         ethernet0.connectionType = \"nat\"\n",
        name = spec.name,
        summary = spec.summary.as_deref().unwrap_or(""),
        memory = spec.hardware.memory_mb,
        cpus = spec.hardware.cpus,
    )
}
