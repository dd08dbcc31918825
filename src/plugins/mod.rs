//! Builtin stage plugins.

pub mod fedora;
pub mod sftp;
pub mod vmware;

use anyhow::Result;

use crate::plugin::PluginRegistry;

/// Register every builtin plugin in a fixed order, so diagnostics and
/// native-definition probing stay deterministic.
pub fn register_builtins(registry: &mut PluginRegistry) -> Result<()> {
    fedora::register(registry)?;
    vmware::register(registry)?;
    sftp::register(registry)?;
    Ok(())
}
