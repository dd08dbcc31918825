//! Preflight checks for build validation.
//!
//! Validates that the host has the external tools a build will shell out to
//! before any stage runs. This prevents cryptic errors deep inside a stage.

use anyhow::{bail, Result};
use which::which;

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which(cmd).is_ok()
}

/// Check that specific tools are available.
///
/// Each tuple is (command_name, package_name). Fails with the full list of
/// missing tools and the packages that provide them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !command_exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}
