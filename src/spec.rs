//! Appliance definition files and the resolved build request.
//!
//! A definition file is a small TOML document describing the appliance to
//! build. Parsing it yields an [`ApplianceSpec`]: the immutable, fully
//! resolved request that the rest of the pipeline reads but never mutates.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Architectures the builder knows how to target.
pub const SUPPORTED_ARCHES: &[&str] = &["i386", "x86_64"];

const DEFAULT_CPUS: u32 = 1;
const DEFAULT_MEMORY_MB: u32 = 1024;
const DEFAULT_DISK_GB: u32 = 2;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DefinitionToml {
    name: String,
    summary: Option<String>,
    os: OsToml,
    hardware: Option<HardwareToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct OsToml {
    name: String,
    version: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct HardwareToml {
    arch: Option<String>,
    cpus: Option<u32>,
    memory: Option<u32>,
    disk: Option<u32>,
}

/// Selected operating system for an appliance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsSelector {
    pub name: String,
    /// `None` means "whatever the OS plugin considers current".
    pub version: Option<String>,
}

/// Resource sizing for the built image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hardware {
    pub arch: String,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_gb: u32,
}

/// Filesystem locations derived from the definition, rooted at the build root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliancePaths {
    /// Per-appliance build directory: `<root>/<arch>/<os>/<version>/<name>`.
    pub build: PathBuf,
}

/// Resolved build request. Created once per invocation, read-only afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplianceSpec {
    pub name: String,
    pub summary: Option<String>,
    pub os: OsSelector,
    pub hardware: Hardware,
    pub paths: AppliancePaths,
}

impl ApplianceSpec {
    /// Parse a definition file and derive build paths under `build_root`.
    pub fn from_file(definition: &Path, build_root: &Path) -> Result<Self> {
        let raw = fs::read_to_string(definition).with_context(|| {
            format!("reading appliance definition '{}'", definition.display())
        })?;
        let parsed: DefinitionToml = toml::from_str(&raw).with_context(|| {
            format!("parsing appliance definition '{}'", definition.display())
        })?;

        let name = parsed.name.trim().to_string();
        if name.is_empty() {
            bail!(
                "appliance definition '{}' has an empty name",
                definition.display()
            );
        }

        let hardware = parsed.hardware.unwrap_or_default();
        let arch = match hardware.arch {
            Some(arch) => arch,
            None => default_arch()?,
        };
        if !SUPPORTED_ARCHES.contains(&arch.as_str()) {
            bail!(
                "unsupported architecture '{}'; supported architectures are: {}",
                arch,
                SUPPORTED_ARCHES.join(", ")
            );
        }

        let os = OsSelector {
            name: parsed.os.name.trim().to_ascii_lowercase(),
            version: parsed.os.version,
        };
        if os.name.is_empty() {
            bail!(
                "appliance definition '{}' has an empty os.name",
                definition.display()
            );
        }

        let hardware = Hardware {
            arch,
            cpus: hardware.cpus.unwrap_or(DEFAULT_CPUS),
            memory_mb: hardware.memory.unwrap_or(DEFAULT_MEMORY_MB),
            disk_gb: hardware.disk.unwrap_or(DEFAULT_DISK_GB),
        };

        let paths = AppliancePaths {
            build: build_root
                .join(&hardware.arch)
                .join(&os.name)
                .join(os.version.as_deref().unwrap_or("current"))
                .join(&name),
        };

        Ok(ApplianceSpec {
            name,
            summary: parsed.summary,
            os,
            hardware,
            paths,
        })
    }
}

fn default_arch() -> Result<String> {
    match std::env::consts::ARCH {
        "x86_64" => Ok("x86_64".to_string()),
        "x86" => Ok("i386".to_string()),
        other => bail!(
            "host architecture '{}' is not supported; set hardware.arch explicitly (one of: {})",
            other,
            SUPPORTED_ARCHES.join(", ")
        ),
    }
}
