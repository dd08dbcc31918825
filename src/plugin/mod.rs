//! Plugin model: stage kinds, descriptors, and the stage plugin contract.
//!
//! A plugin implements one pipeline stage. The orchestrator only ever talks
//! to plugins through [`StagePlugin`]; everything a stage needs to know is
//! handed over in a typed [`StageContext`] at init time.

pub mod registry;

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::config::BuildConfig;
use crate::spec::ApplianceSpec;

pub use registry::{PluginRegistry, RegistryError};

/// The three pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    Os,
    Platform,
    Delivery,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Os => write!(f, "operating system"),
            StageKind::Platform => write!(f, "platform"),
            StageKind::Delivery => write!(f, "delivery"),
        }
    }
}

/// Identity of a stage plugin. Cloned freely; travels with stage results.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginInfo {
    pub kind: StageKind,
    /// Unique within the kind.
    pub name: String,
    pub full_name: String,
    /// Supported OS versions; meaningful for the OS kind only.
    pub versions: Vec<String>,
    /// Whether the plugin can read its own native definition format
    /// (see [`StagePlugin::read_native_definition`]).
    pub reads_native_definitions: bool,
}

impl PluginInfo {
    pub fn new(kind: StageKind, name: &str, full_name: &str) -> Self {
        Self {
            kind,
            name: name.to_string(),
            full_name: full_name.to_string(),
            versions: Vec::new(),
            reads_native_definitions: false,
        }
    }

    pub fn with_versions(mut self, versions: &[&str]) -> Self {
        self.versions = versions.iter().map(|v| v.to_string()).collect();
        self
    }

    pub fn reads_native_definitions(mut self) -> Self {
        self.reads_native_definitions = true;
        self
    }
}

type PluginFactory = Box<dyn Fn() -> Box<dyn StagePlugin> + Send + Sync>;

/// A registered stage implementation: identity plus a factory producing
/// fresh, unconfigured instances.
pub struct PluginDescriptor {
    pub info: PluginInfo,
    factory: PluginFactory,
}

impl PluginDescriptor {
    pub fn new<F>(info: PluginInfo, factory: F) -> Self
    where
        F: Fn() -> Box<dyn StagePlugin> + Send + Sync + 'static,
    {
        Self {
            info,
            factory: Box::new(factory),
        }
    }

    /// Produce a live stage instance bound to no configuration yet.
    pub fn instantiate(&self) -> Box<dyn StagePlugin> {
        (self.factory)()
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

/// Everything a stage instance is initialized with.
#[derive(Debug, Clone)]
pub struct StageContext {
    pub spec: ApplianceSpec,
    pub config: BuildConfig,
    /// The plugin's own identity.
    pub plugin: PluginInfo,
    /// Identity of the plugin that produced the previous stage's result.
    pub previous_plugin: Option<PluginInfo>,
    /// Deliverables of the previous stage, in order.
    pub previous_deliverables: Vec<PathBuf>,
}

/// Stage-specific argument for [`StagePlugin::run`].
#[derive(Debug, Clone, Copy)]
pub enum RunArg<'a> {
    /// OS stage: path to the appliance definition file.
    Definition(&'a Path),
    /// Platform stage: convert the previous deliverables.
    Convert,
    /// Delivery stage: the configured delivery method name.
    Deliver(&'a str),
}

/// Contract every stage plugin implements.
pub trait StagePlugin {
    /// Bind the instance to a build. Called exactly once before any other
    /// method.
    fn init(&mut self, ctx: StageContext) -> Result<()>;

    /// Whether this stage's deliverables already exist on disk. A `true`
    /// answer lets the orchestrator skip `run` and reuse them.
    fn deliverables_exist(&self) -> bool;

    /// Artifact paths this stage produces, in a stable order.
    fn deliverables(&self) -> Vec<PathBuf>;

    /// Execute the stage.
    fn run(&mut self, arg: RunArg<'_>) -> Result<()>;

    /// Optional capability: parse a plugin-native definition format into an
    /// appliance spec. `Ok(None)` means "not my format". Only consulted for
    /// descriptors flagged with `reads_native_definitions`.
    fn read_native_definition(
        &self,
        _definition: &Path,
        _build_root: &Path,
    ) -> Result<Option<ApplianceSpec>> {
        Ok(None)
    }
}

/// Immutable handoff between stages: the produced artifacts plus the identity
/// of the plugin that produced them.
#[derive(Debug, Clone)]
pub struct StageResult {
    pub deliverables: Vec<PathBuf>,
    pub producer: PluginInfo,
}
