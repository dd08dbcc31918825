//! Appliance build pipeline and delivery tooling.
//!
//! Turns a small appliance definition file into a virtual machine image and
//! optionally ships it somewhere, through a chain of three plugin-backed
//! stages:
//!
//! - **Operating system** - builds the base disk image from the definition
//! - **Platform** - converts the image for a virtualization platform
//! - **Delivery** - pushes the result to a remote destination
//!
//! Each stage caches through its deliverables: when a stage's outputs
//! already exist on disk the stage is skipped and the existing files are
//! reused. Delivery uses an incremental uploader that compares checksums and
//! skips files the remote side already has.
//!
//! [`Appliance`] is the entry point; it wires the registry, configuration
//! and pipeline together for one build.

pub mod appliance;
pub mod config;
pub mod exec;
pub mod package;
pub mod pipeline;
pub mod plugin;
pub mod plugins;
pub mod preflight;
pub mod spec;
pub mod sync;

pub use appliance::Appliance;
pub use config::BuildConfig;
pub use pipeline::{BuildOutcome, PipelineError, PipelineOrchestrator};
pub use plugin::{
    PluginDescriptor, PluginInfo, PluginRegistry, RunArg, StageContext, StageKind, StagePlugin,
    StageResult,
};
pub use spec::ApplianceSpec;
pub use sync::{RemoteConnection, RemoteStat, SyncUploader, TransferManifest, TransferSummary};
