//! Pipeline orchestrator: OS build, then optional platform conversion, then
//! optional delivery.
//!
//! Each stage consults the plugin's existence check before running it, so a
//! re-invoked build reuses whatever deliverables survived the previous run.
//! Deliverables are never rolled back on failure; leaving them on disk *is*
//! the caching mechanism.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, info};

use crate::config::BuildConfig;
use crate::plugin::{
    PluginDescriptor, PluginRegistry, RegistryError, RunArg, StageContext, StageKind, StageResult,
};
use crate::spec::ApplianceSpec;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("no operating system plugins installed; install one or more OS plugins")]
    NoOsPluginsInstalled,

    #[error("unsupported operating system '{name}'; installed OS plugins: {}", .installed.join(", "))]
    UnsupportedOs { name: String, installed: Vec<String> },

    #[error("unsupported {os} version '{version}'; supported versions: {}", .supported.join(", "))]
    UnsupportedOsVersion {
        os: String,
        version: String,
        supported: Vec<String>,
    },

    #[error("platform '{0}' selected but no platform plugins are installed")]
    NoPlatformPluginsInstalled(String),

    #[error("no platform plugin named '{name}'; installed platform plugins: {}", .installed.join(", "))]
    PlatformNotFound { name: String, installed: Vec<String> },

    #[error("delivery method '{0}' selected but no delivery plugins are installed")]
    NoDeliveryPluginsInstalled(String),

    #[error("no delivery plugin named '{name}'; installed delivery plugins: {}", .installed.join(", "))]
    DeliveryNotFound { name: String, installed: Vec<String> },

    #[error("{kind} stage failed")]
    Stage {
        kind: StageKind,
        #[source]
        source: anyhow::Error,
    },
}

/// What a completed pipeline run produced.
#[derive(Debug)]
pub struct BuildOutcome {
    /// Result of the last artifact-producing stage (platform if configured,
    /// OS otherwise).
    pub result: StageResult,
    /// Whether a delivery stage actually ran.
    pub delivered: bool,
}

/// Resolve the OS plugin descriptor an appliance spec requires, validating
/// the declared version support. Shared between upfront definition
/// validation and the OS stage itself.
pub fn resolve_os_plugin<'r>(
    registry: &'r PluginRegistry,
    spec: &ApplianceSpec,
) -> Result<&'r PluginDescriptor, PipelineError> {
    if !registry.has_any(StageKind::Os) {
        return Err(PipelineError::NoOsPluginsInstalled);
    }

    let descriptor = registry
        .find(StageKind::Os, &spec.os.name)
        .map_err(|_| PipelineError::UnsupportedOs {
            name: spec.os.name.clone(),
            installed: registry.names(StageKind::Os),
        })?;

    if let Some(version) = &spec.os.version {
        if !descriptor.info.versions.iter().any(|v| v == version) {
            return Err(PipelineError::UnsupportedOsVersion {
                os: spec.os.name.clone(),
                version: version.clone(),
                supported: descriptor.info.versions.clone(),
            });
        }
    }

    Ok(descriptor)
}

/// Drives the three-stage plugin chain for one build.
pub struct PipelineOrchestrator<'a> {
    registry: &'a PluginRegistry,
    config: &'a BuildConfig,
}

impl<'a> PipelineOrchestrator<'a> {
    pub fn new(registry: &'a PluginRegistry, config: &'a BuildConfig) -> Self {
        Self { registry, config }
    }

    /// Run the chain: OS stage, then platform (or pass-through), then
    /// delivery (or nothing).
    pub fn build(
        &self,
        spec: &ApplianceSpec,
        definition: &Path,
    ) -> Result<BuildOutcome, PipelineError> {
        info!(
            "building '{}' appliance for {} architecture",
            spec.name, spec.hardware.arch
        );

        let os_result = self.execute_os_plugin(spec, definition)?;
        let result = self.execute_platform_plugin(spec, os_result)?;
        let delivered = self.execute_delivery_plugin(spec, &result)?;

        Ok(BuildOutcome { result, delivered })
    }

    fn execute_os_plugin(
        &self,
        spec: &ApplianceSpec,
        definition: &Path,
    ) -> Result<StageResult, PipelineError> {
        let descriptor = resolve_os_plugin(self.registry, spec)?;
        let info = descriptor.info.clone();
        let mut plugin = descriptor.instantiate();

        plugin
            .init(StageContext {
                spec: spec.clone(),
                config: self.config.clone(),
                plugin: info.clone(),
                previous_plugin: None,
                previous_deliverables: Vec::new(),
            })
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Os,
                source,
            })?;

        if plugin.deliverables_exist() {
            info!(
                "deliverables for the '{}' operating system plugin exist, skipping",
                info.name
            );
            return Ok(StageResult {
                deliverables: plugin.deliverables(),
                producer: info,
            });
        }

        debug!("executing operating system plugin for {}", spec.os.name);
        plugin
            .run(RunArg::Definition(definition))
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Os,
                source,
            })?;
        debug!("operating system plugin executed");

        Ok(StageResult {
            deliverables: plugin.deliverables(),
            producer: info,
        })
    }

    fn execute_platform_plugin(
        &self,
        spec: &ApplianceSpec,
        previous: StageResult,
    ) -> Result<StageResult, PipelineError> {
        let Some(name) = self.config.platform_selector() else {
            debug!("no platform selected, skipping platform conversion");
            return Ok(previous);
        };

        if !self.registry.has_any(StageKind::Platform) {
            return Err(PipelineError::NoPlatformPluginsInstalled(name.to_string()));
        }

        let (mut plugin, info) = self
            .registry
            .instantiate(StageKind::Platform, name)
            .map_err(|err| match err {
                RegistryError::PluginNotFound { name, .. } => PipelineError::PlatformNotFound {
                    name,
                    installed: self.registry.names(StageKind::Platform),
                },
                other => PipelineError::Stage {
                    kind: StageKind::Platform,
                    source: other.into(),
                },
            })?;

        plugin
            .init(StageContext {
                spec: spec.clone(),
                config: self.config.clone(),
                plugin: info.clone(),
                previous_plugin: Some(previous.producer.clone()),
                previous_deliverables: previous.deliverables.clone(),
            })
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Platform,
                source,
            })?;

        if plugin.deliverables_exist() {
            info!(
                "deliverables for the '{}' platform plugin exist, skipping",
                info.name
            );
            return Ok(StageResult {
                deliverables: plugin.deliverables(),
                producer: info,
            });
        }

        debug!("executing platform plugin for {name}");
        plugin
            .run(RunArg::Convert)
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Platform,
                source,
            })?;
        debug!("platform plugin executed");

        Ok(StageResult {
            deliverables: plugin.deliverables(),
            producer: info,
        })
    }

    fn execute_delivery_plugin(
        &self,
        spec: &ApplianceSpec,
        previous: &StageResult,
    ) -> Result<bool, PipelineError> {
        let Some(method) = self.config.delivery_selector() else {
            debug!("no delivery method selected, skipping delivery");
            return Ok(false);
        };

        if !self.registry.has_any(StageKind::Delivery) {
            return Err(PipelineError::NoDeliveryPluginsInstalled(method.to_string()));
        }

        let (mut plugin, info) = self
            .registry
            .instantiate(StageKind::Delivery, method)
            .map_err(|err| match err {
                RegistryError::PluginNotFound { name, .. } => PipelineError::DeliveryNotFound {
                    name,
                    installed: self.registry.names(StageKind::Delivery),
                },
                other => PipelineError::Stage {
                    kind: StageKind::Delivery,
                    source: other.into(),
                },
            })?;

        plugin
            .init(StageContext {
                spec: spec.clone(),
                config: self.config.clone(),
                plugin: info,
                previous_plugin: Some(previous.producer.clone()),
                previous_deliverables: previous.deliverables.clone(),
            })
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Delivery,
                source,
            })?;

        // Delivery mutates an external system, so there is no existence
        // check to consult; it always runs.
        plugin
            .run(RunArg::Deliver(method))
            .map_err(|source| PipelineError::Stage {
                kind: StageKind::Delivery,
                source,
            })?;

        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{PluginDescriptor, PluginInfo, StagePlugin};
    use anyhow::Result;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CallLog {
        calls: Mutex<Vec<String>>,
    }

    impl CallLog {
        fn push(&self, entry: impl Into<String>) {
            self.calls.lock().unwrap().push(entry.into());
        }

        fn entries(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct FakePlugin {
        label: &'static str,
        log: Arc<CallLog>,
        built: Arc<AtomicBool>,
        deliverables: Vec<PathBuf>,
        fail_run: bool,
    }

    impl StagePlugin for FakePlugin {
        fn init(&mut self, ctx: StageContext) -> Result<()> {
            self.log.push(format!(
                "init:{}:prev={}",
                self.label,
                ctx.previous_plugin
                    .as_ref()
                    .map(|p| p.name.as_str())
                    .unwrap_or("-")
            ));
            Ok(())
        }

        fn deliverables_exist(&self) -> bool {
            self.built.load(Ordering::SeqCst)
        }

        fn deliverables(&self) -> Vec<PathBuf> {
            self.deliverables.clone()
        }

        fn run(&mut self, arg: RunArg<'_>) -> Result<()> {
            let arg = match arg {
                RunArg::Definition(path) => format!("definition={}", path.display()),
                RunArg::Convert => "convert".to_string(),
                RunArg::Deliver(method) => format!("deliver={method}"),
            };
            self.log.push(format!("run:{}:{arg}", self.label));
            if self.fail_run {
                anyhow::bail!("{} exploded", self.label);
            }
            self.built.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeStage {
        log: Arc<CallLog>,
        built: Arc<AtomicBool>,
    }

    fn fake_descriptor(
        info: PluginInfo,
        label: &'static str,
        deliverables: &[&str],
        fail_run: bool,
    ) -> (PluginDescriptor, FakeStage) {
        let log = Arc::new(CallLog::default());
        let built = Arc::new(AtomicBool::new(false));
        let deliverables: Vec<PathBuf> = deliverables.iter().map(PathBuf::from).collect();
        let stage = FakeStage {
            log: log.clone(),
            built: built.clone(),
        };
        let descriptor = PluginDescriptor::new(info, move || {
            Box::new(FakePlugin {
                label,
                log: log.clone(),
                built: built.clone(),
                deliverables: deliverables.clone(),
                fail_run,
            })
        });
        (descriptor, stage)
    }

    fn example_spec(os: &str, version: Option<&str>) -> ApplianceSpec {
        use crate::spec::{AppliancePaths, Hardware, OsSelector};
        ApplianceSpec {
            name: "example".to_string(),
            summary: None,
            os: OsSelector {
                name: os.to_string(),
                version: version.map(str::to_string),
            },
            hardware: Hardware {
                arch: "x86_64".to_string(),
                cpus: 1,
                memory_mb: 1024,
                disk_gb: 2,
            },
            paths: AppliancePaths {
                build: PathBuf::from("/build/example"),
            },
        }
    }

    fn os_info(name: &str, versions: &[&str]) -> PluginInfo {
        PluginInfo::new(StageKind::Os, name, name).with_versions(versions)
    }

    #[test]
    fn end_to_end_os_only_build() {
        let mut registry = PluginRegistry::new();
        let (descriptor, stage) = fake_descriptor(
            os_info("exampleos", &["1"]),
            "os",
            &["/build/out.img"],
            false,
        );
        registry.register(descriptor).unwrap();

        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", Some("1"));

        let outcome = orchestrator.build(&spec, Path::new("def.toml")).unwrap();
        assert!(!outcome.delivered);
        assert_eq!(outcome.result.deliverables, [PathBuf::from("/build/out.img")]);
        assert_eq!(outcome.result.producer.name, "exampleos");
        assert_eq!(
            stage.log.entries(),
            ["init:os:prev=-", "run:os:definition=def.toml"]
        );
    }

    #[test]
    fn second_build_skips_cached_os_stage() {
        let mut registry = PluginRegistry::new();
        let (descriptor, stage) = fake_descriptor(
            os_info("exampleos", &["1"]),
            "os",
            &["/build/out.img"],
            false,
        );
        registry.register(descriptor).unwrap();

        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", Some("1"));

        let first = orchestrator.build(&spec, Path::new("def.toml")).unwrap();
        let second = orchestrator.build(&spec, Path::new("def.toml")).unwrap();

        assert_eq!(first.result.deliverables, second.result.deliverables);
        // The second invocation only re-initializes; run is never called again.
        assert_eq!(
            stage.log.entries(),
            [
                "init:os:prev=-",
                "run:os:definition=def.toml",
                "init:os:prev=-"
            ]
        );
    }

    #[test]
    fn platform_none_passes_os_result_through_unchanged() {
        let mut registry = PluginRegistry::new();
        let (descriptor, _stage) =
            fake_descriptor(os_info("exampleos", &[]), "os", &["/build/a.raw"], false);
        registry.register(descriptor).unwrap();

        let config = BuildConfig {
            platform: Some("none".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let outcome = orchestrator.build(&spec, Path::new("def.toml")).unwrap();
        assert_eq!(outcome.result.producer.kind, StageKind::Os);
        assert_eq!(outcome.result.deliverables, [PathBuf::from("/build/a.raw")]);
    }

    #[test]
    fn platform_stage_chains_previous_result() {
        let mut registry = PluginRegistry::new();
        let (os_desc, _os_stage) =
            fake_descriptor(os_info("exampleos", &[]), "os", &["/build/a.raw"], false);
        let (platform_desc, platform_stage) = fake_descriptor(
            PluginInfo::new(StageKind::Platform, "vmware", "VMware"),
            "platform",
            &["/build/a.vmdk"],
            false,
        );
        registry.register(os_desc).unwrap();
        registry.register(platform_desc).unwrap();

        let config = BuildConfig {
            platform: Some("vmware".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let outcome = orchestrator.build(&spec, Path::new("def.toml")).unwrap();
        assert_eq!(outcome.result.producer.name, "vmware");
        assert_eq!(outcome.result.deliverables, [PathBuf::from("/build/a.vmdk")]);
        assert_eq!(
            platform_stage.log.entries(),
            ["init:platform:prev=exampleos", "run:platform:convert"]
        );
    }

    #[test]
    fn delivery_stage_receives_method_and_previous_producer() {
        let mut registry = PluginRegistry::new();
        let (os_desc, _os_stage) =
            fake_descriptor(os_info("exampleos", &[]), "os", &["/build/a.raw"], false);
        let (delivery_desc, delivery_stage) = fake_descriptor(
            PluginInfo::new(StageKind::Delivery, "sftp", "SFTP"),
            "delivery",
            &[],
            false,
        );
        registry.register(os_desc).unwrap();
        registry.register(delivery_desc).unwrap();

        let config = BuildConfig {
            delivery: Some("sftp".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let outcome = orchestrator.build(&spec, Path::new("def.toml")).unwrap();
        assert!(outcome.delivered);
        assert_eq!(
            delivery_stage.log.entries(),
            ["init:delivery:prev=exampleos", "run:delivery:deliver=sftp"]
        );
    }

    #[test]
    fn no_os_plugins_installed_is_fatal() {
        let registry = PluginRegistry::new();
        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        assert!(matches!(err, PipelineError::NoOsPluginsInstalled));
    }

    #[test]
    fn unknown_os_lists_installed_plugins() {
        let mut registry = PluginRegistry::new();
        let (fedora, _) = fake_descriptor(os_info("fedora", &[]), "os", &[], false);
        let (centos, _) = fake_descriptor(os_info("centos", &[]), "os", &[], false);
        registry.register(fedora).unwrap();
        registry.register(centos).unwrap();

        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("ubuntu", None);

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        match &err {
            PipelineError::UnsupportedOs { name, installed } => {
                assert_eq!(name, "ubuntu");
                assert_eq!(installed, &["fedora".to_string(), "centos".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unsupported_os_version_lists_supported_versions() {
        let mut registry = PluginRegistry::new();
        let (descriptor, _) =
            fake_descriptor(os_info("fedora", &["40", "41"]), "os", &[], false);
        registry.register(descriptor).unwrap();

        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("fedora", Some("12"));

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, PipelineError::UnsupportedOsVersion { .. }));
        assert!(message.contains("40, 41"), "message: {message}");
    }

    #[test]
    fn missing_version_constraint_accepts_any_plugin() {
        let mut registry = PluginRegistry::new();
        let (descriptor, _) = fake_descriptor(os_info("fedora", &["41"]), "os", &[], false);
        registry.register(descriptor).unwrap();

        let config = BuildConfig::default();
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("fedora", None);

        assert!(orchestrator.build(&spec, Path::new("def.toml")).is_ok());
    }

    #[test]
    fn configured_platform_with_no_plugins_is_fatal() {
        let mut registry = PluginRegistry::new();
        let (os_desc, _) = fake_descriptor(os_info("exampleos", &[]), "os", &[], false);
        registry.register(os_desc).unwrap();

        let config = BuildConfig {
            platform: Some("vmware".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        assert!(matches!(err, PipelineError::NoPlatformPluginsInstalled(_)));
    }

    #[test]
    fn unknown_delivery_method_is_fatal() {
        let mut registry = PluginRegistry::new();
        let (os_desc, _) = fake_descriptor(os_info("exampleos", &[]), "os", &[], false);
        let (delivery_desc, _) = fake_descriptor(
            PluginInfo::new(StageKind::Delivery, "sftp", "SFTP"),
            "delivery",
            &[],
            false,
        );
        registry.register(os_desc).unwrap();
        registry.register(delivery_desc).unwrap();

        let config = BuildConfig {
            delivery: Some("s3".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        match err {
            PipelineError::DeliveryNotFound { name, installed } => {
                assert_eq!(name, "s3");
                assert_eq!(installed, ["sftp".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn stage_failure_aborts_the_chain() {
        let mut registry = PluginRegistry::new();
        let (os_desc, _) = fake_descriptor(os_info("exampleos", &[]), "os", &[], true);
        let (delivery_desc, delivery_stage) = fake_descriptor(
            PluginInfo::new(StageKind::Delivery, "sftp", "SFTP"),
            "delivery",
            &[],
            false,
        );
        registry.register(os_desc).unwrap();
        registry.register(delivery_desc).unwrap();

        let config = BuildConfig {
            delivery: Some("sftp".to_string()),
            ..BuildConfig::default()
        };
        let orchestrator = PipelineOrchestrator::new(&registry, &config);
        let spec = example_spec("exampleos", None);

        let err = orchestrator.build(&spec, Path::new("def.toml")).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Stage {
                kind: StageKind::Os,
                ..
            }
        ));
        // Delivery never ran.
        assert!(delivery_stage.log.entries().is_empty());
    }
}
