//! Top-level appliance driver.
//!
//! Owns everything around one build: reading the definition file (native
//! plugin formats included), validating it against the installed plugins,
//! force-cleaning old output, holding the per-appliance build lock, running
//! the pipeline, and recording a build manifest next to the artifacts.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{debug, info, trace};

use crate::config::BuildConfig;
use crate::pipeline::{resolve_os_plugin, BuildOutcome, PipelineOrchestrator};
use crate::plugin::{PluginRegistry, StageKind};
use crate::spec::ApplianceSpec;

const BUILD_MANIFEST_FILENAME: &str = "build-manifest.json";
const LOCK_SUFFIX: &str = ".lock";

/// Record of one finished build, written next to the deliverables.
#[derive(Debug, Serialize)]
pub struct BuildRecord {
    pub appliance: String,
    pub os: String,
    pub os_version: Option<String>,
    pub arch: String,
    pub platform: Option<String>,
    pub delivery: Option<String>,
    pub delivered: bool,
    pub deliverables: Vec<String>,
    pub created_at_utc: String,
    pub finished_at_utc: String,
}

pub fn manifest_path(build_dir: &Path) -> PathBuf {
    build_dir.join(BUILD_MANIFEST_FILENAME)
}

/// Drives one appliance build end to end.
pub struct Appliance<'a> {
    registry: &'a PluginRegistry,
    config: BuildConfig,
    build_root: PathBuf,
}

impl<'a> Appliance<'a> {
    pub fn new(registry: &'a PluginRegistry, config: BuildConfig, build_root: &Path) -> Self {
        Self {
            registry,
            config,
            build_root: build_root.to_path_buf(),
        }
    }

    /// Build the appliance described by `definition`.
    pub fn create(&self, definition: &Path) -> Result<BuildOutcome> {
        match self.config.redacted() {
            Ok(rendered) => trace!("configuration:\n{}", rendered),
            Err(err) => debug!("configuration not renderable: {err:#}"),
        }

        let spec = self.read_definition(definition)?;
        resolve_os_plugin(self.registry, &spec)?;

        // Lock before any cleanup; a forced build must not delete state a
        // concurrent build is still using.
        let _lock = BuildLock::acquire(&spec.paths.build)?;
        if self.config.force {
            remove_old_builds(&spec.paths.build)?;
        }
        fs::create_dir_all(&spec.paths.build).with_context(|| {
            format!("creating build directory '{}'", spec.paths.build.display())
        })?;

        let created_at = now_utc()?;
        let outcome = PipelineOrchestrator::new(self.registry, &self.config)
            .build(&spec, definition)?;
        self.write_record(&spec, &outcome, created_at)?;
        Ok(outcome)
    }

    /// Parse the definition file. TOML definitions are read directly; any
    /// other format is offered to OS plugins that read native definitions,
    /// in registration order.
    fn read_definition(&self, definition: &Path) -> Result<ApplianceSpec> {
        if definition.extension().and_then(|e| e.to_str()) == Some("toml") {
            return ApplianceSpec::from_file(definition, &self.build_root);
        }

        for descriptor in self.registry.descriptors(StageKind::Os) {
            if !descriptor.info.reads_native_definitions {
                continue;
            }
            let plugin = descriptor.instantiate();
            if let Some(spec) = plugin.read_native_definition(definition, &self.build_root)? {
                debug!(
                    "definition '{}' read by the '{}' plugin",
                    definition.display(),
                    descriptor.info.name
                );
                return Ok(spec);
            }
        }

        let file_name = definition
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| definition.display().to_string());
        bail!("Couldn't read appliance definition file: {file_name}");
    }

    fn write_record(
        &self,
        spec: &ApplianceSpec,
        outcome: &BuildOutcome,
        created_at_utc: String,
    ) -> Result<()> {
        let record = BuildRecord {
            appliance: spec.name.clone(),
            os: spec.os.name.clone(),
            os_version: spec.os.version.clone(),
            arch: spec.hardware.arch.clone(),
            platform: self.config.platform_selector().map(str::to_string),
            delivery: self.config.delivery_selector().map(str::to_string),
            delivered: outcome.delivered,
            deliverables: outcome
                .result
                .deliverables
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
            created_at_utc,
            finished_at_utc: now_utc()?,
        };

        let path = manifest_path(&spec.paths.build);
        let rendered = serde_json::to_string_pretty(&record)
            .context("serializing the build manifest")?;
        fs::write(&path, rendered)
            .with_context(|| format!("writing build manifest '{}'", path.display()))?;
        info!("build manifest written to {}", path.display());
        Ok(())
    }
}

/// Remove previous build output for this appliance.
fn remove_old_builds(build_dir: &Path) -> Result<()> {
    if build_dir.exists() {
        info!("removing previous build from {}", build_dir.display());
        fs::remove_dir_all(build_dir).with_context(|| {
            format!("removing previous build '{}'", build_dir.display())
        })?;
    }
    Ok(())
}

fn now_utc() -> Result<String> {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .context("formatting the current time")
}

/// RAII guard: holds an exclusive lock on the build directory and removes
/// the lock file on drop. The lock file sits next to the build directory,
/// not inside it, so force-cleaning the directory cannot touch a held lock.
#[derive(Debug)]
struct BuildLock {
    _file: File,
    path: PathBuf,
}

impl BuildLock {
    fn acquire(build_dir: &Path) -> Result<Self> {
        let mut os = build_dir.as_os_str().to_os_string();
        os.push(LOCK_SUFFIX);
        let path = PathBuf::from(os);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating '{}'", parent.display()))?;
        }

        // Do not unlink "stale" lock files. Unlinking a still-locked file can
        // allow a second process to create a new lock file at the same path
        // and acquire a separate exclusive lock, defeating mutual exclusion.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("creating lock file '{}'", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            drop(file);
            bail!(
                "another build of this appliance is already running (lock: {})",
                path.display()
            );
        }

        Ok(Self { _file: file, path })
    }
}

impl Drop for BuildLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{
        PluginDescriptor, PluginInfo, RunArg, StageContext, StagePlugin,
    };
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct ScriptedOsPlugin {
        built: Arc<Mutex<Vec<String>>>,
        deliverable_dir: PathBuf,
        name: Option<String>,
    }

    impl StagePlugin for ScriptedOsPlugin {
        fn init(&mut self, ctx: StageContext) -> Result<()> {
            self.name = Some(ctx.spec.name.clone());
            Ok(())
        }

        fn deliverables_exist(&self) -> bool {
            false
        }

        fn deliverables(&self) -> Vec<PathBuf> {
            vec![self.deliverable_dir.join("disk.raw")]
        }

        fn run(&mut self, _arg: RunArg<'_>) -> Result<()> {
            let name = self.name.clone().unwrap_or_default();
            fs::write(self.deliverable_dir.join("disk.raw"), b"disk").unwrap();
            self.built.lock().unwrap().push(name);
            Ok(())
        }
    }

    fn registry_with_os(
        os_name: &str,
        deliverable_dir: &Path,
        built: Arc<Mutex<Vec<String>>>,
    ) -> PluginRegistry {
        let mut registry = PluginRegistry::new();
        let dir = deliverable_dir.to_path_buf();
        registry
            .register(PluginDescriptor::new(
                PluginInfo::new(StageKind::Os, os_name, os_name).with_versions(&["1"]),
                move || {
                    Box::new(ScriptedOsPlugin {
                        built: built.clone(),
                        deliverable_dir: dir.clone(),
                        name: None,
                    })
                },
            ))
            .unwrap();
        registry
    }

    fn write_definition(dir: &Path) -> PathBuf {
        let path = dir.join("web.toml");
        fs::write(
            &path,
            "name = \"web\"\n[os]\nname = \"exampleos\"\nversion = \"1\"\n[hardware]\narch = \"x86_64\"\n",
        )
        .unwrap();
        path
    }

    #[test]
    fn create_builds_and_writes_the_manifest() {
        let tmp = TempDir::new().unwrap();
        let built = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_os("exampleos", tmp.path(), built.clone());
        let definition = write_definition(tmp.path());

        let appliance = Appliance::new(&registry, BuildConfig::default(), tmp.path());
        let outcome = appliance.create(&definition).unwrap();

        assert!(!outcome.delivered);
        assert_eq!(built.lock().unwrap().as_slice(), ["web"]);

        let build_dir = tmp.path().join("x86_64/exampleos/1/web");
        let manifest = fs::read_to_string(manifest_path(&build_dir)).unwrap();
        assert!(manifest.contains("\"appliance\": \"web\""));
        assert!(manifest.contains("\"delivered\": false"));
        assert!(manifest.contains("disk.raw"));
    }

    #[test]
    fn unreadable_definition_names_the_file() {
        let tmp = TempDir::new().unwrap();
        let built = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_os("exampleos", tmp.path(), built);
        let definition = tmp.path().join("appliance.xyz");
        fs::write(&definition, "whatever").unwrap();

        let appliance = Appliance::new(&registry, BuildConfig::default(), tmp.path());
        let err = appliance.create(&definition).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Couldn't read appliance definition file: appliance.xyz"
        );
    }

    #[test]
    fn unknown_os_is_rejected_before_any_stage_runs() {
        let tmp = TempDir::new().unwrap();
        let built = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_os("otheros", tmp.path(), built.clone());
        let definition = write_definition(tmp.path());

        let appliance = Appliance::new(&registry, BuildConfig::default(), tmp.path());
        let err = appliance.create(&definition).unwrap_err();
        assert!(err.to_string().contains("unsupported operating system"));
        assert!(built.lock().unwrap().is_empty());
    }

    #[test]
    fn force_removes_previous_build_output() {
        let tmp = TempDir::new().unwrap();
        let built = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_os("exampleos", tmp.path(), built);
        let definition = write_definition(tmp.path());

        let build_dir = tmp.path().join("x86_64/exampleos/1/web");
        fs::create_dir_all(&build_dir).unwrap();
        let stale = build_dir.join("stale.raw");
        fs::write(&stale, b"old").unwrap();

        let mut config = BuildConfig::default();
        config.force = true;
        let appliance = Appliance::new(&registry, config, tmp.path());
        appliance.create(&definition).unwrap();

        assert!(!stale.exists());
        assert!(manifest_path(&build_dir).is_file());
    }

    #[test]
    fn concurrent_builds_of_one_appliance_are_locked_out() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("b")).unwrap();

        let first = BuildLock::acquire(&tmp.path().join("b")).unwrap();
        let second = BuildLock::acquire(&tmp.path().join("b"));
        assert!(second.is_err());
        drop(first);
        assert!(BuildLock::acquire(&tmp.path().join("b")).is_ok());
    }

    #[test]
    fn lock_survives_force_cleanup_of_the_build_directory() {
        let tmp = TempDir::new().unwrap();
        let build_dir = tmp.path().join("b");
        fs::create_dir_all(&build_dir).unwrap();

        let held = BuildLock::acquire(&build_dir).unwrap();
        // The cleanup a forced build performs on the directory.
        remove_old_builds(&build_dir).unwrap();
        fs::create_dir_all(&build_dir).unwrap();

        assert!(BuildLock::acquire(&build_dir).is_err());
        drop(held);
        assert!(BuildLock::acquire(&build_dir).is_ok());
    }

    #[test]
    fn forced_build_is_locked_out_while_another_build_runs() {
        let tmp = TempDir::new().unwrap();
        let built = Arc::new(Mutex::new(Vec::new()));
        let registry = registry_with_os("exampleos", tmp.path(), built.clone());
        let definition = write_definition(tmp.path());

        let build_dir = tmp.path().join("x86_64/exampleos/1/web");
        fs::create_dir_all(&build_dir).unwrap();
        let stale = build_dir.join("stale.raw");
        fs::write(&stale, b"old").unwrap();
        let held = BuildLock::acquire(&build_dir).unwrap();

        let mut config = BuildConfig::default();
        config.force = true;
        let appliance = Appliance::new(&registry, config, tmp.path());
        let err = appliance.create(&definition).unwrap_err();
        assert!(err.to_string().contains("already running"));
        // Nothing was cleaned or built while the lock was held.
        assert!(stale.exists());
        assert!(built.lock().unwrap().is_empty());
        drop(held);
    }
}
