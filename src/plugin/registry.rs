//! Plugin registry: the set of known stage implementations.
//!
//! Populated once at startup and read-only afterwards, so lookups need no
//! locking. Registration order is preserved; error messages list plugins in
//! that order so diagnostics stay deterministic.

use thiserror::Error;

use super::{PluginDescriptor, PluginInfo, StageKind, StagePlugin};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("a {kind} plugin named '{name}' is already registered")]
    DuplicateRegistration { kind: StageKind, name: String },

    #[error("no {kind} plugin named '{name}'; registered {kind} plugins: {}", format_names(.registered))]
    PluginNotFound {
        kind: StageKind,
        name: String,
        registered: Vec<String>,
    },
}

fn format_names(names: &[String]) -> String {
    if names.is_empty() {
        "(none)".to_string()
    } else {
        names.join(", ")
    }
}

/// Registry of stage plugins, grouped by kind and keyed by name.
#[derive(Debug, Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginDescriptor>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a descriptor. Fails if `(kind, name)` is already taken.
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Result<(), RegistryError> {
        let info = &descriptor.info;
        if self
            .plugins
            .iter()
            .any(|d| d.info.kind == info.kind && d.info.name == info.name)
        {
            return Err(RegistryError::DuplicateRegistration {
                kind: info.kind,
                name: info.name.clone(),
            });
        }
        self.plugins.push(descriptor);
        Ok(())
    }

    /// Look up a descriptor by kind and name.
    pub fn find(&self, kind: StageKind, name: &str) -> Result<&PluginDescriptor, RegistryError> {
        self.plugins
            .iter()
            .find(|d| d.info.kind == kind && d.info.name == name)
            .ok_or_else(|| RegistryError::PluginNotFound {
                kind,
                name: name.to_string(),
                registered: self.names(kind),
            })
    }

    /// Instantiate a plugin, returning the live instance and its identity.
    pub fn instantiate(
        &self,
        kind: StageKind,
        name: &str,
    ) -> Result<(Box<dyn StagePlugin>, PluginInfo), RegistryError> {
        let descriptor = self.find(kind, name)?;
        Ok((descriptor.instantiate(), descriptor.info.clone()))
    }

    /// Registered names of one kind, in registration order.
    pub fn names(&self, kind: StageKind) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|d| d.info.kind == kind)
            .map(|d| d.info.name.clone())
            .collect()
    }

    /// Whether any plugin of the given kind is registered.
    pub fn has_any(&self, kind: StageKind) -> bool {
        self.plugins.iter().any(|d| d.info.kind == kind)
    }

    /// Descriptors of one kind, in registration order.
    pub fn descriptors(&self, kind: StageKind) -> impl Iterator<Item = &PluginDescriptor> {
        self.plugins.iter().filter(move |d| d.info.kind == kind)
    }
}
