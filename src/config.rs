//! Build configuration: stage selectors plus per-plugin settings.
//!
//! Loaded from TOML, either an explicit `--config` path or the user default
//! at `~/.appliance-builder/config.toml`. Plugin sections are kept as raw
//! TOML tables so each plugin can deserialize its own typed settings.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Field-name fragments whose values are hidden when the configuration is
/// logged. Matches on substring, case-insensitive.
const SENSITIVE_FIELDS: &[&str] = &["key", "account", "cert", "username", "host", "password"];

const REDACTION_MARKER: &str = "<REDACTED>";

const USER_CONFIG_DIR: &str = ".appliance-builder";
const USER_CONFIG_FILE: &str = "config.toml";

/// Top-level builder configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BuildConfig {
    /// Remove previous build output before running the pipeline.
    pub force: bool,
    /// Platform plugin selector; `none` or empty means pass-through.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Delivery plugin selector; `none` or empty means nothing is delivered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delivery: Option<String>,
    /// Per-plugin configuration tables, e.g. `[plugins.sftp]`.
    pub plugins: BTreeMap<String, toml::Value>,
}

impl BuildConfig {
    /// Load configuration from `path`, or from the user default location when
    /// no path is given. A missing default file yields the default config; a
    /// missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path.to_path_buf(), true),
            None => match default_config_path() {
                Some(path) => (path, false),
                None => return Ok(Self::default()),
            },
        };

        if !path.is_file() {
            if required {
                anyhow::bail!("configuration file not found: {}", path.display());
            }
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading configuration '{}'", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing configuration '{}'", path.display()))
    }

    /// Platform selector, with `none` and empty normalized away.
    pub fn platform_selector(&self) -> Option<&str> {
        normalize_selector(self.platform.as_deref())
    }

    /// Delivery selector, with `none` and empty normalized away.
    pub fn delivery_selector(&self) -> Option<&str> {
        normalize_selector(self.delivery.as_deref())
    }

    /// Raw configuration table for one plugin, if present.
    pub fn plugin_config(&self, name: &str) -> Option<&toml::Value> {
        self.plugins.get(name)
    }

    /// TOML rendering of the configuration with credential-looking values
    /// replaced by a fixed marker. Used for trace-level logging only.
    pub fn redacted(&self) -> Result<String> {
        let mut value =
            toml::Value::try_from(self).context("serializing configuration for redaction")?;
        redact_value(&mut value);
        toml::to_string(&value).context("rendering redacted configuration")
    }
}

fn normalize_selector(raw: Option<&str>) -> Option<&str> {
    match raw.map(str::trim) {
        None | Some("") => None,
        Some(s) if s.eq_ignore_ascii_case("none") => None,
        Some(s) => Some(s),
    }
}

fn is_sensitive_field(name: &str) -> bool {
    let lowered = name.to_ascii_lowercase();
    SENSITIVE_FIELDS.iter().any(|f| lowered.contains(f))
}

fn redact_value(value: &mut toml::Value) {
    match value {
        toml::Value::Table(table) => {
            for (key, entry) in table.iter_mut() {
                if is_sensitive_field(key) {
                    *entry = toml::Value::String(REDACTION_MARKER.to_string());
                } else {
                    redact_value(entry);
                }
            }
        }
        toml::Value::Array(items) => {
            for item in items.iter_mut() {
                redact_value(item);
            }
        }
        _ => {}
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(USER_CONFIG_DIR).join(USER_CONFIG_FILE))
}
