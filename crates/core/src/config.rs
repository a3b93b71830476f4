//! Runtime configuration shared by every settle component.
//!
//! Durations are stored as whole milliseconds so the files stay readable:
//!
//! ```toml
//! [resolution]
//! error_backoff_ms = 250
//!
//! [hooks]
//! dedicated_workers = false
//!
//! [hub]
//! failure_threshold = 5
//!
//! [admission]
//! name = "uploads"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Error;
use crate::result::Result;

/// Settings for resolution loops.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResolutionSettings {
    /// Wait after a progress callback fails before trying again.
    pub error_backoff_ms: u64,
}

impl Default for ResolutionSettings {
    fn default() -> Self {
        Self {
            error_backoff_ms: 250,
        }
    }
}

impl ResolutionSettings {
    /// Error backoff as a [`Duration`].
    #[must_use]
    pub const fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

/// Settings for lifecycle hook dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HookSettings {
    /// Run every hook on its own task instead of the ordered delivery worker.
    ///
    /// Enabling this gives up the exit-before-enter ordering guarantee.
    pub dedicated_workers: bool,
}

/// Settings for the event hub.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HubSettings {
    /// Consecutive listener failures before a subscriber is skipped.
    pub failure_threshold: u32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
        }
    }
}

/// Settings for admission schedulers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AdmissionSettings {
    /// Name used in log output.
    pub name: String,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            name: "admission".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SettleConfig {
    pub resolution: ResolutionSettings,
    pub hooks: HookSettings,
    pub hub: HubSettings,
    pub admission: AdmissionSettings,
}

impl SettleConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` on malformed input and `ConfigInvalid` when a
    /// value is out of range.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self = toml::from_str(input).map_err(|e| Error::TomlParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a YAML document.
    ///
    /// # Errors
    ///
    /// Returns `YamlParseFailed` on malformed input and `ConfigInvalid` when a
    /// value is out of range.
    pub fn from_yaml_str(input: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(input).map_err(|e| Error::YamlParseFailed {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file; `.yaml`/`.yml` are parsed as YAML, anything else as TOML.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, otherwise the
    /// parse or validation error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::file_read_failed(path, e.to_string()))?;

        let yaml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        );
        debug!(path = %path.display(), yaml, "Loading configuration");
        if yaml {
            Self::from_yaml_str(&contents)
        } else {
            Self::from_toml_str(&contents)
        }
    }

    /// Check value ranges.
    ///
    /// # Errors
    ///
    /// Returns `ConfigInvalid` naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.resolution.error_backoff_ms == 0 {
            return Err(Error::config_invalid(
                "resolution.error_backoff_ms must be greater than zero",
            ));
        }
        if self.hub.failure_threshold == 0 {
            return Err(Error::config_invalid(
                "hub.failure_threshold must be greater than zero",
            ));
        }
        if self.admission.name.trim().is_empty() {
            return Err(Error::config_invalid("admission.name must not be empty"));
        }
        Ok(())
    }
}
