//! Daemon configuration file.
//!
//! ```toml
//! manifest_path = "/etc/reconciler/manifest.json"
//! runtime_dir = "/var/lib/reconciler/runtime"
//! poll_interval_ms = 2000
//!
//! [installer]
//! max_attempts = 5
//! grace_period_secs = 60
//!
//! [[override_rules]]
//! scheme = "hotfix"
//! priority = 100
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reconciler_core::{InstallerConfig, OverrideRule};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{DaemonError, DaemonResult};

/// Top-level daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Installer tuning
    #[serde(default)]
    pub installer: InstallerConfig,

    /// Manifest watched by the file producer; none disables it
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    /// Where the file processors materialize resources
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,

    /// Fallback manifest check interval; file events trigger checks sooner
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Priority overrides applied at startup
    #[serde(default)]
    pub override_rules: Vec<OverrideRule>,
}

fn default_runtime_dir() -> PathBuf {
    PathBuf::from("/var/lib/reconciler/runtime")
}

fn default_poll_interval() -> u64 {
    2000
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            installer: InstallerConfig::default(),
            manifest_path: None,
            runtime_dir: default_runtime_dir(),
            poll_interval_ms: default_poll_interval(),
            override_rules: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Loads and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| DaemonError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| DaemonError::Config {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file, falling back to defaults if it does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> DaemonResult<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(path)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> DaemonResult<()> {
        self.installer.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(DaemonError::Config {
                path: PathBuf::from("poll_interval_ms"),
                message: "must be > 0".to_string(),
            });
        }
        Ok(())
    }

    /// Fallback manifest poll interval.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
