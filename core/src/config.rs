//! Configuration for the synchronization layer.
//!
//! Loaded from TOML with full defaults, so an empty file (or no file at
//! all) yields a working local setup.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// Seconds between poll cycles while a run is selected.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

const DEFAULT_RESULTS_ROOT: &str = "http://localhost:8080/results/";
const DEFAULT_LEGACY_DATA_ROOT: &str = "http://localhost:8080/data/";

/// Settings for artifact retrieval and polling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Root serving `runs_index.json` and the per-run artifact folders.
    pub results_root: Url,

    /// Legacy unscoped artifact root, used only when no run is selected.
    pub legacy_data_root: Url,

    /// Poll interval in seconds while a run is selected.
    pub poll_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            results_root: parse_default_url(DEFAULT_RESULTS_ROOT),
            legacy_data_root: parse_default_url(DEFAULT_LEGACY_DATA_ROOT),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
        }
    }
}

fn parse_default_url(raw: &str) -> Url {
    match Url::parse(raw) {
        Ok(url) => url,
        // Both defaults are compile-time constants; this arm is unreachable
        // on any input the crate ships with.
        Err(err) => unreachable!("default URL {raw} must parse: {err}"),
    }
}

impl SyncConfig {
    /// Parse a TOML document. Missing keys fall back to defaults.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    /// Load from a TOML file on disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}
