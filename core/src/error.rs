//! Error taxonomy for the synchronization layer.
//!
//! Three families, matching the boundaries they cross:
//! - [`FetchError`]: transport and HTTP-status failures from artifact
//!   retrieval. Whether a given failure aborts a sync cycle is the caller's
//!   policy, not this type's.
//! - [`ValidationError`]: an artifact payload that does not match its
//!   schema. Never raised as a panic; the assembler folds these into the
//!   published `validation` block.
//! - [`SyncError`]: misuse of a controller handle. The one representable
//!   usage error is driving a handle whose controller task has been torn
//!   down.

use thiserror::Error;

/// Failure retrieving a single artifact over HTTP.
///
/// No retry or fallback happens at this level; the sync cycle decides
/// whether a variant is fatal (required artifact) or degrades to an absent
/// value (optional artifact).
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure (DNS, connect, TLS, timeout).
    #[error("network error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The artifact does not exist at the resolved location (HTTP 404).
    #[error("artifact not found: {url}")]
    NotFound { url: String },

    /// Any other non-2xx response.
    #[error("unexpected HTTP status {status} fetching {url}")]
    Status { status: u16, url: String },

    /// The response body was not valid JSON.
    #[error("invalid JSON from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// True for the 404 sentinel used by optional-artifact handling.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::NotFound { .. })
    }
}

/// A schema mismatch in one artifact, traceable to its source file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{source_name}: {message}")]
pub struct ValidationError {
    /// Artifact filename the failure came from (e.g. `doseEffects.json`).
    pub source_name: &'static str,
    pub message: String,
}

impl ValidationError {
    pub fn new(source_name: &'static str, message: impl Into<String>) -> Self {
        Self {
            source_name,
            message: message.into(),
        }
    }
}

/// Failure loading or parsing a [`SyncConfig`](crate::config::SyncConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Misuse of a [`SyncHandle`](crate::controller::SyncHandle).
#[derive(Debug, Error)]
pub enum SyncError {
    /// The controller task has exited (session torn down); the handle is
    /// dead and commands can no longer be delivered.
    #[error("sync controller is gone; the handle outlived its session")]
    ControllerGone,
}
