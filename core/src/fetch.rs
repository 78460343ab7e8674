//! Cache-busted JSON retrieval for run artifacts.
//!
//! Artifacts are regenerated in place under stable filenames, so every
//! request defeats intermediate caches: a `t=<epoch-ms>` query parameter
//! plus `Cache-Control: no-store`. This layer performs no retries and no
//! legacy fallback; callers own that policy.

use chrono::Utc;
use reqwest::StatusCode;
use reqwest::header;
use serde_json::Value;
use url::Url;

use crate::config::SyncConfig;
use crate::error::FetchError;

/// Required model-data artifact.
pub const MODEL_RESULTS_FILE: &str = "modelResults.json";
/// Optional model-data artifact; missing or invalid degrades to zeros.
pub const DOSE_EFFECTS_FILE: &str = "doseEffects.json";
/// Optional model-data artifact; missing or invalid degrades to zeros.
pub const SAMPLE_DESCRIPTIVES_FILE: &str = "sampleDescriptives.json";
/// Optional, informational pipeline metadata.
pub const DATA_METADATA_FILE: &str = "dataMetadata.json";
/// Run catalog, served from the results root.
pub const RUNS_INDEX_FILE: &str = "runs_index.json";
/// Per-run metadata record.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Resolves artifact roots and performs cache-busted JSON GETs.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: reqwest::Client,
    results_root: Url,
    legacy_root: Url,
}

impl ArtifactFetcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_client(reqwest::Client::new(), config)
    }

    /// Uses a caller-supplied HTTP client. Useful for tests.
    pub fn with_client(client: reqwest::Client, config: &SyncConfig) -> Self {
        Self {
            client,
            results_root: config.results_root.clone(),
            legacy_root: config.legacy_data_root.clone(),
        }
    }

    /// The results catalog root (`runs_index.json` and per-run folders).
    pub fn results_root(&self) -> &Url {
        &self.results_root
    }

    /// Base location for model-data artifacts.
    ///
    /// With a run id this is the run-scoped folder under the results root;
    /// without one it is the legacy unscoped root kept for environments
    /// that have no run catalog.
    pub fn resolve_base(&self, run_id: Option<&str>) -> Url {
        match run_id {
            Some(id) => {
                let mut base = self.results_root.clone();
                if let Ok(mut segments) = base.path_segments_mut() {
                    segments.pop_if_empty().push(id).push("");
                }
                base
            }
            None => self.legacy_root.clone(),
        }
    }

    /// Fetch one JSON artifact from `base`.
    ///
    /// Non-2xx responses surface as typed errors; a 404 gets its own
    /// variant so callers can treat optional artifacts as absent rather
    /// than failed.
    pub async fn fetch_json(&self, base: &Url, filename: &str) -> Result<Value, FetchError> {
        let mut url = base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(filename);
        }
        url.query_pairs_mut()
            .append_pair("t", &Utc::now().timestamp_millis().to_string());

        let response = self
            .client
            .get(url.clone())
            .header(header::CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                url: url.to_string(),
                source,
            })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
    }
}
