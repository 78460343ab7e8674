//! Run catalog and per-run manifests.
//!
//! The registry is deliberately forgiving: a broken catalog or manifest is
//! logged and reported as "nothing there" rather than an error, so the
//! consuming session keeps whatever data it already has.

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::error::ValidationError;
use crate::fetch::{ArtifactFetcher, MANIFEST_FILE, RUNS_INDEX_FILE};
use crate::schema::{ArtifactKind, ArtifactValidator};

/// One entry in `runs_index.json`. Immutable once listed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: String,
    /// ISO-8601; drives the newest-first catalog ordering.
    pub timestamp: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub manifest_path: Option<String>,
}

/// Pipeline execution mode recorded in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Smoke,
    Main,
    FullDeploy,
}

/// Estimation settings recorded by the pipeline for one run.
///
/// The producer abbreviates some keys (`bootstrap`, `CI`, `N`); aliases
/// absorb both spellings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestSettings {
    #[serde(default)]
    pub seed: Option<i64>,
    #[serde(default, alias = "sampleSizeTarget", alias = "N")]
    pub sample_size_target: Option<u64>,
    #[serde(default)]
    pub estimator: Option<String>,
    #[serde(default, alias = "bootstrapIterations", alias = "bootstrap")]
    pub bootstrap_iterations: Option<u64>,
    #[serde(default, alias = "confidenceIntervalKind", alias = "CI")]
    pub confidence_interval_kind: Option<String>,
    /// Subgroup-analysis toggles; `null` means "producer default".
    #[serde(default, alias = "groupFlags", alias = "groups")]
    pub group_flags: BTreeMap<String, Option<bool>>,
}

/// Relative locations of the files one run produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestArtifacts {
    #[serde(default, alias = "fitMeasuresPath", alias = "fit_measures")]
    pub fit_measures_path: Option<String>,
    #[serde(default, alias = "parametersPath", alias = "parameters")]
    pub parameters_path: Option<String>,
    #[serde(
        default,
        alias = "executedModelSyntaxPath",
        alias = "executed_model_syntax"
    )]
    pub executed_model_syntax_path: Option<String>,
    #[serde(
        default,
        alias = "verificationChecklistPath",
        alias = "verification_checklist"
    )]
    pub verification_checklist_path: Option<String>,
    #[serde(default, alias = "bootstrapResultsPath", alias = "bootstrap_results")]
    pub bootstrap_results_path: Option<String>,
    #[serde(default, alias = "tablePaths", alias = "tables")]
    pub table_paths: Vec<String>,
    #[serde(default, alias = "figurePaths", alias = "figures")]
    pub figure_paths: Vec<String>,
}

/// A run's metadata record, fetched lazily and on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub timestamp: String,
    pub mode: RunMode,
    #[serde(default)]
    pub settings: ManifestSettings,
    #[serde(default)]
    pub artifacts: ManifestArtifacts,
    /// Set once the Python table/figure stage finished (RFC3339).
    #[serde(default)]
    pub python_stage_completed: Option<String>,
}

/// Lists available runs and fetches per-run manifests.
pub struct RunRegistry {
    fetcher: ArtifactFetcher,
    validator: ArtifactValidator,
}

impl RunRegistry {
    pub fn new(fetcher: ArtifactFetcher) -> Result<Self, ValidationError> {
        Ok(Self {
            fetcher,
            validator: ArtifactValidator::new()?,
        })
    }

    /// Fetch the run catalog, newest first.
    ///
    /// The producer claims to write the index newest-first, but that
    /// ordering is re-established here before anyone relies on "first
    /// entry = latest". Any failure returns an empty list.
    pub async fn list_runs(&self) -> Vec<Run> {
        let raw = match self
            .fetcher
            .fetch_json(self.fetcher.results_root(), RUNS_INDEX_FILE)
            .await
        {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(error = %err, "run catalog unavailable");
                return Vec::new();
            }
        };

        let mut runs: Vec<Run> = match self.validator.validate(ArtifactKind::RunsIndex, &raw) {
            Ok(runs) => runs,
            Err(err) => {
                tracing::warn!(error = %err, "run catalog failed validation");
                return Vec::new();
            }
        };

        // Unparseable timestamps sink to the end; ties fall back to
        // reverse lexicographic, matching the producer's run-id convention.
        runs.sort_by(|a, b| {
            let ka = (timestamp_millis(a), a.timestamp.as_str());
            let kb = (timestamp_millis(b), b.timestamp.as_str());
            kb.cmp(&ka)
        });
        runs
    }

    /// Fetch one run's manifest. `None` on any failure.
    pub async fn get_manifest(&self, run_id: &str) -> Option<RunManifest> {
        let base = self.fetcher.resolve_base(Some(run_id));
        let raw = match self.fetcher.fetch_json(&base, MANIFEST_FILE).await {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(run_id, error = %err, "manifest unavailable");
                return None;
            }
        };

        match self.validator.validate(ArtifactKind::RunManifest, &raw) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                tracing::warn!(run_id, error = %err, "manifest failed validation");
                None
            }
        }
    }

    /// Absolute URL of a file the manifest references. Pure composition,
    /// no I/O.
    pub fn artifact_url(&self, run_id: &str, relative_path: &str) -> Url {
        let mut url = self.fetcher.resolve_base(Some(run_id));
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty();
            for part in relative_path.split('/').filter(|p| !p.is_empty()) {
                segments.push(part);
            }
        }
        url
    }
}

fn timestamp_millis(run: &Run) -> i64 {
    DateTime::parse_from_rfc3339(&run.timestamp)
        .map(|dt| dt.timestamp_millis())
        .unwrap_or(i64::MIN)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn manifest_absorbs_producer_abbreviations() {
        let manifest: RunManifest = serde_json::from_value(serde_json::json!({
            "run_id": "run_20240201",
            "timestamp": "2024-02-01T00:00:00Z",
            "mode": "full_deploy",
            "settings": {
                "seed": 1234,
                "bootstrap": 2000,
                "CI": "perc",
                "groups": { "re_all": true, "sex": null }
            },
            "artifacts": {
                "fit_measures": "raw/structural_fitMeasures.txt",
                "tables": ["Dissertation_Tables.docx"],
                "figures": ["descriptives.png"]
            },
            "python_stage_completed": "2024-02-01T00:10:00"
        }))
        .unwrap();

        assert_eq!(manifest.mode, RunMode::FullDeploy);
        assert_eq!(manifest.settings.bootstrap_iterations, Some(2000));
        assert_eq!(
            manifest.settings.confidence_interval_kind.as_deref(),
            Some("perc")
        );
        assert_eq!(manifest.settings.group_flags["re_all"], Some(true));
        assert_eq!(manifest.settings.group_flags["sex"], None);
        assert_eq!(
            manifest.artifacts.fit_measures_path.as_deref(),
            Some("raw/structural_fitMeasures.txt")
        );
        assert_eq!(manifest.artifacts.table_paths.len(), 1);
        assert!(manifest.python_stage_completed.is_some());
    }

    #[test]
    fn manifest_settings_default_when_absent() {
        let manifest: RunManifest = serde_json::from_value(serde_json::json!({
            "run_id": "run_1",
            "timestamp": "2024-01-01T00:00:00Z",
            "mode": "smoke"
        }))
        .unwrap();
        assert_eq!(manifest.settings, ManifestSettings::default());
        assert_eq!(manifest.artifacts, ManifestArtifacts::default());
    }

    #[test]
    fn artifact_url_is_pure_composition() {
        let config = crate::config::SyncConfig::from_toml_str(
            r#"results_root = "http://host.test/results/""#,
        )
        .unwrap();
        let registry = RunRegistry::new(ArtifactFetcher::new(&config)).unwrap();

        let url = registry.artifact_url("run_1", "tables/Dissertation_Tables.docx");
        assert_eq!(
            url.as_str(),
            "http://host.test/results/run_1/tables/Dissertation_Tables.docx"
        );
    }
}
