//! Typed artifact payloads and the published `ModelData` view-model.
//!
//! Wire structs mirror the JSON the pipeline emits (camelCase blocks,
//! short producer keys like `se` absorbed via aliases). `ModelData` is the
//! stable, fully-defaulted view consumers read: every numeric field is
//! always a number, and a fresh value is produced per fetch cycle rather
//! than mutating the published one in place.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structural-path ids the view guarantees an entry for.
///
/// `a*` paths are treatment effects, `b*` mediator-to-outcome effects,
/// `c`/`cz` the direct effect and its dose moderation, `g*` covariate
/// paths.
pub const KEY_PATH_IDS: [&str; 11] = [
    "a1", "a1z", "a2", "a2z", "b1", "b2", "c", "cz", "g1", "g2", "g3",
];

/// Id of the total-effect path in the auxiliary total-effect model.
pub const TOTAL_EFFECT_PATH_ID: &str = "c_total";

/// One labelled parameter estimate in a structural model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralPath {
    pub id: String,
    pub estimate: f64,
    #[serde(default, alias = "se", alias = "standardError")]
    pub standard_error: Option<f64>,
    #[serde(default, alias = "pvalue", alias = "pValue")]
    pub p_value: Option<f64>,
    #[serde(default, alias = "ci", alias = "confidenceInterval")]
    pub confidence_interval: Option<[f64; 2]>,
}

/// `modelResults.json`: main model plus the auxiliary total-effect model.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResultsDoc {
    pub main_model: ModelBlock,
    #[serde(default)]
    pub total_effect_model: Option<ModelBlock>,
    #[serde(default)]
    pub bootstrap: Option<BootstrapBlock>,
}

/// One fitted model: its structural paths and fit measures.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelBlock {
    #[serde(default)]
    pub structural_paths: Vec<StructuralPath>,
    #[serde(default)]
    pub fit_measures: BTreeMap<String, f64>,
}

/// Estimation settings the producer recorded alongside the results.
#[derive(Debug, Clone, Deserialize)]
pub struct BootstrapBlock {
    #[serde(default)]
    pub n_replicates: Option<u64>,
    #[serde(default)]
    pub ci_type: Option<String>,
}

/// `doseEffects.json`: dose-response coefficients and precomputed series.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DoseEffectsDoc {
    pub coefficients: DoseCoefficientsWire,
    #[serde(default)]
    pub effects: Vec<Value>,
    #[serde(default)]
    pub credit_dose_range: Option<DoseRange>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoseCoefficientsWire {
    pub distress: DoseChannelWire,
    pub engagement: DoseChannelWire,
    pub adjustment: DoseChannelWire,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DoseChannelWire {
    pub main: f64,
    pub moderation: f64,
    #[serde(default, alias = "se", alias = "standardError")]
    pub standard_error: Option<f64>,
}

/// `sampleDescriptives.json`: sample size and the FASt-flag breakdown.
#[derive(Debug, Clone, Deserialize)]
pub struct SampleDescriptivesDoc {
    pub n: u64,
    #[serde(default)]
    pub demographics: Demographics,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Demographics {
    #[serde(default)]
    pub fast: Option<FlagBreakdown>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagBreakdown {
    #[serde(default)]
    pub yes: Option<FlagCount>,
    #[serde(default)]
    pub no: Option<FlagCount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlagCount {
    #[serde(default)]
    pub n: u64,
    /// Percentage of the sample, already computed by the producer.
    #[serde(default)]
    pub pct: f64,
}

/// `dataMetadata.json`: informational pipeline provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataMetadata {
    pub generated_at: String,
    #[serde(default)]
    pub generated_at_formatted: Option<String>,
    #[serde(default)]
    pub generated_at_short: Option<String>,
    #[serde(default)]
    pub pipeline_version: Option<String>,
    #[serde(default)]
    pub data_source: Option<String>,
    #[serde(default)]
    pub bootstrap_replicates: Option<u64>,
    #[serde(default)]
    pub ci_type: Option<String>,
    #[serde(default)]
    pub run_id: Option<String>,
}

/// Per-channel linear dose-response coefficients.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DoseChannelCoefficients {
    pub main: f64,
    pub moderation: f64,
    pub standard_error: f64,
}

/// The fixed three-channel coefficient set.
///
/// Defaults to all zeros so downstream arithmetic never sees missing data.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DoseCoefficients {
    pub distress: DoseChannelCoefficients,
    pub engagement: DoseChannelCoefficients,
    pub adjustment: DoseChannelCoefficients,
}

impl From<&DoseCoefficientsWire> for DoseCoefficients {
    fn from(wire: &DoseCoefficientsWire) -> Self {
        let channel = |w: &DoseChannelWire| DoseChannelCoefficients {
            main: w.main,
            moderation: w.moderation,
            standard_error: w.standard_error.unwrap_or_default(),
        };
        Self {
            distress: channel(&wire.distress),
            engagement: channel(&wire.engagement),
            adjustment: channel(&wire.adjustment),
        }
    }
}

/// Credit-dose domain of the dose-response series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoseRange {
    pub min: f64,
    pub max: f64,
    /// Credit count defining the reference dose (zero-effect baseline).
    pub threshold: f64,
    #[serde(default = "DoseRange::default_units")]
    pub units: String,
}

impl DoseRange {
    fn default_units() -> String {
        "credits".to_string()
    }
}

impl Default for DoseRange {
    fn default() -> Self {
        Self {
            min: 0.0,
            max: 80.0,
            threshold: 12.0,
            units: Self::default_units(),
        }
    }
}

/// Effect of a given dose on each outcome channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelEffects {
    pub distress: f64,
    pub engagement: f64,
    pub adjustment: f64,
}

/// Additive decomposition of the treatment effect.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct EffectDecomposition {
    pub direct: f64,
    pub indirect_distress: f64,
    pub indirect_engagement: f64,
    pub total: f64,
}

/// Estimation choices surfaced to consumers (replicates, CI kind).
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ModelSelections {
    pub bootstrap_replicates: u64,
    pub ci_kind: String,
}

/// Per-artifact validation outcome. One message per failed artifact.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Validation {
    pub is_valid: bool,
    pub errors: Vec<String>,
}

/// The unified, immutable view-model published after each fetch cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelData {
    /// Entry for every known path id (and any extra id the producer
    /// emitted), `None` where the artifact did not supply an estimate.
    pub paths_by_id: BTreeMap<String, Option<StructuralPath>>,
    pub all_paths: Vec<StructuralPath>,
    pub fit_measures: BTreeMap<String, f64>,
    pub total_effect_path: Option<StructuralPath>,
    pub dose_coefficients: DoseCoefficients,
    /// Dose-response series, passed through opaquely for charting.
    pub dose_effects: Vec<Value>,
    pub dose_range: DoseRange,
    pub sample_size: u64,
    pub fast_count: u64,
    /// Already a percentage; pass-through from the producer.
    pub fast_percent: f64,
    pub model_selections: ModelSelections,
    pub metadata: Option<DataMetadata>,
    pub validation: Validation,
}

impl ModelData {
    /// Look up a structural path by id. Never panics; unknown ids are
    /// `None`.
    pub fn path(&self, id: &str) -> Option<&StructuralPath> {
        self.paths_by_id.get(id).and_then(|slot| slot.as_ref())
    }

    fn estimate_or_zero(&self, id: &str) -> f64 {
        self.path(id).map(|p| p.estimate).unwrap_or_default()
    }

    /// Linear dose-response at `dose` credits.
    ///
    /// `dose_unit` counts 10-credit steps above the reference threshold;
    /// the divisor is a fixed constant, so this is total over all inputs.
    pub fn effect_at_dose(&self, dose: f64) -> ChannelEffects {
        let dose_unit = (dose - self.dose_range.threshold) / 10.0;
        let channel = |c: &DoseChannelCoefficients| c.main + dose_unit * c.moderation;
        ChannelEffects {
            distress: channel(&self.dose_coefficients.distress),
            engagement: channel(&self.dose_coefficients.engagement),
            adjustment: channel(&self.dose_coefficients.adjustment),
        }
    }

    /// Additive effect decomposition over the mediation paths.
    ///
    /// Missing constituents contribute 0, never NaN.
    pub fn decomposition(&self) -> EffectDecomposition {
        let direct = self.estimate_or_zero("c");
        let indirect_distress = self.estimate_or_zero("a1") * self.estimate_or_zero("b1");
        let indirect_engagement = self.estimate_or_zero("a2") * self.estimate_or_zero("b2");
        EffectDecomposition {
            direct,
            indirect_distress,
            indirect_engagement,
            total: direct + indirect_distress + indirect_engagement,
        }
    }

    /// The defaulted value published before the first fetch cycle lands.
    ///
    /// Owned by the controller and injectable in tests; nothing here is
    /// read from disk or network.
    pub fn placeholder() -> Self {
        Self {
            paths_by_id: KEY_PATH_IDS
                .iter()
                .map(|id| ((*id).to_string(), None))
                .collect(),
            all_paths: Vec::new(),
            fit_measures: BTreeMap::new(),
            total_effect_path: None,
            dose_coefficients: DoseCoefficients::default(),
            dose_effects: Vec::new(),
            dose_range: DoseRange::default(),
            sample_size: 0,
            fast_count: 0,
            fast_percent: 0.0,
            model_selections: ModelSelections::default(),
            metadata: None,
            validation: Validation {
                is_valid: false,
                errors: vec!["model data not yet loaded".to_string()],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn structural_path_absorbs_producer_keys() {
        let path: StructuralPath = serde_json::from_value(serde_json::json!({
            "id": "a1",
            "from": "x_FASt",
            "to": "EmoDiss",
            "estimate": -0.12,
            "se": 0.03,
            "pvalue": 0.001
        }))
        .unwrap();
        assert_eq!(path.standard_error, Some(0.03));
        assert_eq!(path.p_value, Some(0.001));
        assert_eq!(path.confidence_interval, None);
    }

    #[test]
    fn dose_range_defaults_to_reference_threshold_12() {
        let range = DoseRange::default();
        assert_eq!(range.threshold, 12.0);
        assert_eq!(range.min, 0.0);
        assert_eq!(range.max, 80.0);
        assert_eq!(range.units, "credits");
    }

    #[test]
    fn placeholder_has_entry_for_every_known_id() {
        let data = ModelData::placeholder();
        for id in KEY_PATH_IDS {
            assert!(data.paths_by_id.contains_key(id), "missing {id}");
            assert_eq!(data.path(id), None);
        }
        assert!(!data.validation.is_valid);
    }

    #[test]
    fn placeholder_effects_are_all_zero() {
        let data = ModelData::placeholder();
        let effects = data.effect_at_dose(42.0);
        assert_eq!(effects.distress, 0.0);
        assert_eq!(effects.engagement, 0.0);
        assert_eq!(effects.adjustment, 0.0);

        let decomposition = data.decomposition();
        assert_eq!(decomposition.total, 0.0);
    }

    #[test]
    fn data_metadata_parses_producer_payload() {
        let meta: DataMetadata = serde_json::from_value(serde_json::json!({
            "generatedAt": "2024-02-01T12:00:00",
            "pipelineVersion": "2.0.0",
            "bootstrapReplicates": 2000,
            "ciType": "bca.simple",
            "runId": "run_20240201"
        }))
        .unwrap();
        assert_eq!(meta.generated_at, "2024-02-01T12:00:00");
        assert_eq!(meta.bootstrap_replicates, Some(2000));
        assert_eq!(meta.ci_type.as_deref(), Some("bca.simple"));
    }
}
