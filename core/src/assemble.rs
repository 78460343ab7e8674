//! Assembly of validated artifacts into the published view-model.
//!
//! `assemble` is pure: no I/O, no clocks, deterministic on identical
//! input, and it never mutates its arguments. Failed or absent artifacts
//! are recorded in `validation.errors` and replaced with zero-valued
//! defaults, so every numeric field a consumer reads is always a number.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::error::ValidationError;
use crate::model::{
    DataMetadata, DoseCoefficients, DoseEffectsDoc, DoseRange, KEY_PATH_IDS, ModelData,
    ModelResultsDoc, ModelSelections, SampleDescriptivesDoc, StructuralPath,
    TOTAL_EFFECT_PATH_ID, Validation,
};
use crate::schema::{ArtifactKind, ArtifactValidator};

/// Combines the raw model-data artifacts into one immutable [`ModelData`].
pub struct ModelDataAssembler {
    validator: ArtifactValidator,
}

impl ModelDataAssembler {
    pub fn new() -> Result<Self, ValidationError> {
        Ok(Self {
            validator: ArtifactValidator::new()?,
        })
    }

    /// Build a fresh view-model from raw payloads.
    ///
    /// `model_results` is the required artifact; the fetch cycle aborts
    /// before assembly when it cannot be retrieved at all. The optional
    /// artifacts arrive as `None` when the fetch degraded them to absent.
    /// Error accumulation order: model results, dose effects, sample
    /// descriptives, data metadata.
    pub fn assemble(
        &self,
        model_results: &Value,
        dose_effects: Option<&Value>,
        sample_descriptives: Option<&Value>,
        data_metadata: Option<&Value>,
    ) -> ModelData {
        let mut errors: Vec<String> = Vec::new();

        let model_doc = self.validate_required::<ModelResultsDoc>(
            ArtifactKind::ModelResults,
            model_results,
            &mut errors,
        );
        let dose_doc = self.validate_optional::<DoseEffectsDoc>(
            ArtifactKind::DoseEffects,
            dose_effects,
            &mut errors,
        );
        let sample_doc = self.validate_optional::<SampleDescriptivesDoc>(
            ArtifactKind::SampleDescriptives,
            sample_descriptives,
            &mut errors,
        );
        // Metadata is informational: a malformed payload is still an
        // error, but a missing one is not.
        let metadata = match data_metadata {
            Some(raw) => match self
                .validator
                .validate::<DataMetadata>(ArtifactKind::DataMetadata, raw)
            {
                Ok(meta) => Some(meta),
                Err(err) => {
                    errors.push(err.to_string());
                    None
                }
            },
            None => None,
        };

        let (all_paths, fit_measures, total_effect_path, model_selections) = match model_doc {
            Some(doc) => {
                let total_effect_path = doc.total_effect_model.as_ref().and_then(|model| {
                    model
                        .structural_paths
                        .iter()
                        .find(|path| path.id == TOTAL_EFFECT_PATH_ID)
                        .cloned()
                });
                let selections = doc
                    .bootstrap
                    .as_ref()
                    .map(|b| ModelSelections {
                        bootstrap_replicates: b.n_replicates.unwrap_or_default(),
                        ci_kind: b.ci_type.clone().unwrap_or_default(),
                    })
                    .unwrap_or_default();
                (
                    doc.main_model.structural_paths,
                    doc.main_model.fit_measures,
                    total_effect_path,
                    selections,
                )
            }
            None => (
                Vec::new(),
                BTreeMap::new(),
                None,
                ModelSelections::default(),
            ),
        };

        let paths_by_id = build_paths_by_id(&all_paths);

        let (dose_coefficients, dose_effects, dose_range) = match dose_doc {
            Some(doc) => (
                DoseCoefficients::from(&doc.coefficients),
                doc.effects,
                doc.credit_dose_range.unwrap_or_default(),
            ),
            None => (
                DoseCoefficients::default(),
                Vec::new(),
                DoseRange::default(),
            ),
        };

        let (sample_size, fast_count, fast_percent) = match &sample_doc {
            Some(doc) => {
                let fast_yes = doc
                    .demographics
                    .fast
                    .as_ref()
                    .and_then(|breakdown| breakdown.yes.clone())
                    .unwrap_or_default();
                (doc.n, fast_yes.n, fast_yes.pct)
            }
            None => (0, 0, 0.0),
        };

        ModelData {
            paths_by_id,
            all_paths,
            fit_measures,
            total_effect_path,
            dose_coefficients,
            dose_effects,
            dose_range,
            sample_size,
            fast_count,
            fast_percent,
            model_selections,
            metadata,
            validation: Validation {
                is_valid: errors.is_empty(),
                errors,
            },
        }
    }

    fn validate_required<T: serde::de::DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        raw: &Value,
        errors: &mut Vec<String>,
    ) -> Option<T> {
        match self.validator.validate(kind, raw) {
            Ok(doc) => Some(doc),
            Err(err) => {
                errors.push(err.to_string());
                None
            }
        }
    }

    fn validate_optional<T: serde::de::DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        raw: Option<&Value>,
        errors: &mut Vec<String>,
    ) -> Option<T> {
        match raw {
            Some(raw) => self.validate_required(kind, raw, errors),
            None => {
                errors.push(
                    ValidationError::new(kind.source_name(), "artifact missing").to_string(),
                );
                None
            }
        }
    }
}

/// Index `all_paths` by id, last write wins, with an entry for every
/// known id even when absent.
fn build_paths_by_id(all_paths: &[StructuralPath]) -> BTreeMap<String, Option<StructuralPath>> {
    let mut by_id: BTreeMap<String, Option<StructuralPath>> = KEY_PATH_IDS
        .iter()
        .map(|id| ((*id).to_string(), None))
        .collect();
    for path in all_paths {
        by_id.insert(path.id.clone(), Some(path.clone()));
    }
    by_id
}
