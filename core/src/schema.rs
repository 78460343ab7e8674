//! Schema validation for raw artifact payloads.
//!
//! Each artifact kind carries an embedded JSON Schema (Draft 7), compiled
//! once at construction. Validation never panics: a mismatch comes back as
//! a [`ValidationError`] naming the artifact file, which the assembler
//! records and replaces with safe defaults.

use std::collections::HashMap;

use jsonschema::{Draft, JSONSchema};
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use crate::error::ValidationError;
use crate::fetch::{
    DATA_METADATA_FILE, DOSE_EFFECTS_FILE, MANIFEST_FILE, MODEL_RESULTS_FILE, RUNS_INDEX_FILE,
    SAMPLE_DESCRIPTIVES_FILE,
};

/// The artifact files this layer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    ModelResults,
    DoseEffects,
    SampleDescriptives,
    DataMetadata,
    RunsIndex,
    RunManifest,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 6] = [
        ArtifactKind::ModelResults,
        ArtifactKind::DoseEffects,
        ArtifactKind::SampleDescriptives,
        ArtifactKind::DataMetadata,
        ArtifactKind::RunsIndex,
        ArtifactKind::RunManifest,
    ];

    /// Source filename used in error messages.
    pub fn source_name(self) -> &'static str {
        match self {
            ArtifactKind::ModelResults => MODEL_RESULTS_FILE,
            ArtifactKind::DoseEffects => DOSE_EFFECTS_FILE,
            ArtifactKind::SampleDescriptives => SAMPLE_DESCRIPTIVES_FILE,
            ArtifactKind::DataMetadata => DATA_METADATA_FILE,
            ArtifactKind::RunsIndex => RUNS_INDEX_FILE,
            ArtifactKind::RunManifest => MANIFEST_FILE,
        }
    }

    fn schema(self) -> Value {
        match self {
            ArtifactKind::ModelResults => model_results_schema(),
            ArtifactKind::DoseEffects => dose_effects_schema(),
            ArtifactKind::SampleDescriptives => sample_descriptives_schema(),
            ArtifactKind::DataMetadata => data_metadata_schema(),
            ArtifactKind::RunsIndex => runs_index_schema(),
            ArtifactKind::RunManifest => run_manifest_schema(),
        }
    }
}

struct CompiledSchema {
    #[allow(dead_code)]
    schema: Value,
    compiled: JSONSchema,
}

/// Compiled schemas for every [`ArtifactKind`].
pub struct ArtifactValidator {
    schemas: HashMap<ArtifactKind, CompiledSchema>,
}

impl ArtifactValidator {
    /// Compile the embedded schemas. The schemas are compile-time
    /// constants, so an error here means the crate itself is broken.
    pub fn new() -> Result<Self, ValidationError> {
        let mut schemas = HashMap::new();
        for kind in ArtifactKind::ALL {
            let schema = kind.schema();
            let compiled = match JSONSchema::options()
                .with_draft(Draft::Draft7)
                .compile(&schema)
            {
                Ok(compiled) => compiled,
                Err(err) => {
                    return Err(ValidationError::new(
                        kind.source_name(),
                        format!("embedded schema failed to compile: {err}"),
                    ));
                }
            };
            schemas.insert(kind, CompiledSchema { schema, compiled });
        }
        Ok(Self { schemas })
    }

    /// Validate `raw` against the schema for `kind`, then deserialize into
    /// the typed payload. Returns a normal error value on mismatch, never
    /// panics.
    pub fn validate<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        raw: &Value,
    ) -> Result<T, ValidationError> {
        let Some(entry) = self.schemas.get(&kind) else {
            return Err(ValidationError::new(
                kind.source_name(),
                "no schema registered",
            ));
        };

        if let Err(errors) = entry.compiled.validate(raw) {
            let detail = errors
                .map(|err| format!("{err} at {}", err.instance_path))
                .collect::<Vec<_>>()
                .join("; ");
            return Err(ValidationError::new(kind.source_name(), detail));
        }

        serde_json::from_value(raw.clone()).map_err(|err| {
            ValidationError::new(kind.source_name(), format!("payload shape mismatch: {err}"))
        })
    }
}

fn structural_path_schema() -> Value {
    json!({
        "type": "object",
        "required": ["id", "estimate"],
        "properties": {
            "id": { "type": "string" },
            "estimate": { "type": "number" },
            "se": { "type": ["number", "null"] },
            "standardError": { "type": ["number", "null"] },
            "pvalue": { "type": ["number", "null"], "minimum": 0, "maximum": 1 },
            "pValue": { "type": ["number", "null"], "minimum": 0, "maximum": 1 },
            "confidenceInterval": {
                "type": "array",
                "items": { "type": "number" },
                "minItems": 2,
                "maxItems": 2
            }
        },
        "additionalProperties": true
    })
}

fn model_results_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["mainModel"],
        "properties": {
            "mainModel": {
                "type": "object",
                "required": ["structuralPaths", "fitMeasures"],
                "properties": {
                    "structuralPaths": {
                        "type": "array",
                        "items": structural_path_schema()
                    },
                    "fitMeasures": {
                        "type": "object",
                        "additionalProperties": { "type": "number" }
                    }
                },
                "additionalProperties": true
            },
            "totalEffectModel": {
                "type": "object",
                "properties": {
                    "structuralPaths": {
                        "type": "array",
                        "items": structural_path_schema()
                    },
                    "fitMeasures": {
                        "type": "object",
                        "additionalProperties": { "type": "number" }
                    }
                },
                "additionalProperties": true
            },
            "bootstrap": {
                "type": "object",
                "properties": {
                    "n_replicates": { "type": "number", "minimum": 0 },
                    "ci_type": { "type": "string" }
                },
                "additionalProperties": true
            }
        },
        "additionalProperties": true
    })
}

fn dose_channel_schema() -> Value {
    json!({
        "type": "object",
        "required": ["main", "moderation"],
        "properties": {
            "main": { "type": "number" },
            "moderation": { "type": "number" },
            "se": { "type": ["number", "null"] },
            "standardError": { "type": ["number", "null"] }
        },
        "additionalProperties": true
    })
}

fn dose_effects_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["coefficients"],
        "properties": {
            "coefficients": {
                "type": "object",
                "required": ["distress", "engagement", "adjustment"],
                "properties": {
                    "distress": dose_channel_schema(),
                    "engagement": dose_channel_schema(),
                    "adjustment": dose_channel_schema()
                },
                "additionalProperties": false
            },
            "effects": { "type": "array" },
            "creditDoseRange": {
                "type": "object",
                "required": ["min", "max", "threshold"],
                "properties": {
                    "min": { "type": "number" },
                    "max": { "type": "number" },
                    "threshold": { "type": "number" },
                    "units": { "type": "string" }
                },
                "additionalProperties": true
            }
        },
        "additionalProperties": true
    })
}

fn sample_descriptives_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["n"],
        "properties": {
            "n": { "type": "number", "minimum": 0 },
            "demographics": {
                "type": "object",
                "properties": {
                    "fast": {
                        "type": "object",
                        "properties": {
                            "yes": {
                                "type": "object",
                                "properties": {
                                    "n": { "type": "number", "minimum": 0 },
                                    "pct": { "type": "number", "minimum": 0, "maximum": 100 }
                                },
                                "additionalProperties": true
                            }
                        },
                        "additionalProperties": true
                    }
                },
                "additionalProperties": true
            }
        },
        "additionalProperties": true
    })
}

fn data_metadata_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["generatedAt"],
        "properties": {
            "generatedAt": { "type": "string" },
            "pipelineVersion": { "type": "string" },
            "dataSource": { "type": "string" },
            "bootstrapReplicates": { "type": "number", "minimum": 0 },
            "ciType": { "type": "string" },
            "runId": { "type": "string" }
        },
        "additionalProperties": true
    })
}

fn runs_index_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "array",
        "items": {
            "type": "object",
            "required": ["run_id", "timestamp"],
            "properties": {
                "run_id": { "type": "string" },
                "timestamp": { "type": "string" },
                "label": { "type": "string" },
                "manifest_path": { "type": "string" }
            },
            "additionalProperties": true
        }
    })
}

fn run_manifest_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "type": "object",
        "required": ["run_id", "timestamp", "mode"],
        "properties": {
            "run_id": { "type": "string" },
            "timestamp": { "type": "string" },
            "mode": { "enum": ["smoke", "main", "full_deploy"] },
            "settings": { "type": "object" },
            "artifacts": { "type": "object" },
            "python_stage_completed": { "type": ["string", "null"] }
        },
        "additionalProperties": true
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DoseEffectsDoc, ModelResultsDoc, SampleDescriptivesDoc};
    use pretty_assertions::assert_eq;

    fn validator() -> ArtifactValidator {
        ArtifactValidator::new().unwrap()
    }

    #[test]
    fn all_embedded_schemas_compile() {
        assert!(ArtifactValidator::new().is_ok());
    }

    #[test]
    fn valid_model_results_pass() {
        let raw = json!({
            "mainModel": {
                "structuralPaths": [
                    { "id": "a1", "estimate": -0.12, "se": 0.03, "pvalue": 0.001 }
                ],
                "fitMeasures": { "cfi": 0.97, "rmsea": 0.031 }
            },
            "totalEffectModel": {
                "structuralPaths": [ { "id": "c_total", "estimate": 0.08 } ]
            },
            "bootstrap": { "n_replicates": 2000, "ci_type": "bca.simple" }
        });

        let doc: ModelResultsDoc = validator()
            .validate(ArtifactKind::ModelResults, &raw)
            .unwrap();
        assert_eq!(doc.main_model.structural_paths.len(), 1);
        assert_eq!(doc.main_model.fit_measures["cfi"], 0.97);
    }

    #[test]
    fn missing_main_model_fails_with_source_name() {
        let raw = json!({ "totalEffectModel": { "structuralPaths": [] } });
        let err = validator()
            .validate::<ModelResultsDoc>(ArtifactKind::ModelResults, &raw)
            .unwrap_err();
        assert_eq!(err.source_name, "modelResults.json");
        assert!(err.message.contains("mainModel"), "{}", err.message);
    }

    #[test]
    fn null_estimate_rejects_model_results() {
        let raw = json!({
            "mainModel": {
                "structuralPaths": [ { "id": "a1", "estimate": null } ],
                "fitMeasures": {}
            }
        });
        assert!(
            validator()
                .validate::<ModelResultsDoc>(ArtifactKind::ModelResults, &raw)
                .is_err()
        );
    }

    #[test]
    fn p_value_outside_unit_interval_rejects() {
        let raw = json!({
            "mainModel": {
                "structuralPaths": [ { "id": "a1", "estimate": 0.1, "pvalue": 1.7 } ],
                "fitMeasures": {}
            }
        });
        assert!(
            validator()
                .validate::<ModelResultsDoc>(ArtifactKind::ModelResults, &raw)
                .is_err()
        );
    }

    #[test]
    fn dose_effects_require_all_three_channels() {
        let raw = json!({
            "coefficients": {
                "distress": { "main": -0.1, "moderation": 0.02, "se": 0.03 },
                "engagement": { "main": 0.2, "moderation": -0.01, "se": 0.05 }
            }
        });
        let err = validator()
            .validate::<DoseEffectsDoc>(ArtifactKind::DoseEffects, &raw)
            .unwrap_err();
        assert_eq!(err.source_name, "doseEffects.json");
    }

    #[test]
    fn dose_effects_with_null_moderation_reject() {
        let raw = json!({
            "coefficients": {
                "distress": { "main": -0.1, "moderation": null },
                "engagement": { "main": 0.2, "moderation": -0.01 },
                "adjustment": { "main": 0.0, "moderation": 0.0 }
            }
        });
        assert!(
            validator()
                .validate::<DoseEffectsDoc>(ArtifactKind::DoseEffects, &raw)
                .is_err()
        );
    }

    #[test]
    fn sample_descriptives_tolerate_missing_demographics() {
        let raw = json!({ "n": 5000 });
        let doc: SampleDescriptivesDoc = validator()
            .validate(ArtifactKind::SampleDescriptives, &raw)
            .unwrap();
        assert_eq!(doc.n, 5000);
        assert!(doc.demographics.fast.is_none());
    }

    #[test]
    fn percentage_above_100_rejects_sample_descriptives() {
        let raw = json!({
            "n": 100,
            "demographics": { "fast": { "yes": { "n": 130, "pct": 130.0 } } }
        });
        assert!(
            validator()
                .validate::<SampleDescriptivesDoc>(ArtifactKind::SampleDescriptives, &raw)
                .is_err()
        );
    }

    #[test]
    fn manifest_mode_is_an_enum() {
        let raw = json!({
            "run_id": "run_1",
            "timestamp": "2024-02-01T00:00:00Z",
            "mode": "dress_rehearsal"
        });
        let err = validator()
            .validate::<crate::runs::RunManifest>(ArtifactKind::RunManifest, &raw)
            .unwrap_err();
        assert_eq!(err.source_name, "manifest.json");
    }
}
