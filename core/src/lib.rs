//! Model-data synchronization and validation layer.
//!
//! Selects an active pipeline run, retrieves that run's statistical
//! artifacts over HTTP, validates and normalizes them into a stable typed
//! view-model, and keeps the view-model fresh via polling and on-demand
//! refresh, while guarding against races between overlapping fetches,
//! run switches, and session teardown.
//!
//! Consumers read the published [`ModelData`], call
//! [`SyncHandle::set_current_run`] / [`SyncHandle::refresh`], and
//! optionally feed a refresh signal into the controller at construction.
//! Rendering and everything visual live elsewhere.

pub mod assemble;
pub mod config;
pub mod controller;
pub mod error;
pub mod fetch;
pub mod model;
pub mod runs;
pub mod schema;

pub use assemble::ModelDataAssembler;
pub use config::SyncConfig;
pub use controller::{SyncControllerBuilder, SyncHandle, SyncPhase};
pub use error::{ConfigError, FetchError, SyncError, ValidationError};
pub use fetch::ArtifactFetcher;
pub use model::{
    ChannelEffects, DataMetadata, DoseChannelCoefficients, DoseCoefficients, DoseRange,
    EffectDecomposition, ModelData, ModelSelections, StructuralPath, Validation,
};
pub use runs::{ManifestArtifacts, ManifestSettings, Run, RunManifest, RunMode, RunRegistry};
