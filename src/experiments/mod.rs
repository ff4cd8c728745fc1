//! Funnel-step A/B testing: experiment model, persistence, traffic routing,
//! conversion accounting and significance-based winner detection.

pub mod assignment;
pub mod config;
pub mod results;
pub mod service;
pub mod stats;
pub mod store;

pub use config::{
    Experiment, ExperimentError, ExperimentStatus, ExperimentUpdate, NewExperiment, NewVariant,
    OptimizationGoal, Variant,
};
pub use results::{compute_results, ExperimentResults, VariantResult};
pub use service::{ExperimentFilter, ExperimentService};
pub use store::{
    ExperimentRepository, FileExperimentRepository, InMemoryExperimentRepository,
    StoredExperiments,
};
