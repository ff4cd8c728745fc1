//! A/B testing engine for funnel steps.
//!
//! [`ExperimentService`] drives the experiment lifecycle against any
//! [`ExperimentRepository`]; [`experiments::assignment`] routes visitors and
//! [`experiments::results`] computes per-variant significance against the
//! control.

pub mod config;
pub mod error;
pub mod experiments;

pub use config::EngineConfig;
pub use error::{FunnelabError, Result};
pub use experiments::{
    Experiment, ExperimentError, ExperimentRepository, ExperimentService, ExperimentStatus,
    FileExperimentRepository, InMemoryExperimentRepository, Variant,
};
