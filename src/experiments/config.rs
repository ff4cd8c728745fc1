use std::collections::HashSet;

use http::StatusCode;
use serde::{Deserialize, Serialize};

/// An A/B test attached to a single funnel step.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub funnel_id: String,
    pub original_step_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: ExperimentStatus,
    pub goal: OptimizationGoal,
    /// Target confidence as a percentage, e.g. `95`.
    pub confidence_level: u32,
    /// Impressions a variant needs before it can be auto-declared the winner.
    pub minimum_sample_size: u64,
    pub variants: Vec<Variant>,
    pub winner_variant_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub start_date: Option<i64>,
    pub end_date: Option<i64>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExperimentStatus {
    Draft,
    Running,
    Paused,
    Completed,
}

impl ExperimentStatus {
    /// Whether the status machine permits moving from `self` to `next`.
    ///
    /// Same-status updates are accepted so repeated Running or Completed
    /// requests stay idempotent. Completed is terminal.
    pub fn can_transition_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Draft, Running) | (Draft, Completed) => true,
            (Running, Paused) | (Running, Completed) => true,
            (Paused, Running) | (Paused, Completed) => true,
            _ => false,
        }
    }
}

/// What the test is optimizing for. Informational: results are always
/// computed on conversion rate.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationGoal {
    #[default]
    Conversion,
    Clicks,
    TimeOnPage,
    BounceRate,
    Revenue,
}

/// One arm of an experiment, rendering a specific funnel-step variant.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Variant {
    pub id: String,
    pub name: String,
    pub step_id: String,
    /// Percentage of traffic routed to this arm.
    pub weight: u32,
    pub is_control: bool,
    pub impressions: u64,
    pub conversions: u64,
    pub revenue: f64,
    /// Supplied by external analytics; never computed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounce_rate: Option<f64>,
    /// Seconds. Supplied by external analytics; never computed here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avg_time_on_page: Option<f64>,
}

impl Variant {
    pub(crate) fn new(name: &str, step_id: &str, weight: u32, is_control: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            step_id: step_id.to_string(),
            weight,
            is_control,
            impressions: 0,
            conversions: 0,
            revenue: 0.0,
            bounce_rate: None,
            avg_time_on_page: None,
        }
    }
}

/// Input for creating an experiment. Unset optionals take the engine defaults.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewExperiment {
    pub name: String,
    pub original_step_id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub goal: Option<OptimizationGoal>,
    #[serde(default)]
    pub confidence_level: Option<u32>,
    #[serde(default)]
    pub minimum_sample_size: Option<u64>,
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct NewVariant {
    pub name: String,
    pub step_id: String,
    /// Recorded on the new arm, then superseded by the even rebalance.
    /// Use `set_variant_weights` for an uneven split.
    #[serde(default)]
    pub weight: Option<u32>,
}

/// Partial metadata update. `None` leaves the field untouched.
#[derive(Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub goal: Option<OptimizationGoal>,
    pub confidence_level: Option<u32>,
    pub minimum_sample_size: Option<u64>,
    pub status: Option<ExperimentStatus>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExperimentError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("at least 2 variants are required to run an experiment, found {0}")]
    InsufficientVariants(usize),
    #[error("variant weights must sum to 100, got {0}")]
    WeightSumInvalid(u64),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("concurrent modification: {0}")]
    Conflict(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ExperimentError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ExperimentError::NotFound(_) => StatusCode::NOT_FOUND,
            ExperimentError::InvalidState(_) | ExperimentError::Conflict(_) => {
                StatusCode::CONFLICT
            }
            ExperimentError::InsufficientVariants(_) | ExperimentError::WeightSumInvalid(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ExperimentError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            ExperimentError::Io(_) | ExperimentError::Json(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl Experiment {
    pub fn control(&self) -> Option<&Variant> {
        self.variants.iter().find(|v| v.is_control)
    }

    pub fn variant(&self, variant_id: &str) -> Option<&Variant> {
        self.variants.iter().find(|v| v.id == variant_id)
    }

    pub fn variant_mut(&mut self, variant_id: &str) -> Option<&mut Variant> {
        self.variants.iter_mut().find(|v| v.id == variant_id)
    }

    pub fn total_weight(&self) -> u64 {
        self.variants.iter().map(|v| v.weight as u64).sum()
    }

    pub fn validate(&self) -> Result<(), ExperimentError> {
        if self.variants.is_empty() {
            return Err(ExperimentError::InvalidConfig(
                "experiment must have at least one variant".to_string(),
            ));
        }
        let controls = self.variants.iter().filter(|v| v.is_control).count();
        if controls != 1 {
            return Err(ExperimentError::InvalidConfig(format!(
                "experiment must have exactly one control variant, found {}",
                controls
            )));
        }
        let mut seen = HashSet::new();
        for v in &self.variants {
            if !seen.insert(v.id.as_str()) {
                return Err(ExperimentError::InvalidConfig(format!(
                    "duplicate variant id: {}",
                    v.id
                )));
            }
            if v.weight > 100 {
                return Err(ExperimentError::InvalidConfig(format!(
                    "variant {} weight {} exceeds 100",
                    v.id, v.weight
                )));
            }
        }
        if self.confidence_level == 0 || self.confidence_level > 100 {
            return Err(ExperimentError::InvalidConfig(
                "confidenceLevel must be in 1..=100".to_string(),
            ));
        }
        if let Some(ref winner) = self.winner_variant_id {
            if self.variant(winner).is_none() {
                return Err(ExperimentError::InvalidConfig(format!(
                    "winnerVariantId {} does not reference a variant",
                    winner
                )));
            }
        }
        if self.status == ExperimentStatus::Running && self.variants.len() < 2 {
            return Err(ExperimentError::InsufficientVariants(self.variants.len()));
        }
        Ok(())
    }
}
