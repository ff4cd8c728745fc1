//! Per-variant statistics and automatic winner detection.
//!
//! Every non-control variant is compared against the control only; variants
//! are never ranked against each other. The winner scan walks the variants
//! in list order and stops at the first one that clears all three gates
//! (confidence, minimum sample size, positive improvement).

use serde::Serialize;

use super::config::{Experiment, ExperimentStatus};
use super::stats;

/// Confidence reported for the control against itself.
pub const CONTROL_CONFIDENCE: u32 = 100;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentResults {
    pub experiment_id: String,
    pub status: ExperimentStatus,
    pub confidence_level: u32,
    pub minimum_sample_size: u64,
    pub total_impressions: u64,
    pub total_conversions: u64,
    pub total_revenue: f64,
    pub overall_conversion_rate: f64,
    pub variants: Vec<VariantResult>,
    /// Operator-declared winner, independent of the statistical scan.
    pub declared_winner_id: Option<String>,
}

impl ExperimentResults {
    pub fn winner(&self) -> Option<&VariantResult> {
        self.variants.iter().find(|v| v.is_winner)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariantResult {
    pub variant_id: String,
    pub name: String,
    pub step_id: String,
    pub is_control: bool,
    pub weight: u32,
    pub impressions: u64,
    pub conversions: u64,
    pub revenue: f64,
    pub conversion_rate: f64,
    pub revenue_per_visitor: f64,
    /// Percent lift over the control's conversion rate.
    pub improvement: f64,
    pub confidence: u32,
    pub z_score: f64,
    pub p_value: f64,
    /// Impressions as a percentage of `minimumSampleSize`, capped at 100.
    pub sample_progress_pct: f64,
    pub is_winner: bool,
}

pub fn compute_results(experiment: &Experiment) -> ExperimentResults {
    let (control_conversions, control_impressions) = experiment
        .control()
        .map(|c| (c.conversions, c.impressions))
        .unwrap_or((0, 0));
    let control_rate = stats::conversion_rate(control_conversions, control_impressions);

    let mut variants: Vec<VariantResult> = experiment
        .variants
        .iter()
        .map(|v| {
            let conversion_rate = stats::conversion_rate(v.conversions, v.impressions);
            let (confidence, z_score, p_value) = if v.is_control {
                (CONTROL_CONFIDENCE, 0.0, 1.0)
            } else {
                let t = stats::two_proportion_z_test(
                    control_conversions,
                    control_impressions,
                    v.conversions,
                    v.impressions,
                );
                (t.confidence, t.z_score, t.p_value)
            };
            VariantResult {
                variant_id: v.id.clone(),
                name: v.name.clone(),
                step_id: v.step_id.clone(),
                is_control: v.is_control,
                weight: v.weight,
                impressions: v.impressions,
                conversions: v.conversions,
                revenue: v.revenue,
                conversion_rate,
                revenue_per_visitor: stats::revenue_per_visitor(v.revenue, v.impressions),
                improvement: if v.is_control {
                    0.0
                } else {
                    stats::improvement_pct(conversion_rate, control_rate)
                },
                confidence,
                z_score,
                p_value,
                sample_progress_pct: sample_progress(v.impressions, experiment.minimum_sample_size),
                is_winner: false,
            }
        })
        .collect();

    if let Some(winner) = variants.iter_mut().find(|v| {
        !v.is_control
            && v.confidence >= experiment.confidence_level
            && v.impressions >= experiment.minimum_sample_size
            && v.improvement > 0.0
    }) {
        winner.is_winner = true;
    }

    let total_impressions: u64 = variants.iter().map(|v| v.impressions).sum();
    let total_conversions: u64 = variants.iter().map(|v| v.conversions).sum();
    let total_revenue: f64 = variants.iter().map(|v| v.revenue).sum();

    ExperimentResults {
        experiment_id: experiment.id.clone(),
        status: experiment.status,
        confidence_level: experiment.confidence_level,
        minimum_sample_size: experiment.minimum_sample_size,
        total_impressions,
        total_conversions,
        total_revenue,
        overall_conversion_rate: stats::conversion_rate(total_conversions, total_impressions),
        variants,
        declared_winner_id: experiment.winner_variant_id.clone(),
    }
}

fn sample_progress(impressions: u64, minimum: u64) -> f64 {
    if minimum == 0 {
        return 100.0;
    }
    (impressions as f64 / minimum as f64 * 100.0).min(100.0)
}
