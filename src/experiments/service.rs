use std::collections::HashSet;

use super::assignment;
use super::config::{
    Experiment, ExperimentError, ExperimentStatus, ExperimentUpdate, NewExperiment, NewVariant,
    Variant,
};
use super::results::{self, ExperimentResults};
use super::store::ExperimentRepository;
use crate::config::EngineConfig;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Conjunctive filter for `list_experiments`; `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct ExperimentFilter {
    pub status: Option<ExperimentStatus>,
    pub original_step_id: Option<String>,
}

/// Result of one read-modify-write attempt.
enum Outcome<T> {
    /// Persist the modified list, then return the value.
    Save(T),
    /// Nothing changed; return the value without writing.
    Unchanged(T),
}

/// Lifecycle, traffic accounting and results for the experiments of every
/// funnel held by the repository.
///
/// Each mutation loads the funnel's list, edits it in memory and saves it
/// with the version it was loaded at. A lost race reloads and reapplies the
/// edit, up to `max_write_retries` attempts.
pub struct ExperimentService<R> {
    repo: R,
    config: EngineConfig,
}

impl<R: ExperimentRepository> ExperimentService<R> {
    pub fn new(repo: R) -> Self {
        Self::with_config(repo, EngineConfig::default())
    }

    pub fn with_config(repo: R, config: EngineConfig) -> Self {
        Self { repo, config }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn mutate<T, F>(&self, funnel_id: &str, mut edit: F) -> Result<T, ExperimentError>
    where
        F: FnMut(&mut Vec<Experiment>) -> Result<Outcome<T>, ExperimentError>,
    {
        let attempts = self.config.max_write_retries.max(1);
        for attempt in 1..=attempts {
            let stored = self.repo.load_experiments(funnel_id)?;
            let mut experiments = stored.experiments;
            let value = match edit(&mut experiments)? {
                Outcome::Unchanged(value) => return Ok(value),
                Outcome::Save(value) => value,
            };
            match self
                .repo
                .save_experiments(funnel_id, experiments, stored.version)
            {
                Ok(_) => return Ok(value),
                Err(ExperimentError::Conflict(msg)) => {
                    tracing::warn!(
                        "[EXPERIMENTS {}] write conflict (attempt {}/{}): {}",
                        funnel_id,
                        attempt,
                        attempts,
                        msg
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Err(ExperimentError::Conflict(format!(
            "funnel '{}' still contended after {} attempts",
            funnel_id, attempts
        )))
    }

    /// Applies `edit` to one experiment, validates it, refreshes `updated_at`
    /// and returns the saved copy.
    fn modify<F>(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        mut edit: F,
    ) -> Result<Experiment, ExperimentError>
    where
        F: FnMut(&mut Experiment) -> Result<(), ExperimentError>,
    {
        self.mutate(funnel_id, |experiments| {
            let experiment = find_mut(experiments, experiment_id)?;
            edit(experiment)?;
            experiment.updated_at = now_ms();
            experiment.validate()?;
            Ok(Outcome::Save(experiment.clone()))
        })
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Creates a Draft experiment with a single control arm bound to the
    /// original step.
    pub fn create_experiment(
        &self,
        funnel_id: &str,
        request: NewExperiment,
    ) -> Result<Experiment, ExperimentError> {
        let now = now_ms();
        let experiment = Experiment {
            id: uuid::Uuid::new_v4().to_string(),
            funnel_id: funnel_id.to_string(),
            original_step_id: request.original_step_id.clone(),
            name: request.name,
            description: request.description.unwrap_or_default(),
            status: ExperimentStatus::Draft,
            goal: request.goal.unwrap_or_default(),
            confidence_level: request
                .confidence_level
                .unwrap_or(self.config.default_confidence_level),
            minimum_sample_size: request
                .minimum_sample_size
                .unwrap_or(self.config.default_minimum_sample_size),
            variants: vec![Variant::new(
                "Control",
                &request.original_step_id,
                self.config.initial_control_weight,
                true,
            )],
            winner_variant_id: None,
            created_at: now,
            updated_at: now,
            start_date: None,
            end_date: None,
        };
        experiment.validate()?;

        let created = self.mutate(funnel_id, |experiments| {
            experiments.push(experiment.clone());
            Ok(Outcome::Save(experiment.clone()))
        })?;
        tracing::info!(
            "[EXPERIMENTS {}] created '{}' ({}) on step {}",
            funnel_id,
            created.name,
            created.id,
            created.original_step_id
        );
        Ok(created)
    }

    pub fn get_experiment(
        &self,
        funnel_id: &str,
        experiment_id: &str,
    ) -> Result<Experiment, ExperimentError> {
        self.repo
            .load_experiments(funnel_id)?
            .experiments
            .into_iter()
            .find(|e| e.id == experiment_id)
            .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))
    }

    pub fn list_experiments(
        &self,
        funnel_id: &str,
        filter: Option<ExperimentFilter>,
    ) -> Result<Vec<Experiment>, ExperimentError> {
        let experiments = self.repo.load_experiments(funnel_id)?.experiments;
        Ok(experiments
            .into_iter()
            .filter(|e| {
                if let Some(ref f) = filter {
                    if let Some(status) = f.status {
                        if e.status != status {
                            return false;
                        }
                    }
                    if let Some(ref step) = f.original_step_id {
                        if &e.original_step_id != step {
                            return false;
                        }
                    }
                }
                true
            })
            .collect())
    }

    /// The Running experiment attached to `step_id`, if any.
    pub fn active_for_step(
        &self,
        funnel_id: &str,
        step_id: &str,
    ) -> Result<Option<Experiment>, ExperimentError> {
        Ok(self
            .list_experiments(
                funnel_id,
                Some(ExperimentFilter {
                    status: Some(ExperimentStatus::Running),
                    original_step_id: Some(step_id.to_string()),
                }),
            )?
            .into_iter()
            .next())
    }

    /// Appends a non-control arm to a Draft experiment and rebalances all
    /// weights evenly so they sum to 100.
    pub fn add_variant(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        request: NewVariant,
    ) -> Result<Experiment, ExperimentError> {
        let updated = self.modify(funnel_id, experiment_id, |experiment| {
            if experiment.status != ExperimentStatus::Draft {
                return Err(ExperimentError::InvalidState(format!(
                    "variants can only be added to draft experiments, experiment is {:?}",
                    experiment.status
                )));
            }
            experiment.variants.push(Variant::new(
                &request.name,
                &request.step_id,
                request.weight.unwrap_or(0),
                false,
            ));
            rebalance_evenly(&mut experiment.variants);
            Ok(())
        })?;
        tracing::info!(
            "[EXPERIMENTS {}] added variant '{}' to {} ({} arms)",
            funnel_id,
            request.name,
            experiment_id,
            updated.variants.len()
        );
        Ok(updated)
    }

    /// Applies a partial metadata update, including guarded status changes.
    pub fn update_experiment(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        update: ExperimentUpdate,
    ) -> Result<Experiment, ExperimentError> {
        let mut before = ExperimentStatus::Draft;
        let updated = self.modify(funnel_id, experiment_id, |experiment| {
            before = experiment.status;
            if let Some(next) = update.status {
                apply_status(experiment, next)?;
            }
            if let Some(ref name) = update.name {
                experiment.name = name.clone();
            }
            if let Some(ref description) = update.description {
                experiment.description = description.clone();
            }
            if let Some(goal) = update.goal {
                experiment.goal = goal;
            }
            if let Some(level) = update.confidence_level {
                experiment.confidence_level = level;
            }
            if let Some(size) = update.minimum_sample_size {
                experiment.minimum_sample_size = size;
            }
            Ok(())
        })?;
        if updated.status != before {
            tracing::info!(
                "[EXPERIMENTS {}] {} status {:?} -> {:?}",
                funnel_id,
                experiment_id,
                before,
                updated.status
            );
        }
        Ok(updated)
    }

    /// Replaces every variant's weight. The pairs must cover each variant
    /// exactly once and sum to 100.
    pub fn set_variant_weights(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        weights: &[(String, u32)],
    ) -> Result<Experiment, ExperimentError> {
        let sum: u64 = weights.iter().map(|(_, w)| *w as u64).sum();
        if sum != 100 {
            return Err(ExperimentError::WeightSumInvalid(sum));
        }
        self.modify(funnel_id, experiment_id, |experiment| {
            let mut seen = HashSet::new();
            for (variant_id, weight) in weights {
                let variant = experiment.variant_mut(variant_id).ok_or_else(|| {
                    ExperimentError::NotFound(format!("variant {}", variant_id))
                })?;
                if !seen.insert(variant_id.as_str()) {
                    return Err(ExperimentError::InvalidConfig(format!(
                        "variant {} listed more than once",
                        variant_id
                    )));
                }
                variant.weight = *weight;
            }
            if seen.len() != experiment.variants.len() {
                return Err(ExperimentError::InvalidConfig(format!(
                    "weights cover {} of {} variants",
                    seen.len(),
                    experiment.variants.len()
                )));
            }
            Ok(())
        })
    }

    /// Removes the experiment regardless of status. Returns whether anything
    /// was removed; unknown ids are a no-op.
    pub fn delete_experiment(
        &self,
        funnel_id: &str,
        experiment_id: &str,
    ) -> Result<bool, ExperimentError> {
        let removed = self.mutate(funnel_id, |experiments| {
            let before = experiments.len();
            experiments.retain(|e| e.id != experiment_id);
            if experiments.len() == before {
                Ok(Outcome::Unchanged(false))
            } else {
                Ok(Outcome::Save(true))
            }
        })?;
        if removed {
            tracing::info!("[EXPERIMENTS {}] deleted {}", funnel_id, experiment_id);
        }
        Ok(removed)
    }

    /// Operator override: marks `variant_id` the winner and completes the
    /// experiment, ignoring every statistical threshold.
    pub fn declare_winner(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        variant_id: &str,
    ) -> Result<Experiment, ExperimentError> {
        let updated = self.modify(funnel_id, experiment_id, |experiment| {
            if experiment.variant(variant_id).is_none() {
                return Err(ExperimentError::NotFound(format!(
                    "variant {} in experiment {}",
                    variant_id, experiment.id
                )));
            }
            experiment.winner_variant_id = Some(variant_id.to_string());
            experiment.status = ExperimentStatus::Completed;
            experiment.end_date = Some(now_ms());
            Ok(())
        })?;
        tracing::info!(
            "[EXPERIMENTS {}] winner {} declared for {}",
            funnel_id,
            variant_id,
            experiment_id
        );
        Ok(updated)
    }

    // ── Traffic ─────────────────────────────────────────────────────
    //
    // Missing experiments or variants are not errors on the traffic path:
    // these return Ok(false) / Ok(None) so a stale reference never fails a
    // visitor's request. Storage errors still propagate.

    pub fn record_impression(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        variant_id: &str,
    ) -> Result<bool, ExperimentError> {
        self.mutate(funnel_id, |experiments| {
            match find_variant_mut(experiments, experiment_id, variant_id) {
                Some(variant) => {
                    variant.impressions += 1;
                    Ok(Outcome::Save(true))
                }
                None => {
                    tracing::debug!(
                        "[EXPERIMENTS {}] impression for unknown {}/{} ignored",
                        funnel_id,
                        experiment_id,
                        variant_id
                    );
                    Ok(Outcome::Unchanged(false))
                }
            }
        })
    }

    pub fn record_conversion(
        &self,
        funnel_id: &str,
        experiment_id: &str,
        variant_id: &str,
        revenue: Option<f64>,
    ) -> Result<bool, ExperimentError> {
        let revenue = match revenue {
            Some(amount) if !amount.is_finite() || amount < 0.0 => {
                tracing::warn!(
                    "[EXPERIMENTS {}] ignoring revenue {} for {}/{}",
                    funnel_id,
                    amount,
                    experiment_id,
                    variant_id
                );
                None
            }
            other => other,
        };
        self.mutate(funnel_id, |experiments| {
            match find_variant_mut(experiments, experiment_id, variant_id) {
                Some(variant) => {
                    variant.conversions += 1;
                    if let Some(amount) = revenue {
                        variant.revenue += amount;
                    }
                    Ok(Outcome::Save(true))
                }
                None => {
                    tracing::debug!(
                        "[EXPERIMENTS {}] conversion for unknown {}/{} ignored",
                        funnel_id,
                        experiment_id,
                        variant_id
                    );
                    Ok(Outcome::Unchanged(false))
                }
            }
        })
    }

    /// Routes one visitor: picks a variant of a Running experiment and
    /// records its impression in the same write. `None` means render the
    /// original step.
    pub fn assign_visitor(
        &self,
        funnel_id: &str,
        experiment_id: &str,
    ) -> Result<Option<Variant>, ExperimentError> {
        self.mutate(funnel_id, |experiments| {
            let Some(experiment) = experiments
                .iter_mut()
                .find(|e| e.id == experiment_id && e.status == ExperimentStatus::Running)
            else {
                return Ok(Outcome::Unchanged(None));
            };
            let Some(chosen) = assignment::select_variant(experiment).map(|v| v.id.clone()) else {
                return Ok(Outcome::Unchanged(None));
            };
            match experiment.variant_mut(&chosen) {
                Some(variant) => {
                    variant.impressions += 1;
                    Ok(Outcome::Save(Some(variant.clone())))
                }
                None => Ok(Outcome::Unchanged(None)),
            }
        })
    }

    // ── Results ─────────────────────────────────────────────────────

    pub fn get_results(
        &self,
        funnel_id: &str,
        experiment_id: &str,
    ) -> Result<ExperimentResults, ExperimentError> {
        let experiment = self.get_experiment(funnel_id, experiment_id)?;
        Ok(results::compute_results(&experiment))
    }
}

fn find_mut<'a>(
    experiments: &'a mut [Experiment],
    experiment_id: &str,
) -> Result<&'a mut Experiment, ExperimentError> {
    experiments
        .iter_mut()
        .find(|e| e.id == experiment_id)
        .ok_or_else(|| ExperimentError::NotFound(experiment_id.to_string()))
}

fn find_variant_mut<'a>(
    experiments: &'a mut [Experiment],
    experiment_id: &str,
    variant_id: &str,
) -> Option<&'a mut Variant> {
    experiments
        .iter_mut()
        .find(|e| e.id == experiment_id)?
        .variant_mut(variant_id)
}

fn apply_status(experiment: &mut Experiment, next: ExperimentStatus) -> Result<(), ExperimentError> {
    if !experiment.status.can_transition_to(next) {
        return Err(ExperimentError::InvalidState(format!(
            "cannot move experiment from {:?} to {:?}",
            experiment.status, next
        )));
    }
    match next {
        ExperimentStatus::Running => {
            if experiment.variants.len() < 2 {
                return Err(ExperimentError::InsufficientVariants(
                    experiment.variants.len(),
                ));
            }
            experiment.start_date.get_or_insert_with(now_ms);
        }
        ExperimentStatus::Completed => {
            experiment.end_date.get_or_insert_with(now_ms);
        }
        ExperimentStatus::Draft | ExperimentStatus::Paused => {}
    }
    experiment.status = next;
    Ok(())
}

/// Every arm gets `floor(100 / n)`; the last arm absorbs the remainder.
pub(crate) fn rebalance_evenly(variants: &mut [Variant]) {
    let n = variants.len() as u32;
    if n == 0 {
        return;
    }
    let share = 100 / n;
    for v in variants.iter_mut() {
        v.weight = share;
    }
    if let Some(last) = variants.last_mut() {
        last.weight = 100 - share * (n - 1);
    }
}
