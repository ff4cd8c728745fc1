use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FunnelabError, Result};

pub const CONFIG_FILE: &str = "funnelab.json";

/// Engine-wide defaults applied when a request leaves a field unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    pub default_confidence_level: u32,
    pub default_minimum_sample_size: u64,
    /// Weight given to the control arm of a freshly created experiment.
    pub initial_control_weight: u32,
    /// Read-modify-write attempts before a version conflict is surfaced.
    pub max_write_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_confidence_level: 95,
            default_minimum_sample_size: 100,
            initial_control_weight: 50,
            max_write_retries: 8,
        }
    }
}

impl EngineConfig {
    /// Load from `{data_dir}/funnelab.json` or fall back to defaults, then
    /// apply `FUNNELAB_*` environment overrides.
    pub fn load_or_default(data_dir: &Path) -> Self {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
                    Ok(config) => {
                        tracing::info!(
                            "Loaded engine config: confidence={} min_sample={}",
                            config.default_confidence_level,
                            config.default_minimum_sample_size
                        );
                        config
                    }
                    Err(e) => {
                        tracing::error!("Failed to parse {}: {}, using defaults", CONFIG_FILE, e);
                        Self::default()
                    }
                },
                Err(e) => {
                    tracing::error!("Failed to read {}: {}, using defaults", CONFIG_FILE, e);
                    Self::default()
                }
            }
        } else {
            Self::default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        if let Err(e) = config.validate() {
            tracing::error!("{}, using defaults", e);
            return Self::default();
        }
        config
    }

    /// Overrides from `lookup` (normally the process environment).
    /// Unparseable values are logged and ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(key: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("Ignoring {}={:?}: not a valid number", key, raw);
                    None
                }
            }
        }

        const CONFIDENCE: &str = "FUNNELAB_DEFAULT_CONFIDENCE";
        const MIN_SAMPLE: &str = "FUNNELAB_MIN_SAMPLE_SIZE";
        const CONTROL_WEIGHT: &str = "FUNNELAB_CONTROL_WEIGHT";
        const RETRIES: &str = "FUNNELAB_MAX_WRITE_RETRIES";

        if let Some(v) = parse(CONFIDENCE, lookup(CONFIDENCE)) {
            self.default_confidence_level = v;
        }
        if let Some(v) = parse(MIN_SAMPLE, lookup(MIN_SAMPLE)) {
            self.default_minimum_sample_size = v;
        }
        if let Some(v) = parse(CONTROL_WEIGHT, lookup(CONTROL_WEIGHT)) {
            self.initial_control_weight = v;
        }
        if let Some(v) = parse(RETRIES, lookup(RETRIES)) {
            self.max_write_retries = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_confidence_level == 0 || self.default_confidence_level > 100 {
            return Err(FunnelabError::Config(format!(
                "defaultConfidenceLevel must be in 1..=100, got {}",
                self.default_confidence_level
            )));
        }
        if self.initial_control_weight > 100 {
            return Err(FunnelabError::Config(format!(
                "initialControlWeight must be <= 100, got {}",
                self.initial_control_weight
            )));
        }
        if self.max_write_retries == 0 {
            return Err(FunnelabError::Config(
                "maxWriteRetries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
