//! Configuration for the analysis pipeline.
//!
//! `EngineConfig` centralizes sampling and compute limits so thresholds are
//! not scattered through the stages.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Rows sampled (stride-based) during schema inference.
    pub sample_row_limit: usize,
    /// Distinct sample values retained per schema column.
    pub sample_values_limit: usize,
    /// Rows scanned by the dataset profiler.
    pub max_profile_rows: usize,
    /// Rows the plan executor computes over; extra rows are ignored and the
    /// truncation is recorded in each block's assumptions.
    pub max_compute_rows: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_row_limit: 2_000,
            sample_values_limit: 25,
            max_profile_rows: 5_000,
            max_compute_rows: 20_000,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure_non_zero(self.sample_row_limit, "sample_row_limit")?;
        ensure_non_zero(self.sample_values_limit, "sample_values_limit")?;
        ensure_non_zero(self.max_profile_rows, "max_profile_rows")?;
        ensure_non_zero(self.max_compute_rows, "max_compute_rows")?;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    NonPositiveLimit { field: &'static str },
}

fn ensure_non_zero(value: usize, field: &'static str) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NonPositiveLimit { field });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_limits() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.sample_row_limit, 2_000);
        assert_eq!(cfg.sample_values_limit, 25);
        assert_eq!(cfg.max_profile_rows, 5_000);
        assert_eq!(cfg.max_compute_rows, 20_000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_limits_are_rejected() {
        let cfg = EngineConfig {
            max_compute_rows: 0,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::NonPositiveLimit {
                field: "max_compute_rows"
            })
        ));
    }

    #[test]
    fn serde_roundtrip_preserves_defaults() {
        let cfg = EngineConfig::default();
        let json = serde_json::to_string(&cfg).expect("serialize config");
        let parsed: EngineConfig = serde_json::from_str(&json).expect("deserialize config");
        assert_eq!(cfg, parsed);
    }
}
