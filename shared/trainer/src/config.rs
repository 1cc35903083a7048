use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tessera_core::{LearningRateSchedule, OptimizerDefinition, PrecisionPolicy};
use tessera_modeling::Architecture;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("batch size {batch_size} is not divisible by data_parallel_width {data_parallel_width} * per_device_parallelism {per_device_parallelism}")]
    BatchNotDivisible {
        batch_size: usize,
        data_parallel_width: usize,
        per_device_parallelism: usize,
    },

    #[error("phase_one_fraction {0} is not in [0, 1]")]
    InvalidPhaseFraction(f64),

    #[error("run_id must not be empty")]
    EmptyRunId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    pub root: PathBuf,
    /// Save every N steps. `None` disables periodic saves; the end of a
    /// run is always saved regardless.
    #[serde(default)]
    pub save_every: Option<u64>,
}

/// Second-phase settings for a two-phase run. The second phase mixes a
/// fine-tuning stream into the pretraining stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TwoPhaseConfig {
    /// Fraction of `num_train_steps` spent in phase one.
    pub phase_one_fraction: f64,
    /// Probability that a phase-two batch comes from the fine-tuning
    /// stream.
    pub mixture_weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainerConfig {
    pub run_id: String,
    pub model: Architecture,
    pub num_train_steps: u64,
    pub batch_size: usize,
    pub data_parallel_width: usize,
    pub per_device_parallelism: usize,
    pub seed: u64,

    #[serde(default = "PrecisionPolicy::full_precision")]
    pub precision: PrecisionPolicy,
    #[serde(default = "default_true")]
    pub grad_accum_in_fp32: bool,

    #[serde(default)]
    pub optimizer: OptimizerDefinition,
    pub lr_schedule: LearningRateSchedule,

    #[serde(default)]
    pub checkpoint: Option<CheckpointConfig>,
    #[serde(default)]
    pub two_phase: Option<TwoPhaseConfig>,
}

fn default_true() -> bool {
    true
}

impl TrainerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.run_id.is_empty() {
            return Err(ConfigError::EmptyRunId);
        }
        let microbatch = self.data_parallel_width * self.per_device_parallelism;
        if self.batch_size % microbatch != 0 {
            return Err(ConfigError::BatchNotDivisible {
                batch_size: self.batch_size,
                data_parallel_width: self.data_parallel_width,
                per_device_parallelism: self.per_device_parallelism,
            });
        }
        if let Some(two_phase) = &self.two_phase {
            if !(0.0..=1.0).contains(&two_phase.phase_one_fraction) {
                return Err(ConfigError::InvalidPhaseFraction(
                    two_phase.phase_one_fraction,
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_modeling::{Architecture, FixtureConfig};

    fn base() -> TrainerConfig {
        TrainerConfig {
            run_id: "test".into(),
            model: Architecture::Fixture(FixtureConfig::default()),
            num_train_steps: 10,
            batch_size: 8,
            data_parallel_width: 2,
            per_device_parallelism: 2,
            seed: 0,
            precision: PrecisionPolicy::full_precision(),
            grad_accum_in_fp32: true,
            optimizer: OptimizerDefinition::default(),
            lr_schedule: LearningRateSchedule::Constant { lr: 1e-3 },
            checkpoint: None,
            two_phase: None,
        }
    }

    #[test]
    fn accepts_divisible_batch() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn rejects_indivisible_batch() {
        let mut config = base();
        config.batch_size = 10;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::BatchNotDivisible { .. })
        ));
    }

    #[test]
    fn roundtrips_through_json() {
        let config = base();
        let json = serde_json::to_string(&config).unwrap();
        let back: TrainerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, config.run_id);
        assert_eq!(back.batch_size, config.batch_size);
    }
}
