mod checkpoint;
mod config;
mod hooks;
mod metrics;
mod train_loop;
mod two_phase;

pub use checkpoint::{CheckpointError, Checkpointer, LoadedCheckpoint, TrainState};
pub use config::{CheckpointConfig, ConfigError, TrainerConfig, TwoPhaseConfig};
pub use hooks::{EvalHook, Hook, ProgressHook, StepInfo, TrainerHooks};
pub use metrics::{read_metrics, MetricsConfig, MetricsHook, MetricsRecorder, StepMetrics};
pub use train_loop::{TrainLoop, TrainLoopError};
pub use two_phase::{run_two_phase, PHASE_BOUNDARY_TAG, PHASE_FINETUNE, PHASE_PRETRAIN};
