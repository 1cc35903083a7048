use anyhow::{Context, Result};
use tessera_core::{AxisMapping, LogicalAxis, MeshConfig, RngKey};
use tessera_data_provider::DataProvider;
use tessera_modeling::{
    apply_updates, Batch, Example, Model, Optimizer, OptimizerState, ShardedAccumulator,
    BATCH_AXIS,
};
use thiserror::Error;
use tracing::{debug, info};

use crate::checkpoint::{Checkpointer, TrainState};
use crate::config::TrainerConfig;
use crate::hooks::{StepInfo, TrainerHooks};

#[derive(Debug, Error)]
pub enum TrainLoopError {
    #[error("data stream ended at step {step}; wrap the provider in Cycle for infinite runs")]
    DataExhausted { step: u64 },
}

/// The synchronous training step state machine.
///
/// One control thread owns the model, the optimizer state and the RNG
/// key thread; gradient work is fanned out through the accumulator and
/// joined before the optimizer runs. Each step is a pure function of
/// (params, opt state, key, batch), which is what makes runs
/// reproducible and resumable.
pub struct TrainLoop {
    config: TrainerConfig,
    model: Model,
    optimizer: Optimizer,
    opt_state: OptimizerState,
    accumulator: ShardedAccumulator,
    hooks: TrainerHooks,
    checkpointer: Option<Checkpointer>,
    /// Key thread: split once per step, never reused.
    key: RngKey,
    /// Number of completed steps, and the index of the next one.
    step: u64,
    phase: Option<String>,
    last_loss: f64,
    last_lr: f64,
    finalized: bool,
}

impl TrainLoop {
    pub fn new(config: TrainerConfig, vocab: &LogicalAxis, hooks: TrainerHooks) -> Result<Self> {
        let init_key = RngKey::from_seed(config.seed).split().0;
        let model = Model::build(config.model.clone(), vocab, init_key);
        Self::from_model(config, model, hooks)
    }

    /// Start from an existing model instead of a fresh init, e.g. a
    /// pretrained checkpoint whose vocab was resized for new tokens.
    /// The key thread is the same either way, so a warm start changes
    /// the weights but not the data or dropout draws.
    pub fn from_model(config: TrainerConfig, model: Model, hooks: TrainerHooks) -> Result<Self> {
        config.validate()?;

        let training_key = RngKey::from_seed(config.seed).split().1;
        let model = model.cast(config.precision.parameter);
        let optimizer = Optimizer::new(config.optimizer);
        let opt_state = optimizer.init(model.params());

        let mesh = MeshConfig {
            data_parallel_width: config.data_parallel_width,
            model_parallel_width: 1,
            parameter_axis_mapping: AxisMapping::new(),
            compute_axis_mapping: AxisMapping::new().with(BATCH_AXIS, "data"),
        };
        let accumulator = ShardedAccumulator::new(
            mesh,
            config.per_device_parallelism,
            config.precision,
            config.grad_accum_in_fp32,
        );

        let checkpointer = match &config.checkpoint {
            Some(checkpoint) => Some(Checkpointer::new(
                checkpoint.root.clone(),
                &config.run_id,
                checkpoint.save_every,
            )?),
            None => None,
        };

        Ok(Self {
            config,
            model,
            optimizer,
            opt_state,
            accumulator,
            hooks,
            checkpointer,
            key: training_key,
            step: 0,
            phase: None,
            last_loss: f64::NAN,
            last_lr: 0.0,
            finalized: false,
        })
    }

    pub fn step(&self) -> u64 {
        self.step
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn checkpointer(&self) -> Option<&Checkpointer> {
        self.checkpointer.as_ref()
    }

    /// Restore the most recent checkpoint of this run, if any. Returns
    /// whether a checkpoint was found. On restore the data provider
    /// must be advanced with [`TrainLoop::catch_up_provider`].
    pub fn try_resume(&mut self) -> Result<bool> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(false);
        };
        let Some(loaded) = checkpointer.load_latest(&self.model, &self.config.optimizer)? else {
            debug!("no checkpoint found, starting fresh");
            return Ok(false);
        };
        info!(
            step = loaded.state.step,
            phase = loaded.state.phase.as_deref().unwrap_or("train"),
            "resuming from checkpoint"
        );
        self.model = loaded.model;
        self.opt_state = loaded.opt_state;
        self.key = loaded.state.next_key;
        self.step = loaded.state.step;
        self.phase = loaded.state.phase;
        Ok(true)
    }

    /// Skip the batches a fresh provider would have served to the
    /// already-completed steps, so the resumed run sees the same data
    /// order an uninterrupted run would.
    pub fn catch_up_provider(&self, provider: &mut dyn DataProvider) -> Result<()> {
        provider.skip_batches(self.step as usize, self.config.batch_size)?;
        Ok(())
    }

    /// Run to `num_train_steps`, then finalize. The provider is assumed
    /// fresh; resumed runs are caught up first.
    pub fn run(&mut self, provider: &mut dyn DataProvider) -> Result<()> {
        self.catch_up_provider(provider)?;
        self.run_steps(provider, self.config.num_train_steps, None)?;
        self.finalize()
    }

    /// Advance until `until_step` completed steps, dispatching hooks
    /// and periodic checkpoints along the way.
    pub fn run_steps(
        &mut self,
        provider: &mut dyn DataProvider,
        until_step: u64,
        phase: Option<&str>,
    ) -> Result<()> {
        self.phase = phase.map(str::to_string);
        while self.step < until_step {
            let started = std::time::Instant::now();
            let rows = provider
                .next_batch(self.config.batch_size)?
                .ok_or(TrainLoopError::DataExhausted { step: self.step })?;
            let batch = Batch::new(
                rows.into_iter()
                    .map(|r| Example::new(r.into_input_ids()))
                    .collect(),
            );

            // one split per step; the step key never survives the step
            let (step_key, next_key) = self.key.split();
            self.key = next_key;
            let example_keys = step_key.split_many(batch.size());

            let (loss, grads) = self
                .accumulator
                .accumulate(&self.model, &batch, &example_keys)
                .with_context(|| format!("gradient accumulation at step {}", self.step))?;

            let lr = self.config.lr_schedule.get_lr(self.step);
            let state = std::mem::replace(&mut self.opt_state, OptimizerState::Null);
            let (delta, new_state) = self
                .optimizer
                .update(&grads, state, self.model.params(), lr)?;
            let params = apply_updates(self.model.params(), &delta)?;
            self.model = self.model.with_params(params);
            self.opt_state = new_state;
            self.last_loss = loss as f64;
            self.last_lr = lr;

            debug!(step = self.step, loss, lr, "step complete");
            let info = StepInfo {
                step: self.step,
                loss: loss as f64,
                lr,
                phase: self.phase.as_deref(),
                model: &self.model,
                opt_state: &self.opt_state,
                next_key: self.key,
                duration: started.elapsed(),
            };
            self.hooks.run(&info, false)?;
            if let Some(checkpointer) = &self.checkpointer {
                checkpointer.on_step(&info, false, None)?;
            }

            self.step += 1;
        }
        Ok(())
    }

    /// Force a checkpoint save under `tag` with the current loop state.
    pub fn save_checkpoint(&self, tag: &str) -> Result<()> {
        let Some(checkpointer) = &self.checkpointer else {
            return Ok(());
        };
        let state = TrainState {
            step: self.step,
            next_key: self.key,
            phase: self.phase.clone(),
            optimizer_step: self.opt_state.flatten().1,
            saved_at_ms: crate::checkpoint::now_ms(),
        };
        checkpointer.save(tag, &self.model, &self.opt_state, &state)?;
        Ok(())
    }

    /// One last forced hook dispatch and checkpoint save. Runs exactly
    /// once, even for runs with zero training steps.
    pub fn finalize(&mut self) -> Result<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;

        let info = StepInfo {
            step: self.step.saturating_sub(1),
            loss: self.last_loss,
            lr: self.last_lr,
            phase: self.phase.as_deref(),
            model: &self.model,
            opt_state: &self.opt_state,
            next_key: self.key,
            duration: std::time::Duration::ZERO,
        };
        self.hooks.run(&info, true)?;
        self.save_checkpoint("final")?;
        info!(steps = self.step, "run finished");
        Ok(())
    }
}
