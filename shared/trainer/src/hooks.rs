use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use tessera_core::RngKey;
use tessera_modeling::{Batch, Model, OptimizerState};
use tracing::info;

/// Everything a hook may observe about one completed training step.
///
/// Borrows the post-step model and optimizer state, so hooks see exactly
/// what the next step will start from.
pub struct StepInfo<'a> {
    /// Index of the step that just completed.
    pub step: u64,
    pub loss: f64,
    pub lr: f64,
    /// Phase label for two-phase runs, `None` for single-phase.
    pub phase: Option<&'a str>,
    pub model: &'a Model,
    pub opt_state: &'a OptimizerState,
    /// The key the next step will split from.
    pub next_key: RngKey,
    /// Wall-clock time the step took; zero for the forced final
    /// dispatch of a zero-step run.
    pub duration: std::time::Duration,
}

pub trait Hook: Send {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()>;
}

struct HookEntry {
    name: String,
    every: u64,
    hook: Box<dyn Hook>,
}

/// An ordered hook registry. Hooks run in registration order; a hook
/// error aborts the training loop rather than being swallowed.
#[derive(Default)]
pub struct TrainerHooks {
    entries: Vec<HookEntry>,
}

impl TrainerHooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `hook` to run every `every` steps (step indices 0,
    /// `every`, `2 * every`, ...).
    pub fn add(&mut self, name: impl Into<String>, every: u64, hook: impl Hook + 'static) {
        assert!(every > 0, "hook cadence must be at least 1");
        self.entries.push(HookEntry {
            name: name.into(),
            every,
            hook: Box::new(hook),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Dispatch to every hook whose cadence matches `info.step`. With
    /// `force` the cadence check is skipped, which is how the end of a
    /// run guarantees one last dispatch to every hook.
    pub fn run(&mut self, info: &StepInfo<'_>, force: bool) -> Result<()> {
        for entry in &mut self.entries {
            if force || info.step % entry.every == 0 {
                entry
                    .hook
                    .on_step(info)
                    .map_err(|e| e.context(format!("hook {} failed", entry.name)))?;
            }
        }
        Ok(())
    }
}

/// Console progress bar over the whole run.
pub struct ProgressHook {
    bar: ProgressBar,
}

impl ProgressHook {
    pub fn new(num_train_steps: u64) -> Self {
        let bar = ProgressBar::new(num_train_steps);
        bar.set_style(
            ProgressStyle::with_template(
                "{bar:40.cyan/blue} {pos}/{len} steps [{elapsed_precise}] {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        Self { bar }
    }
}

impl Hook for ProgressHook {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()> {
        self.bar.set_position(info.step + 1);
        self.bar.set_message(format!("loss {:.4}", info.loss));
        Ok(())
    }
}

/// Evaluates the current model on a held-out batch and logs the loss.
/// The eval key is fixed at construction so every evaluation sees the
/// same conditions.
pub struct EvalHook {
    batch: Batch,
    key: RngKey,
}

impl EvalHook {
    pub fn new(batch: Batch, key: RngKey) -> Self {
        Self { batch, key }
    }
}

impl Hook for EvalHook {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()> {
        let keys = self.key.split_many(self.batch.size());
        let mut loss_sum = 0.0f64;
        for (example, key) in self.batch.examples.iter().zip(keys) {
            let (loss, _grad) = info.model.loss_and_grad(example, key)?;
            loss_sum += loss as f64;
        }
        let eval_loss = loss_sum / self.batch.size() as f64;
        info!(
            step = info.step,
            eval_loss,
            phase = info.phase.unwrap_or("train"),
            "evaluation"
        );
        Ok(())
    }
}
