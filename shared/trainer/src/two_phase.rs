use anyhow::{bail, Result};
use tessera_core::RngKey;
use tessera_data_provider::{DataProvider, MixtureProvider};
use tracing::info;

use crate::train_loop::TrainLoop;

pub const PHASE_PRETRAIN: &str = "pretrain";
pub const PHASE_FINETUNE: &str = "finetune";
/// Checkpoint tag written when phase one hands over to phase two.
pub const PHASE_BOUNDARY_TAG: &str = "phase-boundary";

/// A two-phase run: plain pretraining up to
/// `floor(num_train_steps * phase_one_fraction)`, then a second phase
/// drawing each batch from a pretrain/fine-tune mixture.
///
/// The caller resumes the loop (or not) before calling this; both
/// providers are expected fresh, and are fast-forwarded to wherever
/// the loop stands.
pub fn run_two_phase<A, B>(train: &mut TrainLoop, mut pretrain: A, finetune: B) -> Result<()>
where
    A: DataProvider,
    B: DataProvider,
{
    let Some(two_phase) = train.config().two_phase.clone() else {
        bail!("run is not configured for two phases");
    };
    let total = train.config().num_train_steps;
    let batch_size = train.config().batch_size;
    let boundary = (total as f64 * two_phase.phase_one_fraction).floor() as u64;
    let entry_step = train.step();
    info!(total, boundary, entry_step, "two-phase run");

    if entry_step < boundary {
        pretrain.skip_batches(entry_step as usize, batch_size)?;
        train.run_steps(&mut pretrain, boundary, Some(PHASE_PRETRAIN))?;
    } else {
        // already past phase one; replay its consumption of the stream
        pretrain.skip_batches(boundary as usize, batch_size)?;
    }
    if entry_step <= boundary {
        train.save_checkpoint(PHASE_BOUNDARY_TAG)?;
    }

    // the mixture key depends only on the run seed, so a resumed run
    // flips the same coins
    let mixture_key = RngKey::from_seed(train.config().seed).fold_in(2);
    let mut mixture =
        MixtureProvider::new(pretrain, finetune, two_phase.mixture_weight, mixture_key)?;
    mixture.skip_batches((train.step() - boundary) as usize, batch_size)?;
    train.run_steps(&mut mixture, total, Some(PHASE_FINETUNE))?;
    train.finalize()
}
