use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tessera_core::{OptimizerDefinition, RngKey};
use tessera_modeling::{
    read_safetensors, write_safetensors, Model, Optimizer, OptimizerState, SafetensorIoError,
};
use thiserror::Error;
use tracing::info;

use crate::hooks::StepInfo;

const MODEL_FILE: &str = "model.safetensors";
const OPT_STATE_FILE: &str = "opt_state.safetensors";
const STATE_FILE: &str = "state.json";

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io: {0}")]
    Io(#[from] std::io::Error),

    #[error("checkpoint state: {0}")]
    State(#[from] serde_json::Error),

    #[error("checkpoint tensors: {0}")]
    Tensors(#[from] SafetensorIoError),

    #[error("optimizer state in checkpoint does not match: {0}")]
    Optimizer(#[from] tessera_modeling::OptimizerError),

    #[error("no checkpoint under {0}")]
    NotFound(PathBuf),

    #[error(
        "checkpoint parameters do not match the current model \
         (saved {saved} tensors, model has {expected})"
    )]
    ShapeMismatch { saved: usize, expected: usize },
}

/// Loop state saved next to the weights. `step` counts completed
/// steps, so a resumed run skips exactly `step` batches and continues
/// from `next_key` as if it had never stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainState {
    pub step: u64,
    pub next_key: RngKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub optimizer_step: u64,
    pub saved_at_ms: u64,
}

#[derive(Debug)]
pub struct LoadedCheckpoint {
    pub model: Model,
    pub opt_state: OptimizerState,
    pub state: TrainState,
}

/// Writes and restores `{root}/{run_id}/{tag}` checkpoint directories.
///
/// A save lands in a temp directory first and is `rename`d into place,
/// so a crash mid-save never leaves a partial checkpoint behind.
pub struct Checkpointer {
    run_dir: PathBuf,
    save_every: Option<u64>,
}

impl Checkpointer {
    pub fn new(
        root: impl Into<PathBuf>,
        run_id: &str,
        save_every: Option<u64>,
    ) -> Result<Self, CheckpointError> {
        let run_dir = root.into().join(run_id);
        fs::create_dir_all(&run_dir)?;
        Ok(Self {
            run_dir,
            save_every,
        })
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Periodic save driven by the step counter. With `force`, saves
    /// under `tag` unconditionally; otherwise saves as `step-N` every
    /// `save_every` completed steps.
    pub fn on_step(
        &self,
        info: &StepInfo<'_>,
        force: bool,
        tag: Option<&str>,
    ) -> Result<Option<PathBuf>, CheckpointError> {
        let completed = info.step + 1;
        let due = self
            .save_every
            .map(|every| completed % every == 0)
            .unwrap_or(false);
        if !force && !due {
            return Ok(None);
        }
        let step_tag = format!("step-{completed}");
        let tag = tag.unwrap_or(&step_tag);
        let state = TrainState {
            step: completed,
            next_key: info.next_key,
            phase: info.phase.map(str::to_string),
            optimizer_step: info.opt_state.flatten().1,
            saved_at_ms: now_ms(),
        };
        self.save(tag, info.model, info.opt_state, &state).map(Some)
    }

    pub fn save(
        &self,
        tag: &str,
        model: &Model,
        opt_state: &OptimizerState,
        state: &TrainState,
    ) -> Result<PathBuf, CheckpointError> {
        let staging = tempfile::Builder::new()
            .prefix(".staging-")
            .tempdir_in(&self.run_dir)?;

        write_safetensors(&staging.path().join(MODEL_FILE), model.params())?;
        let (opt_tensors, _opt_step) = opt_state.flatten();
        write_safetensors(&staging.path().join(OPT_STATE_FILE), &opt_tensors)?;
        fs::write(
            staging.path().join(STATE_FILE),
            serde_json::to_string_pretty(state)?,
        )?;

        // a previous save under this tag is renamed aside, not deleted,
        // until the replacement is in place; a crash between the two
        // renames leaves either the old or the new checkpoint visible
        let target = self.run_dir.join(tag);
        let retired = self.run_dir.join(format!(".old-{tag}"));
        if retired.exists() {
            fs::remove_dir_all(&retired)?;
        }
        let had_previous = target.exists();
        if had_previous {
            fs::rename(&target, &retired)?;
        }
        fs::rename(staging.keep(), &target)?;
        if had_previous {
            fs::remove_dir_all(&retired)?;
        }
        info!(tag, step = state.step, path = %target.display(), "saved checkpoint");
        Ok(target)
    }

    /// Tags present under the run directory, sorted by name.
    pub fn list_tags(&self) -> Result<Vec<String>, CheckpointError> {
        let mut tags = Vec::new();
        for entry in fs::read_dir(&self.run_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            if entry.path().join(STATE_FILE).exists() {
                tags.push(name);
            }
        }
        tags.sort();
        Ok(tags)
    }

    pub fn load_tag(
        &self,
        tag: &str,
        reference: &Model,
        optimizer: &OptimizerDefinition,
    ) -> Result<LoadedCheckpoint, CheckpointError> {
        let dir = self.run_dir.join(tag);
        if !dir.is_dir() {
            return Err(CheckpointError::NotFound(dir));
        }
        let state: TrainState = serde_json::from_str(&fs::read_to_string(dir.join(STATE_FILE))?)?;

        let params = read_safetensors(&dir.join(MODEL_FILE))?;
        if !reference.params().same_shape(&params) {
            return Err(CheckpointError::ShapeMismatch {
                saved: params.len(),
                expected: reference.params().len(),
            });
        }
        let model = reference.with_params(params);

        let opt_tensors = read_safetensors(&dir.join(OPT_STATE_FILE))?;
        let opt_state = if opt_tensors.is_empty() {
            Optimizer::new(*optimizer).init(model.params())
        } else {
            OptimizerState::unflatten(optimizer, &opt_tensors, state.optimizer_step)?
        };

        Ok(LoadedCheckpoint {
            model,
            opt_state,
            state,
        })
    }

    /// The most advanced checkpoint of the run, or `None` for a fresh
    /// start.
    pub fn load_latest(
        &self,
        reference: &Model,
        optimizer: &OptimizerDefinition,
    ) -> Result<Option<LoadedCheckpoint>, CheckpointError> {
        let mut best: Option<(u64, u64, String)> = None;
        for tag in self.list_tags()? {
            let state_path = self.run_dir.join(&tag).join(STATE_FILE);
            let state: TrainState = serde_json::from_str(&fs::read_to_string(state_path)?)?;
            let candidate = (state.step, state.saved_at_ms, tag);
            if best.as_ref().map(|b| candidate > *b).unwrap_or(true) {
                best = Some(candidate);
            }
        }
        match best {
            Some((_, _, tag)) => self.load_tag(&tag, reference, optimizer).map(Some),
            None => Ok(None),
        }
    }
}

pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
