use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tessera_core::{LearningRateSchedule, LogicalAxis, OptimizerDefinition, PrecisionPolicy};
use tessera_data_provider::{
    Cycle, InMemoryDataProvider, Shuffle, SyntheticTokenProvider, TokenizedData,
};
use tessera_modeling::{Architecture, BigramConfig};
use tessera_trainer::{
    run_two_phase, CheckpointConfig, Hook, MetricsConfig, MetricsHook, StepInfo, TrainLoop,
    TrainerConfig, TrainerHooks, TwoPhaseConfig, PHASE_BOUNDARY_TAG, PHASE_FINETUNE,
    PHASE_PRETRAIN,
};

const VOCAB: usize = 16;

fn config(run_id: &str, steps: u64, fraction: f64, root: &Path) -> TrainerConfig {
    TrainerConfig {
        run_id: run_id.into(),
        model: Architecture::Bigram(BigramConfig::default()),
        num_train_steps: steps,
        batch_size: 4,
        data_parallel_width: 1,
        per_device_parallelism: 2,
        seed: 7,
        precision: PrecisionPolicy::full_precision(),
        grad_accum_in_fp32: true,
        optimizer: OptimizerDefinition::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
            clip_grad_norm: None,
        },
        lr_schedule: LearningRateSchedule::Constant { lr: 0.05 },
        checkpoint: Some(CheckpointConfig {
            root: root.to_path_buf(),
            save_every: None,
        }),
        two_phase: Some(TwoPhaseConfig {
            phase_one_fraction: fraction,
            mixture_weight: 0.5,
        }),
    }
}

fn pretrain() -> Cycle<SyntheticTokenProvider> {
    Cycle::new(SyntheticTokenProvider::new(5, VOCAB as i32, 8).with_length(32))
}

fn finetune() -> Cycle<InMemoryDataProvider> {
    let rows = (0..8)
        .map(|_| TokenizedData::from_input_ids(vec![1; 8]))
        .collect();
    Cycle::new(InMemoryDataProvider::new(rows, Shuffle::DontShuffle).unwrap())
}

#[derive(Clone, Default)]
struct Recorder {
    losses: Arc<Mutex<Vec<(u64, f64)>>>,
}

impl Hook for Recorder {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()> {
        self.losses.lock().unwrap().push((info.step, info.loss));
        Ok(())
    }
}

#[test]
fn phases_split_at_fraction_of_total_steps() {
    let dir = tempfile::tempdir().unwrap();
    let metrics_path = dir.path().join("metrics.jsonl");
    let mut hooks = TrainerHooks::new();
    hooks.add(
        "metrics",
        1,
        MetricsHook::new(&MetricsConfig::new(&metrics_path)).unwrap(),
    );

    let mut train = TrainLoop::new(
        config("run", 10, 0.5, dir.path()),
        &LogicalAxis::new("vocab", VOCAB),
        hooks,
    )
    .unwrap();
    run_two_phase(&mut train, pretrain(), finetune()).unwrap();

    let metrics = tessera_trainer::read_metrics(&metrics_path).unwrap();
    // 10 steps plus the forced final dispatch
    assert_eq!(metrics.len(), 11);
    for m in &metrics[..5] {
        assert_eq!(m.phase.as_deref(), Some(PHASE_PRETRAIN), "step {}", m.step);
    }
    for m in &metrics[5..] {
        assert_eq!(m.phase.as_deref(), Some(PHASE_FINETUNE), "step {}", m.step);
    }

    let mut tags = train.checkpointer().unwrap().list_tags().unwrap();
    tags.sort();
    assert_eq!(
        tags,
        vec!["final".to_string(), PHASE_BOUNDARY_TAG.to_string()]
    );

    let boundary = train
        .checkpointer()
        .unwrap()
        .load_tag(PHASE_BOUNDARY_TAG, train.model(), &train.config().optimizer)
        .unwrap();
    assert_eq!(boundary.state.step, 5);
    assert_eq!(boundary.state.phase.as_deref(), Some(PHASE_PRETRAIN));
}

#[test]
fn zero_fraction_runs_entirely_in_phase_two() {
    let dir = tempfile::tempdir().unwrap();
    let recorder = Recorder::default();
    let mut hooks = TrainerHooks::new();
    hooks.add("recorder", 1, recorder.clone());

    let mut train = TrainLoop::new(
        config("run", 4, 0.0, dir.path()),
        &LogicalAxis::new("vocab", VOCAB),
        hooks,
    )
    .unwrap();
    run_two_phase(&mut train, pretrain(), finetune()).unwrap();

    assert_eq!(recorder.losses.lock().unwrap().len(), 5);
    let tags = train.checkpointer().unwrap().list_tags().unwrap();
    assert!(tags.contains(&PHASE_BOUNDARY_TAG.to_string()));
}

#[test]
fn mixture_draws_are_deterministic_across_runs() {
    let run = |run_id: &str| {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Recorder::default();
        let mut hooks = TrainerHooks::new();
        hooks.add("recorder", 1, recorder.clone());
        let mut train = TrainLoop::new(
            config(run_id, 8, 0.25, dir.path()),
            &LogicalAxis::new("vocab", VOCAB),
            hooks,
        )
        .unwrap();
        run_two_phase(&mut train, pretrain(), finetune()).unwrap();
        let losses = recorder.losses.lock().unwrap().clone();
        losses
    };

    assert_eq!(run("a"), run("b"));
}

struct FailAt {
    step: u64,
}

impl Hook for FailAt {
    fn on_step(&mut self, info: &StepInfo<'_>) -> Result<()> {
        if info.step >= self.step {
            anyhow::bail!("injected failure at step {}", info.step);
        }
        Ok(())
    }
}

#[test]
fn resume_mid_phase_two_replays_the_same_mixture() {
    let dir_full = tempfile::tempdir().unwrap();
    let dir_split = tempfile::tempdir().unwrap();

    let recorder_full = Recorder::default();
    let mut hooks = TrainerHooks::new();
    hooks.add("recorder", 1, recorder_full.clone());
    let mut full = TrainLoop::new(
        config("run", 10, 0.5, dir_full.path()),
        &LogicalAxis::new("vocab", VOCAB),
        hooks,
    )
    .unwrap();
    run_two_phase(&mut full, pretrain(), finetune()).unwrap();

    // abort at step 7, past the phase boundary, with step-7 on disk
    let mut cfg = config("run", 10, 0.5, dir_split.path());
    cfg.checkpoint.as_mut().unwrap().save_every = Some(7);
    let mut hooks = TrainerHooks::new();
    hooks.add("bomb", 1, FailAt { step: 7 });
    let mut interrupted = TrainLoop::new(
        cfg.clone(),
        &LogicalAxis::new("vocab", VOCAB),
        hooks,
    )
    .unwrap();
    assert!(run_two_phase(&mut interrupted, pretrain(), finetune()).is_err());
    drop(interrupted);

    let recorder_tail = Recorder::default();
    let mut hooks = TrainerHooks::new();
    hooks.add("recorder", 1, recorder_tail.clone());
    let mut resumed =
        TrainLoop::new(cfg, &LogicalAxis::new("vocab", VOCAB), hooks).unwrap();
    assert!(resumed.try_resume().unwrap());
    assert_eq!(resumed.step(), 7);
    run_two_phase(&mut resumed, pretrain(), finetune()).unwrap();

    let full_losses = recorder_full.losses.lock().unwrap();
    let tail_losses = recorder_tail.losses.lock().unwrap();
    assert_eq!(&full_losses[7..10], &tail_losses[..3]);
    assert_eq!(full.model().params(), resumed.model().params());
}
