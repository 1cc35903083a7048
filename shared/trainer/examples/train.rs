use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tessera_core::{DType, LearningRateSchedule, OptimizerDefinition, PrecisionPolicy};
use tessera_data_provider::{
    Cycle, InMemoryDataProvider, Shuffle, SyntheticTokenProvider, TokenizedData,
};
use tessera_modeling::{
    load_pretrained, Architecture, BigramConfig, StaticTokenizer, Tokenizer,
};
use tessera_trainer::{
    run_two_phase, CheckpointConfig, EvalHook, MetricsConfig, MetricsHook, ProgressHook,
    TrainLoop, TrainerConfig, TrainerHooks, TwoPhaseConfig,
};
use tracing::info;

#[derive(Parser, Debug, Clone)]
struct Args {
    #[arg(long, default_value_t = 200)]
    steps: u64,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long, default_value_t = 2)]
    data_parallel_width: usize,

    #[arg(long, default_value_t = 4)]
    per_device_parallelism: usize,

    #[arg(long, default_value_t = 64)]
    vocab_size: usize,

    #[arg(long, default_value_t = 32)]
    sequence_length: usize,

    #[arg(long, default_value_t = 42, env = "TESSERA_SEED")]
    seed: u64,

    /// Train with bf16 compute and f32 parameters.
    #[arg(long, default_value_t = false)]
    mixed_precision: bool,

    #[arg(long, default_value = "demo")]
    run_id: String,

    #[arg(long, default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    #[arg(long, default_value_t = 50)]
    checkpoint_every: u64,

    /// Fraction of steps spent pretraining before the fine-tune
    /// mixture kicks in.
    #[arg(long, default_value_t = 0.8)]
    phase_one_fraction: f64,

    #[arg(long, default_value_t = 0.3)]
    mixture_weight: f64,

    #[arg(long)]
    metrics_path: Option<PathBuf>,

    /// Warm-start from a bare safetensors logit table instead of a
    /// fresh init. The table is resized to `--vocab-size`.
    #[arg(long)]
    pretrained: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();

    let precision = if args.mixed_precision {
        PrecisionPolicy::mixed_bf16()
    } else {
        PrecisionPolicy::full_precision()
    };

    let config = TrainerConfig {
        run_id: args.run_id.clone(),
        model: Architecture::Bigram(BigramConfig::default()),
        num_train_steps: args.steps,
        batch_size: args.batch_size,
        data_parallel_width: args.data_parallel_width,
        per_device_parallelism: args.per_device_parallelism,
        seed: args.seed,
        precision,
        grad_accum_in_fp32: true,
        optimizer: OptimizerDefinition::default(),
        lr_schedule: LearningRateSchedule::Cosine {
            base_lr: 3e-2,
            final_lr: 3e-3,
            warmup_steps: args.steps / 20,
            total_steps: args.steps,
        },
        checkpoint: Some(CheckpointConfig {
            root: args.checkpoint_dir.clone(),
            save_every: Some(args.checkpoint_every),
        }),
        two_phase: Some(TwoPhaseConfig {
            phase_one_fraction: args.phase_one_fraction,
            mixture_weight: args.mixture_weight,
        }),
    };

    let tokenizer = StaticTokenizer {
        vocab_size: args.vocab_size,
        pad_token_id: 0,
    };
    let vocab = tokenizer.vocab_axis();
    let pretrain = Cycle::new(
        SyntheticTokenProvider::new(args.seed, args.vocab_size as i32, args.sequence_length)
            .with_length(4096),
    );
    // tiny "instruction" set: every sequence walks the vocab in order
    let finetune_rows = (0..64usize)
        .map(|j| {
            TokenizedData::from_input_ids(
                (0..args.sequence_length)
                    .map(|t| ((j + t) % args.vocab_size) as i32)
                    .collect(),
            )
        })
        .collect();
    let finetune = Cycle::new(
        InMemoryDataProvider::new(finetune_rows, Shuffle::Seeded([7u8; 32]))
            .context("building fine-tune dataset")?,
    );

    let mut hooks = TrainerHooks::new();
    hooks.add("progress", 1, ProgressHook::new(args.steps));
    if let Some(metrics_path) = &args.metrics_path {
        hooks.add(
            "metrics",
            1,
            MetricsHook::new(&MetricsConfig::new(metrics_path))
                .context("opening metrics file")?,
        );
    }
    let eval_batch = tessera_modeling::Batch::new(
        (0..8usize)
            .map(|j| {
                tessera_modeling::Example::new(
                    (0..args.sequence_length)
                        .map(|t| ((j + t) % args.vocab_size) as i32)
                        .collect(),
                )
            })
            .collect(),
    );
    hooks.add(
        "eval",
        25,
        EvalHook::new(eval_batch, tessera_core::RngKey::from_seed(args.seed ^ 1)),
    );

    let mut train = match &args.pretrained {
        Some(path) => {
            let model = load_pretrained(Architecture::Bigram(BigramConfig::default()), path)
                .context("loading pretrained weights")?
                .resize_vocab(&vocab)?;
            TrainLoop::from_model(config, model, hooks)?
        }
        None => TrainLoop::new(config, &vocab, hooks)?,
    };
    if train.try_resume()? {
        info!(step = train.step(), "resumed");
    }
    run_two_phase(&mut train, pretrain, finetune)?;

    let compute_dtype = if args.mixed_precision {
        DType::Bf16
    } else {
        DType::F32
    };
    info!(
        steps = train.step(),
        params = train.model().num_parameters(),
        dtype = ?compute_dtype,
        "training complete"
    );
    Ok(())
}
