use crate::batch::{Batch, KeyedExamples};
use crate::models::{Model, ModelError};
use crate::param_tree::ParamTree;
use itertools::izip;
use std::sync::Arc;
use tessera_core::{AxisContext, MeshConfig, PrecisionPolicy, RngKey};
use thiserror::Error;
use tracing::{debug, trace};

/// Logical axis name of the leading batch dimension.
pub const BATCH_AXIS: &str = "batch";

#[derive(Debug, Error)]
pub enum AccumulatorError {
    #[error("batch size {batch_size} not divisible by microbatch size {microbatch_size} \
             (data_parallel_width {data_parallel_width} x per_device_parallelism {per_device_parallelism})")]
    BatchNotDivisible {
        batch_size: usize,
        microbatch_size: usize,
        data_parallel_width: usize,
        per_device_parallelism: usize,
    },

    #[error("got {keys} per-example RNG keys for batch of size {batch_size}")]
    KeyCountMismatch { keys: usize, batch_size: usize },

    #[error("empty batch")]
    EmptyBatch,

    #[error(transparent)]
    Computation(#[from] ModelError),

    #[error("non-finite loss {value} in microbatch {microbatch}")]
    NonFiniteLoss { value: f32, microbatch: usize },

    #[error("shard worker thread disconnected")]
    ShardDisconnected,
}

enum ShardAssignment {
    Microbatch {
        model: Arc<Model>,
        slice: KeyedExamples,
    },
}

enum ShardResult {
    Partial { loss_sum: f64, grad_sum: ParamTree },
    Failed(ModelError),
}

/// Microbatched gradient accumulation over a data-parallel shard pool.
///
/// The logical batch is split into `B / (data_parallel_width *
/// per_device_parallelism)` microbatches; each microbatch is split
/// across one worker thread per data-parallel shard. Workers sum
/// per-example losses and gradients in compute dtype; the caller-side
/// accumulator combines the partial sums (addition only, never nested
/// means) and produces the final mean over `B` in parameter dtype.
///
/// Microbatching bounds per-shard memory and must not change the
/// result: the mean is numerically equivalent, up to cast rounding, to
/// one full-batch pass.
pub struct ShardedAccumulator {
    shards: Vec<(flume::Sender<ShardAssignment>, flume::Receiver<ShardResult>)>,
    data_parallel_width: usize,
    per_device_parallelism: usize,
    precision: PrecisionPolicy,
    mesh: MeshConfig,
    grad_accum_in_fp32: bool,
}

impl ShardedAccumulator {
    pub fn new(
        mesh: MeshConfig,
        per_device_parallelism: usize,
        precision: PrecisionPolicy,
        grad_accum_in_fp32: bool,
    ) -> Self {
        assert!(mesh.data_parallel_width > 0);
        assert!(per_device_parallelism > 0);
        let data_parallel_width = mesh.data_parallel_width;
        let output_dtype = precision.output;

        let mut shards = Vec::with_capacity(data_parallel_width);
        for rank in 0..data_parallel_width {
            let (assignment_tx, assignment_rx) = flume::unbounded::<ShardAssignment>();
            let (result_tx, result_rx) = flume::unbounded();
            shards.push((assignment_tx, result_rx));

            std::thread::spawn(move || {
                Self::shard_thread(rank, assignment_rx, result_tx, output_dtype)
            });
        }

        Self {
            shards,
            data_parallel_width,
            per_device_parallelism,
            precision,
            mesh,
            grad_accum_in_fp32,
        }
    }

    fn shard_thread(
        rank: usize,
        assignment: flume::Receiver<ShardAssignment>,
        submission: flume::Sender<ShardResult>,
        output_dtype: tessera_core::DType,
    ) {
        while let Ok(ShardAssignment::Microbatch { model, slice }) = assignment.recv() {
            let mut loss_sum = 0.0f64;
            let mut grad_sum = model.params().zeros_like();
            let mut failure = None;

            for (example, key) in izip!(&slice.examples, &slice.keys) {
                match model.loss_and_grad(example, *key) {
                    Ok((loss, grad)) => {
                        // loss reduction happens in output dtype
                        loss_sum += output_dtype.quantize(loss) as f64;
                        if let Err(err) = grad_sum.add_assign(&grad) {
                            failure = Some(ModelError::NonFinite(format!(
                                "gradient shape drift on shard {rank}: {err}"
                            )));
                            break;
                        }
                    }
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }

            let result = match failure {
                None => ShardResult::Partial { loss_sum, grad_sum },
                Some(err) => ShardResult::Failed(err),
            };
            if submission.send(result).is_err() {
                return;
            }
        }
        trace!(rank, "shard worker shutting down");
    }

    pub fn microbatch_size(&self) -> usize {
        self.data_parallel_width * self.per_device_parallelism
    }

    /// Mean loss and mean gradient over the whole batch.
    ///
    /// Fails before dispatching any shard work if the batch does not
    /// divide evenly into microbatches or the key count is wrong.
    pub fn accumulate(
        &self,
        model: &Model,
        batch: &Batch,
        keys: &[RngKey],
    ) -> Result<(f32, ParamTree), AccumulatorError> {
        let batch_size = batch.size();
        let microbatch_size = self.microbatch_size();
        if batch_size == 0 {
            return Err(AccumulatorError::EmptyBatch);
        }
        if batch_size % microbatch_size != 0 {
            return Err(AccumulatorError::BatchNotDivisible {
                batch_size,
                microbatch_size,
                data_parallel_width: self.data_parallel_width,
                per_device_parallelism: self.per_device_parallelism,
            });
        }
        if keys.len() != batch_size {
            return Err(AccumulatorError::KeyCountMismatch {
                keys: keys.len(),
                batch_size,
            });
        }
        let num_microbatches = batch_size / microbatch_size;

        // forward/backward runs under the compute-sharded view of the
        // model; the mapping context is restored when `compute_scope`
        // drops, including on the error paths below
        let mut ctx = AxisContext::new(self.mesh.parameter_axis_mapping.clone());
        let compute_scope = ctx.scoped(&self.mesh.compute_axis_mapping, false);
        let batch_mesh_axis = compute_scope.resolve(BATCH_AXIS);
        debug!(
            batch_size,
            num_microbatches,
            microbatch_size,
            batch_mesh_axis = batch_mesh_axis.unwrap_or("replicated"),
            "accumulating gradients"
        );

        let compute_model = Arc::new(model.cast(self.precision.compute));

        // master accumulator; fp32 by default, compute dtype otherwise
        let accum_dtype = if self.grad_accum_in_fp32 {
            tessera_core::DType::F32
        } else {
            self.precision.compute
        };
        let mut grad_accum = model.params().zeros_like().cast(accum_dtype);
        let mut loss_accum = 0.0f64;

        for microbatch in 0..num_microbatches {
            let base = microbatch * microbatch_size;
            let mut dispatched = 0;
            for (rank, (tx, _)) in self.shards.iter().enumerate() {
                let lo = base + rank * self.per_device_parallelism;
                let hi = lo + self.per_device_parallelism;
                let slice = KeyedExamples {
                    examples: batch.examples[lo..hi].to_vec(),
                    keys: keys[lo..hi].to_vec(),
                };
                if tx
                    .send(ShardAssignment::Microbatch {
                        model: compute_model.clone(),
                        slice,
                    })
                    .is_err()
                {
                    break;
                }
                dispatched += 1;
            }

            // drain every shard that got an assignment before acting on
            // any failure, so a stale result can never leak into the
            // next call
            let mut results = Vec::with_capacity(dispatched);
            let mut disconnected = dispatched < self.shards.len();
            for (_, rx) in self.shards.iter().take(dispatched) {
                match rx.recv() {
                    Ok(result) => results.push(result),
                    Err(_) => disconnected = true,
                }
            }
            if disconnected {
                return Err(AccumulatorError::ShardDisconnected);
            }

            for result in results {
                match result {
                    ShardResult::Partial { loss_sum, grad_sum } => {
                        if !loss_sum.is_finite() {
                            return Err(AccumulatorError::NonFiniteLoss {
                                value: loss_sum as f32,
                                microbatch,
                            });
                        }
                        loss_accum += loss_sum;
                        grad_accum
                            .add_assign(&grad_sum)
                            .map_err(|err| ModelError::NonFinite(err.to_string()))?;
                    }
                    ShardResult::Failed(err) => return Err(err.into()),
                }
            }
            trace!(microbatch, "microbatch accumulated");
        }
        drop(compute_scope);

        // final mean divides by the total example count, not by the
        // microbatch count, and lands in parameter dtype under the
        // parameter-sharded view
        let _param_scope = ctx.scoped(&self.mesh.parameter_axis_mapping, false);
        let mut mean_grad = grad_accum.cast(self.precision.parameter);
        mean_grad.scale(1.0 / batch_size as f32);
        let mean_loss = self
            .precision
            .output
            .quantize((loss_accum / batch_size as f64) as f32);

        Ok((mean_loss, mean_grad))
    }
}

impl std::fmt::Debug for ShardedAccumulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedAccumulator")
            .field("data_parallel_width", &self.data_parallel_width)
            .field("per_device_parallelism", &self.per_device_parallelism)
            .field("precision", &self.precision)
            .finish()
    }
}
