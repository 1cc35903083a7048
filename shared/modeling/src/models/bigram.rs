use super::{require, ModelError};
use crate::batch::Example;
use crate::param_tree::ParamTree;
use crate::tensor::NamedTensor;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tessera_core::{DType, LogicalAxis, RngKey};

pub(crate) const LOGITS: &str = "lm_head.weight";
const CONTEXT_AXIS: &str = "context";
const VOCAB_AXIS: &str = "vocab";

/// A softmax bigram language model: one `[context, vocab]` logit table,
/// cross-entropy over the next token. Small enough to train on CPU and
/// has a closed-form gradient, which is all the training core needs
/// from an architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigramConfig {
    /// Forgetful context masking: probability of dropping a position
    /// from the loss, sampled from the per-example key.
    #[serde(default)]
    pub fcm_prob: f32,
    /// Uniform init half-width.
    #[serde(default = "default_init_scale")]
    pub init_scale: f32,
}

fn default_init_scale() -> f32 {
    0.02
}

impl Default for BigramConfig {
    fn default() -> Self {
        Self {
            fcm_prob: 0.0,
            init_scale: default_init_scale(),
        }
    }
}

pub(crate) fn init_params(config: &BigramConfig, vocab: &LogicalAxis, key: RngKey) -> ParamTree {
    let v = vocab.size;
    let mut rng = key.into_rng();
    let scale = config.init_scale;
    let data: Vec<f32> = (0..v * v).map(|_| rng.gen_range(-scale..scale)).collect();
    let tensor = NamedTensor::new(
        vec![
            LogicalAxis::new(CONTEXT_AXIS, v),
            LogicalAxis::new(VOCAB_AXIS, v),
        ],
        DType::F32,
        data,
    )
    .expect("bigram init shape is self-consistent");
    let mut params = ParamTree::new();
    params.insert(LOGITS, tensor);
    params
}

pub(crate) fn resize_vocab(params: &ParamTree, vocab: &LogicalAxis) -> Result<ParamTree, ModelError> {
    let logits = require(params, LOGITS)?;
    let old_v = logits.axes()[0].size;
    let new_v = vocab.size;
    let mut resized = NamedTensor::zeros(
        vec![
            LogicalAxis::new(CONTEXT_AXIS, new_v),
            LogicalAxis::new(VOCAB_AXIS, new_v),
        ],
        logits.dtype(),
    );
    let keep = old_v.min(new_v);
    let old_data = logits.data();
    for row in 0..keep {
        for col in 0..keep {
            resized.set(row * new_v + col, old_data[row * old_v + col]);
        }
    }
    let mut out = ParamTree::new();
    out.insert(LOGITS, resized);
    Ok(out)
}

pub(crate) fn loss_and_grad(
    config: &BigramConfig,
    params: &ParamTree,
    example: &Example,
    key: RngKey,
) -> Result<(f32, ParamTree), ModelError> {
    let logits = require(params, LOGITS)?;
    let vocab = logits.axes()[1].size;
    if example.tokens.len() < 2 {
        return Err(ModelError::ExampleTooShort {
            need: 2,
            got: example.tokens.len(),
        });
    }

    let mut rng = key.into_rng();
    let mut grad = logits.zeros_like();
    let mut grad_rows = vec![0.0f32; vocab * vocab];
    let mut total_loss = 0.0f64;
    let mut count = 0usize;

    for pair in example.tokens.windows(2) {
        // forgetful context masking: consume the rng draw even for kept
        // positions so masking doesn't shift downstream randomness
        let masked = rng.gen_range(0.0f32..1.0) < config.fcm_prob;
        if masked {
            continue;
        }
        let (ctx, next) = (pair[0], pair[1]);
        let ctx = check_token(ctx, vocab)?;
        let next = check_token(next, vocab)?;

        let row = &logits.data()[ctx * vocab..(ctx + 1) * vocab];
        let max = row.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut denom = 0.0f64;
        for &l in row {
            denom += ((l - max) as f64).exp();
        }
        let log_denom = denom.ln() as f32 + max;
        total_loss += (log_denom - row[next]) as f64;

        // d loss / d row = softmax(row) - onehot(next)
        for (col, &l) in row.iter().enumerate() {
            let p = (((l - max) as f64).exp() / denom) as f32;
            let target = if col == next { 1.0 } else { 0.0 };
            grad_rows[ctx * vocab + col] += p - target;
        }
        count += 1;
    }

    if count == 0 {
        // every position masked; zero contribution
        let mut out = ParamTree::new();
        out.insert(LOGITS, grad);
        return Ok((0.0, out));
    }

    let mean_loss = (total_loss / count as f64) as f32;
    if !mean_loss.is_finite() {
        return Err(ModelError::NonFinite(format!(
            "bigram loss {mean_loss} over {count} positions"
        )));
    }
    let inv = 1.0 / count as f32;
    for (i, g) in grad_rows.iter().enumerate() {
        if *g != 0.0 {
            grad.set(i, g * inv);
        }
    }

    let mut out = ParamTree::new();
    out.insert(LOGITS, grad);
    Ok((mean_loss, out))
}

fn check_token(token: i32, vocab: usize) -> Result<usize, ModelError> {
    if token < 0 || token as usize >= vocab {
        return Err(ModelError::TokenOutOfRange { token, vocab });
    }
    Ok(token as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Architecture, Model};

    fn model(vocab: usize) -> Model {
        Model::build(
            Architecture::Bigram(BigramConfig::default()),
            &LogicalAxis::new("vocab", vocab),
            RngKey::from_seed(0),
        )
    }

    #[test]
    fn loss_is_log_vocab_at_uniform_logits() {
        let m = model(16).with_params({
            let mut p = ParamTree::new();
            p.insert(
                LOGITS,
                NamedTensor::zeros(
                    vec![
                        LogicalAxis::new(CONTEXT_AXIS, 16),
                        LogicalAxis::new(VOCAB_AXIS, 16),
                    ],
                    DType::F32,
                ),
            );
            p
        });
        let (loss, grad) = m
            .loss_and_grad(&Example::new(vec![1, 2, 3]), RngKey::from_seed(1))
            .unwrap();
        assert!((loss - (16f32).ln()).abs() < 1e-5);
        // gradient rows sum to zero (softmax minus onehot)
        let g = grad.get(LOGITS).unwrap();
        let row_sum: f32 = g.data()[16..32].iter().sum();
        assert!(row_sum.abs() < 1e-5);
    }

    #[test]
    fn rejects_out_of_range_token() {
        let m = model(4);
        let err = m
            .loss_and_grad(&Example::new(vec![1, 9]), RngKey::from_seed(1))
            .unwrap_err();
        assert!(matches!(err, ModelError::TokenOutOfRange { .. }));
    }

    #[test]
    fn resize_vocab_preserves_overlap() {
        let m = model(4);
        let grown = m.resize_vocab(&LogicalAxis::new("vocab", 6)).unwrap();
        let old = m.params().get(LOGITS).unwrap();
        let new = grown.params().get(LOGITS).unwrap();
        assert_eq!(new.axes()[0].size, 6);
        assert_eq!(old.data()[0 * 4 + 1], new.data()[0 * 6 + 1]);
        // new rows are zero
        assert!(new.data()[5 * 6..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn fcm_masking_is_deterministic_per_key() {
        let arch = Architecture::Bigram(BigramConfig {
            fcm_prob: 0.5,
            ..Default::default()
        });
        let m = Model::build(arch, &LogicalAxis::new("vocab", 8), RngKey::from_seed(3));
        let ex = Example::new(vec![0, 1, 2, 3, 4, 5]);
        let a = m.loss_and_grad(&ex, RngKey::from_seed(9)).unwrap();
        let b = m.loss_and_grad(&ex, RngKey::from_seed(9)).unwrap();
        assert_eq!(a.0, b.0);
    }
}
