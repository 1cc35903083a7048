use crate::param_tree::ParamTree;
use crate::tensor::NamedTensor;
use tessera_core::{DType, OptimizerDefinition};
use thiserror::Error;
use tracing::trace;

#[derive(Debug, Error)]
pub enum OptimizerError {
    #[error("gradient tree shape does not match parameter tree")]
    GradShapeMismatch,

    #[error("optimizer state shape does not match parameter tree")]
    StateShapeMismatch,

    #[error("optimizer state kind does not match optimizer definition")]
    StateKindMismatch,
}

/// Optimizer state paired one-to-one with a model. Replaced, never
/// mutated: `update` consumes a state and returns a fresh one.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizerState {
    AdamW {
        step: u64,
        exp_avg: ParamTree,
        exp_avg_sq: ParamTree,
    },
    Sgd {
        velocity: ParamTree,
    },
    Null,
}

impl OptimizerState {
    /// Flatten moment trees into one prefixed tree for serialization.
    /// The scalar step counter travels separately; it is not a tensor.
    pub fn flatten(&self) -> (ParamTree, u64) {
        match self {
            OptimizerState::AdamW {
                step,
                exp_avg,
                exp_avg_sq,
            } => {
                let mut out = ParamTree::new();
                for (name, t) in exp_avg.iter() {
                    out.insert(format!("exp_avg.{name}"), t.clone());
                }
                for (name, t) in exp_avg_sq.iter() {
                    out.insert(format!("exp_avg_sq.{name}"), t.clone());
                }
                (out, *step)
            }
            OptimizerState::Sgd { velocity } => {
                let mut out = ParamTree::new();
                for (name, t) in velocity.iter() {
                    out.insert(format!("velocity.{name}"), t.clone());
                }
                (out, 0)
            }
            OptimizerState::Null => (ParamTree::new(), 0),
        }
    }

    pub fn unflatten(
        definition: &OptimizerDefinition,
        tensors: &ParamTree,
        step: u64,
    ) -> Result<OptimizerState, OptimizerError> {
        fn strip(tensors: &ParamTree, prefix: &str) -> ParamTree {
            tensors
                .iter()
                .filter_map(|(name, t)| {
                    name.strip_prefix(prefix)
                        .map(|rest| (rest.to_string(), t.clone()))
                })
                .collect()
        }
        match definition {
            OptimizerDefinition::AdamW { .. } => {
                let exp_avg = strip(tensors, "exp_avg.");
                let exp_avg_sq = strip(tensors, "exp_avg_sq.");
                if exp_avg.is_empty() || !exp_avg.same_shape(&exp_avg_sq) {
                    return Err(OptimizerError::StateKindMismatch);
                }
                Ok(OptimizerState::AdamW {
                    step,
                    exp_avg,
                    exp_avg_sq,
                })
            }
            OptimizerDefinition::Sgd { .. } => {
                let velocity = strip(tensors, "velocity.");
                if velocity.is_empty() {
                    return Err(OptimizerError::StateKindMismatch);
                }
                Ok(OptimizerState::Sgd { velocity })
            }
            OptimizerDefinition::Dummy => Ok(OptimizerState::Null),
        }
    }
}

/// Pure update rules: `update(grads, state, params) -> (delta, state)`
/// plus `apply_updates(params, delta) -> params`. Moment math runs in
/// f32 master precision regardless of the parameter dtype.
pub enum Optimizer {
    AdamW {
        betas: [f32; 2],
        eps: f32,
        weight_decay: f32,
        clip_grad_norm: Option<f32>,
    },
    Sgd {
        momentum: f32,
        weight_decay: f32,
        clip_grad_norm: Option<f32>,
    },
    Null,
}

impl Optimizer {
    pub fn new(definition: OptimizerDefinition) -> Self {
        match definition {
            OptimizerDefinition::AdamW {
                betas,
                eps,
                weight_decay,
                clip_grad_norm,
            } => Optimizer::AdamW {
                betas,
                eps,
                weight_decay,
                clip_grad_norm,
            },
            OptimizerDefinition::Sgd {
                momentum,
                weight_decay,
                clip_grad_norm,
            } => Optimizer::Sgd {
                momentum,
                weight_decay,
                clip_grad_norm,
            },
            OptimizerDefinition::Dummy => Optimizer::Null,
        }
    }

    /// Zeroed state trees mirroring `params`.
    pub fn init(&self, params: &ParamTree) -> OptimizerState {
        let zeros = || params.zeros_like().cast(DType::F32);
        match self {
            Optimizer::AdamW { .. } => OptimizerState::AdamW {
                step: 0,
                exp_avg: zeros(),
                exp_avg_sq: zeros(),
            },
            Optimizer::Sgd { .. } => OptimizerState::Sgd { velocity: zeros() },
            Optimizer::Null => OptimizerState::Null,
        }
    }

    fn clipped(grads: &ParamTree, clip_grad_norm: Option<f32>) -> ParamTree {
        let grads = grads.cast(DType::F32);
        match clip_grad_norm {
            Some(max_norm) if max_norm > 0.0 => {
                let norm = grads.l2_norm();
                if norm > max_norm as f64 {
                    let mut clipped = grads;
                    clipped.scale((max_norm as f64 / (norm + 1e-6)) as f32);
                    trace!(norm, max_norm, "clipped gradient");
                    clipped
                } else {
                    grads
                }
            }
            _ => grads,
        }
    }

    /// One optimizer step. Neither `grads` nor `params` is modified;
    /// the consumed `state` is replaced by the returned one.
    pub fn update(
        &self,
        grads: &ParamTree,
        state: OptimizerState,
        params: &ParamTree,
        lr: f64,
    ) -> Result<(ParamTree, OptimizerState), OptimizerError> {
        if !grads.same_shape(params) {
            return Err(OptimizerError::GradShapeMismatch);
        }
        match (self, state) {
            (
                Optimizer::AdamW {
                    betas: [beta1, beta2],
                    eps,
                    weight_decay,
                    clip_grad_norm,
                },
                OptimizerState::AdamW {
                    step,
                    exp_avg,
                    exp_avg_sq,
                },
            ) => {
                if !exp_avg.same_shape(params) {
                    return Err(OptimizerError::StateShapeMismatch);
                }
                let grads = Self::clipped(grads, *clip_grad_norm);
                let step = step + 1;
                let bias1 = 1.0 - (*beta1 as f64).powi(step as i32);
                let bias2 = 1.0 - (*beta2 as f64).powi(step as i32);
                let (b1, b2) = (*beta1, *beta2);
                let (eps, wd, lr32) = (*eps, *weight_decay, lr as f32);

                let mut new_m = ParamTree::new();
                let mut new_v = ParamTree::new();
                let mut delta = ParamTree::new();
                for (name, g) in grads.iter() {
                    let m = exp_avg.get(name).ok_or(OptimizerError::StateShapeMismatch)?;
                    let v = exp_avg_sq
                        .get(name)
                        .ok_or(OptimizerError::StateShapeMismatch)?;
                    let p = params.get(name).ok_or(OptimizerError::GradShapeMismatch)?;

                    let n = g.len();
                    let mut m_data = Vec::with_capacity(n);
                    let mut v_data = Vec::with_capacity(n);
                    let mut d_data = Vec::with_capacity(n);
                    for i in 0..n {
                        let gi = g.data()[i];
                        let mi = b1 * m.data()[i] + (1.0 - b1) * gi;
                        let vi = b2 * v.data()[i] + (1.0 - b2) * gi * gi;
                        let m_hat = mi as f64 / bias1;
                        let v_hat = vi as f64 / bias2;
                        let update = m_hat / (v_hat.sqrt() + eps as f64);
                        d_data.push(-lr32 * (update as f32 + wd * p.data()[i]));
                        m_data.push(mi);
                        v_data.push(vi);
                    }
                    let axes = g.axes().to_vec();
                    new_m.insert(name.clone(), tensor_f32(axes.clone(), m_data));
                    new_v.insert(name.clone(), tensor_f32(axes.clone(), v_data));
                    delta.insert(name.clone(), tensor_f32(axes, d_data));
                }
                Ok((
                    delta,
                    OptimizerState::AdamW {
                        step,
                        exp_avg: new_m,
                        exp_avg_sq: new_v,
                    },
                ))
            }
            (
                Optimizer::Sgd {
                    momentum,
                    weight_decay,
                    clip_grad_norm,
                },
                OptimizerState::Sgd { velocity },
            ) => {
                if !velocity.same_shape(params) {
                    return Err(OptimizerError::StateShapeMismatch);
                }
                let grads = Self::clipped(grads, *clip_grad_norm);
                let (mu, wd, lr32) = (*momentum, *weight_decay, lr as f32);

                let mut new_vel = ParamTree::new();
                let mut delta = ParamTree::new();
                for (name, g) in grads.iter() {
                    let vel = velocity
                        .get(name)
                        .ok_or(OptimizerError::StateShapeMismatch)?;
                    let p = params.get(name).ok_or(OptimizerError::GradShapeMismatch)?;

                    let n = g.len();
                    let mut vel_data = Vec::with_capacity(n);
                    let mut d_data = Vec::with_capacity(n);
                    for i in 0..n {
                        let gi = g.data()[i] + wd * p.data()[i];
                        let vi = mu * vel.data()[i] + gi;
                        d_data.push(-lr32 * vi);
                        vel_data.push(vi);
                    }
                    let axes = g.axes().to_vec();
                    new_vel.insert(name.clone(), tensor_f32(axes.clone(), vel_data));
                    delta.insert(name.clone(), tensor_f32(axes, d_data));
                }
                Ok((delta, OptimizerState::Sgd { velocity: new_vel }))
            }
            (Optimizer::Null, OptimizerState::Null) => {
                Ok((params.zeros_like(), OptimizerState::Null))
            }
            _ => Err(OptimizerError::StateKindMismatch),
        }
    }
}

/// `params + delta`, quantized into the parameter dtype. Produces a
/// fresh tree; the inputs stay untouched.
pub fn apply_updates(params: &ParamTree, delta: &ParamTree) -> Result<ParamTree, OptimizerError> {
    if !params.same_shape(delta) {
        return Err(OptimizerError::GradShapeMismatch);
    }
    let mut out = params.clone();
    out.add_assign(delta)
        .map_err(|_| OptimizerError::GradShapeMismatch)?;
    Ok(out)
}

fn tensor_f32(axes: Vec<tessera_core::LogicalAxis>, data: Vec<f32>) -> NamedTensor {
    NamedTensor::new(axes, DType::F32, data).expect("update preserves tensor shape")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::LogicalAxis;

    fn params(values: &[f32]) -> ParamTree {
        let mut tree = ParamTree::new();
        tree.insert(
            "w",
            NamedTensor::new(
                vec![LogicalAxis::new("embed", values.len())],
                DType::F32,
                values.to_vec(),
            )
            .unwrap(),
        );
        tree
    }

    #[test]
    fn sgd_step_moves_against_gradient() {
        let opt = Optimizer::new(OptimizerDefinition::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
            clip_grad_norm: None,
        });
        let p = params(&[1.0, -1.0]);
        let g = params(&[0.5, -0.5]);
        let state = opt.init(&p);
        let (delta, _) = opt.update(&g, state, &p, 0.1).unwrap();
        let new_p = apply_updates(&p, &delta).unwrap();
        let w = new_p.get("w").unwrap().data();
        assert!((w[0] - 0.95).abs() < 1e-6);
        assert!((w[1] + 0.95).abs() < 1e-6);
    }

    #[test]
    fn update_is_pure() {
        let opt = Optimizer::new(OptimizerDefinition::default());
        let p = params(&[1.0]);
        let g = params(&[0.1]);
        let p_before = p.clone();
        let g_before = g.clone();
        let state = opt.init(&p);
        let (_, new_state) = opt.update(&g, state.clone(), &p, 1e-3).unwrap();
        assert_eq!(p, p_before);
        assert_eq!(g, g_before);
        assert_ne!(new_state, state);
    }

    #[test]
    fn adamw_first_step_is_lr_sized() {
        let opt = Optimizer::new(OptimizerDefinition::AdamW {
            betas: [0.9, 0.999],
            eps: 1e-8,
            weight_decay: 0.0,
            clip_grad_norm: None,
        });
        let p = params(&[0.0]);
        let g = params(&[0.3]);
        let state = opt.init(&p);
        let (delta, _) = opt.update(&g, state, &p, 1e-2).unwrap();
        // after bias correction the first step is ~lr * sign(grad)
        assert!((delta.get("w").unwrap().data()[0] + 1e-2).abs() < 1e-4);
    }

    #[test]
    fn clipping_bounds_global_norm() {
        let opt = Optimizer::new(OptimizerDefinition::Sgd {
            momentum: 0.0,
            weight_decay: 0.0,
            clip_grad_norm: Some(1.0),
        });
        let p = params(&[0.0, 0.0]);
        let g = params(&[30.0, 40.0]); // norm 50
        let state = opt.init(&p);
        let (delta, _) = opt.update(&g, state, &p, 1.0).unwrap();
        let norm = delta.l2_norm();
        assert!((norm - 1.0).abs() < 1e-3, "delta norm {norm}");
    }

    #[test]
    fn state_flatten_roundtrip() {
        let def = OptimizerDefinition::default();
        let opt = Optimizer::new(def);
        let p = params(&[1.0, 2.0]);
        let g = params(&[0.1, 0.2]);
        let (_, state) = opt.update(&g, opt.init(&p), &p, 1e-3).unwrap();
        let (tensors, step) = state.flatten();
        let back = OptimizerState::unflatten(&def, &tensors, step).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn mismatched_state_kind_is_rejected() {
        let adamw = Optimizer::new(OptimizerDefinition::default());
        let p = params(&[1.0]);
        let sgd_state = OptimizerState::Sgd {
            velocity: p.zeros_like(),
        };
        assert!(matches!(
            adamw.update(&p.zeros_like(), sgd_state, &p, 1e-3),
            Err(OptimizerError::StateKindMismatch)
        ));
    }
}
