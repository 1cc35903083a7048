use super::{require, ModelError};
use crate::batch::Example;
use crate::param_tree::ParamTree;
use crate::tensor::NamedTensor;
use serde::{Deserialize, Serialize};
use tessera_core::{DType, LogicalAxis};

pub(crate) const WEIGHT: &str = "weight";

/// A deterministic stand-in architecture for exercising the training
/// machinery: per-example loss is the leading token's value and the
/// gradient is that value broadcast over a flat weight vector. Lets
/// tests assert exact accumulator arithmetic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureConfig {
    pub width: usize,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self { width: 4 }
    }
}

pub(crate) fn init_params(config: &FixtureConfig) -> ParamTree {
    let mut params = ParamTree::new();
    params.insert(
        WEIGHT,
        NamedTensor::zeros(vec![LogicalAxis::new("embed", config.width)], DType::F32),
    );
    params
}

pub(crate) fn loss_and_grad(
    _config: &FixtureConfig,
    params: &ParamTree,
    example: &Example,
) -> Result<(f32, ParamTree), ModelError> {
    let weight = require(params, WEIGHT)?;
    let value = *example.tokens.first().ok_or(ModelError::ExampleTooShort {
        need: 1,
        got: 0,
    })? as f32;
    let grad = weight.map(|_| value);
    let mut tree = ParamTree::new();
    tree.insert(WEIGHT, grad);
    Ok((value, tree))
}
