mod bigram;
mod fixture;

pub use bigram::BigramConfig;
pub use fixture::FixtureConfig;

use crate::batch::Example;
use crate::param_tree::ParamTree;
use crate::tensor::NamedTensor;
use serde::{Deserialize, Serialize};
use tessera_core::{DType, LogicalAxis, RngKey};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("numerical failure in forward/backward: {0}")]
    NonFinite(String),

    #[error("example too short: need at least {need} tokens, got {got}")]
    ExampleTooShort { need: usize, got: usize },

    #[error("token {token} out of range for vocab of size {vocab}")]
    TokenOutOfRange { token: i32, vocab: usize },

    #[error("missing parameter {0:?} in model tree")]
    MissingParameter(String),
}

/// Which concrete architecture a model is. Every variant exposes the
/// same capability set: forward compute (loss and gradient), parameter
/// tree traversal, and dtype casting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum Architecture {
    Bigram(BigramConfig),
    Fixture(FixtureConfig),
}

/// An immutable model snapshot: architecture plus parameter tree.
/// Training never mutates a model in place; each step builds a new
/// snapshot via `with_params`.
#[derive(Debug, Clone)]
pub struct Model {
    architecture: Architecture,
    params: ParamTree,
}

impl Model {
    /// Initialize fresh parameters for `vocab` from `key`.
    pub fn build(architecture: Architecture, vocab: &LogicalAxis, key: RngKey) -> Model {
        let params = match &architecture {
            Architecture::Bigram(config) => bigram::init_params(config, vocab, key),
            Architecture::Fixture(config) => fixture::init_params(config),
        };
        Model {
            architecture,
            params,
        }
    }

    pub fn from_parts(architecture: Architecture, params: ParamTree) -> Model {
        Model {
            architecture,
            params,
        }
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    pub fn params(&self) -> &ParamTree {
        &self.params
    }

    pub fn into_params(self) -> ParamTree {
        self.params
    }

    /// The same architecture with a replacement parameter tree.
    pub fn with_params(&self, params: ParamTree) -> Model {
        Model {
            architecture: self.architecture.clone(),
            params,
        }
    }

    pub fn cast(&self, dtype: DType) -> Model {
        Model {
            architecture: self.architecture.clone(),
            params: self.params.cast(dtype),
        }
    }

    pub fn num_parameters(&self) -> usize {
        self.params.num_elements()
    }

    /// Grow or shrink the vocab axis, preserving the overlapping rows
    /// and zero-initializing any new ones. Used when a tokenizer gains
    /// tokens after pretrained weights were produced.
    pub fn resize_vocab(&self, vocab: &LogicalAxis) -> Result<Model, ModelError> {
        match &self.architecture {
            Architecture::Bigram(config) => {
                let params = bigram::resize_vocab(&self.params, vocab)?;
                Ok(Model {
                    architecture: Architecture::Bigram(config.clone()),
                    params,
                })
            }
            Architecture::Fixture(_) => Ok(self.clone()),
        }
    }

    /// Per-example loss and a gradient tree mirroring the model's shape.
    /// Math runs in whatever dtype the parameters currently carry; the
    /// accumulator is responsible for the compute-dtype cast.
    pub fn loss_and_grad(
        &self,
        example: &Example,
        key: RngKey,
    ) -> Result<(f32, ParamTree), ModelError> {
        match &self.architecture {
            Architecture::Bigram(config) => {
                bigram::loss_and_grad(config, &self.params, example, key)
            }
            Architecture::Fixture(config) => fixture::loss_and_grad(config, &self.params, example),
        }
    }
}

pub(crate) fn require<'t>(
    params: &'t ParamTree,
    name: &str,
) -> Result<&'t NamedTensor, ModelError> {
    params
        .get(name)
        .ok_or_else(|| ModelError::MissingParameter(name.to_string()))
}
