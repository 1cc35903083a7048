use crate::tensor::{NamedTensor, TensorError};
use std::collections::BTreeMap;
use tessera_core::DType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TreeError {
    #[error("parameter {name:?} present in one tree but not the other")]
    MissingParameter { name: String },

    #[error("parameter {name:?}: {source}")]
    Tensor {
        name: String,
        #[source]
        source: TensorError,
    },
}

/// An ordered tree of named parameters. Gradient and optimizer-state
/// trees mirror a model's tree by construction (`zeros_like`), which is
/// the structural-shape contract the accumulator and optimizer rely on.
///
/// Iteration order is the sorted name order, so norm reductions and
/// serialization are stable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamTree {
    entries: BTreeMap<String, NamedTensor>,
}

impl ParamTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, tensor: NamedTensor) {
        self.entries.insert(name.into(), tensor);
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.entries.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut NamedTensor> {
        self.entries.get_mut(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &NamedTensor)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_elements(&self) -> usize {
        self.entries.values().map(|t| t.len()).sum()
    }

    /// A tree of zeros with this tree's exact shape.
    pub fn zeros_like(&self) -> ParamTree {
        ParamTree {
            entries: self
                .entries
                .iter()
                .map(|(name, t)| (name.clone(), t.zeros_like()))
                .collect(),
        }
    }

    pub fn same_shape(&self, other: &ParamTree) -> bool {
        self.entries.len() == other.entries.len()
            && self.entries.iter().all(|(name, t)| {
                other
                    .entries
                    .get(name)
                    .map(|o| t.same_shape(o))
                    .unwrap_or(false)
            })
    }

    /// Elementwise `self += other` across the whole tree.
    pub fn add_assign(&mut self, other: &ParamTree) -> Result<(), TreeError> {
        for (name, tensor) in self.entries.iter_mut() {
            let o = other
                .entries
                .get(name)
                .ok_or_else(|| TreeError::MissingParameter { name: name.clone() })?;
            tensor.add_assign(o).map_err(|source| TreeError::Tensor {
                name: name.clone(),
                source,
            })?;
        }
        if other.entries.len() != self.entries.len() {
            let name = other
                .entries
                .keys()
                .find(|k| !self.entries.contains_key(*k))
                .cloned()
                .unwrap_or_default();
            return Err(TreeError::MissingParameter { name });
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for tensor in self.entries.values_mut() {
            tensor.scale(factor);
        }
    }

    pub fn cast(&self, dtype: DType) -> ParamTree {
        ParamTree {
            entries: self
                .entries
                .iter()
                .map(|(name, t)| (name.clone(), t.cast(dtype)))
                .collect(),
        }
    }

    /// Global L2 norm over all parameters.
    pub fn l2_norm(&self) -> f64 {
        self.entries
            .values()
            .map(|t| t.squared_sum())
            .sum::<f64>()
            .sqrt()
    }
}

impl FromIterator<(String, NamedTensor)> for ParamTree {
    fn from_iter<I: IntoIterator<Item = (String, NamedTensor)>>(iter: I) -> Self {
        ParamTree {
            entries: iter.into_iter().collect(),
        }
    }
}
