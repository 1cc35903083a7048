use tessera_core::{DType, LogicalAxis};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("duplicate axis name {name:?} in shape declaration")]
    DuplicateAxis { name: String },

    #[error("shape {axes:?} implies {expected} elements, got {got}")]
    DataLengthMismatch {
        axes: Vec<String>,
        expected: usize,
        got: usize,
    },

    #[error("shape mismatch between {left} and {right}")]
    ShapeMismatch { left: String, right: String },
}

/// A host tensor with named logical axes. Values are held as f32 but
/// every element is kept representable in `dtype`: writes and casts
/// round through the storage dtype, so bf16/f16 precision effects are
/// observable without a separate storage path.
#[derive(Debug, Clone, PartialEq)]
pub struct NamedTensor {
    axes: Vec<LogicalAxis>,
    dtype: DType,
    data: Vec<f32>,
}

impl NamedTensor {
    pub fn new(axes: Vec<LogicalAxis>, dtype: DType, data: Vec<f32>) -> Result<Self, TensorError> {
        for (i, axis) in axes.iter().enumerate() {
            if axes[..i].iter().any(|a| a.name == axis.name) {
                return Err(TensorError::DuplicateAxis {
                    name: axis.name.clone(),
                });
            }
        }
        let expected: usize = axes.iter().map(|a| a.size).product();
        if data.len() != expected {
            return Err(TensorError::DataLengthMismatch {
                axes: axes.iter().map(|a| a.name.clone()).collect(),
                expected,
                got: data.len(),
            });
        }
        let data = data.into_iter().map(|v| dtype.quantize(v)).collect();
        Ok(Self { axes, dtype, data })
    }

    pub fn zeros(axes: Vec<LogicalAxis>, dtype: DType) -> Self {
        let len = axes.iter().map(|a| a.size).product();
        Self {
            axes,
            dtype,
            data: vec![0.0; len],
        }
    }

    pub fn zeros_like(&self) -> Self {
        Self {
            axes: self.axes.clone(),
            dtype: self.dtype,
            data: vec![0.0; self.data.len()],
        }
    }

    pub fn axes(&self) -> &[LogicalAxis] {
        &self.axes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn shape_desc(&self) -> String {
        let parts: Vec<String> = self.axes.iter().map(|a| a.to_string()).collect();
        format!("({})", parts.join(", "))
    }

    pub fn same_shape(&self, other: &NamedTensor) -> bool {
        self.axes == other.axes
    }

    fn check_same_shape(&self, other: &NamedTensor) -> Result<(), TensorError> {
        if !self.same_shape(other) {
            return Err(TensorError::ShapeMismatch {
                left: self.shape_desc(),
                right: other.shape_desc(),
            });
        }
        Ok(())
    }

    /// Elementwise `self += other`, quantizing through the storage dtype.
    pub fn add_assign(&mut self, other: &NamedTensor) -> Result<(), TensorError> {
        self.check_same_shape(other)?;
        for (a, b) in self.data.iter_mut().zip(&other.data) {
            *a = self.dtype.quantize(*a + b);
        }
        Ok(())
    }

    pub fn scale(&mut self, factor: f32) {
        for v in self.data.iter_mut() {
            *v = self.dtype.quantize(*v * factor);
        }
    }

    /// Re-quantize into `dtype`; a no-op when already there.
    pub fn cast(&self, dtype: DType) -> NamedTensor {
        if dtype == self.dtype {
            return self.clone();
        }
        NamedTensor {
            axes: self.axes.clone(),
            dtype,
            data: self.data.iter().map(|v| dtype.quantize(*v)).collect(),
        }
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> NamedTensor {
        NamedTensor {
            axes: self.axes.clone(),
            dtype: self.dtype,
            data: self.data.iter().map(|v| self.dtype.quantize(f(*v))).collect(),
        }
    }

    pub fn set(&mut self, index: usize, value: f32) {
        self.data[index] = self.dtype.quantize(value);
    }

    pub fn squared_sum(&self) -> f64 {
        self.data.iter().map(|v| (*v as f64) * (*v as f64)).sum()
    }
}
