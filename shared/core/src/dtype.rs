use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage dtype for parameters, activations and losses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DType {
    F32,
    Bf16,
    F16,
}

impl DType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Bf16 | DType::F16 => 2,
        }
    }

    /// Round-trip a value through this dtype's representation.
    pub fn quantize(&self, value: f32) -> f32 {
        match self {
            DType::F32 => value,
            DType::Bf16 => bf16::from_f32(value).to_f32(),
            DType::F16 => f16::from_f32(value).to_f32(),
        }
    }

    /// Largest finite magnitude representable in this dtype.
    pub fn max_finite(&self) -> f64 {
        match self {
            DType::F32 => f32::MAX as f64,
            DType::Bf16 => bf16::MAX.to_f64(),
            DType::F16 => f16::MAX.to_f64(),
        }
    }
}

#[derive(Debug, Error)]
pub enum PrecisionPolicyError {
    #[error(
        "parameter dtype {param:?} has smaller range than compute dtype {compute:?}; \
         casting compute values to parameters could overflow"
    )]
    ParameterRangeTooSmall { param: DType, compute: DType },
}

/// The three semantic dtypes of mixed-precision training: `compute` for
/// forward/backward math, `parameter` for stored weights and optimizer
/// state, `output` for loss reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrecisionPolicy {
    pub compute: DType,
    pub parameter: DType,
    pub output: DType,
}

impl PrecisionPolicy {
    pub fn new(
        compute: DType,
        parameter: DType,
        output: DType,
    ) -> Result<Self, PrecisionPolicyError> {
        if parameter.max_finite() < compute.max_finite() {
            return Err(PrecisionPolicyError::ParameterRangeTooSmall { param: parameter, compute });
        }
        Ok(Self {
            compute,
            parameter,
            output,
        })
    }

    /// Full f32 everywhere; the no-op policy.
    pub fn full_precision() -> Self {
        Self {
            compute: DType::F32,
            parameter: DType::F32,
            output: DType::F32,
        }
    }

    /// The usual LLM pretraining triple: bf16 math, f32 weights and loss.
    pub fn mixed_bf16() -> Self {
        Self {
            compute: DType::Bf16,
            parameter: DType::F32,
            output: DType::F32,
        }
    }

    pub fn cast_to_compute(&self, value: f32) -> f32 {
        self.compute.quantize(value)
    }

    pub fn cast_to_param(&self, value: f32) -> f32 {
        self.parameter.quantize(value)
    }

    pub fn cast_to_output(&self, value: f32) -> f32 {
        self.output.quantize(value)
    }
}

impl Default for PrecisionPolicy {
    fn default() -> Self {
        Self::full_precision()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn casts_are_idempotent() {
        let mp = PrecisionPolicy::mixed_bf16();
        for v in [0.0f32, 1.0, -3.33333, 1234.5678, 1e-8] {
            let once = mp.cast_to_compute(v);
            assert_eq!(once, mp.cast_to_compute(once));
            let once = mp.cast_to_output(v);
            assert_eq!(once, mp.cast_to_output(once));
        }
    }

    #[test]
    fn rejects_narrow_parameter_dtype() {
        assert!(PrecisionPolicy::new(DType::F32, DType::F16, DType::F32).is_err());
        assert!(PrecisionPolicy::new(DType::Bf16, DType::F32, DType::F32).is_ok());
        // bf16 has f32-like range, so bf16 params with f16 compute is fine
        assert!(PrecisionPolicy::new(DType::F16, DType::Bf16, DType::F32).is_ok());
    }

    #[test]
    fn bf16_quantization_truncates_mantissa() {
        let x = DType::Bf16.quantize(1.0 + 1e-4);
        assert!((x - 1.0).abs() < 1e-2);
        assert_ne!(x, 1.0 + 1e-4);
    }
}
