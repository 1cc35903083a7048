use serde::{Deserialize, Serialize};

/// Declarative optimizer selection, carried in the trainer config and
/// instantiated by the modeling crate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OptimizerDefinition {
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
    /// No-op update rule, used by tests that only exercise the loop.
    Dummy,
}

impl OptimizerDefinition {
    pub fn clip_grad_norm(&self) -> Option<f32> {
        match *self {
            OptimizerDefinition::AdamW { clip_grad_norm, .. } => clip_grad_norm,
            OptimizerDefinition::Sgd { clip_grad_norm, .. } => clip_grad_norm,
            OptimizerDefinition::Dummy => None,
        }
    }
}

impl Default for OptimizerDefinition {
    fn default() -> Self {
        OptimizerDefinition::AdamW {
            betas: [0.9, 0.95],
            eps: 1e-8,
            weight_decay: 0.1,
            clip_grad_norm: Some(1.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_kebab_case() {
        let def = OptimizerDefinition::Sgd {
            momentum: 0.9,
            weight_decay: 0.0,
            clip_grad_norm: None,
        };
        let json = serde_json::to_string(&def).unwrap();
        assert!(json.contains("sgd"), "{json}");
        let back: OptimizerDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, def);
    }
}
