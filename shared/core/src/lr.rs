use serde::{Deserialize, Serialize};

/// Learning rate as a function of the step index.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LearningRateSchedule {
    Constant {
        lr: f64,
    },
    /// Linear warmup followed by cosine decay to `final_lr`.
    Cosine {
        base_lr: f64,
        final_lr: f64,
        warmup_steps: u64,
        total_steps: u64,
    },
}

impl LearningRateSchedule {
    pub fn get_lr(&self, step: u64) -> f64 {
        match *self {
            LearningRateSchedule::Constant { lr } => lr,
            LearningRateSchedule::Cosine {
                base_lr,
                final_lr,
                warmup_steps,
                total_steps,
            } => {
                if warmup_steps > 0 && step < warmup_steps {
                    return base_lr * (step + 1) as f64 / warmup_steps as f64;
                }
                let decay_steps = total_steps.saturating_sub(warmup_steps).max(1);
                let progress =
                    (step.saturating_sub(warmup_steps)).min(decay_steps) as f64 / decay_steps as f64;
                let cosine = 0.5 * (1.0 + (std::f64::consts::PI * progress).cos());
                final_lr + (base_lr - final_lr) * cosine
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_warms_up_then_decays() {
        let sched = LearningRateSchedule::Cosine {
            base_lr: 1.0,
            final_lr: 0.1,
            warmup_steps: 10,
            total_steps: 110,
        };
        assert!(sched.get_lr(0) < sched.get_lr(9));
        assert!((sched.get_lr(10) - 1.0).abs() < 1e-9);
        assert!(sched.get_lr(60) < 1.0);
        assert!((sched.get_lr(110) - 0.1).abs() < 1e-9);
        // never decays below the floor
        assert!(sched.get_lr(10_000) >= 0.1 - 1e-9);
    }

    #[test]
    fn constant_is_constant() {
        let sched = LearningRateSchedule::Constant { lr: 3e-4 };
        assert_eq!(sched.get_lr(0), sched.get_lr(999));
    }
}
