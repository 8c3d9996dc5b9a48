//! Learning-rate reduction when the validation loss stops improving.

use ssa_core::SsaConfig;

/// Floor below which the learning rate is never reduced.
pub const MIN_LR: f64 = 1e-7;

/// Relative improvement a new value must make to count as better.
const THRESHOLD: f64 = 1e-4;

/// Multiplies the learning rate by `factor` once the monitored value
/// (lower is better) has failed to improve for more than `patience`
/// consecutive observations.
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceLrOnPlateau {
    factor: f64,
    patience: usize,
    min_lr: f64,
    best: f64,
    bad_steps: usize,
}

impl ReduceLrOnPlateau {
    pub fn new(factor: f64, patience: usize) -> Self {
        Self {
            factor,
            patience,
            min_lr: MIN_LR,
            best: f64::INFINITY,
            bad_steps: 0,
        }
    }

    /// The configured scheduler, if any.
    pub fn from_config(config: &SsaConfig) -> Option<Self> {
        config
            .scheduler
            .map(|_| Self::new(config.lr_factor, config.lr_patience))
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    /// Records one observation of the monitored value and returns the new
    /// learning rate when a reduction happens.
    ///
    /// Non-finite values always count as no improvement.
    pub fn observe(&mut self, value: f64, current_lr: f64) -> Option<f64> {
        let improved = value.is_finite()
            && (self.best.is_infinite() || value < self.best - self.best.abs() * THRESHOLD);
        if improved {
            self.best = value;
            self.bad_steps = 0;
            return None;
        }
        self.bad_steps += 1;
        if self.bad_steps <= self.patience {
            return None;
        }
        self.bad_steps = 0;
        let reduced = (current_lr * self.factor).max(self.min_lr);
        if current_lr - reduced > f64::EPSILON * current_lr {
            tracing::info!(from = current_lr, to = reduced, best = self.best, "reducing learning rate");
            Some(reduced)
        } else {
            None
        }
    }
}
