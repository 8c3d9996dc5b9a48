//! Optimizers selectable from the configuration.

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use ssa_core::{OptimizerKind, SsaError};

/// Hyperparameters of [`RmsProp`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsRmsProp {
    pub lr: f64,
    /// Smoothing constant of the squared-gradient average.
    pub alpha: f64,
    pub eps: f64,
}

impl Default for ParamsRmsProp {
    fn default() -> Self {
        Self {
            lr: 1e-2,
            alpha: 0.99,
            eps: 1e-8,
        }
    }
}

#[derive(Debug)]
struct VarRmsProp {
    var: Var,
    square_avg: Var,
}

/// RMSprop without momentum or weight decay:
///
/// ```text
/// v ← α·v + (1−α)·g²
/// θ ← θ − lr · g / (√v + ε)
/// ```
#[derive(Debug)]
pub struct RmsProp {
    vars: Vec<VarRmsProp>,
    params: ParamsRmsProp,
}

impl Optimizer for RmsProp {
    type Config = ParamsRmsProp;

    fn new(vars: Vec<Var>, params: ParamsRmsProp) -> candle_core::Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|var| var.dtype().is_float())
            .map(|var| {
                let square_avg = Var::zeros(var.shape(), var.dtype(), var.device())?;
                Ok(VarRmsProp { var, square_avg })
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, params })
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsRmsProp { lr, alpha, eps } = self.params;
        for v in &self.vars {
            let Some(g) = grads.get(v.var.as_tensor()) else {
                continue;
            };
            let square_avg = ((v.square_avg.as_tensor() * alpha)? + (g.sqr()? * (1.0 - alpha))?)?;
            let denom = (square_avg.sqrt()? + eps)?;
            let update = ((g / denom)? * lr)?;
            v.var.set(&v.var.as_tensor().sub(&update)?)?;
            v.square_avg.set(&square_avg)?;
        }
        Ok(())
    }
}

/// The optimizer chosen by [`OptimizerKind`].
#[derive(Debug)]
pub enum SsaOptimizer {
    /// AdamW with betas `(0.9, 0.999)` and weight decay `1e-4`.
    Adam(AdamW),
    RmsProp(RmsProp),
}

/// Weight decay applied by the `adam` choice.
pub const ADAM_WEIGHT_DECAY: f64 = 1e-4;

impl SsaOptimizer {
    /// Builds the optimizer over `vars`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Internal`] if optimizer state cannot be allocated.
    pub fn new(kind: OptimizerKind, vars: Vec<Var>, lr: f64) -> Result<Self, SsaError> {
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("SsaOptimizer new ({kind}): {e}"),
        };
        match kind {
            OptimizerKind::Adam => AdamW::new(
                vars,
                ParamsAdamW {
                    lr,
                    beta1: 0.9,
                    beta2: 0.999,
                    weight_decay: ADAM_WEIGHT_DECAY,
                    ..Default::default()
                },
            )
            .map(Self::Adam)
            .map_err(map_err),
            OptimizerKind::RmsProp => RmsProp::new(
                vars,
                ParamsRmsProp {
                    lr,
                    ..Default::default()
                },
            )
            .map(Self::RmsProp)
            .map_err(map_err),
        }
    }

    /// Backpropagates `loss` and applies one update.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Internal`] if backpropagation fails.
    pub fn backward_step(&mut self, loss: &Tensor) -> Result<(), SsaError> {
        let result = match self {
            Self::Adam(opt) => opt.backward_step(loss),
            Self::RmsProp(opt) => opt.backward_step(loss),
        };
        result.map_err(|e| SsaError::Internal {
            message: format!("optimizer step: {e}"),
        })
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::RmsProp(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::RmsProp(opt) => opt.set_learning_rate(lr),
        }
    }
}
