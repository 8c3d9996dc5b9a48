//! One flow per domain, routed by domain label.
//!
//! The training path evaluates *every* flow on the whole batch and then
//! selects each row's output with a one-hot mask:
//!
//! ```text
//! es      [batch, nclass, s_dim] = stack_k flow_k(residuals).y
//! logdets [batch, nclass]        = stack_k flow_k(residuals).log|det J|
//! e       = Σ_k es[:, k, :]  · mask[:, k]
//! logdet  = Σ_k logdets[:, k] · mask[:, k]
//! ```
//!
//! This keeps the computation one batched graph at the cost of `nclass`
//! redundant evaluations. [`FlowBank::forward_gathered`] is the per-row
//! reference with identical results.

use std::path::Path;

use candle_core::{Device, Tensor, Var};
use candle_nn::VarMap;
use rand::Rng;
use ssa_core::{batch::one_hot, SsaError};

use crate::base::BaseDistribution;
use crate::flow::{FlowConfig, NormalizingFlow};

/// Output of routing a batch through the bank.
#[derive(Debug, Clone)]
pub struct Routed {
    /// Transformed style residual `[batch, s_dim]`.
    pub e: Tensor,
    /// Selected `log|det J|` per row `[batch]`.
    pub logdet: Tensor,
}

/// `nclass` independently parameterized flows over the style subspace.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_nn::VarMap;
/// use ssa_core::{FlowOrder, DTYPE};
/// use ssa_flow::{FlowBank, FlowConfig};
///
/// let var_map = VarMap::new();
/// let config = FlowConfig { input_dim: 2, n_layers: 1, bound: 5.0, count_bins: 8, order: FlowOrder::Linear };
/// let bank = FlowBank::new(&var_map, 3, config, &Device::Cpu).unwrap();
///
/// let residuals = Tensor::zeros((4, 2), DTYPE, &Device::Cpu).unwrap();
/// let routed = bank.route(&residuals, &[0, 2, 1, 2]).unwrap();
/// assert_eq!(routed.e.dims(), &[4, 2]);
/// ```
#[derive(Debug)]
pub struct FlowBank {
    flows: Vec<NormalizingFlow>,
    base: BaseDistribution,
    config: FlowConfig,
}

impl FlowBank {
    /// Creates `nclass` flows under the prefixes `flows.0`, `flows.1`, ...
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] if `nclass == 0` or the flow
    /// configuration is invalid.
    pub fn new(
        var_map: &VarMap,
        nclass: usize,
        config: FlowConfig,
        device: &Device,
    ) -> Result<Self, SsaError> {
        if nclass == 0 {
            return Err(SsaError::config("flow bank needs at least one domain"));
        }
        let flows = (0..nclass)
            .map(|k| NormalizingFlow::new(var_map, &format!("flows.{k}"), config, device))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            flows,
            base: BaseDistribution::new(config.input_dim),
            config,
        })
    }

    pub fn nclass(&self) -> usize {
        self.flows.len()
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    pub fn base(&self) -> &BaseDistribution {
        &self.base
    }

    /// The flow of domain `k`.
    pub fn flow(&self, k: usize) -> Option<&NormalizingFlow> {
        self.flows.get(k)
    }

    /// Every flow's variables.
    pub fn vars(&self) -> Vec<Var> {
        self.flows.iter().flat_map(|f| f.vars()).collect()
    }

    /// Loads the same pretrained parameter set into every flow.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Checkpoint`] on the first flow that fails; flows
    /// are validated individually, each load being all-or-nothing.
    pub fn warm_start(&self, path: &Path) -> Result<(), SsaError> {
        for flow in &self.flows {
            flow.load_safetensors(path)?;
        }
        Ok(())
    }

    /// Applies every flow to the full batch.
    ///
    /// Returns `(es [batch, nclass, s_dim], logdets [batch, nclass])`.
    pub fn forward_all(&self, residuals: &Tensor) -> Result<(Tensor, Tensor), SsaError> {
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("FlowBank forward_all: {e}"),
        };
        let mut es = Vec::with_capacity(self.flows.len());
        let mut logdets = Vec::with_capacity(self.flows.len());
        for flow in &self.flows {
            let (e, ld) = flow.forward(residuals)?;
            es.push(e);
            logdets.push(ld);
        }
        let es = Tensor::stack(&es, 1).map_err(map_err)?;
        let logdets = Tensor::stack(&logdets, 1).map_err(map_err)?;
        Ok((es, logdets))
    }

    /// Selects each row's flow output with a one-hot mask `[batch, nclass]`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if the mask does not match the
    /// stacked outputs.
    pub fn select_masked(
        es: &Tensor,
        logdets: &Tensor,
        mask: &Tensor,
    ) -> Result<Routed, SsaError> {
        if mask.dims() != logdets.dims() {
            return Err(SsaError::shape(format!(
                "mask {:?} does not match stacked log-dets {:?}",
                mask.dims(),
                logdets.dims()
            )));
        }
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("FlowBank select_masked: {e}"),
        };
        let e = es
            .broadcast_mul(&mask.unsqueeze(2).map_err(map_err)?)
            .and_then(|t| t.sum(1))
            .map_err(map_err)?;
        let logdet = (logdets * mask).and_then(|t| t.sum(1)).map_err(map_err)?;
        Ok(Routed { e, logdet })
    }

    /// Masked routing of `residuals [batch, s_dim]` by domain `labels`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] for out-of-range labels or a
    /// label count that differs from the batch size.
    pub fn route(&self, residuals: &Tensor, labels: &[u32]) -> Result<Routed, SsaError> {
        self.check_labels(residuals, labels)?;
        let mask = one_hot(labels, self.nclass(), residuals.device())?;
        let (es, logdets) = self.forward_all(residuals)?;
        Self::select_masked(&es, &logdets, &mask)
    }

    /// Per-row reference: each row goes through its own domain's flow only.
    ///
    /// # Errors
    ///
    /// Same as [`FlowBank::route`].
    pub fn forward_gathered(&self, residuals: &Tensor, labels: &[u32]) -> Result<Routed, SsaError> {
        self.check_labels(residuals, labels)?;
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("FlowBank forward_gathered: {e}"),
        };
        let mut es = Vec::with_capacity(labels.len());
        let mut logdets = Vec::with_capacity(labels.len());
        for (row, &label) in labels.iter().enumerate() {
            let flow = self.flows.get(label as usize).ok_or_else(|| {
                SsaError::shape(format!(
                    "domain label {label} at row {row} outside [0, {})",
                    self.nclass()
                ))
            })?;
            let x = residuals.narrow(0, row, 1).map_err(map_err)?;
            let (e, ld) = flow.forward(&x)?;
            es.push(e);
            logdets.push(ld);
        }
        Ok(Routed {
            e: Tensor::cat(&es, 0).map_err(map_err)?,
            logdet: Tensor::cat(&logdets, 0).map_err(map_err)?,
        })
    }

    /// Draws `n` style residuals for `domain` by inverting its flow on base samples.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] for an unknown domain.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        domain: usize,
        n: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor, SsaError> {
        let flow = self.flows.get(domain).ok_or_else(|| {
            SsaError::config(format!("domain {domain} outside [0, {})", self.nclass()))
        })?;
        let e = self.base.sample(n, rng, device)?;
        flow.inverse(&e)
    }

    fn check_labels(&self, residuals: &Tensor, labels: &[u32]) -> Result<(), SsaError> {
        let rows = residuals.dim(0).map_err(|e| SsaError::shape(e.to_string()))?;
        if rows != labels.len() {
            return Err(SsaError::shape(format!(
                "{rows} residual rows but {} labels",
                labels.len()
            )));
        }
        Ok(())
    }
}
