//! A stack of spline layers acting on the style subspace.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use ssa_core::{FlowOrder, SsaConfig, SsaError, DTYPE};

use crate::spline::{RationalSpline, SplineShape};

/// Hyperparameters of one normalizing flow.
///
/// # Example
///
/// ```
/// use ssa_core::SsaConfig;
/// use ssa_flow::FlowConfig;
///
/// let config = FlowConfig::from_ssa(&SsaConfig::default());
/// assert_eq!(config.count_bins, 8);
/// assert_eq!(config.bound, 5.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowConfig {
    /// Dimension of the transformed variable (the style block).
    pub input_dim: usize,
    pub n_layers: usize,
    pub bound: f64,
    pub count_bins: usize,
    pub order: FlowOrder,
}

impl FlowConfig {
    /// Flow hyperparameters implied by a model configuration.
    pub fn from_ssa(config: &SsaConfig) -> Self {
        Self {
            input_dim: config.s_dim,
            n_layers: config.n_flow_layers,
            bound: config.bound,
            count_bins: config.count_bins,
            order: config.order,
        }
    }

    fn layer_shape(&self) -> SplineShape {
        SplineShape {
            dim: self.input_dim,
            count_bins: self.count_bins,
            bound: self.bound,
            order: self.order,
        }
    }

    /// Local parameter names (`layer_{l}.{tensor}`) and shapes.
    pub fn parameter_shapes(&self) -> Vec<(String, (usize, usize))> {
        let shape = self.layer_shape();
        (0..self.n_layers)
            .flat_map(|l| {
                shape
                    .parameters()
                    .into_iter()
                    .map(move |(name, dims)| (format!("layer_{l}.{name}"), dims))
            })
            .collect()
    }
}

/// An invertible map `x -> y` with tractable `log|det J|`.
///
/// Parameters live in the caller's [`VarMap`] under `prefix`, so they are
/// trained together with everything else in that map.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use candle_nn::VarMap;
/// use ssa_core::{FlowOrder, DTYPE};
/// use ssa_flow::{FlowConfig, NormalizingFlow};
///
/// let var_map = VarMap::new();
/// let config = FlowConfig { input_dim: 2, n_layers: 2, bound: 5.0, count_bins: 8, order: FlowOrder::Linear };
/// let flow = NormalizingFlow::new(&var_map, "flow", config, &Device::Cpu).unwrap();
///
/// let x = Tensor::zeros((4, 2), DTYPE, &Device::Cpu).unwrap();
/// let (y, logdet) = flow.forward(&x).unwrap();
/// assert_eq!(y.dims(), &[4, 2]);
/// assert_eq!(logdet.dims(), &[4]);
/// ```
pub struct NormalizingFlow {
    layers: Vec<RationalSpline>,
    vars: Vec<(String, Var)>,
    config: FlowConfig,
    prefix: String,
}

impl std::fmt::Debug for NormalizingFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "NormalizingFlow({}: {}×{:?} spline, dim={}, bins={}, bound={})",
            self.prefix,
            self.config.n_layers,
            self.config.order,
            self.config.input_dim,
            self.config.count_bins,
            self.config.bound
        )
    }
}

impl NormalizingFlow {
    /// Creates a trainable flow whose variables are registered in `var_map`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] for zero layers, dims or fewer
    /// than two bins, and [`SsaError::Internal`] if variable creation fails.
    pub fn new(
        var_map: &VarMap,
        prefix: &str,
        config: FlowConfig,
        device: &Device,
    ) -> Result<Self, SsaError> {
        if config.n_layers == 0 || config.input_dim == 0 || config.count_bins < 2 {
            return Err(SsaError::config(format!(
                "flow needs layers, dims and >= 2 bins, got {config:?}"
            )));
        }
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("NormalizingFlow new ({prefix}): {e}"),
        };

        let vb = VarBuilder::from_varmap(var_map, DTYPE, device).pp(prefix);
        let layers = (0..config.n_layers)
            .map(|l| RationalSpline::new(vb.pp(format!("layer_{l}")), config.layer_shape()))
            .collect::<candle_core::Result<Vec<_>>>()
            .map_err(map_err)?;

        let data = var_map.data().lock().map_err(|e| SsaError::Internal {
            message: format!("NormalizingFlow new ({prefix}): var map poisoned: {e}"),
        })?;
        let vars = config
            .parameter_shapes()
            .into_iter()
            .map(|(local, _)| {
                let full = format!("{prefix}.{local}");
                data.get(&full)
                    .cloned()
                    .map(|var| (local, var))
                    .ok_or_else(|| SsaError::Internal {
                        message: format!("variable {full} missing after creation"),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            layers,
            vars,
            config,
            prefix: prefix.to_string(),
        })
    }

    pub fn config(&self) -> &FlowConfig {
        &self.config
    }

    /// Trainable variables of this flow, in layer order.
    pub fn vars(&self) -> Vec<Var> {
        self.vars.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Maps `x [batch, dim]` to `(y [batch, dim], log|det J| [batch])`.
    ///
    /// The log-determinant sums every layer's element-wise term over dims.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if `x` is not `[batch, input_dim]`.
    pub fn forward(&self, x: &Tensor) -> Result<(Tensor, Tensor), SsaError> {
        self.check_input(x)?;
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("NormalizingFlow forward ({}): {e}", self.prefix),
        };

        let mut y = x.clone();
        let mut logdet = Tensor::zeros(x.dim(0).map_err(map_err)?, x.dtype(), x.device())
            .map_err(map_err)?;
        for layer in &self.layers {
            let (next, ld) = layer.forward(&y).map_err(map_err)?;
            logdet = (logdet + ld.sum(1).map_err(map_err)?).map_err(map_err)?;
            y = next;
        }
        Ok((y, logdet))
    }

    /// Recovers the pre-image of `y [batch, dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if `y` is not `[batch, input_dim]`.
    pub fn inverse(&self, y: &Tensor) -> Result<Tensor, SsaError> {
        self.check_input(y)?;
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("NormalizingFlow inverse ({}): {e}", self.prefix),
        };

        let mut x = y.clone();
        for layer in self.layers.iter().rev() {
            x = layer.inverse(&x).map_err(map_err)?;
        }
        Ok(x)
    }

    /// Writes this flow's parameters to a safetensors file keyed by
    /// local name (`layer_{l}.{tensor}`).
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Checkpoint`] if writing fails.
    pub fn save_safetensors(&self, path: &Path) -> Result<(), SsaError> {
        let tensors: HashMap<String, Tensor> = self
            .vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path).map_err(|e| SsaError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("save flow: {e}"),
        })
    }

    /// Initializes every parameter from a safetensors file.
    ///
    /// All-or-nothing: every expected key must be present with exactly the
    /// expected shape and no extra keys may appear. Nothing is written
    /// unless the whole file validates.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Checkpoint`] describing the first mismatch.
    pub fn load_safetensors(&self, path: &Path) -> Result<(), SsaError> {
        let checkpoint_err = |message: String| SsaError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };

        let device = self
            .vars
            .first()
            .map(|(_, v)| v.device().clone())
            .unwrap_or(Device::Cpu);
        let mut tensors = candle_core::safetensors::load(path, &device)
            .map_err(|e| checkpoint_err(format!("read: {e}")))?;

        let mut staged = Vec::with_capacity(self.vars.len());
        for (name, var) in &self.vars {
            let tensor = tensors
                .remove(name)
                .ok_or_else(|| checkpoint_err(format!("missing parameter {name}")))?;
            if tensor.dims() != var.dims() {
                return Err(checkpoint_err(format!(
                    "parameter {name}: expected shape {:?}, found {:?}",
                    var.dims(),
                    tensor.dims()
                )));
            }
            let tensor = tensor
                .to_dtype(DTYPE)
                .map_err(|e| checkpoint_err(format!("parameter {name}: {e}")))?;
            staged.push((var, tensor));
        }
        if !tensors.is_empty() {
            let mut extra: Vec<_> = tensors.keys().cloned().collect();
            extra.sort();
            return Err(checkpoint_err(format!("unexpected parameters {extra:?}")));
        }

        for (var, tensor) in staged {
            var.set(&tensor)
                .map_err(|e| checkpoint_err(format!("apply: {e}")))?;
        }
        tracing::info!(flow = %self.prefix, path = %path.display(), "loaded pretrained spline flow");
        Ok(())
    }

    fn check_input(&self, x: &Tensor) -> Result<(), SsaError> {
        match x.dims() {
            [_, d] if *d == self.config.input_dim => Ok(()),
            dims => Err(SsaError::shape(format!(
                "flow {} expects [batch, {}], got {dims:?}",
                self.prefix, self.config.input_dim
            ))),
        }
    }
}
