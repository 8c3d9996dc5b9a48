//! Construction-time configuration for an SSA model.
//!
//! Every option is fixed once the model is built. Named options
//! (optimizer, decoder family, spline order, correlation method,
//! scheduler) are parsed eagerly: an unknown name fails while the
//! configuration is read, never later inside a training step.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::SsaError;

/// Declares a string-backed option enum with case-insensitive parsing.
macro_rules! string_option {
    (
        $(#[$meta:meta])*
        $name:ident, $option:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $canon:literal $(| $alias:literal)* ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $name {
            /// Canonical name as written in configuration files.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => $canon ),+
                }
            }
        }

        impl FromStr for $name {
            type Err = SsaError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let lowered = s.trim().to_ascii_lowercase();
                $(
                    if lowered == $canon.to_ascii_lowercase() $(|| lowered == $alias)* {
                        return Ok(Self::$variant);
                    }
                )+
                Err(SsaError::Unsupported {
                    option: $option,
                    value: s.to_string(),
                })
            }
        }

        impl TryFrom<String> for $name {
            type Error = SsaError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                value.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

string_option! {
    /// Likelihood family of the decoder, used by the reconstruction term.
    DecoderDist, "decoder distribution" {
        /// Squared error against the raw reconstruction.
        Gaussian => "gaussian",
        /// Binary cross-entropy on raw logits.
        Bernoulli => "bernoulli",
        /// Sigmoid squashing followed by squared error.
        SigmoidGaussian => "sigmoid_gaussian",
    }
}

string_option! {
    /// Correlation used when matching recovered and true style factors.
    CorrelationMethod, "correlation method" {
        Pearson => "Pearson",
        Spearman => "Spearman",
    }
}

string_option! {
    /// Spline family of each flow layer.
    FlowOrder, "spline order" {
        /// Monotonic rational-linear spline.
        Linear => "linear",
        /// Monotonic rational-quadratic spline.
        Quadratic => "quadratic",
    }
}

string_option! {
    /// Optimizer built by the model for its parameters.
    OptimizerKind, "optimizer" {
        /// AdamW with betas (0.9, 0.999) and weight decay 1e-4.
        Adam => "adam" | "adamw",
        RmsProp => "rmsprop",
    }
}

string_option! {
    /// Learning-rate schedule driven by the validation loss.
    SchedulerKind, "scheduler" {
        /// Multiply the rate by `lr_factor` after `lr_patience` stale evaluations.
        ReduceOnPlateau => "plateau" | "reduce_on_plateau" | "reducelronplateau",
    }
}

/// Regression model used to score the content block.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum R2Estimator {
    /// Ordinary least squares with intercept.
    Linear,
    /// Kernel ridge regression with an RBF kernel.
    ///
    /// `gamma = None` uses `1 / n_features`.
    KernelRidge { alpha: f64, gamma: Option<f64> },
}

/// R² scoring options.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct R2Config {
    /// Regression model.
    pub estimator: R2Estimator,
    /// Hold out every n-th row for scoring; `None` scores in-sample.
    pub holdout_every: Option<usize>,
}

impl Default for R2Config {
    fn default() -> Self {
        Self {
            estimator: R2Estimator::KernelRidge {
                alpha: 1.0,
                gamma: None,
            },
            holdout_every: Some(5),
        }
    }
}

/// Configuration for an SSA model.
///
/// # Example
///
/// ```
/// use ssa_core::{SsaConfig, OptimizerKind};
///
/// let config: SsaConfig = serde_json::from_str(
///     r#"{ "input_dim": 6, "c_dim": 2, "s_dim": 2, "nclass": 3, "optimizer": "RMSprop" }"#,
/// ).unwrap();
/// assert_eq!(config.optimizer, OptimizerKind::RmsProp);
/// assert_eq!(config.z_dim(), 4);
/// config.validate().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SsaConfig {
    /// Observed feature dimension.
    pub input_dim: usize,
    /// Content (stationary) latent dimensions.
    pub c_dim: usize,
    /// Style (domain-conditional) latent dimensions.
    pub s_dim: usize,
    /// Number of domains, one flow each.
    pub nclass: usize,

    /// Spline layers per flow.
    pub n_flow_layers: usize,
    /// Spline support is `[-bound, bound]`; identity outside.
    pub bound: f64,
    /// Spline bins per layer.
    pub count_bins: usize,
    /// Spline family.
    pub order: FlowOrder,

    /// Domain embedding width concatenated to the input; 0 disables it.
    pub embedding_dim: usize,
    /// Encoder/decoder hidden width.
    pub hidden_dim: usize,
    /// LeakyReLU negative slope inside the VAE.
    pub vae_slope: f64,
    pub encoder_n_layers: usize,
    pub decoder_n_layers: usize,
    /// Decoder likelihood family.
    pub decoder_dist: DecoderDist,

    /// Weight of the content KLD.
    pub beta: f64,
    /// Weight of the style KLD.
    pub gamma: f64,
    /// Weight of the independence penalty. Accepted for compatibility; no
    /// term currently uses it.
    pub sigma: f64,

    pub optimizer: OptimizerKind,
    pub lr: f64,
    pub scheduler: Option<SchedulerKind>,
    pub lr_factor: f64,
    pub lr_patience: usize,

    /// Initialize every flow from `spline_pth`.
    pub use_warm_start: bool,
    pub spline_pth: Option<PathBuf>,

    /// Correlation used by MCC.
    pub correlation: CorrelationMethod,
    /// When true, R² regresses ground truth on recovered means; otherwise
    /// the recovered means are regressed on ground truth.
    pub hz_to_z: bool,
    pub r2: R2Config,
}

impl Default for SsaConfig {
    fn default() -> Self {
        Self {
            input_dim: 4,
            c_dim: 2,
            s_dim: 2,
            nclass: 5,
            n_flow_layers: 1,
            bound: 5.0,
            count_bins: 8,
            order: FlowOrder::Linear,
            embedding_dim: 0,
            hidden_dim: 128,
            vae_slope: 0.2,
            encoder_n_layers: 3,
            decoder_n_layers: 1,
            decoder_dist: DecoderDist::Gaussian,
            beta: 0.0025,
            gamma: 0.001,
            sigma: 1e-6,
            optimizer: OptimizerKind::Adam,
            lr: 1e-4,
            scheduler: None,
            lr_factor: 0.5,
            lr_patience: 10,
            use_warm_start: false,
            spline_pth: None,
            correlation: CorrelationMethod::Pearson,
            hz_to_z: true,
            r2: R2Config::default(),
        }
    }
}

impl SsaConfig {
    /// Total latent dimension `c_dim + s_dim`.
    pub fn z_dim(&self) -> usize {
        self.c_dim + self.s_dim
    }

    /// Checks ranges and cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SsaError> {
        let positive = [
            ("input_dim", self.input_dim),
            ("c_dim", self.c_dim),
            ("s_dim", self.s_dim),
            ("nclass", self.nclass),
            ("n_flow_layers", self.n_flow_layers),
            ("hidden_dim", self.hidden_dim),
            ("encoder_n_layers", self.encoder_n_layers),
            ("decoder_n_layers", self.decoder_n_layers),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(SsaError::config(format!("{name} must be > 0")));
            }
        }
        if self.count_bins < 2 {
            return Err(SsaError::config(format!(
                "count_bins must be >= 2, got {}",
                self.count_bins
            )));
        }
        if !self.bound.is_finite() || self.bound <= 0.0 {
            return Err(SsaError::config(format!(
                "bound must be finite and > 0, got {}",
                self.bound
            )));
        }
        for (name, value) in [("beta", self.beta), ("gamma", self.gamma), ("sigma", self.sigma)] {
            if !value.is_finite() || value < 0.0 {
                return Err(SsaError::config(format!(
                    "{name} must be finite and >= 0, got {value}"
                )));
            }
        }
        if !self.lr.is_finite() || self.lr <= 0.0 {
            return Err(SsaError::config(format!("lr must be > 0, got {}", self.lr)));
        }
        if !(0.0..1.0).contains(&self.vae_slope) {
            return Err(SsaError::config(format!(
                "vae_slope must be in [0, 1), got {}",
                self.vae_slope
            )));
        }
        if self.scheduler.is_some() && !(self.lr_factor > 0.0 && self.lr_factor < 1.0) {
            return Err(SsaError::config(format!(
                "lr_factor must be in (0, 1), got {}",
                self.lr_factor
            )));
        }
        if self.use_warm_start && self.spline_pth.is_none() {
            return Err(SsaError::config("use_warm_start requires spline_pth"));
        }
        match self.r2.estimator {
            R2Estimator::Linear => {}
            R2Estimator::KernelRidge { alpha, gamma } => {
                if !alpha.is_finite() || alpha <= 0.0 {
                    return Err(SsaError::config(format!(
                        "kernel ridge alpha must be > 0, got {alpha}"
                    )));
                }
                if let Some(g) = gamma {
                    if !g.is_finite() || g <= 0.0 {
                        return Err(SsaError::config(format!(
                            "kernel ridge gamma must be > 0, got {g}"
                        )));
                    }
                }
            }
        }
        if self.r2.holdout_every == Some(0) || self.r2.holdout_every == Some(1) {
            return Err(SsaError::config("r2.holdout_every must be >= 2"));
        }
        Ok(())
    }

    /// Parses and validates a configuration from JSON text.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Storage`] for malformed JSON,
    /// [`SsaError::Unsupported`] for unknown option names and
    /// [`SsaError::InvalidConfig`] for out-of-range values.
    pub fn from_json_str(text: &str) -> Result<Self, SsaError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| SsaError::Storage {
            message: format!("parse SSA config: {e}"),
        })?;
        Self::from_json_value(value)
    }

    /// Validates an already parsed JSON object; see [`SsaConfig::from_json_str`].
    pub fn from_json_value(value: serde_json::Value) -> Result<Self, SsaError> {
        Self::check_option_names(&value)?;
        let config: Self = serde_json::from_value(value).map_err(|e| SsaError::Storage {
            message: format!("parse SSA config: {e}"),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Resolves every string-valued option in a JSON object so an unknown
    /// name surfaces as [`SsaError::Unsupported`] naming its option.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Unsupported`] for the first unknown name.
    pub fn check_option_names(value: &serde_json::Value) -> Result<(), SsaError> {
        let name = |key: &str| value.get(key).and_then(serde_json::Value::as_str);
        if let Some(v) = name("optimizer") {
            v.parse::<OptimizerKind>()?;
        }
        if let Some(v) = name("decoder_dist") {
            v.parse::<DecoderDist>()?;
        }
        if let Some(v) = name("order") {
            v.parse::<FlowOrder>()?;
        }
        if let Some(v) = name("correlation") {
            v.parse::<CorrelationMethod>()?;
        }
        if let Some(v) = name("scheduler") {
            v.parse::<SchedulerKind>()?;
        }
        Ok(())
    }

    /// Reads, parses and validates a JSON configuration file.
    ///
    /// # Errors
    ///
    /// See [`SsaConfig::from_json_str`]; unreadable files also map to
    /// [`SsaError::Storage`].
    pub fn from_json_file(path: &Path) -> Result<Self, SsaError> {
        let text = std::fs::read_to_string(path).map_err(|e| SsaError::Storage {
            message: format!("read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SsaConfig::default();
        config.validate().unwrap();
        assert_eq!(config.z_dim(), 4);
        assert_eq!(config.beta, 0.0025);
        assert_eq!(config.gamma, 0.001);
        assert!(config.hz_to_z);
    }

    #[test]
    fn optimizer_names_parse_case_insensitively() {
        assert_eq!("Adam".parse::<OptimizerKind>().unwrap(), OptimizerKind::Adam);
        assert_eq!("RMSprop".parse::<OptimizerKind>().unwrap(), OptimizerKind::RmsProp);
    }

    #[test]
    fn unknown_optimizer_fails_at_parse_time() {
        let err = SsaConfig::from_json_str(r#"{ "optimizer": "sgd" }"#).unwrap_err();
        assert!(err.to_string().contains("sgd"), "{err}");
        assert!(
            matches!(&err, SsaError::Unsupported { option: "optimizer", value } if value == "sgd"),
            "{err:?}"
        );

        let err = "sgd".parse::<OptimizerKind>().unwrap_err();
        assert!(matches!(err, SsaError::Unsupported { option: "optimizer", .. }));
    }

    #[test]
    fn unknown_decoder_family_is_rejected() {
        assert!(matches!(
            SsaConfig::from_json_str(r#"{ "decoder_dist": "poisson" }"#),
            Err(SsaError::Unsupported { option: "decoder distribution", .. })
        ));
        assert!(matches!(
            SsaConfig::from_json_str(r#"{ "correlation": "Kendall" }"#),
            Err(SsaError::Unsupported { option: "correlation method", .. })
        ));
        assert!(matches!(
            SsaConfig::from_json_str(r#"{ "order": "cubic" }"#),
            Err(SsaError::Unsupported { option: "spline order", .. })
        ));
        assert!(matches!(
            SsaConfig::from_json_str(r#"{ "scheduler": "cosine" }"#),
            Err(SsaError::Unsupported { option: "scheduler", .. })
        ));
        assert!(matches!(
            "poisson".parse::<DecoderDist>(),
            Err(SsaError::Unsupported { .. })
        ));
    }

    #[test]
    fn option_names_round_trip_through_json() {
        let config = SsaConfig {
            decoder_dist: DecoderDist::SigmoidGaussian,
            correlation: CorrelationMethod::Spearman,
            order: FlowOrder::Quadratic,
            scheduler: Some(SchedulerKind::ReduceOnPlateau),
            ..SsaConfig::default()
        };
        let text = serde_json::to_string(&config).unwrap();
        assert!(text.contains("\"sigmoid_gaussian\""));
        assert!(text.contains("\"Spearman\""));
        let back = SsaConfig::from_json_str(&text).unwrap();
        assert_eq!(back.decoder_dist, DecoderDist::SigmoidGaussian);
        assert_eq!(back.order, FlowOrder::Quadratic);
        assert_eq!(back.scheduler, Some(SchedulerKind::ReduceOnPlateau));
    }

    #[test]
    fn zero_dimensions_rejected() {
        let config = SsaConfig {
            s_dim: 0,
            ..SsaConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s_dim"));
    }

    #[test]
    fn warm_start_without_path_rejected() {
        let config = SsaConfig {
            use_warm_start: true,
            ..SsaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn negative_loss_weight_rejected() {
        let config = SsaConfig {
            gamma: -0.1,
            ..SsaConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn r2_estimator_parses_tagged() {
        let config = SsaConfig::from_json_str(
            r#"{ "r2": { "estimator": { "kind": "linear" }, "holdout_every": null } }"#,
        )
        .unwrap();
        assert_eq!(config.r2.estimator, R2Estimator::Linear);
        assert_eq!(config.r2.holdout_every, None);
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ssa.json");
        std::fs::write(&path, r#"{ "input_dim": 10, "nclass": 3 }"#).unwrap();
        let config = SsaConfig::from_json_file(&path).unwrap();
        assert_eq!(config.input_dim, 10);
        assert_eq!(config.nclass, 3);
        assert!(SsaConfig::from_json_file(&dir.path().join("missing.json")).is_err());
    }

    #[test]
    fn malformed_json_is_a_storage_error() {
        assert!(matches!(
            SsaConfig::from_json_str("{ \"optimizer\": "),
            Err(SsaError::Storage { .. })
        ));
        assert!(matches!(
            SsaConfig::from_json_str(r#"{ "optimizer": 3 }"#),
            Err(SsaError::Storage { .. })
        ));
    }
}
