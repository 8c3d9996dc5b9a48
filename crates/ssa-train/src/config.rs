//! Top-level run file: model, driver and synthetic-data sections.

use std::path::Path;

use serde::{Deserialize, Serialize};
use ssa_core::{SsaConfig, SsaError};

use crate::synthetic::SyntheticConfig;
use crate::trainer::TrainConfig;

/// Everything one `ssa-train` invocation reads from its config file.
///
/// Every section and field is optional.
///
/// ```
/// use ssa_train::RunConfig;
///
/// let run = RunConfig::from_json_str(r#"{ "train": { "num_steps": 5 } }"#).unwrap();
/// assert_eq!(run.train.num_steps, 5);
/// assert_eq!(run.model.c_dim, 2);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    pub model: SsaConfig,
    pub train: TrainConfig,
    pub synthetic: SyntheticConfig,
}

impl RunConfig {
    /// # Errors
    ///
    /// Returns [`SsaError::Storage`] for malformed JSON,
    /// [`SsaError::Unsupported`] for an unknown option name in the model
    /// section and [`SsaError::InvalidConfig`] if the model section fails
    /// validation.
    pub fn from_json_str(text: &str) -> Result<Self, SsaError> {
        let value: serde_json::Value = serde_json::from_str(text).map_err(|e| SsaError::Storage {
            message: format!("run config: {e}"),
        })?;
        if let Some(model) = value.get("model") {
            SsaConfig::check_option_names(model)?;
        }
        let run: Self = serde_json::from_value(value).map_err(|e| SsaError::Storage {
            message: format!("run config: {e}"),
        })?;
        run.model.validate()?;
        Ok(run)
    }

    /// # Errors
    ///
    /// As [`RunConfig::from_json_str`], plus [`SsaError::Storage`] if the
    /// file cannot be read.
    pub fn from_json_file(path: &Path) -> Result<Self, SsaError> {
        let text = std::fs::read_to_string(path).map_err(|e| SsaError::Storage {
            message: format!("read {}: {e}", path.display()),
        })?;
        Self::from_json_str(&text)
    }

    /// Copies the synthetic data's shape into the model section so the two
    /// always agree.
    pub fn align_model_to_synthetic(&mut self) {
        self.model.input_dim = self.synthetic.input_dim;
        self.model.c_dim = self.synthetic.c_dim;
        self.model.s_dim = self.synthetic.s_dim;
        self.model.nclass = self.synthetic.nclass;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ssa_core::OptimizerKind;

    #[test]
    fn sections_parse_independently() {
        let run = RunConfig::from_json_str(
            r#"{
                "model": { "optimizer": "rmsprop", "lr": 0.01 },
                "synthetic": { "nclass": 3, "seed": 9 }
            }"#,
        )
        .unwrap();
        assert_eq!(run.model.optimizer, OptimizerKind::RmsProp);
        assert_eq!(run.synthetic.nclass, 3);
        assert_eq!(run.synthetic.seed, 9);
        assert_eq!(run.train.batch_size, 64);
    }

    #[test]
    fn unknown_optimizer_fails_at_parse() {
        let err = RunConfig::from_json_str(r#"{ "model": { "optimizer": "sgd" } }"#).unwrap_err();
        assert!(err.to_string().contains("sgd"), "{err}");
        assert!(matches!(err, SsaError::Unsupported { option: "optimizer", .. }));
    }

    #[test]
    fn unknown_decoder_in_model_section_is_unsupported() {
        let err = RunConfig::from_json_str(
            r#"{ "train": { "num_steps": 3 }, "model": { "decoder_dist": "poisson" } }"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            SsaError::Unsupported { option: "decoder distribution", ref value } if value == "poisson"
        ));
    }

    #[test]
    fn invalid_model_section_rejected() {
        let err = RunConfig::from_json_str(r#"{ "model": { "c_dim": 0 } }"#).unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }));
    }

    #[test]
    fn align_copies_dimensions() {
        let mut run = RunConfig::default();
        run.synthetic.nclass = 7;
        run.synthetic.input_dim = 6;
        run.align_model_to_synthetic();
        assert_eq!(run.model.nclass, 7);
        assert_eq!(run.model.input_dim, 6);
    }
}
