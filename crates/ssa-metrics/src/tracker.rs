//! Evaluation-step scoring of recovered latents against ground truth.

use nalgebra::DMatrix;
use ssa_core::{CorrelationMethod, LatentLayout, MetricSink, R2Config, SsaConfig, SsaError};

use crate::best::RunningBest;
use crate::mcc::compute_mcc;
use crate::r2::compute_r2;

/// Scores of one evaluation step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalScores {
    /// R² between recovered and true content blocks.
    pub r2: f64,
    /// MCC between recovered and true style blocks.
    pub mcc: f64,
}

/// Scores of one evaluation step together with the updated running best.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalReport {
    pub scores: EvalScores,
    pub best: RunningBest,
}

impl EvalReport {
    /// Emits `val_r2`, `val_mcc` and the six running-best values.
    pub fn log(&self, sink: &mut dyn MetricSink) {
        sink.log_scalar("val_mcc", self.scores.mcc);
        sink.log_scalar("val_r2", self.scores.r2);
        for (name, value) in self.best.reported() {
            sink.log_scalar(name, value);
        }
    }
}

/// Computes content R² and style MCC from posterior means.
///
/// The content block is scored with R² in the direction chosen by
/// `hz_to_z`: `true` regresses the true content on the recovered content,
/// `false` the recovered content on the truth. The style block is scored
/// with MCC.
#[derive(Debug, Clone, Copy)]
pub struct MetricTracker {
    layout: LatentLayout,
    correlation: CorrelationMethod,
    hz_to_z: bool,
    r2: R2Config,
}

impl MetricTracker {
    pub fn new(
        layout: LatentLayout,
        correlation: CorrelationMethod,
        hz_to_z: bool,
        r2: R2Config,
    ) -> Self {
        Self {
            layout,
            correlation,
            hz_to_z,
            r2,
        }
    }

    pub fn from_config(config: &SsaConfig) -> Self {
        Self::new(
            LatentLayout::new(config.c_dim, config.s_dim),
            config.correlation,
            config.hz_to_z,
            config.r2,
        )
    }

    pub fn hz_to_z(&self) -> bool {
        self.hz_to_z
    }

    /// Scores posterior means `mus` against ground truth `y`, both
    /// `[rows, z_dim]`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if either matrix is not
    /// `[rows, z_dim]` or the row counts differ, and propagates R²/MCC
    /// failures.
    pub fn evaluate(&self, mus: &DMatrix<f64>, y: &DMatrix<f64>) -> Result<EvalScores, SsaError> {
        let z_dim = self.layout.z_dim();
        if mus.ncols() != z_dim || y.ncols() != z_dim || mus.nrows() != y.nrows() {
            return Err(SsaError::shape(format!(
                "evaluation expects means and truth of shape [rows, {z_dim}], got {:?} and {:?}",
                mus.shape(),
                y.shape()
            )));
        }
        let c_dim = self.layout.c_dim;
        let s_dim = self.layout.s_dim;

        let mus_c = mus.columns(0, c_dim).into_owned();
        let y_c = y.columns(0, c_dim).into_owned();
        let r2 = if self.hz_to_z {
            compute_r2(&mus_c, &y_c, &self.r2)?
        } else {
            compute_r2(&y_c, &mus_c, &self.r2)?
        };

        let mus_s = mus.columns(c_dim, s_dim).into_owned();
        let y_s = y.columns(c_dim, s_dim).into_owned();
        let mcc = compute_mcc(&mus_s, &y_s, self.correlation)?;

        tracing::debug!(r2, mcc, hz_to_z = self.hz_to_z, "evaluated latents");
        Ok(EvalScores { r2, mcc })
    }

    /// [`MetricTracker::evaluate`] followed by a running-best update.
    ///
    /// # Errors
    ///
    /// Same as [`MetricTracker::evaluate`]; `best` is consumed only on success.
    pub fn evaluate_and_update(
        &self,
        mus: &DMatrix<f64>,
        y: &DMatrix<f64>,
        best: RunningBest,
    ) -> Result<EvalReport, SsaError> {
        let scores = self.evaluate(mus, y)?;
        Ok(EvalReport {
            scores,
            best: best.update(scores.r2, scores.mcc),
        })
    }
}
