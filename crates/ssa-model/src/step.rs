//! Explicit per-step state machine.
//!
//! ```text
//! train: Forward → LossCompute ──────────────────→ Log → Finished
//! eval:  Forward → LossCompute → MetricCompute → Log → Finished
//! ```
//!
//! A [`Step`] owns the intermediate results of one batch; the model
//! advances it one transition at a time (see `SsaModel::advance`).

use ssa_core::{Batch, SsaError};
use ssa_metrics::{EvalReport, RunningBest};

use crate::elbo::{ElboScalars, ElboTerms};
use crate::vae::VaeOutput;

/// Whether a step updates parameters or evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMode {
    Train,
    Eval,
}

impl StepMode {
    /// Metric-name prefix: `train` or `val`.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Eval => "val",
        }
    }
}

/// Position of a step in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Forward,
    LossCompute,
    MetricCompute,
    Log,
    Finished,
}

impl StepState {
    /// The state after this one. `Finished` is absorbing.
    pub fn next(self, mode: StepMode) -> Self {
        match (self, mode) {
            (Self::Forward, _) => Self::LossCompute,
            (Self::LossCompute, StepMode::Train) => Self::Log,
            (Self::LossCompute, StepMode::Eval) => Self::MetricCompute,
            (Self::MetricCompute, _) => Self::Log,
            (Self::Log, _) | (Self::Finished, _) => Self::Finished,
        }
    }
}

/// One batch moving through the state machine.
#[derive(Debug)]
pub struct Step<'a> {
    pub(crate) mode: StepMode,
    pub(crate) state: StepState,
    pub(crate) batch: &'a Batch,
    pub(crate) best: Option<RunningBest>,
    pub(crate) output: Option<VaeOutput>,
    pub(crate) terms: Option<ElboTerms>,
    pub(crate) scalars: Option<ElboScalars>,
    pub(crate) report: Option<EvalReport>,
}

/// Result of a finished step.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    /// Loss tensors; `terms.loss` is what the optimizer differentiates.
    pub terms: ElboTerms,
    pub scalars: ElboScalars,
    /// Evaluation scores and the updated running best (eval only).
    pub report: Option<EvalReport>,
}

impl<'a> Step<'a> {
    /// A training step.
    pub fn train(batch: &'a Batch) -> Self {
        Self::new(StepMode::Train, batch, None)
    }

    /// An evaluation step carrying the running best into the update.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] if the batch has no ground truth.
    pub fn eval(batch: &'a Batch, best: RunningBest) -> Result<Self, SsaError> {
        if batch.y.is_none() {
            return Err(SsaError::config("evaluation step requires ground-truth y"));
        }
        Ok(Self::new(StepMode::Eval, batch, Some(best)))
    }

    fn new(mode: StepMode, batch: &'a Batch, best: Option<RunningBest>) -> Self {
        Self {
            mode,
            state: StepState::Forward,
            batch,
            best,
            output: None,
            terms: None,
            scalars: None,
            report: None,
        }
    }

    pub fn mode(&self) -> StepMode {
        self.mode
    }

    pub fn state(&self) -> StepState {
        self.state
    }

    /// Consumes a finished step.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Internal`] if the step has not reached
    /// [`StepState::Finished`].
    pub fn into_outcome(self) -> Result<StepOutcome, SsaError> {
        if self.state != StepState::Finished {
            return Err(SsaError::Internal {
                message: format!("step still in {:?}", self.state),
            });
        }
        match (self.terms, self.scalars) {
            (Some(terms), Some(scalars)) => Ok(StepOutcome {
                terms,
                scalars,
                report: self.report,
            }),
            _ => Err(SsaError::Internal {
                message: "finished step without loss terms".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn walk(mode: StepMode) -> Vec<StepState> {
        let mut state = StepState::Forward;
        let mut seen = vec![state];
        while state != StepState::Finished {
            state = state.next(mode);
            seen.push(state);
        }
        seen
    }

    #[test]
    fn train_skips_metric_compute() {
        assert_eq!(
            walk(StepMode::Train),
            vec![
                StepState::Forward,
                StepState::LossCompute,
                StepState::Log,
                StepState::Finished
            ]
        );
    }

    #[test]
    fn eval_visits_every_state() {
        assert_eq!(
            walk(StepMode::Eval),
            vec![
                StepState::Forward,
                StepState::LossCompute,
                StepState::MetricCompute,
                StepState::Log,
                StepState::Finished
            ]
        );
    }

    #[test]
    fn finished_is_absorbing() {
        for mode in [StepMode::Train, StepMode::Eval] {
            assert_eq!(StepState::Finished.next(mode), StepState::Finished);
        }
    }

    #[test]
    fn prefixes() {
        assert_eq!(StepMode::Train.prefix(), "train");
        assert_eq!(StepMode::Eval.prefix(), "val");
    }
}
