//! Step loop around [`SsaModel`]: mini-batches, optimizer, periodic
//! validation with running-best tracking, and the plateau scheduler.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use ssa_core::{MetricSink, SsaError};
use ssa_metrics::{EvalScores, RunningBest};
use ssa_model::{ElboScalars, SsaModel};

use crate::dataset::Dataset;
use crate::scheduler::ReduceLrOnPlateau;

/// Driver settings.
///
/// # Example
///
/// ```
/// use ssa_train::TrainConfig;
///
/// let config = TrainConfig::default();
/// assert_eq!(config.batch_size, 64);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Optimizer steps to run.
    pub num_steps: usize,
    pub batch_size: usize,
    /// Steps between validation passes; 0 disables validation.
    pub validation_interval: usize,
    /// Seed for batch order and latent sampling.
    pub seed: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            batch_size: 64,
            validation_interval: 100,
            seed: 770,
        }
    }
}

/// One validation pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationRecord {
    /// Optimizer steps completed before this pass.
    pub step: usize,
    pub elbo: ElboScalars,
    pub scores: EvalScores,
    pub lr: f64,
}

/// Outcome of [`train`].
#[derive(Debug, Clone)]
pub struct TrainResult {
    /// Training loss per step.
    pub loss_history: Vec<f64>,
    pub validations: Vec<ValidationRecord>,
    /// Running best after the last validation.
    pub best: RunningBest,
    pub final_lr: f64,
    pub steps_completed: usize,
}

impl TrainResult {
    pub fn final_loss(&self) -> f64 {
        self.loss_history.last().copied().unwrap_or(f64::NAN)
    }
}

/// Trains `model` on `train` for `config.num_steps` steps.
///
/// Validation runs on all of `val` every `validation_interval` steps and
/// once more at the end if the last step was not a validation step. The
/// plateau scheduler, when configured, watches the validation ELBO.
///
/// # Errors
///
/// - [`SsaError::EmptyBatch`] if `train` is empty.
/// - [`SsaError::InvalidConfig`] if `batch_size` is 0, `val` has no
///   ground truth, or either dataset's factors differ in width from the
///   model latent.
/// - Any step, metric or optimizer failure.
pub fn train(
    model: &SsaModel,
    train: &Dataset,
    val: Option<&Dataset>,
    config: &TrainConfig,
    sink: &mut dyn MetricSink,
) -> Result<TrainResult, SsaError> {
    if train.is_empty() {
        return Err(SsaError::EmptyBatch);
    }
    if config.batch_size == 0 {
        return Err(SsaError::config("batch_size must be > 0"));
    }
    let z_dim = model.config().z_dim();
    train.check_factor_width(z_dim)?;
    if let Some(ds) = val {
        ds.check_factor_width(z_dim)?;
    }
    let val_batch = match val {
        Some(ds) if !ds.has_ground_truth() => {
            return Err(SsaError::config("validation data needs ground-truth factors"))
        }
        Some(ds) if config.validation_interval > 0 => Some(ds.full_batch(model.device())?),
        _ => None,
    };

    let mut optimizer = model.optimizer()?;
    let mut scheduler = ReduceLrOnPlateau::from_config(model.config());
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut best = RunningBest::default();
    let mut loss_history = Vec::with_capacity(config.num_steps);
    let mut validations = Vec::new();
    let mut pending: Vec<Vec<usize>> = Vec::new();

    tracing::info!(
        steps = config.num_steps,
        batch_size = config.batch_size,
        train_rows = train.len(),
        optimizer = %model.config().optimizer,
        lr = optimizer.learning_rate(),
        "starting training"
    );

    for step in 0..config.num_steps {
        if pending.is_empty() {
            pending = train.shuffled_batches(config.batch_size, &mut rng);
            pending.reverse();
        }
        let Some(indices) = pending.pop() else {
            break;
        };
        let batch = train.batch(&indices, model.device())?;

        let outcome = model.training_step(&batch, &mut rng, sink)?;
        let loss = outcome.scalars.loss;
        if !loss.is_finite() {
            tracing::warn!(step, loss, "non-finite training loss");
        }
        loss_history.push(loss);
        optimizer.backward_step(&outcome.terms.loss)?;

        let completed = step + 1;
        let due = config.validation_interval > 0
            && (completed % config.validation_interval == 0 || completed == config.num_steps);
        if let (true, Some(val_batch)) = (due, &val_batch) {
            let outcome = model.validation_step(val_batch, best, &mut rng, sink)?;
            let report = outcome.report.ok_or_else(|| SsaError::Internal {
                message: "validation step produced no report".to_string(),
            })?;
            best = report.best;

            if let Some(scheduler) = scheduler.as_mut() {
                if let Some(lr) = scheduler.observe(outcome.scalars.loss, optimizer.learning_rate()) {
                    optimizer.set_learning_rate(lr);
                }
            }
            let lr = optimizer.learning_rate();
            sink.log_scalar("lr", lr);
            tracing::info!(
                step = completed,
                val_loss = outcome.scalars.loss,
                r2 = report.scores.r2,
                mcc = report.scores.mcc,
                best_sum = best.best_sum,
                "validation"
            );
            validations.push(ValidationRecord {
                step: completed,
                elbo: outcome.scalars,
                scores: report.scores,
                lr,
            });
        }
    }

    Ok(TrainResult {
        steps_completed: loss_history.len(),
        loss_history,
        validations,
        best,
        final_lr: optimizer.learning_rate(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use ssa_core::{MemorySink, SsaConfig};

    use crate::synthetic::{generate_synthetic, SyntheticConfig};

    fn small_model() -> SsaModel {
        let config = SsaConfig {
            input_dim: 4,
            c_dim: 2,
            s_dim: 2,
            nclass: 2,
            hidden_dim: 16,
            lr: 1e-3,
            ..SsaConfig::default()
        };
        SsaModel::new(config, &Device::Cpu).unwrap()
    }

    fn data() -> Dataset {
        generate_synthetic(&SyntheticConfig {
            nclass: 2,
            samples_per_domain: 40,
            ..SyntheticConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn runs_requested_steps_and_validates_at_interval() {
        let model = small_model();
        let (train_ds, val_ds) = data().split_every(4).unwrap();
        let config = TrainConfig {
            num_steps: 10,
            batch_size: 16,
            validation_interval: 4,
            seed: 1,
        };
        let mut sink = MemorySink::default();
        let result = train(&model, &train_ds, Some(&val_ds), &config, &mut sink).unwrap();
        assert_eq!(result.steps_completed, 10);
        assert_eq!(result.loss_history.len(), 10);
        let steps: Vec<usize> = result.validations.iter().map(|v| v.step).collect();
        assert_eq!(steps, vec![4, 8, 10]);
        assert_eq!(sink.values("val_r2").len(), 3);
        assert_eq!(sink.values("train_elbo_loss").len(), 10);
        assert_eq!(result.final_lr, 1e-3);
    }

    #[test]
    fn empty_training_set_rejected() {
        let model = small_model();
        let empty = Dataset::new(Vec::new(), Vec::new(), None, 4, 4).unwrap();
        let err = train(&model, &empty, None, &TrainConfig::default(), &mut MemorySink::default())
            .unwrap_err();
        assert!(matches!(err, SsaError::EmptyBatch));
    }

    #[test]
    fn validation_without_ground_truth_rejected() {
        let model = small_model();
        let ds = data();
        let no_y = Dataset::new(vec![0.0; 8], vec![0, 1], None, 4, 4).unwrap();
        let err = train(&model, &ds, Some(&no_y), &TrainConfig::default(), &mut MemorySink::default())
            .unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }));
    }

    #[test]
    fn factor_width_mismatch_rejected_before_training() {
        let model = small_model();
        let ds = data();
        let wide = Dataset::new(vec![0.0; 8], vec![0, 1], Some(vec![0.0; 10]), 4, 5).unwrap();
        let mut sink = MemorySink::default();
        let err = train(&model, &ds, Some(&wide), &TrainConfig::default(), &mut sink).unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }), "{err}");
        let err = train(&model, &wide, None, &TrainConfig::default(), &mut sink).unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }), "{err}");
        assert!(sink.records.is_empty());
    }
}
