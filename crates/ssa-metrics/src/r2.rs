//! Coefficient of determination of one latent block regressed on another.
//!
//! `compute_r2(predictors, targets, config)` fits a regressor from
//! `predictors` to `targets` and reports the `r2_score` of its predictions,
//! averaged uniformly over target columns:
//!
//! ```text
//! R²_j = 1 - Σ_i (t_ij - p_ij)² / Σ_i (t_ij - mean_j)²
//! ```
//!
//! A target column with zero variance scores `1.0` when predicted exactly
//! and `0.0` otherwise.

use nalgebra::DMatrix;
use ssa_core::{R2Config, R2Estimator, SsaError};

/// Regresses `targets` on `predictors` and returns the uniform-average R².
///
/// Predictors are standardized with statistics of the fitting rows. With
/// `holdout_every = Some(k)`, every `k`-th row is held out and scored;
/// otherwise (or when too few rows remain on either side) the fit is
/// scored in-sample. Any NaN or infinite input gives a NaN score without
/// fitting.
///
/// # Errors
///
/// Returns [`SsaError::EmptyBatch`] for zero rows,
/// [`SsaError::ShapeMismatch`] for unequal row counts and
/// [`SsaError::Internal`] if the regression system cannot be solved.
pub fn compute_r2(
    predictors: &DMatrix<f64>,
    targets: &DMatrix<f64>,
    config: &R2Config,
) -> Result<f64, SsaError> {
    if predictors.nrows() == 0 {
        return Err(SsaError::EmptyBatch);
    }
    if predictors.nrows() != targets.nrows() {
        return Err(SsaError::shape(format!(
            "R² needs equal row counts, got {} predictors and {} targets",
            predictors.nrows(),
            targets.nrows()
        )));
    }
    if predictors.iter().chain(targets.iter()).any(|v| !v.is_finite()) {
        tracing::debug!("non-finite R² inputs, score is NaN");
        return Ok(f64::NAN);
    }

    let (fit_rows, eval_rows) = split_rows(predictors.nrows(), config.holdout_every);
    let x_fit = predictors.select_rows(&fit_rows);
    let y_fit = targets.select_rows(&fit_rows);
    let x_eval = predictors.select_rows(&eval_rows);
    let y_eval = targets.select_rows(&eval_rows);

    let scaler = Standardizer::fit(&x_fit);
    let x_fit = scaler.apply(&x_fit);
    let x_eval = scaler.apply(&x_eval);

    let predicted = match config.estimator {
        R2Estimator::Linear => fit_predict_linear(&x_fit, &y_fit, &x_eval)?,
        R2Estimator::KernelRidge { alpha, gamma } => {
            let gamma = gamma.unwrap_or(1.0 / x_fit.ncols().max(1) as f64);
            fit_predict_kernel_ridge(&x_fit, &y_fit, &x_eval, alpha, gamma)?
        }
    };
    r2_score(&y_eval, &predicted)
}

/// Uniform-average `r2_score` of `predicted` against `truth`.
///
/// # Errors
///
/// Returns [`SsaError::ShapeMismatch`] if the shapes differ.
pub fn r2_score(truth: &DMatrix<f64>, predicted: &DMatrix<f64>) -> Result<f64, SsaError> {
    if truth.shape() != predicted.shape() {
        return Err(SsaError::shape(format!(
            "r2_score shapes differ: {:?} vs {:?}",
            truth.shape(),
            predicted.shape()
        )));
    }
    if truth.nrows() == 0 || truth.ncols() == 0 {
        return Err(SsaError::EmptyBatch);
    }
    let mut total = 0.0;
    for (t, p) in truth.column_iter().zip(predicted.column_iter()) {
        let mean = t.mean();
        let ss_tot: f64 = t.iter().map(|v| (v - mean).powi(2)).sum();
        let ss_res: f64 = t.iter().zip(p.iter()).map(|(a, b)| (a - b).powi(2)).sum();
        total += if ss_tot > 0.0 {
            1.0 - ss_res / ss_tot
        } else if ss_res == 0.0 {
            1.0
        } else {
            0.0
        };
    }
    Ok(total / truth.ncols() as f64)
}

fn split_rows(n: usize, holdout_every: Option<usize>) -> (Vec<usize>, Vec<usize>) {
    let all: Vec<usize> = (0..n).collect();
    let Some(k) = holdout_every.filter(|&k| k >= 2) else {
        return (all.clone(), all);
    };
    let (eval, fit): (Vec<usize>, Vec<usize>) = all.iter().copied().partition(|&i| i % k == k - 1);
    if eval.is_empty() || fit.len() < 2 {
        return (all.clone(), all);
    }
    (fit, eval)
}

/// Column-wise z-scoring with statistics from the fitting rows.
struct Standardizer {
    mean: Vec<f64>,
    scale: Vec<f64>,
}

impl Standardizer {
    fn fit(x: &DMatrix<f64>) -> Self {
        let n = x.nrows() as f64;
        let mut mean = Vec::with_capacity(x.ncols());
        let mut scale = Vec::with_capacity(x.ncols());
        for col in x.column_iter() {
            let m = col.mean();
            let var = col.iter().map(|v| (v - m).powi(2)).sum::<f64>() / n;
            mean.push(m);
            scale.push(if var > 0.0 { var.sqrt() } else { 1.0 });
        }
        Self { mean, scale }
    }

    fn apply(&self, x: &DMatrix<f64>) -> DMatrix<f64> {
        DMatrix::from_fn(x.nrows(), x.ncols(), |i, j| {
            (x[(i, j)] - self.mean[j]) / self.scale[j]
        })
    }
}

fn with_intercept(x: &DMatrix<f64>) -> DMatrix<f64> {
    x.clone().insert_column(0, 1.0)
}

/// Ordinary least squares with intercept, solved through the SVD so
/// collinear predictors still get the minimum-norm solution.
fn fit_predict_linear(
    x_fit: &DMatrix<f64>,
    y_fit: &DMatrix<f64>,
    x_eval: &DMatrix<f64>,
) -> Result<DMatrix<f64>, SsaError> {
    let design = with_intercept(x_fit);
    let coef = design
        .svd(true, true)
        .solve(y_fit, 1e-12)
        .map_err(|e| SsaError::Internal {
            message: format!("least squares: {e}"),
        })?;
    Ok(with_intercept(x_eval) * coef)
}

fn rbf_kernel(a: &DMatrix<f64>, b: &DMatrix<f64>, gamma: f64) -> DMatrix<f64> {
    DMatrix::from_fn(a.nrows(), b.nrows(), |i, j| {
        let sq: f64 = a
            .row(i)
            .iter()
            .zip(b.row(j).iter())
            .map(|(p, q)| (p - q).powi(2))
            .sum();
        (-gamma * sq).exp()
    })
}

/// RBF kernel ridge: `dual = (K + αI)⁻¹ Y`, `ŷ = K(x_eval, x_fit) · dual`.
fn fit_predict_kernel_ridge(
    x_fit: &DMatrix<f64>,
    y_fit: &DMatrix<f64>,
    x_eval: &DMatrix<f64>,
    alpha: f64,
    gamma: f64,
) -> Result<DMatrix<f64>, SsaError> {
    let n = x_fit.nrows();
    let gram = rbf_kernel(x_fit, x_fit, gamma) + DMatrix::identity(n, n) * alpha;
    let chol = gram.cholesky().ok_or_else(|| SsaError::Internal {
        message: format!("kernel ridge system not positive definite (alpha = {alpha})"),
    })?;
    let dual = chol.solve(y_fit);
    Ok(rbf_kernel(x_eval, x_fit, gamma) * dual)
}
