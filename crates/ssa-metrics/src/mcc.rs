//! Mean correlation coefficient between recovered and true factors.

use nalgebra::DMatrix;
use ssa_core::{CorrelationMethod, SsaError};

use crate::assignment::max_score_assignment;
use crate::correlation::cross_correlation;

/// Mean absolute correlation after optimally pairing recovered factors
/// with true factors.
///
/// Both matrices are sample-major (`[samples, factors]`). The absolute
/// cross-correlation matrix is assigned one-to-one by maximum total score
/// and the matched entries are averaged, so permutations and sign flips of
/// the true factors score `1.0`.
///
/// Non-finite latents propagate: if any correlation is NaN the score is
/// NaN.
///
/// # Errors
///
/// Returns [`SsaError::EmptyBatch`] for zero samples and
/// [`SsaError::ShapeMismatch`] for unequal sample counts or no factors.
pub fn compute_mcc(
    recovered: &DMatrix<f64>,
    truth: &DMatrix<f64>,
    method: CorrelationMethod,
) -> Result<f64, SsaError> {
    if recovered.nrows() == 0 || truth.nrows() == 0 {
        return Err(SsaError::EmptyBatch);
    }
    if recovered.ncols() == 0 || truth.ncols() == 0 {
        return Err(SsaError::shape("MCC needs at least one factor on each side"));
    }
    let corr = cross_correlation(recovered, truth, method)?.abs();
    if corr.iter().any(|c| !c.is_finite()) {
        tracing::debug!("non-finite correlation, MCC is NaN");
        return Ok(f64::NAN);
    }
    let pairs = max_score_assignment(&corr);
    if pairs.is_empty() {
        return Ok(f64::NAN);
    }
    let total: f64 = pairs.iter().map(|&(r, c)| corr[(r, c)]).sum();
    Ok(total / pairs.len() as f64)
}
