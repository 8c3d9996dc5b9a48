//! Pearson and Spearman correlation between factor columns.

use std::cmp::Ordering;

use nalgebra::DMatrix;
use ssa_core::{CorrelationMethod, SsaError};

/// Pearson correlation of two equal-length samples.
///
/// Returns `0.0` when either sample has zero variance.
pub fn pearson(x: &[f64], y: &[f64]) -> f64 {
    let n = x.len().min(y.len());
    if n == 0 {
        return 0.0;
    }
    let mean_x = x[..n].iter().sum::<f64>() / n as f64;
    let mean_y = y[..n].iter().sum::<f64>() / n as f64;
    let mut num = 0.0;
    let mut denom_x = 0.0;
    let mut denom_y = 0.0;
    for (a, b) in x[..n].iter().zip(&y[..n]) {
        let dx = a - mean_x;
        let dy = b - mean_y;
        num += dx * dy;
        denom_x += dx * dx;
        denom_y += dy * dy;
    }
    let denom = (denom_x * denom_y).sqrt();
    if denom <= f64::EPSILON {
        0.0
    } else {
        (num / denom).clamp(-1.0, 1.0)
    }
}

/// Spearman rank correlation: Pearson on average ranks.
///
/// A NaN in either input yields NaN, as it would for [`pearson`].
pub fn spearman(x: &[f64], y: &[f64]) -> f64 {
    if x.iter().chain(y).any(|v| v.is_nan()) {
        return f64::NAN;
    }
    pearson(&rank(x), &rank(y))
}

/// 1-based ranks with ties sharing their average rank.
pub fn rank(values: &[f64]) -> Vec<f64> {
    let mut pairs: Vec<(usize, f64)> = values.iter().copied().enumerate().collect();
    pairs.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < pairs.len() {
        let mut j = i + 1;
        while j < pairs.len() && pairs[j].1 == pairs[i].1 {
            j += 1;
        }
        let rank_value = (i + j - 1) as f64 / 2.0 + 1.0;
        for pair in &pairs[i..j] {
            ranks[pair.0] = rank_value;
        }
        i = j;
    }
    ranks
}

/// Cross-correlation matrix `[a.ncols, b.ncols]` between the columns of
/// two sample-major matrices with the same number of rows.
///
/// # Errors
///
/// Returns [`SsaError::ShapeMismatch`] if the row counts differ.
pub fn cross_correlation(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    method: CorrelationMethod,
) -> Result<DMatrix<f64>, SsaError> {
    if a.nrows() != b.nrows() {
        return Err(SsaError::shape(format!(
            "correlation needs equal sample counts, got {} and {}",
            a.nrows(),
            b.nrows()
        )));
    }
    let columns = |m: &DMatrix<f64>| -> Vec<Vec<f64>> {
        m.column_iter()
            .map(|c| {
                let c: Vec<f64> = c.iter().copied().collect();
                match method {
                    CorrelationMethod::Pearson => c,
                    CorrelationMethod::Spearman => rank(&c),
                }
            })
            .collect()
    };
    let cols_a = columns(a);
    let cols_b = columns(b);
    Ok(DMatrix::from_fn(a.ncols(), b.ncols(), |i, j| {
        pearson(&cols_a[i], &cols_b[j])
    }))
}
