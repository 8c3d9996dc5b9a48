//! Mini-batch container.

use candle_core::{Device, Tensor};

use crate::error::SsaError;
use crate::DTYPE;

/// One mini-batch: inputs `x`, domain labels `c`, optional ground truth `y`.
///
/// Construction enforces `x.rows == c.len() == y.rows` and a non-zero row
/// count, so every downstream loss can rely on both.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use ssa_core::Batch;
///
/// let x = Tensor::zeros((3, 4), ssa_core::DTYPE, &Device::Cpu).unwrap();
/// let batch = Batch::new(x, vec![0, 1, 1], None).unwrap();
/// assert_eq!(batch.rows(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct Batch {
    /// Observations `[batch, input_dim]`.
    pub x: Tensor,
    /// Domain label per row.
    pub c: Vec<u32>,
    /// Ground-truth factors `[batch, z_dim]`, present for evaluation.
    pub y: Option<Tensor>,
}

impl Batch {
    /// Builds a batch after checking row agreement.
    ///
    /// # Errors
    ///
    /// - [`SsaError::EmptyBatch`] if `x` has no rows.
    /// - [`SsaError::ShapeMismatch`] if `x` is not 2-D or the row counts differ.
    pub fn new(x: Tensor, c: Vec<u32>, y: Option<Tensor>) -> Result<Self, SsaError> {
        let rows = match x.dims() {
            [rows, _] => *rows,
            dims => {
                return Err(SsaError::shape(format!("x must be [batch, features], got {dims:?}")))
            }
        };
        if rows == 0 {
            return Err(SsaError::EmptyBatch);
        }
        if c.len() != rows {
            return Err(SsaError::shape(format!(
                "x has {rows} rows but {} domain labels",
                c.len()
            )));
        }
        if let Some(y) = &y {
            match y.dims() {
                [y_rows, _] if *y_rows == rows => {}
                dims => {
                    return Err(SsaError::shape(format!(
                        "y must be [{rows}, factors], got {dims:?}"
                    )))
                }
            }
        }
        Ok(Self { x, c, y })
    }

    pub fn rows(&self) -> usize {
        self.c.len()
    }

    /// Labels as a `u32` tensor `[batch]`, suitable for embedding lookup.
    pub fn labels_tensor(&self, device: &Device) -> Result<Tensor, SsaError> {
        Tensor::from_slice(&self.c, self.c.len(), device).map_err(|e| SsaError::Internal {
            message: format!("labels tensor: {e}"),
        })
    }

    /// One-hot domain indicator `[batch, nclass]` in [`DTYPE`].
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if a label is `>= nclass`.
    pub fn one_hot(&self, nclass: usize, device: &Device) -> Result<Tensor, SsaError> {
        one_hot(&self.c, nclass, device)
    }
}

/// One-hot encodes `labels` into a `[labels.len(), nclass]` tensor.
///
/// # Errors
///
/// Returns [`SsaError::ShapeMismatch`] if any label is out of range.
pub fn one_hot(labels: &[u32], nclass: usize, device: &Device) -> Result<Tensor, SsaError> {
    let mut data = vec![0.0f64; labels.len() * nclass];
    for (row, &label) in labels.iter().enumerate() {
        let label = label as usize;
        if label >= nclass {
            return Err(SsaError::shape(format!(
                "domain label {label} at row {row} outside [0, {nclass})"
            )));
        }
        data[row * nclass + label] = 1.0;
    }
    Tensor::from_vec(data, (labels.len(), nclass), device)
        .and_then(|t| t.to_dtype(DTYPE))
        .map_err(|e| SsaError::Internal {
            message: format!("one-hot tensor: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn x(rows: usize) -> Tensor {
        Tensor::zeros((rows, 2), DTYPE, &Device::Cpu).unwrap()
    }

    #[test]
    fn empty_batch_rejected() {
        assert!(matches!(Batch::new(x(0), vec![], None), Err(SsaError::EmptyBatch)));
    }

    #[test]
    fn label_count_must_match_rows() {
        assert!(Batch::new(x(3), vec![0, 1], None).is_err());
    }

    #[test]
    fn ground_truth_rows_must_match() {
        let y = Tensor::zeros((2, 4), DTYPE, &Device::Cpu).unwrap();
        assert!(Batch::new(x(3), vec![0, 1, 2], Some(y)).is_err());
    }

    #[test]
    fn one_hot_marks_label_columns() {
        let batch = Batch::new(x(3), vec![2, 0, 1], None).unwrap();
        let oh = batch.one_hot(3, &Device::Cpu).unwrap().to_vec2::<f64>().unwrap();
        assert_eq!(
            oh,
            vec![vec![0.0, 0.0, 1.0], vec![1.0, 0.0, 0.0], vec![0.0, 1.0, 0.0]]
        );
    }

    #[test]
    fn out_of_range_label_rejected() {
        let batch = Batch::new(x(2), vec![0, 3], None).unwrap();
        assert!(batch.one_hot(3, &Device::Cpu).is_err());
    }
}
