//! Host-resident dataset of observations, domain labels and ground truth.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::Rng;
use ssa_core::{Batch, SsaError, DTYPE};

/// Row-major observations `x [len, input_dim]`, labels `c [len]` and
/// optional ground-truth factors `y [len, z_dim]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    x: Vec<f64>,
    c: Vec<u32>,
    y: Option<Vec<f64>>,
    input_dim: usize,
    z_dim: usize,
}

impl Dataset {
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if buffer lengths disagree with
    /// the label count and widths.
    pub fn new(
        x: Vec<f64>,
        c: Vec<u32>,
        y: Option<Vec<f64>>,
        input_dim: usize,
        z_dim: usize,
    ) -> Result<Self, SsaError> {
        if x.len() != c.len() * input_dim {
            return Err(SsaError::shape(format!(
                "x holds {} values, expected {} rows × {input_dim}",
                x.len(),
                c.len()
            )));
        }
        if let Some(y) = &y {
            if y.len() != c.len() * z_dim {
                return Err(SsaError::shape(format!(
                    "y holds {} values, expected {} rows × {z_dim}",
                    y.len(),
                    c.len()
                )));
            }
        }
        Ok(Self {
            x,
            c,
            y,
            input_dim,
            z_dim,
        })
    }

    pub fn len(&self) -> usize {
        self.c.len()
    }

    pub fn is_empty(&self) -> bool {
        self.c.is_empty()
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn z_dim(&self) -> usize {
        self.z_dim
    }

    pub fn has_ground_truth(&self) -> bool {
        self.y.is_some()
    }

    /// Checks that ground-truth factors, when present, are `z_dim` wide.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] on a width mismatch.
    pub fn check_factor_width(&self, z_dim: usize) -> Result<(), SsaError> {
        if self.has_ground_truth() && self.z_dim != z_dim {
            return Err(SsaError::config(format!(
                "dataset factors are {} wide but the model latent is c_dim + s_dim = {z_dim}",
                self.z_dim
            )));
        }
        Ok(())
    }

    pub fn labels(&self) -> &[u32] {
        &self.c
    }

    /// Largest label plus one.
    pub fn nclass(&self) -> usize {
        self.c.iter().max().map_or(0, |&m| m as usize + 1)
    }

    /// Gathers `indices` into a [`Batch`] on `device`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::EmptyBatch`] for no indices and
    /// [`SsaError::ShapeMismatch`] for an out-of-range index.
    pub fn batch(&self, indices: &[usize], device: &Device) -> Result<Batch, SsaError> {
        if let Some(&bad) = indices.iter().find(|&&i| i >= self.len()) {
            return Err(SsaError::shape(format!(
                "row {bad} outside dataset of {} rows",
                self.len()
            )));
        }
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("Dataset batch: {e}"),
        };
        let gather = |buf: &[f64], width: usize| -> Vec<f64> {
            indices
                .iter()
                .flat_map(|&i| buf[i * width..(i + 1) * width].iter().copied())
                .collect()
        };
        let rows = indices.len();
        let x = Tensor::from_vec(gather(&self.x, self.input_dim), (rows, self.input_dim), device)
            .map_err(map_err)?;
        let c = indices.iter().map(|&i| self.c[i]).collect();
        let y = match &self.y {
            Some(y) => Some(
                Tensor::from_vec(gather(y, self.z_dim), (rows, self.z_dim), device)
                    .map_err(map_err)?,
            ),
            None => None,
        };
        Batch::new(x, c, y)
    }

    /// Every row as one batch.
    ///
    /// # Errors
    ///
    /// See [`Dataset::batch`].
    pub fn full_batch(&self, device: &Device) -> Result<Batch, SsaError> {
        let all: Vec<usize> = (0..self.len()).collect();
        self.batch(&all, device)
    }

    /// A shuffled partition of all rows into chunks of at most `batch_size`.
    pub fn shuffled_batches<R: Rng + ?Sized>(&self, batch_size: usize, rng: &mut R) -> Vec<Vec<usize>> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.shuffle(rng);
        order
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Splits off every `every`-th row as a second dataset.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] if `every < 2`.
    pub fn split_every(&self, every: usize) -> Result<(Self, Self), SsaError> {
        if every < 2 {
            return Err(SsaError::config(format!("split interval must be >= 2, got {every}")));
        }
        let (held, kept): (Vec<usize>, Vec<usize>) =
            (0..self.len()).partition(|i| i % every == every - 1);
        Ok((self.select(&kept), self.select(&held)))
    }

    fn select(&self, rows: &[usize]) -> Self {
        let pick = |buf: &[f64], width: usize| -> Vec<f64> {
            rows.iter()
                .flat_map(|&i| buf[i * width..(i + 1) * width].iter().copied())
                .collect()
        };
        Self {
            x: pick(&self.x, self.input_dim),
            c: rows.iter().map(|&i| self.c[i]).collect(),
            y: self.y.as_ref().map(|y| pick(y, self.z_dim)),
            input_dim: self.input_dim,
            z_dim: self.z_dim,
        }
    }

    /// Writes `x`, `c` and (when present) `y` to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Storage`] on tensor or I/O failures.
    pub fn save_safetensors(&self, path: &Path) -> Result<(), SsaError> {
        let storage = |e: candle_core::Error| SsaError::Storage {
            message: format!("save dataset {}: {e}", path.display()),
        };
        let n = self.len();
        let mut tensors = HashMap::new();
        tensors.insert(
            "x".to_string(),
            Tensor::from_slice(&self.x, (n, self.input_dim), &Device::Cpu).map_err(storage)?,
        );
        tensors.insert(
            "c".to_string(),
            Tensor::from_slice(&self.c, n, &Device::Cpu).map_err(storage)?,
        );
        if let Some(y) = &self.y {
            tensors.insert(
                "y".to_string(),
                Tensor::from_slice(y, (n, self.z_dim), &Device::Cpu).map_err(storage)?,
            );
        }
        candle_core::safetensors::save(&tensors, path).map_err(storage)
    }

    /// Reads a file written by [`Dataset::save_safetensors`].
    ///
    /// `z_dim` is taken from `y`; without `y` it is reported as 0.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Storage`] for unreadable files or missing keys
    /// and [`SsaError::ShapeMismatch`] for inconsistent tensors.
    pub fn load_safetensors(path: &Path) -> Result<Self, SsaError> {
        let storage = |message: String| SsaError::Storage {
            message: format!("load dataset {}: {message}", path.display()),
        };
        let mut tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .map_err(|e| storage(e.to_string()))?;
        let x = tensors.remove("x").ok_or_else(|| storage("missing x".to_string()))?;
        let c = tensors.remove("c").ok_or_else(|| storage("missing c".to_string()))?;
        let (_, input_dim) = x.dims2().map_err(|e| storage(format!("x: {e}")))?;
        let x = x
            .to_dtype(DTYPE)
            .and_then(|t| t.flatten_all())
            .and_then(|t| t.to_vec1::<f64>())
            .map_err(|e| storage(format!("x: {e}")))?;
        let c = c
            .to_dtype(DType::U32)
            .and_then(|t| t.to_vec1::<u32>())
            .map_err(|e| storage(format!("c: {e}")))?;
        let (y, z_dim) = match tensors.remove("y") {
            Some(y) => {
                let (_, z_dim) = y.dims2().map_err(|e| storage(format!("y: {e}")))?;
                let y = y
                    .to_dtype(DTYPE)
                    .and_then(|t| t.flatten_all())
                    .and_then(|t| t.to_vec1::<f64>())
                    .map_err(|e| storage(format!("y: {e}")))?;
                (Some(y), z_dim)
            }
            None => (None, 0),
        };
        Self::new(x, c, y, input_dim, z_dim)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn tiny() -> Dataset {
        let x = (0..12).map(|v| v as f64).collect();
        let y = Some((0..8).map(|v| -(v as f64)).collect());
        Dataset::new(x, vec![0, 1, 1, 0], y, 3, 2).unwrap()
    }

    #[test]
    fn batch_gathers_rows() {
        let ds = tiny();
        let b = ds.batch(&[2, 0], &Device::Cpu).unwrap();
        assert_eq!(
            b.x.to_vec2::<f64>().unwrap(),
            vec![vec![6.0, 7.0, 8.0], vec![0.0, 1.0, 2.0]]
        );
        assert_eq!(b.c, vec![1, 0]);
        assert_eq!(
            b.y.unwrap().to_vec2::<f64>().unwrap(),
            vec![vec![-4.0, -5.0], vec![-0.0, -1.0]]
        );
        assert!(ds.batch(&[4], &Device::Cpu).is_err());
        assert!(matches!(ds.batch(&[], &Device::Cpu), Err(SsaError::EmptyBatch)));
    }

    #[test]
    fn factor_width_must_match_latent() {
        let ds = tiny();
        ds.check_factor_width(2).unwrap();
        let err = ds.check_factor_width(4).unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }), "{err}");

        let no_y = Dataset::new(vec![0.0; 6], vec![0, 1], None, 3, 7).unwrap();
        no_y.check_factor_width(4).unwrap();
    }

    #[test]
    fn length_mismatch_rejected() {
        assert!(Dataset::new(vec![0.0; 5], vec![0, 1], None, 3, 2).is_err());
        assert!(Dataset::new(vec![0.0; 6], vec![0, 1], Some(vec![0.0; 3]), 3, 2).is_err());
    }

    #[test]
    fn shuffled_batches_cover_every_row_once() {
        let ds = tiny();
        let batches = ds.shuffled_batches(3, &mut StdRng::seed_from_u64(0));
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 1]);
        let mut all: Vec<usize> = batches.into_iter().flatten().collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3]);
    }

    #[test]
    fn split_every_partitions() {
        let (kept, held) = tiny().split_every(2).unwrap();
        assert_eq!(kept.labels(), &[0, 1]);
        assert_eq!(held.labels(), &[1, 0]);
        assert_eq!(held.x, vec![3.0, 4.0, 5.0, 9.0, 10.0, 11.0]);
        assert!(tiny().split_every(1).is_err());
    }

    #[test]
    fn safetensors_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.safetensors");
        let ds = tiny();
        ds.save_safetensors(&path).unwrap();
        assert_eq!(Dataset::load_safetensors(&path).unwrap(), ds);
    }

    #[test]
    fn nclass_from_labels() {
        assert_eq!(tiny().nclass(), 2);
    }
}
