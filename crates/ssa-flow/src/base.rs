//! Fixed standard-normal target density of the flows.

use candle_core::{Device, Tensor};
use rand::Rng;
use rand_distr::StandardNormal;
use ssa_core::{SsaError, DTYPE};

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// `N(0, I)` over `dim` dimensions. Never learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BaseDistribution {
    dim: usize,
}

impl BaseDistribution {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Joint log-density of each row of `e [batch, dim]`, giving `[batch]`.
    ///
    /// `log p(e) = -½·‖e‖² - dim·ln√(2π)`
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if `e` is not `[batch, dim]`.
    pub fn log_prob(&self, e: &Tensor) -> Result<Tensor, SsaError> {
        match e.dims() {
            [_, d] if *d == self.dim => {}
            dims => {
                return Err(SsaError::shape(format!(
                    "base distribution expects [batch, {}], got {dims:?}",
                    self.dim
                )))
            }
        }
        e.sqr()
            .and_then(|sq| sq.sum(1))
            .and_then(|ss| ss.affine(-0.5, -(self.dim as f64) * LN_SQRT_2PI))
            .map_err(|err| SsaError::Internal {
                message: format!("base log_prob: {err}"),
            })
    }

    /// Draws `n` rows from the base distribution.
    pub fn sample<R: Rng + ?Sized>(
        &self,
        n: usize,
        rng: &mut R,
        device: &Device,
    ) -> Result<Tensor, SsaError> {
        let data: Vec<f64> = (0..n * self.dim)
            .map(|_| rng.sample::<f64, _>(StandardNormal))
            .collect();
        Tensor::from_vec(data, (n, self.dim), device)
            .and_then(|t| t.to_dtype(DTYPE))
            .map_err(|e| SsaError::Internal {
                message: format!("base sample: {e}"),
            })
    }
}
