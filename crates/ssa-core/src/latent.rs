//! Positional content/style split of the latent vector.

use candle_core::Tensor;

use crate::error::SsaError;

/// The fixed `[content | style]` layout of a `[batch, z_dim]` latent tensor.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use ssa_core::LatentLayout;
///
/// let layout = LatentLayout::new(2, 3);
/// let z = Tensor::zeros((4, 5), candle_core::DType::F64, &Device::Cpu).unwrap();
/// assert_eq!(layout.content(&z).unwrap().dims(), &[4, 2]);
/// assert_eq!(layout.style(&z).unwrap().dims(), &[4, 3]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatentLayout {
    pub c_dim: usize,
    pub s_dim: usize,
}

impl LatentLayout {
    pub fn new(c_dim: usize, s_dim: usize) -> Self {
        Self { c_dim, s_dim }
    }

    pub fn z_dim(&self) -> usize {
        self.c_dim + self.s_dim
    }

    /// Columns `[0, c_dim)`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if `z` is not `[batch, z_dim]`.
    pub fn content(&self, z: &Tensor) -> Result<Tensor, SsaError> {
        self.check(z)?;
        z.narrow(1, 0, self.c_dim).map_err(|e| SsaError::Internal {
            message: format!("latent content slice: {e}"),
        })
    }

    /// Columns `[c_dim, z_dim)`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if `z` is not `[batch, z_dim]`.
    pub fn style(&self, z: &Tensor) -> Result<Tensor, SsaError> {
        self.check(z)?;
        z.narrow(1, self.c_dim, self.s_dim).map_err(|e| SsaError::Internal {
            message: format!("latent style slice: {e}"),
        })
    }

    fn check(&self, z: &Tensor) -> Result<(), SsaError> {
        match z.dims() {
            [_, d] if *d == self.z_dim() => Ok(()),
            dims => Err(SsaError::shape(format!(
                "expected [batch, {}] latent, got {dims:?}",
                self.z_dim()
            ))),
        }
    }
}
