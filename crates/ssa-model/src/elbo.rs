//! Negative ELBO of the SSA model.
//!
//! ```text
//! loss = recon + β·KL_content + γ·KL_style
//!
//! recon      = (1/B) Σ_rows Σ_features nll(x, x̂)
//! KL_content = (1/B) Σ_rows Σ_{j<c}  [log N(z_j; μ_j, σ_j) − log N(z_j; 0, 1)]
//! KL_style   = (1/B) Σ_rows ( Σ_{j≥c} log N(z_j; μ_j, σ_j) − log p(z_s | domain) )
//! log p(z_s | k) = log N(flow_k(z_s); 0, I) + log|det ∂flow_k/∂z_s|
//! ```
//!
//! Both KL terms are single-sample Monte Carlo estimates at the drawn `zs`.

use candle_core::Tensor;
use ssa_core::{DecoderDist, LatentLayout, MetricSink, SsaConfig, SsaError};
use ssa_flow::FlowBank;

use crate::vae::VaeOutput;

/// Natural log of `sqrt(2π)`.
const LN_SQRT_2PI: f64 = 0.918_938_533_204_672_7;

/// The four loss tensors of one step. `loss` carries the autodiff graph.
#[derive(Debug, Clone)]
pub struct ElboTerms {
    pub loss: Tensor,
    pub recon: Tensor,
    pub kld_content: Tensor,
    pub kld_style: Tensor,
}

/// Host copies of [`ElboTerms`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElboScalars {
    pub loss: f64,
    pub recon: f64,
    pub kld_content: f64,
    pub kld_style: f64,
}

impl ElboTerms {
    /// Reads the four scalars back to the host.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Internal`] if a term is not a scalar.
    pub fn scalars(&self) -> Result<ElboScalars, SsaError> {
        let read = |t: &Tensor, name: &str| {
            t.to_scalar::<f64>().map_err(|e| SsaError::Internal {
                message: format!("reading {name}: {e}"),
            })
        };
        Ok(ElboScalars {
            loss: read(&self.loss, "loss")?,
            recon: read(&self.recon, "recon")?,
            kld_content: read(&self.kld_content, "kld_content")?,
            kld_style: read(&self.kld_style, "kld_style")?,
        })
    }
}

impl ElboScalars {
    /// Emits `{prefix}_elbo_loss`, `{prefix}_recon_loss`,
    /// `{prefix}_kld_content` and `{prefix}_kld_style`.
    pub fn log(&self, prefix: &str, sink: &mut dyn MetricSink) {
        sink.log_scalar(&format!("{prefix}_elbo_loss"), self.loss);
        sink.log_scalar(&format!("{prefix}_recon_loss"), self.recon);
        sink.log_scalar(&format!("{prefix}_kld_content"), self.kld_content);
        sink.log_scalar(&format!("{prefix}_kld_style"), self.kld_style);
    }
}

/// Combines reconstruction, content KLD and flow-routed style KLD.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElboComposer {
    pub layout: LatentLayout,
    pub beta: f64,
    pub gamma: f64,
    pub decoder_dist: DecoderDist,
}

impl ElboComposer {
    pub fn from_config(config: &SsaConfig) -> Self {
        Self {
            layout: LatentLayout::new(config.c_dim, config.s_dim),
            beta: config.beta,
            gamma: config.gamma,
            decoder_dist: config.decoder_dist,
        }
    }

    /// Composes the negative ELBO for target `x` and one encode/decode pass.
    ///
    /// # Errors
    ///
    /// - [`SsaError::EmptyBatch`] if `x` has no rows (checked first).
    /// - [`SsaError::ShapeMismatch`] for inconsistent shapes or labels.
    /// - [`SsaError::Internal`] on tensor failures.
    pub fn compose(
        &self,
        x: &Tensor,
        out: &VaeOutput,
        labels: &[u32],
        flows: &FlowBank,
    ) -> Result<ElboTerms, SsaError> {
        let rows = x.dims().first().copied().unwrap_or(0);
        if rows == 0 {
            return Err(SsaError::EmptyBatch);
        }
        if labels.len() != rows {
            return Err(SsaError::shape(format!(
                "{rows} rows but {} domain labels",
                labels.len()
            )));
        }
        if out.x_recon.dims() != x.dims() {
            return Err(SsaError::shape(format!(
                "reconstruction {:?} does not match target {:?}",
                out.x_recon.dims(),
                x.dims()
            )));
        }
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("ElboComposer compose: {e}"),
        };

        let recon = reconstruction_loss(self.decoder_dist, x, &out.x_recon, rows)?;

        // Per-dimension log q(z | x) at the drawn sample.
        let log_qz = normal_log_prob(&out.zs, &out.mus, &out.logvars).map_err(map_err)?;

        let zs_content = self.layout.content(&out.zs)?;
        let log_qz_content = self.layout.content(&log_qz)?;
        let log_pz_content = standard_normal_log_prob(&zs_content).map_err(map_err)?;
        let kld_content = (log_qz_content - log_pz_content)
            .and_then(|t| t.sum(1))
            .and_then(|t| t.mean_all())
            .map_err(map_err)?;

        let residuals = self.layout.style(&out.zs)?;
        let log_qz_style = self.layout.style(&log_qz)?;
        let routed = flows.route(&residuals, labels)?;
        let log_pz_style = (flows.base().log_prob(&routed.e)? + &routed.logdet).map_err(map_err)?;
        let kld_style = log_qz_style
            .sum(1)
            .and_then(|t| t - log_pz_style)
            .and_then(|t| t.mean_all())
            .map_err(map_err)?;

        let weighted_content = kld_content.affine(self.beta, 0.0).map_err(map_err)?;
        let weighted_style = kld_style.affine(self.gamma, 0.0).map_err(map_err)?;
        let loss = (&recon + &weighted_content)
            .and_then(|t| t + &weighted_style)
            .map_err(map_err)?;

        Ok(ElboTerms {
            loss,
            recon,
            kld_content,
            kld_style,
        })
    }
}

/// Summed-over-features negative log-likelihood averaged over rows.
fn reconstruction_loss(
    dist: DecoderDist,
    x: &Tensor,
    x_recon: &Tensor,
    rows: usize,
) -> Result<Tensor, SsaError> {
    let map_err = |e: candle_core::Error| SsaError::Internal {
        message: format!("reconstruction loss ({dist}): {e}"),
    };
    let scale = 1.0 / rows as f64;
    match dist {
        DecoderDist::Gaussian => (x_recon - x)
            .and_then(|d| d.sqr())
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(scale, 0.0))
            .map_err(map_err),
        DecoderDist::SigmoidGaussian => candle_nn::ops::sigmoid(x_recon)
            .and_then(|p| p - x)
            .and_then(|d| d.sqr())
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(scale, 0.0))
            .map_err(map_err),
        DecoderDist::Bernoulli => bce_with_logits(x_recon, x)
            .and_then(|t| t.sum_all())
            .and_then(|t| t.affine(scale, 0.0))
            .map_err(map_err),
    }
}

/// Elementwise `max(l, 0) − l·t + log(1 + exp(−|l|))`.
fn bce_with_logits(logits: &Tensor, targets: &Tensor) -> candle_core::Result<Tensor> {
    let relu = logits.relu()?;
    let soft = logits.abs()?.neg()?.exp()?.affine(1.0, 1.0)?.log()?;
    (relu - (logits * targets)?)? + soft
}

/// `log N(z; mu, exp(logvar/2))`, elementwise.
fn normal_log_prob(z: &Tensor, mu: &Tensor, logvar: &Tensor) -> candle_core::Result<Tensor> {
    let sq = (z - mu)?.sqr()?;
    let var2 = logvar.exp()?.affine(2.0, 0.0)?;
    let quad = (sq / var2)?;
    quad.neg()? - logvar.affine(0.5, LN_SQRT_2PI)?
}

/// `log N(z; 0, 1)`, elementwise.
fn standard_normal_log_prob(z: &Tensor) -> candle_core::Result<Tensor> {
    z.sqr()?.affine(-0.5, -LN_SQRT_2PI)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use candle_core::Device;
    use candle_nn::VarMap;
    use ssa_core::{FlowOrder, MemorySink, DTYPE};
    use ssa_flow::FlowConfig;

    fn bank(var_map: &VarMap, s_dim: usize, nclass: usize) -> FlowBank {
        let config = FlowConfig {
            input_dim: s_dim,
            n_layers: 1,
            bound: 5.0,
            count_bins: 8,
            order: FlowOrder::Linear,
        };
        FlowBank::new(var_map, nclass, config, &Device::Cpu).unwrap()
    }

    fn composer(dist: DecoderDist) -> ElboComposer {
        ElboComposer {
            layout: LatentLayout::new(2, 2),
            beta: 0.0025,
            gamma: 0.001,
            decoder_dist: dist,
        }
    }

    fn t(data: &[f64], rows: usize, cols: usize) -> Tensor {
        Tensor::from_vec(data.to_vec(), (rows, cols), &Device::Cpu).unwrap()
    }

    #[test]
    fn content_kld_vanishes_at_prior() {
        let var_map = VarMap::new();
        let flows = bank(&var_map, 2, 2);
        let zeros = Tensor::zeros((3, 4), DTYPE, &Device::Cpu).unwrap();
        let x = Tensor::zeros((3, 5), DTYPE, &Device::Cpu).unwrap();
        let out = VaeOutput {
            x_recon: x.clone(),
            mus: zeros.clone(),
            logvars: zeros.clone(),
            zs: zeros,
        };
        let terms = composer(DecoderDist::Gaussian)
            .compose(&x, &out, &[0, 1, 0], &flows)
            .unwrap();
        let s = terms.scalars().unwrap();
        assert_abs_diff_eq!(s.kld_content, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(s.recon, 0.0, epsilon = 1e-12);
    }

    #[test]
    fn loss_is_weighted_sum() {
        let var_map = VarMap::new();
        let flows = bank(&var_map, 2, 2);
        let x = t(&[0.5, -1.0, 2.0, 0.0, 1.0, 1.5], 2, 3);
        let out = VaeOutput {
            x_recon: t(&[0.4, -0.7, 1.0, 0.2, 0.9, 1.0], 2, 3),
            mus: t(&[0.1, -0.2, 0.3, 0.4, 0.0, 0.5, -0.5, 1.0], 2, 4),
            logvars: t(&[-0.1, 0.2, -0.3, 0.0, 0.1, -0.2, 0.3, -0.4], 2, 4),
            zs: t(&[0.2, -0.1, 0.6, 0.1, -0.3, 0.7, -0.2, 1.4], 2, 4),
        };
        for dist in [
            DecoderDist::Gaussian,
            DecoderDist::Bernoulli,
            DecoderDist::SigmoidGaussian,
        ] {
            let c = composer(dist);
            let s = c.compose(&x, &out, &[1, 0], &flows).unwrap().scalars().unwrap();
            let expected = s.recon + c.beta * s.kld_content + c.gamma * s.kld_style;
            assert_abs_diff_eq!(s.loss, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn gaussian_recon_is_mean_row_sse() {
        let var_map = VarMap::new();
        let flows = bank(&var_map, 2, 1);
        let x = t(&[1.0, 2.0, 3.0, 4.0], 2, 2);
        let zeros = Tensor::zeros((2, 4), DTYPE, &Device::Cpu).unwrap();
        let out = VaeOutput {
            x_recon: t(&[0.0, 2.0, 3.0, 2.0], 2, 2),
            mus: zeros.clone(),
            logvars: zeros.clone(),
            zs: zeros,
        };
        let s = composer(DecoderDist::Gaussian)
            .compose(&x, &out, &[0, 0], &flows)
            .unwrap()
            .scalars()
            .unwrap();
        // (1 + 4) / 2
        assert_abs_diff_eq!(s.recon, 2.5, epsilon = 1e-12);
    }

    #[test]
    fn bce_with_logits_matches_direct_formula() {
        let logits = t(&[-3.0, 0.0, 2.5], 1, 3);
        let targets = t(&[0.0, 1.0, 1.0], 1, 3);
        let got = bce_with_logits(&logits, &targets)
            .unwrap()
            .to_vec2::<f64>()
            .unwrap()[0]
            .clone();
        let sigmoid = |v: f64| 1.0 / (1.0 + (-v).exp());
        let expected = [
            -(1.0 - sigmoid(-3.0)).ln(),
            -sigmoid(0.0).ln(),
            -sigmoid(2.5).ln(),
        ];
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(g, e, epsilon = 1e-12);
        }
    }

    #[test]
    fn empty_batch_rejected_before_loss_math() {
        let var_map = VarMap::new();
        let flows = bank(&var_map, 2, 2);
        let empty = Tensor::zeros((0, 3), DTYPE, &Device::Cpu).unwrap();
        let z = Tensor::zeros((0, 4), DTYPE, &Device::Cpu).unwrap();
        let out = VaeOutput {
            x_recon: empty.clone(),
            mus: z.clone(),
            logvars: z.clone(),
            zs: z,
        };
        let err = composer(DecoderDist::Gaussian)
            .compose(&empty, &out, &[], &flows)
            .unwrap_err();
        assert!(matches!(err, SsaError::EmptyBatch));
    }

    #[test]
    fn scalars_log_with_prefix() {
        let s = ElboScalars {
            loss: 1.0,
            recon: 2.0,
            kld_content: 3.0,
            kld_style: 4.0,
        };
        let mut sink = MemorySink::default();
        s.log("val", &mut sink);
        assert_eq!(sink.last("val_elbo_loss"), Some(1.0));
        assert_eq!(sink.last("val_recon_loss"), Some(2.0));
        assert_eq!(sink.last("val_kld_content"), Some(3.0));
        assert_eq!(sink.last("val_kld_style"), Some(4.0));
    }
}
