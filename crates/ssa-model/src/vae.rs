//! Encoder/decoder collaborator of the ELBO.
//!
//! Architecture (`BetaVaeMlp`):
//!
//! ```text
//! encoder: x ─ Linear(in→H) ─ LReLU ─ [Linear(H→H) ─ LReLU] × (enc_layers-1) ─ Linear(H→2·z_dim)
//!          └→ mus = out[:, :z_dim], logvars = out[:, z_dim:]
//! decoder: z ─ Linear(z_dim→H) ─ LReLU ─ [Linear(H→H) ─ LReLU] × (dec_layers-1) ─ Linear(H→input_dim)
//! ```

use candle_core::{Tensor, D};
use candle_nn::{linear, Linear, Module, VarBuilder};
use rand::RngCore;
use rand_distr::{Distribution, StandardNormal};
use ssa_core::{SsaConfig, SsaError, DTYPE};

/// Everything the ELBO needs from one encode/decode pass.
#[derive(Debug, Clone)]
pub struct VaeOutput {
    /// Decoder output `[batch, input_dim]` (logits for Bernoulli).
    pub x_recon: Tensor,
    /// Posterior means `[batch, z_dim]`.
    pub mus: Tensor,
    /// Posterior log-variances `[batch, z_dim]`.
    pub logvars: Tensor,
    /// Latent sample `[batch, z_dim]` the decoder was run on.
    pub zs: Tensor,
}

/// A Gaussian-posterior encoder paired with a decoder.
pub trait EncoderDecoder {
    /// Posterior parameters `(mus, logvars)`, each `[batch, z_dim]`.
    fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor), SsaError>;

    /// Decoder output for latents `z [batch, z_dim]`.
    fn decode(&self, z: &Tensor) -> Result<Tensor, SsaError>;

    /// Encodes, draws `z = mu + exp(logvar/2)·ε` with `ε` from `rng`, and
    /// decodes. Without an `rng` the posterior mean is decoded.
    fn encode_decode(
        &self,
        x: &Tensor,
        rng: Option<&mut dyn RngCore>,
    ) -> Result<VaeOutput, SsaError> {
        let (mus, logvars) = self.encode(x)?;
        let zs = match rng {
            Some(rng) => reparameterize(&mus, &logvars, rng)?,
            None => mus.clone(),
        };
        let x_recon = self.decode(&zs)?;
        Ok(VaeOutput {
            x_recon,
            mus,
            logvars,
            zs,
        })
    }
}

/// `mu + exp(logvar / 2) · ε`, `ε ~ N(0, I)` drawn on the host.
///
/// # Errors
///
/// Returns [`SsaError::Internal`] on tensor failures.
pub fn reparameterize(
    mu: &Tensor,
    logvar: &Tensor,
    rng: &mut dyn RngCore,
) -> Result<Tensor, SsaError> {
    let map_err = |e: candle_core::Error| SsaError::Internal {
        message: format!("reparameterize: {e}"),
    };
    let eps: Vec<f64> = (0..mu.elem_count())
        .map(|_| StandardNormal.sample(&mut *rng))
        .collect();
    let eps = Tensor::from_vec(eps, mu.shape(), mu.device()).map_err(map_err)?;
    let std = logvar.affine(0.5, 0.0).and_then(|t| t.exp()).map_err(map_err)?;
    (std * eps).and_then(|t| t + mu).map_err(map_err)
}

/// Elementwise `max(x, slope·x)`.
fn leaky_relu(x: &Tensor, slope: f64) -> candle_core::Result<Tensor> {
    x.maximum(&x.affine(slope, 0.0)?)
}

/// Sizes of a [`BetaVaeMlp`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VaeShape {
    /// Encoder input width (observations plus any domain embedding).
    pub encoder_in: usize,
    /// Decoder output width.
    pub decoder_out: usize,
    pub z_dim: usize,
    pub hidden_dim: usize,
    pub encoder_n_layers: usize,
    pub decoder_n_layers: usize,
    pub slope: f64,
}

impl VaeShape {
    pub fn from_config(config: &SsaConfig) -> Self {
        Self {
            encoder_in: config.input_dim + config.embedding_dim,
            decoder_out: config.input_dim,
            z_dim: config.z_dim(),
            hidden_dim: config.hidden_dim,
            encoder_n_layers: config.encoder_n_layers,
            decoder_n_layers: config.decoder_n_layers,
            slope: config.vae_slope,
        }
    }
}

/// LeakyReLU MLP β-VAE.
pub struct BetaVaeMlp {
    encoder: Vec<Linear>,
    encoder_out: Linear,
    decoder: Vec<Linear>,
    decoder_out: Linear,
    shape: VaeShape,
}

impl std::fmt::Debug for BetaVaeMlp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BetaVaeMlp({}→{}×{}→2·{} | {}→{}×{}→{})",
            self.shape.encoder_in,
            self.shape.hidden_dim,
            self.shape.encoder_n_layers,
            self.shape.z_dim,
            self.shape.z_dim,
            self.shape.hidden_dim,
            self.shape.decoder_n_layers,
            self.shape.decoder_out,
        )
    }
}

impl BetaVaeMlp {
    /// Creates the network under `vb` (`encoder.{i}`, `encoder.out`,
    /// `decoder.{i}`, `decoder.out`).
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] for zero layer counts and
    /// [`SsaError::Internal`] if parameter creation fails.
    pub fn new(vb: VarBuilder, shape: VaeShape) -> Result<Self, SsaError> {
        if shape.encoder_n_layers == 0 || shape.decoder_n_layers == 0 {
            return Err(SsaError::config("encoder and decoder need at least one layer"));
        }
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("BetaVaeMlp new: {e}"),
        };
        let h = shape.hidden_dim;

        let enc = vb.pp("encoder");
        let mut encoder = Vec::with_capacity(shape.encoder_n_layers);
        for i in 0..shape.encoder_n_layers {
            let in_dim = if i == 0 { shape.encoder_in } else { h };
            encoder.push(linear(in_dim, h, enc.pp(i.to_string())).map_err(map_err)?);
        }
        let encoder_out = linear(h, 2 * shape.z_dim, enc.pp("out")).map_err(map_err)?;

        let dec = vb.pp("decoder");
        let mut decoder = Vec::with_capacity(shape.decoder_n_layers);
        for i in 0..shape.decoder_n_layers {
            let in_dim = if i == 0 { shape.z_dim } else { h };
            decoder.push(linear(in_dim, h, dec.pp(i.to_string())).map_err(map_err)?);
        }
        let decoder_out = linear(h, shape.decoder_out, dec.pp("out")).map_err(map_err)?;

        Ok(Self {
            encoder,
            encoder_out,
            decoder,
            decoder_out,
            shape,
        })
    }

    pub fn shape(&self) -> &VaeShape {
        &self.shape
    }

    fn run(&self, hidden: &[Linear], out: &Linear, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut h = x.clone();
        for layer in hidden {
            h = leaky_relu(&layer.forward(&h)?, self.shape.slope)?;
        }
        out.forward(&h)
    }

    fn check_width(&self, t: &Tensor, width: usize, what: &str) -> Result<(), SsaError> {
        match t.dims() {
            [_, w] if *w == width => Ok(()),
            dims => Err(SsaError::shape(format!(
                "{what} expects [batch, {width}], got {dims:?}"
            ))),
        }
    }
}

impl EncoderDecoder for BetaVaeMlp {
    fn encode(&self, x: &Tensor) -> Result<(Tensor, Tensor), SsaError> {
        self.check_width(x, self.shape.encoder_in, "encoder")?;
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("BetaVaeMlp encode: {e}"),
        };
        let z = self.shape.z_dim;
        let dist = self
            .run(&self.encoder, &self.encoder_out, &x.to_dtype(DTYPE).map_err(map_err)?)
            .map_err(map_err)?;
        let mus = dist.narrow(D::Minus1, 0, z).map_err(map_err)?;
        let logvars = dist.narrow(D::Minus1, z, z).map_err(map_err)?;
        Ok((mus, logvars))
    }

    fn decode(&self, z: &Tensor) -> Result<Tensor, SsaError> {
        self.check_width(z, self.shape.z_dim, "decoder")?;
        self.run(&self.decoder, &self.decoder_out, z)
            .map_err(|e| SsaError::Internal {
                message: format!("BetaVaeMlp decode: {e}"),
            })
    }
}
