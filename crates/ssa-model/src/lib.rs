//! # ssa-model
//!
//! Training core of stationary subspace analysis.
//!
//! ## Architecture
//!
//! ```text
//! batch ─→ [x | embed(c)] ─→ BetaVaeMlp ─→ (x̂, μ, log σ², z)
//!                                             │
//!              ElboComposer ←─────────────────┘
//!              ├─ recon(x, x̂)
//!              ├─ KL_content: z[:, :c] vs N(0, I)
//!              └─ KL_style:   z[:, c:] vs FlowBank routed by c
//! ```
//!
//! ## Key Components
//!
//! - [`SsaModel`]: owns every parameter; `training_step`/`validation_step`
//! - [`ElboComposer`]: the negative ELBO and its four logged terms
//! - [`Step`] / [`StepState`]: explicit Forward → LossCompute →
//!   (MetricCompute) → Log lifecycle
//! - [`SsaOptimizer`]: AdamW or RMSprop as configured
//! - [`EncoderDecoder`]: seam for the VAE network

pub mod elbo;
pub mod model;
pub mod optim;
pub mod step;
pub mod vae;

pub use elbo::{ElboComposer, ElboScalars, ElboTerms};
pub use model::{to_matrix, SsaModel};
pub use optim::{ParamsRmsProp, RmsProp, SsaOptimizer};
pub use step::{Step, StepMode, StepOutcome, StepState};
pub use vae::{BetaVaeMlp, EncoderDecoder, VaeOutput, VaeShape};
