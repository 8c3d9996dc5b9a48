//! # ssa-core
//!
//! Shared vocabulary for the stationary subspace analysis (SSA) workspace.
//!
//! An SSA model is a VAE whose latent vector is split positionally into a
//! stationary *content* block and a domain-conditional *style* block:
//!
//! ```text
//! z = [ z_c (c_dim) | z_s (s_dim) ]
//! ```
//!
//! ## Key Types
//!
//! - [`SsaConfig`]: construction-time configuration (dimensions, flow
//!   hyperparameters, loss weights, decoder family, optimizer, metrics)
//! - [`Batch`]: one mini-batch of inputs, domain labels and optional ground truth
//! - [`LatentLayout`]: the content/style split of the latent vector
//! - [`MetricSink`]: destination for named scalar observations
//! - [`SsaError`]: the error type shared by every crate
//!
//! ## Architecture Rules
//!
//! - No model code here, only types every other crate agrees on.
//! - All tensors use [`DTYPE`] (`f64`) so loss bookkeeping stays exact
//!   to well below `1e-6`.

pub mod batch;
pub mod config;
pub mod error;
pub mod latent;
pub mod sink;

pub use batch::Batch;
pub use config::{
    CorrelationMethod, DecoderDist, FlowOrder, OptimizerKind, R2Config, R2Estimator,
    SchedulerKind, SsaConfig,
};
pub use error::SsaError;
pub use latent::LatentLayout;
pub use sink::{MemorySink, MetricSink, TracingSink};

/// Element type of every tensor the workspace creates.
pub const DTYPE: candle_core::DType = candle_core::DType::F64;
