//! # ssa-flow
//!
//! Domain-conditional density model for the style subspace.
//!
//! Each domain owns a [`NormalizingFlow`] that maps the style residual
//! `z_s` onto a fixed standard normal ([`BaseDistribution`]). The model
//! log-density of a residual under domain `k` follows change of variables:
//!
//! ```text
//! log p(z_s | k) = log N(flow_k(z_s); 0, I) + log|det ∂flow_k/∂z_s|
//! ```
//!
//! ## Key Components
//!
//! - [`spline::RationalSpline`]: element-wise monotonic rational spline layer
//! - [`NormalizingFlow`]: stacked spline layers with forward/inverse and
//!   safetensors warm start
//! - [`FlowBank`]: `nclass` flows with masked batched routing
//!
//! ## Architecture Rules
//!
//! - All parameters live in a caller-supplied `candle_nn::VarMap`.
//! - Warm-start loads are all-or-nothing.

pub mod bank;
pub mod base;
pub mod flow;
pub mod spline;

pub use bank::{FlowBank, Routed};
pub use base::BaseDistribution;
pub use flow::{FlowConfig, NormalizingFlow};
