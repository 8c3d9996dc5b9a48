//! # ssa-metrics
//!
//! Identifiability metrics for a trained SSA model.
//!
//! ## Key Components
//!
//! - [`compute_r2`]: how well the content block is recovered (regression R²)
//! - [`compute_mcc`]: how well the style block is recovered, up to
//!   permutation and sign (mean correlation coefficient)
//! - [`RunningBest`]: best-so-far bookkeeping with a pure update
//! - [`MetricTracker`]: both metrics for one evaluation step
//!
//! Everything here works on host `nalgebra` matrices, sample-major
//! (`[samples, factors]`).

pub mod assignment;
pub mod best;
pub mod correlation;
pub mod mcc;
pub mod r2;
pub mod tracker;

pub use best::RunningBest;
pub use mcc::compute_mcc;
pub use r2::{compute_r2, r2_score};
pub use tracker::{EvalReport, EvalScores, MetricTracker};
