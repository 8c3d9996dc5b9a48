//! # ssa-train
//!
//! Drives an [`ssa_model::SsaModel`] over a dataset.
//!
//! ## Key Components
//!
//! - [`Dataset`]: host-resident `x`, domain labels and optional ground truth
//! - [`generate_synthetic`]: nonstationary data with known factors
//! - [`train`]: the step loop with periodic validation
//! - [`ReduceLrOnPlateau`]: learning-rate schedule on the validation loss
//! - [`RunConfig`]: the JSON file read by the `ssa-train` binary

pub mod config;
pub mod dataset;
pub mod scheduler;
pub mod synthetic;
pub mod trainer;

pub use config::RunConfig;
pub use dataset::Dataset;
pub use scheduler::{ReduceLrOnPlateau, MIN_LR};
pub use synthetic::{generate_synthetic, SyntheticConfig};
pub use trainer::{train, TrainConfig, TrainResult, ValidationRecord};
