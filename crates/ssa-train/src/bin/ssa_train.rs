//! Stationary subspace analysis training CLI.
//!
//! Trains an SSA model on a safetensors dataset (`x`, `c`, optional `y`)
//! or, without `--data`, on freshly generated synthetic data. Every fifth
//! row is held out for validation.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p ssa-train -- \
//!   --config run.json \
//!   --output checkpoints/ssa.safetensors \
//!   --history history.json \
//!   --steps 5000 --batch-size 64 --lr 1e-3
//! ```
//!
//! Set `RUST_LOG=debug` for per-step metric output.

use std::path::{Path, PathBuf};
use std::process;
use std::time::Instant;

use candle_core::Device;
use clap::Parser;
use ssa_core::{SsaError, TracingSink};
use ssa_model::SsaModel;
use ssa_train::{generate_synthetic, train, Dataset, RunConfig, TrainResult};
use tracing_subscriber::EnvFilter;

/// Rows split off for validation: every `VALIDATION_EVERY`-th.
const VALIDATION_EVERY: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "ssa-train")]
#[command(about = "Train a stationary subspace analysis VAE")]
struct Args {
    /// JSON run config with optional `model`, `train` and `synthetic` sections.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Safetensors dataset; synthetic data is generated when absent.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Checkpoint written after training.
    #[arg(long, default_value = "ssa.safetensors")]
    output: PathBuf,

    /// JSON file receiving the loss history and validation records.
    #[arg(long)]
    history: Option<PathBuf>,

    #[arg(long)]
    steps: Option<usize>,

    #[arg(long)]
    batch_size: Option<usize>,

    #[arg(long)]
    lr: Option<f64>,

    #[arg(long)]
    seed: Option<u64>,

    /// Overrides `synthetic.samples_per_domain`.
    #[arg(long)]
    samples_per_domain: Option<usize>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    let args = Args::parse();
    if let Err(e) = run(&args) {
        eprintln!("ERROR: {e}");
        process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), SsaError> {
    let mut run = match &args.config {
        Some(path) => RunConfig::from_json_file(path)?,
        None => RunConfig::default(),
    };
    if let Some(steps) = args.steps {
        run.train.num_steps = steps;
    }
    if let Some(batch_size) = args.batch_size {
        run.train.batch_size = batch_size;
    }
    if let Some(lr) = args.lr {
        run.model.lr = lr;
    }
    if let Some(seed) = args.seed {
        run.train.seed = seed;
        run.synthetic.seed = seed;
    }
    if let Some(n) = args.samples_per_domain {
        run.synthetic.samples_per_domain = n;
    }

    let start = Instant::now();
    let data = match &args.data {
        Some(path) => {
            let data = Dataset::load_safetensors(path)?;
            run.model.input_dim = data.input_dim();
            run.model.nclass = run.model.nclass.max(data.nclass());
            data.check_factor_width(run.model.z_dim())?;
            data
        }
        None => {
            run.align_model_to_synthetic();
            generate_synthetic(&run.synthetic)?
        }
    };
    let (train_data, val_data) = data.split_every(VALIDATION_EVERY)?;
    tracing::info!(
        rows = data.len(),
        train_rows = train_data.len(),
        val_rows = val_data.len(),
        elapsed_s = start.elapsed().as_secs_f32(),
        "data ready"
    );

    let model = SsaModel::new(run.model.clone(), &Device::Cpu)?;
    let val = val_data.has_ground_truth().then_some(&val_data);
    if val.is_none() {
        tracing::warn!("dataset has no ground-truth factors; validation disabled");
    }

    let start = Instant::now();
    let result = train(&model, &train_data, val, &run.train, &mut TracingSink)?;
    tracing::info!(
        steps = result.steps_completed,
        final_loss = result.final_loss(),
        final_lr = result.final_lr,
        best_r2 = result.best.best_r2,
        best_mcc = result.best.best_mcc,
        elapsed_s = start.elapsed().as_secs_f32(),
        "training finished"
    );

    if let Some(parent) = args.output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| SsaError::Storage {
            message: format!("create {}: {e}", parent.display()),
        })?;
    }
    model.save(&args.output)?;
    tracing::info!(path = %args.output.display(), "checkpoint saved");

    if let Some(path) = &args.history {
        write_history(path, &run, &result)?;
        tracing::info!(path = %path.display(), "history saved");
    }
    Ok(())
}

fn write_history(path: &Path, run: &RunConfig, result: &TrainResult) -> Result<(), SsaError> {
    let validations: Vec<serde_json::Value> = result
        .validations
        .iter()
        .map(|v| {
            serde_json::json!({
                "step": v.step,
                "elbo_loss": v.elbo.loss,
                "recon_loss": v.elbo.recon,
                "kld_content": v.elbo.kld_content,
                "kld_style": v.elbo.kld_style,
                "r2": v.scores.r2,
                "mcc": v.scores.mcc,
                "lr": v.lr,
            })
        })
        .collect();
    let best: serde_json::Map<String, serde_json::Value> = result
        .best
        .reported()
        .iter()
        .map(|(name, value)| (name.to_string(), serde_json::json!(value)))
        .collect();
    let history = serde_json::json!({
        "config": run,
        "steps_completed": result.steps_completed,
        "final_lr": result.final_lr,
        "loss_history": result.loss_history,
        "validations": validations,
        "best": best,
    });
    let text = serde_json::to_string_pretty(&history).map_err(|e| SsaError::Storage {
        message: format!("encode history: {e}"),
    })?;
    std::fs::write(path, text).map_err(|e| SsaError::Storage {
        message: format!("write {}: {e}", path.display()),
    })
}
