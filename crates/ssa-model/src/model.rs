//! The SSA model: β-VAE, optional domain embedding and per-domain flows.

use std::path::Path;

use candle_core::{Device, Tensor, D};
use candle_nn::{embedding, Embedding, Module, VarBuilder, VarMap};
use nalgebra::DMatrix;
use rand::RngCore;
use ssa_core::{Batch, MetricSink, SsaConfig, SsaError, DTYPE};
use ssa_flow::{FlowBank, FlowConfig};
use ssa_metrics::{MetricTracker, RunningBest};

use crate::elbo::ElboComposer;
use crate::optim::SsaOptimizer;
use crate::step::{Step, StepOutcome, StepState};
use crate::vae::{BetaVaeMlp, EncoderDecoder, VaeOutput, VaeShape};

/// All trainable state of a stationary subspace analysis model.
///
/// Every parameter lives in one [`VarMap`] (`net.*`, `embed.*`,
/// `flows.{k}.*`), so a single optimizer trains the VAE and the flows
/// jointly and a single safetensors file checkpoints the model.
///
/// # Example
///
/// ```
/// use candle_core::{Device, Tensor};
/// use rand::SeedableRng;
/// use ssa_core::{Batch, MemorySink, SsaConfig, DTYPE};
/// use ssa_model::SsaModel;
///
/// let config = SsaConfig { input_dim: 3, c_dim: 1, s_dim: 1, nclass: 2, hidden_dim: 8, ..SsaConfig::default() };
/// let model = SsaModel::new(config, &Device::Cpu).unwrap();
///
/// let x = Tensor::zeros((4, 3), DTYPE, &Device::Cpu).unwrap();
/// let batch = Batch::new(x, vec![0, 1, 0, 1], None).unwrap();
/// let mut rng = rand::rngs::StdRng::seed_from_u64(0);
/// let mut sink = MemorySink::default();
/// let outcome = model.training_step(&batch, &mut rng, &mut sink).unwrap();
/// assert!(outcome.scalars.loss.is_finite());
/// ```
pub struct SsaModel {
    var_map: VarMap,
    embedding: Option<Embedding>,
    net: BetaVaeMlp,
    flows: FlowBank,
    elbo: ElboComposer,
    tracker: MetricTracker,
    config: SsaConfig,
    device: Device,
}

impl std::fmt::Debug for SsaModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "SsaModel(c_dim={}, s_dim={}, nclass={}, {:?}, {} flow layers × {} bins, {} vars, device={:?})",
            self.config.c_dim,
            self.config.s_dim,
            self.config.nclass,
            self.net,
            self.config.n_flow_layers,
            self.config.count_bins,
            self.var_map.all_vars().len(),
            self.device,
        )
    }
}

impl SsaModel {
    /// Builds a freshly initialized model, warm-starting every flow from
    /// `spline_pth` when `use_warm_start` is set.
    ///
    /// # Errors
    ///
    /// - [`SsaError::InvalidConfig`] if the configuration does not validate.
    /// - [`SsaError::Checkpoint`] if the warm start fails; no flow is
    ///   partially initialized from a bad file.
    pub fn new(config: SsaConfig, device: &Device) -> Result<Self, SsaError> {
        config.validate()?;
        let map_err = |e: candle_core::Error| SsaError::Internal {
            message: format!("SsaModel new: {e}"),
        };

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DTYPE, device);

        let embedding = if config.embedding_dim > 0 {
            Some(embedding(config.nclass, config.embedding_dim, vb.pp("embed")).map_err(map_err)?)
        } else {
            None
        };
        let net = BetaVaeMlp::new(vb.pp("net"), VaeShape::from_config(&config))?;
        let flows = FlowBank::new(&var_map, config.nclass, FlowConfig::from_ssa(&config), device)?;

        if config.use_warm_start {
            if let Some(path) = &config.spline_pth {
                flows.warm_start(path)?;
            }
        }

        tracing::info!(
            c_dim = config.c_dim,
            s_dim = config.s_dim,
            nclass = config.nclass,
            vars = var_map.all_vars().len(),
            "built SSA model"
        );

        Ok(Self {
            var_map,
            embedding,
            net,
            flows,
            elbo: ElboComposer::from_config(&config),
            tracker: MetricTracker::from_config(&config),
            config,
            device: device.clone(),
        })
    }

    pub fn config(&self) -> &SsaConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn var_map(&self) -> &VarMap {
        &self.var_map
    }

    pub fn flows(&self) -> &FlowBank {
        &self.flows
    }

    pub fn elbo(&self) -> &ElboComposer {
        &self.elbo
    }

    pub fn tracker(&self) -> &MetricTracker {
        &self.tracker
    }

    /// The configured optimizer over every parameter.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Internal`] if optimizer state cannot be allocated.
    pub fn optimizer(&self) -> Result<SsaOptimizer, SsaError> {
        SsaOptimizer::new(self.config.optimizer, self.var_map.all_vars(), self.config.lr)
    }

    /// Encoder input: `x`, or `[x | embed(c)]` with a domain embedding.
    fn encoder_input(&self, batch: &Batch) -> Result<Tensor, SsaError> {
        let x = batch.x.to_dtype(DTYPE).map_err(|e| SsaError::Internal {
            message: format!("SsaModel input: {e}"),
        })?;
        let Some(embedding) = &self.embedding else {
            return Ok(x);
        };
        let labels = batch.labels_tensor(&self.device)?;
        embedding
            .forward(&labels)
            .and_then(|emb| Tensor::cat(&[&x, &emb], D::Minus1))
            .map_err(|e| SsaError::Internal {
                message: format!("SsaModel embedding: {e}"),
            })
    }

    /// One encode/decode pass; `rng = None` decodes the posterior mean.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::ShapeMismatch`] if the batch width does not
    /// match `input_dim`.
    pub fn forward(
        &self,
        batch: &Batch,
        rng: Option<&mut dyn RngCore>,
    ) -> Result<VaeOutput, SsaError> {
        let input = self.encoder_input(batch)?;
        self.net.encode_decode(&input, rng)
    }

    /// Performs the transition out of the step's current state.
    ///
    /// Returns the new state. Advancing a finished step is a no-op.
    ///
    /// # Errors
    ///
    /// Propagates forward, loss and metric failures; the step stays in the
    /// state that failed.
    pub fn advance(
        &self,
        step: &mut Step<'_>,
        rng: &mut dyn RngCore,
        sink: &mut dyn MetricSink,
    ) -> Result<StepState, SsaError> {
        match step.state {
            StepState::Forward => {
                step.output = Some(self.forward(step.batch, Some(rng))?);
            }
            StepState::LossCompute => {
                let output = step.output.as_ref().ok_or_else(|| missing("forward output"))?;
                let terms = self
                    .elbo
                    .compose(&step.batch.x, output, &step.batch.c, &self.flows)?;
                step.scalars = Some(terms.scalars()?);
                step.terms = Some(terms);
            }
            StepState::MetricCompute => {
                let output = step.output.as_ref().ok_or_else(|| missing("forward output"))?;
                let y = step.batch.y.as_ref().ok_or_else(|| {
                    SsaError::config("evaluation step requires ground-truth y")
                })?;
                let best = step.best.ok_or_else(|| missing("running best"))?;
                let report = self.tracker.evaluate_and_update(
                    &to_matrix(&output.mus)?,
                    &to_matrix(y)?,
                    best,
                )?;
                step.best = Some(report.best);
                step.report = Some(report);
            }
            StepState::Log => {
                let scalars = step.scalars.ok_or_else(|| missing("loss scalars"))?;
                if let Some(report) = &step.report {
                    report.log(sink);
                }
                scalars.log(step.mode.prefix(), sink);
                tracing::debug!(
                    mode = step.mode.prefix(),
                    loss = scalars.loss,
                    recon = scalars.recon,
                    kld_content = scalars.kld_content,
                    kld_style = scalars.kld_style,
                    "step"
                );
            }
            StepState::Finished => return Ok(StepState::Finished),
        }
        step.state = step.state.next(step.mode);
        Ok(step.state)
    }

    fn run(
        &self,
        mut step: Step<'_>,
        rng: &mut dyn RngCore,
        sink: &mut dyn MetricSink,
    ) -> Result<StepOutcome, SsaError> {
        while self.advance(&mut step, rng, sink)? != StepState::Finished {}
        step.into_outcome()
    }

    /// Forward, loss and logging for one training batch. The caller
    /// backpropagates `outcome.terms.loss`.
    ///
    /// # Errors
    ///
    /// Propagates [`SsaModel::advance`] failures.
    pub fn training_step(
        &self,
        batch: &Batch,
        rng: &mut dyn RngCore,
        sink: &mut dyn MetricSink,
    ) -> Result<StepOutcome, SsaError> {
        self.run(Step::train(batch), rng, sink)
    }

    /// Forward, loss, metrics and logging for one evaluation batch.
    /// `outcome.report.best` is the successor of `best`.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] if the batch has no `y`, and
    /// propagates [`SsaModel::advance`] failures.
    pub fn validation_step(
        &self,
        batch: &Batch,
        best: RunningBest,
        rng: &mut dyn RngCore,
        sink: &mut dyn MetricSink,
    ) -> Result<StepOutcome, SsaError> {
        self.run(Step::eval(batch, best)?, rng, sink)
    }

    /// Draws `n` style residuals for `domain` from its flow.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::InvalidConfig`] for an unknown domain.
    pub fn sample_style(
        &self,
        domain: usize,
        n: usize,
        rng: &mut dyn RngCore,
    ) -> Result<Tensor, SsaError> {
        self.flows.sample(domain, n, rng, &self.device)
    }

    /// Writes every parameter to a safetensors file.
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Checkpoint`] if writing fails.
    pub fn save(&self, path: &Path) -> Result<(), SsaError> {
        self.var_map.save(path).map_err(|e| SsaError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("save model: {e}"),
        })?;
        tracing::info!(path = %path.display(), "saved SSA checkpoint");
        Ok(())
    }

    /// Loads every parameter from a file written by [`SsaModel::save`].
    ///
    /// # Errors
    ///
    /// Returns [`SsaError::Checkpoint`] if the file is unreadable or a
    /// parameter is missing or mis-shaped.
    pub fn load(&mut self, path: &Path) -> Result<(), SsaError> {
        self.var_map.load(path).map_err(|e| SsaError::Checkpoint {
            path: path.to_path_buf(),
            message: format!("load model: {e}"),
        })?;
        tracing::info!(path = %path.display(), "loaded SSA checkpoint");
        Ok(())
    }
}

fn missing(what: &str) -> SsaError {
    SsaError::Internal {
        message: format!("step is missing its {what}"),
    }
}

/// Copies a `[rows, cols]` tensor into a host matrix.
///
/// # Errors
///
/// Returns [`SsaError::ShapeMismatch`] for tensors that are not 2-D.
pub fn to_matrix(t: &Tensor) -> Result<DMatrix<f64>, SsaError> {
    let (rows, cols) = t
        .dims2()
        .map_err(|e| SsaError::shape(format!("expected a matrix: {e}")))?;
    let data = t
        .to_dtype(DTYPE)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f64>())
        .map_err(|e| SsaError::Internal {
            message: format!("tensor to matrix: {e}"),
        })?;
    Ok(DMatrix::from_row_slice(rows, cols, &data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use ssa_core::{MemorySink, OptimizerKind};

    fn config() -> SsaConfig {
        SsaConfig {
            input_dim: 4,
            c_dim: 2,
            s_dim: 2,
            nclass: 2,
            hidden_dim: 16,
            ..SsaConfig::default()
        }
    }

    fn batch(rows: usize, with_y: bool) -> Batch {
        let x = Tensor::from_vec(
            (0..rows * 4).map(|i| (i as f64 * 0.37).sin()).collect::<Vec<_>>(),
            (rows, 4),
            &Device::Cpu,
        )
        .unwrap();
        let y = with_y.then(|| {
            Tensor::from_vec(
                (0..rows * 4).map(|i| (i as f64 * 0.91).cos()).collect::<Vec<_>>(),
                (rows, 4),
                &Device::Cpu,
            )
            .unwrap()
        });
        let c = (0..rows).map(|i| (i % 2) as u32).collect();
        Batch::new(x, c, y).unwrap()
    }

    #[test]
    fn embedding_widens_encoder_input() {
        let model = SsaModel::new(
            SsaConfig {
                embedding_dim: 3,
                ..config()
            },
            &Device::Cpu,
        )
        .unwrap();
        let input = model.encoder_input(&batch(5, false)).unwrap();
        assert_eq!(input.dims(), &[5, 7]);
        let out = model.forward(&batch(5, false), None).unwrap();
        assert_eq!(out.x_recon.dims(), &[5, 4]);
    }

    #[test]
    fn advance_walks_eval_states() {
        let model = SsaModel::new(config(), &Device::Cpu).unwrap();
        let b = batch(6, true);
        let mut step = Step::eval(&b, RunningBest::default()).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        let mut sink = MemorySink::default();
        let mut states = vec![step.state()];
        while step.state() != StepState::Finished {
            states.push(model.advance(&mut step, &mut rng, &mut sink).unwrap());
        }
        assert_eq!(
            states,
            vec![
                StepState::Forward,
                StepState::LossCompute,
                StepState::MetricCompute,
                StepState::Log,
                StepState::Finished
            ]
        );
        // Nothing reaches the sink before Log.
        assert_eq!(sink.records.len(), 4 + 8);
        let outcome = step.into_outcome().unwrap();
        assert!(outcome.report.is_some());
    }

    #[test]
    fn unfinished_step_has_no_outcome() {
        let model = SsaModel::new(config(), &Device::Cpu).unwrap();
        let b = batch(3, false);
        let mut step = Step::train(&b);
        model
            .advance(&mut step, &mut StdRng::seed_from_u64(0), &mut MemorySink::default())
            .unwrap();
        assert!(step.into_outcome().is_err());
    }

    #[test]
    fn validation_requires_ground_truth() {
        let model = SsaModel::new(config(), &Device::Cpu).unwrap();
        let err = model
            .validation_step(
                &batch(4, false),
                RunningBest::default(),
                &mut StdRng::seed_from_u64(0),
                &mut MemorySink::default(),
            )
            .unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }));
    }

    #[test]
    fn optimizer_follows_config() {
        let model = SsaModel::new(
            SsaConfig {
                optimizer: OptimizerKind::RmsProp,
                lr: 3e-3,
                ..config()
            },
            &Device::Cpu,
        )
        .unwrap();
        let opt = model.optimizer().unwrap();
        assert!(matches!(opt, SsaOptimizer::RmsProp(_)));
        assert_eq!(opt.learning_rate(), 3e-3);
    }

    #[test]
    fn invalid_config_rejected() {
        let err = SsaModel::new(
            SsaConfig {
                s_dim: 0,
                ..config()
            },
            &Device::Cpu,
        )
        .unwrap_err();
        assert!(matches!(err, SsaError::InvalidConfig { .. }));
    }

    #[test]
    fn to_matrix_is_row_major() {
        let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), &Device::Cpu)
            .unwrap();
        let m = to_matrix(&t).unwrap();
        assert_eq!(m.shape(), (2, 3));
        assert_eq!(m[(1, 0)], 4.0);
        assert_eq!(m[(0, 2)], 3.0);
    }
}
