//! The [`Trainer`]: owns parameters and an executor, and walks the
//! epoch/batch/sample state machine.

use std::sync::atomic::Ordering;
use std::time::Instant;

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::backend::Executor;
use crate::backprop::GradientSet;
use crate::dataset::Dataset;
use crate::error::{OcrError, Result};
use crate::model::NeuralNetworkParameters;
use crate::ops::cpu::sub_scaled_assign;
use crate::train::config::TrainConfig;
use crate::train::stats::{EpochStats, TrainingOutcome, TrainingReport};

/// Where the trainer currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrainingState {
    /// Not training.
    #[default]
    Idle,
    /// Shuffling for a new epoch (1-based).
    Epoch {
        /// Current epoch.
        epoch: usize,
    },
    /// Working through a batch.
    Batch {
        /// Current epoch.
        epoch: usize,
        /// 0-based batch index within the epoch.
        batch: usize,
    },
    /// Back-propagating one sample of a batch.
    Sample {
        /// Current epoch.
        epoch: usize,
        /// 0-based batch index within the epoch.
        batch: usize,
        /// 0-based sample index within the batch.
        sample: usize,
    },
    /// The last run ended because the loss converged.
    EarlyStopped,
}

/// Owns the parameters and the executor, and runs SGD over a [`Dataset`].
///
/// # Example
///
/// ```rust
/// use simple_ocr::dataset::Dataset;
/// use simple_ocr::train::{TrainConfig, Trainer};
///
/// let data = Dataset::new(
///     vec![vec![1.0, 0.0], vec![0.0, 1.0]],
///     vec![0, 1],
/// ).unwrap();
/// let config = TrainConfig {
///     hidden_dim: 4,
///     label_dim: 2,
///     batch_size: 2,
///     seed: Some(7),
///     ..TrainConfig::default()
/// };
/// let mut trainer = Trainer::new(2, config).unwrap();
/// let report = trainer.train(&data).unwrap();
/// assert!(report.epochs_run >= 1);
/// ```
pub struct Trainer {
    params: NeuralNetworkParameters,
    executor: Box<dyn Executor>,
    config: TrainConfig,
    rng: StdRng,
    previous_loss: Option<f32>,
    state: TrainingState,
    epochs_run: usize,
}

impl Trainer {
    /// Random parameters for `input_dim` inputs and the executor chosen by
    /// `config.backend`.
    ///
    /// # Errors
    /// Any [`TrainConfig::validate`] failure, or the executor cannot be built
    /// (see [`Backend::executor`](crate::backend::Backend::executor)).
    pub fn new(input_dim: usize, config: TrainConfig) -> Result<Self> {
        config.validate()?;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        let params = NeuralNetworkParameters::random(input_dim, config.hidden_dim, config.label_dim, &mut rng)?;
        let executor = config.backend.executor(config.cross_check)?;
        Ok(Self::assemble(params, executor, config, rng))
    }

    /// Starts from given parameters and executor; `config.hidden_dim`,
    /// `config.label_dim`, `config.backend` and `config.cross_check` are
    /// ignored.
    ///
    /// # Errors
    /// [`TrainConfig::validate`] or [`NeuralNetworkParameters::validate`]
    /// failures.
    pub fn with_executor(
        params: NeuralNetworkParameters,
        executor: Box<dyn Executor>,
        config: TrainConfig,
    ) -> Result<Self> {
        config.validate()?;
        params.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Ok(Self::assemble(params, executor, config, rng))
    }

    fn assemble(
        params: NeuralNetworkParameters,
        executor: Box<dyn Executor>,
        config: TrainConfig,
        rng: StdRng,
    ) -> Self {
        info!(
            "trainer: {}x{}x{} on {} (batch {}, lr {})",
            params.input_dim(),
            params.hidden_dim(),
            params.label_dim(),
            executor.name(),
            config.batch_size,
            config.learning_rate
        );
        Self {
            params,
            executor,
            config,
            rng,
            previous_loss: None,
            state: TrainingState::Idle,
            epochs_run: 0,
        }
    }

    /// Current parameters.
    #[must_use]
    pub const fn params(&self) -> &NeuralNetworkParameters {
        &self.params
    }

    /// Consumes the trainer, returning the trained parameters.
    #[must_use]
    pub fn into_params(self) -> NeuralNetworkParameters {
        self.params
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &TrainConfig {
        &self.config
    }

    /// Current state of the loop.
    #[must_use]
    pub const fn state(&self) -> TrainingState {
        self.state
    }

    /// Name of the executor in use.
    #[must_use]
    pub fn executor_name(&self) -> &'static str {
        self.executor.name()
    }

    /// Average loss of the last completed epoch.
    #[must_use]
    pub const fn previous_loss(&self) -> Option<f32> {
        self.previous_loss
    }

    fn stop_requested(&self) -> bool {
        self.config
            .stop_flag
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }

    fn check_dataset(&self, data: &Dataset) -> Result<()> {
        match data.input_dim() {
            None => return Err(OcrError::InvalidConfig("dataset is empty".into())),
            Some(dim) if dim != self.params.input_dim() => {
                return Err(OcrError::mismatch("dataset input length", self.params.input_dim(), dim));
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// `param -= learning_rate * grads` for `w1`, `b1`, `w2` and `b2`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if `grads` is shaped differently from
    /// the parameters.
    pub fn apply_gradients(&mut self, grads: &GradientSet) -> Result<()> {
        let lr = self.config.learning_rate;
        if grads.dw1.shape() != self.params.w1.shape() || grads.dw2.shape() != self.params.w2.shape() {
            return Err(OcrError::mismatch(
                "apply_gradients",
                format!("{:?}/{:?}", self.params.w1.shape(), self.params.w2.shape()),
                format!("{:?}/{:?}", grads.dw1.shape(), grads.dw2.shape()),
            ));
        }
        sub_scaled_assign(self.params.w1.data_mut(), grads.dw1.data(), lr)?;
        sub_scaled_assign(&mut self.params.b1, &grads.db1, lr)?;
        sub_scaled_assign(self.params.w2.data_mut(), grads.dw2.data(), lr)?;
        sub_scaled_assign(&mut self.params.b2, &grads.db2, lr)?;
        Ok(())
    }

    /// Accumulates the gradients of `batch` (sample indices into `data`) and
    /// applies one SGD step along their mean. Returns the summed
    /// cross-entropy of the batch.
    ///
    /// Gradients are scaled by `batch.len()`, so a caller-built batch of any
    /// size takes a mean step. The state returns to what it was on entry
    /// (`Batch` inside an epoch, otherwise `Idle`), also on failure.
    ///
    /// # Errors
    /// - [`OcrError::DivideByZero`] for an empty batch
    /// - [`OcrError::IndexOutOfRange`] for a sample index or label out of range
    /// - executor failures
    pub fn train_batch(&mut self, data: &Dataset, batch: &[usize]) -> Result<f32> {
        if batch.is_empty() {
            return Err(OcrError::DivideByZero("train_batch: empty batch"));
        }
        let resume = match self.state {
            state @ TrainingState::Batch { .. } => state,
            _ => TrainingState::Idle,
        };
        let grads = self.accumulate_batch(data, batch, resume);
        self.state = resume;

        let acc = grads?;
        self.apply_gradients(&acc)?;
        Ok(acc.cross_entropy_error)
    }

    fn accumulate_batch(&mut self, data: &Dataset, batch: &[usize], at: TrainingState) -> Result<GradientSet> {
        let (epoch, batch_index) = match at {
            TrainingState::Batch { epoch, batch } => (epoch, batch),
            _ => (self.epochs_run + 1, 0),
        };
        let mut acc = GradientSet::zeros_like(&self.params)?;

        for (sample, &idx) in batch.iter().enumerate() {
            self.state = TrainingState::Sample {
                epoch,
                batch: batch_index,
                sample,
            };
            let (x, label) = data.sample(idx).ok_or(OcrError::IndexOutOfRange {
                index: idx,
                len: data.len(),
            })?;
            let grads = self.executor.backward(x, &self.params, label, batch.len())?;
            acc.accumulate(&grads)?;
        }
        Ok(acc)
    }

    /// Trains one epoch: shuffle, then one SGD step per full batch.
    ///
    /// The stop flag is checked before every batch; an interrupted epoch is
    /// reported with `completed == false` and does not count towards
    /// convergence.
    ///
    /// # Errors
    /// - [`OcrError::InvalidConfig`] if `data` holds fewer samples than one
    ///   batch
    /// - [`OcrError::DimensionMismatch`] if the inputs do not match the
    ///   parameters
    /// - any executor failure
    pub fn train_epoch(&mut self, data: &Dataset) -> Result<EpochStats> {
        self.check_dataset(data)?;
        let batch_size = self.config.batch_size;
        if data.len() < batch_size {
            return Err(OcrError::InvalidConfig(format!(
                "{} samples do not fill a single batch of {batch_size}",
                data.len()
            )));
        }

        let epoch = self.epochs_run + 1;
        self.state = TrainingState::Epoch { epoch };
        let start = Instant::now();

        let mut order: Vec<usize> = (0..data.len()).collect();
        order.shuffle(&mut self.rng);

        let mut total_error = 0.0f32;
        let mut batches = 0usize;
        let mut completed = true;
        for (batch, chunk) in order.chunks_exact(batch_size).enumerate() {
            if self.stop_requested() {
                completed = false;
                break;
            }
            self.state = TrainingState::Batch { epoch, batch };
            let result = self.train_batch(data, chunk);
            let error = match result {
                Ok(error) => error,
                Err(e) => {
                    self.state = TrainingState::Idle;
                    return Err(e);
                }
            };
            total_error += error;
            batches += 1;
            debug!("epoch {epoch} batch {batch}: error {:.6}", error / batch_size as f32);
        }

        let average_loss = if batches == 0 {
            0.0
        } else {
            total_error / (batches * batch_size) as f32
        };
        let mut loss_delta = None;
        if completed {
            loss_delta = self.previous_loss.map(|prev| (average_loss - prev).abs());
            self.previous_loss = Some(average_loss);
            self.epochs_run = epoch;
        }
        self.state = TrainingState::Idle;

        Ok(EpochStats {
            epoch,
            total_epochs: self.config.max_epochs,
            average_loss,
            loss_delta,
            batches,
            completed,
            elapsed_ms: u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }

    /// Runs epochs until `max_epochs`, convergence, or cancellation.
    ///
    /// # Errors
    /// As for [`Trainer::train_epoch`].
    pub fn train(&mut self, data: &Dataset) -> Result<TrainingReport> {
        let mut outcome = TrainingOutcome::Completed;

        for _ in 0..self.config.max_epochs {
            if self.stop_requested() {
                outcome = TrainingOutcome::Cancelled;
                break;
            }

            let stats = self.train_epoch(data)?;
            if !stats.completed {
                info!("epoch {} interrupted after {} batches", stats.epoch, stats.batches);
                outcome = TrainingOutcome::Cancelled;
                break;
            }
            info!(
                "epoch {}/{}: average loss {:.6} ({} batches, {} ms)",
                stats.epoch, stats.total_epochs, stats.average_loss, stats.batches, stats.elapsed_ms
            );

            let converged = stats
                .loss_delta
                .is_some_and(|delta| delta < self.config.loss_termination_threshold);

            if let Some(tx) = &self.config.progress_tx
                && tx.send(stats).is_err()
            {
                warn!("progress receiver dropped, stopping");
                outcome = TrainingOutcome::Cancelled;
                break;
            }

            if converged {
                info!("loss converged, stopping early");
                outcome = TrainingOutcome::EarlyStopped;
                break;
            }
        }

        if outcome == TrainingOutcome::EarlyStopped {
            self.state = TrainingState::EarlyStopped;
        }
        Ok(TrainingReport {
            epochs_run: self.epochs_run,
            final_loss: self.previous_loss,
            outcome,
        })
    }

    /// Runs the forward pass on one input and returns the predicted class.
    ///
    /// # Errors
    /// Executor failures.
    pub fn classify(&mut self, x: &[f32]) -> Result<usize> {
        Ok(self.executor.forward(x, &self.params)?.max_index())
    }

    /// Fraction of `data` classified correctly. Parameters are not modified.
    ///
    /// # Errors
    /// [`OcrError::InvalidConfig`] for an empty set, or executor failures.
    pub fn evaluate(&mut self, data: &Dataset) -> Result<f32> {
        self.check_dataset(data)?;
        let mut correct = 0usize;
        for (x, &label) in data.inputs().iter().zip(data.labels()) {
            if self.classify(x)? == label {
                correct += 1;
            }
        }
        let accuracy = correct as f32 / data.len() as f32;
        info!("accuracy {:.2}% ({correct}/{})", accuracy * 100.0, data.len());
        Ok(accuracy)
    }
}
