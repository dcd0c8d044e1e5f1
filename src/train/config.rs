//! [`TrainConfig`]: hyper-parameters, backend choice and run controls,
//! loadable from JSON.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, mpsc};

use serde::{Deserialize, Serialize};

use crate::backend::Backend;
use crate::error::{OcrError, Result};
use crate::train::stats::EpochStats;

/// Configuration for a training run.
///
/// Every field has a default, so a JSON file only needs the keys it changes:
///
/// ```rust
/// use simple_ocr::train::TrainConfig;
///
/// let cfg = TrainConfig::from_json_str(r#"{ "max_epochs": 2, "backend": "emulated" }"#).unwrap();
/// assert_eq!(cfg.max_epochs, 2);
/// assert_eq!(cfg.batch_size, 100);
/// ```
///
/// # Fields
/// - `progress_tx`: optional channel sender; one [`EpochStats`] is sent per
///   completed epoch. If the receiver is dropped the run ends as cancelled.
/// - `stop_flag`: optional atomic flag; when set from another thread the run
///   ends at the next batch boundary.
///
/// Neither of the two is part of the serialised form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Hidden units.
    pub hidden_dim: usize,
    /// Number of classes.
    pub label_dim: usize,
    /// Samples per mini-batch.
    pub batch_size: usize,
    /// SGD step size.
    pub learning_rate: f32,
    /// Upper bound on epochs.
    pub max_epochs: usize,
    /// Early-stop once consecutive epoch losses differ by less than this.
    pub loss_termination_threshold: f32,
    /// Seed for initialisation and shuffling; `None` seeds from the OS.
    pub seed: Option<u64>,
    /// Executor to train on.
    pub backend: Backend,
    /// Wrap the executor in a CPU cross-check.
    pub cross_check: bool,
    /// Receives one [`EpochStats`] per completed epoch.
    #[serde(skip)]
    pub progress_tx: Option<mpsc::Sender<EpochStats>>,
    /// Checked between batches and between epochs.
    #[serde(skip)]
    pub stop_flag: Option<Arc<AtomicBool>>,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            hidden_dim: 128,
            label_dim: 10,
            batch_size: 100,
            learning_rate: 0.01,
            max_epochs: 5,
            loss_termination_threshold: 0.01,
            seed: None,
            backend: Backend::Cpu,
            cross_check: false,
            progress_tx: None,
            stop_flag: None,
        }
    }
}

impl TrainConfig {
    /// Parses a JSON configuration.
    ///
    /// # Errors
    /// [`OcrError::Json`] for malformed JSON or mistyped fields.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    /// [`OcrError::Io`] if the file cannot be read, [`OcrError::Json`] if it
    /// does not parse.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Attaches a per-epoch progress channel.
    #[must_use]
    pub fn with_progress(mut self, tx: mpsc::Sender<EpochStats>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    /// Attaches a cooperative stop flag.
    #[must_use]
    pub fn with_stop_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.stop_flag = Some(flag);
        self
    }

    /// Checks the numeric fields.
    ///
    /// # Errors
    /// - [`OcrError::DivideByZero`] if `batch_size == 0`
    /// - [`OcrError::InvalidConfig`] for a zero dimension, zero epochs, or a
    ///   non-positive / non-finite learning rate or threshold
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(OcrError::DivideByZero("TrainConfig: batch_size"));
        }
        if self.hidden_dim == 0 || self.label_dim == 0 {
            return Err(OcrError::InvalidConfig(format!(
                "hidden_dim and label_dim must be positive (got {} and {})",
                self.hidden_dim, self.label_dim
            )));
        }
        if self.max_epochs == 0 {
            return Err(OcrError::InvalidConfig("max_epochs must be at least 1".into()));
        }
        if !self.learning_rate.is_finite() || self.learning_rate <= 0.0 {
            return Err(OcrError::InvalidConfig(format!(
                "learning_rate must be a positive number (got {})",
                self.learning_rate
            )));
        }
        if !self.loss_termination_threshold.is_finite() || self.loss_termination_threshold < 0.0 {
            return Err(OcrError::InvalidConfig(format!(
                "loss_termination_threshold must be non-negative (got {})",
                self.loss_termination_threshold
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        TrainConfig::default().validate().unwrap();
    }

    #[test]
    fn zero_batch_is_divide_by_zero() {
        let cfg = TrainConfig {
            batch_size: 0,
            ..TrainConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(OcrError::DivideByZero(_))));
    }

    #[test]
    fn unknown_backend_is_json_error() {
        assert!(matches!(
            TrainConfig::from_json_str(r#"{ "backend": "tpu" }"#),
            Err(OcrError::Json(_))
        ));
    }
}
