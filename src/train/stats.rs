//! Progress and result types reported by the trainer.

use serde::{Deserialize, Serialize};

/// Per-epoch training statistics.
///
/// When a progress channel is configured on [`TrainConfig`], the trainer
/// sends one `EpochStats` at the end of every completed epoch.
///
/// [`TrainConfig`]: crate::train::TrainConfig
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// 1-based epoch number.
    pub epoch: usize,
    /// Maximum epochs configured for this run.
    pub total_epochs: usize,
    /// Mean cross-entropy over the samples trained this epoch.
    pub average_loss: f32,
    /// `|average_loss - previous epoch's average_loss|`, if there was one.
    pub loss_delta: Option<f32>,
    /// Mini-batches trained.
    pub batches: usize,
    /// `false` if the stop flag interrupted the epoch.
    pub completed: bool,
    /// Wall-clock duration of the epoch in milliseconds.
    pub elapsed_ms: u64,
}

/// Why [`Trainer::train`](crate::train::Trainer::train) returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrainingOutcome {
    /// Ran all `max_epochs` epochs.
    Completed,
    /// The loss stopped changing by more than the termination threshold.
    EarlyStopped,
    /// The stop flag was raised or the progress receiver went away.
    Cancelled,
}

/// Summary of a whole training run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    /// Epochs that ran to completion.
    pub epochs_run: usize,
    /// Average loss of the last completed epoch.
    pub final_loss: Option<f32>,
    /// How the run ended.
    pub outcome: TrainingOutcome,
}
