//! Mini-batch SGD training of the two-layer classifier.
//!
//! # Training Loop
//!
//! ```text
//! Idle → Epoch → Batch → Sample → … → Idle | EarlyStopped
//! ```
//!
//! Each epoch shuffles the sample order (Fisher–Yates), cuts it into
//! fixed-size batches and drops the trailing remainder. Per batch the
//! gradients of every sample are accumulated into a zeroed [`GradientSet`],
//! then every parameter moves by `-learning_rate * accumulated`. Because the
//! per-sample gradients are already divided by the batch size, this is a step
//! along the batch-mean gradient.
//!
//! After an epoch the average loss is `total_error / (batches * batch_size)`.
//! Training stops early once two consecutive epochs differ by less than the
//! configured loss-termination threshold, and never runs past `max_epochs`.
//!
//! [`GradientSet`]: crate::backprop::GradientSet

pub mod config;
pub mod stats;
pub mod trainer;

pub use config::TrainConfig;
pub use stats::{EpochStats, TrainingOutcome, TrainingReport};
pub use trainer::{Trainer, TrainingState};
