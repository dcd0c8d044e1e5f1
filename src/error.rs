//! Error taxonomy shared by every layer of the engine.
//!
//! Algebra and model errors are contract violations by the caller: they are
//! returned immediately and never retried. Dataset errors surface as
//! [`OcrError::Io`] so a missing or truncated file can never yield a partially
//! populated dataset.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, OcrError>;

/// All failures the engine can report.
#[derive(Debug, Error)]
pub enum OcrError {
    /// Operand shapes are incompatible for the requested operation.
    #[error("dimension mismatch in {op}: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Operation that rejected its operands.
        op: &'static str,
        /// Shape the operation required.
        expected: String,
        /// Shape it was given.
        actual: String,
    },

    /// A divisor (explicit scalar or batch size) was exactly zero.
    #[error("division by zero in {0}")]
    DivideByZero(&'static str),

    /// A class label fell outside `[0, len)`.
    #[error("index {index} out of range for {len} classes")]
    IndexOutOfRange {
        /// Offending index.
        index: usize,
        /// Number of valid classes.
        len: usize,
    },

    /// A fixed-size kernel stage or buffer cannot hold the requested elements.
    #[error("{stage} capacity exceeded: {requested} elements requested, limit is {capacity}")]
    CapacityExceeded {
        /// Kernel stage or buffer slot that overflowed.
        stage: &'static str,
        /// Elements requested.
        requested: usize,
        /// Hard limit of the stage.
        capacity: usize,
    },

    /// Reading a dataset (or config) file failed.
    #[error("I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("invalid configuration file: {0}")]
    Json(#[from] serde_json::Error),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The accelerator runtime rejected an operation.
    #[error("compute device error: {0}")]
    Device(String),

    /// The requested backend was not compiled into this build.
    #[error("backend `{0}` is not available in this build")]
    BackendUnavailable(&'static str),
}

impl OcrError {
    /// Builds a [`OcrError::DimensionMismatch`] from anything printable.
    pub(crate) fn mismatch(
        op: &'static str,
        expected: impl core::fmt::Display,
        actual: impl core::fmt::Display,
    ) -> Self {
        Self::DimensionMismatch {
            op,
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}
