//! Backend selection module.
//!
//! This module defines the [`Executor`] seam through which the training loop
//! runs forward and backward passes, and the executors available behind it.
//!
//! # Supported Backends
//!
//! - `Cpu`: the reference implementation in [`crate::model`] and
//!   [`crate::backprop`] (default).
//! - `Emulated`: the accelerated kernel pipeline on the host-side
//!   [`EmulatedDevice`].
//! - `Wgpu`: the accelerated kernel pipeline on a GPU (feature `wgpu`).
//!
//! The executor is an ordinary owned value; there is no process-wide backend
//! state. Any executor can additionally be wrapped in [`CrossCheck`], which
//! repeats every call on the CPU and logs whether the two agree.
//!
//! # Example
//!
//! ```rust
//! use simple_ocr::backend::{Backend, Executor};
//!
//! let exec = Backend::Emulated.executor(true).unwrap();
//! assert_eq!(exec.name(), "emulated+cross-check");
//! ```

use core::fmt;
use core::str::FromStr;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};

use crate::accelerated::AcceleratedExecutor;
use crate::backprop::{GradientSet, backward_from};
use crate::error::{OcrError, Result};
use crate::model::{ForwardResult, NeuralNetworkParameters, forward};
use crate::ops::emulated::EmulatedDevice;
use crate::tensors::almost_equals;

/// Default agreement tolerance of [`CrossCheck`], absolute or relative.
pub const CROSS_CHECK_TOLERANCE: f32 = 1e-3;

/// Runs the network's forward and backward passes.
///
/// Implementations must produce the same results as the CPU reference up to
/// floating-point tolerance.
pub trait Executor {
    /// Forward pass for one input vector.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] for malformed inputs, plus any
    /// executor-specific failure.
    fn forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult>;

    /// Gradients for one sample, scaled by `1 / batch_size`.
    ///
    /// # Errors
    /// See [`crate::backprop::backward`].
    fn backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet>;

    /// Short name for logs.
    fn name(&self) -> &'static str;
}

impl<E: Executor + ?Sized> Executor for Box<E> {
    fn forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
        (**self).forward(x, params)
    }

    fn backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet> {
        (**self).backward(x, params, true_label, batch_size)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// The reference executor: plain host algebra.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuExecutor;

impl Executor for CpuExecutor {
    #[inline]
    fn forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
        forward(x, params)
    }

    fn backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet> {
        let fwd = forward(x, params)?;
        backward_from(x, params, &fwd, true_label, batch_size)
    }

    fn name(&self) -> &'static str {
        "cpu"
    }
}

/// Pass/fail counters of a [`CrossCheck`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckStats {
    /// Calls whose results agreed with the reference.
    pub passes: u64,
    /// Calls whose results disagreed, or whose reference run failed.
    pub failures: u64,
}

/// Diagnostic wrapper that re-runs every call on [`CpuExecutor`].
///
/// The wrapped executor's result is always returned unchanged; disagreement
/// is logged at `error` level and counted, never turned into an error and
/// never used to switch paths.
pub struct CrossCheck<E> {
    inner: E,
    reference: CpuExecutor,
    tolerance: f32,
    stats: CheckStats,
}

impl<E: Executor> CrossCheck<E> {
    /// Wraps `inner` with the default [`CROSS_CHECK_TOLERANCE`].
    pub fn new(inner: E) -> Self {
        Self::with_tolerance(inner, CROSS_CHECK_TOLERANCE)
    }

    /// Wraps `inner` with a custom tolerance.
    pub fn with_tolerance(inner: E, tolerance: f32) -> Self {
        Self {
            inner,
            reference: CpuExecutor,
            tolerance,
            stats: CheckStats::default(),
        }
    }

    /// Counters so far.
    pub const fn stats(&self) -> CheckStats {
        self.stats
    }

    /// The wrapped executor.
    pub const fn inner(&self) -> &E {
        &self.inner
    }

    fn record(&mut self, stage: &str, agrees: bool) {
        if agrees {
            self.stats.passes += 1;
            info!("{} {stage} self-test: PASSED", self.inner.name());
        } else {
            self.stats.failures += 1;
            error!(
                "{} {stage} self-test: FAILED (tolerance {})",
                self.inner.name(),
                self.tolerance
            );
        }
    }
}

impl<E: Executor> Executor for CrossCheck<E> {
    fn forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
        let result = self.inner.forward(x, params)?;
        match self.reference.forward(x, params) {
            Ok(expected) => {
                let agrees = almost_equals(&result.y1, &expected.y1, self.tolerance)
                    && almost_equals(&result.y2, &expected.y2, self.tolerance);
                self.record("forward", agrees);
            }
            Err(e) => {
                warn!("reference forward failed: {e}");
                self.record("forward", false);
            }
        }
        Ok(result)
    }

    fn backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet> {
        let result = self.inner.backward(x, params, true_label, batch_size)?;
        match self.reference.backward(x, params, true_label, batch_size) {
            Ok(expected) => {
                let agrees = result.almost_equals(&expected, self.tolerance);
                self.record("backward", agrees);
            }
            Err(e) => {
                warn!("reference backward failed: {e}");
                self.record("backward", false);
            }
        }
        Ok(result)
    }

    fn name(&self) -> &'static str {
        match self.inner.name() {
            "cpu" => "cpu+cross-check",
            "emulated" => "emulated+cross-check",
            "wgpu" => "wgpu+cross-check",
            _ => "cross-check",
        }
    }
}

/// Which executor the trainer runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Host reference algebra (default).
    #[default]
    Cpu,
    /// Kernel pipeline on the host-side emulated device.
    Emulated,
    /// Kernel pipeline on a GPU through `wgpu`.
    Wgpu,
}

impl Backend {
    /// Builds the executor for this backend, optionally wrapped in
    /// [`CrossCheck`].
    ///
    /// # Errors
    /// - [`OcrError::BackendUnavailable`] for `Wgpu` in a build without the
    ///   `wgpu` feature
    /// - [`OcrError::Device`] if the GPU cannot be initialised
    pub fn executor(self, cross_check: bool) -> Result<Box<dyn Executor>> {
        let exec: Box<dyn Executor> = match (self, cross_check) {
            (Self::Cpu, false) => Box::new(CpuExecutor),
            (Self::Cpu, true) => Box::new(CrossCheck::new(CpuExecutor)),
            (Self::Emulated, false) => Box::new(AcceleratedExecutor::new(EmulatedDevice::new())),
            (Self::Emulated, true) => Box::new(CrossCheck::new(AcceleratedExecutor::new(EmulatedDevice::new()))),
            (Self::Wgpu, cross_check) => Self::wgpu_executor(cross_check)?,
        };
        info!("using {} executor", exec.name());
        Ok(exec)
    }

    #[cfg(feature = "wgpu")]
    fn wgpu_executor(cross_check: bool) -> Result<Box<dyn Executor>> {
        use crate::ops::wgpu::WgpuDevice;

        let exec = AcceleratedExecutor::new(WgpuDevice::new()?);
        Ok(if cross_check {
            Box::new(CrossCheck::new(exec))
        } else {
            Box::new(exec)
        })
    }

    #[cfg(not(feature = "wgpu"))]
    fn wgpu_executor(_cross_check: bool) -> Result<Box<dyn Executor>> {
        Err(OcrError::BackendUnavailable("wgpu"))
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Cpu => "cpu",
            Self::Emulated => "emulated",
            Self::Wgpu => "wgpu",
        })
    }
}

impl FromStr for Backend {
    type Err = OcrError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "emulated" => Ok(Self::Emulated),
            "wgpu" | "gpu" => Ok(Self::Wgpu),
            other => Err(OcrError::InvalidConfig(format!(
                "unknown backend `{other}` (expected cpu, emulated or wgpu)"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_names_round_trip() {
        for b in [Backend::Cpu, Backend::Emulated, Backend::Wgpu] {
            assert_eq!(b.to_string().parse::<Backend>().unwrap(), b);
        }
        assert!("tpu".parse::<Backend>().is_err());
    }

    #[cfg(not(feature = "wgpu"))]
    #[test]
    fn wgpu_is_unavailable_without_feature() {
        assert!(matches!(
            Backend::Wgpu.executor(false),
            Err(OcrError::BackendUnavailable("wgpu"))
        ));
    }

    #[test]
    fn cross_check_of_cpu_always_passes() {
        let params = NeuralNetworkParameters::zeros(3, 2, 2).unwrap();
        let mut exec = CrossCheck::new(CpuExecutor);
        exec.forward(&[1.0, 0.0, 1.0], &params).unwrap();
        exec.backward(&[1.0, 0.0, 1.0], &params, 1, 4).unwrap();
        assert_eq!(exec.stats(), CheckStats { passes: 2, failures: 0 });
    }
}
