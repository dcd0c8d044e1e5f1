//! Accelerated execution of the forward and backward passes.
//!
//! # Kernel Pipeline
//!
//! [`AcceleratedExecutor`] runs the same mathematics as [`crate::model`] and
//! [`crate::backprop`] as a chain of compute kernels on a
//! [`ComputeDevice`]:
//!
//! ```text
//! forward:  linear(x, w1, b1 → a1) → sigmoid(a1 → y1)
//!           → linear(y1, w2, b2 → a2) → softmax(a2 → y2)
//! backward: [host] da2, db2, error
//!           → outer_product(y1, da2 → dw2)
//!           → sigmoid_backward(y1, w2, da2 → da1, db1)
//!           → outer_product(x, da1 → dw1)
//! ```
//!
//! Stages are dispatched strictly in data-flow order; `a1`, `a2` and `da1`
//! never leave the device.
//!
//! ## Pipeline Lifetime
//!
//! Kernels are compiled on first use. Buffers are sized to the parameter
//! dimensions of the first call and reallocated whenever a call arrives with
//! different dimensions.
//!
//! ## Bindings
//!
//! Every call binds its slots through a [`bindings::BindingScope`], which
//! releases them in reverse order on every exit path.
//!
//! ## Limits
//!
//! Softmax runs as a single workgroup, so the label dimension is capped at
//! [`SOFTMAX_CAPACITY`]. Larger label dimensions fail with
//! [`OcrError::CapacityExceeded`] before anything is dispatched.

pub(crate) mod bindings;

use log::{debug, info};

use crate::backend::Executor;
use crate::backprop::{GradientSet, output_delta};
use crate::error::{OcrError, Result};
use crate::model::{ForwardResult, NeuralNetworkParameters};
use crate::ops::device::{Access, ComputeDevice, KernelId};
use crate::ops::kernels::{LINEAR, OUTER_PRODUCT, SIGMOID, SIGMOID_BACKWARD, SOFTMAX, SOFTMAX_WORKGROUP_SIZE};
use crate::tensors::Matrix;

use bindings::{BindingScope, PipelineBuffer};

/// Largest label dimension the single-workgroup softmax stage can handle.
pub const SOFTMAX_CAPACITY: usize = SOFTMAX_WORKGROUP_SIZE as usize;

struct Kernels {
    linear1: KernelId,
    sigmoid: KernelId,
    linear2: KernelId,
    softmax: KernelId,
    outer_dw2: KernelId,
    sigmoid_backward: KernelId,
    outer_dw1: KernelId,
}

impl Kernels {
    fn compile<D: ComputeDevice>(device: &mut D) -> Result<Self> {
        Ok(Self {
            linear1: device.compile(&LINEAR)?,
            sigmoid: device.compile(&SIGMOID)?,
            linear2: device.compile(&LINEAR)?,
            softmax: device.compile(&SOFTMAX)?,
            outer_dw2: device.compile(&OUTER_PRODUCT)?,
            sigmoid_backward: device.compile(&SIGMOID_BACKWARD)?,
            outer_dw1: device.compile(&OUTER_PRODUCT)?,
        })
    }
}

struct Buffers {
    dims: (usize, usize, usize),
    x: PipelineBuffer,
    w1: PipelineBuffer,
    b1: PipelineBuffer,
    a1: PipelineBuffer,
    y1: PipelineBuffer,
    w2: PipelineBuffer,
    b2: PipelineBuffer,
    a2: PipelineBuffer,
    y2: PipelineBuffer,
    da2: PipelineBuffer,
    dw2: PipelineBuffer,
    da1: PipelineBuffer,
    db1: PipelineBuffer,
    dw1: PipelineBuffer,
}

impl Buffers {
    fn allocate<D: ComputeDevice>(device: &mut D, dims: (usize, usize, usize)) -> Result<Self> {
        let (input, hidden, labels) = dims;
        let mut buf = |label: &'static str, len: usize| -> Result<PipelineBuffer> {
            Ok(PipelineBuffer {
                id: device.allocate(label, len)?,
                label,
                len,
            })
        };
        Ok(Self {
            dims,
            x: buf("x", input)?,
            w1: buf("w1", input * hidden)?,
            b1: buf("b1", hidden)?,
            a1: buf("a1", hidden)?,
            y1: buf("y1", hidden)?,
            w2: buf("w2", hidden * labels)?,
            b2: buf("b2", labels)?,
            a2: buf("a2", labels)?,
            y2: buf("y2", labels)?,
            da2: buf("da2", labels)?,
            dw2: buf("dw2", hidden * labels)?,
            da1: buf("da1", hidden)?,
            db1: buf("db1", hidden)?,
            dw1: buf("dw1", input * hidden)?,
        })
    }

    fn release<D: ComputeDevice>(self, device: &mut D) -> Result<()> {
        for b in [
            self.x, self.w1, self.b1, self.a1, self.y1, self.w2, self.b2, self.a2, self.y2, self.da2, self.dw2,
            self.da1, self.db1, self.dw1,
        ] {
            device.release(b.id)?;
        }
        Ok(())
    }
}

fn to_u32(n: usize, stage: &'static str) -> Result<u32> {
    u32::try_from(n).map_err(|_| OcrError::CapacityExceeded {
        stage,
        requested: n,
        capacity: u32::MAX as usize,
    })
}

/// Runs forward and backward passes as kernel dispatches on a device.
///
/// # Example
///
/// ```rust
/// use simple_ocr::accelerated::AcceleratedExecutor;
/// use simple_ocr::backend::Executor;
/// use simple_ocr::model::NeuralNetworkParameters;
/// use simple_ocr::ops::emulated::EmulatedDevice;
///
/// let params = NeuralNetworkParameters::zeros(4, 3, 2).unwrap();
/// let mut exec = AcceleratedExecutor::new(EmulatedDevice::new());
/// let out = exec.forward(&[0.0, 0.5, 1.0, 0.5], &params).unwrap();
/// assert!((out.y2[0] - 0.5).abs() < 1e-6);
/// ```
pub struct AcceleratedExecutor<D: ComputeDevice> {
    device: D,
    kernels: Option<Kernels>,
    buffers: Option<Buffers>,
}

impl<D: ComputeDevice> AcceleratedExecutor<D> {
    /// Wraps `device`. Nothing is compiled or allocated until the first call.
    pub const fn new(device: D) -> Self {
        Self {
            device,
            kernels: None,
            buffers: None,
        }
    }

    /// The underlying device.
    pub const fn device(&self) -> &D {
        &self.device
    }

    /// Dimensions the pipeline is currently sized for, if built.
    pub fn pipeline_dims(&self) -> Option<(usize, usize, usize)> {
        self.buffers.as_ref().map(|b| b.dims)
    }

    fn prepare(&mut self, dims: (usize, usize, usize)) -> Result<()> {
        if self.kernels.is_none() {
            info!("compiling kernels on {} device", self.device.name());
            self.kernels = Some(Kernels::compile(&mut self.device)?);
        }
        if self.buffers.as_ref().is_some_and(|b| b.dims == dims) {
            return Ok(());
        }
        if let Some(old) = self.buffers.take() {
            debug!("releasing pipeline buffers sized for {:?}", old.dims);
            old.release(&mut self.device)?;
        }
        info!("allocating pipeline buffers for input={} hidden={} label={}", dims.0, dims.1, dims.2);
        self.buffers = Some(Buffers::allocate(&mut self.device, dims)?);
        Ok(())
    }

    fn check_params(x: &[f32], params: &NeuralNetworkParameters) -> Result<()> {
        params.validate()?;
        if x.len() != params.input_dim() {
            return Err(OcrError::mismatch("accelerated forward: input", params.input_dim(), x.len()));
        }
        if params.label_dim() > SOFTMAX_CAPACITY {
            return Err(OcrError::CapacityExceeded {
                stage: "softmax",
                requested: params.label_dim(),
                capacity: SOFTMAX_CAPACITY,
            });
        }
        Ok(())
    }

    fn run_forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
        Self::check_params(x, params)?;
        self.prepare(params.dims())?;
        let (Some(k), Some(b)) = (self.kernels.as_ref(), self.buffers.as_ref()) else {
            return Err(OcrError::Device("pipeline was not built".into()));
        };

        let (input, hidden, label) = params.dims();
        let i = to_u32(input, "linear")?;
        let h = to_u32(hidden, "linear")?;
        let l = to_u32(label, "softmax")?;

        let mut y1 = vec![0.0; hidden];
        let mut y2 = vec![0.0; label];
        let mut scope = BindingScope::new(&mut self.device);

        // a1 = x·w1 + b1
        scope.bind_readonly(k.linear1, 1, &b.x, x)?;
        scope.bind_readonly(k.linear1, 2, &b.w1, params.w1.data())?;
        scope.bind_readonly(k.linear1, 3, &b.b1, &params.b1)?;
        scope.bind_device(k.linear1, 4, &b.a1, Access::Writable)?;
        // y1 = sigmoid(a1)
        scope.bind_device(k.sigmoid, 1, &b.a1, Access::ReadOnly)?;
        scope.bind_writable(k.sigmoid, 2, &b.y1, &mut y1)?;
        // a2 = y1·w2 + b2
        scope.bind_device(k.linear2, 1, &b.y1, Access::ReadOnly)?;
        scope.bind_readonly(k.linear2, 2, &b.w2, params.w2.data())?;
        scope.bind_readonly(k.linear2, 3, &b.b2, &params.b2)?;
        scope.bind_device(k.linear2, 4, &b.a2, Access::Writable)?;
        // y2 = softmax(a2)
        scope.bind_device(k.softmax, 1, &b.a2, Access::ReadOnly)?;
        scope.bind_writable(k.softmax, 2, &b.y2, &mut y2)?;

        scope.dispatch(k.linear1, [i, h, 0, 0], h)?;
        scope.dispatch(k.sigmoid, [h, 0, 0, 0], h)?;
        scope.dispatch(k.linear2, [h, l, 0, 0], l)?;
        scope.dispatch(k.softmax, [l, 0, 0, 0], l)?;
        scope.finish()?;

        Ok(ForwardResult { y1, y2 })
    }

    fn run_backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet> {
        if true_label >= params.label_dim() {
            return Err(OcrError::IndexOutOfRange {
                index: true_label,
                len: params.label_dim(),
            });
        }
        if batch_size == 0 {
            return Err(OcrError::DivideByZero("backward: batch size"));
        }

        let fwd = self.run_forward(x, params)?;
        let (da2, cross_entropy_error) = output_delta(&fwd.y2, true_label, batch_size)?;
        let (Some(k), Some(b)) = (self.kernels.as_ref(), self.buffers.as_ref()) else {
            return Err(OcrError::Device("pipeline was not built".into()));
        };

        let (input, hidden, label) = params.dims();
        let i = to_u32(input, "outer_product")?;
        let h = to_u32(hidden, "sigmoid_backward")?;
        let l = to_u32(label, "sigmoid_backward")?;
        let hl = to_u32(hidden * label, "outer_product")?;
        let ih = to_u32(input * hidden, "outer_product")?;

        let mut dw2 = Matrix::new(hidden, label)?;
        let mut db1 = vec![0.0; hidden];
        let mut dw1 = Matrix::new(input, hidden)?;
        let mut scope = BindingScope::new(&mut self.device);

        // dw2 = y1 ⊗ da2
        scope.bind_readonly(k.outer_dw2, 1, &b.y1, &fwd.y1)?;
        scope.bind_readonly(k.outer_dw2, 2, &b.da2, &da2)?;
        scope.bind_writable(k.outer_dw2, 3, &b.dw2, dw2.data_mut())?;
        // da1 = db1 = (da2 · w2ᵗ) ⊙ y1 ⊙ (1 - y1)
        scope.bind_device(k.sigmoid_backward, 1, &b.y1, Access::ReadOnly)?;
        scope.bind_readonly(k.sigmoid_backward, 2, &b.w2, params.w2.data())?;
        scope.bind_device(k.sigmoid_backward, 3, &b.da2, Access::ReadOnly)?;
        scope.bind_device(k.sigmoid_backward, 4, &b.da1, Access::Writable)?;
        scope.bind_writable(k.sigmoid_backward, 5, &b.db1, &mut db1)?;
        // dw1 = x ⊗ da1
        scope.bind_readonly(k.outer_dw1, 1, &b.x, x)?;
        scope.bind_device(k.outer_dw1, 2, &b.da1, Access::ReadOnly)?;
        scope.bind_writable(k.outer_dw1, 3, &b.dw1, dw1.data_mut())?;

        scope.dispatch(k.outer_dw2, [h, l, 0, 0], hl)?;
        scope.dispatch(k.sigmoid_backward, [h, l, 0, 0], h)?;
        scope.dispatch(k.outer_dw1, [i, h, 0, 0], ih)?;
        scope.finish()?;

        Ok(GradientSet {
            dw1,
            db1,
            dw2,
            db2: da2,
            cross_entropy_error,
        })
    }
}

impl<D: ComputeDevice> Executor for AcceleratedExecutor<D> {
    fn forward(&mut self, x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
        self.run_forward(x, params)
    }

    fn backward(
        &mut self,
        x: &[f32],
        params: &NeuralNetworkParameters,
        true_label: usize,
        batch_size: usize,
    ) -> Result<GradientSet> {
        self.run_backward(x, params, true_label, batch_size)
    }

    fn name(&self) -> &'static str {
        self.device.name()
    }
}
