//! Abstract accelerator runtime.
//!
//! # Kernel Dispatch Model
//!
//! A [`ComputeDevice`] exposes the handful of primitives the accelerated
//! executor is written against:
//!
//! - compile a kernel from a [`KernelSource`]
//! - allocate, write, read and release `f32` buffers
//! - bind a buffer to a numbered slot of a kernel, and unbind it again
//! - dispatch a kernel over a number of invocations with four `u32` parameters
//!
//! Slot `0` of every kernel is reserved for the parameter block; buffer slots
//! are numbered from `1` in the order listed in [`KernelSource::slots`]. A
//! kernel may only write through slots declared [`Access::Writable`].
//!
//! ## Implementations
//!
//! - [`EmulatedDevice`](crate::ops::emulated::EmulatedDevice) runs the host
//!   version of each kernel and is always available.
//! - `WgpuDevice` (feature `wgpu`) compiles the bundled WGSL and runs it on
//!   a real adapter.

use crate::error::Result;

/// How a kernel uses the buffer bound to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// The kernel only reads the slot.
    ReadOnly,
    /// The kernel writes (and may read) the slot.
    Writable,
}

/// A kernel as shipped with the crate: WGSL source plus its binding layout.
#[derive(Debug)]
pub struct KernelSource {
    /// Stable name; also the lookup key for the host implementation.
    pub name: &'static str,
    /// WGSL source with a `main` compute entry point.
    pub wgsl: &'static str,
    /// Invocations per workgroup, matching `@workgroup_size` in the source.
    pub workgroup_size: u32,
    /// Whether the kernel must run as exactly one workgroup.
    pub single_workgroup: bool,
    /// Buffer slots in binding order, starting at binding `1`.
    pub slots: &'static [Access],
}

impl KernelSource {
    /// Declared access of `slot`, if the kernel has such a slot.
    #[must_use]
    pub fn slot_access(&self, slot: u32) -> Option<Access> {
        let index = usize::try_from(slot.checked_sub(1)?).ok()?;
        self.slots.get(index).copied()
    }

    /// Number of workgroups needed to cover `invocations`.
    #[must_use]
    pub const fn workgroups(&self, invocations: u32) -> u32 {
        invocations.div_ceil(self.workgroup_size)
    }
}

/// Handle to a compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelId(pub(crate) usize);

/// Handle to a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

/// The accelerator runtime capability.
///
/// Every method takes `&mut self`; a device is driven by one caller at a time.
pub trait ComputeDevice {
    /// Short name used in logs and executor names.
    fn name(&self) -> &'static str;

    /// Compiles `source` into a dispatchable kernel.
    ///
    /// # Errors
    /// [`OcrError::Device`](crate::error::OcrError::Device) if the runtime
    /// rejects the kernel.
    fn compile(&mut self, source: &'static KernelSource) -> Result<KernelId>;

    /// Allocates a zeroed buffer of `len` elements.
    ///
    /// # Errors
    /// [`OcrError::Device`](crate::error::OcrError::Device) on allocation
    /// failure.
    fn allocate(&mut self, label: &'static str, len: usize) -> Result<BufferId>;

    /// Frees a buffer. Its id must not be used afterwards.
    ///
    /// # Errors
    /// [`OcrError::Device`](crate::error::OcrError::Device) for an unknown id.
    fn release(&mut self, buffer: BufferId) -> Result<()>;

    /// Copies `data` into the start of `buffer`.
    ///
    /// # Errors
    /// [`OcrError::CapacityExceeded`](crate::error::OcrError::CapacityExceeded)
    /// if `data` is longer than the buffer.
    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<()>;

    /// Copies the start of `buffer` into `out`.
    ///
    /// # Errors
    /// [`OcrError::CapacityExceeded`](crate::error::OcrError::CapacityExceeded)
    /// if `out` is longer than the buffer.
    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()>;

    /// Binds `buffer` to `slot` of `kernel`, declaring how it will be used.
    ///
    /// # Errors
    /// [`OcrError::Device`](crate::error::OcrError::Device) if the slot does
    /// not exist, is already bound, or is declared with a different access.
    fn bind(&mut self, kernel: KernelId, slot: u32, buffer: BufferId, access: Access) -> Result<()>;

    /// Clears `slot` of `kernel`.
    ///
    /// # Errors
    /// [`OcrError::Device`](crate::error::OcrError::Device) if nothing is
    /// bound there.
    fn unbind(&mut self, kernel: KernelId, slot: u32) -> Result<()>;

    /// Runs `kernel` over `invocations` invocations and returns once it has
    /// completed.
    ///
    /// # Errors
    /// - [`OcrError::Device`](crate::error::OcrError::Device) if a slot is unbound
    /// - [`OcrError::CapacityExceeded`](crate::error::OcrError::CapacityExceeded)
    ///   if a single-workgroup kernel is asked for more invocations than one
    ///   workgroup holds
    fn dispatch(&mut self, kernel: KernelId, params: [u32; 4], invocations: u32) -> Result<()>;
}
