//! Scoped buffer bindings for one accelerated call.
//!
//! A [`BindingScope`] acquires slot bindings one at a time and remembers them
//! in acquisition order. However the scope ends, whether by
//! [`BindingScope::finish`], an early `?` return or a panic unwinding through
//! it, every binding is released in reverse order by its `Drop` impl.
//!
//! Three kinds of binding exist:
//!
//! - **read-only host data** ([`BindingScope::bind_readonly`]): the host
//!   slice is uploaded into the buffer when bound
//! - **writable host output** ([`BindingScope::bind_writable`]): the host
//!   slice is borrowed for the scope and filled by [`BindingScope::finish`]
//! - **device-resident** ([`BindingScope::bind_device`]): an intermediate
//!   that never leaves the device
//!
//! Binding host data larger than the buffer's capacity fails with
//! [`OcrError::CapacityExceeded`] before anything is written.

use log::{debug, warn};

use crate::error::{OcrError, Result};
use crate::ops::device::{Access, BufferId, ComputeDevice, KernelId};

/// A device buffer owned by the accelerated pipeline.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PipelineBuffer {
    pub(crate) id: BufferId,
    pub(crate) label: &'static str,
    pub(crate) len: usize,
}

impl PipelineBuffer {
    fn check(&self, requested: usize) -> Result<()> {
        if requested > self.len {
            return Err(OcrError::CapacityExceeded {
                stage: self.label,
                requested,
                capacity: self.len,
            });
        }
        Ok(())
    }
}

/// Bindings held for the duration of one forward or backward call.
pub(crate) struct BindingScope<'d, 'h, D: ComputeDevice + ?Sized> {
    device: &'d mut D,
    bound: Vec<(KernelId, u32)>,
    read_back: Vec<(BufferId, &'h mut [f32])>,
}

impl<'d, 'h, D: ComputeDevice + ?Sized> BindingScope<'d, 'h, D> {
    pub(crate) fn new(device: &'d mut D) -> Self {
        Self {
            device,
            bound: Vec::new(),
            read_back: Vec::new(),
        }
    }

    fn acquire(&mut self, kernel: KernelId, slot: u32, buffer: &PipelineBuffer, access: Access) -> Result<()> {
        self.device.bind(kernel, slot, buffer.id, access)?;
        self.bound.push((kernel, slot));
        Ok(())
    }

    /// Uploads `data` into `buffer` and binds it read-only.
    pub(crate) fn bind_readonly(
        &mut self,
        kernel: KernelId,
        slot: u32,
        buffer: &PipelineBuffer,
        data: &[f32],
    ) -> Result<()> {
        buffer.check(data.len())?;
        self.device.write(buffer.id, data)?;
        self.acquire(kernel, slot, buffer, Access::ReadOnly)
    }

    /// Binds `buffer` writable; `host` receives its contents on `finish`.
    pub(crate) fn bind_writable(
        &mut self,
        kernel: KernelId,
        slot: u32,
        buffer: &PipelineBuffer,
        host: &'h mut [f32],
    ) -> Result<()> {
        buffer.check(host.len())?;
        self.acquire(kernel, slot, buffer, Access::Writable)?;
        self.read_back.push((buffer.id, host));
        Ok(())
    }

    /// Binds a device-resident intermediate.
    pub(crate) fn bind_device(
        &mut self,
        kernel: KernelId,
        slot: u32,
        buffer: &PipelineBuffer,
        access: Access,
    ) -> Result<()> {
        self.acquire(kernel, slot, buffer, access)
    }

    pub(crate) fn dispatch(&mut self, kernel: KernelId, params: [u32; 4], invocations: u32) -> Result<()> {
        self.device.dispatch(kernel, params, invocations)
    }

    /// Copies every writable binding back to its host slice, then releases
    /// all bindings.
    pub(crate) fn finish(mut self) -> Result<()> {
        let read_back = std::mem::take(&mut self.read_back);
        for (buffer, host) in read_back {
            self.device.read(buffer, host)?;
        }
        Ok(())
    }
}

impl<D: ComputeDevice + ?Sized> Drop for BindingScope<'_, '_, D> {
    fn drop(&mut self) {
        debug!("releasing {} bindings", self.bound.len());
        for (kernel, slot) in self.bound.drain(..).rev() {
            if let Err(e) = self.device.unbind(kernel, slot) {
                warn!("failed to release slot {slot} of kernel {kernel:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::emulated::EmulatedDevice;
    use crate::ops::kernels::OUTER_PRODUCT;

    fn buffer(dev: &mut EmulatedDevice, label: &'static str, len: usize) -> PipelineBuffer {
        PipelineBuffer {
            id: dev.allocate(label, len).unwrap(),
            label,
            len,
        }
    }

    #[test]
    fn early_exit_releases_everything() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&OUTER_PRODUCT).unwrap();
        let a = buffer(&mut dev, "a", 2);
        let b = buffer(&mut dev, "b", 2);
        {
            let mut scope = BindingScope::new(&mut dev);
            scope.bind_readonly(k, 1, &a, &[1.0, 2.0]).unwrap();
            // too long for the buffer
            let err = scope.bind_readonly(k, 2, &b, &[1.0, 2.0, 3.0]).unwrap_err();
            assert!(matches!(err, OcrError::CapacityExceeded { stage: "b", .. }));
        }
        assert_eq!(dev.bound_slots(), 0);
    }

    #[test]
    fn finish_reads_back_writables() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&OUTER_PRODUCT).unwrap();
        let a = buffer(&mut dev, "a", 1);
        let b = buffer(&mut dev, "b", 2);
        let out = buffer(&mut dev, "out", 2);
        let mut host = [0.0; 2];
        {
            let mut scope = BindingScope::new(&mut dev);
            scope.bind_readonly(k, 1, &a, &[3.0]).unwrap();
            scope.bind_readonly(k, 2, &b, &[1.0, 2.0]).unwrap();
            scope.bind_writable(k, 3, &out, &mut host).unwrap();
            scope.dispatch(k, [1, 2, 0, 0], 2).unwrap();
            scope.finish().unwrap();
        }
        assert_eq!(host, [3.0, 6.0]);
        assert_eq!(dev.bound_slots(), 0);
    }
}
