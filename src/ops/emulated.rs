//! Software [`ComputeDevice`] that runs kernels on the host.
//!
//! Buffers are plain `Vec<f32>`s and each compiled kernel resolves to its
//! host implementation from [`crate::ops::kernels`]. Binding rules are
//! enforced the way a GPU validation layer would: dispatching with an unbound
//! slot, binding a slot with the wrong access, or binding one buffer as both
//! input and output of the same dispatch is a [`OcrError::Device`] error.

use std::collections::BTreeMap;

use log::debug;

use crate::error::{OcrError, Result};
use crate::ops::device::{Access, BufferId, ComputeDevice, KernelId, KernelSource};
use crate::ops::kernels::{HostKernel, host_kernel};

struct EmulatedKernel {
    source: &'static KernelSource,
    run: HostKernel,
    bindings: BTreeMap<u32, BufferId>,
}

struct EmulatedBuffer {
    label: &'static str,
    data: Vec<f32>,
}

/// Host-side accelerator.
///
/// Buffer ids are never reused, so a stale [`BufferId`] fails instead of
/// aliasing a newer allocation.
#[derive(Default)]
pub struct EmulatedDevice {
    kernels: Vec<EmulatedKernel>,
    buffers: BTreeMap<usize, EmulatedBuffer>,
    next_buffer: usize,
    dispatches: u64,
}

impl EmulatedDevice {
    /// An empty device.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of dispatches executed so far.
    #[must_use]
    pub const fn dispatch_count(&self) -> u64 {
        self.dispatches
    }

    /// Number of slots currently bound across all kernels.
    #[must_use]
    pub fn bound_slots(&self) -> usize {
        self.kernels.iter().map(|k| k.bindings.len()).sum()
    }

    /// Number of buffers allocated and not yet released.
    #[must_use]
    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    fn kernel(&self, id: KernelId) -> Result<&EmulatedKernel> {
        self.kernels
            .get(id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown kernel {}", id.0)))
    }

    fn kernel_mut(&mut self, id: KernelId) -> Result<&mut EmulatedKernel> {
        self.kernels
            .get_mut(id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown kernel {}", id.0)))
    }

    fn buffer(&self, id: BufferId) -> Result<&EmulatedBuffer> {
        self.buffers
            .get(&id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown buffer {}", id.0)))
    }

    fn buffer_mut(&mut self, id: BufferId) -> Result<&mut EmulatedBuffer> {
        self.buffers
            .get_mut(&id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown buffer {}", id.0)))
    }
}

impl ComputeDevice for EmulatedDevice {
    fn name(&self) -> &'static str {
        "emulated"
    }

    fn compile(&mut self, source: &'static KernelSource) -> Result<KernelId> {
        let run = host_kernel(source.name)
            .ok_or_else(|| OcrError::Device(format!("no host implementation for kernel `{}`", source.name)))?;
        self.kernels.push(EmulatedKernel {
            source,
            run,
            bindings: BTreeMap::new(),
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn allocate(&mut self, label: &'static str, len: usize) -> Result<BufferId> {
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(
            id,
            EmulatedBuffer {
                label,
                data: vec![0.0; len],
            },
        );
        Ok(BufferId(id))
    }

    fn release(&mut self, buffer: BufferId) -> Result<()> {
        self.buffers
            .remove(&buffer.0)
            .map(|_| ())
            .ok_or_else(|| OcrError::Device(format!("unknown buffer {}", buffer.0)))
    }

    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<()> {
        let b = self.buffer_mut(buffer)?;
        if data.len() > b.data.len() {
            return Err(OcrError::CapacityExceeded {
                stage: b.label,
                requested: data.len(),
                capacity: b.data.len(),
            });
        }
        b.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        let b = self.buffer(buffer)?;
        if out.len() > b.data.len() {
            return Err(OcrError::CapacityExceeded {
                stage: b.label,
                requested: out.len(),
                capacity: b.data.len(),
            });
        }
        out.copy_from_slice(&b.data[..out.len()]);
        Ok(())
    }

    fn bind(&mut self, kernel: KernelId, slot: u32, buffer: BufferId, access: Access) -> Result<()> {
        self.buffer(buffer)?;
        let k = self.kernel_mut(kernel)?;
        match k.source.slot_access(slot) {
            None => {
                return Err(OcrError::Device(format!("{}: no slot {slot}", k.source.name)));
            }
            Some(declared) if declared != access => {
                return Err(OcrError::Device(format!(
                    "{}: slot {slot} is {declared:?}, bound as {access:?}",
                    k.source.name
                )));
            }
            Some(_) => {}
        }
        if k.bindings.contains_key(&slot) {
            return Err(OcrError::Device(format!("{}: slot {slot} is already bound", k.source.name)));
        }
        k.bindings.insert(slot, buffer);
        Ok(())
    }

    fn unbind(&mut self, kernel: KernelId, slot: u32) -> Result<()> {
        let k = self.kernel_mut(kernel)?;
        k.bindings
            .remove(&slot)
            .map(|_| ())
            .ok_or_else(|| OcrError::Device(format!("{}: slot {slot} is not bound", k.source.name)))
    }

    fn dispatch(&mut self, kernel: KernelId, params: [u32; 4], invocations: u32) -> Result<()> {
        let k = self.kernel(kernel)?;
        let source = k.source;
        let run = k.run;

        if source.single_workgroup && invocations > source.workgroup_size {
            return Err(OcrError::CapacityExceeded {
                stage: source.name,
                requested: invocations as usize,
                capacity: source.workgroup_size as usize,
            });
        }

        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        for (index, access) in source.slots.iter().enumerate() {
            let slot = index as u32 + 1;
            let Some(&buffer) = k.bindings.get(&slot) else {
                return Err(OcrError::Device(format!("{}: slot {slot} is unbound", source.name)));
            };
            match access {
                Access::ReadOnly => inputs.push(buffer),
                Access::Writable => outputs.push(buffer),
            }
        }
        for &id in inputs.iter().chain(&outputs) {
            self.buffer(id)?;
        }
        for (i, out) in outputs.iter().enumerate() {
            if inputs.contains(out) || outputs[..i].contains(out) {
                return Err(OcrError::Device(format!(
                    "{}: buffer {} is bound to more than one slot with write access",
                    source.name, out.0
                )));
            }
        }

        debug!(
            "emulated dispatch {} params={params:?} invocations={invocations} workgroups={}",
            source.name,
            source.workgroups(invocations)
        );

        // writable buffers leave the table for the duration of the run
        let mut taken = Vec::with_capacity(outputs.len());
        for &id in &outputs {
            taken.push(std::mem::take(&mut self.buffer_mut(id)?.data));
        }
        let result = {
            let mut views = Vec::with_capacity(inputs.len());
            for &id in &inputs {
                views.push(self.buffer(id)?.data.as_slice());
            }
            run(params, invocations, &views, &mut taken)
        };
        for (&id, data) in outputs.iter().zip(taken) {
            self.buffer_mut(id)?.data = data;
        }

        self.dispatches += 1;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::kernels::{OUTER_PRODUCT, SOFTMAX};

    #[test]
    fn unbound_slot_fails_dispatch() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&OUTER_PRODUCT).unwrap();
        let a = dev.allocate("a", 2).unwrap();
        dev.bind(k, 1, a, Access::ReadOnly).unwrap();
        assert!(matches!(dev.dispatch(k, [2, 2, 0, 0], 4), Err(OcrError::Device(_))));
    }

    #[test]
    fn access_must_match_declaration() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&OUTER_PRODUCT).unwrap();
        let a = dev.allocate("a", 2).unwrap();
        assert!(dev.bind(k, 1, a, Access::Writable).is_err());
        assert!(dev.bind(k, 9, a, Access::ReadOnly).is_err());
    }

    #[test]
    fn outer_product_round_trip() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&OUTER_PRODUCT).unwrap();
        let a = dev.allocate("a", 2).unwrap();
        let b = dev.allocate("b", 3).unwrap();
        let out = dev.allocate("out", 6).unwrap();
        dev.write(a, &[1.0, 2.0]).unwrap();
        dev.write(b, &[3.0, 4.0, 5.0]).unwrap();
        dev.bind(k, 1, a, Access::ReadOnly).unwrap();
        dev.bind(k, 2, b, Access::ReadOnly).unwrap();
        dev.bind(k, 3, out, Access::Writable).unwrap();
        dev.dispatch(k, [2, 3, 0, 0], 6).unwrap();

        let mut host = [0.0; 6];
        dev.read(out, &mut host).unwrap();
        assert_eq!(host, [3.0, 4.0, 5.0, 6.0, 8.0, 10.0]);
        assert_eq!(dev.dispatch_count(), 1);
    }

    #[test]
    fn single_workgroup_kernel_rejects_oversized_dispatch() {
        let mut dev = EmulatedDevice::new();
        let k = dev.compile(&SOFTMAX).unwrap();
        assert!(matches!(
            dev.dispatch(k, [300, 0, 0, 0], 300),
            Err(OcrError::CapacityExceeded { stage: "softmax", .. })
        ));
    }

    #[test]
    fn released_buffers_leave_the_table() {
        let mut dev = EmulatedDevice::new();
        let keep = dev.allocate("keep", 4).unwrap();
        for _ in 0..100 {
            let tmp = dev.allocate("tmp", 1024).unwrap();
            dev.release(tmp).unwrap();
        }
        assert_eq!(dev.buffers.len(), 1);
        assert_eq!(dev.live_buffers(), 1);

        let stale = dev.allocate("stale", 2).unwrap();
        dev.release(stale).unwrap();
        let fresh = dev.allocate("fresh", 2).unwrap();
        assert_ne!(stale, fresh);
        assert!(dev.write(stale, &[1.0]).is_err());
        assert!(dev.release(stale).is_err());
        dev.write(keep, &[1.0; 4]).unwrap();
    }

    #[test]
    fn oversized_write_is_capacity_exceeded() {
        let mut dev = EmulatedDevice::new();
        let a = dev.allocate("x", 2).unwrap();
        assert!(matches!(
            dev.write(a, &[1.0, 2.0, 3.0]),
            Err(OcrError::CapacityExceeded { stage: "x", requested: 3, capacity: 2 })
        ));
    }
}
