//! GPU [`ComputeDevice`] built on WGPU + WGSL.
//!
//! This module compiles the bundled kernels from [`crate::ops::kernels`] into
//! compute pipelines and drives them through storage buffers:
//!
//! - every kernel gets a 16-byte uniform buffer for its `vec4<u32>`
//!   parameter block (binding `0`)
//! - data buffers are `STORAGE | COPY_DST | COPY_SRC` and are filled with
//!   `Queue::write_buffer`
//! - a bind group is assembled at dispatch time from the slots currently
//!   bound, so unbinding is purely host-side bookkeeping
//! - read-back goes through a `MAP_READ` staging buffer
//!
//! All async WGPU calls are resolved with `pollster::block_on`, and every
//! dispatch waits for the queue to drain, so calls are strictly sequential.

use std::collections::BTreeMap;
use std::sync::mpsc;

use log::{debug, info};
use wgpu::util::DeviceExt;

use crate::error::{OcrError, Result};
use crate::ops::device::{Access, BufferId, ComputeDevice, KernelId, KernelSource};

/// Holds the WGPU device and queue used for executing compute pipelines.
pub struct GpuContext {
    /// The actual GPU device.
    pub device: wgpu::Device,
    /// Submission queue of the device.
    pub queue: wgpu::Queue,
}

impl GpuContext {
    /// Selects the default adapter and creates a device + queue.
    ///
    /// # Errors
    /// [`OcrError::Device`] if no adapter is available or the device request
    /// fails.
    ///
    /// # Internals
    /// - Uses `pollster::block_on` to synchronously wait for async WGPU calls
    /// - Enables default limits and features for broad compatibility
    pub fn new() -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(|e| OcrError::Device(format!("adapter: {e}")))?;
        info!("wgpu adapter: {}", adapter.get_info().name);
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("simple_ocr"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| OcrError::Device(format!("device: {e}")))?;

        Ok(Self { device, queue })
    }
}

struct WgpuKernel {
    source: &'static KernelSource,
    pipeline: wgpu::ComputePipeline,
    layout: wgpu::BindGroupLayout,
    params: wgpu::Buffer,
    bindings: BTreeMap<u32, BufferId>,
}

struct WgpuBuffer {
    label: &'static str,
    buffer: wgpu::Buffer,
    len: usize,
}

/// A [`ComputeDevice`] backed by a real GPU adapter.
pub struct WgpuDevice {
    ctx: GpuContext,
    kernels: Vec<WgpuKernel>,
    buffers: BTreeMap<usize, WgpuBuffer>,
    next_buffer: usize,
}

impl WgpuDevice {
    /// Opens the default adapter.
    ///
    /// # Errors
    /// See [`GpuContext::new`].
    pub fn new() -> Result<Self> {
        Ok(Self::with_context(GpuContext::new()?))
    }

    /// Wraps an existing context.
    #[must_use]
    pub const fn with_context(ctx: GpuContext) -> Self {
        Self {
            ctx,
            kernels: Vec::new(),
            buffers: BTreeMap::new(),
            next_buffer: 0,
        }
    }

    fn kernel_mut(&mut self, id: KernelId) -> Result<&mut WgpuKernel> {
        self.kernels
            .get_mut(id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown kernel {}", id.0)))
    }

    fn buffer(&self, id: BufferId) -> Result<&WgpuBuffer> {
        self.buffers
            .get(&id.0)
            .ok_or_else(|| OcrError::Device(format!("unknown buffer {}", id.0)))
    }

    fn wait(&self) -> Result<()> {
        self.ctx
            .device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| OcrError::Device(format!("poll: {e}")))
    }
}

const fn byte_len(len: usize) -> u64 {
    (len * std::mem::size_of::<f32>()) as u64
}

impl ComputeDevice for WgpuDevice {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn compile(&mut self, source: &'static KernelSource) -> Result<KernelId> {
        let device = &self.ctx.device;
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(source.name),
            source: wgpu::ShaderSource::Wgsl(source.wgsl.into()),
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(source.name),
            layout: None,
            module: &module,
            entry_point: Some("main"),
            cache: None,
            compilation_options: wgpu::PipelineCompilationOptions::default(),
        });
        let layout = pipeline.get_bind_group_layout(0);
        let params = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("dims"),
            contents: bytemuck::cast_slice(&[0u32; 4]),
            usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
        });

        self.kernels.push(WgpuKernel {
            source,
            pipeline,
            layout,
            params,
            bindings: BTreeMap::new(),
        });
        Ok(KernelId(self.kernels.len() - 1))
    }

    fn allocate(&mut self, label: &'static str, len: usize) -> Result<BufferId> {
        // zero-sized bindings are invalid in WGPU
        let buffer = self.ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size: byte_len(len.max(1)),
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let id = self.next_buffer;
        self.next_buffer += 1;
        self.buffers.insert(id, WgpuBuffer { label, buffer, len });
        Ok(BufferId(id))
    }

    fn release(&mut self, buffer: BufferId) -> Result<()> {
        let b = self
            .buffers
            .remove(&buffer.0)
            .ok_or_else(|| OcrError::Device(format!("unknown buffer {}", buffer.0)))?;
        b.buffer.destroy();
        Ok(())
    }

    fn write(&mut self, buffer: BufferId, data: &[f32]) -> Result<()> {
        let b = self.buffer(buffer)?;
        if data.len() > b.len {
            return Err(OcrError::CapacityExceeded {
                stage: b.label,
                requested: data.len(),
                capacity: b.len,
            });
        }
        if !data.is_empty() {
            self.ctx.queue.write_buffer(&b.buffer, 0, bytemuck::cast_slice(data));
        }
        Ok(())
    }

    fn read(&mut self, buffer: BufferId, out: &mut [f32]) -> Result<()> {
        let b = self.buffer(buffer)?;
        if out.len() > b.len {
            return Err(OcrError::CapacityExceeded {
                stage: b.label,
                requested: out.len(),
                capacity: b.len,
            });
        }
        if out.is_empty() {
            return Ok(());
        }

        let size = byte_len(out.len());
        let device = &self.ctx.device;
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("read_back"),
        });
        encoder.copy_buffer_to_buffer(&b.buffer, 0, &staging, 0, size);
        self.ctx.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        self.wait()?;
        rx.recv()
            .map_err(|e| OcrError::Device(format!("map callback dropped: {e}")))?
            .map_err(|e| OcrError::Device(format!("map: {e}")))?;

        {
            let data = slice.get_mapped_range();
            let floats: &[f32] = bytemuck::try_cast_slice(&data[..])
                .map_err(|e| OcrError::Device(format!("read back: {e}")))?;
            out.copy_from_slice(floats);
        }
        staging.unmap();
        Ok(())
    }

    fn bind(&mut self, kernel: KernelId, slot: u32, buffer: BufferId, access: Access) -> Result<()> {
        self.buffer(buffer)?;
        let k = self.kernel_mut(kernel)?;
        match k.source.slot_access(slot) {
            Some(declared) if declared == access => {}
            declared => {
                return Err(OcrError::Device(format!(
                    "{}: slot {slot} declared {declared:?}, bound as {access:?}",
                    k.source.name
                )));
            }
        }
        if k.bindings.contains_key(&slot) {
            return Err(OcrError::Device(format!("{}: slot {slot} is already bound", k.source.name)));
        }
        k.bindings.insert(slot, buffer);
        Ok(())
    }

    fn unbind(&mut self, kernel: KernelId, slot: u32) -> Result<()> {
        let k = self.kernel_mut(kernel)?;
        match k.bindings.remove(&slot) {
            Some(_) => Ok(()),
            None => Err(OcrError::Device(format!("{}: slot {slot} is not bound", k.source.name))),
        }
    }

    fn dispatch(&mut self, kernel: KernelId, params: [u32; 4], invocations: u32) -> Result<()> {
        let k = self
            .kernels
            .get(kernel.0)
            .ok_or_else(|| OcrError::Device(format!("unknown kernel {}", kernel.0)))?;
        let source = k.source;
        if source.single_workgroup && invocations > source.workgroup_size {
            return Err(OcrError::CapacityExceeded {
                stage: source.name,
                requested: invocations as usize,
                capacity: source.workgroup_size as usize,
            });
        }
        let workgroups = source.workgroups(invocations);
        let max = self.ctx.device.limits().max_compute_workgroups_per_dimension;
        if workgroups > max {
            return Err(OcrError::CapacityExceeded {
                stage: source.name,
                requested: workgroups as usize,
                capacity: max as usize,
            });
        }

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: k.params.as_entire_binding(),
        }];
        for slot in 1..=source.slots.len() as u32 {
            let id = k
                .bindings
                .get(&slot)
                .ok_or_else(|| OcrError::Device(format!("{}: slot {slot} is unbound", source.name)))?;
            entries.push(wgpu::BindGroupEntry {
                binding: slot,
                resource: self.buffer(*id)?.buffer.as_entire_binding(),
            });
        }

        let device = &self.ctx.device;
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(source.name),
            layout: &k.layout,
            entries: &entries,
        });

        self.ctx.queue.write_buffer(&k.params, 0, bytemuck::cast_slice(&params));
        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(source.name),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some(source.name),
                timestamp_writes: None,
            });
            pass.set_pipeline(&k.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(workgroups, 1, 1);
        }
        self.ctx.queue.submit(Some(encoder.finish()));
        debug!("wgpu dispatch {} params={params:?} workgroups={workgroups}", source.name);
        self.wait()
    }
}
