//! # Compute Layer
//!
//! Host algebra plus the accelerator runtime the kernel pipeline runs on.
//!
//! ## Submodules
//!
//! - [`cpu`]: shape-checked vector/matrix kernels (rayon row parallelism)
//! - [`device`]: the [`ComputeDevice`](device::ComputeDevice) trait: compile,
//!   allocate, bind, dispatch, read back
//! - [`kernels`]: the WGSL kernel catalog and host versions of each kernel
//! - [`emulated`]: a software device that runs the host kernels
//! - [`wgpu`] *(opt-in)*: a GPU device built on `wgpu`
//!
//! ## Adding a Kernel
//!
//! 1. Write the WGSL under `ops/shaders/` with a `vec4<u32>` parameter block
//!    at binding `0`, and use every declared binding
//! 2. Add a [`KernelSource`](device::KernelSource) to [`kernels`] listing its
//!    slots in binding order
//! 3. Add the host version and register it in `host_kernel`
//!
//! ## Feature Flags
//!
//! - `wgpu`: enables the [`wgpu`] module (`wgpu`, `pollster`, `bytemuck`)

pub mod cpu;
pub mod device;
pub mod emulated;
pub mod kernels;
#[cfg(feature = "wgpu")]
pub mod wgpu;
