//! simple_ocr: a two-layer handwritten-digit classifier with a CPU reference
//! path and an accelerated kernel-dispatch path.
//!
//! The network is `linear → sigmoid → linear → softmax`, trained with
//! mini-batch stochastic gradient descent on cross-entropy loss. Forward and
//! backward passes run behind the [`backend::Executor`] trait, either on
//! plain host algebra or as a pipeline of compute kernels over bound device
//! buffers, and the two can be cross-checked against each other at runtime.
//!
//! # Features
//!
//! - Dense row-major matrices and shape-checked kernels with accumulating GEMM
//! - Closed-form gradients for softmax + cross-entropy over a sigmoid layer
//! - Shuffled mini-batch SGD with early stopping, a stop flag and per-epoch
//!   progress reporting
//! - A kernel pipeline on any [`ops::device::ComputeDevice`]: a host-side
//!   emulated device always, a `wgpu` GPU device behind the `wgpu` feature
//! - IDX (MNIST) loading, gzip included
//!
//! # Modules
//!
//! - [`tensors`]: the [`tensors::Matrix`] type
//! - [`ops`]: host algebra, device trait, kernels, devices
//! - [`model`]: parameters and the forward pass
//! - [`backprop`]: the gradient engine
//! - [`accelerated`]: the kernel pipeline executor
//! - [`backend`]: executor trait, CPU reference, cross-check, backend switch
//! - [`train`]: configuration and the training loop
//! - [`dataset`]: IDX reader and the in-memory training set
//! - [`error`]: [`error::OcrError`]
//!
//! # Example
//!
//! ```rust
//! use simple_ocr::backend::{Backend, Executor};
//! use simple_ocr::model::NeuralNetworkParameters;
//! use rand::{SeedableRng, rngs::StdRng};
//!
//! let mut rng = StdRng::seed_from_u64(1);
//! let params = NeuralNetworkParameters::random(16, 8, 4, &mut rng).unwrap();
//! let x = vec![0.25; 16];
//!
//! let cpu = Backend::Cpu.executor(false).unwrap().forward(&x, &params).unwrap();
//! let acc = Backend::Emulated.executor(false).unwrap().forward(&x, &params).unwrap();
//! assert_eq!(cpu.max_index(), acc.max_index());
//! ```

#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::many_single_char_names,
    clippy::cast_possible_truncation,
    clippy::similar_names,
    clippy::cast_precision_loss,
    clippy::module_name_repetitions
)]
#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod accelerated;
pub mod backend;
pub mod backprop;
pub mod dataset;
pub mod error;
pub mod model;
pub mod ops;
pub mod tensors;
pub mod train;
