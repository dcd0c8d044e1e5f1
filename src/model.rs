//! Parameters and the forward pass of the two-layer classifier.
//!
//! ```text
//! x -> [w1 + b1] -> a1 -> sigmoid -> y1 -> [w2 + b2] -> a2 -> softmax -> y2
//! ```
//!
//! The forward pass is a pure function of its input and a borrowed
//! [`NeuralNetworkParameters`]; nothing is cached between calls.

use rand::Rng;

use crate::error::{OcrError, Result};
use crate::ops::cpu::gemm_vec;
use crate::tensors::Matrix;

/// Weights and biases of the network.
///
/// Shapes: `w1: input × hidden`, `b1: hidden`, `w2: hidden × label`,
/// `b2: label`.
#[derive(Debug, Clone, PartialEq)]
pub struct NeuralNetworkParameters {
    /// Input → hidden weights.
    pub w1: Matrix,
    /// Hidden bias.
    pub b1: Vec<f32>,
    /// Hidden → output weights.
    pub w2: Matrix,
    /// Output bias.
    pub b2: Vec<f32>,
}

impl NeuralNetworkParameters {
    /// Assembles a parameter set and checks the shape invariants.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if the pieces do not fit together.
    pub fn new(w1: Matrix, b1: Vec<f32>, w2: Matrix, b2: Vec<f32>) -> Result<Self> {
        let params = Self { w1, b1, w2, b2 };
        params.validate()?;
        Ok(params)
    }

    /// Random parameters, every value uniform in `[-1, 1]`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if any dimension is zero.
    pub fn random<R: Rng + ?Sized>(
        input_dim: usize,
        hidden_dim: usize,
        label_dim: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let w1 = Matrix::random_uniform(input_dim, hidden_dim, -1.0..=1.0, rng)?;
        let b1: Vec<f32> = (0..hidden_dim).map(|_| rng.random_range(-1.0..=1.0)).collect();
        let w2 = Matrix::random_uniform(hidden_dim, label_dim, -1.0..=1.0, rng)?;
        let b2: Vec<f32> = (0..label_dim).map(|_| rng.random_range(-1.0..=1.0)).collect();
        Self::new(w1, b1, w2, b2)
    }

    /// All-zero parameters with the given dimensions.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if any dimension is zero.
    pub fn zeros(input_dim: usize, hidden_dim: usize, label_dim: usize) -> Result<Self> {
        Self::new(
            Matrix::new(input_dim, hidden_dim)?,
            vec![0.0; hidden_dim],
            Matrix::new(hidden_dim, label_dim)?,
            vec![0.0; label_dim],
        )
    }

    /// Checks `w1.cols == b1.len == w2.rows` and `w2.cols == b2.len`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] naming the first broken invariant.
    pub fn validate(&self) -> Result<()> {
        if self.w1.cols() != self.w2.rows() {
            return Err(OcrError::mismatch("parameters: w1.cols == w2.rows", self.w1.cols(), self.w2.rows()));
        }
        if self.b1.len() != self.w1.cols() {
            return Err(OcrError::mismatch("parameters: b1.len == hidden", self.w1.cols(), self.b1.len()));
        }
        if self.b2.len() != self.w2.cols() {
            return Err(OcrError::mismatch("parameters: b2.len == labels", self.w2.cols(), self.b2.len()));
        }
        Ok(())
    }

    /// Length of an input vector.
    #[must_use]
    pub const fn input_dim(&self) -> usize {
        self.w1.rows()
    }

    /// Number of hidden units.
    #[must_use]
    pub const fn hidden_dim(&self) -> usize {
        self.w1.cols()
    }

    /// Number of classes.
    #[must_use]
    pub const fn label_dim(&self) -> usize {
        self.w2.cols()
    }

    /// `(input, hidden, label)` in one tuple.
    #[must_use]
    pub const fn dims(&self) -> (usize, usize, usize) {
        (self.input_dim(), self.hidden_dim(), self.label_dim())
    }
}

/// Activations produced by one forward pass.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardResult {
    /// Hidden activations after sigmoid.
    pub y1: Vec<f32>,
    /// Output distribution after softmax.
    pub y2: Vec<f32>,
}

impl ForwardResult {
    /// The output distribution.
    #[must_use]
    pub fn output(&self) -> &[f32] {
        &self.y2
    }

    /// Predicted class: index of the largest output.
    ///
    /// Ties resolve to the lowest index.
    #[must_use]
    pub fn max_index(&self) -> usize {
        let mut best = 0;
        for (i, &v) in self.y2.iter().enumerate().skip(1) {
            if v > self.y2[best] {
                best = i;
            }
        }
        best
    }
}

/// Logistic sigmoid `1 / (1 + e^-v)` applied element-wise.
#[must_use]
pub fn sigmoid(a: &[f32]) -> Vec<f32> {
    a.iter().map(|&v| 1.0 / (1.0 + (-v).exp())).collect()
}

/// Softmax in the max-shifted form.
///
/// `α = max(a)`, then `exp(aᵢ - α) / Σ exp(aⱼ - α)`. The shift keeps every
/// exponent `≤ 0`, so large logits cannot overflow. An empty input yields an
/// empty output.
#[must_use]
pub fn softmax(a: &[f32]) -> Vec<f32> {
    let Some(&first) = a.first() else {
        return Vec::new();
    };
    let alpha = a.iter().copied().fold(first, f32::max);
    let mut y: Vec<f32> = a.iter().map(|&v| (v - alpha).exp()).collect();
    let sum: f32 = y.iter().sum();
    y.iter_mut().for_each(|v| *v /= sum);
    y
}

/// Runs the network on one input vector.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `x` does not have `input_dim` elements
/// or the parameters are malformed.
pub fn forward(x: &[f32], params: &NeuralNetworkParameters) -> Result<ForwardResult> {
    if x.len() != params.input_dim() {
        return Err(OcrError::mismatch("forward: input", params.input_dim(), x.len()));
    }

    let mut a1 = params.b1.clone();
    gemm_vec(x, &params.w1, &mut a1)?; // a1 = x·w1 + b1
    let y1 = sigmoid(&a1);

    let mut a2 = params.b2.clone();
    gemm_vec(&y1, &params.w2, &mut a2)?; // a2 = y1·w2 + b2
    let y2 = softmax(&a2);

    Ok(ForwardResult { y1, y2 })
}
