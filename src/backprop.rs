//! Gradient engine for softmax + cross-entropy over a sigmoid hidden layer.
//!
//! # Closed-Form Backward Pass
//!
//! The gradients are written out by hand rather than derived by a generic
//! autograd tape:
//!
//! 1. forward pass → `y1`, `y2`
//! 2. `trueY = one_hot(label)`
//! 3. `da2 = (y2 - trueY) / batch_size`
//! 4. `dw2 = y1 ⊗ da2`, `db2 = da2`
//! 5. `sigmoid_grad = y1 ⊙ (1 - y1)`
//! 6. `da1 = (da2 · w2ᵗ) ⊙ sigmoid_grad`
//! 7. `dw1 = x ⊗ da1`, `db1 = da1`
//! 8. `cross_entropy_error = -Σ trueYᵢ · ln(y2ᵢ + ε)`
//!
//! Dividing `da2` by the batch size up front means that summing per-sample
//! gradients over a mini-batch yields their mean directly.
//!
//! ## Usage Guidelines
//!
//! - A label outside `[0, label_dim)` is reported as
//!   [`OcrError::IndexOutOfRange`]; a zero batch size as
//!   [`OcrError::DivideByZero`].
//! - Shape mismatches mean the caller broke the parameter invariants and are
//!   returned as [`OcrError::DimensionMismatch`], never patched over.

use crate::error::{OcrError, Result};
use crate::model::{ForwardResult, NeuralNetworkParameters, forward};
use crate::ops::cpu::{add_assign, divide, hadamard_product, outer_product, subtract, vec_mat};
use crate::tensors::{Matrix, almost_equals};

/// Added inside the logarithm of the cross-entropy so `ln(0)` never occurs.
pub const CROSS_ENTROPY_EPSILON: f32 = 1e-7;

/// Partial derivatives of the loss with respect to every parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct GradientSet {
    /// `∂L/∂w1`, `input × hidden`.
    pub dw1: Matrix,
    /// `∂L/∂b1`.
    pub db1: Vec<f32>,
    /// `∂L/∂w2`, `hidden × label`.
    pub dw2: Matrix,
    /// `∂L/∂b2`.
    pub db2: Vec<f32>,
    /// Cross-entropy of the sample (or summed over the samples accumulated).
    pub cross_entropy_error: f32,
}

impl GradientSet {
    /// A zero accumulator shaped like `params`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if `params` has a zero dimension.
    pub fn zeros_like(params: &NeuralNetworkParameters) -> Result<Self> {
        Ok(Self {
            dw1: Matrix::new(params.w1.rows(), params.w1.cols())?,
            db1: vec![0.0; params.b1.len()],
            dw2: Matrix::new(params.w2.rows(), params.w2.cols())?,
            db2: vec![0.0; params.b2.len()],
            cross_entropy_error: 0.0,
        })
    }

    /// Adds `other` into `self`, error term included.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if the two sets have different shapes.
    pub fn accumulate(&mut self, other: &Self) -> Result<()> {
        if self.dw1.shape() != other.dw1.shape() || self.dw2.shape() != other.dw2.shape() {
            return Err(OcrError::mismatch(
                "GradientSet::accumulate",
                format!("{:?}/{:?}", self.dw1.shape(), self.dw2.shape()),
                format!("{:?}/{:?}", other.dw1.shape(), other.dw2.shape()),
            ));
        }
        add_assign(self.dw1.data_mut(), other.dw1.data())?;
        add_assign(&mut self.db1, &other.db1)?;
        add_assign(self.dw2.data_mut(), other.dw2.data())?;
        add_assign(&mut self.db2, &other.db2)?;
        self.cross_entropy_error += other.cross_entropy_error;
        Ok(())
    }

    /// `true` if every gradient agrees with `other` within `tolerance`.
    ///
    /// The error term is compared too.
    #[must_use]
    pub fn almost_equals(&self, other: &Self, tolerance: f32) -> bool {
        self.dw1.almost_equals(&other.dw1, tolerance)
            && almost_equals(&self.db1, &other.db1, tolerance)
            && self.dw2.almost_equals(&other.dw2, tolerance)
            && almost_equals(&self.db2, &other.db2, tolerance)
            && almost_equals(&[self.cross_entropy_error], &[other.cross_entropy_error], tolerance)
    }
}

/// One-hot encoding of `index` over `len` classes.
///
/// # Errors
/// [`OcrError::IndexOutOfRange`] if `index >= len`.
pub fn one_hot(index: usize, len: usize) -> Result<Vec<f32>> {
    if index >= len {
        return Err(OcrError::IndexOutOfRange { index, len });
    }
    let mut encoding = vec![0.0; len];
    encoding[index] = 1.0;
    Ok(encoding)
}

/// `-Σ trueYᵢ · ln(predictedᵢ + ε)`.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn cross_entropy_error(predicted: &[f32], true_y: &[f32]) -> Result<f32> {
    if predicted.len() != true_y.len() {
        return Err(OcrError::mismatch("cross_entropy_error", true_y.len(), predicted.len()));
    }
    Ok(predicted
        .iter()
        .zip(true_y)
        .map(|(p, t)| -t * (p + CROSS_ENTROPY_EPSILON).ln())
        .sum())
}

/// Output-logit gradient `(y2 - one_hot(label)) / batch_size` and the
/// sample's cross-entropy.
///
/// Shared by the reference and accelerated executors, which both compute this
/// small step on the host.
///
/// # Errors
/// See [`backward`].
pub fn output_delta(y2: &[f32], true_label: usize, batch_size: usize) -> Result<(Vec<f32>, f32)> {
    let true_y = one_hot(true_label, y2.len())?;
    if batch_size == 0 {
        return Err(OcrError::DivideByZero("backward: batch size"));
    }
    let da2 = divide(&subtract(y2, &true_y)?, batch_size as f32)?;
    let error = cross_entropy_error(y2, &true_y)?;
    Ok((da2, error))
}

/// Computes all gradients for one sample.
///
/// # Errors
/// - [`OcrError::IndexOutOfRange`] if `true_label >= label_dim`
/// - [`OcrError::DivideByZero`] if `batch_size == 0`
/// - [`OcrError::DimensionMismatch`] if `x` or `params` are malformed
pub fn backward(
    x: &[f32],
    params: &NeuralNetworkParameters,
    true_label: usize,
    batch_size: usize,
) -> Result<GradientSet> {
    let fwd = forward(x, params)?;
    backward_from(x, params, &fwd, true_label, batch_size)
}

/// Like [`backward`], reusing a forward pass the caller already ran.
///
/// # Errors
/// See [`backward`].
pub fn backward_from(
    x: &[f32],
    params: &NeuralNetworkParameters,
    fwd: &ForwardResult,
    true_label: usize,
    batch_size: usize,
) -> Result<GradientSet> {
    // softmax + cross-entropy
    let (da2, cross_entropy_error) = output_delta(&fwd.y2, true_label, batch_size)?;
    let dw2 = outer_product(&fwd.y1, &da2)?;

    // sigmoid, expressed through its own output
    let ones = vec![1.0; fwd.y1.len()];
    let sigmoid_grad = hadamard_product(&fwd.y1, &subtract(&ones, &fwd.y1)?)?;
    let da1 = hadamard_product(vec_mat(&da2, &params.w2.transposed())?.data(), &sigmoid_grad)?;
    let dw1 = outer_product(x, &da1)?;

    Ok(GradientSet {
        dw1,
        db1: da1,
        dw2,
        db2: da2,
        cross_entropy_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_hot_rejects_out_of_range_labels() {
        assert_eq!(one_hot(2, 3).unwrap(), vec![0.0, 0.0, 1.0]);
        assert!(matches!(
            one_hot(3, 3),
            Err(OcrError::IndexOutOfRange { index: 3, len: 3 })
        ));
    }

    #[test]
    fn zero_batch_size_is_divide_by_zero() {
        let p = NeuralNetworkParameters::zeros(2, 2, 2).unwrap();
        assert!(matches!(
            backward(&[0.5, 0.5], &p, 0, 0),
            Err(OcrError::DivideByZero(_))
        ));
    }

    #[test]
    fn accumulate_sums_error_terms() {
        let p = NeuralNetworkParameters::zeros(2, 2, 2).unwrap();
        let g = backward(&[1.0, 0.0], &p, 1, 1).unwrap();
        let mut acc = GradientSet::zeros_like(&p).unwrap();
        acc.accumulate(&g).unwrap();
        acc.accumulate(&g).unwrap();
        assert!((acc.cross_entropy_error - 2.0 * g.cross_entropy_error).abs() < 1e-6);
        assert!((acc.db2[1] - 2.0 * g.db2[1]).abs() < 1e-6);
    }
}
