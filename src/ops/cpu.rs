//! Dense vector and matrix kernels on the host.
//!
//! # CPU Algebra
//!
//! These are the primitives every higher layer is written in terms of. Each
//! operation validates operand shapes before touching memory and reports
//! [`OcrError::DimensionMismatch`] on incompatible inputs.
//!
//! ## Implemented Ops
//!
//! - `subtract`, `divide`, `hadamard_product`, `dot_product` on flat vectors
//! - `vec_mat` (`vᵗA`, 1×cols) and `mat_vec` (`Ab`, rows×1)
//! - `mat_mul` (`AB`)
//! - `gemm_vec` (`c += aᵗB`) and `gemm` (`C += AB`)
//! - `outer_product` (`a ⊗ b`)
//! - `add_assign` and `sub_scaled_assign` for gradient bookkeeping
//!
//! ## Accumulating GEMM
//!
//! `gemm_vec` and `gemm` **add into** their output instead of overwriting it.
//! Callers either zero the output first or pre-seed it, e.g. with a bias
//! vector, so that `a = b; gemm_vec(x, w, &mut a)` computes `x·w + b` without
//! an extra allocation. Every other function here is pure.
//!
//! ## Parallelism
//!
//! Matrix-producing kernels split their output by rows with
//! [`rayon`](https://docs.rs/rayon); per-row summation order is sequential so
//! results are deterministic.

use rayon::prelude::*;

use crate::error::{OcrError, Result};
use crate::tensors::Matrix;

fn same_len(op: &'static str, a: &[f32], b: &[f32]) -> Result<()> {
    if a.len() == b.len() {
        Ok(())
    } else {
        Err(OcrError::mismatch(op, a.len(), b.len()))
    }
}

/// `a - b` element-wise.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn subtract(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    same_len("subtract", a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x - y).collect())
}

/// `a / b` for a scalar divisor.
///
/// # Errors
/// [`OcrError::DivideByZero`] if `b` is exactly zero.
pub fn divide(a: &[f32], b: f32) -> Result<Vec<f32>> {
    if b == 0.0 {
        return Err(OcrError::DivideByZero("divide"));
    }
    Ok(a.iter().map(|x| x / b).collect())
}

/// Row vector times matrix: `vᵗA`, a `1 × A.cols()` matrix.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `A.rows() != v.len()`.
pub fn vec_mat(v: &[f32], a: &Matrix) -> Result<Matrix> {
    if a.rows() != v.len() {
        return Err(OcrError::mismatch("vec_mat", a.rows(), v.len()));
    }
    let mut out = vec![0.0; a.cols()];
    gemm_vec(v, a, &mut out)?;
    Matrix::row_major(out)
}

/// Matrix times column vector: `Ab`, an `A.rows() × 1` matrix.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `A.cols() != b.len()`.
pub fn mat_vec(a: &Matrix, b: &[f32]) -> Result<Matrix> {
    if a.cols() != b.len() {
        return Err(OcrError::mismatch("mat_vec", a.cols(), b.len()));
    }
    let out: Vec<f32> = (0..a.rows())
        .into_par_iter()
        .map(|i| a.row(i).iter().zip(b).map(|(x, y)| x * y).sum::<f32>())
        .collect();
    Matrix::column_major(out)
}

/// Matrix product `AB`.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `A.cols() != B.rows()`.
pub fn mat_mul(a: &Matrix, b: &Matrix) -> Result<Matrix> {
    let mut out = Matrix::new(a.rows(), b.cols())?;
    gemm(a, b, &mut out)?;
    Ok(out)
}

/// Accumulating vector GEMM: `c += aᵗB`.
///
/// `c` is **not** cleared first. Pre-seed it with a bias or zero it to get a
/// plain product.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `B.rows() != a.len()` or
/// `B.cols() != c.len()`.
pub fn gemm_vec(a: &[f32], b: &Matrix, c: &mut [f32]) -> Result<()> {
    if b.rows() != a.len() || b.cols() != c.len() {
        return Err(OcrError::mismatch(
            "gemm_vec",
            format!("{}x{}", a.len(), c.len()),
            format!("{}x{}", b.rows(), b.cols()),
        ));
    }
    for (i, &ai) in a.iter().enumerate() {
        for (cj, &bij) in c.iter_mut().zip(b.row(i)) {
            *cj += ai * bij;
        }
    }
    Ok(())
}

/// Accumulating matrix GEMM: `C += AB`.
///
/// `C` is **not** cleared first.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if `A.cols() != B.rows()` or `C` is not
/// `A.rows() × B.cols()`.
pub fn gemm(a: &Matrix, b: &Matrix, c: &mut Matrix) -> Result<()> {
    if a.cols() != b.rows() || c.rows() != a.rows() || c.cols() != b.cols() {
        return Err(OcrError::mismatch(
            "gemm",
            format!("{}x{} += {}x{} * {}x{}", a.rows(), b.cols(), a.rows(), a.cols(), a.cols(), b.cols()),
            format!("{}x{} += {}x{} * {}x{}", c.rows(), c.cols(), a.rows(), a.cols(), b.rows(), b.cols()),
        ));
    }
    let n = b.cols();
    c.data_mut()
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| {
            for (k, &aik) in a.row(i).iter().enumerate() {
                for (cij, &bkj) in row.iter_mut().zip(b.row(k)) {
                    *cij += aik * bkj;
                }
            }
        });
    Ok(())
}

/// Outer product `a ⊗ b`: element `(i, j)` is `a[i] * b[j]`.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if either operand is empty.
pub fn outer_product(a: &[f32], b: &[f32]) -> Result<Matrix> {
    let mut out = Matrix::new(a.len(), b.len())?;
    out.data_mut()
        .par_chunks_mut(b.len())
        .zip(a.par_iter())
        .for_each(|(row, &ai)| {
            for (o, &bj) in row.iter_mut().zip(b) {
                *o = ai * bj;
            }
        });
    Ok(out)
}

/// Dot product `Σ a[i] * b[i]`.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn dot_product(a: &[f32], b: &[f32]) -> Result<f32> {
    same_len("dot_product", a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x * y).sum())
}

/// Hadamard (element-wise) product.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn hadamard_product(a: &[f32], b: &[f32]) -> Result<Vec<f32>> {
    same_len("hadamard_product", a, b)?;
    Ok(a.iter().zip(b).map(|(x, y)| x * y).collect())
}

/// `dst += src` in place.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn add_assign(dst: &mut [f32], src: &[f32]) -> Result<()> {
    same_len("add_assign", dst, src)?;
    dst.iter_mut().zip(src).for_each(|(d, s)| *d += s);
    Ok(())
}

/// `dst -= scale * src` in place; the SGD update rule.
///
/// # Errors
/// [`OcrError::DimensionMismatch`] if the lengths differ.
pub fn sub_scaled_assign(dst: &mut [f32], src: &[f32], scale: f32) -> Result<()> {
    same_len("sub_scaled_assign", dst, src)?;
    dst.iter_mut().zip(src).for_each(|(d, s)| *d -= scale * s);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gemm_vec_accumulates_into_seed() {
        let w = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let mut c = vec![10.0, 20.0];
        gemm_vec(&[1.0, 1.0], &w, &mut c).unwrap();
        assert_eq!(c, vec![14.0, 26.0]);
        gemm_vec(&[1.0, 1.0], &w, &mut c).unwrap();
        assert_eq!(c, vec![18.0, 32.0]);
    }

    #[test]
    fn shape_checks_run_first() {
        let a = Matrix::new(2, 3).unwrap();
        assert!(matches!(
            mat_vec(&a, &[1.0, 2.0]),
            Err(OcrError::DimensionMismatch { .. })
        ));
        assert!(matches!(
            vec_mat(&[1.0, 2.0, 3.0], &a),
            Err(OcrError::DimensionMismatch { .. })
        ));
        assert!(matches!(divide(&[1.0], 0.0), Err(OcrError::DivideByZero(_))));
    }
}
