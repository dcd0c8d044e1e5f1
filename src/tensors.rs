//! Dense row-major matrix storage.
//!
//! # Core Matrix Type
//!
//! [`Matrix`] is the only tensor type the engine needs: every weight table is a
//! matrix and every activation, bias or gradient vector is a plain `Vec<f32>`.
//! A vector can be viewed as a degenerate matrix through
//! [`Matrix::row_major`] (1×n) or [`Matrix::column_major`] (n×1) so that the
//! generic matrix kernels in [`crate::ops::cpu`] apply to it.
//!
//! ## Invariants
//! - `rows > 0` and `cols > 0` for every constructed matrix
//! - `data.len() == rows * cols`
//! - element `(i, j)` lives at offset `i * cols + j`
//!
//! ## Example
//!
//! ```rust
//! use simple_ocr::tensors::Matrix;
//!
//! let m = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
//! assert_eq!(m[(1, 2)], 6.0);
//! assert_eq!(m.transposed()[(2, 1)], 6.0);
//! ```

use core::ops::{Index, IndexMut, RangeInclusive};

use rand::Rng;

use crate::error::{OcrError, Result};

/// A dense, row-major, rectangular table of `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<f32>,
}

impl Matrix {
    /// Creates a zero-filled `rows × cols` matrix.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if either dimension is zero.
    pub fn new(rows: usize, cols: usize) -> Result<Self> {
        Self::from_vec(rows, cols, vec![0.0; rows * cols])
    }

    /// Wraps an existing buffer as a `rows × cols` matrix.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if a dimension is zero or the buffer
    /// length is not `rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, data: Vec<f32>) -> Result<Self> {
        if rows == 0 || cols == 0 {
            return Err(OcrError::mismatch(
                "Matrix::from_vec",
                "positive dimensions",
                format!("{rows}x{cols}"),
            ));
        }
        if data.len() != rows * cols {
            return Err(OcrError::mismatch(
                "Matrix::from_vec",
                format!("{} elements for {rows}x{cols}", rows * cols),
                data.len(),
            ));
        }
        Ok(Self { rows, cols, data })
    }

    /// Views a vector as a single-row (1×n) matrix.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] for an empty vector.
    pub fn row_major(vector: Vec<f32>) -> Result<Self> {
        let cols = vector.len();
        Self::from_vec(1, cols, vector)
    }

    /// Views a vector as a single-column (n×1) matrix.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] for an empty vector.
    pub fn column_major(vector: Vec<f32>) -> Result<Self> {
        let rows = vector.len();
        Self::from_vec(rows, 1, vector)
    }

    /// The `n × n` identity matrix.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if `n == 0`.
    pub fn identity(n: usize) -> Result<Self> {
        let mut m = Self::new(n, n)?;
        for i in 0..n {
            m[(i, i)] = 1.0;
        }
        Ok(m)
    }

    /// A matrix with every element drawn uniformly from `range`.
    ///
    /// # Errors
    /// [`OcrError::DimensionMismatch`] if either dimension is zero.
    pub fn random_uniform<R: Rng + ?Sized>(
        rows: usize,
        cols: usize,
        range: RangeInclusive<f32>,
        rng: &mut R,
    ) -> Result<Self> {
        let data = (0..rows * cols)
            .map(|_| rng.random_range(range.clone()))
            .collect();
        Self::from_vec(rows, cols, data)
    }

    /// Number of rows.
    #[must_use]
    #[inline]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    #[inline]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// `rows * cols`.
    #[must_use]
    #[inline]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; a matrix never has a zero dimension.
    #[must_use]
    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// `(rows, cols)`.
    #[must_use]
    #[inline]
    pub const fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// The backing buffer in row-major order.
    #[must_use]
    #[inline]
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Mutable access to the backing buffer.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Consumes the matrix and returns its buffer.
    #[must_use]
    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Row `i` as a slice.
    ///
    /// # Panics
    /// Panics if `i >= rows`.
    #[must_use]
    #[inline]
    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// Returns a new matrix with rows and columns swapped.
    #[must_use]
    pub fn transposed(&self) -> Self {
        let mut data = vec![0.0; self.data.len()];
        for i in 0..self.rows {
            for j in 0..self.cols {
                data[j * self.rows + i] = self.data[i * self.cols + j];
            }
        }
        Self {
            rows: self.cols,
            cols: self.rows,
            data,
        }
    }

    /// Sets every element to zero, keeping the shape.
    pub fn fill_zero(&mut self) {
        self.data.fill(0.0);
    }

    /// Element-wise comparison within `tolerance`, see [`almost_equals`].
    #[must_use]
    pub fn almost_equals(&self, other: &Self, tolerance: f32) -> bool {
        self.shape() == other.shape() && almost_equals(&self.data, &other.data, tolerance)
    }
}

impl Index<(usize, usize)> for Matrix {
    type Output = f32;

    #[inline]
    fn index(&self, (i, j): (usize, usize)) -> &f32 {
        &self.data[i * self.cols + j]
    }
}

impl IndexMut<(usize, usize)> for Matrix {
    #[inline]
    fn index_mut(&mut self, (i, j): (usize, usize)) -> &mut f32 {
        &mut self.data[i * self.cols + j]
    }
}

/// Compares two sequences element by element.
///
/// Two elements agree when their absolute difference is within `tolerance`
/// or their difference relative to the larger magnitude is. Sequences of
/// different lengths never agree.
#[must_use]
pub fn almost_equals(a: &[f32], b: &[f32], tolerance: f32) -> bool {
    a.len() == b.len()
        && a.iter().zip(b).all(|(&x, &y)| {
            let diff = (x - y).abs();
            diff <= tolerance || diff <= tolerance * x.abs().max(y.abs())
        })
}
