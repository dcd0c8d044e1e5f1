use proptest::prelude::*;

use simple_ocr::error::OcrError;
use simple_ocr::ops::cpu::*;
use simple_ocr::tensors::{Matrix, almost_equals};

fn matrix(rows: usize, cols: usize) -> impl Strategy<Value = Matrix> {
    prop::collection::vec(-10.0f32..10.0, rows * cols).prop_map(move |data| Matrix::from_vec(rows, cols, data).unwrap())
}

fn sized_matrix() -> impl Strategy<Value = Matrix> {
    (1usize..8, 1usize..8).prop_flat_map(|(r, c)| matrix(r, c))
}

proptest! {
    #[test]
    fn prop_identity_is_neutral(m in sized_matrix()) {
        let left = mat_mul(&Matrix::identity(m.rows()).unwrap(), &m).unwrap();
        let right = mat_mul(&m, &Matrix::identity(m.cols()).unwrap()).unwrap();
        prop_assert_eq!(&left, &m);
        prop_assert_eq!(&right, &m);
    }

    #[test]
    fn prop_outer_product_transposes_with_swapped_operands(
        a in prop::collection::vec(-5.0f32..5.0, 1..10),
        b in prop::collection::vec(-5.0f32..5.0, 1..10),
    ) {
        let ab = outer_product(&a, &b).unwrap();
        let ba = outer_product(&b, &a).unwrap();
        prop_assert_eq!(ab.shape(), (a.len(), b.len()));
        prop_assert_eq!(ab.transposed(), ba);
    }

    #[test]
    fn prop_double_transpose_is_identity(m in sized_matrix()) {
        prop_assert_eq!(m.transposed().transposed(), m);
    }

    #[test]
    fn prop_vec_mat_matches_row_matrix_product(m in sized_matrix(), seed in -3.0f32..3.0) {
        let v: Vec<f32> = (0..m.rows()).map(|i| seed + i as f32).collect();
        let expected = mat_mul(&Matrix::row_major(v.clone()).unwrap(), &m).unwrap();
        let got = vec_mat(&v, &m).unwrap();
        prop_assert!(almost_equals(got.data(), expected.data(), 1e-4));
    }
}

#[test]
fn test_mat_mul_known_values() {
    let a = Matrix::from_vec(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
    let b = Matrix::from_vec(3, 2, vec![7.0, 8.0, 9.0, 10.0, 11.0, 12.0]).unwrap();
    let c = mat_mul(&a, &b).unwrap();
    assert_eq!(c.shape(), (2, 2));
    assert_eq!(c.data(), &[58.0, 64.0, 139.0, 154.0]);
}

#[test]
fn test_mat_mul_rejects_inner_mismatch() {
    let a = Matrix::new(2, 3).unwrap();
    let b = Matrix::new(2, 3).unwrap();
    assert!(matches!(
        mat_mul(&a, &b),
        Err(OcrError::DimensionMismatch { .. })
    ));
}

#[test]
fn test_gemm_vec_accumulates_into_bias() {
    let w = Matrix::from_vec(2, 2, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let mut c = vec![10.0, 20.0];
    gemm_vec(&[1.0, 1.0], &w, &mut c).unwrap();
    assert_eq!(c, vec![14.0, 26.0]);
}

#[test]
fn test_elementwise_ops() {
    assert_eq!(subtract(&[3.0, 2.0], &[1.0, 1.0]).unwrap(), vec![2.0, 1.0]);
    assert_eq!(hadamard_product(&[2.0, 3.0], &[4.0, 5.0]).unwrap(), vec![8.0, 15.0]);
    assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap(), 32.0);
    assert_eq!(divide(&[2.0, 4.0], 2.0).unwrap(), vec![1.0, 2.0]);
}

#[test]
fn test_divide_by_zero_is_reported() {
    assert!(matches!(divide(&[1.0], 0.0), Err(OcrError::DivideByZero(_))));
}

#[test]
fn test_length_mismatch_is_reported() {
    assert!(subtract(&[1.0, 2.0], &[1.0]).is_err());
    assert!(hadamard_product(&[1.0], &[1.0, 2.0]).is_err());
    assert!(dot_product(&[1.0], &[]).is_err());
}

#[test]
fn test_almost_equals_accepts_relative_error() {
    assert!(almost_equals(&[1000.0], &[1000.5], 1e-3));
    assert!(!almost_equals(&[1.0], &[1.1], 1e-3));
    assert!(!almost_equals(&[1.0], &[1.0, 1.0], 1e-3));
}
