//! Kernel catalog: WGSL sources and their host implementations.
//!
//! Every kernel reads its dimensions from the parameter block in slot `0`
//! (`params[0]`, `params[1]`) and is written so that invocation `i` produces
//! element `i` of its output. The host versions follow the WGSL line for
//! line, parallelised over invocations with rayon. `softmax` replays its
//! workgroup's padded max and sum tree reductions lane by lane, so the
//! emulated device shares no arithmetic with the CPU reference.
//!
//! | kernel             | params            | slots                                  |
//! |--------------------|-------------------|----------------------------------------|
//! | `linear`           | `[inputs, outputs]` | `x`, `w`, `b` → `a`                  |
//! | `sigmoid`          | `[n]`             | `a` → `y`                              |
//! | `softmax`          | `[n]`             | `a` → `y` (one workgroup)              |
//! | `outer_product`    | `[rows, cols]`    | `a`, `b` → `out`                       |
//! | `sigmoid_backward` | `[hidden, labels]`| `y1`, `w2`, `da2` → `da1`, `db1`       |

use rayon::prelude::*;

use crate::error::{OcrError, Result};
use crate::ops::device::{Access, KernelSource};

use Access::{ReadOnly, Writable};

/// Elements one softmax workgroup can normalise.
pub const SOFTMAX_WORKGROUP_SIZE: u32 = 256;

/// `a[j] = b[j] + Σᵢ x[i] · w[i, j]`.
pub static LINEAR: KernelSource = KernelSource {
    name: "linear",
    wgsl: include_str!("shaders/linear.wgsl"),
    workgroup_size: 64,
    single_workgroup: false,
    slots: &[ReadOnly, ReadOnly, ReadOnly, Writable],
};

/// `y[i] = 1 / (1 + e^-a[i])`.
pub static SIGMOID: KernelSource = KernelSource {
    name: "sigmoid",
    wgsl: include_str!("shaders/sigmoid.wgsl"),
    workgroup_size: 64,
    single_workgroup: false,
    slots: &[ReadOnly, Writable],
};

/// Max-shifted softmax, reduced in workgroup memory.
pub static SOFTMAX: KernelSource = KernelSource {
    name: "softmax",
    wgsl: include_str!("shaders/softmax.wgsl"),
    workgroup_size: SOFTMAX_WORKGROUP_SIZE,
    single_workgroup: true,
    slots: &[ReadOnly, Writable],
};

/// `out[i, j] = a[i] · b[j]`.
pub static OUTER_PRODUCT: KernelSource = KernelSource {
    name: "outer_product",
    wgsl: include_str!("shaders/outer_product.wgsl"),
    workgroup_size: 64,
    single_workgroup: false,
    slots: &[ReadOnly, ReadOnly, Writable],
};

/// `da1 = db1 = (da2 · w2ᵗ) ⊙ y1 ⊙ (1 - y1)`.
pub static SIGMOID_BACKWARD: KernelSource = KernelSource {
    name: "sigmoid_backward",
    wgsl: include_str!("shaders/sigmoid_backward.wgsl"),
    workgroup_size: 64,
    single_workgroup: false,
    slots: &[ReadOnly, ReadOnly, ReadOnly, Writable, Writable],
};

/// Host implementation of a kernel.
///
/// Receives the parameter block, the invocation count, the read-only slots
/// and the writable slots, each in binding order.
pub(crate) type HostKernel = fn([u32; 4], u32, &[&[f32]], &mut [Vec<f32>]) -> Result<()>;

/// Looks up the host implementation of the kernel called `name`.
pub(crate) fn host_kernel(name: &str) -> Option<HostKernel> {
    match name {
        "linear" => Some(linear),
        "sigmoid" => Some(sigmoid),
        "softmax" => Some(softmax),
        "outer_product" => Some(outer_product),
        "sigmoid_backward" => Some(sigmoid_backward),
        _ => None,
    }
}

fn arity(kernel: &'static str) -> OcrError {
    OcrError::Device(format!("{kernel}: wrong number of bound slots"))
}

fn fits(kernel: &'static str, buffer: &[f32], needed: usize) -> Result<()> {
    if buffer.len() < needed {
        return Err(OcrError::Device(format!(
            "{kernel}: buffer of {} elements is too small for {needed}",
            buffer.len()
        )));
    }
    Ok(())
}

fn active(invocations: u32, bound: usize) -> usize {
    (invocations as usize).min(bound)
}

fn linear(params: [u32; 4], invocations: u32, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<()> {
    let (n_in, n_out) = (params[0] as usize, params[1] as usize);
    let &[x, w, b] = inputs else {
        return Err(arity("linear"));
    };
    let [a] = outputs else {
        return Err(arity("linear"));
    };
    fits("linear", x, n_in)?;
    fits("linear", w, n_in * n_out)?;
    fits("linear", b, n_out)?;
    fits("linear", a, n_out)?;

    let n = active(invocations, n_out);
    a[..n].par_iter_mut().enumerate().for_each(|(j, out)| {
        let mut acc = b[j];
        for i in 0..n_in {
            acc += x[i] * w[i * n_out + j];
        }
        *out = acc;
    });
    Ok(())
}

fn sigmoid(params: [u32; 4], invocations: u32, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<()> {
    let len = params[0] as usize;
    let &[a] = inputs else {
        return Err(arity("sigmoid"));
    };
    let [y] = outputs else {
        return Err(arity("sigmoid"));
    };
    fits("sigmoid", a, len)?;
    fits("sigmoid", y, len)?;

    let n = active(invocations, len);
    y[..n]
        .par_iter_mut()
        .zip(&a[..n])
        .for_each(|(y, &v)| *y = 1.0 / (1.0 + (-v).exp()));
    Ok(())
}

/// Stand-in for `-inf` in the padded lanes of the softmax workgroup.
const SOFTMAX_PAD: f32 = -3.0e38;

fn softmax(params: [u32; 4], invocations: u32, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<()> {
    const WIDTH: usize = SOFTMAX_WORKGROUP_SIZE as usize;

    let len = params[0] as usize;
    let &[a] = inputs else {
        return Err(arity("softmax"));
    };
    let [y] = outputs else {
        return Err(arity("softmax"));
    };
    if len > WIDTH {
        return Err(OcrError::CapacityExceeded {
            stage: "softmax",
            requested: len,
            capacity: WIDTH,
        });
    }
    fits("softmax", a, len)?;
    fits("softmax", y, len)?;

    // lane i holds a[i]; idle lanes hold the pad
    let mut scratch = [SOFTMAX_PAD; WIDTH];
    scratch[..len].copy_from_slice(&a[..len]);
    let v = scratch;
    tree_reduce(&mut scratch, f32::max);
    let alpha = scratch[0];

    let e: [f32; WIDTH] = std::array::from_fn(|i| if i < len { (v[i] - alpha).exp() } else { 0.0 });
    scratch = e;
    tree_reduce(&mut scratch, |l, r| l + r);
    let sum = scratch[0];

    let n = active(invocations, len);
    y[..n].iter_mut().zip(&e).for_each(|(out, &ei)| *out = ei / sum);
    Ok(())
}

/// Halving-stride reduction into `lanes[0]`, one barrier step per stride.
fn tree_reduce(lanes: &mut [f32], op: impl Fn(f32, f32) -> f32) {
    let mut stride = lanes.len() / 2;
    while stride > 0 {
        for i in 0..stride {
            lanes[i] = op(lanes[i], lanes[i + stride]);
        }
        stride /= 2;
    }
}

fn outer_product(params: [u32; 4], invocations: u32, inputs: &[&[f32]], outputs: &mut [Vec<f32>]) -> Result<()> {
    let (rows, cols) = (params[0] as usize, params[1] as usize);
    let &[a, b] = inputs else {
        return Err(arity("outer_product"));
    };
    let [out] = outputs else {
        return Err(arity("outer_product"));
    };
    fits("outer_product", a, rows)?;
    fits("outer_product", b, cols)?;
    fits("outer_product", out, rows * cols)?;

    let n = active(invocations, rows * cols);
    out[..n]
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, o)| *o = a[idx / cols] * b[idx % cols]);
    Ok(())
}

fn sigmoid_backward(
    params: [u32; 4],
    invocations: u32,
    inputs: &[&[f32]],
    outputs: &mut [Vec<f32>],
) -> Result<()> {
    let (hidden, labels) = (params[0] as usize, params[1] as usize);
    let &[y1, w2, da2] = inputs else {
        return Err(arity("sigmoid_backward"));
    };
    let [da1, db1] = outputs else {
        return Err(arity("sigmoid_backward"));
    };
    fits("sigmoid_backward", y1, hidden)?;
    fits("sigmoid_backward", w2, hidden * labels)?;
    fits("sigmoid_backward", da2, labels)?;
    fits("sigmoid_backward", da1, hidden)?;
    fits("sigmoid_backward", db1, hidden)?;

    let n = active(invocations, hidden);
    da1[..n]
        .par_iter_mut()
        .zip(db1[..n].par_iter_mut())
        .enumerate()
        .for_each(|(i, (d, db))| {
            let mut s = 0.0;
            for j in 0..labels {
                s += da2[j] * w2[i * labels + j];
            }
            let g = s * y1[i] * (1.0 - y1[i]);
            *d = g;
            *db = g;
        });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_catalog_kernel_has_a_host_version() {
        for k in [&LINEAR, &SIGMOID, &SOFTMAX, &OUTER_PRODUCT, &SIGMOID_BACKWARD] {
            assert!(host_kernel(k.name).is_some(), "{}", k.name);
            assert!(k.wgsl.contains("fn main"));
        }
        assert!(host_kernel("relu").is_none());
    }

    #[test]
    fn slots_are_numbered_from_one() {
        assert_eq!(LINEAR.slot_access(0), None);
        assert_eq!(LINEAR.slot_access(1), Some(Access::ReadOnly));
        assert_eq!(LINEAR.slot_access(4), Some(Access::Writable));
        assert_eq!(LINEAR.slot_access(5), None);
    }

    #[test]
    fn host_linear_matches_hand_computation() {
        // x = [1, 2], w = [[1, 0, 2], [0, 1, 1]], b = [0.5, 0, -1]
        let x = [1.0, 2.0];
        let w = [1.0, 0.0, 2.0, 0.0, 1.0, 1.0];
        let b = [0.5, 0.0, -1.0];
        let mut out = vec![vec![0.0; 3]];
        linear([2, 3, 0, 0], 3, &[&x[..], &w[..], &b[..]], &mut out).unwrap();
        assert_eq!(out[0], vec![1.5, 2.0, 3.0]);
    }

    fn run_softmax(a: &[f32]) -> Vec<f32> {
        let mut out = vec![vec![0.0; a.len()]];
        softmax([a.len() as u32, 0, 0, 0], SOFTMAX_WORKGROUP_SIZE, &[a], &mut out).unwrap();
        out.pop().unwrap()
    }

    #[test]
    fn host_softmax_tracks_the_reference() {
        let cases: [Vec<f32>; 4] = [
            vec![0.5],
            vec![1.0, 2.0, 3.0],
            vec![1000.0, 1001.0, 999.0, -1000.0],
            (0..256).map(|i| ((i * 37) % 101) as f32 / 7.0 - 5.0).collect(),
        ];
        for a in &cases {
            let got = run_softmax(a);
            let expected = crate::model::softmax(a);
            for (g, e) in got.iter().zip(&expected) {
                assert!((g - e).abs() < 1e-6, "{g} vs {e}");
            }
            assert!((got.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn host_softmax_rejects_more_than_one_workgroup() {
        let a = vec![0.0; 257];
        let mut out = vec![vec![0.0; 257]];
        assert!(matches!(
            softmax([257, 0, 0, 0], 257, &[&a[..]], &mut out),
            Err(OcrError::CapacityExceeded { requested: 257, .. })
        ));
    }
}
