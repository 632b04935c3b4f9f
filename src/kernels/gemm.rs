//! Integer GEMM bodies.
//!
//! Operands are 8-bit values widened to f64: every partial sum of products
//! stays far below 2^53, so the float accumulation is exact and rounds back
//! to the same i32 a device accumulator would hold.

use super::{kernel_params, utils};
use faer::linalg::matmul::matmul as faer_matmul;
use faer::mat::{MatMut, MatRef};
use faer::{Accum, Par};
use matrixmultiply::dgemm;
use std::cell::RefCell;

thread_local! {
    static SCRATCH: RefCell<[Vec<f64>; 3]> = RefCell::new([Vec::new(), Vec::new(), Vec::new()]);
}

kernel_params! {
    /// Blocked GEMM over an im2col buffer, one group per launch.
    pub struct GemmBlockedParams {
        pub batch: usize,
        pub out_channels: usize,
        pub groups: usize,
        pub group: usize,
        pub spatial: usize,
        pub rows: usize,
        pub cols: usize,
        pub group_cols: usize,
        pub input_offset: i32,
        pub weight_offset: i32,
        pub output_offset: i32,
        pub multiplier: i32,
        pub shift: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

kernel_params! {
    /// 1xN GEMM against weights centred by their zero point and a folded bias.
    pub struct Gemm1xNParams {
        pub batch: usize,
        pub out_channels: usize,
        pub groups: usize,
        pub group: usize,
        pub spatial: usize,
        pub rows: usize,
        pub cols: usize,
        pub group_rows: usize,
        pub weight_zero_point: i32,
        pub output_offset: i32,
        pub multiplier: i32,
        pub shift: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

kernel_params! {
    /// Transposed-convolution GEMM into an unscaled i32 column buffer.
    pub struct ConvBackGemmParams {
        pub groups: usize,
        pub row_filter: usize,
        pub cols: usize,
        pub row_input: usize,
        pub batch: usize,
        pub input_offset: i32,
        pub weight_offset: i32,
    }
}

macro_rules! output_stage {
    ($name:ident) => {
        impl $name {
            pub fn stage(&self) -> $crate::kernels::OutputStage {
                $crate::kernels::OutputStage {
                    output_offset: self.output_offset,
                    requant: $crate::kernels::RequantParam {
                        multiplier: self.multiplier,
                        shift: self.shift,
                    },
                    act_min: self.act_min,
                    act_max: self.act_max,
                }
            }
        }
    };
}
pub(crate) use output_stage;

output_stage!(GemmBlockedParams);
output_stage!(Gemm1xNParams);

impl GemmBlockedParams {
    pub fn weights_len(&self) -> usize {
        self.cols * self.groups * self.group_cols
    }

    pub fn input_len(&self) -> usize {
        self.batch * self.groups * self.rows * self.cols
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.spatial
    }
}

impl Gemm1xNParams {
    pub fn weights_len(&self) -> usize {
        self.groups * self.group_rows * self.cols
    }

    pub fn input_len(&self) -> usize {
        self.batch * self.groups * self.rows * self.cols
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.spatial
    }
}

impl ConvBackGemmParams {
    pub fn filter_len(&self) -> usize {
        self.groups * self.row_filter * self.cols
    }

    pub fn input_len(&self) -> usize {
        (self.batch + 1) * self.groups * self.row_input * self.cols
    }

    pub fn output_len(&self) -> usize {
        (self.batch + 1) * self.groups * self.row_filter * self.row_input
    }
}

fn widen(src: &[i32], offset: i32, dst: &mut Vec<f64>) {
    utils::ensure_len(dst, src.len());
    for (d, &s) in dst.iter_mut().zip(src) {
        *d = (s + offset) as f64;
    }
}

pub fn gemm_blocked(weights: &[i32], input: &[i32], bias: &[i32], output: &mut [i32], p: &GemmBlockedParams) {
    let per_group = p.out_channels / p.groups;
    let stage = p.stage();
    let w_width = p.groups * p.group_cols;
    SCRATCH.with(|scratch| {
        let mut guard = scratch.borrow_mut();
        let [w, x, acc] = &mut *guard;
        widen(&weights[..p.weights_len()], p.weight_offset, w);
        utils::ensure_len(acc, p.spatial * per_group);
        for n in 0..p.batch {
            let block = &input[(n * p.groups + p.group) * p.rows * p.cols..][..p.spatial * p.cols];
            widen(block, p.input_offset, x);
            // SAFETY: x is spatial x cols, the weight slice starts at column
            // group * group_cols of a cols x w_width matrix and spans per_group
            // columns, acc is spatial x per_group. All row-major.
            unsafe {
                dgemm(
                    p.spatial,
                    p.cols,
                    per_group,
                    1.0,
                    x.as_ptr(),
                    p.cols as isize,
                    1,
                    w.as_ptr().add(p.group * p.group_cols),
                    w_width as isize,
                    1,
                    0.0,
                    acc.as_mut_ptr(),
                    per_group as isize,
                    1,
                );
            }
            for j in 0..per_group {
                let oc = p.group * per_group + j;
                let out = &mut output[(n * p.out_channels + oc) * p.spatial..][..p.spatial];
                for (pos, o) in out.iter_mut().enumerate() {
                    *o = stage.apply(acc[pos * per_group + j] as i32 + bias[oc]);
                }
            }
        }
    });
}

pub fn gemm_1xn(weights: &[i32], input: &[i32], folded_bias: &[i32], output: &mut [i32], p: &Gemm1xNParams) {
    let per_group = p.out_channels / p.groups;
    let stage = p.stage();
    SCRATCH.with(|scratch| {
        let mut guard = scratch.borrow_mut();
        let [w, x, acc] = &mut *guard;
        let rows = &weights[p.group * p.group_rows * p.cols..][..per_group * p.cols];
        widen(rows, -p.weight_zero_point, w);
        utils::ensure_len(acc, per_group * p.spatial);
        for n in 0..p.batch {
            let block = &input[(n * p.groups + p.group) * p.rows * p.cols..][..p.spatial * p.cols];
            widen(block, 0, x);
            let lhs = MatRef::from_row_major_slice(w.as_slice(), per_group, p.cols);
            let rhs = MatRef::from_row_major_slice(x.as_slice(), p.spatial, p.cols);
            let dst = MatMut::from_row_major_slice_mut(acc.as_mut_slice(), per_group, p.spatial);
            faer_matmul(dst, Accum::Replace, lhs, rhs.transpose(), 1.0, Par::Seq);
            for j in 0..per_group {
                let oc = p.group * per_group + j;
                let out = &mut output[(n * p.out_channels + oc) * p.spatial..][..p.spatial];
                let sums = &acc[j * p.spatial..(j + 1) * p.spatial];
                for (o, &s) in out.iter_mut().zip(sums) {
                    *o = stage.apply(s as i32 + folded_bias[oc]);
                }
            }
        }
    });
}

pub fn conv_back_gemm(filter: &[i32], input: &[i32], output: &mut [i32], p: &ConvBackGemmParams) {
    SCRATCH.with(|scratch| {
        let mut guard = scratch.borrow_mut();
        let [w, x, acc] = &mut *guard;
        utils::ensure_len(acc, p.row_filter * p.row_input);
        for g in 0..p.groups {
            widen(&filter[g * p.row_filter * p.cols..][..p.row_filter * p.cols], p.weight_offset, w);
            let base = (p.batch * p.groups + g) * p.row_input * p.cols;
            widen(&input[base..base + p.row_input * p.cols], p.input_offset, x);
            // SAFETY: w is row_filter x cols, x is row_input x cols read as its
            // transpose via swapped strides, acc is row_filter x row_input.
            unsafe {
                dgemm(
                    p.row_filter,
                    p.cols,
                    p.row_input,
                    1.0,
                    w.as_ptr(),
                    p.cols as isize,
                    1,
                    x.as_ptr(),
                    1,
                    p.cols as isize,
                    0.0,
                    acc.as_mut_ptr(),
                    p.row_input as isize,
                    1,
                );
            }
            let out = &mut output[(p.batch * p.groups + g) * p.row_filter * p.row_input..]
                [..p.row_filter * p.row_input];
            for (o, &a) in out.iter_mut().zip(acc.iter()) {
                *o = a as i32;
            }
        }
    });
}
