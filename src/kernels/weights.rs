use super::kernel_params;

kernel_params! {
    /// `[K rows][groups * group_cols]` transposed weight matrix for the blocked GEMM.
    pub struct AlignGemmParams {
        pub out_channels: usize,
        pub groups: usize,
        pub patch: usize,
        pub rows: usize,
        pub group_cols: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// `[groups * group_rows][cols]` row-major weights for the 1xN GEMM.
    pub struct Align1xNParams {
        pub out_channels: usize,
        pub groups: usize,
        pub patch: usize,
        pub group_rows: usize,
        pub cols: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Eight output channels by four input channels interleaved per tap.
    pub struct AlignDirectParams {
        pub out_channels: usize,
        pub in_channels: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    pub struct DilationInitParams {
        pub len: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Spread a `[planes][kh][kw]` filter onto a dilated grid.
    pub struct DilationParams {
        pub planes: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub dilation_h: usize,
        pub dilation_w: usize,
    }
}

kernel_params! {
    /// Fold the input zero point into the bias: `bias - input_zp * Σ(w - weight_zp)`.
    pub struct BiasFoldParams {
        pub out_channels: usize,
        pub patch: usize,
        pub input_zero_point: i32,
        pub weight_zero_point: i32,
    }
}

impl AlignGemmParams {
    pub fn dst_len(&self) -> usize {
        self.rows * self.groups * self.group_cols
    }
}

impl Align1xNParams {
    pub fn dst_len(&self) -> usize {
        self.groups * self.group_rows * self.cols
    }
}

impl AlignDirectParams {
    pub fn blocks(&self) -> (usize, usize) {
        (self.out_channels.div_ceil(8), self.in_channels.div_ceil(4))
    }

    pub fn dst_len(&self) -> usize {
        let (nb, cb) = self.blocks();
        nb * cb * self.kernel_h * self.kernel_w * 32
    }
}

impl DilationParams {
    pub fn dilated(&self) -> (usize, usize) {
        (
            self.dilation_h * (self.kernel_h - 1) + 1,
            self.dilation_w * (self.kernel_w - 1) + 1,
        )
    }

    pub fn dst_len(&self) -> usize {
        let (h, w) = self.dilated();
        self.planes * h * w
    }
}

pub fn align_weight_gemm(src: &[i32], dst: &mut [i32], p: &AlignGemmParams) {
    let per_group = p.out_channels / p.groups;
    let width = p.groups * p.group_cols;
    dst[..p.rows * width].fill(p.zero_point);
    for g in 0..p.groups {
        for j in 0..per_group {
            let oc = g * per_group + j;
            for k in 0..p.patch {
                dst[k * width + g * p.group_cols + j] = src[oc * p.patch + k];
            }
        }
    }
}

pub fn align_weight_1xn(src: &[i32], dst: &mut [i32], p: &Align1xNParams) {
    let per_group = p.out_channels / p.groups;
    dst[..p.dst_len()].fill(p.zero_point);
    for g in 0..p.groups {
        for j in 0..per_group {
            let oc = g * per_group + j;
            let row = &mut dst[(g * p.group_rows + j) * p.cols..][..p.patch];
            row.copy_from_slice(&src[oc * p.patch..(oc + 1) * p.patch]);
        }
    }
}

pub fn align_weight_direct(src: &[i32], dst: &mut [i32], p: &AlignDirectParams) {
    let (_, cb_count) = p.blocks();
    let taps = p.kernel_h * p.kernel_w;
    dst[..p.dst_len()].fill(p.zero_point);
    for oc in 0..p.out_channels {
        let (nb, o) = (oc / 8, oc % 8);
        for ic in 0..p.in_channels {
            let (cb, lane) = (ic / 4, ic % 4);
            for y in 0..p.kernel_h {
                for x in 0..p.kernel_w {
                    let s = (oc * p.in_channels + ic) * taps + y * p.kernel_w + x;
                    let d = ((nb * cb_count + cb) * p.kernel_h + y) * p.kernel_w * 32 + (x * 8 + o) * 4 + lane;
                    dst[d] = src[s];
                }
            }
        }
    }
}

pub fn dilation_init(dst: &mut [i32], p: &DilationInitParams) {
    dst[..p.len].fill(p.zero_point);
}

pub fn dilate(src: &[i32], dst: &mut [i32], p: &DilationParams) {
    let (dh, dw) = p.dilated();
    for plane in 0..p.planes {
        for y in 0..p.kernel_h {
            for x in 0..p.kernel_w {
                dst[(plane * dh + y * p.dilation_h) * dw + x * p.dilation_w] =
                    src[(plane * p.kernel_h + y) * p.kernel_w + x];
            }
        }
    }
}

pub fn fold_bias(weights: &[i32], bias: &[i32], dst: &mut [i32], p: &BiasFoldParams) {
    for oc in 0..p.out_channels {
        let row = &weights[oc * p.patch..(oc + 1) * p.patch];
        let sum: i64 = row.iter().map(|&w| (w - p.weight_zero_point) as i64).sum();
        dst[oc] = (bias[oc] as i64 - p.input_zero_point as i64 * sum) as i32;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dilation_inserts_gaps() {
        let src = vec![1, 2, 3, 4];
        let p = DilationParams {
            planes: 1,
            kernel_h: 2,
            kernel_w: 2,
            dilation_h: 2,
            dilation_w: 2,
        };
        let mut dst = vec![0; p.dst_len()];
        dilation_init(&mut dst, &DilationInitParams { len: 9, zero_point: 5 });
        dilate(&src, &mut dst, &p);
        assert_eq!(dst, vec![1, 5, 2, 5, 5, 5, 3, 5, 4]);
    }

    #[test]
    fn fold_cancels_input_zero_point() {
        let weights = vec![3, 1, 2];
        let p = BiasFoldParams {
            out_channels: 1,
            patch: 3,
            input_zero_point: 4,
            weight_zero_point: 1,
        };
        let mut dst = vec![0];
        fold_bias(&weights, &[10], &mut dst, &p);
        // 10 - 4 * ((3-1) + (1-1) + (2-1))
        assert_eq!(dst, vec![-2]);
    }
}
