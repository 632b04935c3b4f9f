use super::kernel_params;

kernel_params! {
    /// Zero-point padding of an NCHW tensor.
    pub struct PadParams {
        pub batch: usize,
        pub channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub pad_top: usize,
        pub pad_left: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Padding into the NC4HW4 layout read by the direct kernels.
    pub struct PadC4Params {
        pub batch: usize,
        pub channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub pad_top: usize,
        pub pad_left: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Patch gathering for the blocked GEMM. The source is already padded.
    ///
    /// Destination per batch is `[groups * rows][cols]`; the block of group
    /// `group` starts at row `group * rows`.
    pub struct Im2colParams {
        pub batch: usize,
        pub channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub stride_h: usize,
        pub stride_w: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub groups: usize,
        pub group: usize,
        pub rows: usize,
        pub cols: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Patch gathering with implicit padding, used by the 1xN GEMM and its
    /// architecture-specific convert kernels.
    pub struct ConvertParams {
        pub batch: usize,
        pub channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub stride_h: usize,
        pub stride_w: usize,
        pub pad_top: usize,
        pub pad_left: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub groups: usize,
        pub group: usize,
        pub rows: usize,
        pub cols: usize,
        pub zero_point: i32,
    }
}

kernel_params! {
    /// Per-group transpose of a `[width][height]` matrix into `[height][stride]`.
    pub struct TransposeParams {
        pub groups: usize,
        pub height: usize,
        pub width: usize,
        pub dst_stride: usize,
        pub batch: usize,
    }
}

impl PadParams {
    pub fn src_len(&self) -> usize {
        self.batch * self.channels * self.in_h * self.in_w
    }

    pub fn dst_len(&self) -> usize {
        self.batch * self.channels * self.out_h * self.out_w
    }
}

impl PadC4Params {
    pub fn src_len(&self) -> usize {
        self.batch * self.channels * self.in_h * self.in_w
    }

    pub fn dst_len(&self) -> usize {
        self.batch * self.channels.div_ceil(4) * 4 * self.out_h * self.out_w
    }
}

impl Im2colParams {
    pub fn src_len(&self) -> usize {
        self.batch * self.channels * self.in_h * self.in_w
    }

    pub fn dst_len(&self) -> usize {
        self.batch * self.groups * self.rows * self.cols
    }

    pub fn is_valid(&self) -> bool {
        self.groups > 0
            && self.group < self.groups
            && self.channels % self.groups == 0
            && self.rows >= self.out_h * self.out_w
            && self.cols >= self.channels / self.groups * self.kernel_h * self.kernel_w
    }
}

impl ConvertParams {
    pub fn src_len(&self) -> usize {
        self.batch * self.channels * self.in_h * self.in_w
    }

    pub fn dst_len(&self) -> usize {
        self.batch * self.groups * self.rows * self.cols
    }

    pub fn is_valid(&self) -> bool {
        self.groups > 0
            && self.group < self.groups
            && self.channels % self.groups == 0
            && self.rows >= self.out_h * self.out_w
            && self.cols >= self.channels / self.groups * self.kernel_h * self.kernel_w
    }
}

impl TransposeParams {
    pub fn src_len(&self) -> usize {
        (self.batch + 1) * self.groups * self.width * self.height
    }

    pub fn dst_len(&self) -> usize {
        (self.batch + 1) * self.groups * self.height * self.dst_stride
    }
}

pub fn pad(src: &[i32], dst: &mut [i32], p: &PadParams) {
    for plane in 0..p.batch * p.channels {
        let src_plane = &src[plane * p.in_h * p.in_w..(plane + 1) * p.in_h * p.in_w];
        let dst_plane = &mut dst[plane * p.out_h * p.out_w..(plane + 1) * p.out_h * p.out_w];
        dst_plane.fill(p.zero_point);
        for ih in 0..p.in_h {
            let oh = ih + p.pad_top;
            if oh >= p.out_h {
                break;
            }
            let row = &src_plane[ih * p.in_w..(ih + 1) * p.in_w];
            let start = oh * p.out_w + p.pad_left;
            let count = p.in_w.min(p.out_w.saturating_sub(p.pad_left));
            dst_plane[start..start + count].copy_from_slice(&row[..count]);
        }
    }
}

pub fn pad_align_c4(src: &[i32], dst: &mut [i32], p: &PadC4Params) {
    let blocks = p.channels.div_ceil(4);
    dst[..p.batch * blocks * p.out_h * p.out_w * 4].fill(p.zero_point);
    for n in 0..p.batch {
        for c in 0..p.channels {
            let (cb, lane) = (c / 4, c % 4);
            for ih in 0..p.in_h {
                let oh = ih + p.pad_top;
                for iw in 0..p.in_w {
                    let ow = iw + p.pad_left;
                    if oh >= p.out_h || ow >= p.out_w {
                        continue;
                    }
                    let s = ((n * p.channels + c) * p.in_h + ih) * p.in_w + iw;
                    let d = (((n * blocks + cb) * p.out_h + oh) * p.out_w + ow) * 4 + lane;
                    dst[d] = src[s];
                }
            }
        }
    }
}

/// Gather one group's receptive fields from an explicitly padded source.
pub fn im2col(src: &[i32], dst: &mut [i32], p: &Im2colParams) {
    let group_channels = p.channels / p.groups;
    let patch = group_channels * p.kernel_h * p.kernel_w;
    let batch_stride = p.groups * p.rows * p.cols;
    for n in 0..p.batch {
        let block = &mut dst[n * batch_stride + p.group * p.rows * p.cols..][..p.rows * p.cols];
        block.fill(p.zero_point);
        for oh in 0..p.out_h {
            for ow in 0..p.out_w {
                let row = &mut block[(oh * p.out_w + ow) * p.cols..][..patch];
                let mut col = 0;
                for c in 0..group_channels {
                    let plane = (n * p.channels + p.group * group_channels + c) * p.in_h * p.in_w;
                    for ky in 0..p.kernel_h {
                        let ih = oh * p.stride_h + ky;
                        for kx in 0..p.kernel_w {
                            let iw = ow * p.stride_w + kx;
                            if ih < p.in_h && iw < p.in_w {
                                row[col] = src[plane + ih * p.in_w + iw];
                            }
                            col += 1;
                        }
                    }
                }
            }
        }
    }
}

/// im2col that resolves padding while reading: out-of-range taps take the zero point.
pub fn convert_with_pad(src: &[i32], dst: &mut [i32], p: &ConvertParams) {
    let group_channels = p.channels / p.groups;
    let batch_stride = p.groups * p.rows * p.cols;
    for n in 0..p.batch {
        let block = &mut dst[n * batch_stride + p.group * p.rows * p.cols..][..p.rows * p.cols];
        block.fill(p.zero_point);
        for oh in 0..p.out_h {
            for ow in 0..p.out_w {
                let row = &mut block[(oh * p.out_w + ow) * p.cols..];
                let mut col = 0;
                for c in 0..group_channels {
                    let plane = (n * p.channels + p.group * group_channels + c) * p.in_h * p.in_w;
                    for ky in 0..p.kernel_h {
                        let ih = (oh * p.stride_h + ky) as isize - p.pad_top as isize;
                        for kx in 0..p.kernel_w {
                            let iw = (ow * p.stride_w + kx) as isize - p.pad_left as isize;
                            if ih >= 0 && iw >= 0 && (ih as usize) < p.in_h && (iw as usize) < p.in_w {
                                row[col] = src[plane + ih as usize * p.in_w + iw as usize];
                            }
                            col += 1;
                        }
                    }
                }
            }
        }
    }
}

/// 1x1, stride 1, no padding: each output row is the channel vector of one pixel.
pub fn convert_1x1(src: &[i32], dst: &mut [i32], p: &ConvertParams) {
    let group_channels = p.channels / p.groups;
    let spatial = p.in_h * p.in_w;
    let batch_stride = p.groups * p.rows * p.cols;
    for n in 0..p.batch {
        let block = &mut dst[n * batch_stride + p.group * p.rows * p.cols..][..p.rows * p.cols];
        block.fill(p.zero_point);
        for c in 0..group_channels {
            let plane = &src[(n * p.channels + p.group * group_channels + c) * spatial..][..spatial];
            for (pos, &v) in plane.iter().enumerate() {
                block[pos * p.cols + c] = v;
            }
        }
    }
}

/// Transpose each group's `[width][height]` slab into `[height][dst_stride]`.
/// Padding columns beyond `width` are left untouched.
pub fn transpose(src: &[i32], dst: &mut [i32], p: &TransposeParams) {
    let src_base = p.batch * p.groups * p.width * p.height;
    let dst_base = p.batch * p.groups * p.height * p.dst_stride;
    for g in 0..p.groups {
        let s = &src[src_base + g * p.width * p.height..][..p.width * p.height];
        let d = &mut dst[dst_base + g * p.height * p.dst_stride..][..p.height * p.dst_stride];
        for col in 0..p.width {
            for row in 0..p.height {
                d[row * p.dst_stride + col] = s[col * p.height + row];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pad_fills_border_with_zero_point() {
        let src = vec![1, 2, 3, 4];
        let mut dst = vec![0; 16];
        let p = PadParams {
            batch: 1,
            channels: 1,
            in_h: 2,
            in_w: 2,
            pad_top: 1,
            pad_left: 1,
            out_h: 4,
            out_w: 4,
            zero_point: 9,
        };
        pad(&src, &mut dst, &p);
        assert_eq!(
            dst,
            vec![9, 9, 9, 9, 9, 1, 2, 9, 9, 3, 4, 9, 9, 9, 9, 9]
        );
    }

    #[test]
    fn convert_1x1_transposes_channels() {
        let src = vec![1, 2, 3, 4, 5, 6];
        let mut dst = vec![0; 4 * 4];
        let p = ConvertParams {
            batch: 1,
            channels: 2,
            in_h: 1,
            in_w: 3,
            kernel_h: 1,
            kernel_w: 1,
            stride_h: 1,
            stride_w: 1,
            out_h: 1,
            out_w: 3,
            groups: 1,
            rows: 4,
            cols: 4,
            zero_point: 7,
            ..Default::default()
        };
        convert_1x1(&src, &mut dst, &p);
        assert_eq!(&dst[..4], &[1, 4, 7, 7]);
        assert_eq!(&dst[4..8], &[2, 5, 7, 7]);
        assert_eq!(&dst[12..], &[7, 7, 7, 7]);
    }
}
