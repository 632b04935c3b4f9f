use super::gemm::output_stage;
use super::{kernel_params, OutputStage, RequantParam};

/// Offset that maps int8 storage onto the unsigned arithmetic of the
/// depthwise kernels.
pub const SIGNED_SHIFT: i32 = 128;

kernel_params! {
    /// Direct convolution over an NC4HW4 padded input, stride 1.
    pub struct DirectParams {
        pub batch: usize,
        pub in_channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub out_channels: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub kernel: usize,
        pub weight_zero_point: i32,
        pub output_offset: i32,
        pub multiplier: i32,
        pub shift: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

kernel_params! {
    /// Depthwise convolution. Output channel `c < in_channels * depth_multiplier`
    /// reads input channel `c / depth_multiplier`.
    pub struct DepthwiseParams {
        pub batch: usize,
        pub in_channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub out_channels: usize,
        pub depth_multiplier: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub stride_h: usize,
        pub stride_w: usize,
        pub dilation_h: usize,
        pub dilation_w: usize,
        pub pad_top: usize,
        pub pad_left: usize,
        pub out_h: usize,
        pub out_w: usize,
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
    /// Output channels beyond `first_channel` that no input channel feeds.
    pub struct UnequalParams {
        pub batch: usize,
        pub out_channels: usize,
        pub first_channel: usize,
        pub spatial: usize,
        pub output_offset: i32,
        pub multiplier: i32,
        pub shift: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

kernel_params! {
    /// Grouped convolution with one requantization pair per output channel.
    pub struct PerChannelParams {
        pub batch: usize,
        pub in_channels: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub out_channels: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub stride_h: usize,
        pub stride_w: usize,
        pub dilation_h: usize,
        pub dilation_w: usize,
        pub pad_top: usize,
        pub pad_left: usize,
        pub groups: usize,
        pub group: usize,
        pub input_offset: i32,
        pub weight_offset: i32,
        pub output_offset: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

kernel_params! {
    /// Scatter of the transposed-convolution column buffer onto the output grid.
    /// Padding may be negative.
    pub struct ScatterParams {
        pub batch: usize,
        pub out_channels: usize,
        pub out_h: usize,
        pub out_w: usize,
        pub kernel_h: usize,
        pub kernel_w: usize,
        pub pad_top: i32,
        pub pad_left: i32,
        pub stride_h: usize,
        pub stride_w: usize,
        pub in_h: usize,
        pub in_w: usize,
        pub output_offset: i32,
        pub multiplier: i32,
        pub shift: i32,
        pub act_min: i32,
        pub act_max: i32,
    }
}

output_stage!(DirectParams);
output_stage!(DepthwiseParams);
output_stage!(UnequalParams);
output_stage!(ScatterParams);

impl DirectParams {
    pub fn input_len(&self) -> usize {
        self.batch * self.in_channels.div_ceil(4) * 4 * self.in_h * self.in_w
    }

    pub fn weights_len(&self) -> usize {
        self.out_channels.div_ceil(8) * self.in_channels.div_ceil(4) * self.kernel * self.kernel * 32
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }
}

impl DepthwiseParams {
    pub fn input_len(&self) -> usize {
        self.batch * self.in_channels * self.in_h * self.in_w
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }

    pub fn fed_channels(&self) -> usize {
        self.out_channels.min(self.in_channels * self.depth_multiplier)
    }
}

impl PerChannelParams {
    pub fn input_len(&self) -> usize {
        self.batch * self.in_channels * self.in_h * self.in_w
    }

    pub fn weights_len(&self) -> usize {
        self.out_channels * self.in_channels / self.groups.max(1) * self.kernel_h * self.kernel_w
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }
}

impl ScatterParams {
    pub fn col_len(&self) -> usize {
        self.batch * self.out_channels * self.kernel_h * self.kernel_w * self.in_h * self.in_w
    }

    pub fn output_len(&self) -> usize {
        self.batch * self.out_channels * self.out_h * self.out_w
    }
}

pub fn direct_conv(input: &[i32], weights: &[i32], folded_bias: &[i32], output: &mut [i32], p: &DirectParams) {
    let stage = p.stage();
    let k = p.kernel;
    let in_blocks = p.in_channels.div_ceil(4);
    for n in 0..p.batch {
        for oc in 0..p.out_channels {
            let (nb, o) = (oc / 8, oc % 8);
            for oh in 0..p.out_h {
                for ow in 0..p.out_w {
                    let mut acc = 0i32;
                    for ic in 0..p.in_channels {
                        let (cb, lane) = (ic / 4, ic % 4);
                        for y in 0..k {
                            let in_row = ((n * in_blocks + cb) * p.in_h + oh + y) * p.in_w;
                            let w_row = ((nb * in_blocks + cb) * k + y) * k * 32;
                            for x in 0..k {
                                let xv = input[(in_row + ow + x) * 4 + lane];
                                let wv = weights[w_row + (x * 8 + o) * 4 + lane] - p.weight_zero_point;
                                acc += xv * wv;
                            }
                        }
                    }
                    output[((n * p.out_channels + oc) * p.out_h + oh) * p.out_w + ow] =
                        stage.apply(acc + folded_bias[oc]);
                }
            }
        }
    }
}

/// Depthwise body. `signed` storage is shifted into unsigned range on load and
/// back on store; offsets arrive already shifted.
pub fn depthwise(
    input: &[i32],
    weights: &[i32],
    bias: &[i32],
    output: &mut [i32],
    p: &DepthwiseParams,
    signed: bool,
) {
    let stage = p.stage();
    let shift = if signed { SIGNED_SHIFT } else { 0 };
    let taps = p.kernel_h * p.kernel_w;
    for n in 0..p.batch {
        for c in 0..p.fed_channels() {
            let ic = c / p.depth_multiplier;
            let plane = &input[(n * p.in_channels + ic) * p.in_h * p.in_w..][..p.in_h * p.in_w];
            let filter = &weights[c * taps..(c + 1) * taps];
            for oh in 0..p.out_h {
                for ow in 0..p.out_w {
                    let mut acc = 0i32;
                    for ky in 0..p.kernel_h {
                        let ih = (oh * p.stride_h + ky * p.dilation_h) as isize - p.pad_top as isize;
                        if ih < 0 || ih as usize >= p.in_h {
                            continue;
                        }
                        for kx in 0..p.kernel_w {
                            let iw = (ow * p.stride_w + kx * p.dilation_w) as isize - p.pad_left as isize;
                            if iw < 0 || iw as usize >= p.in_w {
                                continue;
                            }
                            let xv = plane[ih as usize * p.in_w + iw as usize] + shift + p.input_offset;
                            let wv = filter[ky * p.kernel_w + kx] + shift + p.weight_offset;
                            acc += xv * wv;
                        }
                    }
                    output[((n * p.out_channels + c) * p.out_h + oh) * p.out_w + ow] =
                        stage.apply(acc + bias[c]) - shift;
                }
            }
        }
    }
}

pub fn depthwise_unequal(bias: &[i32], output: &mut [i32], p: &UnequalParams, signed: bool) {
    let stage = p.stage();
    let shift = if signed { SIGNED_SHIFT } else { 0 };
    for n in 0..p.batch {
        for c in p.first_channel..p.out_channels {
            let value = stage.apply(bias[c]) - shift;
            output[(n * p.out_channels + c) * p.spatial..][..p.spatial].fill(value);
        }
    }
}

pub fn per_channel_conv(
    input: &[i32],
    weights: &[i32],
    bias: &[i32],
    multipliers: &[i32],
    shifts: &[i32],
    output: &mut [i32],
    p: &PerChannelParams,
) {
    let in_per_group = p.in_channels / p.groups;
    let out_per_group = p.out_channels / p.groups;
    let taps = p.kernel_h * p.kernel_w;
    for n in 0..p.batch {
        for j in 0..out_per_group {
            let oc = p.group * out_per_group + j;
            let stage = OutputStage {
                output_offset: p.output_offset,
                requant: RequantParam {
                    multiplier: multipliers[oc],
                    shift: shifts[oc],
                },
                act_min: p.act_min,
                act_max: p.act_max,
            };
            for oh in 0..p.out_h {
                for ow in 0..p.out_w {
                    let mut acc = 0i32;
                    for icg in 0..in_per_group {
                        let ic = p.group * in_per_group + icg;
                        let plane = (n * p.in_channels + ic) * p.in_h * p.in_w;
                        let filter = (oc * in_per_group + icg) * taps;
                        for ky in 0..p.kernel_h {
                            let ih = (oh * p.stride_h + ky * p.dilation_h) as isize - p.pad_top as isize;
                            if ih < 0 || ih as usize >= p.in_h {
                                continue;
                            }
                            for kx in 0..p.kernel_w {
                                let iw = (ow * p.stride_w + kx * p.dilation_w) as isize - p.pad_left as isize;
                                if iw < 0 || iw as usize >= p.in_w {
                                    continue;
                                }
                                let xv = input[plane + ih as usize * p.in_w + iw as usize] + p.input_offset;
                                let wv = weights[filter + ky * p.kernel_w + kx] + p.weight_offset;
                                acc += xv * wv;
                            }
                        }
                    }
                    output[((n * p.out_channels + oc) * p.out_h + oh) * p.out_w + ow] = stage.apply(acc + bias[oc]);
                }
            }
        }
    }
}

/// Gather, for every output pixel, the column entries whose taps land on it.
pub fn convert_bottom_diff(col: &[i32], bias: &[i32], output: &mut [i32], p: &ScatterParams) {
    let stage = p.stage();
    scatter(col, bias, output, p, |_| stage);
}

/// Scatter with one requantization entry per output channel. The scalar
/// multiplier and shift of `p` are ignored.
pub fn convert_bottom_diff_per_channel(
    col: &[i32],
    bias: &[i32],
    multipliers: &[i32],
    shifts: &[i32],
    output: &mut [i32],
    p: &ScatterParams,
) {
    let base = p.stage();
    scatter(col, bias, output, p, |oc| OutputStage {
        requant: RequantParam {
            multiplier: multipliers[oc],
            shift: shifts[oc],
        },
        ..base
    });
}

fn scatter(
    col: &[i32],
    bias: &[i32],
    output: &mut [i32],
    p: &ScatterParams,
    stage_of: impl Fn(usize) -> OutputStage,
) {
    let in_spatial = p.in_h * p.in_w;
    let rows = p.out_channels * p.kernel_h * p.kernel_w;
    for n in 0..p.batch {
        let col = &col[n * rows * in_spatial..][..rows * in_spatial];
        for oc in 0..p.out_channels {
            let stage = stage_of(oc);
            for y in 0..p.out_h {
                for x in 0..p.out_w {
                    let mut acc = bias[oc];
                    for ky in 0..p.kernel_h {
                        let ty = y as i32 + p.pad_top - ky as i32;
                        if ty < 0 || ty % p.stride_h as i32 != 0 {
                            continue;
                        }
                        let iy = (ty / p.stride_h as i32) as usize;
                        if iy >= p.in_h {
                            continue;
                        }
                        for kx in 0..p.kernel_w {
                            let tx = x as i32 + p.pad_left - kx as i32;
                            if tx < 0 || tx % p.stride_w as i32 != 0 {
                                continue;
                            }
                            let ix = (tx / p.stride_w as i32) as usize;
                            if ix >= p.in_w {
                                continue;
                            }
                            let row = (oc * p.kernel_h + ky) * p.kernel_w + kx;
                            acc += col[row * in_spatial + iy * p.in_w + ix];
                        }
                    }
                    output[((n * p.out_channels + oc) * p.out_h + y) * p.out_w + x] = stage.apply(acc);
                }
            }
        }
    }
}
