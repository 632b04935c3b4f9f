use super::descriptor::ConvDescriptor;
use crate::device::KernelId;
use crate::tensor::{Dim4, Precision};
use crate::tuning::ArchitectureProfile;
use std::fmt;

/// Execution strategy of a quantized convolution, fixed at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvVariant {
    Direct,
    Gemm,
    Gemm1xN,
    Depthwise,
    PerChannel,
}

impl fmt::Display for ConvVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConvVariant::Direct => "direct",
            ConvVariant::Gemm => "gemm",
            ConvVariant::Gemm1xN => "gemm1xN",
            ConvVariant::Depthwise => "depthwise",
            ConvVariant::PerChannel => "per-channel",
        })
    }
}

/// Everything the selection depends on.
#[derive(Debug, Clone, Copy)]
pub struct SelectionKey<'a> {
    pub input: Dim4,
    pub output: Dim4,
    pub descriptor: &'a ConvDescriptor,
    pub precision: Precision,
    pub per_channel: bool,
    pub profile: ArchitectureProfile,
}

pub fn is_depthwise(input: Dim4, output: Dim4, desc: &ConvDescriptor) -> bool {
    desc.group > 1
        && desc.group == input.c
        && (output.c % desc.group == 0 || input.c * desc.depth_multiplier < output.c)
}

fn direct_eligible(key: &SelectionKey<'_>) -> bool {
    let d = key.descriptor;
    !key.precision.is_signed()
        && d.kernel_h == d.kernel_w
        && matches!(d.kernel_h, 3 | 5 | 7 | 9)
        && d.group == 1
        && !d.is_dilated()
        && d.stride_h == 1
        && d.stride_w == 1
        && key.output.w % 8 == 0
}

pub fn select_variant(key: &SelectionKey<'_>) -> ConvVariant {
    let d = key.descriptor;
    if key.per_channel {
        ConvVariant::PerChannel
    } else if is_depthwise(key.input, key.output, d) {
        ConvVariant::Depthwise
    } else if direct_eligible(key) {
        ConvVariant::Direct
    } else if (d.group == 1 && key.profile.high_end) || d.is_dilated() {
        ConvVariant::Gemm1xN
    } else {
        ConvVariant::Gemm
    }
}

/// Depthwise sub-kernel. The int8 catalog only carries the generic kernel.
pub fn depthwise_kernel(desc: &ConvDescriptor, precision: Precision) -> KernelId {
    if precision.is_signed() {
        return KernelId::DepthwiseGeneric;
    }
    let k3 = desc.kernel_h == 3 && desc.kernel_w == 3;
    let s1 = desc.stride_h == 1 && desc.stride_w == 1;
    let s2 = desc.stride_h == 2 && desc.stride_w == 2;
    let d1 = desc.dilation_h == 1 && desc.dilation_w == 1;
    let d2 = desc.dilation_h == 2 && desc.dilation_w == 2;
    let dm1 = desc.depth_multiplier == 1;
    match () {
        _ if dm1 && d1 && k3 && s1 => KernelId::Depthwise3x3S1PadMerge,
        _ if dm1 && d1 && k3 && s2 => KernelId::Depthwise3x3S2PadMerge,
        _ if dm1 && d2 && k3 && s1 => KernelId::Depthwise3x3S1D2PadMerge,
        _ if k3 && s1 && d1 => KernelId::Depthwise3x3S1Quad,
        _ if k3 && s2 && d1 => KernelId::Depthwise3x3S2,
        _ => KernelId::DepthwiseGeneric,
    }
}

/// Convert kernel of the 1xN path, keyed on the (dilated) kernel extent.
///
/// int8 input always takes the generic with-pad convert; the shape-specialised
/// converts exist for uint8 only.
pub fn convert_kernel(
    desc: &ConvDescriptor,
    kernel: (usize, usize),
    out_w: usize,
    precision: Precision,
    profile: ArchitectureProfile,
) -> KernelId {
    let (kh, kw) = kernel;
    let p = desc.padding;
    let s1 = desc.stride_h == 1 && desc.stride_w == 1;
    let square = |k: usize| kh == k && kw == k;
    let small_pad = p.top < 2 && p.bottom < 2 && p.left < 2 && p.right < 2;
    if precision.is_signed() {
        if profile.valhall {
            KernelId::ConvertWithPadValhall
        } else {
            KernelId::ConvertWithPad
        }
    } else if square(1) && s1 && p.is_zero() {
        KernelId::Convert1x1
    } else if profile.valhall && s1 && square(9) && p.is_symmetric(4) && out_w % 8 == 0 {
        KernelId::Convert9x9Pad4Valhall
    } else if profile.valhall && s1 && square(5) && p.is_symmetric(2) && out_w % 8 == 0 {
        KernelId::Convert5x5Pad2Valhall
    } else if profile.valhall && s1 && square(3) && p.is_symmetric(1) && out_w % 8 == 0 {
        KernelId::Convert3x3Pad1Valhall
    } else if profile.valhall && square(3) && small_pad {
        KernelId::Convert3x3SmallPadValhall
    } else if square(3) && small_pad {
        KernelId::Convert3x3SmallPad
    } else if profile.valhall {
        KernelId::ConvertWithPadValhall
    } else {
        KernelId::ConvertWithPad
    }
}
