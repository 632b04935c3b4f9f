use crate::tensor::Precision;
use std::fmt;

/// Every device kernel the convolution operators can launch.
///
/// Signedness is carried separately by [`Precision`]; architecture-specific
/// variants are distinct entries so that the choice is made once at
/// initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelId {
    // activation layout
    PadOpt,
    PadCopyAlignC4,
    DepthwisePad,
    Im2col,
    Im2colGrouped,
    Convert1x1,
    ConvertWithPad,
    ConvertWithPadValhall,
    Convert3x3SmallPad,
    Convert3x3SmallPadValhall,
    Convert3x3Pad1Valhall,
    Convert5x5Pad2Valhall,
    Convert9x9Pad4Valhall,
    MatrixTranspose,

    // weight packing
    AlignWeightGemm,
    AlignWeight1xN,
    AlignWeightDirect,
    DilationInit,
    Dilation,
    WeightOffset,
    UpdateDirectBias,

    // compute
    GemmBlocked,
    Gemm1xN,
    Gemm1xNBlock8,
    Direct3x3,
    Direct5x5,
    Direct7x7,
    Direct9x9,
    DepthwiseGeneric,
    Depthwise3x3S1PadMerge,
    Depthwise3x3S2PadMerge,
    Depthwise3x3S1D2PadMerge,
    Depthwise3x3S1Quad,
    Depthwise3x3S2,
    DepthwiseUnequal,
    PerChannelConv,
    ConvBackGemm,
    ConvertBottomDiff,
    ConvertBottomDiffPerChannel,
}

impl KernelId {
    pub fn name(self) -> &'static str {
        match self {
            KernelId::PadOpt => "pad_opt",
            KernelId::PadCopyAlignC4 => "pad_copy_align_c4",
            KernelId::DepthwisePad => "pad",
            KernelId::Im2col => "convert_optimized",
            KernelId::Im2colGrouped => "convertBlocked2",
            KernelId::Convert1x1 => "align_convert_1x1",
            KernelId::ConvertWithPad => "align_convert_withpad",
            KernelId::ConvertWithPadValhall => "align_convert_withpad_valhall",
            KernelId::Convert3x3SmallPad => "align_convert_3x3_smallpad",
            KernelId::Convert3x3SmallPadValhall => "align_convert_3x3_smallpad_valhall",
            KernelId::Convert3x3Pad1Valhall => "align_convert_3x3_pad1_valhall",
            KernelId::Convert5x5Pad2Valhall => "align_convert_5x5_pad2_valhall",
            KernelId::Convert9x9Pad4Valhall => "align_convert_9x9_pad4_valhall",
            KernelId::MatrixTranspose => "matrixTrans",
            KernelId::AlignWeightGemm => "alignQuantizedWeight_gemm",
            KernelId::AlignWeight1xN => "align_weight_1xX",
            KernelId::AlignWeightDirect => "align_weight_direct",
            KernelId::DilationInit => "dilation_init",
            KernelId::Dilation => "dilation",
            KernelId::WeightOffset => "weight_offset",
            KernelId::UpdateDirectBias => "update_direct_conv_bias",
            KernelId::GemmBlocked => "quantizedGemmBlocked",
            KernelId::Gemm1xN => "gemm_1xX_block4",
            KernelId::Gemm1xNBlock8 => "gemm_1xX_block8",
            KernelId::Direct3x3 => "direct3x3_8x4",
            KernelId::Direct5x5 => "direct5x5_8x4",
            KernelId::Direct7x7 => "direct7x7_8x4",
            KernelId::Direct9x9 => "direct9x9_8x4",
            KernelId::DepthwiseGeneric => "depthwise_conv",
            KernelId::Depthwise3x3S1PadMerge => "depthwise_conv_3x3s1_pad_merge",
            KernelId::Depthwise3x3S2PadMerge => "depthwise_conv_3x3s2_pad_merge",
            KernelId::Depthwise3x3S1D2PadMerge => "depthwise_conv_3x3s1d2_pad_merge",
            KernelId::Depthwise3x3S1Quad => "depthwise_conv_3x3s1_4P",
            KernelId::Depthwise3x3S2 => "depthwise_conv_3x3s2",
            KernelId::DepthwiseUnequal => "depthwise_conv_unequal",
            KernelId::PerChannelConv => "conv_per_channel_quantized",
            KernelId::ConvBackGemm => "convBackGemmRXR",
            KernelId::ConvertBottomDiff => "convertBottomDiff2",
            KernelId::ConvertBottomDiffPerChannel => "convertBottomDiff2_per_channel",
        }
    }

    /// Direct-convolution kernel for a square kernel size, if one exists.
    pub fn direct(kernel_size: usize) -> Option<Self> {
        match kernel_size {
            3 => Some(KernelId::Direct3x3),
            5 => Some(KernelId::Direct5x5),
            7 => Some(KernelId::Direct7x7),
            9 => Some(KernelId::Direct9x9),
            _ => None,
        }
    }

    /// Whether the depthwise kernel reads unpadded input and resolves padding itself.
    pub fn merges_padding(self) -> bool {
        matches!(
            self,
            KernelId::Depthwise3x3S1PadMerge
                | KernelId::Depthwise3x3S2PadMerge
                | KernelId::Depthwise3x3S1D2PadMerge
        )
    }

    /// Kernels with no int8 build in the catalog.
    pub fn unsigned_only(self) -> bool {
        matches!(
            self,
            KernelId::Direct3x3
                | KernelId::Direct5x5
                | KernelId::Direct7x7
                | KernelId::Direct9x9
                | KernelId::PadCopyAlignC4
                | KernelId::AlignWeightDirect
                | KernelId::UpdateDirectBias
                | KernelId::Depthwise3x3S1PadMerge
                | KernelId::Depthwise3x3S2PadMerge
                | KernelId::Depthwise3x3S1D2PadMerge
                | KernelId::Depthwise3x3S1Quad
                | KernelId::Depthwise3x3S2
        )
    }

    pub fn qualified_name(self, precision: Precision) -> String {
        if precision.is_signed() {
            format!("SIGNED{}", self.name())
        } else {
            self.name().to_string()
        }
    }
}

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
