//! Architecture capability flags and per-generation launch constants.
//!
//! The constants here were tuned empirically per GPU generation. They shape
//! launches and buffer padding but never change numeric results.

use crate::ops::selector::ConvVariant;

/// Capability flags of the target GPU generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArchitectureProfile {
    pub bifrost: bool,
    /// Makalu-class parts that prefer the 1xN GEMM for ungrouped convolution.
    pub high_end: bool,
    pub valhall: bool,
}

impl ArchitectureProfile {
    pub const fn generic() -> Self {
        Self {
            bifrost: false,
            high_end: false,
            valhall: false,
        }
    }

    pub const fn bifrost() -> Self {
        Self {
            bifrost: true,
            high_end: false,
            valhall: false,
        }
    }

    pub const fn high_end() -> Self {
        Self {
            bifrost: true,
            high_end: true,
            valhall: false,
        }
    }

    /// Valhall parts also report the older capability flags.
    pub const fn valhall() -> Self {
        Self {
            bifrost: true,
            high_end: true,
            valhall: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TuningTable {
    /// Row alignment of the GEMM im2col buffer.
    pub gemm_coalescing: usize,
    /// Column alignment of GEMM weights and im2col rows.
    pub gemm_tile: usize,
    pub gemm_local: [usize; 3],
    pub pad_local: [usize; 3],
    pub im2col_local: [usize; 3],
    pub im2col_grouped_local: [usize; 3],
    pub align_weight_local: [usize; 2],

    /// Row alignment of the 1xN converted activation (lines x threads).
    pub gemm1xn_coalescing: usize,
    /// Accumulation block along the reduction axis.
    pub gemm1xn_k_block: usize,
    /// Output-channel alignment of the packed 1xN weights.
    pub gemm1xn_channel_block: usize,
    pub gemm1xn_local: [usize; 3],
    pub convert_local: usize,
    pub convert_local_small: usize,
    pub convert_small_threshold: usize,

    pub direct_local: [usize; 3],
    pub direct_out_block: usize,
    pub direct_channel_block: usize,

    pub depthwise_local: usize,
    pub max_group_size: usize,
    pub deconv_local: [usize; 3],
}

impl TuningTable {
    pub fn for_profile(profile: ArchitectureProfile) -> Self {
        let mut table = Self::default();
        if profile.valhall {
            table.gemm1xn_coalescing = 32;
            table.gemm1xn_k_block = 8;
            table.gemm1xn_local = [1, 2, 8];
            table.convert_local = 64;
        }
        table
    }
}

impl Default for TuningTable {
    fn default() -> Self {
        Self {
            gemm_coalescing: 12,
            gemm_tile: 16,
            gemm_local: [1, 1, 12],
            pad_local: [1, 4, 64],
            im2col_local: [1, 1, 16],
            im2col_grouped_local: [1, 16, 16],
            align_weight_local: [1, 12],
            gemm1xn_coalescing: 48,
            gemm1xn_k_block: 4,
            gemm1xn_channel_block: 8,
            gemm1xn_local: [1, 2, 24],
            convert_local: 72,
            convert_local_small: 24,
            convert_small_threshold: 72,
            direct_local: [16, 1, 1],
            direct_out_block: 8,
            direct_channel_block: 4,
            depthwise_local: 32,
            max_group_size: 128,
            deconv_local: [1, 4, 32],
        }
    }
}

/// Operator configuration. Defaults follow the device's architecture profile.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub tuning: Option<TuningTable>,
    /// Bypass variant selection. The forced variant must still support the shape.
    pub force_variant: Option<ConvVariant>,
}

impl EngineConfig {
    pub fn with_tuning(mut self, tuning: TuningTable) -> Self {
        self.tuning = Some(tuning);
        self
    }

    pub fn with_variant(mut self, variant: ConvVariant) -> Self {
        self.force_variant = Some(variant);
        self
    }

    pub fn resolve_tuning(&self, profile: ArchitectureProfile) -> TuningTable {
        self.tuning
            .clone()
            .unwrap_or_else(|| TuningTable::for_profile(profile))
    }
}
