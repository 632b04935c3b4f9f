//! Host reference bodies of the device kernel catalog.
//!
//! Each body computes the data a device kernel of the same name produces,
//! independent of the launch grid. Scalar arguments travel as `i32` in a
//! fixed order defined by the `*Params` structs below; buffers come first.

pub mod conv2d;
pub mod gemm;
pub mod layout;
pub mod quantization;
pub mod utils;
pub mod weights;

pub use quantization::{
    calculate_activation_range, get_quantized_convolution_multiplier, multiply_by_quantized_multiplier,
    per_channel_requant, quantize_multiplier, quantize_multiplier_greater_than_one,
    quantize_multiplier_smaller_than_one, requantize, rounding_divide_by_pot,
    saturating_rounding_doubling_high_mul, RequantParam,
};
pub use utils::{align_to, ceil_div, find_max_factor};

/// Scalar argument block of a kernel.
pub trait KernelParams: Sized {
    fn encode(&self) -> Vec<i32>;
    fn decode(values: &[i32]) -> Option<Self>;
}

macro_rules! kernel_params {
    ($(#[$meta:meta])* pub struct $name:ident { $(pub $field:ident: $ty:ty,)* }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
        pub struct $name {
            $(pub $field: $ty,)*
        }

        impl $crate::kernels::KernelParams for $name {
            fn encode(&self) -> Vec<i32> {
                vec![$(self.$field as i32),*]
            }

            fn decode(values: &[i32]) -> Option<Self> {
                let mut it = values.iter().copied();
                let params = Self {
                    $($field: it.next()? as $ty,)*
                };
                match it.next() {
                    Some(_) => None,
                    None => Some(params),
                }
            }
        }
    };
}
pub(crate) use kernel_params;

/// Output-stage scalars shared by every requantizing kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputStage {
    pub output_offset: i32,
    pub requant: RequantParam,
    pub act_min: i32,
    pub act_max: i32,
}

impl OutputStage {
    #[inline]
    pub fn apply(&self, acc: i32) -> i32 {
        requantize(acc, self.requant, self.output_offset, self.act_min, self.act_max)
    }
}
