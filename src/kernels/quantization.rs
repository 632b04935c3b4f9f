use crate::error::{ConvError, Result};
use crate::ops::descriptor::ActivationKind;
use crate::tensor::Precision;

/// Fixed-point form of a real scale ratio: `ratio ≈ multiplier * 2^(shift - 31)`.
///
/// `multiplier` is a Q31 significand in `[2^30, 2^31)` (or zero), `shift` the
/// binary exponent; negative values mean a right shift when applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequantParam {
    pub multiplier: i32,
    pub shift: i32,
}

impl RequantParam {
    pub fn from_ratio(ratio: f64) -> Self {
        let (multiplier, shift) = quantize_multiplier(ratio);
        Self { multiplier, shift }
    }

    /// The real ratio this pair encodes.
    pub fn to_ratio(self) -> f64 {
        self.multiplier as f64 * 2f64.powi(self.shift - 31)
    }

    #[inline]
    pub fn apply(self, acc: i32) -> i32 {
        multiply_by_quantized_multiplier(acc, self.multiplier, self.shift)
    }
}

/// Split `x` into a mantissa in `[0.5, 1)` and a binary exponent.
fn frexp(x: f64) -> (f64, i32) {
    if x == 0.0 || !x.is_finite() {
        return (x, 0);
    }
    let bits = x.to_bits();
    let exp_bits = ((bits >> 52) & 0x7ff) as i32;
    if exp_bits == 0 {
        // subnormal: normalise first
        let (m, e) = frexp(x * 2f64.powi(64));
        return (m, e - 64);
    }
    let exponent = exp_bits - 1022;
    let mantissa = f64::from_bits((bits & !(0x7ffu64 << 52)) | (1022u64 << 52));
    (mantissa, exponent)
}

/// Decompose a non-negative real multiplier into `(Q31 significand, exponent)`.
///
/// Ratios below `2^-32` underflow to `(0, 0)`: the exponent would need a
/// right shift past 31 bits, which rounds every accumulator to zero anyway.
pub fn quantize_multiplier(real: f64) -> (i32, i32) {
    if real == 0.0 {
        return (0, 0);
    }
    let (q, mut shift) = frexp(real);
    let mut q_fixed = (q * (1i64 << 31) as f64).round() as i64;
    if q_fixed == 1i64 << 31 {
        q_fixed /= 2;
        shift += 1;
    }
    if shift < -31 {
        return (0, 0);
    }
    (q_fixed as i32, shift)
}

/// Multiplier for ratios below one, returned as a right-shift amount.
pub fn quantize_multiplier_smaller_than_one(real: f64) -> (i32, i32) {
    let (multiplier, shift) = quantize_multiplier(real);
    (multiplier, -shift)
}

/// Multiplier for ratios above one, returned as a left-shift amount.
pub fn quantize_multiplier_greater_than_one(real: f64) -> (i32, i32) {
    quantize_multiplier(real)
}

/// `input_scale * filter_scale / output_scale`, validated against the bias scale.
pub fn get_quantized_convolution_multiplier(
    input_scale: f64,
    filter_scale: f64,
    bias_scale: f64,
    output_scale: f64,
) -> Result<f64> {
    let product = input_scale * filter_scale;
    // NaN on either side fails the comparison
    if !((product - bias_scale).abs() <= 1e-6 * product.min(bias_scale)) {
        tracing::warn!(product, bias_scale, "bias scale does not match input*filter");
        return Err(ConvError::ScaleMismatch {
            product,
            bias: bias_scale,
        });
    }
    if product < 0.0 {
        return Err(ConvError::NegativeScale(product));
    }
    let ratio = product / output_scale;
    if !(ratio.is_finite() && ratio > 0.0) {
        return Err(ConvError::InvalidRatio(ratio));
    }
    Ok(ratio)
}

/// Derive one requantization pair per output channel from per-channel filter scales.
pub fn per_channel_requant(
    input_scale: f64,
    filter_scales: &[f64],
    output_scale: f64,
) -> Result<Vec<RequantParam>> {
    filter_scales
        .iter()
        .map(|&filter_scale| {
            let ratio = get_quantized_convolution_multiplier(
                input_scale,
                filter_scale,
                input_scale * filter_scale,
                output_scale,
            )?;
            Ok(RequantParam::from_ratio(ratio))
        })
        .collect()
}

#[inline]
fn quantize_real(value: f64, scale: f64, zero_point: i32) -> i32 {
    zero_point + (value / scale).round() as i32
}

/// Clamp range of a fused activation in the quantized output domain.
pub fn calculate_activation_range(
    activation: ActivationKind,
    scale: f64,
    zero_point: i32,
    precision: Precision,
) -> (i32, i32) {
    let (qmin, qmax) = precision.range();
    match activation {
        ActivationKind::None => (qmin, qmax),
        ActivationKind::Relu => (qmin.max(quantize_real(0.0, scale, zero_point)), qmax),
        ActivationKind::Relu6 => (
            qmin.max(quantize_real(0.0, scale, zero_point)),
            qmax.min(quantize_real(6.0, scale, zero_point)),
        ),
        ActivationKind::Relu1 => (
            qmin.max(quantize_real(-1.0, scale, zero_point)),
            qmax.min(quantize_real(1.0, scale, zero_point)),
        ),
    }
}

#[inline]
pub fn saturating_rounding_doubling_high_mul(a: i32, b: i32) -> i32 {
    if a == b && a == i32::MIN {
        return i32::MAX;
    }
    let ab = a as i64 * b as i64;
    let nudge: i64 = if ab >= 0 { 1 << 30 } else { 1 - (1 << 30) };
    ((ab + nudge) / (1i64 << 31)) as i32
}

#[inline]
pub fn rounding_divide_by_pot(x: i32, exponent: i32) -> i32 {
    debug_assert!((0..=31).contains(&exponent));
    let mask = ((1i64 << exponent) - 1) as i32;
    let remainder = x & mask;
    let threshold = (mask >> 1) + i32::from(x < 0);
    (x >> exponent) + i32::from(remainder > threshold)
}

/// `x * multiplier * 2^(shift - 31)` with gemmlowp rounding.
#[inline]
pub fn multiply_by_quantized_multiplier(x: i32, multiplier: i32, shift: i32) -> i32 {
    let left_shift = shift.max(0);
    let right_shift = (-shift).max(0);
    let shifted = x.wrapping_mul(1i32.wrapping_shl(left_shift as u32));
    rounding_divide_by_pot(
        saturating_rounding_doubling_high_mul(shifted, multiplier),
        right_shift.min(31),
    )
}

/// Scale an accumulator into the output domain and clamp it.
#[inline]
pub fn requantize(acc: i32, param: RequantParam, output_offset: i32, act_min: i32, act_max: i32) -> i32 {
    let v = param.apply(acc) + output_offset;
    v.max(act_min).min(act_max)
}
