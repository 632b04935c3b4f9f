//! Quantized convolution operators.
//!
//! [`Convolution`] validates its operands, selects one [`ConvVariant`] at
//! initialization and then drives that variant's kernels on every execute.
//! Requantization parameters are recomputed per call and passed down as
//! values; the operator itself only holds packed buffers and kernel handles.

pub mod deconv;
pub mod descriptor;
mod direct;
mod gemm;
mod gemm1xn;
mod depthwise;
mod packing;
mod per_channel;
pub mod selector;

pub use deconv::Deconvolution;
pub use descriptor::{ActivationKind, ConvDescriptor, Padding};
pub use selector::ConvVariant;

use crate::device::ComputeDevice;
use crate::error::{ConvError, Result};
use crate::kernels::{calculate_activation_range, get_quantized_convolution_multiplier, OutputStage, RequantParam};
use crate::tensor::{DataType, Dim4, Precision, QuantizedTensor};
use crate::tuning::{ArchitectureProfile, EngineConfig, TuningTable};
use selector::{is_depthwise, select_variant, SelectionKey};
use tracing::debug;

/// Shapes and settings fixed at initialization.
#[derive(Debug, Clone)]
pub(crate) struct ConvContext {
    pub descriptor: ConvDescriptor,
    pub input: Dim4,
    pub output: Dim4,
    pub weights: Dim4,
    pub precision: Precision,
    pub tuning: TuningTable,
    pub profile: ArchitectureProfile,
}

impl ConvContext {
    pub fn in_per_group(&self) -> usize {
        self.input.c / self.descriptor.group
    }

    pub fn out_per_group(&self) -> usize {
        self.output.c / self.descriptor.group
    }

    /// Reduction length of one output value, using the dilated extent.
    pub fn patch(&self) -> usize {
        let (kh, kw) = self.descriptor.effective_kernel();
        self.in_per_group() * kh * kw
    }

    pub fn out_spatial(&self) -> usize {
        self.output.h * self.output.w
    }
}

/// Tensors taking part in one execute call.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Operands<'a> {
    pub input: &'a QuantizedTensor,
    pub weights: &'a QuantizedTensor,
    pub bias: &'a QuantizedTensor,
    pub output: &'a QuantizedTensor,
}

/// Per-tensor multiplier and activation clamp for this call.
///
/// `zero_shift` moves the output zero point into the unsigned domain for
/// kernels that normalise int8 storage.
pub(crate) fn per_tensor_stage(
    ops: &Operands<'_>,
    activation: ActivationKind,
    precision: Precision,
    zero_shift: i32,
) -> Result<OutputStage> {
    let ratio = get_quantized_convolution_multiplier(
        ops.input.scale(),
        ops.weights.scale(),
        ops.bias.scale(),
        ops.output.scale(),
    )?;
    let output_offset = ops.output.zero_point() + zero_shift;
    let (act_min, act_max) = calculate_activation_range(activation, ops.output.scale(), output_offset, precision);
    Ok(OutputStage {
        output_offset,
        requant: RequantParam::from_ratio(ratio),
        act_min,
        act_max,
    })
}

#[derive(Debug)]
enum Plan {
    Direct(direct::DirectConv),
    Gemm(gemm::GemmConv),
    Gemm1xN(gemm1xn::Gemm1xNConv),
    Depthwise(depthwise::DepthwiseConv),
    PerChannel(per_channel::PerChannelConv),
}

/// A quantized 2-D convolution bound to one set of weights and bias.
#[derive(Debug)]
pub struct Convolution {
    ctx: ConvContext,
    variant: ConvVariant,
    weights: QuantizedTensor,
    bias: QuantizedTensor,
    plan: Plan,
}

fn check_quantized(name: &str, tensor: &QuantizedTensor) -> Result<()> {
    if tensor.dims().is_empty() {
        return Err(ConvError::invalid(format!("{} tensor is empty", name)));
    }
    Ok(())
}

impl Convolution {
    /// Validate shapes, select a variant, resolve its kernels and, for
    /// constant weights and bias, pack and fold them once.
    pub fn initialize<D: ComputeDevice + ?Sized>(
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
        weights: &QuantizedTensor,
        bias: &QuantizedTensor,
        descriptor: ConvDescriptor,
        config: &EngineConfig,
    ) -> Result<Self> {
        check_quantized("input", input)?;
        check_quantized("output", output)?;
        check_quantized("weight", weights)?;
        check_quantized("bias", bias)?;
        descriptor.validate()?;
        if !descriptor.padding.is_non_negative() {
            return Err(ConvError::invalid("negative padding"));
        }
        let precision = Precision::from_data_type(input.data_type())?;
        if output.data_type() != input.data_type() {
            return Err(ConvError::invalid(format!(
                "output {:?} differs from input {:?}",
                output.data_type(),
                input.data_type()
            )));
        }
        if bias.data_type() != DataType::Int32 {
            return Err(ConvError::invalid("bias must be int32"));
        }
        let (in_dims, out_dims, w_dims) = (input.dims(), output.dims(), weights.dims());
        descriptor.check_output(in_dims, out_dims)?;
        if bias.dims().count() != out_dims.c {
            return Err(ConvError::invalid(format!(
                "{} bias values for {} output channels",
                bias.dims().count(),
                out_dims.c
            )));
        }

        let depthwise = is_depthwise(in_dims, out_dims, &descriptor);
        let group = descriptor.group;
        if !depthwise && (in_dims.c % group != 0 || out_dims.c % group != 0) {
            return Err(ConvError::invalid(format!(
                "group {} does not divide channels {} -> {}",
                group, in_dims.c, out_dims.c
            )));
        }
        let expected_w = if depthwise {
            Dim4::new(in_dims.c * descriptor.depth_multiplier, 1, descriptor.kernel_h, descriptor.kernel_w)
        } else {
            Dim4::new(out_dims.c, in_dims.c / group, descriptor.kernel_h, descriptor.kernel_w)
        };
        let fed = if depthwise { expected_w.n.min(out_dims.c) } else { out_dims.c };
        if w_dims.c != expected_w.c || w_dims.h != expected_w.h || w_dims.w != expected_w.w || w_dims.n < fed {
            return Err(ConvError::invalid(format!(
                "weight shape {} does not match expected {}",
                w_dims, expected_w
            )));
        }

        let profile = device.profile();
        let key = SelectionKey {
            input: in_dims,
            output: out_dims,
            descriptor: &descriptor,
            precision,
            per_channel: weights.is_per_channel(),
            profile,
        };
        let variant = config.force_variant.unwrap_or_else(|| select_variant(&key));
        if weights.is_per_channel() && variant != ConvVariant::PerChannel {
            return Err(ConvError::invalid(format!(
                "per-channel weights cannot run on the {} variant",
                variant
            )));
        }
        if variant == ConvVariant::Depthwise && !depthwise {
            return Err(ConvError::invalid("depthwise variant needs group == input channels"));
        }
        if depthwise && variant != ConvVariant::Depthwise && variant != ConvVariant::PerChannel {
            return Err(ConvError::invalid(format!("depthwise shape cannot run on the {} variant", variant)));
        }

        let ctx = ConvContext {
            descriptor,
            input: in_dims,
            output: out_dims,
            weights: w_dims,
            precision,
            tuning: config.resolve_tuning(profile),
            profile,
        };
        debug!(
            %variant,
            input = %in_dims,
            output = %out_dims,
            kernel_h = descriptor.kernel_h,
            kernel_w = descriptor.kernel_w,
            group,
            ?precision,
            "initialize convolution"
        );

        let ops = Operands {
            input,
            weights,
            bias,
            output,
        };
        let plan = match variant {
            ConvVariant::Direct => Plan::Direct(direct::DirectConv::initialize(device, &ctx, &ops)?),
            ConvVariant::Gemm => Plan::Gemm(gemm::GemmConv::initialize(device, &ctx, &ops)?),
            ConvVariant::Gemm1xN => Plan::Gemm1xN(gemm1xn::Gemm1xNConv::initialize(device, &ctx, &ops)?),
            ConvVariant::Depthwise => Plan::Depthwise(depthwise::DepthwiseConv::initialize(device, &ctx, &ops)?),
            ConvVariant::PerChannel => Plan::PerChannel(per_channel::PerChannelConv::initialize(device, &ctx)?),
        };
        Ok(Self {
            ctx,
            variant,
            weights: weights.clone(),
            bias: bias.clone(),
            plan,
        })
    }

    pub fn variant(&self) -> ConvVariant {
        self.variant
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        &self.ctx.descriptor
    }

    /// Run the convolution. Weight and bias buffers are re-read when the
    /// descriptor marks them as graph inputs.
    pub fn execute<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
    ) -> Result<()> {
        if input.dims() != self.ctx.input || output.dims() != self.ctx.output {
            return Err(ConvError::ShapeMismatch {
                expected: format!("{} -> {}", self.ctx.input, self.ctx.output),
                actual: format!("{} -> {}", input.dims(), output.dims()),
            });
        }
        if input.data_type() != self.ctx.precision.data_type() || output.data_type() != input.data_type() {
            return Err(ConvError::invalid("element type changed since initialize"));
        }
        let ops = Operands {
            input,
            weights: &self.weights,
            bias: &self.bias,
            output,
        };
        debug!(variant = %self.variant, input = %input.dims(), "execute convolution");
        match &mut self.plan {
            Plan::Direct(p) => p.execute(device, &self.ctx, &ops),
            Plan::Gemm(p) => p.execute(device, &self.ctx, &ops),
            Plan::Gemm1xN(p) => p.execute(device, &self.ctx, &ops),
            Plan::Depthwise(p) => p.execute(device, &self.ctx, &ops),
            Plan::PerChannel(p) => p.execute(device, &self.ctx, &ops),
        }
    }

    /// Free every device buffer the operator allocated. The caller's input,
    /// output, weight and bias tensors are left alone.
    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        debug!(variant = %self.variant, "release convolution");
        match self.plan {
            Plan::Direct(p) => p.release(device),
            Plan::Gemm(p) => p.release(device),
            Plan::Gemm1xN(p) => p.release(device),
            Plan::Depthwise(p) => p.release(device),
            Plan::PerChannel(p) => p.release(device),
        }
    }

    /// Replace the weight and bias tensors of an operator whose descriptor
    /// marks them as graph inputs. Shapes must stay the same.
    pub fn set_inputs(&mut self, weights: &QuantizedTensor, bias: &QuantizedTensor) -> Result<()> {
        if !self.ctx.descriptor.repack_each_call() {
            return Err(ConvError::invalid("weights and bias are constant for this operator"));
        }
        if weights.dims() != self.weights.dims() || bias.dims() != self.bias.dims() {
            return Err(ConvError::invalid("replacement weights or bias change shape"));
        }
        self.weights = weights.clone();
        self.bias = bias.clone();
        Ok(())
    }
}
