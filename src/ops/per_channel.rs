use super::packing::args_with;
use super::{ConvContext, Operands};
use crate::device::{BufferId, ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::{ConvError, Result};
use crate::kernels::conv2d::PerChannelParams;
use crate::kernels::{calculate_activation_range, per_channel_requant};
use crate::tensor::DataType;
use tracing::debug;

/// Grouped convolution with one requantization pair per output channel.
/// Padding and dilation are resolved inside the kernel.
#[derive(Debug)]
pub(crate) struct PerChannelConv {
    conv: KernelHandle,
    multipliers: BufferId,
    shifts: BufferId,
}

impl PerChannelConv {
    pub fn initialize<D: ComputeDevice + ?Sized>(device: &mut D, ctx: &ConvContext) -> Result<Self> {
        let group = ctx.descriptor.group;
        if ctx.input.c % group != 0 || ctx.output.c % group != 0 {
            return Err(ConvError::invalid(format!(
                "per-channel path needs group {} to divide {} and {} channels",
                group, ctx.input.c, ctx.output.c
            )));
        }
        if ctx.weights.n != ctx.output.c {
            return Err(ConvError::invalid(format!(
                "{} filters for {} output channels",
                ctx.weights.n, ctx.output.c
            )));
        }
        Ok(Self {
            conv: device.resolve_kernel(KernelId::PerChannelConv, ctx.precision)?,
            multipliers: device.allocate(DataType::Int32, ctx.output.c)?,
            shifts: device.allocate(DataType::Int32, ctx.output.c)?,
        })
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.release(self.multipliers)?;
        device.release(self.shifts)?;
        Ok(())
    }

    pub fn execute<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let desc = &ctx.descriptor;
        let requant = per_channel_requant(ops.input.scale(), &ops.weights.scales(), ops.output.scale())?;
        let (multipliers, shifts): (Vec<i32>, Vec<i32>) = requant.iter().map(|r| (r.multiplier, r.shift)).unzip();
        device.write_buffer(self.multipliers, &multipliers)?;
        device.write_buffer(self.shifts, &shifts)?;
        debug!(channels = multipliers.len(), "per-channel requantization tables");

        let (act_min, act_max) = calculate_activation_range(
            desc.activation,
            ops.output.scale(),
            ops.output.zero_point(),
            ctx.precision,
        );
        let mut params = PerChannelParams {
            batch: ctx.input.n,
            in_channels: ctx.input.c,
            in_h: ctx.input.h,
            in_w: ctx.input.w,
            out_channels: ctx.output.c,
            out_h: ctx.output.h,
            out_w: ctx.output.w,
            kernel_h: desc.kernel_h,
            kernel_w: desc.kernel_w,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            dilation_h: desc.dilation_h,
            dilation_w: desc.dilation_w,
            pad_top: desc.padding.top as usize,
            pad_left: desc.padding.left as usize,
            groups: desc.group,
            group: 0,
            input_offset: -ops.input.zero_point(),
            weight_offset: -ops.weights.zero_point(),
            output_offset: ops.output.zero_point(),
            act_min,
            act_max,
        };
        let buffers = [
            ops.input.buffer(),
            ops.weights.buffer(),
            ops.bias.buffer(),
            self.multipliers,
            self.shifts,
            ops.output.buffer(),
        ];
        let work = WorkSize::d3([ctx.input.n, ctx.out_per_group(), ctx.out_spatial()], None);
        for g in 0..desc.group {
            params.group = g;
            device.launch(&self.conv, &args_with(&buffers, &params), &work)?;
        }
        Ok(())
    }
}
