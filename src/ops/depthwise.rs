use super::packing::{args_with, PadStep, WeightDilation};
use super::selector::depthwise_kernel;
use super::{per_tensor_stage, ConvContext, Operands};
use crate::device::{ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::Result;
use crate::kernels::conv2d::{DepthwiseParams, UnequalParams, SIGNED_SHIFT};
use crate::kernels::{align_to, ceil_div, find_max_factor};
use crate::tensor::Precision;
use tracing::debug;

/// One filter per output channel. Output channels no input channel feeds
/// are filled from the bias alone by a second kernel.
#[derive(Debug)]
pub(crate) struct DepthwiseConv {
    pad: Option<PadStep>,
    dilation: Option<WeightDilation>,
    depthwise: KernelHandle,
    unequal: Option<KernelHandle>,
    params: DepthwiseParams,
    work: WorkSize,
}

impl DepthwiseConv {
    pub fn initialize<D: ComputeDevice + ?Sized>(device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<Self> {
        let desc = &ctx.descriptor;
        let precision = ctx.precision;
        let kernel = depthwise_kernel(desc, precision);
        let merged = kernel.merges_padding();

        let pad = if merged {
            None
        } else {
            PadStep::new(device, KernelId::DepthwisePad, precision, ctx.input, desc, &ctx.tuning)?
        };
        let native_dilation = kernel == KernelId::Depthwise3x3S1D2PadMerge;
        let dilation = if native_dilation {
            None
        } else {
            WeightDilation::new(device, precision, ops.weights, desc)?
        };
        let src = pad.as_ref().map_or(ctx.input, PadStep::padded_dims);
        let (kernel_h, kernel_w, dilation_h, dilation_w) = match &dilation {
            Some(d) => {
                let dims = d.dims(ops.weights.dims());
                (dims.h, dims.w, 1, 1)
            }
            None => (desc.kernel_h, desc.kernel_w, desc.dilation_h, desc.dilation_w),
        };
        let (pad_top, pad_left) = if merged {
            (desc.padding.top as usize, desc.padding.left as usize)
        } else {
            (0, 0)
        };
        let params = DepthwiseParams {
            batch: ctx.input.n,
            in_channels: ctx.input.c,
            in_h: src.h,
            in_w: src.w,
            out_channels: ctx.output.c,
            depth_multiplier: desc.depth_multiplier,
            kernel_h,
            kernel_w,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            dilation_h,
            dilation_w,
            pad_top,
            pad_left,
            out_h: ctx.output.h,
            out_w: ctx.output.w,
            ..Default::default()
        };

        let n = ctx.input.n;
        let channels = ctx.input.c;
        let (oh, ow) = (ctx.output.h, ctx.output.w);
        let work = match kernel {
            KernelId::Depthwise3x3S1PadMerge | KernelId::Depthwise3x3S2PadMerge | KernelId::Depthwise3x3S1D2PadMerge => {
                WorkSize::d3([n * channels, align_to(oh, 2), align_to(ceil_div(ow, 4), 8)], Some([1, 2, 8]))
            }
            KernelId::Depthwise3x3S1Quad => WorkSize::d3(
                [n * channels, align_to(oh, 2) / 2, align_to(ow, 32) / 2],
                Some([1, 1, 16]),
            ),
            _ => {
                let l = ctx.tuning.depthwise_local;
                WorkSize::d3([n, channels, align_to(oh * ow, l)], Some([1, 1, l]))
            }
        };

        let unequal = if ctx.output.c > params.fed_channels() {
            Some(device.resolve_kernel(KernelId::DepthwiseUnequal, precision)?)
        } else {
            None
        };
        debug!(kernel = %kernel, merged, unequal = unequal.is_some(), "depthwise kernel");

        let conv = Self {
            pad,
            dilation,
            depthwise: device.resolve_kernel(kernel, precision)?,
            unequal,
            params,
            work,
        };
        if !desc.repack_each_call() {
            if let Some(d) = &conv.dilation {
                d.run(device, ops.weights)?;
            }
        }
        Ok(conv)
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        if let Some(pad) = self.pad {
            pad.release(device)?;
        }
        if let Some(dilation) = self.dilation {
            dilation.release(device)?;
        }
        Ok(())
    }

    pub fn execute<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let desc = &ctx.descriptor;
        if desc.repack_each_call() {
            if let Some(d) = &self.dilation {
                d.run(device, ops.weights)?;
            }
        }
        let src = match &self.pad {
            Some(pad) => {
                pad.run(device, ops.input)?;
                pad.buffer
            }
            None => ops.input.buffer(),
        };
        let weights = self.dilation.as_ref().map_or(ops.weights.buffer(), |d| d.buffer);

        // int8 runs on the unsigned arithmetic with every zero point moved up by 128
        let (shift, range) = if ctx.precision.is_signed() {
            (SIGNED_SHIFT, Precision::UInt8)
        } else {
            (0, ctx.precision)
        };
        let stage = per_tensor_stage(ops, desc.activation, range, shift)?;
        let params = DepthwiseParams {
            input_offset: -(ops.input.zero_point() + shift),
            weight_offset: -(ops.weights.zero_point() + shift),
            output_offset: stage.output_offset,
            multiplier: stage.requant.multiplier,
            shift: stage.requant.shift,
            act_min: stage.act_min,
            act_max: stage.act_max,
            ..self.params
        };
        let buffers = [src, weights, ops.bias.buffer(), ops.output.buffer()];
        device.launch(&self.depthwise, &args_with(&buffers, &params), &self.work)?;

        if let Some(unequal) = &self.unequal {
            let first_channel = params.fed_channels();
            let tail = UnequalParams {
                batch: ctx.input.n,
                out_channels: ctx.output.c,
                first_channel,
                spatial: ctx.out_spatial(),
                output_offset: stage.output_offset,
                multiplier: stage.requant.multiplier,
                shift: stage.requant.shift,
                act_min: stage.act_min,
                act_max: stage.act_max,
            };
            let max_group = ctx.tuning.max_group_size;
            let global = [ctx.input.n, ctx.output.c - first_channel, ctx.out_spatial()];
            let l2 = find_max_factor(global[2], max_group);
            let l1 = find_max_factor(global[1], (max_group / l2).max(1));
            let work = WorkSize::d3(global, Some([1, l1, l2]));
            device.launch(unequal, &args_with(&[ops.bias.buffer(), ops.output.buffer()], &tail), &work)?;
        }
        Ok(())
    }
}
