use super::packing::{args_with, BiasFold};
use super::{per_tensor_stage, ConvContext, Operands};
use crate::device::{BufferId, ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::{ConvError, Result};
use crate::kernels::conv2d::DirectParams;
use crate::kernels::layout::PadC4Params;
use crate::kernels::weights::AlignDirectParams;
use crate::kernels::{align_to, ceil_div};

/// Square-kernel, stride-1 convolution over an NC4HW4 padded copy of the input.
#[derive(Debug)]
pub(crate) struct DirectConv {
    pad: KernelHandle,
    align: KernelHandle,
    direct: KernelHandle,
    fold: BiasFold,
    padded: BufferId,
    packed: BufferId,
    pad_params: PadC4Params,
    align_params: AlignDirectParams,
}

impl DirectConv {
    pub fn initialize<D: ComputeDevice + ?Sized>(device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<Self> {
        let desc = &ctx.descriptor;
        let kernel = KernelId::direct(desc.kernel_h)
            .filter(|_| desc.kernel_h == desc.kernel_w && desc.stride_h == 1 && desc.stride_w == 1 && !desc.is_dilated())
            .ok_or(ConvError::UnsupportedKernel {
                variant: "direct",
                height: desc.kernel_h,
                width: desc.kernel_w,
            })?;
        let precision = ctx.precision;
        let pad = desc.padding;
        let pad_params = PadC4Params {
            batch: ctx.input.n,
            channels: ctx.input.c,
            in_h: ctx.input.h,
            in_w: ctx.input.w,
            pad_top: pad.top as usize,
            pad_left: pad.left as usize,
            out_h: ctx.input.h + (pad.top + pad.bottom) as usize,
            out_w: ctx.input.w + (pad.left + pad.right) as usize,
            zero_point: 0,
        };
        let align_params = AlignDirectParams {
            out_channels: ctx.output.c,
            in_channels: ctx.input.c,
            kernel_h: desc.kernel_h,
            kernel_w: desc.kernel_w,
            zero_point: ops.weights.zero_point(),
        };
        let mut conv = Self {
            pad: device.resolve_kernel(KernelId::PadCopyAlignC4, precision)?,
            align: device.resolve_kernel(KernelId::AlignWeightDirect, precision)?,
            direct: device.resolve_kernel(kernel, precision)?,
            fold: BiasFold::new(device, KernelId::UpdateDirectBias, precision, ctx.output.c, ctx.patch())?,
            padded: device.allocate(precision.data_type(), pad_params.dst_len())?,
            packed: device.allocate(ops.weights.data_type(), align_params.dst_len())?,
            pad_params,
            align_params,
        };
        if !desc.repack_each_call() {
            conv.pack(device, ops)?;
        }
        Ok(conv)
    }

    fn pack<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ops: &Operands<'_>) -> Result<()> {
        let params = AlignDirectParams {
            zero_point: ops.weights.zero_point(),
            ..self.align_params
        };
        let (out_blocks, in_blocks) = params.blocks();
        let work = WorkSize::d3([out_blocks, in_blocks, params.kernel_h * params.kernel_w], None);
        device.launch(&self.align, &args_with(&[ops.weights.buffer(), self.packed], &params), &work)?;
        self.fold.run(
            device,
            ops.weights.buffer(),
            ops.bias.buffer(),
            ops.input.zero_point(),
            ops.weights.zero_point(),
        )
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        self.fold.release(device)?;
        device.release(self.padded)?;
        device.release(self.packed)?;
        Ok(())
    }

    pub fn execute<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let t = &ctx.tuning;
        if ctx.descriptor.repack_each_call() {
            self.pack(device, ops)?;
        } else if !self.fold.is_current(ops.input.zero_point()) {
            self.fold.run(
                device,
                ops.weights.buffer(),
                ops.bias.buffer(),
                ops.input.zero_point(),
                ops.weights.zero_point(),
            )?;
        }

        let pad = PadC4Params {
            zero_point: ops.input.zero_point(),
            ..self.pad_params
        };
        let l = t.pad_local;
        let work = WorkSize::d3(
            [
                pad.batch * ceil_div(pad.channels, t.direct_channel_block),
                align_to(pad.out_h, l[1]),
                align_to(ceil_div(pad.out_w, 16), l[2]),
            ],
            Some(l),
        );
        device.launch(&self.pad, &args_with(&[ops.input.buffer(), self.padded], &pad), &work)?;

        let stage = per_tensor_stage(ops, ctx.descriptor.activation, ctx.precision, 0)?;
        let params = DirectParams {
            batch: ctx.input.n,
            in_channels: ctx.input.c,
            in_h: pad.out_h,
            in_w: pad.out_w,
            out_channels: ctx.output.c,
            out_h: ctx.output.h,
            out_w: ctx.output.w,
            kernel: ctx.descriptor.kernel_h,
            weight_zero_point: ops.weights.zero_point(),
            output_offset: stage.output_offset,
            multiplier: stage.requant.multiplier,
            shift: stage.requant.shift,
            act_min: stage.act_min,
            act_max: stage.act_max,
        };
        let l = t.direct_local;
        let work = WorkSize::d3(
            [
                align_to(ceil_div(ctx.output.w, 4), l[0]),
                ctx.output.h,
                ceil_div(ctx.output.c, t.direct_out_block) * ctx.input.n,
            ],
            Some(l),
        );
        let buffers = [self.padded, self.packed, self.fold.buffer, ops.output.buffer()];
        device.launch(&self.direct, &args_with(&buffers, &params), &work)?;
        Ok(())
    }
}
