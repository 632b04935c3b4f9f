use super::packing::{args_with, PadStep, WeightDilation};
use super::{per_tensor_stage, ConvContext, Operands};
use crate::device::{BufferId, ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::Result;
use crate::kernels::gemm::GemmBlockedParams;
use crate::kernels::layout::Im2colParams;
use crate::kernels::weights::AlignGemmParams;
use crate::kernels::{align_to, ceil_div};
use tracing::debug;

/// Pad, im2col and blocked GEMM, one GEMM launch per group.
#[derive(Debug)]
pub(crate) struct GemmConv {
    pad: Option<PadStep>,
    dilation: Option<WeightDilation>,
    im2col: KernelHandle,
    align: KernelHandle,
    gemm: KernelHandle,
    packed: BufferId,
    converted: BufferId,
    align_params: AlignGemmParams,
    rows: usize,
    cols: usize,
}

impl GemmConv {
    pub fn initialize<D: ComputeDevice + ?Sized>(device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<Self> {
        let t = &ctx.tuning;
        let group = ctx.descriptor.group;
        let precision = ctx.precision;
        let patch = ctx.patch();
        let cols = align_to(patch, t.gemm_tile);
        let rows = align_to(ctx.out_spatial(), t.gemm_coalescing);
        let align_params = AlignGemmParams {
            out_channels: ctx.output.c,
            groups: group,
            patch,
            rows: cols,
            group_cols: align_to(ctx.out_per_group(), t.gemm_tile),
            zero_point: ops.weights.zero_point(),
        };

        let pad = PadStep::new(device, KernelId::PadOpt, precision, ctx.input, &ctx.descriptor, t)?;
        let dilation = WeightDilation::new(device, precision, ops.weights, &ctx.descriptor)?;
        let im2col_kernel = if group == 1 {
            KernelId::Im2col
        } else {
            KernelId::Im2colGrouped
        };
        let conv = Self {
            pad,
            dilation,
            im2col: device.resolve_kernel(im2col_kernel, precision)?,
            align: device.resolve_kernel(KernelId::AlignWeightGemm, precision)?,
            gemm: device.resolve_kernel(KernelId::GemmBlocked, precision)?,
            packed: device.allocate(ops.weights.data_type(), align_params.dst_len())?,
            converted: device.allocate(precision.data_type(), ctx.input.n * group * rows * cols)?,
            align_params,
            rows,
            cols,
        };
        debug!(rows, cols, group_cols = align_params.group_cols, "gemm buffers");
        if !ctx.descriptor.repack_each_call() {
            conv.pack_weights(device, ctx, ops)?;
        }
        Ok(conv)
    }

    fn pack_weights<D: ComputeDevice + ?Sized>(&self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let source = match &self.dilation {
            Some(d) => {
                d.run(device, ops.weights)?;
                d.buffer
            }
            None => ops.weights.buffer(),
        };
        let params = AlignGemmParams {
            zero_point: ops.weights.zero_point(),
            ..self.align_params
        };
        let l = ctx.tuning.align_weight_local;
        let work = WorkSize::d2(
            [ctx.output.c, align_to(ceil_div(params.patch, 8), l[1])],
            Some(l),
        );
        device.launch(&self.align, &args_with(&[source, self.packed], &params), &work)?;
        Ok(())
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        if let Some(pad) = self.pad {
            pad.release(device)?;
        }
        if let Some(dilation) = self.dilation {
            dilation.release(device)?;
        }
        device.release(self.packed)?;
        device.release(self.converted)?;
        Ok(())
    }

    pub fn execute<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let t = &ctx.tuning;
        let desc = &ctx.descriptor;
        let group = desc.group;
        if desc.repack_each_call() {
            self.pack_weights(device, ctx, ops)?;
        }

        let (src, src_dims) = match &self.pad {
            Some(pad) => {
                pad.run(device, ops.input)?;
                (pad.buffer, pad.padded_dims())
            }
            None => (ops.input.buffer(), ctx.input),
        };

        let (kh, kw) = desc.effective_kernel();
        let mut im2col = Im2colParams {
            batch: ctx.input.n,
            channels: ctx.input.c,
            in_h: src_dims.h,
            in_w: src_dims.w,
            kernel_h: kh,
            kernel_w: kw,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            out_h: ctx.output.h,
            out_w: ctx.output.w,
            groups: group,
            group: 0,
            rows: self.rows,
            cols: self.cols,
            zero_point: ops.input.zero_point(),
        };
        if group == 1 {
            let l = t.im2col_local;
            let work = WorkSize::d3(
                [ctx.input.n, ctx.out_spatial(), align_to(ctx.input.c * kh, l[2])],
                Some(l),
            );
            device.launch(&self.im2col, &args_with(&[src, self.converted], &im2col), &work)?;
        } else {
            let l = t.im2col_grouped_local;
            let work = WorkSize::d3(
                [
                    ctx.input.n,
                    align_to(ctx.out_spatial(), l[1]),
                    align_to(ctx.patch(), l[2]),
                ],
                Some(l),
            );
            for g in 0..group {
                im2col.group = g;
                device.launch(&self.im2col, &args_with(&[src, self.converted], &im2col), &work)?;
            }
        }

        let stage = per_tensor_stage(ops, desc.activation, ctx.precision, 0)?;
        let mut params = GemmBlockedParams {
            batch: ctx.input.n,
            out_channels: ctx.output.c,
            groups: group,
            group: 0,
            spatial: ctx.out_spatial(),
            rows: self.rows,
            cols: self.cols,
            group_cols: self.align_params.group_cols,
            input_offset: -ops.input.zero_point(),
            weight_offset: -ops.weights.zero_point(),
            output_offset: stage.output_offset,
            multiplier: stage.requant.multiplier,
            shift: stage.requant.shift,
            act_min: stage.act_min,
            act_max: stage.act_max,
        };
        let l = t.gemm_local;
        let work = WorkSize::d3(
            [ctx.input.n, self.align_params.group_cols / 4, self.rows],
            Some(l),
        );
        let buffers = [self.packed, self.converted, ops.bias.buffer(), ops.output.buffer()];
        for g in 0..group {
            params.group = g;
            device.launch(&self.gemm, &args_with(&buffers, &params), &work)?;
        }
        Ok(())
    }
}
