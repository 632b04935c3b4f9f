use super::packing::{args_with, BiasFold, WeightDilation};
use super::selector::convert_kernel;
use super::{per_tensor_stage, ConvContext, Operands};
use crate::device::{BufferId, ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::Result;
use crate::kernels::gemm::Gemm1xNParams;
use crate::kernels::layout::ConvertParams;
use crate::kernels::weights::Align1xNParams;
use crate::kernels::{align_to, ceil_div};
use tracing::debug;

/// Pointwise-optimized GEMM: convert with implicit padding, weights centred
/// by their zero point, input zero point folded into the bias.
#[derive(Debug)]
pub(crate) struct Gemm1xNConv {
    dilation: Option<WeightDilation>,
    fold: BiasFold,
    convert: KernelHandle,
    align: KernelHandle,
    gemm: KernelHandle,
    packed: BufferId,
    converted: BufferId,
    align_params: Align1xNParams,
    rows: usize,
}

impl Gemm1xNConv {
    pub fn initialize<D: ComputeDevice + ?Sized>(device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<Self> {
        let t = &ctx.tuning;
        let precision = ctx.precision;
        let group = ctx.descriptor.group;
        let patch = ctx.patch();
        let rows = align_to(ctx.out_spatial(), t.gemm1xn_coalescing);
        let align_params = Align1xNParams {
            out_channels: ctx.output.c,
            groups: group,
            patch,
            group_rows: align_to(ctx.out_per_group(), t.gemm1xn_channel_block),
            cols: align_to(patch, t.gemm1xn_k_block),
            zero_point: ops.weights.zero_point(),
        };
        let convert_id = convert_kernel(
            &ctx.descriptor,
            ctx.descriptor.effective_kernel(),
            ctx.output.w,
            precision,
            ctx.profile,
        );
        let gemm_id = if ctx.profile.valhall {
            KernelId::Gemm1xNBlock8
        } else {
            KernelId::Gemm1xN
        };
        debug!(convert = %convert_id, gemm = %gemm_id, rows, cols = align_params.cols, "gemm1xN kernels");

        let mut conv = Self {
            dilation: WeightDilation::new(device, precision, ops.weights, &ctx.descriptor)?,
            fold: BiasFold::new(device, KernelId::WeightOffset, precision, ctx.output.c, patch)?,
            convert: device.resolve_kernel(convert_id, precision)?,
            align: device.resolve_kernel(KernelId::AlignWeight1xN, precision)?,
            gemm: device.resolve_kernel(gemm_id, precision)?,
            packed: device.allocate(ops.weights.data_type(), align_params.dst_len())?,
            converted: device.allocate(precision.data_type(), ctx.input.n * group * rows * align_params.cols)?,
            align_params,
            rows,
        };
        if !ctx.descriptor.repack_each_call() {
            conv.pack(device, ctx, ops)?;
        }
        Ok(conv)
    }

    fn pack<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let source = match &self.dilation {
            Some(d) => {
                d.run(device, ops.weights)?;
                d.buffer
            }
            None => ops.weights.buffer(),
        };
        let params = Align1xNParams {
            zero_point: ops.weights.zero_point(),
            ..self.align_params
        };
        let work = WorkSize::d2(
            [params.groups * params.group_rows, params.cols / ctx.tuning.gemm1xn_k_block],
            None,
        );
        device.launch(&self.align, &args_with(&[source, self.packed], &params), &work)?;
        self.fold.run(
            device,
            source,
            ops.bias.buffer(),
            ops.input.zero_point(),
            ops.weights.zero_point(),
        )
    }

    fn convert_work(&self, ctx: &ConvContext) -> WorkSize {
        let t = &ctx.tuning;
        let n = ctx.input.n;
        let c = ctx.input.c;
        let spatial = ctx.out_spatial();
        match self.convert.kernel {
            KernelId::Convert1x1 => WorkSize::d3([n, c, align_to(ceil_div(spatial, 8), 64)], Some([1, 1, 64])),
            KernelId::Convert9x9Pad4Valhall | KernelId::Convert5x5Pad2Valhall | KernelId::Convert3x3Pad1Valhall => {
                let taps = ctx.descriptor.kernel_h * ctx.descriptor.kernel_w;
                WorkSize::d3(
                    [align_to(spatial / 8, 16), align_to(c * taps, 16), n],
                    Some([16, 16, 1]),
                )
            }
            _ => {
                let local = if ctx.profile.valhall {
                    t.convert_local
                } else if spatial < t.convert_small_threshold {
                    t.convert_local_small
                } else {
                    t.convert_local
                };
                WorkSize::d3([align_to(spatial, local), c, n], Some([local, 1, 1]))
            }
        }
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        if let Some(dilation) = self.dilation {
            dilation.release(device)?;
        }
        self.fold.release(device)?;
        device.release(self.packed)?;
        device.release(self.converted)?;
        Ok(())
    }

    pub fn execute<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, ctx: &ConvContext, ops: &Operands<'_>) -> Result<()> {
        let desc = &ctx.descriptor;
        let group = desc.group;
        if desc.repack_each_call() {
            self.pack(device, ctx, ops)?;
        } else if !self.fold.is_current(ops.input.zero_point()) {
            let source = self.dilation.as_ref().map_or(ops.weights.buffer(), |d| d.buffer);
            self.fold.run(
                device,
                source,
                ops.bias.buffer(),
                ops.input.zero_point(),
                ops.weights.zero_point(),
            )?;
        }

        let (kh, kw) = desc.effective_kernel();
        let mut convert = ConvertParams {
            batch: ctx.input.n,
            channels: ctx.input.c,
            in_h: ctx.input.h,
            in_w: ctx.input.w,
            kernel_h: kh,
            kernel_w: kw,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            pad_top: desc.padding.top as usize,
            pad_left: desc.padding.left as usize,
            out_h: ctx.output.h,
            out_w: ctx.output.w,
            groups: group,
            group: 0,
            rows: self.rows,
            cols: self.align_params.cols,
            zero_point: ops.input.zero_point(),
        };
        let work = self.convert_work(ctx);
        for g in 0..group {
            convert.group = g;
            device.launch(&self.convert, &args_with(&[ops.input.buffer(), self.converted], &convert), &work)?;
        }

        let stage = per_tensor_stage(ops, desc.activation, ctx.precision, 0)?;
        let mut params = Gemm1xNParams {
            batch: ctx.input.n,
            out_channels: ctx.output.c,
            groups: group,
            group: 0,
            spatial: ctx.out_spatial(),
            rows: self.rows,
            cols: self.align_params.cols,
            group_rows: self.align_params.group_rows,
            weight_zero_point: ops.weights.zero_point(),
            output_offset: stage.output_offset,
            multiplier: stage.requant.multiplier,
            shift: stage.requant.shift,
            act_min: stage.act_min,
            act_max: stage.act_max,
        };
        let l = ctx.tuning.gemm1xn_local;
        let work = WorkSize::d3(
            [
                ctx.input.n,
                align_to(ceil_div(ctx.out_per_group(), 4), l[1]),
                align_to(ceil_div(ctx.out_spatial(), 4), l[2]),
            ],
            Some(l),
        );
        let buffers = [self.packed, self.converted, self.fold.buffer, ops.output.buffer()];
        for g in 0..group {
            params.group = g;
            device.launch(&self.gemm, &args_with(&buffers, &params), &work)?;
        }
        Ok(())
    }
}
