//! Weight dilation, bias folding and zero-point padding steps shared by the
//! convolution variants.

use super::descriptor::ConvDescriptor;
use crate::device::{BufferId, ComputeDevice, KernelArg, KernelHandle, KernelId, WorkSize};
use crate::error::Result;
use crate::kernels::layout::PadParams;
use crate::kernels::weights::{BiasFoldParams, DilationInitParams, DilationParams};
use crate::kernels::{align_to, KernelParams};
use crate::tensor::{DataType, Dim4, Precision, QuantizedTensor};
use crate::tuning::TuningTable;

/// Buffers first, then the encoded scalar block.
pub(crate) fn args_with(buffers: &[BufferId], params: &impl KernelParams) -> Vec<KernelArg> {
    let mut args: Vec<_> = buffers.iter().map(|&b| b.into()).collect();
    args.extend(params.encode().into_iter().map(KernelArg::Int));
    args
}

/// Materialized dilated filter with zero-point gaps.
#[derive(Debug)]
pub(crate) struct WeightDilation {
    init: KernelHandle,
    dilate: KernelHandle,
    pub buffer: BufferId,
    params: DilationParams,
}

impl WeightDilation {
    /// `None` when the descriptor is undilated or the kernel is 1x1.
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        precision: Precision,
        weights: &QuantizedTensor,
        desc: &ConvDescriptor,
    ) -> Result<Option<Self>> {
        if !desc.is_dilated() || (desc.kernel_h == 1 && desc.kernel_w == 1) {
            return Ok(None);
        }
        let dims = weights.dims();
        let params = DilationParams {
            planes: dims.n * dims.c,
            kernel_h: dims.h,
            kernel_w: dims.w,
            dilation_h: desc.dilation_h,
            dilation_w: desc.dilation_w,
        };
        let buffer = device.allocate(weights.data_type(), params.dst_len())?;
        Ok(Some(Self {
            init: device.resolve_kernel(KernelId::DilationInit, precision)?,
            dilate: device.resolve_kernel(KernelId::Dilation, precision)?,
            buffer,
            params,
        }))
    }

    pub fn run<D: ComputeDevice + ?Sized>(&self, device: &mut D, weights: &QuantizedTensor) -> Result<()> {
        let len = self.params.dst_len();
        let init = DilationInitParams {
            len,
            zero_point: weights.zero_point(),
        };
        device.launch(&self.init, &args_with(&[self.buffer], &init), &WorkSize::d1(len, None))?;
        let work = WorkSize::d3([self.params.planes, self.params.kernel_h, self.params.kernel_w], None);
        device.launch(&self.dilate, &args_with(&[weights.buffer(), self.buffer], &self.params), &work)?;
        Ok(())
    }

    /// Logical shape of the expanded filter.
    pub fn dims(&self, weights: Dim4) -> Dim4 {
        let (h, w) = self.params.dilated();
        Dim4::new(weights.n, weights.c, h, w)
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.release(self.buffer)?;
        Ok(())
    }
}

/// Device buffer holding `bias - input_zp * Σ(w - weight_zp)` per output channel.
#[derive(Debug)]
pub(crate) struct BiasFold {
    handle: KernelHandle,
    pub buffer: BufferId,
    out_channels: usize,
    patch: usize,
    folded_for: Option<i32>,
}

impl BiasFold {
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        kernel: KernelId,
        precision: Precision,
        out_channels: usize,
        patch: usize,
    ) -> Result<Self> {
        Ok(Self {
            handle: device.resolve_kernel(kernel, precision)?,
            buffer: device.allocate(DataType::Int32, out_channels)?,
            out_channels,
            patch,
            folded_for: None,
        })
    }

    /// Whether the folded values were produced for this input zero point.
    pub fn is_current(&self, input_zero_point: i32) -> bool {
        self.folded_for == Some(input_zero_point)
    }

    pub fn run<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        weights: BufferId,
        bias: BufferId,
        input_zero_point: i32,
        weight_zero_point: i32,
    ) -> Result<()> {
        let params = BiasFoldParams {
            out_channels: self.out_channels,
            patch: self.patch,
            input_zero_point,
            weight_zero_point,
        };
        let args = args_with(&[weights, bias, self.buffer], &params);
        device.launch(&self.handle, &args, &WorkSize::d1(self.out_channels, None))?;
        self.folded_for = Some(input_zero_point);
        Ok(())
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.release(self.buffer)?;
        Ok(())
    }
}

/// Explicit zero-point padding into a scratch buffer.
#[derive(Debug)]
pub(crate) struct PadStep {
    handle: KernelHandle,
    pub buffer: BufferId,
    params: PadParams,
    work: WorkSize,
}

impl PadStep {
    /// `None` when no side is padded.
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        kernel: KernelId,
        precision: Precision,
        input: Dim4,
        desc: &ConvDescriptor,
        tuning: &TuningTable,
    ) -> Result<Option<Self>> {
        let pad = desc.padding;
        if pad.is_zero() {
            return Ok(None);
        }
        let params = PadParams {
            batch: input.n,
            channels: input.c,
            in_h: input.h,
            in_w: input.w,
            pad_top: pad.top as usize,
            pad_left: pad.left as usize,
            out_h: input.h + (pad.top + pad.bottom) as usize,
            out_w: input.w + (pad.left + pad.right) as usize,
            zero_point: 0,
        };
        let work = match kernel {
            KernelId::DepthwisePad => {
                let l = tuning.depthwise_local;
                WorkSize::d3(
                    [input.n, input.c, align_to(params.out_h * params.out_w, l)],
                    Some([1, 1, l]),
                )
            }
            _ => {
                let l = tuning.pad_local;
                WorkSize::d3(
                    [
                        input.n * input.c,
                        align_to(params.out_h, l[1]),
                        align_to(params.out_w.div_ceil(16), l[2]),
                    ],
                    Some(l),
                )
            }
        };
        Ok(Some(Self {
            handle: device.resolve_kernel(kernel, precision)?,
            buffer: device.allocate(precision.data_type(), params.dst_len())?,
            params,
            work,
        }))
    }

    pub fn padded_dims(&self) -> Dim4 {
        Dim4::new(self.params.batch, self.params.channels, self.params.out_h, self.params.out_w)
    }

    pub fn run<D: ComputeDevice + ?Sized>(&self, device: &mut D, input: &QuantizedTensor) -> Result<()> {
        let params = PadParams {
            zero_point: input.zero_point(),
            ..self.params
        };
        device.launch(&self.handle, &args_with(&[input.buffer(), self.buffer], &params), &self.work)?;
        Ok(())
    }

    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        device.release(self.buffer)?;
        Ok(())
    }
}
