//! Transposed convolution: GEMM into a column buffer, then a scatter back onto
//! the (possibly cropped) output grid.

use super::descriptor::ConvDescriptor;
use super::packing::args_with;
use super::{per_tensor_stage, Operands};
use crate::device::{BufferId, ComputeDevice, KernelHandle, KernelId, WorkSize};
use crate::error::{ConvError, Result};
use crate::kernels::conv2d::ScatterParams;
use crate::kernels::gemm::ConvBackGemmParams;
use crate::kernels::layout::TransposeParams;
use crate::kernels::{
    align_to, calculate_activation_range, find_max_factor, per_channel_requant, OutputStage, RequantParam,
};
use crate::tensor::{DataType, Dim4, Precision, QuantizedTensor};
use crate::tuning::{EngineConfig, TuningTable};
use tracing::debug;

/// Local size for a transpose grid: innermost dimension first, each bounded
/// by what is left of the group budget.
fn transpose_local(global: [usize; 3], max_group: usize) -> [usize; 3] {
    let l2 = find_max_factor(global[2], max_group);
    let l1 = find_max_factor(global[1], (max_group / l2).max(1));
    let l0 = find_max_factor(global[0], (max_group / (l1 * l2)).max(1));
    [l0, l1, l2]
}

/// Output-channel scales and the device tables derived from them on each call.
#[derive(Debug)]
struct ChannelTables {
    scales: Vec<f64>,
    multipliers: BufferId,
    shifts: BufferId,
}

#[derive(Debug)]
pub struct Deconvolution {
    descriptor: ConvDescriptor,
    input_dims: Dim4,
    output_dims: Dim4,
    precision: Precision,
    tuning: TuningTable,
    weights: QuantizedTensor,
    bias: QuantizedTensor,
    transpose: KernelHandle,
    gemm: KernelHandle,
    scatter: KernelHandle,
    filter: BufferId,
    input_trans: BufferId,
    col: BufferId,
    filter_params: TransposeParams,
    input_params: TransposeParams,
    input_filled_for: Option<i32>,
    channels: Option<ChannelTables>,
}

impl Deconvolution {
    /// Weights are laid out `[in_channels][out_channels / group][kh][kw]`.
    pub fn initialize<D: ComputeDevice + ?Sized>(
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
        weights: &QuantizedTensor,
        bias: &QuantizedTensor,
        descriptor: ConvDescriptor,
        config: &EngineConfig,
    ) -> Result<Self> {
        Self::build(device, input, output, weights, bias, None, descriptor, config)
    }

    /// Transposed convolution with one filter scale per output channel.
    ///
    /// The filter layout puts input channels on the outer axis, so the scales
    /// travel beside the weights instead of on them. The scale stored on
    /// `weights` is ignored and bias channel `i` is expected at
    /// `input_scale * channel_scales[i]`.
    #[allow(clippy::too_many_arguments)]
    pub fn initialize_per_channel<D: ComputeDevice + ?Sized>(
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
        weights: &QuantizedTensor,
        bias: &QuantizedTensor,
        channel_scales: &[f64],
        descriptor: ConvDescriptor,
        config: &EngineConfig,
    ) -> Result<Self> {
        if channel_scales.len() != output.dims().c {
            return Err(ConvError::invalid(format!(
                "{} channel scales for {} output channels",
                channel_scales.len(),
                output.dims().c
            )));
        }
        Self::build(device, input, output, weights, bias, Some(channel_scales.to_vec()), descriptor, config)
    }

    #[allow(clippy::too_many_arguments)]
    fn build<D: ComputeDevice + ?Sized>(
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
        weights: &QuantizedTensor,
        bias: &QuantizedTensor,
        channel_scales: Option<Vec<f64>>,
        descriptor: ConvDescriptor,
        config: &EngineConfig,
    ) -> Result<Self> {
        for (name, t) in [("input", input), ("output", output), ("weight", weights), ("bias", bias)] {
            if t.dims().is_empty() {
                return Err(ConvError::invalid(format!("{} tensor is empty", name)));
            }
        }
        descriptor.validate()?;
        if descriptor.is_dilated() {
            return Err(ConvError::invalid("dilated transposed convolution"));
        }
        if weights.is_per_channel() {
            return Err(ConvError::invalid(
                "transposed convolution takes per-channel scales through initialize_per_channel",
            ));
        }
        let precision = Precision::from_data_type(input.data_type())?;
        if output.data_type() != input.data_type() || bias.data_type() != DataType::Int32 {
            return Err(ConvError::invalid("mismatched element types"));
        }
        let (in_dims, out_dims) = (input.dims(), output.dims());
        let group = descriptor.group;
        if in_dims.c % group != 0 || out_dims.c % group != 0 {
            return Err(ConvError::invalid(format!(
                "group {} does not divide channels {} -> {}",
                group, in_dims.c, out_dims.c
            )));
        }
        let expected_w = Dim4::new(in_dims.c, out_dims.c / group, descriptor.kernel_h, descriptor.kernel_w);
        if weights.dims() != expected_w {
            return Err(ConvError::invalid(format!(
                "weight shape {} does not match expected {}",
                weights.dims(),
                expected_w
            )));
        }
        if bias.dims().count() != out_dims.c {
            return Err(ConvError::invalid(format!(
                "{} bias values for {} output channels",
                bias.dims().count(),
                out_dims.c
            )));
        }
        let (h, w) = descriptor.transposed_output_size(in_dims.h, in_dims.w)?;
        let expected = Dim4::new(in_dims.n, out_dims.c, h, w);
        if expected != out_dims {
            return Err(ConvError::ShapeMismatch {
                expected: expected.to_string(),
                actual: out_dims.to_string(),
            });
        }

        let in_per_group = in_dims.c / group;
        let stride = align_to(in_per_group, 8);
        let taps = descriptor.kernel_h * descriptor.kernel_w;
        let filter_params = TransposeParams {
            groups: group,
            height: out_dims.c / group * taps,
            width: in_per_group,
            dst_stride: stride,
            batch: 0,
        };
        let input_params = TransposeParams {
            groups: group,
            height: in_dims.spatial(),
            width: in_per_group,
            dst_stride: stride,
            batch: 0,
        };
        let profile = device.profile();
        let tuning = config.resolve_tuning(profile);
        debug!(
            input = %in_dims,
            output = %out_dims,
            kernel_h = descriptor.kernel_h,
            kernel_w = descriptor.kernel_w,
            group,
            ?precision,
            per_channel = channel_scales.is_some(),
            "initialize deconvolution"
        );
        let scatter_id = if channel_scales.is_some() {
            KernelId::ConvertBottomDiffPerChannel
        } else {
            KernelId::ConvertBottomDiff
        };

        let channels = match channel_scales {
            Some(scales) => Some(ChannelTables {
                scales,
                multipliers: device.allocate(DataType::Int32, out_dims.c)?,
                shifts: device.allocate(DataType::Int32, out_dims.c)?,
            }),
            None => None,
        };
        let deconv = Self {
            descriptor,
            input_dims: in_dims,
            output_dims: out_dims,
            precision,
            tuning,
            weights: weights.clone(),
            bias: bias.clone(),
            transpose: device.resolve_kernel(KernelId::MatrixTranspose, precision)?,
            gemm: device.resolve_kernel(KernelId::ConvBackGemm, precision)?,
            scatter: device.resolve_kernel(scatter_id, precision)?,
            filter: device.allocate(weights.data_type(), filter_params.dst_len())?,
            input_trans: device.allocate(precision.data_type(), in_dims.n * group * input_params.height * stride)?,
            col: device.allocate(DataType::Int32, in_dims.n * out_dims.c * taps * in_dims.spatial())?,
            filter_params,
            input_params,
            input_filled_for: None,
            channels,
        };
        if !descriptor.repack_each_call() {
            deconv.transpose_filter(device)?;
        }
        Ok(deconv)
    }

    fn transpose_work(&self, p: &TransposeParams) -> WorkSize {
        let global = [p.groups, p.height, p.width];
        WorkSize::d3(global, Some(transpose_local(global, self.tuning.max_group_size)))
    }

    fn transpose_filter<D: ComputeDevice + ?Sized>(&self, device: &mut D) -> Result<()> {
        device.fill_buffer(self.filter, self.weights.zero_point())?;
        let work = self.transpose_work(&self.filter_params);
        let args = args_with(&[self.weights.buffer(), self.filter], &self.filter_params);
        device.launch(&self.transpose, &args, &work)?;
        Ok(())
    }

    pub fn descriptor(&self) -> &ConvDescriptor {
        &self.descriptor
    }

    pub fn execute<D: ComputeDevice + ?Sized>(
        &mut self,
        device: &mut D,
        input: &QuantizedTensor,
        output: &QuantizedTensor,
    ) -> Result<()> {
        if input.dims() != self.input_dims || output.dims() != self.output_dims {
            return Err(ConvError::ShapeMismatch {
                expected: format!("{} -> {}", self.input_dims, self.output_dims),
                actual: format!("{} -> {}", input.dims(), output.dims()),
            });
        }
        if input.data_type() != self.precision.data_type() || output.data_type() != input.data_type() {
            return Err(ConvError::invalid("element type changed since initialize"));
        }
        debug!(input = %input.dims(), "execute deconvolution");
        if self.descriptor.repack_each_call() {
            self.transpose_filter(device)?;
        }

        // the transposes never write the alignment columns
        if self.input_filled_for != Some(input.zero_point()) {
            device.fill_buffer(self.input_trans, input.zero_point())?;
            self.input_filled_for = Some(input.zero_point());
        }
        let desc = &self.descriptor;
        let group = desc.group;
        let (n, cout) = (self.input_dims.n, self.output_dims.c);
        let l = self.tuning.deconv_local;
        let mut gemm = ConvBackGemmParams {
            groups: group,
            row_filter: self.filter_params.height,
            cols: self.filter_params.dst_stride,
            row_input: self.input_params.height,
            batch: 0,
            input_offset: -input.zero_point(),
            weight_offset: -self.weights.zero_point(),
        };
        let gemm_work = WorkSize::d3(
            [group, align_to(gemm.row_filter, l[1]), align_to(gemm.row_input, l[2])],
            Some(l),
        );
        for i in 0..n {
            let trans = TransposeParams {
                batch: i,
                ..self.input_params
            };
            let work = self.transpose_work(&trans);
            device.launch(&self.transpose, &args_with(&[input.buffer(), self.input_trans], &trans), &work)?;
            gemm.batch = i;
            device.launch(&self.gemm, &args_with(&[self.filter, self.input_trans, self.col], &gemm), &gemm_work)?;
        }

        let stage = match &self.channels {
            Some(tables) => {
                let requant = per_channel_requant(input.scale(), &tables.scales, output.scale())?;
                let (multipliers, shifts): (Vec<i32>, Vec<i32>) =
                    requant.iter().map(|r| (r.multiplier, r.shift)).unzip();
                device.write_buffer(tables.multipliers, &multipliers)?;
                device.write_buffer(tables.shifts, &shifts)?;
                let (act_min, act_max) =
                    calculate_activation_range(desc.activation, output.scale(), output.zero_point(), self.precision);
                OutputStage {
                    output_offset: output.zero_point(),
                    requant: RequantParam::default(),
                    act_min,
                    act_max,
                }
            }
            None => {
                let ops = Operands {
                    input,
                    weights: &self.weights,
                    bias: &self.bias,
                    output,
                };
                per_tensor_stage(&ops, desc.activation, self.precision, 0)?
            }
        };
        let scatter = ScatterParams {
            batch: n,
            out_channels: cout,
            out_h: self.output_dims.h,
            out_w: self.output_dims.w,
            kernel_h: desc.kernel_h,
            kernel_w: desc.kernel_w,
            pad_top: desc.padding.top,
            pad_left: desc.padding.left,
            stride_h: desc.stride_h,
            stride_w: desc.stride_w,
            in_h: self.input_dims.h,
            in_w: self.input_dims.w,
            output_offset: stage.output_offset,
            multiplier: stage.requant.multiplier,
            shift: stage.requant.shift,
            act_min: stage.act_min,
            act_max: stage.act_max,
        };
        let work = WorkSize::d3(
            [
                n * cout,
                align_to(self.output_dims.h, l[1]),
                align_to(self.output_dims.w, l[2]),
            ],
            Some(l),
        );
        let args = match &self.channels {
            Some(tables) => args_with(
                &[self.col, self.bias.buffer(), tables.multipliers, tables.shifts, output.buffer()],
                &scatter,
            ),
            None => args_with(&[self.col, self.bias.buffer(), output.buffer()], &scatter),
        };
        device.launch(&self.scatter, &args, &work)?;
        Ok(())
    }

    /// Free the transposed filter, the staging buffers and any per-channel
    /// tables. Caller tensors are left alone.
    pub fn release<D: ComputeDevice + ?Sized>(self, device: &mut D) -> Result<()> {
        debug!("release deconvolution");
        device.release(self.filter)?;
        device.release(self.input_trans)?;
        device.release(self.col)?;
        if let Some(tables) = self.channels {
            device.release(tables.multipliers)?;
            device.release(tables.shifts)?;
        }
        Ok(())
    }

    /// Replace weights and bias of an operator whose descriptor marks them as
    /// graph inputs. Shapes must stay the same.
    pub fn set_inputs(&mut self, weights: &QuantizedTensor, bias: &QuantizedTensor) -> Result<()> {
        if !self.descriptor.repack_each_call() {
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
