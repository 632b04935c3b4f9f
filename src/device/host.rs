use super::{BufferId, ComputeDevice, DeviceError, DeviceResult, KernelArg, KernelHandle, KernelId, WorkSize};
use crate::kernels::conv2d::{self, DepthwiseParams, DirectParams, PerChannelParams, ScatterParams, UnequalParams};
use crate::kernels::gemm::{self, ConvBackGemmParams, Gemm1xNParams, GemmBlockedParams};
use crate::kernels::layout::{self, ConvertParams, Im2colParams, PadC4Params, PadParams, TransposeParams};
use crate::kernels::weights::{
    self, Align1xNParams, AlignDirectParams, AlignGemmParams, BiasFoldParams, DilationInitParams, DilationParams,
};
use crate::kernels::KernelParams;
use crate::tensor::{DataType, Precision};
use crate::tuning::ArchitectureProfile;
use tracing::trace;

#[derive(Debug, Clone)]
struct HostBuffer {
    data_type: DataType,
    data: Vec<i32>,
}

#[derive(Debug, Clone)]
struct ResolvedKernel {
    kernel: KernelId,
    precision: Precision,
    args: Option<Vec<KernelArg>>,
}

/// One completed launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub kernel: KernelId,
    pub precision: Precision,
    pub work: WorkSize,
}

impl LaunchRecord {
    pub fn name(&self) -> String {
        self.kernel.qualified_name(self.precision)
    }
}

/// In-order device that runs every catalog kernel on host memory.
///
/// Launch grids are validated the way a device runtime would reject them but
/// do not influence the computation: each kernel body produces its whole
/// output in one call.
#[derive(Debug, Clone)]
pub struct HostDevice {
    profile: ArchitectureProfile,
    max_work_group_size: usize,
    buffers: Vec<Option<HostBuffer>>,
    kernels: Vec<ResolvedKernel>,
    launches: Vec<LaunchRecord>,
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new(ArchitectureProfile::generic())
    }
}

impl HostDevice {
    pub fn new(profile: ArchitectureProfile) -> Self {
        Self {
            profile,
            max_work_group_size: 1024,
            buffers: Vec::new(),
            kernels: Vec::new(),
            launches: Vec::new(),
        }
    }

    pub fn with_max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn launches(&self) -> &[LaunchRecord] {
        &self.launches
    }

    pub fn clear_launches(&mut self) {
        self.launches.clear();
    }

    /// Buffers allocated and not yet released.
    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().filter(|b| b.is_some()).count()
    }

    pub fn launched(&self, kernel: KernelId) -> usize {
        self.launches.iter().filter(|l| l.kernel == kernel).count()
    }

    fn buffer(&self, id: BufferId) -> DeviceResult<&HostBuffer> {
        self.buffers
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(DeviceError::UnknownBuffer(id))
    }

    fn data(&self, id: BufferId, len: usize) -> DeviceResult<&[i32]> {
        let buf = self.buffer(id)?;
        if buf.data.len() < len {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len,
                capacity: buf.data.len(),
            });
        }
        Ok(&buf.data)
    }

    /// Run `f` with the output buffer detached so inputs can be borrowed
    /// alongside it. An input aliasing the output shows up as an unknown buffer.
    fn with_output<F>(&mut self, id: BufferId, len: usize, f: F) -> DeviceResult<()>
    where
        F: FnOnce(&Self, &mut [i32]) -> DeviceResult<()>,
    {
        let mut out = self
            .buffers
            .get_mut(id.0)
            .and_then(Option::take)
            .ok_or(DeviceError::UnknownBuffer(id))?;
        let result = if out.data.len() < len {
            Err(DeviceError::OutOfBounds {
                offset: 0,
                len,
                capacity: out.data.len(),
            })
        } else {
            f(self, &mut out.data)
        };
        self.buffers[id.0] = Some(out);
        result
    }

    fn check_work(&self, kernel: KernelId, work: &WorkSize) -> DeviceResult<()> {
        let fail = |reason: String| DeviceError::WorkSize {
            kernel: kernel.name(),
            reason,
        };
        if work.dims == 0 || work.dims > 3 {
            return Err(fail(format!("{} dimensions", work.dims)));
        }
        if work.global[..work.dims].iter().any(|&g| g == 0) {
            return Err(fail(format!("empty global size {:?}", work.global)));
        }
        if let Some(local) = work.local {
            let items: usize = local[..work.dims].iter().product();
            if items == 0 || items > self.max_work_group_size {
                return Err(fail(format!("local size {:?} exceeds {}", local, self.max_work_group_size)));
            }
            for d in 0..work.dims {
                if work.global[d] % local[d] != 0 {
                    return Err(fail(format!(
                        "global {:?} not divisible by local {:?}",
                        work.global, local
                    )));
                }
            }
        }
        Ok(())
    }

    fn run(&mut self, kernel: KernelId, precision: Precision, args: &[KernelArg]) -> DeviceResult<()> {
        let name = kernel.name();
        let split = args
            .iter()
            .position(|a| matches!(a, KernelArg::Int(_)))
            .unwrap_or(args.len());
        let mut buffers = Vec::with_capacity(split);
        for arg in &args[..split] {
            if let KernelArg::Buffer(b) = arg {
                buffers.push(*b);
            }
        }
        let mut scalars = Vec::with_capacity(args.len() - split);
        for (i, arg) in args[split..].iter().enumerate() {
            match arg {
                KernelArg::Int(v) => scalars.push(*v),
                KernelArg::Buffer(_) => {
                    return Err(DeviceError::ArgumentType {
                        kernel: name,
                        index: split + i,
                    })
                }
            }
        }
        let buf = |i: usize| {
            buffers
                .get(i)
                .copied()
                .ok_or(DeviceError::MissingArgument { kernel: name, index: i })
        };
        let signed = precision.is_signed();

        macro_rules! params {
            ($ty:ty, $count:expr) => {{
                if buffers.len() != $count {
                    return Err(DeviceError::MissingArgument {
                        kernel: name,
                        index: buffers.len().min($count),
                    });
                }
                <$ty>::decode(&scalars).ok_or(DeviceError::ArgumentType {
                    kernel: name,
                    index: $count,
                })?
            }};
        }

        match kernel {
            KernelId::PadOpt | KernelId::DepthwisePad => {
                let p = params!(PadParams, 2);
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::pad(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::PadCopyAlignC4 => {
                let p = params!(PadC4Params, 2);
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::pad_align_c4(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::Im2col | KernelId::Im2colGrouped => {
                let p = params!(Im2colParams, 2);
                if !p.is_valid() {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 2 });
                }
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::im2col(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::Convert1x1 => {
                let p = params!(ConvertParams, 2);
                if !p.is_valid() || p.kernel_h != 1 || p.kernel_w != 1 {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 2 });
                }
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::convert_1x1(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::ConvertWithPad
            | KernelId::ConvertWithPadValhall
            | KernelId::Convert3x3SmallPad
            | KernelId::Convert3x3SmallPadValhall
            | KernelId::Convert3x3Pad1Valhall
            | KernelId::Convert5x5Pad2Valhall
            | KernelId::Convert9x9Pad4Valhall => {
                let p = params!(ConvertParams, 2);
                if !p.is_valid() {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 2 });
                }
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::convert_with_pad(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::MatrixTranspose => {
                let p = params!(TransposeParams, 2);
                if p.dst_stride < p.width {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 5 });
                }
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    layout::transpose(dev.data(buf(0)?, p.src_len())?, dst, &p);
                    Ok(())
                })
            }
            KernelId::AlignWeightGemm => {
                let p = params!(AlignGemmParams, 2);
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    weights::align_weight_gemm(dev.data(buf(0)?, p.out_channels * p.patch)?, dst, &p);
                    Ok(())
                })
            }
            KernelId::AlignWeight1xN => {
                let p = params!(Align1xNParams, 2);
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    weights::align_weight_1xn(dev.data(buf(0)?, p.out_channels * p.patch)?, dst, &p);
                    Ok(())
                })
            }
            KernelId::AlignWeightDirect => {
                let p = params!(AlignDirectParams, 2);
                let src_len = p.out_channels * p.in_channels * p.kernel_h * p.kernel_w;
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    weights::align_weight_direct(dev.data(buf(0)?, src_len)?, dst, &p);
                    Ok(())
                })
            }
            KernelId::DilationInit => {
                let p = params!(DilationInitParams, 1);
                self.with_output(buf(0)?, p.len, |_, dst| {
                    weights::dilation_init(dst, &p);
                    Ok(())
                })
            }
            KernelId::Dilation => {
                let p = params!(DilationParams, 2);
                let src_len = p.planes * p.kernel_h * p.kernel_w;
                self.with_output(buf(1)?, p.dst_len(), |dev, dst| {
                    weights::dilate(dev.data(buf(0)?, src_len)?, dst, &p);
                    Ok(())
                })
            }
            KernelId::WeightOffset | KernelId::UpdateDirectBias => {
                let p = params!(BiasFoldParams, 3);
                self.with_output(buf(2)?, p.out_channels, |dev, dst| {
                    let w = dev.data(buf(0)?, p.out_channels * p.patch)?;
                    let bias = dev.data(buf(1)?, p.out_channels)?;
                    weights::fold_bias(w, bias, dst, &p);
                    Ok(())
                })
            }
            KernelId::GemmBlocked => {
                let p = params!(GemmBlockedParams, 4);
                self.with_output(buf(3)?, p.output_len(), |dev, dst| {
                    gemm::gemm_blocked(
                        dev.data(buf(0)?, p.weights_len())?,
                        dev.data(buf(1)?, p.input_len())?,
                        dev.data(buf(2)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::Gemm1xN | KernelId::Gemm1xNBlock8 => {
                let p = params!(Gemm1xNParams, 4);
                self.with_output(buf(3)?, p.output_len(), |dev, dst| {
                    gemm::gemm_1xn(
                        dev.data(buf(0)?, p.weights_len())?,
                        dev.data(buf(1)?, p.input_len())?,
                        dev.data(buf(2)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::Direct3x3 | KernelId::Direct5x5 | KernelId::Direct7x7 | KernelId::Direct9x9 => {
                let p = params!(DirectParams, 4);
                if KernelId::direct(p.kernel) != Some(kernel) {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 11 });
                }
                self.with_output(buf(3)?, p.output_len(), |dev, dst| {
                    conv2d::direct_conv(
                        dev.data(buf(0)?, p.input_len())?,
                        dev.data(buf(1)?, p.weights_len())?,
                        dev.data(buf(2)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::DepthwiseGeneric
            | KernelId::Depthwise3x3S1PadMerge
            | KernelId::Depthwise3x3S2PadMerge
            | KernelId::Depthwise3x3S1D2PadMerge
            | KernelId::Depthwise3x3S1Quad
            | KernelId::Depthwise3x3S2 => {
                let p = params!(DepthwiseParams, 4);
                let taps = p.kernel_h * p.kernel_w;
                self.with_output(buf(3)?, p.output_len(), |dev, dst| {
                    conv2d::depthwise(
                        dev.data(buf(0)?, p.input_len())?,
                        dev.data(buf(1)?, p.fed_channels() * taps)?,
                        dev.data(buf(2)?, p.fed_channels())?,
                        dst,
                        &p,
                        signed,
                    );
                    Ok(())
                })
            }
            KernelId::DepthwiseUnequal => {
                let p = params!(UnequalParams, 2);
                self.with_output(buf(1)?, p.batch * p.out_channels * p.spatial, |dev, dst| {
                    conv2d::depthwise_unequal(dev.data(buf(0)?, p.out_channels)?, dst, &p, signed);
                    Ok(())
                })
            }
            KernelId::PerChannelConv => {
                let p = params!(PerChannelParams, 6);
                if p.groups == 0 || p.group >= p.groups {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 21 });
                }
                self.with_output(buf(5)?, p.output_len(), |dev, dst| {
                    conv2d::per_channel_conv(
                        dev.data(buf(0)?, p.input_len())?,
                        dev.data(buf(1)?, p.weights_len())?,
                        dev.data(buf(2)?, p.out_channels)?,
                        dev.data(buf(3)?, p.out_channels)?,
                        dev.data(buf(4)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::ConvBackGemm => {
                let p = params!(ConvBackGemmParams, 3);
                self.with_output(buf(2)?, p.output_len(), |dev, dst| {
                    gemm::conv_back_gemm(
                        dev.data(buf(0)?, p.filter_len())?,
                        dev.data(buf(1)?, p.input_len())?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::ConvertBottomDiff => {
                let p = params!(ScatterParams, 3);
                if p.stride_h == 0 || p.stride_w == 0 {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 11 });
                }
                self.with_output(buf(2)?, p.output_len(), |dev, dst| {
                    conv2d::convert_bottom_diff(
                        dev.data(buf(0)?, p.col_len())?,
                        dev.data(buf(1)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
            KernelId::ConvertBottomDiffPerChannel => {
                let p = params!(ScatterParams, 5);
                if p.stride_h == 0 || p.stride_w == 0 {
                    return Err(DeviceError::ArgumentType { kernel: name, index: 13 });
                }
                self.with_output(buf(4)?, p.output_len(), |dev, dst| {
                    conv2d::convert_bottom_diff_per_channel(
                        dev.data(buf(0)?, p.col_len())?,
                        dev.data(buf(1)?, p.out_channels)?,
                        dev.data(buf(2)?, p.out_channels)?,
                        dev.data(buf(3)?, p.out_channels)?,
                        dst,
                        &p,
                    );
                    Ok(())
                })
            }
        }
    }
}

impl ComputeDevice for HostDevice {
    fn profile(&self) -> ArchitectureProfile {
        self.profile
    }

    fn max_work_group_size(&self) -> usize {
        self.max_work_group_size
    }

    fn allocate(&mut self, data_type: DataType, len: usize) -> DeviceResult<BufferId> {
        self.buffers.push(Some(HostBuffer {
            data_type,
            data: vec![0; len],
        }));
        Ok(BufferId(self.buffers.len() - 1))
    }

    fn release(&mut self, buffer: BufferId) -> DeviceResult<()> {
        match self.buffers.get_mut(buffer.0) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(DeviceError::UnknownBuffer(buffer)),
        }
    }

    fn buffer_len(&self, buffer: BufferId) -> DeviceResult<usize> {
        Ok(self.buffer(buffer)?.data.len())
    }

    fn write_buffer(&mut self, buffer: BufferId, data: &[i32]) -> DeviceResult<()> {
        let buf = self
            .buffers
            .get_mut(buffer.0)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownBuffer(buffer))?;
        if data.len() > buf.data.len() {
            return Err(DeviceError::OutOfBounds {
                offset: 0,
                len: data.len(),
                capacity: buf.data.len(),
            });
        }
        let (lo, hi) = buf.data_type.range();
        for (d, &s) in buf.data.iter_mut().zip(data) {
            *d = s.clamp(lo, hi);
        }
        Ok(())
    }

    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<i32>> {
        Ok(self.buffer(buffer)?.data.clone())
    }

    fn copy_buffer(
        &mut self,
        dst: BufferId,
        src: BufferId,
        dst_offset: usize,
        src_offset: usize,
        len: usize,
    ) -> DeviceResult<()> {
        let src_buf = self.buffer(src)?;
        if src_offset + len > src_buf.data.len() {
            return Err(DeviceError::OutOfBounds {
                offset: src_offset,
                len,
                capacity: src_buf.data.len(),
            });
        }
        let chunk = src_buf.data[src_offset..src_offset + len].to_vec();
        let dst_buf = self
            .buffers
            .get_mut(dst.0)
            .and_then(Option::as_mut)
            .ok_or(DeviceError::UnknownBuffer(dst))?;
        if dst_offset + len > dst_buf.data.len() {
            return Err(DeviceError::OutOfBounds {
                offset: dst_offset,
                len,
                capacity: dst_buf.data.len(),
            });
        }
        dst_buf.data[dst_offset..dst_offset + len].copy_from_slice(&chunk);
        Ok(())
    }

    fn resolve_kernel(&mut self, kernel: KernelId, precision: Precision) -> DeviceResult<KernelHandle> {
        if precision.is_signed() && kernel.unsigned_only() {
            return Err(DeviceError::UnknownKernel(kernel.name(), precision));
        }
        self.kernels.push(ResolvedKernel {
            kernel,
            precision,
            args: None,
        });
        Ok(KernelHandle {
            slot: self.kernels.len() - 1,
            kernel,
            precision,
        })
    }

    fn bind_arguments(&mut self, kernel: &KernelHandle, args: &[KernelArg]) -> DeviceResult<()> {
        let resolved = self
            .kernels
            .get_mut(kernel.slot)
            .ok_or(DeviceError::UnknownKernel(kernel.kernel.name(), kernel.precision))?;
        resolved.args = Some(args.to_vec());
        Ok(())
    }

    fn enqueue(&mut self, kernel: &KernelHandle, work: &WorkSize) -> DeviceResult<()> {
        let resolved = self
            .kernels
            .get(kernel.slot)
            .cloned()
            .ok_or(DeviceError::UnknownKernel(kernel.kernel.name(), kernel.precision))?;
        let args = resolved.args.ok_or(DeviceError::Unbound(resolved.kernel.name()))?;
        self.check_work(resolved.kernel, work)?;
        trace!(
            kernel = %resolved.kernel.qualified_name(resolved.precision),
            global = ?&work.global[..work.dims],
            local = ?work.local.map(|l| l[..work.dims].to_vec()),
            "enqueue"
        );
        self.run(resolved.kernel, resolved.precision, &args)?;
        self.launches.push(LaunchRecord {
            kernel: resolved.kernel,
            precision: resolved.precision,
            work: *work,
        });
        Ok(())
    }
}
