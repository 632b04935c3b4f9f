use crate::device::{BufferId, ComputeDevice};
use crate::error::{ConvError, Result};
use std::borrow::Cow;
use std::fmt;

/// Logical NCHW extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Dim4 {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
}

impl Dim4 {
    pub const fn new(n: usize, c: usize, h: usize, w: usize) -> Self {
        Self { n, c, h, w }
    }

    pub fn count(&self) -> usize {
        self.n * self.c * self.h * self.w
    }

    pub fn spatial(&self) -> usize {
        self.h * self.w
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }
}

impl fmt::Display for Dim4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}x{}", self.n, self.c, self.h, self.w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    UInt8,
    Int8,
    Int32,
}

impl DataType {
    pub fn range(self) -> (i32, i32) {
        match self {
            DataType::UInt8 => (u8::MIN as i32, u8::MAX as i32),
            DataType::Int8 => (i8::MIN as i32, i8::MAX as i32),
            DataType::Int32 => (i32::MIN, i32::MAX),
        }
    }

    pub fn contains(self, value: i32) -> bool {
        let (lo, hi) = self.range();
        (lo..=hi).contains(&value)
    }
}

/// Kernel precision of a quantized convolution. Selects the `SIGNED` kernel family for int8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Precision {
    UInt8,
    Int8,
}

impl Precision {
    pub fn from_data_type(data_type: DataType) -> Result<Self> {
        match data_type {
            DataType::UInt8 => Ok(Precision::UInt8),
            DataType::Int8 => Ok(Precision::Int8),
            DataType::Int32 => Err(ConvError::invalid("int32 activations are not quantized 8-bit")),
        }
    }

    pub fn is_signed(self) -> bool {
        self == Precision::Int8
    }

    pub fn data_type(self) -> DataType {
        match self {
            Precision::UInt8 => DataType::UInt8,
            Precision::Int8 => DataType::Int8,
        }
    }

    pub fn range(self) -> (i32, i32) {
        self.data_type().range()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Scale {
    PerTensor(f64),
    /// One scale per output channel (weights only).
    PerChannel(Vec<f64>),
}

impl Scale {
    pub fn at(&self, channel: usize) -> f64 {
        match self {
            Scale::PerTensor(s) => *s,
            Scale::PerChannel(v) => v.get(channel).copied().unwrap_or(0.0),
        }
    }
}

/// Metadata and device buffer of a quantized tensor.
///
/// Element values are stored one per buffer slot. The tensor never owns its
/// host data; reads and writes go through the device that allocated it.
#[derive(Debug, Clone)]
pub struct QuantizedTensor {
    dims: Dim4,
    data_type: DataType,
    scale: Scale,
    zero_point: i32,
    buffer: BufferId,
}

impl QuantizedTensor {
    pub fn new<D: ComputeDevice + ?Sized>(
        device: &mut D,
        dims: Dim4,
        data_type: DataType,
        scale: Scale,
        zero_point: i32,
    ) -> Result<Self> {
        if !data_type.contains(zero_point) {
            return Err(ConvError::invalid(format!(
                "zero point {} outside {:?} range",
                zero_point, data_type
            )));
        }
        if let Scale::PerChannel(scales) = &scale {
            if scales.len() != dims.n {
                return Err(ConvError::invalid(format!(
                    "{} channel scales for {} output channels",
                    scales.len(),
                    dims.n
                )));
            }
        }
        let buffer = device.allocate(data_type, dims.count())?;
        Ok(Self {
            dims,
            data_type,
            scale,
            zero_point,
            buffer,
        })
    }

    pub fn from_data<D: ComputeDevice + ?Sized>(
        device: &mut D,
        dims: Dim4,
        data_type: DataType,
        scale: Scale,
        zero_point: i32,
        data: &[i32],
    ) -> Result<Self> {
        if data.len() != dims.count() {
            return Err(ConvError::invalid(format!(
                "{} values for a {} tensor",
                data.len(),
                dims
            )));
        }
        let tensor = Self::new(device, dims, data_type, scale, zero_point)?;
        tensor.write(device, data)?;
        Ok(tensor)
    }

    /// Per-tensor int32 bias with the conventional `input_scale * filter_scale` scale.
    pub fn bias<D: ComputeDevice + ?Sized>(device: &mut D, scale: f64, values: &[i32]) -> Result<Self> {
        Self::from_data(
            device,
            Dim4::new(1, values.len(), 1, 1),
            DataType::Int32,
            Scale::PerTensor(scale),
            0,
            values,
        )
    }

    pub fn dims(&self) -> Dim4 {
        self.dims
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn scale(&self) -> f64 {
        self.scale.at(0)
    }

    pub fn scales(&self) -> Cow<'_, [f64]> {
        match &self.scale {
            Scale::PerTensor(s) => Cow::Owned(vec![*s; self.dims.n.max(1)]),
            Scale::PerChannel(v) => Cow::Borrowed(v),
        }
    }

    pub fn is_per_channel(&self) -> bool {
        matches!(self.scale, Scale::PerChannel(_))
    }

    pub fn zero_point(&self) -> i32 {
        self.zero_point
    }

    pub fn buffer(&self) -> BufferId {
        self.buffer
    }

    /// Reallocate the backing buffer for a new shape. Contents are not preserved.
    pub fn reshape<D: ComputeDevice + ?Sized>(&mut self, device: &mut D, dims: Dim4) -> Result<()> {
        if dims.count() != self.dims.count() {
            device.release(self.buffer)?;
            self.buffer = device.allocate(self.data_type, dims.count())?;
        }
        self.dims = dims;
        Ok(())
    }

    pub fn read<D: ComputeDevice + ?Sized>(&self, device: &D) -> Result<Vec<i32>> {
        Ok(device.read_buffer(self.buffer)?)
    }

    pub fn write<D: ComputeDevice + ?Sized>(&self, device: &mut D, data: &[i32]) -> Result<()> {
        Ok(device.write_buffer(self.buffer, data)?)
    }
}
