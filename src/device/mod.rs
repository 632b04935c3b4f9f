//! Boundary to the compute-device runtime.
//!
//! Operators never touch device memory directly. They allocate buffers,
//! resolve kernels from the closed [`KernelId`] catalog, bind arguments and
//! enqueue launches on a single in-order queue.

pub mod catalog;
pub mod host;

pub use catalog::KernelId;
pub use host::{HostDevice, LaunchRecord};

use crate::tensor::{DataType, Precision};
use crate::tuning::ArchitectureProfile;
use thiserror::Error;

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("unknown buffer {0:?}")]
    UnknownBuffer(BufferId),
    #[error("kernel {0} is not in the catalog for {1:?}")]
    UnknownKernel(&'static str, Precision),
    #[error("kernel {kernel} expects argument {index}")]
    MissingArgument { kernel: &'static str, index: usize },
    #[error("kernel {kernel} argument {index} has the wrong type")]
    ArgumentType { kernel: &'static str, index: usize },
    #[error("kernel {0} launched before its arguments were bound")]
    Unbound(&'static str),
    #[error("access of {len} elements at {offset} exceeds buffer of {capacity}")]
    OutOfBounds {
        offset: usize,
        len: usize,
        capacity: usize,
    },
    #[error("invalid work size for {kernel}: {reason}")]
    WorkSize { kernel: &'static str, reason: String },
}

/// Opaque device-buffer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) usize);

/// A kernel resolved once at initialization and launched many times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KernelHandle {
    pub(crate) slot: usize,
    pub kernel: KernelId,
    pub precision: Precision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelArg {
    Buffer(BufferId),
    Int(i32),
}

impl From<BufferId> for KernelArg {
    fn from(b: BufferId) -> Self {
        KernelArg::Buffer(b)
    }
}

impl From<i32> for KernelArg {
    fn from(v: i32) -> Self {
        KernelArg::Int(v)
    }
}

impl From<usize> for KernelArg {
    fn from(v: usize) -> Self {
        KernelArg::Int(v as i32)
    }
}

/// Global and optional local launch grid, up to three dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSize {
    pub dims: usize,
    pub global: [usize; 3],
    pub local: Option<[usize; 3]>,
}

impl WorkSize {
    pub fn d1(global: usize, local: Option<usize>) -> Self {
        Self {
            dims: 1,
            global: [global, 1, 1],
            local: local.map(|l| [l, 1, 1]),
        }
    }

    pub fn d2(global: [usize; 2], local: Option<[usize; 2]>) -> Self {
        Self {
            dims: 2,
            global: [global[0], global[1], 1],
            local: local.map(|l| [l[0], l[1], 1]),
        }
    }

    pub fn d3(global: [usize; 3], local: Option<[usize; 3]>) -> Self {
        Self {
            dims: 3,
            global,
            local,
        }
    }

    pub fn work_items(&self) -> usize {
        self.global.iter().product()
    }
}

pub trait ComputeDevice {
    fn profile(&self) -> ArchitectureProfile;
    fn max_work_group_size(&self) -> usize;

    fn allocate(&mut self, data_type: DataType, len: usize) -> DeviceResult<BufferId>;
    fn release(&mut self, buffer: BufferId) -> DeviceResult<()>;
    fn buffer_len(&self, buffer: BufferId) -> DeviceResult<usize>;
    fn write_buffer(&mut self, buffer: BufferId, data: &[i32]) -> DeviceResult<()>;
    fn read_buffer(&self, buffer: BufferId) -> DeviceResult<Vec<i32>>;
    fn copy_buffer(
        &mut self,
        dst: BufferId,
        src: BufferId,
        dst_offset: usize,
        src_offset: usize,
        len: usize,
    ) -> DeviceResult<()>;

    fn resolve_kernel(&mut self, kernel: KernelId, precision: Precision) -> DeviceResult<KernelHandle>;
    fn bind_arguments(&mut self, kernel: &KernelHandle, args: &[KernelArg]) -> DeviceResult<()>;
    fn enqueue(&mut self, kernel: &KernelHandle, work: &WorkSize) -> DeviceResult<()>;

    /// Fill a whole buffer with one value.
    fn fill_buffer(&mut self, buffer: BufferId, value: i32) -> DeviceResult<()> {
        let len = self.buffer_len(buffer)?;
        self.write_buffer(buffer, &vec![value; len])
    }

    fn launch(&mut self, kernel: &KernelHandle, args: &[KernelArg], work: &WorkSize) -> DeviceResult<()> {
        self.bind_arguments(kernel, args)?;
        self.enqueue(kernel, work)
    }
}
