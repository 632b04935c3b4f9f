//! Quantized 2-D convolution orchestration.
//!
//! Operators validate shapes and quantization parameters, pick an execution
//! variant, pack weights and drive a [`device::ComputeDevice`] through the
//! layout, packing and compute kernels of that variant. [`device::HostDevice`]
//! runs every kernel on host memory.

pub mod device;
pub mod error;
pub mod kernels;
pub mod ops;
pub mod tensor;
pub mod tuning;

pub use device::{ComputeDevice, HostDevice};
pub use error::{ConvError, Result, Status};
pub use ops::{ActivationKind, ConvDescriptor, ConvVariant, Convolution, Deconvolution, Padding};
pub use tensor::{DataType, Dim4, Precision, QuantizedTensor, Scale};
pub use tuning::{ArchitectureProfile, EngineConfig, TuningTable};
