use crate::device::DeviceError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ConvError>;

/// Outcome of an `initialize` or `execute` call as seen by a graph executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success,
    /// Empty tensors, non-divisible groups, shapes a variant cannot handle.
    InvalidParams,
    /// Scale-consistency check or device call failed.
    Failure,
}

#[derive(Error, Debug)]
pub enum ConvError {
    #[error("invalid parameters: {0}")]
    InvalidParams(String),
    #[error("output shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },
    /// `input.scale * weight.scale` disagrees with the bias scale.
    #[error("scale mismatch: input*weight = {product}, bias = {bias}")]
    ScaleMismatch { product: f64, bias: f64 },
    #[error("negative scale product {0}")]
    NegativeScale(f64),
    /// Zero or non-finite `input * weight / output` ratio.
    #[error("requantization ratio {0} is not positive and finite")]
    InvalidRatio(f64),
    #[error("unsupported kernel {height}x{width} for {variant}")]
    UnsupportedKernel {
        variant: &'static str,
        height: usize,
        width: usize,
    },
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

impl ConvError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        ConvError::InvalidParams(msg.into())
    }

    pub fn status(&self) -> Status {
        match self {
            ConvError::InvalidParams(_) | ConvError::ShapeMismatch { .. } => Status::InvalidParams,
            ConvError::ScaleMismatch { .. }
            | ConvError::NegativeScale(_)
            | ConvError::InvalidRatio(_)
            | ConvError::UnsupportedKernel { .. }
            | ConvError::Device(_) => Status::Failure,
        }
    }
}

impl<T> From<&Result<T>> for Status {
    fn from(result: &Result<T>) -> Self {
        match result {
            Ok(_) => Status::Success,
            Err(e) => e.status(),
        }
    }
}
