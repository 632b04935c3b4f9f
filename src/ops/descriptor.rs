use crate::error::{ConvError, Result};
use crate::tensor::Dim4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
    Relu1,
    Relu6,
}

/// Per-side padding. Only transposed convolution accepts negative values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Padding {
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
    pub left: i32,
}

impl Padding {
    pub const fn new(top: i32, right: i32, bottom: i32, left: i32) -> Self {
        Self {
            top,
            right,
            bottom,
            left,
        }
    }

    pub const fn uniform(p: i32) -> Self {
        Self::new(p, p, p, p)
    }

    pub fn is_zero(&self) -> bool {
        self.top == 0 && self.right == 0 && self.bottom == 0 && self.left == 0
    }

    pub fn is_non_negative(&self) -> bool {
        self.top >= 0 && self.right >= 0 && self.bottom >= 0 && self.left >= 0
    }

    pub fn is_symmetric(&self, p: i32) -> bool {
        *self == Self::uniform(p)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvDescriptor {
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub stride_h: usize,
    pub stride_w: usize,
    pub dilation_h: usize,
    pub dilation_w: usize,
    pub padding: Padding,
    pub group: usize,
    pub depth_multiplier: usize,
    pub activation: ActivationKind,
    /// Weights are a graph input and may change between calls.
    pub weights_as_input: bool,
    /// Bias is a graph input and may change between calls.
    pub bias_as_input: bool,
}

impl Default for ConvDescriptor {
    fn default() -> Self {
        Self {
            kernel_h: 1,
            kernel_w: 1,
            stride_h: 1,
            stride_w: 1,
            dilation_h: 1,
            dilation_w: 1,
            padding: Padding::default(),
            group: 1,
            depth_multiplier: 1,
            activation: ActivationKind::None,
            weights_as_input: false,
            bias_as_input: false,
        }
    }
}

impl ConvDescriptor {
    pub fn new(kernel_h: usize, kernel_w: usize) -> Self {
        Self {
            kernel_h,
            kernel_w,
            ..Self::default()
        }
    }

    pub fn with_stride(mut self, stride_h: usize, stride_w: usize) -> Self {
        self.stride_h = stride_h;
        self.stride_w = stride_w;
        self
    }

    pub fn with_dilation(mut self, dilation_h: usize, dilation_w: usize) -> Self {
        self.dilation_h = dilation_h;
        self.dilation_w = dilation_w;
        self
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn with_group(mut self, group: usize) -> Self {
        self.group = group;
        self
    }

    pub fn with_depth_multiplier(mut self, depth_multiplier: usize) -> Self {
        self.depth_multiplier = depth_multiplier;
        self
    }

    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }

    pub fn with_dynamic_weights(mut self, weights_as_input: bool, bias_as_input: bool) -> Self {
        self.weights_as_input = weights_as_input;
        self.bias_as_input = bias_as_input;
        self
    }

    pub fn is_dilated(&self) -> bool {
        self.dilation_h > 1 || self.dilation_w > 1
    }

    /// Kernel extent after dilation.
    pub fn effective_kernel(&self) -> (usize, usize) {
        (
            self.dilation_h * (self.kernel_h - 1) + 1,
            self.dilation_w * (self.kernel_w - 1) + 1,
        )
    }

    /// Packing and folding must be redone on every execute.
    pub fn repack_each_call(&self) -> bool {
        self.weights_as_input || self.bias_as_input
    }

    pub fn validate(&self) -> Result<()> {
        if self.kernel_h == 0 || self.kernel_w == 0 {
            return Err(ConvError::invalid("kernel size must be positive"));
        }
        if self.stride_h == 0 || self.stride_w == 0 {
            return Err(ConvError::invalid("stride must be positive"));
        }
        if self.dilation_h == 0 || self.dilation_w == 0 {
            return Err(ConvError::invalid("dilation must be positive"));
        }
        if self.group == 0 || self.depth_multiplier == 0 {
            return Err(ConvError::invalid("group and depth multiplier must be positive"));
        }
        Ok(())
    }

    /// `(in + pad_t + pad_b - k + s) / s` per axis, using the dilated extent.
    pub fn output_size(&self, in_h: usize, in_w: usize) -> Result<(usize, usize)> {
        let (kh, kw) = self.effective_kernel();
        let span_h = in_h as i64 + self.padding.top as i64 + self.padding.bottom as i64;
        let span_w = in_w as i64 + self.padding.left as i64 + self.padding.right as i64;
        if span_h < kh as i64 || span_w < kw as i64 {
            return Err(ConvError::invalid(format!(
                "kernel {}x{} larger than padded input {}x{}",
                kh, kw, span_h, span_w
            )));
        }
        Ok((
            ((span_h - kh as i64 + self.stride_h as i64) / self.stride_h as i64) as usize,
            ((span_w - kw as i64 + self.stride_w as i64) / self.stride_w as i64) as usize,
        ))
    }

    /// Check the caller-declared output shape against the sizing formula.
    pub fn check_output(&self, input: Dim4, output: Dim4) -> Result<()> {
        let (h, w) = self.output_size(input.h, input.w)?;
        let expected = Dim4::new(input.n, output.c, h, w);
        if expected != output {
            return Err(ConvError::ShapeMismatch {
                expected: expected.to_string(),
                actual: output.to_string(),
            });
        }
        Ok(())
    }

    /// Output extent of the transposed convolution with this descriptor.
    pub fn transposed_output_size(&self, in_h: usize, in_w: usize) -> Result<(usize, usize)> {
        let h = (in_h as i64 - 1) * self.stride_h as i64 + self.kernel_h as i64
            - self.padding.top as i64
            - self.padding.bottom as i64;
        let w = (in_w as i64 - 1) * self.stride_w as i64 + self.kernel_w as i64
            - self.padding.left as i64
            - self.padding.right as i64;
        if h <= 0 || w <= 0 {
            return Err(ConvError::invalid(format!("transposed output {}x{} is empty", h, w)));
        }
        Ok((h as usize, w as usize))
    }
}
