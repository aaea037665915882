//! Building blocks shared by the vision tower.

use candle_core::{Result, Tensor};
use candle_nn::Module;

const SQRT_TWO_OVER_PI: f64 = 0.797_884_560_802_865_4;
const GELU_COEFF: f64 = 0.044_715;

/// Tanh approximation of GELU:
/// `0.5 * x * (1 + tanh(sqrt(2 / pi) * (x + 0.044715 * x^3)))`.
///
/// The terms are composed in the same order as the reference formula so results match it
/// for every dtype, rather than going through a fused or erf-based kernel.
#[derive(Debug, Clone, Copy, Default)]
pub struct GeluPytorchTanh;

impl Module for GeluPytorchTanh {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let cube = (xs.sqr()? * xs)?;
        let inner = ((xs + (cube * GELU_COEFF)?)? * SQRT_TWO_OVER_PI)?;
        let gate = (inner.tanh()? + 1.0)?;
        (xs * 0.5)? * gate
    }
}

/// Average pooling over the two trailing dimensions of a `(N, C, H, W)` tensor.
pub struct AvgPool2d {
    kernel_size: usize,
    stride: usize,
}

impl AvgPool2d {
    pub fn new(kernel_size: usize, stride: usize) -> Self {
        Self {
            kernel_size,
            stride,
        }
    }
}

impl Module for AvgPool2d {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        xs.avg_pool2d_with_stride(self.kernel_size, self.stride)
    }
}
