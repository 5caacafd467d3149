//! GELU Activation
//!
//! The feed-forward network uses the tanh approximation of GELU:
//!
//! ```text
//! GELU(x) ≈ 0.5 x (1 + tanh(√(2/π) (x + 0.044715 x³)))
//! ```
//!
//! Derivative, with `u = √(2/π) (x + 0.044715 x³)`:
//!
//! ```text
//! GELU'(x) = 0.5 (1 + tanh u) + 0.5 x sech²(u) √(2/π) (1 + 3·0.044715 x²)
//! ```

use crate::tensor::Tensor;
use rayon::prelude::*;

const GELU_COEFF: f32 = 0.044715;

#[inline]
fn sqrt_2_over_pi() -> f32 {
    (2.0 / std::f32::consts::PI).sqrt()
}

/// Element-wise GELU.
pub fn gelu_forward(x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let result = x
        .data
        .par_iter()
        .map(|&v| 0.5 * v * (1.0 + (k * (v + GELU_COEFF * v * v * v)).tanh()))
        .collect();
    Tensor::new(result, x.shape.clone())
}

/// Gradient of GELU given the pre-activation `x`.
pub fn gelu_backward(grad_out: &Tensor, x: &Tensor) -> Tensor {
    let k = sqrt_2_over_pi();
    let result = x
        .data
        .par_iter()
        .zip(&grad_out.data)
        .map(|(&v, &g)| {
            let t = (k * (v + GELU_COEFF * v * v * v)).tanh();
            let sech_sq = 1.0 - t * t;
            let d = 0.5 * (1.0 + t) + 0.5 * v * sech_sq * k * (1.0 + 3.0 * GELU_COEFF * v * v);
            g * d
        })
        .collect();
    Tensor::new(result, x.shape.clone())
}
