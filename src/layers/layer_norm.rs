//! Layer Normalization
//!
//! Normalizes each row of the last dimension to zero mean and unit variance,
//! then applies a learned scale `gamma` and shift `beta`.
//!
//! ## Forward
//!
//! ```text
//! mean   = sum(x) / N
//! var    = sum((x - mean)²) / N
//! x_norm = (x - mean) / sqrt(var + eps)
//! y      = gamma * x_norm + beta
//! ```
//!
//! ## Backward
//!
//! ```text
//! grad_gamma = sum_rows(grad_y * x_norm)
//! grad_beta  = sum_rows(grad_y)
//! g          = grad_y * gamma
//! grad_x     = (g - mean(g) - x_norm * mean(g * x_norm)) / sqrt(var + eps)
//! ```
//!
//! The two mean terms carry the dependence of every output on the row's
//! mean and variance.

use crate::tensor::Tensor;
use rayon::prelude::*;

/// Default epsilon.
pub const LAYER_NORM_EPS: f32 = 1e-5;

/// Layer normalization over the last dimension.
#[derive(Clone, Debug)]
pub struct LayerNorm {
    /// Scale `[n_embd]`, starts at 1
    pub gamma: Tensor,
    /// Shift `[n_embd]`, starts at 0
    pub beta: Tensor,
    pub eps: f32,
}

impl LayerNorm {
    pub fn new(normalized_shape: usize) -> Self {
        Self {
            gamma: Tensor::full(vec![normalized_shape], 1.0),
            beta: Tensor::zeros(vec![normalized_shape]),
            eps: LAYER_NORM_EPS,
        }
    }

    /// Forward pass over `[*, n_embd]`.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LayerNormCache) {
        let n = self.gamma.numel();
        assert_eq!(x.last_dim(), n, "layer norm width mismatch");

        let rows = x.numel() / n;
        let mut x_norm = vec![0.0; x.numel()];
        let mut rstd = vec![0.0; rows];

        x_norm
            .par_chunks_mut(n)
            .zip(rstd.par_iter_mut())
            .zip(x.data.par_chunks(n))
            .for_each(|((out, r), row)| {
                let mean = row.iter().sum::<f32>() / n as f32;
                let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n as f32;
                *r = 1.0 / (var + self.eps).sqrt();
                for (o, v) in out.iter_mut().zip(row) {
                    *o = (v - mean) * *r;
                }
            });

        let mut y = x_norm.clone();
        y.par_chunks_mut(n).for_each(|row| {
            for ((v, g), b) in row.iter_mut().zip(&self.gamma.data).zip(&self.beta.data) {
                *v = *v * g + b;
            }
        });

        let cache = LayerNormCache {
            x_norm: Tensor::new(x_norm, x.shape.clone()),
            rstd,
        };
        (Tensor::new(y, x.shape.clone()), cache)
    }

    /// Backward pass.
    pub fn backward(&self, grad_out: &Tensor, cache: &LayerNormCache) -> LayerNormGradients {
        let n = self.gamma.numel();

        let mut grad_gamma = vec![0.0; n];
        let mut grad_beta = vec![0.0; n];
        for (g_row, xn_row) in grad_out.data.chunks(n).zip(cache.x_norm.data.chunks(n)) {
            for j in 0..n {
                grad_gamma[j] += g_row[j] * xn_row[j];
                grad_beta[j] += g_row[j];
            }
        }

        let mut grad_x = vec![0.0; grad_out.numel()];
        grad_x
            .par_chunks_mut(n)
            .zip(grad_out.data.par_chunks(n))
            .zip(cache.x_norm.data.par_chunks(n))
            .zip(cache.rstd.par_iter())
            .for_each(|(((out, g_row), xn_row), &rstd)| {
                let mut mean_g = 0.0;
                let mut mean_gx = 0.0;
                for j in 0..n {
                    let g = g_row[j] * self.gamma.data[j];
                    mean_g += g;
                    mean_gx += g * xn_row[j];
                }
                mean_g /= n as f32;
                mean_gx /= n as f32;
                for j in 0..n {
                    let g = g_row[j] * self.gamma.data[j];
                    out[j] = (g - mean_g - xn_row[j] * mean_gx) * rstd;
                }
            });

        LayerNormGradients {
            gamma: Tensor::new(grad_gamma, vec![n]),
            beta: Tensor::new(grad_beta, vec![n]),
            x: Tensor::new(grad_x, grad_out.shape.clone()),
        }
    }
}

/// Values saved for [`LayerNorm::backward`].
#[derive(Clone, Debug)]
pub struct LayerNormCache {
    pub x_norm: Tensor,
    /// `1 / sqrt(var + eps)` per row
    pub rstd: Vec<f32>,
}

#[derive(Clone, Debug)]
pub struct LayerNormGradients {
    pub gamma: Tensor,
    pub beta: Tensor,
    pub x: Tensor,
}
