//! Linear Layer
//!
//! Affine map over the last dimension: `y = x @ W + b`.
//!
//! ## Forward
//!
//! ```text
//! x: [*, in]   W: [in, out]   b: [out] (optional)
//! y: [*, out]
//! ```
//!
//! Leading dimensions are flattened to rows, so `[B, T, C]` activations go
//! through the same 2-D kernel as `[rows, C]`.
//!
//! ## Backward
//!
//! ```text
//! grad_W = x^T @ grad_y
//! grad_b = sum(grad_y) over every leading dimension
//! grad_x = grad_y @ W^T
//! ```
//!
//! ## Initialization
//!
//! Weights are drawn from `N(0, 0.02)`. A layer built with
//! `residual_projection = true` writes into the residual stream at the end
//! of a block, and uses the depth-scaled `0.02 * (2 * n_layer)^-0.5`
//! instead. Biases start at zero.

use crate::error::Result;
use crate::tensor::Tensor;
use rand::Rng;

/// Standard deviation for ordinary weights and embeddings.
pub const INIT_STD: f32 = 0.02;

/// Fully connected layer.
#[derive(Clone, Debug)]
pub struct Linear {
    /// `[in_features, out_features]`
    pub weight: Tensor,
    /// `[out_features]`, absent when the model is built without biases
    pub bias: Option<Tensor>,
    /// Output projection back into the residual stream
    pub residual_projection: bool,
}

impl Linear {
    /// Zero-initialized layer. Call [`Linear::init`] (or let the model do it)
    /// before training.
    pub fn new(
        in_features: usize,
        out_features: usize,
        bias: bool,
        residual_projection: bool,
    ) -> Self {
        Self {
            weight: Tensor::zeros(vec![in_features, out_features]),
            bias: bias.then(|| Tensor::zeros(vec![out_features])),
            residual_projection,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.shape[0]
    }

    pub fn out_features(&self) -> usize {
        self.weight.shape[1]
    }

    /// Draw fresh weights and zero the bias.
    ///
    /// # Arguments
    ///
    /// * `n_layer` - Depth of the model, used to shrink residual projections
    /// * `rng` - Seeded generator
    pub fn init<R: Rng + ?Sized>(&mut self, n_layer: usize, rng: &mut R) -> Result<()> {
        let std = if self.residual_projection {
            INIT_STD * (2.0 * n_layer as f32).powf(-0.5)
        } else {
            INIT_STD
        };
        self.weight = Tensor::randn(self.weight.shape.clone(), std, rng)?;
        if let Some(bias) = self.bias.as_mut() {
            bias.data.fill(0.0);
        }
        Ok(())
    }

    /// Forward pass over `[*, in]`.
    ///
    /// # Returns
    ///
    /// Output `[*, out]` and the cache holding `x` for backward.
    pub fn forward(&self, x: &Tensor) -> (Tensor, LinearCache) {
        let y = self.apply(x);
        (y, LinearCache { x: x.clone() })
    }

    /// Forward pass without keeping anything for backward.
    pub fn apply(&self, x: &Tensor) -> Tensor {
        let in_features = self.in_features();
        let rows = x.numel() / in_features;
        let y = x.reshape(&[rows, in_features]).matmul(&self.weight);
        let y = match &self.bias {
            Some(b) => y.add(b),
            None => y,
        };

        let mut out_shape = x.shape.clone();
        if let Some(last) = out_shape.last_mut() {
            *last = self.out_features();
        }
        y.into_shape(&out_shape)
    }

    /// Backward pass.
    ///
    /// # Arguments
    ///
    /// * `grad_out` - Gradient w.r.t. the output, `[*, out]`
    /// * `cache` - Input saved by [`Linear::forward`]
    pub fn backward(&self, grad_out: &Tensor, cache: &LinearCache) -> LinearGradients {
        let in_features = self.in_features();
        let out_features = self.out_features();
        let rows = grad_out.numel() / out_features;

        let x2 = cache.x.reshape(&[rows, in_features]);
        let g2 = grad_out.reshape(&[rows, out_features]);

        let weight = x2.t().matmul(&g2);
        let bias = self.bias.as_ref().map(|_| g2.sum_leading());
        let x = g2.matmul(&self.weight.t()).into_shape(&cache.x.shape);

        LinearGradients { weight, bias, x }
    }
}

/// Values saved for [`Linear::backward`].
#[derive(Clone, Debug)]
pub struct LinearCache {
    pub x: Tensor,
}

/// Parameter and input gradients of a [`Linear`] layer.
#[derive(Clone, Debug)]
pub struct LinearGradients {
    pub weight: Tensor,
    pub bias: Option<Tensor>,
    /// Gradient for the previous layer
    pub x: Tensor,
}
