//! Neural Network Layers
//!
//! Every layer of the model, each with an explicit backward pass.
//!
//! ## Layers
//!
//! - **linear**: affine map with optional bias and residual-projection tag
//! - **layer_norm**: normalization over the embedding dimension
//! - **activation**: GELU (tanh approximation)
//! - **dropout**: inverted dropout, identity in eval mode
//! - **rotary**: rotary position embedding for queries and keys
//! - **attention**: multi-head causal self-attention with optional KV cache
//! - **feed_forward**: `Linear -> GELU -> Linear -> Dropout`
//! - **block**: pre-norm residual transformer block
//!
//! ## Pattern
//!
//! ```rust,ignore
//! impl Layer {
//!     pub fn forward(&self, x: &Tensor) -> (Tensor, LayerCache);
//!     pub fn backward(&self, grad: &Tensor, cache: &LayerCache) -> LayerGradients;
//! }
//! ```
//!
//! A layer and its gradient struct both implement [`Parameters`] and visit
//! their tensors under the same names in the same order. Walking the model
//! and walking its gradients therefore yields aligned sequences, which is all
//! the optimizer, clipping and checkpointing need.

pub mod activation;
pub mod attention;
pub mod block;
pub mod dropout;
pub mod feed_forward;
pub mod layer_norm;
pub mod linear;
pub mod rotary;

pub use activation::{gelu_backward, gelu_forward};
pub use attention::{AttentionCache, AttentionGradients, CausalAttention};
pub use block::{BlockCache, BlockGradients, TransformerBlock};
pub use dropout::{Dropout, DropoutCache};
pub use feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
pub use layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
pub use linear::{Linear, LinearCache, LinearGradients};
pub use rotary::{rotate_half, RotaryEncoder, RotaryTables};

use crate::tensor::Tensor;

/// Named traversal over trainable tensors.
///
/// Names are dotted paths (`blocks.3.attn.qkv.weight`). Implementations must
/// visit in a fixed order that does not depend on the tensor values.
pub trait Parameters {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor));

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor));

    /// All tensors in visiting order.
    fn tensors(&self) -> Vec<&Tensor> {
        let mut out = Vec::new();
        self.visit("", &mut |_, t| out.push(t));
        out
    }

    fn tensors_mut(&mut self) -> Vec<&mut Tensor> {
        let mut out = Vec::new();
        self.visit_mut("", &mut |_, t| out.push(t));
        out
    }

    /// `(name, tensor)` pairs in visiting order.
    fn named_tensors(&self) -> Vec<(String, &Tensor)> {
        let mut out = Vec::new();
        self.visit("", &mut |name, t| out.push((name, t)));
        out
    }
}

/// Join a dotted prefix and a field name.
pub(crate) fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

impl Parameters for Linear {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "weight"), &self.weight);
        if let Some(b) = &self.bias {
            f(join(prefix, "bias"), b);
        }
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "weight"), &mut self.weight);
        if let Some(b) = &mut self.bias {
            f(join(prefix, "bias"), b);
        }
    }
}

impl Parameters for LinearGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "weight"), &self.weight);
        if let Some(b) = &self.bias {
            f(join(prefix, "bias"), b);
        }
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "weight"), &mut self.weight);
        if let Some(b) = &mut self.bias {
            f(join(prefix, "bias"), b);
        }
    }
}

impl Parameters for LayerNorm {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "weight"), &self.gamma);
        f(join(prefix, "bias"), &self.beta);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "weight"), &mut self.gamma);
        f(join(prefix, "bias"), &mut self.beta);
    }
}

impl Parameters for LayerNormGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "weight"), &self.gamma);
        f(join(prefix, "bias"), &self.beta);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "weight"), &mut self.gamma);
        f(join(prefix, "bias"), &mut self.beta);
    }
}
