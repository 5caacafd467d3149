//! Transformer Block
//!
//! Pre-norm residual design:
//!
//! ```text
//! x ─┬─ ln_1 ─ attn ─(+)─┬─ ln_2 ─ mlp ─(+)─ y
//!    └────────────────────┘└──────────────┘
//! ```
//!
//! Sublayer outputs are added to the stream, never written over it. In the
//! backward pass each residual splits the gradient in two, so the block sums
//! the direct path with the path through the sublayer.

use super::attention::{AttentionCache, AttentionGradients, CausalAttention};
use super::feed_forward::{FeedForward, FeedForwardCache, FeedForwardGradients};
use super::layer_norm::{LayerNorm, LayerNormCache, LayerNormGradients};
use super::{join, Parameters};
use crate::config::ModelConfig;
use crate::error::Result;
use crate::kv_cache::LayerKvCache;
use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct TransformerBlock {
    pub ln_1: LayerNorm,
    pub attn: CausalAttention,
    pub ln_2: LayerNorm,
    pub mlp: FeedForward,
}

impl TransformerBlock {
    pub fn new(config: &ModelConfig) -> Result<Self> {
        Ok(Self {
            ln_1: LayerNorm::new(config.n_embd),
            attn: CausalAttention::new(config)?,
            ln_2: LayerNorm::new(config.n_embd),
            mlp: FeedForward::new(config.n_embd, config.bias, config.dropout),
        })
    }

    /// Inference forward; the cache (if any) goes to attention only.
    pub fn forward(&self, x: &Tensor, kv: Option<&mut LayerKvCache>) -> Result<Tensor> {
        let (h, _) = self.ln_1.forward(x);
        let x = x.add(&self.attn.forward(&h, kv)?);
        let (h, _) = self.ln_2.forward(&x);
        Ok(x.add(&self.mlp.apply(&h)))
    }

    pub fn forward_train(&self, x: &Tensor) -> Result<(Tensor, BlockCache)> {
        let (h1, ln_1_cache) = self.ln_1.forward(x);
        let (attn_out, attn_cache) = self.attn.forward_train(&h1)?;
        let x_mid = x.add(&attn_out);

        let (h2, ln_2_cache) = self.ln_2.forward(&x_mid);
        let (mlp_out, mlp_cache) = self.mlp.forward(&h2);
        let y = x_mid.add(&mlp_out);

        Ok((
            y,
            BlockCache {
                ln_1_cache,
                attn_cache,
                ln_2_cache,
                mlp_cache,
            },
        ))
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &BlockCache) -> BlockGradients {
        // second residual: grad_out flows both straight through and via mlp
        let mlp = self.mlp.backward(grad_out, &cache.mlp_cache);
        let ln_2 = self.ln_2.backward(&mlp.x, &cache.ln_2_cache);
        let mut grad_mid = grad_out.clone();
        grad_mid.add_assign(&ln_2.x);

        // first residual
        let attn = self.attn.backward(&grad_mid, &cache.attn_cache);
        let ln_1 = self.ln_1.backward(&attn.x, &cache.ln_1_cache);
        let mut x = grad_mid;
        x.add_assign(&ln_1.x);

        BlockGradients {
            ln_1,
            attn,
            ln_2,
            mlp,
            x,
        }
    }
}

#[derive(Clone, Debug)]
pub struct BlockCache {
    pub ln_1_cache: LayerNormCache,
    pub attn_cache: AttentionCache,
    pub ln_2_cache: LayerNormCache,
    pub mlp_cache: FeedForwardCache,
}

#[derive(Clone, Debug)]
pub struct BlockGradients {
    pub ln_1: LayerNormGradients,
    pub attn: AttentionGradients,
    pub ln_2: LayerNormGradients,
    pub mlp: FeedForwardGradients,
    /// Gradient w.r.t. the block input
    pub x: Tensor,
}

impl Parameters for TransformerBlock {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.ln_1.visit(&join(prefix, "ln_1"), f);
        self.attn.visit(&join(prefix, "attn"), f);
        self.ln_2.visit(&join(prefix, "ln_2"), f);
        self.mlp.visit(&join(prefix, "mlp"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.ln_1.visit_mut(&join(prefix, "ln_1"), f);
        self.attn.visit_mut(&join(prefix, "attn"), f);
        self.ln_2.visit_mut(&join(prefix, "ln_2"), f);
        self.mlp.visit_mut(&join(prefix, "mlp"), f);
    }
}

impl Parameters for BlockGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.ln_1.visit(&join(prefix, "ln_1"), f);
        self.attn.visit(&join(prefix, "attn"), f);
        self.ln_2.visit(&join(prefix, "ln_2"), f);
        self.mlp.visit(&join(prefix, "mlp"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.ln_1.visit_mut(&join(prefix, "ln_1"), f);
        self.attn.visit_mut(&join(prefix, "attn"), f);
        self.ln_2.visit_mut(&join(prefix, "ln_2"), f);
        self.mlp.visit_mut(&join(prefix, "mlp"), f);
    }
}
