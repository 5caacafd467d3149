//! Position-wise Feed-Forward Network
//!
//! ```text
//! x → fc (C → 4C) → GELU → proj (4C → C) → dropout → y
//! ```
//!
//! `proj` is tagged as a residual projection so it gets the depth-scaled
//! initialization. Dropout sits after the output projection only and is an
//! exact identity at rate 0 or in eval mode.

use super::activation::{gelu_backward, gelu_forward};
use super::dropout::{Dropout, DropoutCache};
use super::linear::{Linear, LinearCache, LinearGradients};
use super::{join, Parameters};
use crate::tensor::Tensor;

/// Hidden width multiplier.
pub const EXPANSION: usize = 4;

#[derive(Clone, Debug)]
pub struct FeedForward {
    pub fc: Linear,
    pub proj: Linear,
    pub dropout: Dropout,
}

impl FeedForward {
    pub fn new(n_embd: usize, bias: bool, dropout: f32) -> Self {
        let hidden = n_embd * EXPANSION;
        Self {
            fc: Linear::new(n_embd, hidden, bias, false),
            proj: Linear::new(hidden, n_embd, bias, true),
            dropout: Dropout::new(dropout),
        }
    }

    /// Inference forward. Honors the dropout mode like the training path.
    pub fn apply(&self, x: &Tensor) -> Tensor {
        let h = gelu_forward(&self.fc.apply(x));
        let y = self.proj.apply(&h);
        self.dropout.forward(&y).0
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, FeedForwardCache) {
        let (pre, fc_cache) = self.fc.forward(x);
        let hidden = gelu_forward(&pre);
        let (out, proj_cache) = self.proj.forward(&hidden);
        let (y, dropout_cache) = self.dropout.forward(&out);

        (
            y,
            FeedForwardCache {
                fc_cache,
                pre_activation: pre,
                proj_cache,
                dropout_cache,
            },
        )
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &FeedForwardCache) -> FeedForwardGradients {
        let grad_proj_out = self.dropout.backward(grad_out, &cache.dropout_cache);
        let proj = self.proj.backward(&grad_proj_out, &cache.proj_cache);
        let grad_pre = gelu_backward(&proj.x, &cache.pre_activation);
        let fc = self.fc.backward(&grad_pre, &cache.fc_cache);
        let x = fc.x.clone();

        FeedForwardGradients { fc, proj, x }
    }
}

#[derive(Clone, Debug)]
pub struct FeedForwardCache {
    pub fc_cache: LinearCache,
    /// Input to GELU
    pub pre_activation: Tensor,
    pub proj_cache: LinearCache,
    pub dropout_cache: DropoutCache,
}

#[derive(Clone, Debug)]
pub struct FeedForwardGradients {
    pub fc: LinearGradients,
    pub proj: LinearGradients,
    pub x: Tensor,
}

impl Parameters for FeedForward {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.fc.visit(&join(prefix, "fc"), f);
        self.proj.visit(&join(prefix, "proj"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.fc.visit_mut(&join(prefix, "fc"), f);
        self.proj.visit_mut(&join(prefix, "proj"), f);
    }
}

impl Parameters for FeedForwardGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.fc.visit(&join(prefix, "fc"), f);
        self.proj.visit(&join(prefix, "proj"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.fc.visit_mut(&join(prefix, "fc"), f);
        self.proj.visit_mut(&join(prefix, "proj"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn shapes_and_tags() {
        let ff = FeedForward::new(8, true, 0.0);
        assert_eq!(ff.fc.weight.shape, vec![8, 32]);
        assert_eq!(ff.proj.weight.shape, vec![32, 8]);
        assert!(!ff.fc.residual_projection);
        assert!(ff.proj.residual_projection);
    }

    #[test]
    fn inference_and_training_paths_agree_without_dropout() {
        let mut ff = FeedForward::new(4, true, 0.0);
        let mut rng = StdRng::seed_from_u64(5);
        ff.fc.init(2, &mut rng).unwrap();
        ff.proj.init(2, &mut rng).unwrap();
        let x = Tensor::new((0..12).map(|i| i as f32 * 0.1 - 0.5).collect(), vec![1, 3, 4]);
        assert_eq!(ff.apply(&x), ff.forward(&x).0);
    }

    #[test]
    fn parameter_names() {
        let ff = FeedForward::new(4, false, 0.0);
        let names: Vec<String> = ff.named_tensors().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["fc.weight", "proj.weight"]);
    }
}
