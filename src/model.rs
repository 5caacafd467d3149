//! Language Model
//!
//! Decoder-only transformer over token ids:
//!
//! ```text
//! idx [B, T]
//!   -> wte[idx] (+ wpe[past..past+T])        [B, T, C]
//!   -> n_layer x TransformerBlock            [B, T, C]
//!   -> ln_f                                  [B, T, C]
//!   -> h @ wteᵀ                              [B, T, V]
//! ```
//!
//! ## Weight tying
//!
//! There is no separate output matrix. The token embedding `wte` doubles as
//! the language-model head, so the model holds exactly one `[V, C]` tensor
//! for both roles and its gradient is the sum of two contributions:
//!
//! ```text
//! grad_wte = scatter_add(grad_x at each input id)   (embedding lookup)
//!          + grad_logitsᵀ @ h                        (output projection)
//! ```
//!
//! ## Three forward paths
//!
//! - [`LanguageModel::forward`]: inference/eval, no caches kept, optional loss
//! - [`LanguageModel::forward_train`]: keeps every activation for
//!   [`LanguageModel::backward`]
//! - [`LanguageModel::forward_cached`]: incremental decoding against a
//!   caller-owned [`KvCache`]
//!
//! All three compute identical arithmetic in the same order, which is what
//! makes cached logits match full re-forwards.

use crate::config::ModelConfig;
use crate::error::{ArcaneError, Result};
use crate::kv_cache::KvCache;
use crate::layers::linear::INIT_STD;
use crate::layers::{
    join, BlockCache, BlockGradients, LayerNorm, LayerNormCache, LayerNormGradients, Parameters,
    TransformerBlock,
};
use crate::optimizer::{AdamW, ParamGroup};
use crate::tensor::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct LanguageModel {
    pub config: ModelConfig,
    /// `[vocab_size, n_embd]`, shared by the embedding and the output head
    wte: Tensor,
    /// `[block_size, n_embd]`, present when `learned_positions` is set
    wpe: Option<Tensor>,
    pub blocks: Vec<TransformerBlock>,
    pub ln_f: LayerNorm,
    training: bool,
}

/// Result of the uncached forward pass.
#[derive(Clone, Debug)]
pub struct ModelOutput {
    /// `[batch, seq, vocab_size]`
    pub logits: Tensor,
    /// Mean token cross-entropy, `None` when no targets were given
    pub loss: Option<f32>,
}

impl LanguageModel {
    /// Build and initialize a model.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] if the config fails validation.
    pub fn new(config: &ModelConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        let blocks = (0..config.n_layer)
            .map(|_| TransformerBlock::new(config))
            .collect::<Result<Vec<_>>>()?;

        let mut model = Self {
            config: config.clone(),
            wte: Tensor::zeros(vec![config.vocab_size, config.n_embd]),
            wpe: config
                .learned_positions
                .then(|| Tensor::zeros(vec![config.block_size, config.n_embd])),
            blocks,
            ln_f: LayerNorm::new(config.n_embd),
            training: true,
        };
        model.init_weights(&mut StdRng::seed_from_u64(seed))?;

        info!(
            "number of parameters: {:.2}M",
            model.num_parameters() as f64 / 1e6
        );
        Ok(model)
    }

    /// Re-draw every parameter.
    ///
    /// Linear weights and embeddings get `N(0, 0.02)`, residual projections
    /// the depth-scaled std, biases zero, LayerNorm scale one and shift zero.
    pub fn init_weights<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Result<()> {
        let n_layer = self.config.n_layer;
        self.wte = Tensor::randn(self.wte.shape.clone(), INIT_STD, rng)?;
        if let Some(wpe) = self.wpe.as_mut() {
            *wpe = Tensor::randn(wpe.shape.clone(), INIT_STD, rng)?;
        }
        for block in &mut self.blocks {
            block.attn.qkv.init(n_layer, rng)?;
            block.attn.proj.init(n_layer, rng)?;
            block.mlp.fc.init(n_layer, rng)?;
            block.mlp.proj.init(n_layer, rng)?;
            for ln in [&mut block.ln_1, &mut block.ln_2] {
                reset_layer_norm(ln);
            }
        }
        reset_layer_norm(&mut self.ln_f);
        Ok(())
    }

    /// Token embedding table.
    pub fn token_embedding(&self) -> &Tensor {
        &self.wte
    }

    /// Output projection. Always the same tensor as [`Self::token_embedding`].
    pub fn lm_head(&self) -> &Tensor {
        &self.wte
    }

    pub fn position_embedding(&self) -> Option<&Tensor> {
        self.wpe.as_ref()
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    /// Switch dropout on (training) or off (evaluation and generation).
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
        for block in &mut self.blocks {
            block.mlp.dropout.training = training;
        }
    }

    /// Trainable scalars. The tied matrix is counted once.
    pub fn num_parameters(&self) -> usize {
        self.tensors().iter().map(|t| t.numel()).sum()
    }

    /// Uncached forward pass with optional loss.
    ///
    /// # Arguments
    ///
    /// * `idx` - `[batch][seq]` token ids, rectangular, `seq <= block_size`
    /// * `targets` - Next-token ids with the same shape as `idx`
    pub fn forward(&self, idx: &[Vec<usize>], targets: Option<&[Vec<usize>]>) -> Result<ModelOutput> {
        let mut x = self.embed(idx, 0)?;
        for block in &self.blocks {
            x = block.forward(&x, None)?;
        }
        let (h, _) = self.ln_f.forward(&x);
        let logits = self.head(&h);

        let loss = match targets {
            Some(targets) => Some(cross_entropy(&logits, targets)?),
            None => None,
        };
        Ok(ModelOutput { logits, loss })
    }

    /// Forward pass that keeps every activation needed by [`Self::backward`].
    pub fn forward_train(&self, idx: &[Vec<usize>]) -> Result<(Tensor, ModelCache)> {
        let mut x = self.embed(idx, 0)?;
        let mut block_caches = Vec::with_capacity(self.blocks.len());
        for block in &self.blocks {
            let (y, cache) = block.forward_train(&x)?;
            block_caches.push(cache);
            x = y;
        }
        let (h, ln_f_cache) = self.ln_f.forward(&x);
        let logits = self.head(&h);

        let cache = ModelCache {
            tokens: idx.iter().flatten().copied().collect(),
            batch: idx.len(),
            seq: idx[0].len(),
            blocks: block_caches,
            ln_f_cache,
            hidden: h,
        };
        Ok((logits, cache))
    }

    /// Mean cross-entropy and its gradient w.r.t. the logits.
    pub fn loss_and_grad(&self, logits: &Tensor, targets: &[Vec<usize>]) -> Result<(f32, Tensor)> {
        let flat = flatten_targets(logits, targets)?;
        let vocab = logits.last_dim();
        let n = flat.len() as f32;

        let mut grad = logits.data.clone();
        let losses: Vec<f32> = grad
            .par_chunks_mut(vocab)
            .zip(flat.par_iter())
            .map(|(row, &target)| {
                let loss = row_loss(row, target);
                crate::tensor::softmax_in_place(row);
                row[target] -= 1.0;
                for g in row.iter_mut() {
                    *g /= n;
                }
                loss
            })
            .collect();

        let loss = losses.iter().sum::<f32>() / n;
        Ok((loss, Tensor::new(grad, logits.shape.clone())))
    }

    /// Backward pass from `grad_logits` (as returned by
    /// [`Self::loss_and_grad`]) to every parameter.
    pub fn backward(&self, grad_logits: &Tensor, cache: &ModelCache) -> ModelGradients {
        let c = self.config.n_embd;
        let vocab = self.config.vocab_size;
        let rows = cache.batch * cache.seq;

        // output head: logits = h @ wteᵀ
        let g2 = grad_logits.reshape(&[rows, vocab]);
        let h2 = cache.hidden.reshape(&[rows, c]);
        let mut wte = g2.t().matmul(&h2);
        let grad_h = g2.matmul(&self.wte).into_shape(&[cache.batch, cache.seq, c]);

        let ln_f = self.ln_f.backward(&grad_h, &cache.ln_f_cache);
        let mut grad_x = ln_f.x.clone();

        let mut blocks = Vec::with_capacity(self.blocks.len());
        for (block, block_cache) in self.blocks.iter().zip(&cache.blocks).rev() {
            let grads = block.backward(&grad_x, block_cache);
            grad_x = grads.x.clone();
            blocks.push(grads);
        }
        blocks.reverse();

        // embedding lookups: scatter-add into the shared table
        let mut wpe = self.wpe.as_ref().map(|w| Tensor::zeros(w.shape.clone()));
        for (i, &id) in cache.tokens.iter().enumerate() {
            let g = &grad_x.data[i * c..(i + 1) * c];
            for (w, &v) in wte.data[id * c..(id + 1) * c].iter_mut().zip(g) {
                *w += v;
            }
            if let Some(wpe) = wpe.as_mut() {
                let pos = i % cache.seq;
                for (w, &v) in wpe.data[pos * c..(pos + 1) * c].iter_mut().zip(g) {
                    *w += v;
                }
            }
        }

        ModelGradients {
            wte,
            wpe,
            blocks,
            ln_f,
        }
    }

    /// Incremental forward against a session cache.
    ///
    /// `idx` holds only the positions the cache has not seen yet. Positions
    /// continue from `kv.seq_len()` for both rotary and learned embeddings.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::SequenceTooLong`] once cached plus new positions exceed
    /// `block_size`.
    pub fn forward_cached(&self, idx: &[Vec<usize>], kv: &mut KvCache) -> Result<Tensor> {
        if kv.n_layers() != self.blocks.len() {
            return Err(ArcaneError::ShapeMismatch(format!(
                "cache has {} layers, model has {}",
                kv.n_layers(),
                self.blocks.len()
            )));
        }
        let past = kv.seq_len();
        let mut x = self.embed(idx, past)?;
        for (block, layer) in self.blocks.iter().zip(kv.layers_mut()) {
            x = block.forward(&x, Some(layer))?;
        }
        let (h, _) = self.ln_f.forward(&x);
        debug!(past, new = idx[0].len(), "cached forward");
        Ok(self.head(&h))
    }

    /// Optimizer with a decayed group (matrices and embeddings) and an
    /// undecayed group (biases and norm parameters).
    pub fn configure_optimizer(&self, weight_decay: f32, betas: (f32, f32)) -> AdamW {
        let mut decay = Vec::new();
        let mut no_decay = Vec::new();
        let (mut n_decay, mut n_no_decay) = (0usize, 0usize);
        self.visit("", &mut |name, t| {
            if t.ndim() >= 2 {
                n_decay += t.numel();
                decay.push(name);
            } else {
                n_no_decay += t.numel();
                no_decay.push(name);
            }
        });
        info!(
            "num decayed parameter tensors: {}, with {} parameters",
            decay.len(),
            n_decay
        );
        info!(
            "num non-decayed parameter tensors: {}, with {} parameters",
            no_decay.len(),
            n_no_decay
        );

        AdamW::new(
            self,
            vec![
                ParamGroup::new(decay, weight_decay),
                ParamGroup::new(no_decay, 0.0),
            ],
            betas,
        )
    }

    /// Check the batch and gather `wte[idx] + wpe[offset + t]`.
    fn embed(&self, idx: &[Vec<usize>], offset: usize) -> Result<Tensor> {
        let (batch, seq) = self.check_tokens(idx)?;
        if offset + seq > self.config.block_size {
            return Err(ArcaneError::SequenceTooLong {
                len: offset + seq,
                max: self.config.block_size,
            });
        }

        let c = self.config.n_embd;
        let mut data = Vec::with_capacity(batch * seq * c);
        for row in idx {
            for (t, &id) in row.iter().enumerate() {
                let start = data.len();
                data.extend_from_slice(&self.wte.data[id * c..(id + 1) * c]);
                if let Some(wpe) = &self.wpe {
                    let pos = offset + t;
                    for (d, &p) in data[start..].iter_mut().zip(&wpe.data[pos * c..(pos + 1) * c]) {
                        *d += p;
                    }
                }
            }
        }
        Ok(Tensor::new(data, vec![batch, seq, c]))
    }

    fn check_tokens(&self, idx: &[Vec<usize>]) -> Result<(usize, usize)> {
        let seq = match idx.first() {
            Some(row) if !row.is_empty() => row.len(),
            _ => return Err(ArcaneError::ShapeMismatch("empty token batch".into())),
        };
        if let Some(row) = idx.iter().find(|row| row.len() != seq) {
            return Err(ArcaneError::ShapeMismatch(format!(
                "ragged batch: rows of length {seq} and {}",
                row.len()
            )));
        }
        let vocab_size = self.config.vocab_size;
        if let Some(&id) = idx.iter().flatten().find(|&&id| id >= vocab_size) {
            return Err(ArcaneError::TokenOutOfRange { id, vocab_size });
        }
        Ok((idx.len(), seq))
    }

    /// `[B, T, C] -> [B, T, V]` through the tied matrix.
    fn head(&self, h: &Tensor) -> Tensor {
        let (b, t, c) = (h.shape[0], h.shape[1], h.shape[2]);
        h.reshape(&[b * t, c])
            .matmul_t(&self.wte)
            .into_shape(&[b, t, self.config.vocab_size])
    }
}

fn reset_layer_norm(ln: &mut LayerNorm) {
    ln.gamma.data.fill(1.0);
    ln.beta.data.fill(0.0);
}

/// Mean next-token cross-entropy over `[B, T, V]` logits.
pub fn cross_entropy(logits: &Tensor, targets: &[Vec<usize>]) -> Result<f32> {
    let flat = flatten_targets(logits, targets)?;
    let vocab = logits.last_dim();
    let total: f32 = logits
        .data
        .par_chunks(vocab)
        .zip(flat.par_iter())
        .map(|(row, &target)| row_loss(row, target))
        .sum();
    Ok(total / flat.len() as f32)
}

/// `logsumexp(row) - row[target]`
fn row_loss(row: &[f32], target: usize) -> f32 {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let sum: f32 = row.iter().map(|&x| (x - max).exp()).sum();
    max + sum.ln() - row[target]
}

fn flatten_targets(logits: &Tensor, targets: &[Vec<usize>]) -> Result<Vec<usize>> {
    let vocab = logits.last_dim();
    let rows = logits.numel() / vocab;
    let flat: Vec<usize> = targets.iter().flatten().copied().collect();
    let rectangular = logits.ndim() == 3
        && targets.len() == logits.shape[0]
        && targets.iter().all(|row| row.len() == logits.shape[1]);
    if !rectangular || flat.len() != rows {
        return Err(ArcaneError::ShapeMismatch(format!(
            "targets do not match logits {:?}",
            logits.shape
        )));
    }
    if let Some(&id) = flat.iter().find(|&&id| id >= vocab) {
        return Err(ArcaneError::TokenOutOfRange { id, vocab_size: vocab });
    }
    Ok(flat)
}

/// Activations saved by [`LanguageModel::forward_train`].
#[derive(Clone, Debug)]
pub struct ModelCache {
    tokens: Vec<usize>,
    batch: usize,
    seq: usize,
    blocks: Vec<BlockCache>,
    ln_f_cache: LayerNormCache,
    /// `ln_f` output, the input of the tied head
    hidden: Tensor,
}

/// Gradients for every parameter, in the model's visiting order.
#[derive(Clone, Debug)]
pub struct ModelGradients {
    pub wte: Tensor,
    pub wpe: Option<Tensor>,
    pub blocks: Vec<BlockGradients>,
    pub ln_f: LayerNormGradients,
}

impl Parameters for LanguageModel {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "wte.weight"), &self.wte);
        if let Some(wpe) = &self.wpe {
            f(join(prefix, "wpe.weight"), wpe);
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&join(prefix, &format!("blocks.{i}")), f);
        }
        self.ln_f.visit(&join(prefix, "ln_f"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "wte.weight"), &mut self.wte);
        if let Some(wpe) = &mut self.wpe {
            f(join(prefix, "wpe.weight"), wpe);
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_mut(&join(prefix, &format!("blocks.{i}")), f);
        }
        self.ln_f.visit_mut(&join(prefix, "ln_f"), f);
    }
}

impl Parameters for ModelGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        f(join(prefix, "wte.weight"), &self.wte);
        if let Some(wpe) = &self.wpe {
            f(join(prefix, "wpe.weight"), wpe);
        }
        for (i, block) in self.blocks.iter().enumerate() {
            block.visit(&join(prefix, &format!("blocks.{i}")), f);
        }
        self.ln_f.visit(&join(prefix, "ln_f"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        f(join(prefix, "wte.weight"), &mut self.wte);
        if let Some(wpe) = &mut self.wpe {
            f(join(prefix, "wpe.weight"), wpe);
        }
        for (i, block) in self.blocks.iter_mut().enumerate() {
            block.visit_mut(&join(prefix, &format!("blocks.{i}")), f);
        }
        self.ln_f.visit_mut(&join(prefix, "ln_f"), f);
    }
}
