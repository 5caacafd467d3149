//! Causal Multi-Head Self-Attention
//!
//! ## Forward
//!
//! ```text
//! qkv      = x @ W_qkv + b            [B, T, 3C]
//! q, k, v  = split(qkv)               [B, H, T, D] each, D = C / H
//! q, k     = rope(q), rope(k)         positions past .. past+T
//! k, v     = concat(cache, k/v)       [B, H, S, D], S = past + T
//! scores   = q @ kᵀ / √D              [B, H, T, S]
//! scores   masked where j > past + i
//! y        = softmax(scores) @ v      [B, H, T, D]
//! out      = merge(y) @ W_proj + b    [B, T, C]
//! ```
//!
//! Without a cache `past = 0` and the mask is the usual lower triangle. With
//! a cache every new query sees all cached positions plus the new positions
//! up to its own. Keys are rotated before they are cached, so cached keys
//! never need re-rotation.
//!
//! ## Backward
//!
//! Only the uncached path is differentiated (training never decodes
//! incrementally). Per (batch, head):
//!
//! ```text
//! dP   = dY @ vᵀ
//! dv   = Pᵀ @ dY
//! dS   = P ⊙ (dP - rowsum(P ⊙ dP))
//! dq   = dS @ k / √D
//! dk   = dSᵀ @ q / √D
//! ```
//!
//! followed by the transpose of the rotary map on `dq` and `dk`.

use super::linear::{Linear, LinearCache, LinearGradients};
use super::rotary::{RotaryEncoder, RotaryTables};
use super::{join, Parameters};
use crate::config::ModelConfig;
use crate::error::{ArcaneError, Result};
use crate::kv_cache::LayerKvCache;
use crate::tensor::Tensor;
use rayon::prelude::*;

/// Multi-head causal self-attention with a fused QKV projection.
#[derive(Clone, Debug)]
pub struct CausalAttention {
    /// `C -> 3C`, producing queries, keys and values
    pub qkv: Linear,
    /// `C -> C`, writes into the residual stream
    pub proj: Linear,
    pub n_head: usize,
    pub head_dim: usize,
    pub block_size: usize,
    pub rotary: Option<RotaryEncoder>,
}

impl CausalAttention {
    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] when `n_embd` does not split evenly
    /// into heads (or rotary gets an odd head size).
    pub fn new(config: &ModelConfig) -> Result<Self> {
        config.validate()?;
        let c = config.n_embd;
        let head_dim = config.head_dim();
        Ok(Self {
            qkv: Linear::new(c, 3 * c, config.bias, false),
            proj: Linear::new(c, c, config.bias, true),
            n_head: config.n_head,
            head_dim,
            block_size: config.block_size,
            rotary: config
                .rotary
                .then(|| RotaryEncoder::new(head_dim, config.rotary_form)),
        })
    }

    fn n_embd(&self) -> usize {
        self.n_head * self.head_dim
    }

    fn check_len(&self, past: usize, t: usize) -> Result<()> {
        if past + t > self.block_size {
            return Err(ArcaneError::SequenceTooLong {
                len: past + t,
                max: self.block_size,
            });
        }
        Ok(())
    }

    fn scale(&self) -> f32 {
        1.0 / (self.head_dim as f32).sqrt()
    }

    /// Project, split heads and rotate. Returns `(q, k, v, tables)`.
    fn project(
        &self,
        qkv_out: &Tensor,
        past: usize,
    ) -> (Tensor, Tensor, Tensor, Option<RotaryTables>) {
        let (b, t) = (qkv_out.shape[0], qkv_out.shape[1]);
        let (q, k, v) = split_heads(qkv_out, b, t, self.n_head, self.head_dim);
        match &self.rotary {
            Some(rope) => {
                let tables = rope.tables(past, t);
                let q = rope.apply(&q, &tables);
                let k = rope.apply(&k, &tables);
                (q, k, v, Some(tables))
            }
            None => (q, k, v, None),
        }
    }

    /// Inference forward over `x: [B, T, C]`.
    ///
    /// With `Some(cache)`, attends over the cached positions as well and
    /// appends this call's keys and values to the cache.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::SequenceTooLong`] when cached plus new positions exceed
    /// the context length.
    pub fn forward(&self, x: &Tensor, kv: Option<&mut LayerKvCache>) -> Result<Tensor> {
        let (b, t) = (x.shape[0], x.shape[1]);
        let past = kv.as_ref().map(|c| c.seq_len()).unwrap_or(0);
        self.check_len(past, t)?;

        let qkv_out = self.qkv.apply(x);
        let (q, k, v, _) = self.project(&qkv_out, past);

        let (y, _) = match kv {
            Some(cache) => {
                let (keys, values) = cache.append(k, v);
                attend(&q, keys, values, past, self.scale())
            }
            None => attend(&q, &k, &v, 0, self.scale()),
        };

        let merged = merge_heads(&y, b, t, self.n_head, self.head_dim);
        Ok(self.proj.apply(&merged))
    }

    /// Training forward (no cache), keeping everything backward needs.
    pub fn forward_train(&self, x: &Tensor) -> Result<(Tensor, AttentionCache)> {
        let (b, t) = (x.shape[0], x.shape[1]);
        self.check_len(0, t)?;

        let (qkv_out, qkv_cache) = self.qkv.forward(x);
        let (q, k, v, tables) = self.project(&qkv_out, 0);
        let (y, probs) = attend(&q, &k, &v, 0, self.scale());
        let merged = merge_heads(&y, b, t, self.n_head, self.head_dim);
        let (out, proj_cache) = self.proj.forward(&merged);

        Ok((
            out,
            AttentionCache {
                qkv_cache,
                proj_cache,
                q,
                k,
                v,
                probs,
                tables,
            },
        ))
    }

    pub fn backward(&self, grad_out: &Tensor, cache: &AttentionCache) -> AttentionGradients {
        let (b, t) = (grad_out.shape[0], grad_out.shape[1]);
        let (h, d) = (self.n_head, self.head_dim);

        let proj = self.proj.backward(grad_out, &cache.proj_cache);
        let grad_y = split_single(&proj.x, b, t, h, d);

        let (dq, dk, dv) = attend_backward(
            &grad_y,
            &cache.q,
            &cache.k,
            &cache.v,
            &cache.probs,
            self.scale(),
        );

        let (dq, dk) = match (&self.rotary, &cache.tables) {
            (Some(rope), Some(tables)) => (
                rope.apply_backward(&dq, tables),
                rope.apply_backward(&dk, tables),
            ),
            _ => (dq, dk),
        };

        let grad_qkv = merge_qkv(&dq, &dk, &dv, b, t, h, d);
        let qkv = self.qkv.backward(&grad_qkv, &cache.qkv_cache);

        let x = qkv.x.clone();
        debug_assert_eq!(x.shape, vec![b, t, self.n_embd()]);

        AttentionGradients { qkv, proj, x }
    }
}

/// Values saved by [`CausalAttention::forward_train`].
#[derive(Clone, Debug)]
pub struct AttentionCache {
    pub qkv_cache: LinearCache,
    pub proj_cache: LinearCache,
    /// Rotated queries `[B, H, T, D]`
    pub q: Tensor,
    /// Rotated keys `[B, H, T, D]`
    pub k: Tensor,
    pub v: Tensor,
    /// Attention probabilities `[B, H, T, T]`
    pub probs: Tensor,
    pub tables: Option<RotaryTables>,
}

#[derive(Clone, Debug)]
pub struct AttentionGradients {
    pub qkv: LinearGradients,
    pub proj: LinearGradients,
    pub x: Tensor,
}

impl Parameters for CausalAttention {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.qkv.visit(&join(prefix, "qkv"), f);
        self.proj.visit(&join(prefix, "proj"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.qkv.visit_mut(&join(prefix, "qkv"), f);
        self.proj.visit_mut(&join(prefix, "proj"), f);
    }
}

impl Parameters for AttentionGradients {
    fn visit<'a>(&'a self, prefix: &str, f: &mut dyn FnMut(String, &'a Tensor)) {
        self.qkv.visit(&join(prefix, "qkv"), f);
        self.proj.visit(&join(prefix, "proj"), f);
    }

    fn visit_mut<'a>(&'a mut self, prefix: &str, f: &mut dyn FnMut(String, &'a mut Tensor)) {
        self.qkv.visit_mut(&join(prefix, "qkv"), f);
        self.proj.visit_mut(&join(prefix, "proj"), f);
    }
}

/// `[B, T, 3C]` into three `[B, H, T, D]` tensors.
fn split_heads(qkv: &Tensor, b: usize, t: usize, h: usize, d: usize) -> (Tensor, Tensor, Tensor) {
    let c = h * d;
    let mut out = [
        vec![0.0; b * h * t * d],
        vec![0.0; b * h * t * d],
        vec![0.0; b * h * t * d],
    ];
    for bi in 0..b {
        for ti in 0..t {
            let row = &qkv.data[(bi * t + ti) * 3 * c..(bi * t + ti + 1) * 3 * c];
            for (part, buf) in out.iter_mut().enumerate() {
                for hi in 0..h {
                    let dst = ((bi * h + hi) * t + ti) * d;
                    let src = part * c + hi * d;
                    buf[dst..dst + d].copy_from_slice(&row[src..src + d]);
                }
            }
        }
    }
    let [q, k, v] = out;
    let shape = vec![b, h, t, d];
    (
        Tensor::new(q, shape.clone()),
        Tensor::new(k, shape.clone()),
        Tensor::new(v, shape),
    )
}

/// `[B, T, C]` into `[B, H, T, D]`.
fn split_single(x: &Tensor, b: usize, t: usize, h: usize, d: usize) -> Tensor {
    let c = h * d;
    let mut out = vec![0.0; b * h * t * d];
    for bi in 0..b {
        for ti in 0..t {
            for hi in 0..h {
                let dst = ((bi * h + hi) * t + ti) * d;
                let src = (bi * t + ti) * c + hi * d;
                out[dst..dst + d].copy_from_slice(&x.data[src..src + d]);
            }
        }
    }
    Tensor::new(out, vec![b, h, t, d])
}

/// `[B, H, T, D]` into `[B, T, C]`.
fn merge_heads(y: &Tensor, b: usize, t: usize, h: usize, d: usize) -> Tensor {
    let c = h * d;
    let mut out = vec![0.0; b * t * c];
    for bi in 0..b {
        for hi in 0..h {
            for ti in 0..t {
                let src = ((bi * h + hi) * t + ti) * d;
                let dst = (bi * t + ti) * c + hi * d;
                out[dst..dst + d].copy_from_slice(&y.data[src..src + d]);
            }
        }
    }
    Tensor::new(out, vec![b, t, c])
}

/// Inverse of [`split_heads`] for gradients.
fn merge_qkv(dq: &Tensor, dk: &Tensor, dv: &Tensor, b: usize, t: usize, h: usize, d: usize) -> Tensor {
    let c = h * d;
    let mut out = vec![0.0; b * t * 3 * c];
    for (part, src_t) in [dq, dk, dv].into_iter().enumerate() {
        for bi in 0..b {
            for hi in 0..h {
                for ti in 0..t {
                    let src = ((bi * h + hi) * t + ti) * d;
                    let dst = (bi * t + ti) * 3 * c + part * c + hi * d;
                    out[dst..dst + d].copy_from_slice(&src_t.data[src..src + d]);
                }
            }
        }
    }
    Tensor::new(out, vec![b, t, 3 * c])
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Masked scaled dot-product attention.
///
/// `q: [B, H, T, D]`, `k, v: [B, H, S, D]` with `S = past + T`. Query `i`
/// sees keys `0 ..= past + i`. Returns the attended values `[B, H, T, D]`
/// and the probabilities `[B, H, T, S]` (exact zeros where masked).
fn attend(q: &Tensor, k: &Tensor, v: &Tensor, past: usize, scale: f32) -> (Tensor, Tensor) {
    let (b, h, t, d) = (q.shape[0], q.shape[1], q.shape[2], q.shape[3]);
    let s = k.shape[2];
    debug_assert_eq!(s, past + t);

    let mut out = vec![0.0; b * h * t * d];
    let mut probs = vec![0.0; b * h * t * s];

    out.par_chunks_mut(t * d)
        .zip(probs.par_chunks_mut(t * s))
        .enumerate()
        .for_each(|(bh, (out_bh, p_bh))| {
            let q_bh = &q.data[bh * t * d..(bh + 1) * t * d];
            let k_bh = &k.data[bh * s * d..(bh + 1) * s * d];
            let v_bh = &v.data[bh * s * d..(bh + 1) * s * d];

            for i in 0..t {
                let visible = past + i + 1;
                let qi = &q_bh[i * d..(i + 1) * d];
                let row = &mut p_bh[i * s..i * s + visible];
                for (j, p) in row.iter_mut().enumerate() {
                    *p = dot(qi, &k_bh[j * d..(j + 1) * d]) * scale;
                }
                crate::tensor::softmax_in_place(row);

                let yi = &mut out_bh[i * d..(i + 1) * d];
                for (j, &p) in row.iter().enumerate() {
                    let vj = &v_bh[j * d..(j + 1) * d];
                    for (y, &vv) in yi.iter_mut().zip(vj) {
                        *y += p * vv;
                    }
                }
            }
        });

    (
        Tensor::new(out, vec![b, h, t, d]),
        Tensor::new(probs, vec![b, h, t, s]),
    )
}

/// Gradients of [`attend`] with `past == 0`. Returns `(dq, dk, dv)`.
fn attend_backward(
    grad_y: &Tensor,
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    probs: &Tensor,
    scale: f32,
) -> (Tensor, Tensor, Tensor) {
    let (b, h, t, d) = (q.shape[0], q.shape[1], q.shape[2], q.shape[3]);
    let n = b * h * t * d;
    let mut dq = vec![0.0; n];
    let mut dk = vec![0.0; n];
    let mut dv = vec![0.0; n];

    dq.par_chunks_mut(t * d)
        .zip(dk.par_chunks_mut(t * d))
        .zip(dv.par_chunks_mut(t * d))
        .enumerate()
        .for_each(|(bh, ((dq_bh, dk_bh), dv_bh))| {
            let range = bh * t * d..(bh + 1) * t * d;
            let q_bh = &q.data[range.clone()];
            let k_bh = &k.data[range.clone()];
            let v_bh = &v.data[range.clone()];
            let g_bh = &grad_y.data[range];
            let p_bh = &probs.data[bh * t * t..(bh + 1) * t * t];

            let mut dp = vec![0.0; t];
            for i in 0..t {
                let gi = &g_bh[i * d..(i + 1) * d];
                let pi = &p_bh[i * t..i * t + i + 1];

                for j in 0..=i {
                    dp[j] = dot(gi, &v_bh[j * d..(j + 1) * d]);
                    let dvj = &mut dv_bh[j * d..(j + 1) * d];
                    for (a, &g) in dvj.iter_mut().zip(gi) {
                        *a += pi[j] * g;
                    }
                }

                let weighted: f32 = (0..=i).map(|j| pi[j] * dp[j]).sum();
                let qi = &q_bh[i * d..(i + 1) * d];
                for j in 0..=i {
                    let ds = pi[j] * (dp[j] - weighted) * scale;
                    if ds == 0.0 {
                        continue;
                    }
                    let kj = &k_bh[j * d..(j + 1) * d];
                    let dqi = &mut dq_bh[i * d..(i + 1) * d];
                    for (a, &kk) in dqi.iter_mut().zip(kj) {
                        *a += ds * kk;
                    }
                    let dkj = &mut dk_bh[j * d..(j + 1) * d];
                    for (a, &qq) in dkj.iter_mut().zip(qi) {
                        *a += ds * qq;
                    }
                }
            }
        });

    let shape = vec![b, h, t, d];
    (
        Tensor::new(dq, shape.clone()),
        Tensor::new(dk, shape.clone()),
        Tensor::new(dv, shape),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn layer(rotary: bool) -> CausalAttention {
        let config = ModelConfig {
            n_embd: 8,
            n_head: 2,
            block_size: 6,
            rotary,
            ..ModelConfig::tiny(16)
        };
        let mut attn = CausalAttention::new(&config).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        attn.qkv.init(1, &mut rng).unwrap();
        attn.proj.init(1, &mut rng).unwrap();
        // larger weights make the attention pattern non-uniform
        attn.qkv.weight.scale(20.0);
        attn.proj.weight.scale(20.0);
        attn
    }

    fn input(t: usize) -> Tensor {
        Tensor::new(
            (0..2 * t * 8).map(|i| ((i * 7 % 13) as f32 - 6.0) * 0.1).collect(),
            vec![2, t, 8],
        )
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = ModelConfig {
            n_embd: 10,
            n_head: 4,
            ..ModelConfig::tiny(16)
        };
        assert!(CausalAttention::new(&config).is_err());
    }

    #[test]
    fn too_long_input_fails() {
        let attn = layer(true);
        let err = attn.forward(&input(7), None).unwrap_err();
        assert!(matches!(err, ArcaneError::SequenceTooLong { len: 7, max: 6 }));
    }

    #[test]
    fn cache_rejects_overflow_across_calls() {
        let attn = layer(true);
        let mut cache = LayerKvCache::new();
        attn.forward(&input(4), Some(&mut cache)).unwrap();
        assert!(attn.forward(&input(3), Some(&mut cache)).is_err());
    }

    #[test]
    fn probabilities_are_causal() {
        let attn = layer(true);
        let (_, cache) = attn.forward_train(&input(5)).unwrap();
        for (row_idx, row) in cache.probs.data.chunks(5).enumerate() {
            let i = row_idx % 5;
            assert!(row[i + 1..].iter().all(|&p| p == 0.0));
            assert!((row.iter().sum::<f32>() - 1.0).abs() <= 1e-5);
        }
    }

    #[test]
    fn incremental_matches_full() {
        for rotary in [true, false] {
            let attn = layer(rotary);
            let x = input(5);
            let full = attn.forward(&x, None).unwrap();

            let mut cache = LayerKvCache::new();
            let mut steps = Vec::new();
            // prefix of 2 then one position at a time
            let split = |from: usize, to: usize| {
                let mut data = Vec::new();
                for b in 0..2 {
                    data.extend_from_slice(&x.data[(b * 5 + from) * 8..(b * 5 + to) * 8]);
                }
                Tensor::new(data, vec![2, to - from, 8])
            };
            steps.push(attn.forward(&split(0, 2), Some(&mut cache)).unwrap());
            for pos in 2..5 {
                steps.push(attn.forward(&split(pos, pos + 1), Some(&mut cache)).unwrap());
            }
            assert_eq!(cache.seq_len(), 5);

            for b in 0..2 {
                let mut incremental = Vec::new();
                for s in &steps {
                    let t = s.shape[1];
                    incremental.extend_from_slice(&s.data[b * t * 8..(b + 1) * t * 8]);
                }
                let reference = &full.data[b * 40..(b + 1) * 40];
                for (a, r) in incremental.iter().zip(reference) {
                    assert!((a - r).abs() <= 1e-4);
                }
            }
        }
    }

    #[test]
    fn backward_matches_finite_differences() {
        let attn = layer(true);
        let x = input(4);
        let weights: Vec<f32> = (0..x.numel()).map(|i| ((i % 5) as f32 - 2.0) * 0.3).collect();
        let objective = |a: &CausalAttention, x: &Tensor| -> f32 {
            let y = a.forward(x, None).unwrap();
            y.data.iter().zip(&weights).map(|(p, w)| p * w).sum()
        };

        let (_, cache) = attn.forward_train(&x).unwrap();
        let grads = attn.backward(&Tensor::new(weights.clone(), x.shape.clone()), &cache);

        let h = 1e-2;
        for idx in [0, 5, 17, 33, 50, 63] {
            let mut plus = x.clone();
            let mut minus = x.clone();
            plus.data[idx] += h;
            minus.data[idx] -= h;
            let numeric = (objective(&attn, &plus) - objective(&attn, &minus)) / (2.0 * h);
            let analytic = grads.x.data[idx];
            assert!(
                (numeric - analytic).abs() <= 2e-2 * numeric.abs().max(1.0),
                "x[{idx}]: numeric {numeric} vs analytic {analytic}"
            );
        }

        for idx in [0, 9, 40, 100, 150, 191] {
            let mut plus = attn.clone();
            let mut minus = attn.clone();
            plus.qkv.weight.data[idx] += h;
            minus.qkv.weight.data[idx] -= h;
            let numeric = (objective(&plus, &x) - objective(&minus, &x)) / (2.0 * h);
            let analytic = grads.qkv.weight.data[idx];
            assert!(
                (numeric - analytic).abs() <= 2e-2 * numeric.abs().max(1.0),
                "w[{idx}]: numeric {numeric} vs analytic {analytic}"
            );
        }
    }
}
