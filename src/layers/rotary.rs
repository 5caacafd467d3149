//! Rotary Position Embedding
//!
//! Queries and keys are rotated by an angle proportional to their absolute
//! position, so the dot product between a query and a key depends on where
//! both sit in the sequence without any additive position vector.
//!
//! ## Tables
//!
//! ```text
//! inv_freq[i]  = 1 / 10000^(2i / head_dim)          i in 0..head_dim/2
//! angle[p, i]  = p * inv_freq[i]                    p = offset .. offset+len
//! emb          = concat(angle, angle)               [len, head_dim]
//! cos, sin     = cos(emb), sin(emb)
//! ```
//!
//! `offset` is the number of positions already held in the KV cache, so an
//! incremental step rotates its single query and key exactly as the same
//! position would be rotated in a full forward pass.
//!
//! ## rotate_half
//!
//! ```text
//! a = x[0::2], b = x[1::2]
//! rotate_half(x) = concat(-b, a)
//! ```
//!
//! ## Combination
//!
//! [`RotaryForm::Literal`] keeps the two partial sums
//! `(x*cos - rh(x)*sin) + (x*sin + rh(x)*cos)`. [`RotaryForm::Standard`]
//! is `x*cos + rh(x)*sin`. Both are linear in `x`:
//!
//! ```text
//! y = A ⊙ x + B ⊙ rh(x)
//! Literal:  A = cos + sin,  B = cos - sin
//! Standard: A = cos,        B = sin
//! ```
//!
//! so the backward pass is `A ⊙ g + rhᵀ(B ⊙ g)` with
//! `rhᵀ(u)[2j] = u[half + j]` and `rhᵀ(u)[2j + 1] = -u[j]`.

use crate::config::RotaryForm;
use crate::tensor::Tensor;
use rayon::prelude::*;

const ROPE_BASE: f32 = 10000.0;

/// Precomputed inverse frequencies for one head dimension.
#[derive(Clone, Debug)]
pub struct RotaryEncoder {
    pub head_dim: usize,
    pub form: RotaryForm,
    inv_freq: Vec<f32>,
}

/// cos/sin rows for a contiguous range of positions, each `[len, head_dim]`.
#[derive(Clone, Debug)]
pub struct RotaryTables {
    pub offset: usize,
    pub len: usize,
    pub cos: Vec<f32>,
    pub sin: Vec<f32>,
}

impl RotaryEncoder {
    /// # Panics
    ///
    /// Panics on an odd `head_dim`; config validation rejects those first.
    pub fn new(head_dim: usize, form: RotaryForm) -> Self {
        assert!(head_dim % 2 == 0, "rotary head_dim must be even");
        let inv_freq = (0..head_dim / 2)
            .map(|i| 1.0 / ROPE_BASE.powf((2 * i) as f32 / head_dim as f32))
            .collect();
        Self {
            head_dim,
            form,
            inv_freq,
        }
    }

    pub fn inv_freq(&self) -> &[f32] {
        &self.inv_freq
    }

    /// Tables for absolute positions `offset .. offset + len`.
    pub fn tables(&self, offset: usize, len: usize) -> RotaryTables {
        let d = self.head_dim;
        let half = d / 2;
        let mut cos = vec![0.0; len * d];
        let mut sin = vec![0.0; len * d];
        for p in 0..len {
            let pos = (offset + p) as f32;
            for (i, &f) in self.inv_freq.iter().enumerate() {
                let angle = pos * f;
                let (s, c) = angle.sin_cos();
                cos[p * d + i] = c;
                cos[p * d + half + i] = c;
                sin[p * d + i] = s;
                sin[p * d + half + i] = s;
            }
        }
        RotaryTables {
            offset,
            len,
            cos,
            sin,
        }
    }

    /// Rotate `x` shaped `[B, H, T, head_dim]` where `T == tables.len`.
    pub fn apply(&self, x: &Tensor, tables: &RotaryTables) -> Tensor {
        let d = self.head_dim;
        assert_eq!(x.last_dim(), d, "rotary width mismatch");
        let t_len = tables.len;
        let mut out = vec![0.0; x.numel()];

        out.par_chunks_mut(d)
            .zip(x.data.par_chunks(d))
            .enumerate()
            .for_each(|(row, (y, xr))| {
                let t = row % t_len;
                let cos = &tables.cos[t * d..(t + 1) * d];
                let sin = &tables.sin[t * d..(t + 1) * d];
                let mut rh = vec![0.0; d];
                rotate_half(xr, &mut rh);
                match self.form {
                    RotaryForm::Literal => {
                        for j in 0..d {
                            let first = xr[j] * cos[j] - rh[j] * sin[j];
                            let second = xr[j] * sin[j] + rh[j] * cos[j];
                            y[j] = first + second;
                        }
                    }
                    RotaryForm::Standard => {
                        for j in 0..d {
                            y[j] = xr[j] * cos[j] + rh[j] * sin[j];
                        }
                    }
                }
            });

        Tensor::new(out, x.shape.clone())
    }

    /// Gradient of [`RotaryEncoder::apply`] w.r.t. its input.
    pub fn apply_backward(&self, grad: &Tensor, tables: &RotaryTables) -> Tensor {
        let d = self.head_dim;
        let half = d / 2;
        let t_len = tables.len;
        let mut out = vec![0.0; grad.numel()];

        out.par_chunks_mut(d)
            .zip(grad.data.par_chunks(d))
            .enumerate()
            .for_each(|(row, (dx, g))| {
                let t = row % t_len;
                let cos = &tables.cos[t * d..(t + 1) * d];
                let sin = &tables.sin[t * d..(t + 1) * d];
                let (a, b): (Vec<f32>, Vec<f32>) = match self.form {
                    RotaryForm::Literal => (0..d)
                        .map(|j| (cos[j] + sin[j], cos[j] - sin[j]))
                        .unzip(),
                    RotaryForm::Standard => (cos.to_vec(), sin.to_vec()),
                };
                for j in 0..d {
                    dx[j] = a[j] * g[j];
                }
                for j in 0..half {
                    dx[2 * j] += b[half + j] * g[half + j];
                    dx[2 * j + 1] -= b[j] * g[j];
                }
            });

        Tensor::new(out, grad.shape.clone())
    }
}

/// `concat(-x[1::2], x[0::2])` for one vector.
pub fn rotate_half(x: &[f32], out: &mut [f32]) {
    let half = x.len() / 2;
    for j in 0..half {
        out[j] = -x[2 * j + 1];
        out[half + j] = x[2 * j];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotate_half_layout() {
        let mut out = [0.0; 4];
        rotate_half(&[1.0, 2.0, 3.0, 4.0], &mut out);
        assert_eq!(out, [-2.0, -4.0, 1.0, 3.0]);
    }

    #[test]
    fn position_zero_literal_is_x_plus_rotate_half() {
        // cos = 1, sin = 0 at position 0
        let enc = RotaryEncoder::new(4, RotaryForm::Literal);
        let x = Tensor::new(vec![1.0, 2.0, 3.0, 4.0], vec![1, 1, 1, 4]);
        let y = enc.apply(&x, &enc.tables(0, 1));
        assert_eq!(y.data, vec![-1.0, -2.0, 4.0, 7.0]);

        let standard = RotaryEncoder::new(4, RotaryForm::Standard);
        let y = standard.apply(&x, &standard.tables(0, 1));
        assert_eq!(y.data, x.data);
    }

    #[test]
    fn offset_tables_match_slice_of_full_tables() {
        let enc = RotaryEncoder::new(8, RotaryForm::Literal);
        let full = enc.tables(0, 10);
        let tail = enc.tables(7, 3);
        assert_eq!(&full.cos[7 * 8..], &tail.cos[..]);
        assert_eq!(&full.sin[7 * 8..], &tail.sin[..]);
    }

    #[test]
    fn backward_is_the_transpose() {
        // <apply(x), g> == <x, apply_backward(g)> for a linear map
        for form in [RotaryForm::Literal, RotaryForm::Standard] {
            let enc = RotaryEncoder::new(6, form);
            let tables = enc.tables(3, 2);
            let x = Tensor::new((0..12).map(|i| (i as f32 * 0.37).sin()).collect(), vec![1, 1, 2, 6]);
            let g = Tensor::new((0..12).map(|i| (i as f32 * 0.91).cos()).collect(), vec![1, 1, 2, 6]);
            let y = enc.apply(&x, &tables);
            let dx = enc.apply_backward(&g, &tables);
            let lhs: f32 = y.data.iter().zip(&g.data).map(|(a, b)| a * b).sum();
            let rhs: f32 = x.data.iter().zip(&dx.data).map(|(a, b)| a * b).sum();
            assert!((lhs - rhs).abs() <= 1e-4);
        }
    }
}
