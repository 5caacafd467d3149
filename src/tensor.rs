//! Tensor Operations
//!
//! A deliberately small dense tensor: a flat `Vec<f32>` in row-major order
//! plus its shape. Every layer in the model is written against this type and
//! does its own index arithmetic where a generic op would obscure the math.
//!
//! ## Layout
//!
//! ```text
//! shape   [B, T, C]
//! strides [T*C, C, 1]
//! flat    data[b*T*C + t*C + c]
//! ```
//!
//! Rank-3 activations are flattened to `[B*T, C]` before a matmul, so the
//! only matmul kernel needed is 2-D.
//!
//! ## Example
//!
//! ```rust
//! use arcane::Tensor;
//!
//! let a = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
//! let b = Tensor::new(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], vec![3, 2]);
//! let c = a.matmul(&b);
//! assert_eq!(c.shape, vec![2, 2]);
//! assert_eq!(c.data, vec![4.0, 5.0, 10.0, 11.0]);
//! ```
//!
//! ## Parallelism
//!
//! Kernels use Rayon where the work is large enough to pay for it:
//!
//! - **matmul**: cache-blocked, parallel over blocks of output rows
//! - **softmax**: parallel over rows of the last axis
//! - **element-wise**: `par_iter` over the flat buffer

use crate::error::{ArcaneError, Result};
use rand::Rng;
use rand_distr::{Distribution, Normal};
use rayon::prelude::*;

/// A dense, row-major `f32` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    /// Flat storage of all elements
    pub data: Vec<f32>,
    /// Dimensions
    pub shape: Vec<usize>,
    /// Row-major strides derived from `shape`
    pub strides: Vec<usize>,
}

impl Tensor {
    /// Create a tensor from flat data and a shape.
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` is not the product of `shape`.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected,
            "data length ({}) doesn't match shape {:?} (expected {})",
            data.len(),
            shape,
            expected
        );
        let strides = Self::compute_strides(&shape);
        Self {
            data,
            shape,
            strides,
        }
    }

    /// Tensor of zeros.
    ///
    /// ```rust
    /// # use arcane::Tensor;
    /// let t = Tensor::zeros(vec![3, 4]);
    /// assert_eq!(t.numel(), 12);
    /// ```
    pub fn zeros(shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![0.0; size], shape)
    }

    /// Tensor filled with a constant.
    pub fn full(shape: Vec<usize>, value: f32) -> Self {
        let size: usize = shape.iter().product();
        Self::new(vec![value; size], shape)
    }

    /// Tensor with elements drawn from `N(0, std²)`.
    ///
    /// Fails when `std` is negative or not finite.
    pub fn randn<R: Rng + ?Sized>(shape: Vec<usize>, std: f32, rng: &mut R) -> Result<Self> {
        let normal = Normal::new(0.0f32, std)
            .map_err(|e| ArcaneError::InvalidConfig(format!("normal init std {std}: {e}")))?;
        let size: usize = shape.iter().product();
        let data = (0..size).map(|_| normal.sample(rng)).collect();
        Ok(Self::new(data, shape))
    }

    fn compute_strides(shape: &[usize]) -> Vec<usize> {
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        strides
    }

    /// Number of dimensions.
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Size of the last dimension (1 for scalars).
    pub fn last_dim(&self) -> usize {
        self.shape.last().copied().unwrap_or(1)
    }

    #[inline(always)]
    fn axpy(a: f32, b: &[f32], out: &mut [f32]) {
        for (o, &bv) in out.iter_mut().zip(b) {
            *o += a * bv;
        }
    }

    /// 2-D matrix multiplication `[m, k] @ [k, n] -> [m, n]`.
    ///
    /// Small products run a plain triple loop. Larger ones use the blocked
    /// parallel kernel. Both accumulate over `k` in ascending order, so a row
    /// of the result does not depend on which path computed it.
    ///
    /// # Panics
    ///
    /// Panics on non 2-D operands or mismatched inner dimensions.
    pub fn matmul(&self, other: &Tensor) -> Tensor {
        assert!(
            self.ndim() == 2 && other.ndim() == 2,
            "matmul expects 2-D operands, got {:?} @ {:?}",
            self.shape,
            other.shape
        );
        assert_eq!(
            self.shape[1], other.shape[0],
            "matmul dimensions incompatible: {:?} @ {:?}",
            self.shape, other.shape
        );

        let m = self.shape[0];
        let k = self.shape[1];
        let n = other.shape[1];

        if m * n * k >= 4_096 {
            return self.matmul_blocked(other, m, n, k);
        }

        let mut result = vec![0.0; m * n];
        for i in 0..m {
            let out = &mut result[i * n..(i + 1) * n];
            for l in 0..k {
                Self::axpy(self.data[i * k + l], &other.data[l * n..(l + 1) * n], out);
            }
        }
        Tensor::new(result, vec![m, n])
    }

    fn matmul_blocked(&self, other: &Tensor, m: usize, n: usize, k: usize) -> Tensor {
        const BLOCK: usize = 8;
        let mut result = vec![0.0; m * n];

        result
            .par_chunks_mut(BLOCK * n)
            .enumerate()
            .for_each(|(block_i, out_block)| {
                let i_start = block_i * BLOCK;
                let i_end = (i_start + BLOCK).min(m);
                for k_start in (0..k).step_by(BLOCK) {
                    let k_end = (k_start + BLOCK).min(k);
                    for i in i_start..i_end {
                        let row = (i - i_start) * n;
                        for l in k_start..k_end {
                            Self::axpy(
                                self.data[i * k + l],
                                &other.data[l * n..(l + 1) * n],
                                &mut out_block[row..row + n],
                            );
                        }
                    }
                }
            });

        Tensor::new(result, vec![m, n])
    }

    /// `[m, k] @ [n, k]ᵀ -> [m, n]` without materializing the transpose.
    ///
    /// The tied output head multiplies by the `[vocab, n_embd]` embedding
    /// matrix this way on every forward call.
    pub fn matmul_t(&self, other: &Tensor) -> Tensor {
        assert!(
            self.ndim() == 2 && other.ndim() == 2 && self.shape[1] == other.shape[1],
            "matmul_t dimensions incompatible: {:?} @ {:?}ᵀ",
            self.shape,
            other.shape
        );
        let (m, k, n) = (self.shape[0], self.shape[1], other.shape[0]);
        let mut result = vec![0.0; m * n];
        result
            .par_chunks_mut(n)
            .zip(self.data.par_chunks(k))
            .for_each(|(out, a)| {
                for (o, b) in out.iter_mut().zip(other.data.chunks(k)) {
                    *o = a.iter().zip(b).map(|(x, y)| x * y).sum();
                }
            });
        Tensor::new(result, vec![m, n])
    }

    /// Transpose of a 2-D tensor.
    ///
    /// ```rust
    /// # use arcane::Tensor;
    /// let t = Tensor::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], vec![2, 3]);
    /// let tt = t.t();
    /// assert_eq!(tt.shape, vec![3, 2]);
    /// assert_eq!(tt.data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    /// ```
    pub fn t(&self) -> Tensor {
        assert_eq!(self.ndim(), 2, "t() expects a 2-D tensor, got {:?}", self.shape);
        let rows = self.shape[0];
        let cols = self.shape[1];
        let mut result = vec![0.0; rows * cols];
        for i in 0..rows {
            for j in 0..cols {
                result[j * rows + i] = self.data[i * cols + j];
            }
        }
        Tensor::new(result, vec![cols, rows])
    }

    /// Softmax over the last axis, for any rank.
    ///
    /// Uses the max-subtraction form, so large logits do not overflow.
    /// Entries equal to `-inf` get exactly zero probability.
    pub fn softmax(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = self.data.clone();
        result.par_chunks_mut(cols).for_each(softmax_in_place);
        Tensor::new(result, self.shape.clone())
    }

    /// Element-wise addition.
    ///
    /// Supports identical shapes and broadcasting a 1-D tensor over the last
    /// dimension (bias addition).
    pub fn add(&self, other: &Tensor) -> Tensor {
        if self.shape == other.shape {
            let result = self
                .data
                .par_iter()
                .zip(&other.data)
                .map(|(a, b)| a + b)
                .collect();
            return Tensor::new(result, self.shape.clone());
        }

        let last = self.last_dim();
        if other.ndim() == 1 && other.numel() == last {
            let mut result = self.data.clone();
            result.par_chunks_mut(last).for_each(|row| {
                for (r, b) in row.iter_mut().zip(&other.data) {
                    *r += b;
                }
            });
            return Tensor::new(result, self.shape.clone());
        }

        panic!(
            "unsupported broadcast for add: {:?} + {:?}",
            self.shape, other.shape
        );
    }

    /// In-place `self += other` for identical shapes.
    pub fn add_assign(&mut self, other: &Tensor) {
        assert_eq!(self.shape, other.shape, "add_assign shape mismatch");
        self.data
            .par_iter_mut()
            .zip(&other.data)
            .for_each(|(a, b)| *a += b);
    }

    /// Multiply every element by a scalar.
    pub fn mul_scalar(&self, scalar: f32) -> Tensor {
        let result = self.data.par_iter().map(|&x| x * scalar).collect();
        Tensor::new(result, self.shape.clone())
    }

    /// In-place scale.
    pub fn scale(&mut self, scalar: f32) {
        self.data.par_iter_mut().for_each(|x| *x *= scalar);
    }

    /// Sum over every leading dimension, leaving `[last_dim]`.
    ///
    /// This is the bias gradient of a layer applied along the last axis.
    pub fn sum_leading(&self) -> Tensor {
        let cols = self.last_dim();
        let mut result = vec![0.0; cols];
        for row in self.data.chunks(cols) {
            for (r, &v) in result.iter_mut().zip(row) {
                *r += v;
            }
        }
        Tensor::new(result, vec![cols])
    }

    /// Sum of squared elements.
    pub fn sum_squares(&self) -> f32 {
        self.data.par_iter().map(|&x| x * x).sum()
    }

    /// Same data, new shape.
    pub fn reshape(&self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.numel(),
            new_size,
            "cannot reshape {:?} into {:?}",
            self.shape,
            new_shape
        );
        Tensor::new(self.data.clone(), new_shape.to_vec())
    }

    /// Consuming reshape (no copy).
    pub fn into_shape(self, new_shape: &[usize]) -> Tensor {
        let new_size: usize = new_shape.iter().product();
        assert_eq!(
            self.numel(),
            new_size,
            "cannot reshape {:?} into {:?}",
            self.shape,
            new_shape
        );
        Tensor::new(self.data, new_shape.to_vec())
    }
}

/// Numerically stable softmax of one row, in place.
pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    let mut sum = 0.0;
    for x in row.iter_mut() {
        *x = (*x - max).exp();
        sum += *x;
    }
    for x in row.iter_mut() {
        *x /= sum;
    }
}
