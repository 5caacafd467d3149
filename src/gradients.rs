//! Gradient Utilities
//!
//! Operations over a whole gradient set, written against [`Parameters`] so
//! they work for any layer or for the full model.
//!
//! ## Clipping
//!
//! ```text
//! norm = √(Σ g²)                   // global L2 norm over every tensor
//! if norm > max_norm:
//!     g *= max_norm / norm         // one factor for all tensors
//! ```
//!
//! A single scale factor keeps the relative size of every gradient, and only
//! the length of the overall update is bounded.
//!
//! ## Accumulation
//!
//! With gradient accumulation the trainer sums the gradients of several
//! micro-batches, each already divided by the number of steps, so the sum is
//! the gradient of the mean loss.
//!
//! ## Example
//!
//! ```rust
//! use arcane::gradients::{clip_grad_norm, grad_norm};
//! use arcane::layers::Linear;
//!
//! let mut grads = Linear::new(2, 2, false, false);
//! grads.weight.data = vec![3.0, 0.0, 0.0, 4.0];
//! assert_eq!(grad_norm(&grads), 5.0);
//!
//! let before = clip_grad_norm(&mut grads, 1.0);
//! assert_eq!(before, 5.0);
//! assert!((grad_norm(&grads) - 1.0).abs() < 1e-6);
//! ```

use crate::layers::Parameters;
use rayon::prelude::*;

/// Global L2 norm over every tensor.
pub fn grad_norm<G: Parameters + ?Sized>(grads: &G) -> f32 {
    grads
        .tensors()
        .par_iter()
        .map(|t| t.sum_squares())
        .sum::<f32>()
        .sqrt()
}

/// Scale gradients so their global norm is at most `max_norm`.
///
/// # Returns
///
/// The norm before clipping, for logging.
pub fn clip_grad_norm<G: Parameters + ?Sized>(grads: &mut G, max_norm: f32) -> f32 {
    let norm = grad_norm(grads);
    if norm > max_norm && norm.is_finite() {
        let scale = max_norm / norm;
        for t in grads.tensors_mut() {
            t.scale(scale);
        }
    }
    norm
}

/// `total += grads`, tensor by tensor.
///
/// # Panics
///
/// Panics if the two sets do not have the same layout.
pub fn accumulate<G: Parameters + ?Sized>(total: &mut G, grads: &G) {
    let targets = total.tensors_mut();
    let sources = grads.tensors();
    assert_eq!(targets.len(), sources.len(), "gradient layout mismatch");
    for (t, s) in targets.into_iter().zip(sources) {
        t.add_assign(s);
    }
}

/// Multiply every gradient by `factor`.
pub fn scale_all<G: Parameters + ?Sized>(grads: &mut G, factor: f32) {
    for t in grads.tensors_mut() {
        t.scale(factor);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;
    use crate::tensor::Tensor;

    fn grads(values: Vec<f32>) -> Linear {
        let mut l = Linear::new(2, 2, true, false);
        l.weight.data = values;
        l.bias = Some(Tensor::new(vec![0.0, 0.0], vec![2]));
        l
    }

    #[test]
    fn clipping_bounds_large_gradients() {
        let mut g = grads(vec![300.0, -400.0, 1200.0, 0.0]);
        let before = clip_grad_norm(&mut g, 1.0);
        assert!((before - 1300.0).abs() <= 1e-2);
        assert!(grad_norm(&g) <= 1.0 + 1e-5);
        // direction is preserved
        assert!((g.weight.data[0] / g.weight.data[1] + 0.75).abs() <= 1e-6);
    }

    #[test]
    fn small_gradients_are_untouched() {
        let mut g = grads(vec![0.1, 0.2, 0.0, 0.0]);
        clip_grad_norm(&mut g, 1.0);
        assert_eq!(g.weight.data, vec![0.1, 0.2, 0.0, 0.0]);
    }

    #[test]
    fn accumulate_then_scale_gives_mean() {
        let mut total = grads(vec![1.0, 2.0, 3.0, 4.0]);
        accumulate(&mut total, &grads(vec![3.0, 2.0, 1.0, 0.0]));
        scale_all(&mut total, 0.5);
        assert_eq!(total.weight.data, vec![2.0; 4]);
    }
}
