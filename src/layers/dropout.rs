//! Dropout
//!
//! Inverted dropout: while training, each activation is zeroed with
//! probability `rate` and survivors are scaled by `1 / (1 - rate)`. In eval
//! mode, or with `rate == 0`, the layer is an exact identity and draws no
//! random numbers.

use crate::tensor::Tensor;

#[derive(Clone, Debug)]
pub struct Dropout {
    pub rate: f32,
    pub training: bool,
}

impl Dropout {
    /// # Panics
    ///
    /// Panics unless `0 <= rate < 1` (config validation guarantees this).
    pub fn new(rate: f32) -> Self {
        assert!(
            (0.0..1.0).contains(&rate),
            "dropout rate must be in [0, 1), got {rate}"
        );
        Self {
            rate,
            training: true,
        }
    }

    fn active(&self) -> bool {
        self.training && self.rate > 0.0
    }

    pub fn forward(&self, x: &Tensor) -> (Tensor, DropoutCache) {
        if !self.active() {
            return (x.clone(), DropoutCache { mask: None, scale: 1.0 });
        }

        let scale = 1.0 / (1.0 - self.rate);
        let mask: Vec<bool> = (0..x.numel())
            .map(|_| rand::random::<f32>() >= self.rate)
            .collect();
        let data = x
            .data
            .iter()
            .zip(&mask)
            .map(|(&v, &keep)| if keep { v * scale } else { 0.0 })
            .collect();

        (
            Tensor::new(data, x.shape.clone()),
            DropoutCache {
                mask: Some(mask),
                scale,
            },
        )
    }

    /// Route the gradient through the same mask.
    pub fn backward(&self, grad_out: &Tensor, cache: &DropoutCache) -> Tensor {
        match &cache.mask {
            Some(mask) => {
                let data = grad_out
                    .data
                    .iter()
                    .zip(mask)
                    .map(|(&g, &keep)| if keep { g * cache.scale } else { 0.0 })
                    .collect();
                Tensor::new(data, grad_out.shape.clone())
            }
            None => grad_out.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DropoutCache {
    /// Kept positions; `None` when the layer was an identity
    pub mask: Option<Vec<bool>>,
    pub scale: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_exact_identity() {
        let x = Tensor::new(vec![0.1, -2.0, 3.5], vec![3]);
        let (y, cache) = Dropout::new(0.0).forward(&x);
        assert_eq!(y, x);
        assert!(cache.mask.is_none());
    }

    #[test]
    fn eval_mode_is_identity() {
        let mut d = Dropout::new(0.5);
        d.training = false;
        let x = Tensor::full(vec![100], 1.0);
        assert_eq!(d.forward(&x).0, x);
    }

    #[test]
    fn training_mode_drops_and_rescales() {
        let d = Dropout::new(0.5);
        let x = Tensor::full(vec![1000], 1.0);
        let (y, cache) = d.forward(&x);
        assert!(y.data.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = cache.mask.as_ref().unwrap().iter().filter(|&&k| k).count();
        assert!(kept > 350 && kept < 650);

        let g = d.backward(&x, &cache);
        assert_eq!(g, y);
    }
}
