//! AdamW Optimizer
//!
//! Adam with decoupled weight decay, the usual optimizer for transformer
//! language models.
//!
//! ## Algorithm
//!
//! For each parameter θ with gradient g:
//!
//! ```text
//! θ = θ * (1 - α * λ)              # decoupled weight decay (decayed group only)
//! m = β₁ * m + (1 - β₁) * g        # first moment
//! v = β₂ * v + (1 - β₂) * g²       # second moment
//! m_hat = m / (1 - β₁^t)           # bias correction
//! v_hat = v / (1 - β₂^t)
//! θ = θ - α * m_hat / (√v_hat + ε)
//! ```
//!
//! where α is the learning rate for this step (the scheduler scales it), λ
//! the group's weight decay, β₁/β₂ the moment decay rates (0.9/0.95 by
//! default) and ε = 1e-8.
//!
//! ## Parameter Groups
//!
//! Parameters are assigned to groups by name. The model builds two: every
//! tensor with two or more dimensions (linear weights, embeddings) decays,
//! everything else (biases, LayerNorm scale and shift) has λ = 0. See
//! [`LanguageModel::configure_optimizer`](crate::LanguageModel::configure_optimizer).
//!
//! ## State Layout
//!
//! Moments are stored as one tensor per parameter in the model's visiting
//! order, so a step is a zip over parameters, gradients, `m` and `v`.
//!
//! ## References
//!
//! - Loshchilov & Hutter (2019): "Decoupled Weight Decay Regularization"
//!   https://arxiv.org/abs/1711.05101
//! - Kingma & Ba (2014): "Adam: A Method for Stochastic Optimization"
//!   https://arxiv.org/abs/1412.6980

use crate::layers::Parameters;
use crate::tensor::Tensor;
use rayon::prelude::*;
use std::collections::HashMap;

pub const ADAM_EPS: f32 = 1e-8;

/// Named parameters sharing one weight-decay setting.
#[derive(Clone, Debug, PartialEq)]
pub struct ParamGroup {
    pub names: Vec<String>,
    pub weight_decay: f32,
}

impl ParamGroup {
    pub fn new(names: Vec<String>, weight_decay: f32) -> Self {
        Self {
            names,
            weight_decay,
        }
    }
}

/// AdamW state.
///
/// # Fields
///
/// - **m / v**: first and second moments, one tensor per parameter
/// - **decay**: weight decay per parameter, resolved from the groups
/// - **step**: number of updates taken, for bias correction
#[derive(Clone, Debug)]
pub struct AdamW {
    groups: Vec<ParamGroup>,
    decay: Vec<f32>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub step: usize,
}

impl AdamW {
    /// Zero moments shaped like `params`.
    ///
    /// Parameters that no group names get no weight decay.
    pub fn new<P: Parameters + ?Sized>(
        params: &P,
        groups: Vec<ParamGroup>,
        (beta1, beta2): (f32, f32),
    ) -> Self {
        let by_name: HashMap<&str, f32> = groups
            .iter()
            .flat_map(|g| g.names.iter().map(move |n| (n.as_str(), g.weight_decay)))
            .collect();

        let mut decay = Vec::new();
        let mut m = Vec::new();
        params.visit("", &mut |name, t| {
            decay.push(by_name.get(name.as_str()).copied().unwrap_or(0.0));
            m.push(Tensor::zeros(t.shape.clone()));
        });
        let v = m.clone();

        Self {
            groups,
            decay,
            m,
            v,
            beta1,
            beta2,
            epsilon: ADAM_EPS,
            step: 0,
        }
    }

    pub fn groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    /// One update of every parameter with learning rate `lr`.
    ///
    /// # Panics
    ///
    /// Panics if `grads` does not have the same layout as the parameters the
    /// optimizer was built for.
    pub fn step<P, G>(&mut self, params: &mut P, grads: &G, lr: f32)
    where
        P: Parameters + ?Sized,
        G: Parameters + ?Sized,
    {
        self.step += 1;
        let t = self.step as f32;
        let hyper = Hyper {
            lr,
            beta1: self.beta1,
            beta2: self.beta2,
            epsilon: self.epsilon,
            bias_correction1: 1.0 - self.beta1.powf(t),
            bias_correction2: 1.0 - self.beta2.powf(t),
        };

        let params = params.tensors_mut();
        let grads = grads.tensors();
        assert_eq!(params.len(), grads.len(), "gradient layout mismatch");
        assert_eq!(params.len(), self.m.len(), "optimizer layout mismatch");

        for ((((p, g), m), v), &wd) in params
            .into_iter()
            .zip(grads)
            .zip(&mut self.m)
            .zip(&mut self.v)
            .zip(&self.decay)
        {
            assert_eq!(p.shape, g.shape, "gradient shape mismatch");
            update(&mut p.data, &g.data, &mut m.data, &mut v.data, wd, &hyper);
        }
    }
}

struct Hyper {
    lr: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
    bias_correction1: f32,
    bias_correction2: f32,
}

/// Parallel for large tensors, sequential for small ones.
fn update(param: &mut [f32], grad: &[f32], m: &mut [f32], v: &mut [f32], weight_decay: f32, h: &Hyper) {
    let step = |p: &mut f32, g: f32, m: &mut f32, v: &mut f32| {
        if weight_decay != 0.0 {
            *p *= 1.0 - h.lr * weight_decay;
        }
        *m = h.beta1 * *m + (1.0 - h.beta1) * g;
        *v = h.beta2 * *v + (1.0 - h.beta2) * g * g;
        let m_hat = *m / h.bias_correction1;
        let v_hat = *v / h.bias_correction2;
        *p -= h.lr * m_hat / (v_hat.sqrt() + h.epsilon);
    };

    if param.len() > 1000 {
        param
            .par_iter_mut()
            .zip(grad.par_iter())
            .zip(m.par_iter_mut().zip(v.par_iter_mut()))
            .for_each(|((p, &g), (m, v))| step(p, g, m, v));
    } else {
        for (((p, &g), m), v) in param.iter_mut().zip(grad).zip(m.iter_mut()).zip(v.iter_mut()) {
            step(p, g, m, v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layers::Linear;

    fn layer() -> Linear {
        let mut l = Linear::new(2, 2, true, false);
        l.weight.data = vec![1.0, -1.0, 0.5, 2.0];
        l
    }

    #[test]
    fn first_step_moves_by_learning_rate() {
        // with bias correction, step 1 is lr * sign(g) for any nonzero g
        let mut l = layer();
        let mut grads = layer();
        grads.weight.data = vec![0.3, -2.0, 1e-3, 0.0];
        grads.bias = Some(Tensor::zeros(vec![2]));

        let mut opt = AdamW::new(&l, vec![], (0.9, 0.95));
        opt.step(&mut l, &grads, 0.1);

        assert!((l.weight.data[0] - 0.9).abs() <= 1e-5);
        assert!((l.weight.data[1] + 0.9).abs() <= 1e-5);
        assert!((l.weight.data[2] - 0.4).abs() <= 1e-4);
        assert_eq!(l.weight.data[3], 2.0);
    }

    #[test]
    fn zero_gradient_leaves_undecayed_parameters_unchanged() {
        let mut l = layer();
        l.bias = Some(Tensor::new(vec![0.25, -0.75], vec![2]));
        let mut grads = Linear::new(2, 2, true, false);
        grads.bias = Some(Tensor::zeros(vec![2]));

        let groups = vec![
            ParamGroup::new(vec!["weight".into()], 0.1),
            ParamGroup::new(vec!["bias".into()], 0.0),
        ];
        let mut opt = AdamW::new(&l, groups, (0.9, 0.95));
        for _ in 0..5 {
            opt.step(&mut l, &grads, 0.01);
        }

        assert_eq!(l.bias.as_ref().unwrap().data, vec![0.25, -0.75]);
        // decayed group shrinks even without gradient
        let shrink = (1.0f32 - 0.01 * 0.1).powi(5);
        assert!((l.weight.data[3] - (2.0 * shrink)).abs() <= 1e-6);
        assert_eq!(opt.step, 5);
    }
}
