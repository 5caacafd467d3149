//! Key/value cache for incremental decoding.
//!
//! Each attention layer gets a [`LayerKvCache`] holding keys (already
//! rotated) and values for every position seen so far, laid out as
//! `[batch, n_head, seq, head_dim]`. A [`KvCache`] bundles one per block and
//! belongs to a single generation session: callers create it, pass it into
//! [`LanguageModel::forward_cached`](crate::LanguageModel::forward_cached),
//! and drop or [`clear`](KvCache::clear) it when the session ends. The model
//! itself holds no cache state.

use crate::tensor::Tensor;

/// Cached keys and values for one attention layer.
#[derive(Clone, Debug, Default)]
pub struct LayerKvCache {
    key: Option<Tensor>,
    value: Option<Tensor>,
}

impl LayerKvCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.key.is_none()
    }

    /// Number of cached positions.
    pub fn seq_len(&self) -> usize {
        self.key.as_ref().map(|k| k.shape[2]).unwrap_or(0)
    }

    /// Append new positions and return the full (past, present) keys and
    /// values.
    ///
    /// # Panics
    ///
    /// Panics if batch, head count or head dimension differ from what is
    /// already cached.
    pub fn append(&mut self, key: Tensor, value: Tensor) -> (&Tensor, &Tensor) {
        let (k, v) = match (self.key.take(), self.value.take()) {
            (Some(past_k), Some(past_v)) => (concat_seq(&past_k, &key), concat_seq(&past_v, &value)),
            _ => (key, value),
        };
        (&*self.key.insert(k), &*self.value.insert(v))
    }

    pub fn get(&self) -> Option<(&Tensor, &Tensor)> {
        match (&self.key, &self.value) {
            (Some(k), Some(v)) => Some((k, v)),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.key = None;
        self.value = None;
    }
}

/// Per-block caches for one generation session.
#[derive(Clone, Debug)]
pub struct KvCache {
    layers: Vec<LayerKvCache>,
}

impl KvCache {
    pub fn new(n_layer: usize) -> Self {
        Self {
            layers: vec![LayerKvCache::new(); n_layer],
        }
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Positions cached so far (identical across layers).
    pub fn seq_len(&self) -> usize {
        self.layers.first().map(LayerKvCache::seq_len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.seq_len() == 0
    }

    pub fn layer_mut(&mut self, idx: usize) -> &mut LayerKvCache {
        &mut self.layers[idx]
    }

    pub fn layers_mut(&mut self) -> impl Iterator<Item = &mut LayerKvCache> {
        self.layers.iter_mut()
    }

    /// Drop every cached position so the next forward starts a new sequence.
    pub fn clear(&mut self) {
        for layer in &mut self.layers {
            layer.clear();
        }
    }
}

/// Concatenate `[B, H, S1, D]` and `[B, H, S2, D]` along the sequence axis.
fn concat_seq(a: &Tensor, b: &Tensor) -> Tensor {
    assert_eq!(a.ndim(), 4, "cache tensors are rank 4");
    assert!(
        a.shape[0] == b.shape[0] && a.shape[1] == b.shape[1] && a.shape[3] == b.shape[3],
        "cache shape mismatch: {:?} vs {:?}",
        a.shape,
        b.shape
    );
    let (batch, heads, s1, d) = (a.shape[0], a.shape[1], a.shape[2], a.shape[3]);
    let s2 = b.shape[2];
    let mut data = Vec::with_capacity(a.numel() + b.numel());
    for bh in 0..batch * heads {
        data.extend_from_slice(&a.data[bh * s1 * d..(bh + 1) * s1 * d]);
        data.extend_from_slice(&b.data[bh * s2 * d..(bh + 1) * s2 * d]);
    }
    Tensor::new(data, vec![batch, heads, s1 + s2, d])
}
