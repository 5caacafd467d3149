//! Text Generation
//!
//! Autoregressive top-k sampling with a KV cache. The prompt is run through
//! the model once; after that every step feeds only the newest token, and
//! attention reads earlier keys and values from the session cache.
//!
//! ```text
//! prompt ids ──► forward_cached ──► last logits / T ──► softmax ──► top-k ──► sample
//!                     ▲                                                      │
//!                     └──────────────────── newest token ◄───────────────────┘
//! ```

use crate::error::{ArcaneError, Result};
use crate::kv_cache::KvCache;
use crate::model::LanguageModel;
use crate::tensor::softmax_in_place;
use crate::tokenizer::Tokenizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Generation stops early after this share of `max_length` once a token
/// ends a sentence.
const EARLY_STOP_FRACTION: f64 = 0.7;

#[derive(Clone, Debug, PartialEq)]
pub struct GenerateOptions {
    /// Total sequence length including the prompt (also capped by
    /// `block_size`)
    pub max_length: usize,
    pub top_k: usize,
    pub temperature: f32,
    pub num_return_sequences: usize,
    pub seed: u64,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            max_length: 32,
            top_k: 50,
            temperature: 1.0,
            num_return_sequences: 1,
            seed: 1337,
        }
    }
}

impl GenerateOptions {
    fn validate(&self) -> Result<()> {
        if !(self.temperature.is_finite() && self.temperature > 0.0) {
            return Err(ArcaneError::InvalidConfig(format!(
                "temperature must be positive, got {}",
                self.temperature
            )));
        }
        if self.num_return_sequences == 0 {
            return Err(ArcaneError::InvalidConfig(
                "num_return_sequences must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

impl LanguageModel {
    /// Continue `prompt`, streaming text through `emit`.
    ///
    /// `emit` receives the prompt first and then each decoded token of the
    /// first sequence as it is sampled. Every sequence starts from the same
    /// prompt and draws from one seeded generator, so output is reproducible.
    ///
    /// Dropout follows the model's mode; call `set_training(false)` first.
    ///
    /// # Returns
    ///
    /// `num_return_sequences` token sequences, prompt included.
    pub fn generate(
        &self,
        tokenizer: &dyn Tokenizer,
        prompt: &str,
        opts: &GenerateOptions,
        mut emit: impl FnMut(&str),
    ) -> Result<Vec<Vec<usize>>> {
        opts.validate()?;
        let ids = tokenizer.encode(prompt)?;
        if ids.is_empty() {
            return Err(ArcaneError::ShapeMismatch("prompt encodes to no tokens".into()));
        }
        let vocab_size = self.config.vocab_size;
        if let Some(&id) = ids.iter().find(|&&id| id >= vocab_size) {
            return Err(ArcaneError::TokenOutOfRange { id, vocab_size });
        }

        let limit = opts.max_length.min(self.config.block_size);
        let mut rng = StdRng::seed_from_u64(opts.seed);
        let mut sequences = vec![ids; opts.num_return_sequences];
        let mut kv = KvCache::new(self.config.n_layer);
        let mut pending = sequences.clone();

        emit(prompt);
        while sequences[0].len() < limit {
            let logits = self.forward_cached(&pending, &mut kv)?;
            let t = pending[0].len();
            for (b, seq) in sequences.iter_mut().enumerate() {
                let start = (b * t + t - 1) * vocab_size;
                let row = &logits.data[start..start + vocab_size];
                seq.push(sample_top_k(row, opts.temperature, opts.top_k, &mut rng));
            }
            pending = sequences
                .iter()
                .map(|seq| seq[seq.len() - 1..].to_vec())
                .collect();

            let newest = sequences[0][sequences[0].len() - 1];
            let word = tokenizer.decode(&[newest])?;
            emit(&word);

            let len = sequences[0].len();
            if len as f64 > EARLY_STOP_FRACTION * opts.max_length as f64
                && word.ends_with(['.', '!', '?'])
            {
                debug!(len, "sentence end, stopping early");
                break;
            }
        }
        Ok(sequences)
    }
}

/// The `k` most probable `(id, prob)` pairs, most probable first.
///
/// `k` is clamped to `1..=probs.len()`. Ties keep the lower id first.
pub fn top_k(probs: &[f32], k: usize) -> Vec<(usize, f32)> {
    let k = k.clamp(1, probs.len());
    let mut ranked: Vec<(usize, f32)> = probs.iter().copied().enumerate().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(k);
    ranked
}

/// Sample the next id from one row of logits.
///
/// Logits are divided by `temperature`, turned into probabilities, cut down
/// to the top `k`, and one id is drawn in proportion to the kept mass.
pub fn sample_top_k<R: Rng + ?Sized>(logits: &[f32], temperature: f32, k: usize, rng: &mut R) -> usize {
    let mut probs: Vec<f32> = logits.iter().map(|&x| x / temperature).collect();
    softmax_in_place(&mut probs);
    let candidates = top_k(&probs, k);

    let total: f32 = candidates.iter().map(|&(_, p)| p).sum();
    let r = rng.random::<f32>() * total;
    let mut cumsum = 0.0;
    for &(id, p) in &candidates {
        cumsum += p;
        if r < cumsum {
            return id;
        }
    }
    candidates[candidates.len() - 1].0
}
