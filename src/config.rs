//! Model and Training Configuration
//!
//! Two immutable records are passed explicitly into every constructor:
//!
//! - [`ModelConfig`]: architecture (sizes, dropout, bias, positional scheme)
//! - [`TrainConfig`]: optimization and evaluation protocol
//!
//! Both are serde types, so they round-trip through JSON config files and
//! ride along inside checkpoints. Named presets reproduce the configurations
//! Arcane was originally trained with.
//!
//! ## Presets
//!
//! ```text
//! name           layers  heads  embd  context  vocab   params
//! tiny                2      4    64       64    256    ~0.1M
//! base                9     12   768      512  50304   ~102M
//! arcane-small       12     12   768     1024  50304   ~124M
//! ```

use crate::error::{ArcaneError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How the rotary rotation combines `x` and `rotate_half(x)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryForm {
    /// `(x*cos - rh(x)*sin) + (x*sin + rh(x)*cos)`, two partial sums.
    #[default]
    Literal,
    /// `x*cos + rh(x)*sin`.
    Standard,
}

/// Architecture hyperparameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Context length (maximum positions per forward call, cache included)
    pub block_size: usize,
    pub vocab_size: usize,
    pub n_embd: usize,
    pub n_head: usize,
    pub n_layer: usize,
    /// Dropout after the feed-forward output projection
    pub dropout: f32,
    /// Whether linear layers carry a bias
    pub bias: bool,
    /// Rotate queries and keys by position
    #[serde(default = "default_true")]
    pub rotary: bool,
    #[serde(default)]
    pub rotary_form: RotaryForm,
    /// Add a learned position embedding to the token embedding
    #[serde(default = "default_true")]
    pub learned_positions: bool,
}

fn default_true() -> bool {
    true
}

impl ModelConfig {
    /// Tiny model for tests and quick CPU experiments.
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            block_size: 64,
            vocab_size,
            n_embd: 64,
            n_head: 4,
            n_layer: 2,
            dropout: 0.0,
            bias: true,
            rotary: true,
            rotary_form: RotaryForm::Literal,
            learned_positions: true,
        }
    }

    /// The original base configuration.
    pub fn base() -> Self {
        Self {
            block_size: 512,
            vocab_size: 50304,
            n_embd: 768,
            n_head: 12,
            n_layer: 9,
            dropout: 0.2,
            bias: true,
            rotary: true,
            rotary_form: RotaryForm::Literal,
            learned_positions: true,
        }
    }

    /// The "Arcane Small" configuration (GPT-2 small geometry).
    pub fn arcane_small() -> Self {
        Self {
            block_size: 1024,
            n_layer: 12,
            dropout: 0.0,
            ..Self::base()
        }
    }

    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    /// Check every structural invariant.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] when a size is zero, `n_embd` is not a
    /// multiple of `n_head`, the head dimension is odd while rotary is on,
    /// or dropout is outside `[0, 1)`.
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("block_size", self.block_size),
            ("vocab_size", self.vocab_size),
            ("n_embd", self.n_embd),
            ("n_head", self.n_head),
            ("n_layer", self.n_layer),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(ArcaneError::InvalidConfig(format!("{name} must be > 0")));
            }
        }
        if self.n_embd % self.n_head != 0 {
            return Err(ArcaneError::InvalidConfig(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            )));
        }
        if self.rotary && self.head_dim() % 2 != 0 {
            return Err(ArcaneError::InvalidConfig(format!(
                "rotary embeddings need an even head dimension, got {}",
                self.head_dim()
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(ArcaneError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        Ok(())
    }
}

/// Compute device. Only the CPU backend exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    #[default]
    Cpu,
}

impl Device {
    /// Resolve a device name, falling back to CPU for accelerators.
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "cpu" => Device::Cpu,
            other => {
                tracing::warn!(requested = other, "device unavailable, using cpu");
                Device::Cpu
            }
        }
    }
}

/// What a checkpoint found at startup is used for.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumeMode {
    /// Pick up at the checkpoint's iteration and schedule position.
    #[default]
    Continue,
    /// Start from the checkpoint's weights but run `0..max_iters` with a
    /// fresh schedule.
    FineTune,
}

/// Optimization and evaluation protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    /// Peak learning rate
    pub learning_rate: f32,
    /// Floor of the cosine schedule
    pub min_lr: f32,
    pub weight_decay: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub max_iters: usize,
    pub warmup_iters: usize,
    pub lr_decay_iters: usize,
    /// Cosine decay after warmup; otherwise warmup then constant
    pub decay_lr: bool,
    pub eval_interval: usize,
    pub eval_iters: usize,
    pub gradient_accumulation_steps: usize,
    /// Global gradient norm ceiling
    pub grad_clip: f32,
    pub device: Device,
    /// Where the best model is written
    pub checkpoint_path: PathBuf,
    /// Optional CSV with one row per evaluation
    pub log_csv: Option<PathBuf>,
    pub seed: u64,
    pub resume_mode: ResumeMode,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 8,
            learning_rate: 6e-4,
            min_lr: 6e-5,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            max_iters: 5000,
            warmup_iters: 2000,
            lr_decay_iters: 5000,
            decay_lr: false,
            eval_interval: 500,
            eval_iters: 200,
            gradient_accumulation_steps: 1,
            grad_clip: 1.0,
            device: Device::Cpu,
            checkpoint_path: PathBuf::from("arcane.ckpt"),
            log_csv: None,
            seed: 1337,
            resume_mode: ResumeMode::Continue,
        }
    }
}

impl TrainConfig {
    /// Short runs on the tiny model.
    pub fn tiny() -> Self {
        Self {
            batch_size: 8,
            learning_rate: 1e-3,
            min_lr: 1e-4,
            max_iters: 500,
            warmup_iters: 50,
            lr_decay_iters: 500,
            decay_lr: true,
            eval_interval: 100,
            eval_iters: 10,
            ..Self::default()
        }
    }

    /// The "Arcane Small" schedule: warmup then cosine decay.
    pub fn arcane_small() -> Self {
        Self {
            batch_size: 4,
            max_iters: 30000,
            warmup_iters: 100,
            lr_decay_iters: 30000,
            decay_lr: true,
            eval_interval: 1000,
            gradient_accumulation_steps: 2,
            ..Self::default()
        }
    }

    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] for zero batch/interval/accumulation
    /// sizes or a non-positive clip ceiling.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0
            || self.eval_interval == 0
            || self.eval_iters == 0
            || self.gradient_accumulation_steps == 0
        {
            return Err(ArcaneError::InvalidConfig(
                "batch_size, eval_interval, eval_iters and gradient_accumulation_steps must be > 0"
                    .into(),
            ));
        }
        if self.grad_clip <= 0.0 {
            return Err(ArcaneError::InvalidConfig(format!(
                "grad_clip must be positive, got {}",
                self.grad_clip
            )));
        }
        Ok(())
    }
}

/// A named pair of configurations.
pub struct Preset {
    pub name: &'static str,
    pub description: &'static str,
    pub model: fn() -> ModelConfig,
    pub train: fn() -> TrainConfig,
}

fn tiny_model() -> ModelConfig {
    ModelConfig::tiny(256)
}

pub const PRESETS: &[Preset] = &[
    Preset {
        name: "tiny",
        description: "byte-level toy model, trains in minutes on a laptop",
        model: tiny_model,
        train: TrainConfig::tiny,
    },
    Preset {
        name: "base",
        description: "9 layers, 512 context, warmup-only schedule",
        model: ModelConfig::base,
        train: TrainConfig::default,
    },
    Preset {
        name: "arcane-small",
        description: "12 layers, 1024 context, warmup + cosine decay",
        model: ModelConfig::arcane_small,
        train: TrainConfig::arcane_small,
    },
];

/// Look up a preset by name.
pub fn preset(name: &str) -> Option<&'static Preset> {
    PRESETS.iter().find(|p| p.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_are_valid() {
        for p in PRESETS {
            (p.model)().validate().unwrap();
            (p.train)().validate().unwrap();
        }
    }

    #[test]
    fn rejects_indivisible_heads() {
        let config = ModelConfig {
            n_embd: 66,
            n_head: 4,
            ..ModelConfig::tiny(16)
        };
        assert!(matches!(
            config.validate(),
            Err(ArcaneError::InvalidConfig(_))
        ));
    }

    #[test]
    fn rejects_odd_head_dim_only_with_rotary() {
        let odd = ModelConfig {
            n_embd: 12,
            n_head: 4,
            ..ModelConfig::tiny(16)
        };
        assert!(odd.validate().is_err());
        let additive_only = ModelConfig {
            rotary: false,
            ..odd
        };
        assert!(additive_only.validate().is_ok());
    }

    #[test]
    fn json_fills_in_positional_defaults() {
        let json = r#"{"block_size":8,"vocab_size":10,"n_embd":8,"n_head":2,
                       "n_layer":1,"dropout":0.0,"bias":false}"#;
        let config: ModelConfig = serde_json::from_str(json).unwrap();
        assert!(config.rotary && config.learned_positions);
        assert_eq!(config.rotary_form, RotaryForm::Literal);
    }

    #[test]
    fn unknown_device_falls_back_to_cpu() {
        assert_eq!(Device::from_name("cuda"), Device::Cpu);
    }
}
