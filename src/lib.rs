//! Arcane: Decoder-Only Language Model
//!
//! A GPT-style transformer with rotary position embeddings, a KV cache for
//! incremental decoding and tied input/output embeddings, trained on the CPU
//! with hand-written backward passes.
//!
//! # Modules
//!
//! - [`tensor`] - Flat `f32` tensors with rayon-parallel kernels
//! - [`layers`] - Linear, LayerNorm, GELU, dropout, rotary, attention, blocks
//! - [`kv_cache`] - Per-session key/value cache
//! - [`model`] - The full language model, loss and backward pass
//! - [`generate`] - Top-k sampling with the KV cache
//! - [`optimizer`], [`scheduler`], [`gradients`] - AdamW, LR schedules, clipping
//! - [`data`] - Token streams, train/val split, batch sampling
//! - [`train`] - The training loop with best-checkpoint selection
//! - [`checkpoint`] - Binary model checkpoints
//! - [`tokenizer`] - HuggingFace and byte-level tokenizers
//! - [`config`] - Model/training configuration and presets
//!
//! # Example
//!
//! ```rust
//! use arcane::{ByteTokenizer, GenerateOptions, LanguageModel, ModelConfig};
//!
//! let config = ModelConfig::tiny(256);
//! let mut model = LanguageModel::new(&config, 1337)?;
//! model.set_training(false);
//!
//! let opts = GenerateOptions { max_length: 12, ..Default::default() };
//! let mut text = String::new();
//! let out = model.generate(&ByteTokenizer, "Hello", &opts, |s| text.push_str(s))?;
//! assert!(out[0].len() <= 12);
//! # Ok::<(), arcane::ArcaneError>(())
//! ```

pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod gradients;
pub mod kv_cache;
pub mod layers;
pub mod model;
pub mod optimizer;
pub mod scheduler;
pub mod tensor;
pub mod tokenizer;
pub mod train;
pub mod training_logger;

// Re-export main types for convenience
pub use checkpoint::Checkpoint;
pub use config::{
    preset, Device, ModelConfig, Preset, ResumeMode, RotaryForm, TrainConfig, PRESETS,
};
pub use error::{ArcaneError, Result};
pub use generate::{sample_top_k, top_k, GenerateOptions};
pub use kv_cache::{KvCache, LayerKvCache};
pub use layers::Parameters;
pub use model::{cross_entropy, LanguageModel, ModelCache, ModelGradients, ModelOutput};
pub use optimizer::{AdamW, ParamGroup};
pub use scheduler::{LrSchedule, LrScheduler};
pub use tensor::Tensor;
pub use tokenizer::{load_tokenizer, ByteTokenizer, HfTokenizer, Tokenizer};
pub use train::{Split, TrainSummary, Trainer};
pub use training_logger::TrainingLogger;
