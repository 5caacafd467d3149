//! Train an Arcane model.
//!
//! Configuration is layered: a named preset, then an optional JSON file, then
//! individual command-line flags.
//!
//! ```bash
//! # List presets
//! cargo run --release --bin arcane-train -- --list-presets
//!
//! # Byte-level toy run on any text file
//! cargo run --release --bin arcane-train -- --preset tiny --data input.txt
//!
//! # GPT-2 vocabulary, nanoGPT-style token file, custom schedule
//! cargo run --release --bin arcane-train -- --preset base \
//!     --tokenizer tokenizer.json --data train.bin --config run.json --max-iters 2000
//! ```
//!
//! The JSON file may hold `model` and/or `train` objects with any subset of
//! fields; missing fields keep the preset's values. If the checkpoint path
//! already holds a checkpoint, training resumes from it: the architecture is
//! taken from the checkpoint, and `--init-from-checkpoint` restarts the
//! iteration count for fine-tuning instead of continuing.

use arcane::{
    data, preset, ArcaneError, Checkpoint, Device, LanguageModel, ModelConfig, ResumeMode,
    TrainConfig, Trainer, PRESETS,
};
use clap::Parser;
use serde_json::Value;
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arcane-train", about = "Train a decoder-only language model")]
struct Args {
    /// Named preset (see --list-presets)
    #[arg(long, default_value = "tiny")]
    preset: String,

    /// List available presets and exit
    #[arg(long)]
    list_presets: bool,

    /// JSON file with `model` / `train` overrides
    #[arg(long)]
    config: Option<PathBuf>,

    /// Training data: `.bin` (u16 token ids) or a text file
    #[arg(long)]
    data: Option<PathBuf>,

    /// HuggingFace tokenizer.json (byte-level tokenizer if omitted)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    // Model architecture
    #[arg(long)]
    block_size: Option<usize>,
    #[arg(long)]
    vocab_size: Option<usize>,
    #[arg(long)]
    n_embd: Option<usize>,
    #[arg(long)]
    n_head: Option<usize>,
    #[arg(long)]
    n_layer: Option<usize>,
    #[arg(long)]
    dropout: Option<f32>,
    #[arg(long)]
    bias: Option<bool>,

    // Optimization
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    learning_rate: Option<f32>,
    #[arg(long)]
    min_lr: Option<f32>,
    #[arg(long)]
    weight_decay: Option<f32>,
    #[arg(long)]
    beta1: Option<f32>,
    #[arg(long)]
    beta2: Option<f32>,
    #[arg(long)]
    max_iters: Option<usize>,
    #[arg(long)]
    warmup_iters: Option<usize>,
    #[arg(long)]
    lr_decay_iters: Option<usize>,
    /// Cosine decay after warmup instead of a constant rate
    #[arg(long)]
    decay_lr: Option<bool>,
    #[arg(long)]
    eval_interval: Option<usize>,
    #[arg(long)]
    eval_iters: Option<usize>,
    #[arg(long)]
    gradient_accumulation_steps: Option<usize>,
    #[arg(long)]
    grad_clip: Option<f32>,

    /// cpu (other names fall back to cpu)
    #[arg(long)]
    device: Option<String>,
    /// Where the best model is written (and resumed from)
    #[arg(long)]
    checkpoint: Option<PathBuf>,
    /// CSV file for evaluation metrics
    #[arg(long)]
    log_csv: Option<PathBuf>,
    #[arg(long)]
    seed: Option<u64>,
    /// Fine-tune an existing checkpoint: keep its weights, run 0..max_iters
    #[arg(long)]
    init_from_checkpoint: bool,
}

fn print_presets() {
    println!("\nAvailable presets:\n");
    println!(
        "  {:<14} {:>6} {:>5} {:>5} {:>7} {:>6} {:>8}   {}",
        "NAME", "LAYERS", "HEADS", "EMBD", "CONTEXT", "VOCAB", "LR", "DESCRIPTION"
    );
    println!("  {}", "-".repeat(96));
    for p in PRESETS {
        let (m, t) = ((p.model)(), (p.train)());
        println!(
            "  {:<14} {:>6} {:>5} {:>5} {:>7} {:>6} {:>8.1e}   {}",
            p.name, m.n_layer, m.n_head, m.n_embd, m.block_size, m.vocab_size, t.learning_rate, p.description
        );
    }
    println!("\nUsage: arcane-train --preset <NAME> --data <FILE>");
}

/// Overlay `patch` onto `base`, key by key.
fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                merge_json(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (base, patch) => *base = patch,
    }
}

fn resolve(args: &Args) -> Result<(ModelConfig, TrainConfig), Box<dyn std::error::Error>> {
    let p = preset(&args.preset).ok_or_else(|| {
        ArcaneError::InvalidConfig(format!(
            "unknown preset '{}', use --list-presets",
            args.preset
        ))
    })?;
    let (mut model, mut train) = ((p.model)(), (p.train)());

    if let Some(path) = &args.config {
        let file: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        if let Some(patch) = file.get("model") {
            let mut value = serde_json::to_value(&model)?;
            merge_json(&mut value, patch.clone());
            model = serde_json::from_value(value)?;
        }
        if let Some(patch) = file.get("train") {
            let mut value = serde_json::to_value(&train)?;
            merge_json(&mut value, patch.clone());
            train = serde_json::from_value(value)?;
        }
        info!("applied config file {}", path.display());
    }

    macro_rules! set {
        ($target:ident . $field:ident = $arg:expr) => {
            if let Some(v) = $arg.clone() {
                $target.$field = v;
            }
        };
    }
    set!(model.block_size = args.block_size);
    set!(model.vocab_size = args.vocab_size);
    set!(model.n_embd = args.n_embd);
    set!(model.n_head = args.n_head);
    set!(model.n_layer = args.n_layer);
    set!(model.dropout = args.dropout);
    set!(model.bias = args.bias);
    set!(train.batch_size = args.batch_size);
    set!(train.learning_rate = args.learning_rate);
    set!(train.min_lr = args.min_lr);
    set!(train.weight_decay = args.weight_decay);
    set!(train.beta1 = args.beta1);
    set!(train.beta2 = args.beta2);
    set!(train.max_iters = args.max_iters);
    set!(train.warmup_iters = args.warmup_iters);
    set!(train.lr_decay_iters = args.lr_decay_iters);
    set!(train.decay_lr = args.decay_lr);
    set!(train.eval_interval = args.eval_interval);
    set!(train.eval_iters = args.eval_iters);
    set!(train.gradient_accumulation_steps = args.gradient_accumulation_steps);
    set!(train.grad_clip = args.grad_clip);
    set!(train.checkpoint_path = args.checkpoint);
    set!(train.seed = args.seed);
    if let Some(path) = &args.log_csv {
        train.log_csv = Some(path.clone());
    }
    if let Some(name) = &args.device {
        train.device = Device::from_name(name);
    }
    if args.init_from_checkpoint {
        train.resume_mode = ResumeMode::FineTune;
    }

    model.validate()?;
    train.validate()?;
    Ok((model, train))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    if args.list_presets {
        print_presets();
        return Ok(());
    }

    let (mut model_config, train_config) = resolve(&args)?;
    let checkpoint_path = train_config.checkpoint_path.clone();
    let checkpoint = Checkpoint::load(&checkpoint_path)?;
    if let Some(checkpoint) = &checkpoint {
        let stored = ModelConfig {
            dropout: model_config.dropout,
            ..checkpoint.config.clone()
        };
        if stored != model_config {
            warn!(
                "using the architecture stored in {} instead of the requested one",
                checkpoint_path.display()
            );
            model_config = stored;
        }
    }
    let data_path = args
        .data
        .clone()
        .ok_or_else(|| ArcaneError::InvalidConfig("--data is required".into()))?;

    let tokenizer = arcane::load_tokenizer(args.tokenizer.as_deref())?;
    if tokenizer.vocab_size() > model_config.vocab_size {
        return Err(ArcaneError::InvalidConfig(format!(
            "tokenizer has {} ids but the model vocabulary is {}",
            tokenizer.vocab_size(),
            model_config.vocab_size
        ))
        .into());
    }
    if model_config.vocab_size > tokenizer.vocab_size() {
        warn!(
            "model vocabulary {} is padded beyond the tokenizer's {}",
            model_config.vocab_size,
            tokenizer.vocab_size()
        );
    }

    info!("preset: {}, device: {:?}", args.preset, train_config.device);
    info!("model: {:?}", model_config);
    let tokens = data::load_tokens(&data_path, tokenizer.as_ref())?;

    let model = LanguageModel::new(&model_config, train_config.seed)?;
    let mut trainer = Trainer::new(model, train_config, &tokens)?;
    if let Some(checkpoint) = &checkpoint {
        trainer.resume(checkpoint, &checkpoint_path)?;
    }

    let summary = trainer.run()?;
    info!(
        "finished after {} iterations, best val loss {:.4} (saved to {})",
        summary.iterations,
        summary.best_val_loss,
        checkpoint_path.display()
    );
    Ok(())
}
