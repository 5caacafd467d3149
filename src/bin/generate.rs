//! Sample text from a trained Arcane checkpoint.
//!
//! ```bash
//! cargo run --release --bin arcane-generate -- \
//!     --checkpoint arcane.ckpt --tokenizer tokenizer.json \
//!     --prompt "Once upon a time" --max-length 64 --top-k 50
//! ```
//!
//! Tokens are printed as they are sampled.

use arcane::{load_tokenizer, ArcaneError, Checkpoint, GenerateOptions};
use clap::Parser;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "arcane-generate", about = "Generate text with a trained model")]
struct Args {
    /// Model checkpoint written by arcane-train
    #[arg(long, default_value = "arcane.ckpt")]
    checkpoint: PathBuf,

    /// HuggingFace tokenizer.json (byte-level tokenizer if omitted)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    #[arg(long, default_value = "Hello, I'm a language model,")]
    prompt: String,

    /// Total length in tokens, prompt included
    #[arg(long, default_value_t = 32)]
    max_length: usize,

    #[arg(long, default_value_t = 50)]
    top_k: usize,

    #[arg(long, default_value_t = 1.0)]
    temperature: f32,

    #[arg(long, default_value_t = 1)]
    num_return_sequences: usize,

    #[arg(long, default_value_t = 1337)]
    seed: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let checkpoint = Checkpoint::load(&args.checkpoint)?.ok_or_else(|| {
        ArcaneError::InvalidConfig(format!("no checkpoint at {}", args.checkpoint.display()))
    })?;
    let mut model = checkpoint.to_model(&args.checkpoint)?;
    model.set_training(false);
    let tokenizer = load_tokenizer(args.tokenizer.as_deref())?;

    let opts = GenerateOptions {
        max_length: args.max_length,
        top_k: args.top_k,
        temperature: args.temperature,
        num_return_sequences: args.num_return_sequences,
        seed: args.seed,
    };

    let mut stdout = std::io::stdout();
    let sequences = model.generate(tokenizer.as_ref(), &args.prompt, &opts, |text| {
        print!("{text}");
        let _ = stdout.flush();
    })?;
    println!();

    for (i, seq) in sequences.iter().enumerate().skip(1) {
        println!("--- sequence {} ---", i + 1);
        println!("{}", tokenizer.decode(seq)?);
    }
    info!("generated {} sequence(s)", sequences.len());
    Ok(())
}
