//! Training Data
//!
//! Token streams, the train/validation split and random batch sampling.
//!
//! A dataset is one flat sequence of token ids. Batches are windows cut at
//! uniformly random offsets; the target window is the input shifted by one:
//!
//! ```text
//! data:  t0 t1 t2 t3 t4 t5 t6 ...
//! x:        t1 t2 t3 t4          (offset 1, block_size 4)
//! y:           t2 t3 t4 t5
//! ```

use crate::error::{ArcaneError, Result};
use crate::tokenizer::Tokenizer;
use rand::Rng;
use std::fs;
use std::io;
use std::path::Path;
use tracing::info;

/// Share of tokens used for training; the tail is validation.
pub const TRAIN_FRACTION: f64 = 0.9;

/// Inputs and next-token targets, `[batch_size][block_size]` each.
#[derive(Clone, Debug, PartialEq)]
pub struct Batch {
    pub x: Vec<Vec<usize>>,
    pub y: Vec<Vec<usize>>,
}

/// Split at `floor(train_fraction * len)`: train is the head, validation the
/// tail.
pub fn train_val_split(tokens: &[usize], train_fraction: f64) -> (&[usize], &[usize]) {
    let n = ((tokens.len() as f64 * train_fraction).floor() as usize).min(tokens.len());
    tokens.split_at(n)
}

/// Sample `batch_size` windows at offsets in `[0, len - block_size)`.
///
/// # Errors
///
/// [`ArcaneError::DataTooShort`] if `data` cannot hold one input window plus
/// its shifted target.
pub fn get_batch<R: Rng + ?Sized>(
    data: &[usize],
    block_size: usize,
    batch_size: usize,
    rng: &mut R,
) -> Result<Batch> {
    let needed = block_size + 1;
    if data.len() < needed {
        return Err(ArcaneError::DataTooShort {
            len: data.len(),
            needed,
        });
    }

    let max_offset = data.len() - block_size;
    let (x, y): (Vec<_>, Vec<_>) = (0..batch_size)
        .map(|_| {
            let i = rng.random_range(0..max_offset);
            (
                data[i..i + block_size].to_vec(),
                data[i + 1..i + block_size + 1].to_vec(),
            )
        })
        .unzip();
    Ok(Batch { x, y })
}

/// Load a token stream.
///
/// `.bin` files hold little-endian `u16` ids (the nanoGPT layout); anything
/// else is read as UTF-8 text and encoded with `tokenizer`.
pub fn load_tokens(path: &Path, tokenizer: &dyn Tokenizer) -> Result<Vec<usize>> {
    let tokens = if path.extension().is_some_and(|ext| ext == "bin") {
        let bytes = fs::read(path)?;
        if bytes.len() % 2 != 0 {
            return Err(ArcaneError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: odd byte count for u16 tokens", path.display()),
            )));
        }
        bytes
            .chunks_exact(2)
            .map(|b| u16::from_le_bytes([b[0], b[1]]) as usize)
            .collect()
    } else {
        let text = fs::read_to_string(path)?;
        tokenizer.encode(&text)?
    };
    info!("loaded {} tokens from {}", tokens.len(), path.display());
    Ok(tokens)
}
