//! Tokenizers
//!
//! The model only sees token ids. Text goes through a [`Tokenizer`]:
//!
//! - [`HfTokenizer`]: any HuggingFace `tokenizer.json`, e.g. the GPT-2 BPE
//!   vocabulary (50257 ids; models usually pad to 50304)
//! - [`ByteTokenizer`]: one id per byte, 256 ids, no files needed
//!
//! A model's `vocab_size` may be larger than the tokenizer's; the extra rows
//! of the embedding are simply never looked up.

use crate::error::{ArcaneError, Result};
use std::path::Path;

pub trait Tokenizer {
    fn encode(&self, text: &str) -> Result<Vec<usize>>;

    fn decode(&self, ids: &[usize]) -> Result<String>;

    fn vocab_size(&self) -> usize;
}

/// Byte-level tokenizer: id `b` is the byte `b`.
#[derive(Clone, Copy, Debug, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const VOCAB_SIZE: usize = 256;
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<usize>> {
        Ok(text.bytes().map(usize::from).collect())
    }

    /// Invalid UTF-8 (e.g. half of a multi-byte character) decodes to U+FFFD.
    fn decode(&self, ids: &[usize]) -> Result<String> {
        let bytes = ids
            .iter()
            .map(|&id| {
                u8::try_from(id).map_err(|_| ArcaneError::TokenOutOfRange {
                    id,
                    vocab_size: Self::VOCAB_SIZE,
                })
            })
            .collect::<Result<Vec<u8>>>()?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB_SIZE
    }
}

/// Wrapper around a HuggingFace `tokenizers` model.
pub struct HfTokenizer {
    inner: tokenizers::Tokenizer,
}

impl HfTokenizer {
    /// Load a `tokenizer.json`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| ArcaneError::Tokenizer(format!("{}: {e}", path.display())))?;
        Ok(Self { inner })
    }
}

impl Tokenizer for HfTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<usize>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| ArcaneError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().iter().map(|&id| id as usize).collect())
    }

    fn decode(&self, ids: &[usize]) -> Result<String> {
        let ids = ids
            .iter()
            .map(|&id| {
                u32::try_from(id).map_err(|_| ArcaneError::TokenOutOfRange {
                    id,
                    vocab_size: self.vocab_size(),
                })
            })
            .collect::<Result<Vec<u32>>>()?;
        self.inner
            .decode(&ids, false)
            .map_err(|e| ArcaneError::Tokenizer(e.to_string()))
    }

    fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }
}

/// Open `path` as a `tokenizer.json`, or fall back to bytes when `None`.
pub fn load_tokenizer(path: Option<&Path>) -> Result<Box<dyn Tokenizer>> {
    match path {
        Some(path) => Ok(Box::new(HfTokenizer::from_file(path)?)),
        None => Ok(Box::new(ByteTokenizer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_utf8() {
        let tok = ByteTokenizer;
        let text = "Ärger, über alles!";
        let ids = tok.encode(text).unwrap();
        assert_eq!(ids.len(), text.len());
        assert_eq!(tok.decode(&ids).unwrap(), text);
    }

    #[test]
    fn byte_decode_rejects_large_ids() {
        assert!(matches!(
            ByteTokenizer.decode(&[65, 300]),
            Err(ArcaneError::TokenOutOfRange { id: 300, vocab_size: 256 })
        ));
    }

    #[test]
    fn missing_tokenizer_file_is_an_error() {
        let err = HfTokenizer::from_file("/nonexistent/tokenizer.json").err();
        assert!(matches!(err, Some(ArcaneError::Tokenizer(_))));
    }
}
