//! Model Checkpoints
//!
//! Binary file holding the model config, training progress and every named
//! parameter.
//!
//! ## Layout
//!
//! ```text
//! b"ARCANE_CKPT"                 magic
//! u8                             format version (1)
//! u32 + JSON                     {config, iter, best_val_loss}
//! u32                            tensor count
//! per tensor:
//!   u32 + UTF-8                  dotted parameter name
//!   u32, u32 * rank              shape
//!   f32 * numel                  data
//! ```
//!
//! All integers and floats are little-endian. The tied embedding is stored
//! once, under `wte.weight`.
//!
//! ## Atomic saves
//!
//! [`Checkpoint::save`] writes `<path>.tmp`, syncs it and renames it over
//! `path`. A crash mid-save leaves the previous checkpoint intact.

use crate::config::ModelConfig;
use crate::error::{ArcaneError, Result};
use crate::layers::Parameters;
use crate::model::LanguageModel;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

const MAGIC: &[u8] = b"ARCANE_CKPT";
const VERSION: u8 = 1;

#[derive(Serialize, Deserialize)]
struct Metadata {
    config: ModelConfig,
    iter: usize,
    /// JSON has no infinity; `None` stands for "no evaluation yet".
    best_val_loss: Option<f32>,
}

#[derive(Clone, Debug)]
pub struct Checkpoint {
    pub config: ModelConfig,
    /// Iteration at which the checkpoint was taken
    pub iter: usize,
    pub best_val_loss: f32,
    /// `(name, tensor)` in the model's visiting order
    pub tensors: Vec<(String, Tensor)>,
}

impl Checkpoint {
    /// Snapshot the model's parameters.
    pub fn from_model(model: &LanguageModel, iter: usize, best_val_loss: f32) -> Self {
        let tensors = model
            .named_tensors()
            .into_iter()
            .map(|(name, t)| (name, t.clone()))
            .collect();
        Self {
            config: model.config.clone(),
            iter,
            best_val_loss,
            tensors,
        }
    }

    /// Write atomically to `path`.
    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = tmp_path(path);
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            w.write_all(MAGIC)?;
            w.write_all(&[VERSION])?;

            let meta = serde_json::to_vec(&Metadata {
                config: self.config.clone(),
                iter: self.iter,
                best_val_loss: self.best_val_loss.is_finite().then_some(self.best_val_loss),
            })?;
            write_u32(&mut w, meta.len())?;
            w.write_all(&meta)?;

            write_u32(&mut w, self.tensors.len())?;
            for (name, tensor) in &self.tensors {
                write_u32(&mut w, name.len())?;
                w.write_all(name.as_bytes())?;
                write_u32(&mut w, tensor.shape.len())?;
                for &dim in &tensor.shape {
                    write_u32(&mut w, dim)?;
                }
                for &v in &tensor.data {
                    w.write_all(&v.to_le_bytes())?;
                }
            }

            let file = w.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        info!("saved checkpoint to {} (iter {})", path.display(), self.iter);
        Ok(())
    }

    /// Read a checkpoint.
    ///
    /// # Returns
    ///
    /// `Ok(None)` when `path` does not exist.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::CorruptCheckpoint`] if the file exists but is not a
    /// well-formed checkpoint.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        let shown = path.display().to_string();
        let checkpoint = parse(&bytes).map_err(|reason| ArcaneError::corrupt(&shown, reason))?;
        info!(
            "loaded checkpoint from {} (iter {}, {} tensors)",
            shown,
            checkpoint.iter,
            checkpoint.tensors.len()
        );
        Ok(Some(checkpoint))
    }

    /// Overwrite `model`'s parameters.
    ///
    /// Every model parameter must be present with the same shape, and the
    /// checkpoint may not hold anything else. On error the model is left as
    /// it was.
    pub fn apply_to(&self, model: &mut LanguageModel, path: &Path) -> Result<()> {
        let shown = path.display().to_string();
        let stored: HashMap<&str, &Tensor> =
            self.tensors.iter().map(|(n, t)| (n.as_str(), t)).collect();

        let mut problem: Option<String> = None;
        let mut seen = 0;
        model.visit("", &mut |name, param| {
            if problem.is_some() {
                return;
            }
            match stored.get(name.as_str()) {
                None => problem = Some(format!("missing parameter {name}")),
                Some(t) if t.shape != param.shape => {
                    problem = Some(format!(
                        "{name}: stored shape {:?}, model expects {:?}",
                        t.shape, param.shape
                    ))
                }
                Some(_) => seen += 1,
            }
        });
        if let Some(reason) = problem {
            return Err(ArcaneError::corrupt(&shown, reason));
        }
        if seen != stored.len() {
            let mut known = Vec::new();
            model.visit("", &mut |name, _| known.push(name));
            if let Some(extra) = stored.keys().find(|n| !known.iter().any(|k| k.as_str() == **n)) {
                return Err(ArcaneError::corrupt(&shown, format!("unexpected parameter {extra}")));
            }
        }

        model.visit_mut("", &mut |name, param| {
            if let Some(t) = stored.get(name.as_str()) {
                param.data.copy_from_slice(&t.data);
            }
        });
        Ok(())
    }

    /// Build a model from the stored config and load the weights into it.
    pub fn to_model(&self, path: &Path) -> Result<LanguageModel> {
        let mut model = LanguageModel::new(&self.config, 0)?;
        self.apply_to(&mut model, path)?;
        Ok(model)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

fn write_u32(w: &mut impl Write, value: usize) -> Result<()> {
    let value = u32::try_from(value).map_err(|_| {
        ArcaneError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("{value} does not fit the checkpoint's u32 fields"),
        ))
    })?;
    w.write_all(&value.to_le_bytes())?;
    Ok(())
}

/// Bounds-checked reader over the file contents.
struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> std::result::Result<&'a [u8], String> {
        let end = self.pos.checked_add(n).filter(|&e| e <= self.buf.len());
        match end {
            Some(end) => {
                let out = &self.buf[self.pos..end];
                self.pos = end;
                Ok(out)
            }
            None => Err(format!("truncated at byte {}", self.pos)),
        }
    }

    fn u32(&mut self) -> std::result::Result<usize, String> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize)
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

fn parse(bytes: &[u8]) -> std::result::Result<Checkpoint, String> {
    let mut c = Cursor { buf: bytes, pos: 0 };
    if c.take(MAGIC.len()).ok() != Some(MAGIC) {
        return Err("not an arcane checkpoint (bad magic)".into());
    }
    let version = c.take(1)?[0];
    if version != VERSION {
        return Err(format!("unsupported version {version}"));
    }

    let meta_len = c.u32()?;
    let meta: Metadata =
        serde_json::from_slice(c.take(meta_len)?).map_err(|e| format!("metadata: {e}"))?;

    let count = c.u32()?;
    let mut tensors = Vec::new();
    for _ in 0..count {
        let name_len = c.u32()?;
        let name = std::str::from_utf8(c.take(name_len)?)
            .map_err(|e| format!("tensor name: {e}"))?
            .to_string();
        let rank = c.u32()?;
        let shape = (0..rank).map(|_| c.u32()).collect::<std::result::Result<Vec<_>, _>>()?;
        let numel = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|&n| n.checked_mul(4).is_some_and(|b| b <= c.remaining()))
            .ok_or_else(|| format!("{name}: shape {shape:?} exceeds file size"))?;
        let data = c
            .take(numel * 4)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        tensors.push((name, Tensor::new(data, shape)));
    }
    if c.remaining() != 0 {
        return Err(format!("{} trailing bytes", c.remaining()));
    }

    Ok(Checkpoint {
        config: meta.config,
        iter: meta.iter,
        best_val_loss: meta.best_val_loss.unwrap_or(f32::INFINITY),
        tensors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> LanguageModel {
        let config = ModelConfig {
            block_size: 8,
            n_embd: 8,
            n_head: 2,
            n_layer: 1,
            ..ModelConfig::tiny(13)
        };
        LanguageModel::new(&config, 21).unwrap()
    }

    #[test]
    fn round_trip_preserves_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.ckpt");
        let m = model();
        Checkpoint::from_model(&m, 42, 1.5).save(&path).unwrap();
        assert!(!tmp_path(&path).exists());

        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert_eq!(loaded.iter, 42);
        assert_eq!(loaded.best_val_loss, 1.5);
        assert_eq!(loaded.config, m.config);

        let restored = loaded.to_model(&path).unwrap();
        for ((an, a), (bn, b)) in m.named_tensors().iter().zip(restored.named_tensors()) {
            assert_eq!(an, &bn);
            assert_eq!(*a, b);
        }
    }

    #[test]
    fn infinite_best_loss_survives() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fresh.ckpt");
        Checkpoint::from_model(&model(), 0, f32::INFINITY).save(&path).unwrap();
        let loaded = Checkpoint::load(&path).unwrap().unwrap();
        assert!(loaded.best_val_loss.is_infinite());
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Checkpoint::load(&dir.path().join("absent.ckpt")).unwrap().is_none());
    }

    #[test]
    fn garbage_and_truncation_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.ckpt");
        fs::write(&path, b"definitely not a checkpoint").unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(ArcaneError::CorruptCheckpoint { .. })
        ));

        Checkpoint::from_model(&model(), 1, 2.0).save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();
        assert!(matches!(
            Checkpoint::load(&path),
            Err(ArcaneError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn shape_mismatch_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.ckpt");
        let mut ckpt = Checkpoint::from_model(&model(), 0, 1.0);
        ckpt.tensors[0].1 = Tensor::zeros(vec![2, 2]);
        let mut m = model();
        assert!(matches!(
            ckpt.apply_to(&mut m, &path),
            Err(ArcaneError::CorruptCheckpoint { .. })
        ));
    }

    #[test]
    fn rejected_checkpoint_leaves_model_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.ckpt");
        let mut ckpt = Checkpoint::from_model(&LanguageModel::new(&model().config, 5).unwrap(), 0, 1.0);
        // only the final tensor is wrong, so a copy-as-you-go load would have
        // overwritten everything before it
        let last = ckpt.tensors.len() - 1;
        ckpt.tensors[last].1 = Tensor::zeros(vec![3]);

        let mut m = model();
        let snapshot = |m: &LanguageModel| -> Vec<Tensor> { m.tensors().into_iter().cloned().collect() };
        let before = snapshot(&m);
        assert!(matches!(
            ckpt.apply_to(&mut m, &path),
            Err(ArcaneError::CorruptCheckpoint { .. })
        ));
        assert_eq!(snapshot(&m), before);

        ckpt.tensors.truncate(last);
        assert!(ckpt.apply_to(&mut m, &path).is_err());
        assert_eq!(snapshot(&m), before);
    }
}
