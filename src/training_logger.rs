//! Training Logger
//!
//! Reports each evaluation to the console through `tracing` and, when a path
//! is configured, appends a row to a CSV file.
//!
//! ## CSV Format
//!
//! - `step`: training iteration
//! - `elapsed_seconds`: time since the logger was created
//! - `learning_rate`: learning rate used at this step
//! - `train_loss`, `val_loss`: mean cross-entropy over the eval batches
//! - `train_perplexity`, `val_perplexity`: `exp(loss)`
//!
//! ## Perplexity
//!
//! ```text
//! perplexity = exp(loss)
//! ```
//!
//! A perfect model scores 1.0; uniform guessing over a vocabulary of `V`
//! scores `V`.

use crate::error::Result;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

pub struct TrainingLogger {
    csv: Option<BufWriter<File>>,
    start_time: Instant,
    last_log_time: Instant,
}

impl TrainingLogger {
    /// Create a logger, writing the CSV header if `csv_path` is given.
    pub fn new(csv_path: Option<&Path>) -> Result<Self> {
        let csv = match csv_path {
            Some(path) => {
                let mut w = BufWriter::new(File::create(path)?);
                writeln!(
                    w,
                    "step,elapsed_seconds,learning_rate,train_loss,val_loss,train_perplexity,val_perplexity"
                )?;
                w.flush()?;
                Some(w)
            }
            None => None,
        };
        let now = Instant::now();
        Ok(Self {
            csv,
            start_time: now,
            last_log_time: now,
        })
    }

    /// Record one evaluation.
    pub fn log(&mut self, step: usize, learning_rate: f32, train_loss: f32, val_loss: f32) -> Result<()> {
        let elapsed = self.start_time.elapsed().as_secs_f32();
        let since_last = self.last_log_time.elapsed().as_secs_f32();
        self.last_log_time = Instant::now();

        info!("step {step}: train loss {train_loss:.4}, val loss {val_loss:.4}");
        debug!(
            elapsed_secs = elapsed,
            since_last_secs = since_last,
            lr = learning_rate,
            val_perplexity = val_loss.exp(),
            "eval timing"
        );
        if !(train_loss.is_finite() && val_loss.is_finite()) {
            warn!("non-finite loss at step {step}");
        }

        if let Some(w) = self.csv.as_mut() {
            writeln!(
                w,
                "{},{:.2},{:.6},{:.4},{:.4},{:.2},{:.2}",
                step,
                elapsed,
                learning_rate,
                train_loss,
                val_loss,
                train_loss.exp(),
                val_loss.exp()
            )?;
            // flush per row so a crash loses nothing
            w.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        let mut logger = TrainingLogger::new(Some(&path)).unwrap();
        logger.log(0, 6e-4, 2.0, 2.5).unwrap();
        logger.log(500, 6e-4, 1.0, 1.5).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("step,elapsed_seconds"));
        assert!(lines[2].starts_with("500,"));
        assert!(lines[2].contains(",1.0000,1.5000,2.72,4.48"));
    }

    #[test]
    fn console_only_logger_needs_no_file() {
        let mut logger = TrainingLogger::new(None).unwrap();
        assert!(logger.log(1, 1e-3, f32::NAN, 1.0).is_ok());
    }
}
