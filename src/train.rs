//! Training Loop
//!
//! [`Trainer`] owns the model, optimizer, scheduler and data split, and runs
//! the optimization and evaluation protocol:
//!
//! ```text
//! for iter in start..max_iters:
//!     if iter % eval_interval == 0 or iter == max_iters - 1:
//!         train_loss, val_loss = evaluate()        # eval mode, eval_iters batches each
//!         log; if val_loss < best: save checkpoint, best = val_loss
//!     grads = Σ backward(micro_batch) / accumulation_steps
//!     clip_grad_norm(grads, grad_clip)
//!     adamw.step(lr * scheduler.multiplier())
//!     scheduler.step()
//! ```
//!
//! The checkpoint on disk therefore always holds the model with the lowest
//! validation loss seen so far. When training resumes from a checkpoint the
//! loaded model's own validation loss becomes the bar to beat, so a worse
//! model never replaces a better one.

use crate::checkpoint::Checkpoint;
use crate::config::{ModelConfig, ResumeMode, TrainConfig};
use crate::data::{get_batch, train_val_split, TRAIN_FRACTION};
use crate::error::{ArcaneError, Result};
use crate::gradients::{accumulate, clip_grad_norm};
use crate::model::{LanguageModel, ModelGradients};
use crate::optimizer::AdamW;
use crate::scheduler::LrScheduler;
use crate::training_logger::TrainingLogger;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// Which half of the split to sample from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Split {
    Train,
    Val,
}

/// Outcome of [`Trainer::run`].
#[derive(Clone, Debug, PartialEq)]
pub struct TrainSummary {
    pub iterations: usize,
    pub best_val_loss: f32,
    pub last_train_loss: Option<f32>,
}

pub struct Trainer {
    model: LanguageModel,
    config: TrainConfig,
    optimizer: AdamW,
    scheduler: LrScheduler,
    train: Vec<usize>,
    val: Vec<usize>,
    rng: StdRng,
    best_val_loss: f32,
    iter: usize,
}

impl Trainer {
    /// Split `tokens` 90/10 and prepare a fresh optimizer.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] for a bad `config`,
    /// [`ArcaneError::DataTooShort`] if either split cannot hold one window.
    pub fn new(model: LanguageModel, config: TrainConfig, tokens: &[usize]) -> Result<Self> {
        config.validate()?;
        let (train, val) = train_val_split(tokens, TRAIN_FRACTION);
        let needed = model.config.block_size + 1;
        for split in [train, val] {
            if split.len() < needed {
                return Err(ArcaneError::DataTooShort {
                    len: split.len(),
                    needed,
                });
            }
        }
        info!(
            "train tokens: {}, val tokens: {}",
            train.len(),
            val.len()
        );

        let optimizer =
            model.configure_optimizer(config.weight_decay, (config.beta1, config.beta2));
        let scheduler = LrScheduler::from_config(&config);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            model,
            optimizer,
            scheduler,
            train: train.to_vec(),
            val: val.to_vec(),
            rng,
            best_val_loss: f32::INFINITY,
            iter: 0,
            config,
        })
    }

    /// Load weights from `checkpoint`.
    ///
    /// Under [`ResumeMode::Continue`] the iteration and schedule pick up at
    /// `checkpoint.iter`. Under [`ResumeMode::FineTune`] both restart at 0, so
    /// the loaded weights get a full `max_iters` run. In both modes the best
    /// validation loss is re-measured on the loaded model rather than trusted
    /// from the file.
    ///
    /// # Errors
    ///
    /// [`ArcaneError::InvalidConfig`] if the checkpoint was trained with a
    /// different architecture (dropout may differ),
    /// [`ArcaneError::CorruptCheckpoint`] if its tensors do not fit.
    pub fn resume(&mut self, checkpoint: &Checkpoint, path: &std::path::Path) -> Result<()> {
        let stored = ModelConfig {
            dropout: self.model.config.dropout,
            ..checkpoint.config.clone()
        };
        if stored != self.model.config {
            return Err(ArcaneError::InvalidConfig(format!(
                "checkpoint {} was trained as {:?}, model is {:?}",
                path.display(),
                checkpoint.config,
                self.model.config
            )));
        }
        checkpoint.apply_to(&mut self.model, path)?;

        let start = match self.config.resume_mode {
            ResumeMode::Continue => checkpoint.iter,
            ResumeMode::FineTune => 0,
        };
        self.iter = start;
        self.scheduler = LrScheduler::from_config(&self.config).starting_at(start);
        self.best_val_loss = self.estimate_loss(Split::Val)?;
        info!(
            mode = ?self.config.resume_mode,
            "resumed at iter {} (checkpoint iter {}), val loss {:.4}",
            self.iter,
            checkpoint.iter,
            self.best_val_loss
        );
        Ok(())
    }

    pub fn model(&self) -> &LanguageModel {
        &self.model
    }

    pub fn into_model(self) -> LanguageModel {
        self.model
    }

    pub fn best_val_loss(&self) -> f32 {
        self.best_val_loss
    }

    pub fn iteration(&self) -> usize {
        self.iter
    }

    /// Current learning rate (base rate times schedule).
    pub fn learning_rate(&self) -> f32 {
        self.config.learning_rate * self.scheduler.multiplier()
    }

    /// Mean loss over `eval_iters` random batches from one split, with
    /// dropout off.
    pub fn estimate_loss(&mut self, split: Split) -> Result<f32> {
        let data = match split {
            Split::Train => &self.train,
            Split::Val => &self.val,
        };
        let block_size = self.model.config.block_size;

        self.model.set_training(false);
        let mut total = 0.0;
        let mut outcome = Ok(());
        for _ in 0..self.config.eval_iters {
            let loss = get_batch(data, block_size, self.config.batch_size, &mut self.rng)
                .and_then(|batch| self.model.forward(&batch.x, Some(&batch.y)));
            match loss {
                Ok(out) => total += out.loss.unwrap_or(f32::NAN),
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }
        self.model.set_training(true);
        outcome?;
        Ok(total / self.config.eval_iters as f32)
    }

    /// `(train_loss, val_loss)`.
    pub fn evaluate(&mut self) -> Result<(f32, f32)> {
        Ok((
            self.estimate_loss(Split::Train)?,
            self.estimate_loss(Split::Val)?,
        ))
    }

    /// One optimizer update over `gradient_accumulation_steps` micro-batches.
    ///
    /// # Returns
    ///
    /// Mean training loss of the micro-batches.
    pub fn train_step(&mut self) -> Result<f32> {
        let steps = self.config.gradient_accumulation_steps;
        let block_size = self.model.config.block_size;

        let mut total: Option<ModelGradients> = None;
        let mut loss_sum = 0.0;
        for _ in 0..steps {
            let batch = get_batch(&self.train, block_size, self.config.batch_size, &mut self.rng)?;
            let (logits, cache) = self.model.forward_train(&batch.x)?;
            let (loss, mut grad_logits) = self.model.loss_and_grad(&logits, &batch.y)?;
            grad_logits.scale(1.0 / steps as f32);
            let grads = self.model.backward(&grad_logits, &cache);

            loss_sum += loss;
            match total.as_mut() {
                Some(t) => accumulate(t, &grads),
                None => total = Some(grads),
            }
        }
        let Some(mut grads) = total else {
            return Err(ArcaneError::InvalidConfig(
                "gradient_accumulation_steps must be at least 1".into(),
            ));
        };

        let norm = clip_grad_norm(&mut grads, self.config.grad_clip);
        let lr = self.learning_rate();
        self.optimizer.step(&mut self.model, &grads, lr);
        self.scheduler.step();

        let loss = loss_sum / steps as f32;
        debug!(iter = self.iter, loss, grad_norm = norm, lr, "train step");
        Ok(loss)
    }

    /// Train until `max_iters`, saving the best model to
    /// `config.checkpoint_path`.
    pub fn run(&mut self) -> Result<TrainSummary> {
        let mut logger = TrainingLogger::new(self.config.log_csv.as_deref())?;
        let max_iters = self.config.max_iters;
        info!(
            "training from iter {} to {} (batch {}, accumulation {}, lr {:e})",
            self.iter,
            max_iters,
            self.config.batch_size,
            self.config.gradient_accumulation_steps,
            self.config.learning_rate
        );

        let mut last_train_loss = None;
        while self.iter < max_iters {
            let iter = self.iter;
            if iter % self.config.eval_interval == 0 || iter == max_iters - 1 {
                let (train_loss, val_loss) = self.evaluate()?;
                logger.log(iter, self.learning_rate(), train_loss, val_loss)?;
                if val_loss < self.best_val_loss {
                    self.best_val_loss = val_loss;
                    Checkpoint::from_model(&self.model, iter, val_loss)
                        .save(&self.config.checkpoint_path)?;
                }
            }

            last_train_loss = Some(self.train_step()?);
            self.iter += 1;
        }

        Ok(TrainSummary {
            iterations: self.iter,
            best_val_loss: self.best_val_loss,
            last_train_loss,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RotaryForm;
    use crate::tensor::Tensor;

    fn setup(tokens: &[usize], dir: &std::path::Path) -> Result<Trainer> {
        let model_config = ModelConfig {
            block_size: 8,
            n_embd: 16,
            n_head: 2,
            n_layer: 1,
            ..ModelConfig::tiny(16)
        };
        let model = LanguageModel::new(&model_config, 0)?;
        let config = TrainConfig {
            batch_size: 2,
            max_iters: 6,
            warmup_iters: 0,
            eval_interval: 3,
            eval_iters: 2,
            checkpoint_path: dir.join("best.ckpt"),
            ..TrainConfig::default()
        };
        Trainer::new(model, config, tokens)
    }

    #[test]
    fn short_validation_split_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        // 60 tokens: val gets 6, fewer than block_size + 1
        let tokens: Vec<usize> = (0..60).map(|i| i % 16).collect();
        assert!(matches!(
            setup(&tokens, dir.path()),
            Err(ArcaneError::DataTooShort { len: 6, needed: 9 })
        ));
    }

    #[test]
    fn run_saves_best_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(&cycle(), dir.path()).unwrap();
        let summary = trainer.run().unwrap();

        assert_eq!(summary.iterations, 6);
        assert!(summary.best_val_loss.is_finite());
        let saved = Checkpoint::load(&dir.path().join("best.ckpt")).unwrap().unwrap();
        assert_eq!(saved.best_val_loss, summary.best_val_loss);
        assert!([0, 3, 5].contains(&saved.iter));
        assert!(trainer.model().is_training());
    }

    fn cycle() -> Vec<usize> {
        (0..400).map(|i| i % 16).collect()
    }

    fn logits(trainer: &Trainer) -> Tensor {
        trainer.model().forward(&[vec![1, 2, 3]], None).unwrap().logits
    }

    #[test]
    fn resume_rejects_another_positional_scheme() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(&cycle(), dir.path()).unwrap();
        let path = dir.path().join("standard.ckpt");
        let other = ModelConfig {
            rotary_form: RotaryForm::Standard,
            ..trainer.model().config.clone()
        };
        let ckpt = Checkpoint::from_model(&LanguageModel::new(&other, 1).unwrap(), 3, 1.0);

        let before = logits(&trainer);
        assert!(matches!(
            trainer.resume(&ckpt, &path),
            Err(ArcaneError::InvalidConfig(_))
        ));
        assert_eq!(logits(&trainer), before);
        assert_eq!(trainer.iteration(), 0);

        let unrotated = ModelConfig {
            rotary: false,
            ..trainer.model().config.clone()
        };
        let ckpt = Checkpoint::from_model(&LanguageModel::new(&unrotated, 1).unwrap(), 3, 1.0);
        assert!(trainer.resume(&ckpt, &path).is_err());
    }

    #[test]
    fn resume_accepts_a_different_dropout() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(&cycle(), dir.path()).unwrap();
        let stored = ModelConfig {
            dropout: 0.2,
            ..trainer.model().config.clone()
        };
        let ckpt = Checkpoint::from_model(&LanguageModel::new(&stored, 1).unwrap(), 2, 1.0);
        trainer.resume(&ckpt, &dir.path().join("d.ckpt")).unwrap();
        assert_eq!(trainer.model().config.dropout, 0.0);
        assert_eq!(trainer.iteration(), 2);
    }

    #[test]
    fn continuing_past_max_iters_takes_no_steps() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(&cycle(), dir.path()).unwrap();
        let config = trainer.model().config.clone();
        let ckpt = Checkpoint::from_model(&LanguageModel::new(&config, 1).unwrap(), 4000, 1.0);

        trainer.resume(&ckpt, &dir.path().join("long.ckpt")).unwrap();
        assert_eq!(trainer.iteration(), 4000);
        let summary = trainer.run().unwrap();
        assert_eq!(summary.iterations, 4000);
        assert!(summary.last_train_loss.is_none());
    }

    #[test]
    fn fine_tuning_restarts_the_iteration_count() {
        let dir = tempfile::tempdir().unwrap();
        let mut trainer = setup(&cycle(), dir.path()).unwrap();
        trainer.config.resume_mode = ResumeMode::FineTune;
        trainer.config.warmup_iters = 4;
        let config = trainer.model().config.clone();
        let pretrained = LanguageModel::new(&config, 7).unwrap();
        let ckpt = Checkpoint::from_model(&pretrained, 4000, 1.0);

        trainer.resume(&ckpt, &dir.path().join("pretrained.ckpt")).unwrap();
        assert_eq!(trainer.iteration(), 0);
        // warmup starts over: (0 + 1) / 4 of the base rate
        assert!((trainer.learning_rate() - trainer.config.learning_rate / 4.0).abs() <= 1e-9);
        assert_eq!(
            logits(&trainer),
            pretrained.forward(&[vec![1, 2, 3]], None).unwrap().logits
        );

        let summary = trainer.run().unwrap();
        assert_eq!(summary.iterations, 6);
        assert!(summary.last_train_loss.is_some());
    }
}
