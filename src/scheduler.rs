//! Learning-Rate Schedules
//!
//! The scheduler produces a multiplier on the base learning rate; the trainer
//! passes `learning_rate * multiplier()` to the optimizer and then calls
//! [`LrScheduler::step`].
//!
//! ```text
//! WarmupOnly:    m(s) = min((s + 1) / warmup, 1)
//!
//! WarmupCosine:  m(s) = (s + 1) / warmup                          s < warmup
//!                m(s) = r + (1 - r) * 0.5 * (1 + cos(π * p))      warmup <= s <= decay_iters
//!                m(s) = r                                         s > decay_iters
//!                p = (s - warmup) / (decay_iters - warmup),  r = min_lr / lr
//! ```
//!
//! A warmup of zero disables warmup in both schedules.

use serde::{Deserialize, Serialize};
use std::f32::consts::PI;

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedule {
    /// Linear warmup, then constant.
    WarmupOnly { warmup: usize },
    /// Linear warmup, then cosine decay to `min_ratio`.
    WarmupCosine {
        warmup: usize,
        decay_iters: usize,
        min_ratio: f32,
    },
}

impl LrSchedule {
    /// Multiplier at `step`.
    pub fn multiplier(&self, step: usize) -> f32 {
        match *self {
            LrSchedule::WarmupOnly { warmup } => warmup_factor(step, warmup).unwrap_or(1.0),
            LrSchedule::WarmupCosine {
                warmup,
                decay_iters,
                min_ratio,
            } => {
                if let Some(f) = warmup_factor(step, warmup) {
                    return f;
                }
                if step > decay_iters || decay_iters <= warmup {
                    return min_ratio;
                }
                let progress = (step - warmup) as f32 / (decay_iters - warmup) as f32;
                let coeff = 0.5 * (1.0 + (PI * progress).cos());
                min_ratio + coeff * (1.0 - min_ratio)
            }
        }
    }
}

/// `Some((step + 1) / warmup)` while warming up.
fn warmup_factor(step: usize, warmup: usize) -> Option<f32> {
    (step < warmup).then(|| (step + 1) as f32 / warmup as f32)
}

/// A schedule plus the number of steps taken so far.
#[derive(Clone, Debug)]
pub struct LrScheduler {
    schedule: LrSchedule,
    step: usize,
}

impl LrScheduler {
    pub fn new(schedule: LrSchedule) -> Self {
        Self { schedule, step: 0 }
    }

    /// Pick the schedule from training settings: cosine decay when
    /// `decay_lr` is set, warmup-only otherwise.
    pub fn from_config(config: &crate::config::TrainConfig) -> Self {
        let schedule = if config.decay_lr {
            let min_ratio = if config.learning_rate > 0.0 {
                config.min_lr / config.learning_rate
            } else {
                0.0
            };
            LrSchedule::WarmupCosine {
                warmup: config.warmup_iters,
                decay_iters: config.lr_decay_iters,
                min_ratio,
            }
        } else {
            LrSchedule::WarmupOnly {
                warmup: config.warmup_iters,
            }
        };
        Self::new(schedule)
    }

    /// Resume at a later step (after loading a checkpoint).
    pub fn starting_at(mut self, step: usize) -> Self {
        self.step = step;
        self
    }

    pub fn schedule(&self) -> LrSchedule {
        self.schedule
    }

    pub fn current_step(&self) -> usize {
        self.step
    }

    pub fn multiplier(&self) -> f32 {
        self.schedule.multiplier(self.step)
    }

    pub fn step(&mut self) {
        self.step += 1;
    }
}
