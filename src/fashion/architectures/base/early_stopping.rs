//! Patience-based early stopping over validation scores.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarlyStoppingMonitor {
    patience: usize,
    delta: f64,
    /// Checks still to be ignored
    warmup_remaining: usize,
    best: Option<f64>,
    /// Epochs since the last improvement
    counter: usize,
}

impl EarlyStoppingMonitor {
    pub fn new(patience: usize, delta: f64, warmup: usize) -> Self {
        Self {
            patience,
            delta,
            warmup_remaining: warmup,
            best: None,
            counter: 0,
        }
    }

    /// Replace patience, delta and warmup with a new run's settings.
    ///
    /// Best score and counter carry over. Warmup is measured in checks since the
    /// start of training, so checks already taken count against it.
    pub fn reconfigure(&mut self, patience: usize, delta: f64, warmup: usize, checks_taken: usize) {
        self.patience = patience;
        self.delta = delta;
        self.warmup_remaining = warmup.saturating_sub(checks_taken);
    }

    /// Record a validation score taken `epochs_per_check` epochs after the previous one.
    ///
    /// A score of at least `best + delta` is an improvement and resets the
    /// counter; anything else adds `epochs_per_check` to it. The boundary is
    /// inclusive: a rise of exactly `delta` counts, which relies on the sum
    /// being exact in `f64` (it is for `0.5 + 0.01 == 0.51`, not for every pair).
    pub fn should_stop(&mut self, score: f64, epochs_per_check: usize) -> bool {
        if self.warmup_remaining > 0 {
            self.warmup_remaining -= 1;
            return false;
        }

        if self.best.map_or(true, |best| score >= best + self.delta) {
            self.best = Some(score);
            self.counter = 0;
        } else {
            self.counter += epochs_per_check;
        }

        log::debug!(
            "early stopping: score {:.4}, best {:.4}, {}/{} epochs without improvement",
            score,
            self.best.unwrap_or(score),
            self.counter,
            self.patience
        );
        self.counter >= self.patience
    }

    pub fn best(&self) -> Option<f64> {
        self.best
    }
}
