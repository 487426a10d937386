//! Schedule for whether target embeddings receive gradient.
//!
//! Targets start detached and are attached, once and for good, when the best
//! validation score reaches the configured threshold. A threshold of `-1`
//! keeps them detached for the whole run.

use burn::tensor::{backend::Backend, Tensor};
use serde::{Deserialize, Serialize};

/// Setting value that disables the transition.
pub const NEVER_ATTACH: f64 = -1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TargetGradient {
    Detached,
    Attached,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GradientPolicy {
    /// `None` when targets stay detached for good
    threshold: Option<f64>,
    state: TargetGradient,
}

impl GradientPolicy {
    pub fn from_setting(target_gradient_from: f64) -> Self {
        let threshold = (target_gradient_from != NEVER_ATTACH).then_some(target_gradient_from);
        Self {
            threshold,
            state: TargetGradient::Detached,
        }
    }

    /// Adopt the threshold of a new run while keeping the transition already made.
    ///
    /// [`NEVER_ATTACH`] always detaches, even after the transition.
    pub fn reconfigure(&mut self, target_gradient_from: f64) {
        let state = self.state;
        *self = Self::from_setting(target_gradient_from);
        if self.threshold.is_some() {
            self.state = state;
        }
    }

    pub fn state(&self) -> TargetGradient {
        self.state
    }

    /// Feed the best validation score so far; returns `true` on the transition.
    pub fn observe(&mut self, best_score: f64) -> bool {
        match (self.state, self.threshold) {
            (TargetGradient::Detached, Some(threshold)) if best_score >= threshold => {
                self.state = TargetGradient::Attached;
                log::info!(
                    "best score {:.4} reached {:.4}: targets now receive gradient",
                    best_score,
                    threshold
                );
                true
            }
            _ => false,
        }
    }

    /// Apply the current state to the target embeddings.
    pub fn apply<B: Backend, const D: usize>(&self, targets: Tensor<B, D>) -> Tensor<B, D> {
        match self.state {
            TargetGradient::Detached => targets.detach(),
            TargetGradient::Attached => targets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_never_attach() {
        let mut policy = GradientPolicy::from_setting(-1.0);
        for score in [0.0, 0.5, 1.0, 100.0] {
            assert!(!policy.observe(score));
        }
        assert_eq!(policy.state(), TargetGradient::Detached);
    }

    #[test]
    fn test_zero_threshold_attaches_on_first_observation() {
        let mut policy = GradientPolicy::from_setting(0.0);
        assert!(policy.observe(0.0));
        assert_eq!(policy.state(), TargetGradient::Attached);
    }

    #[test]
    fn test_reconfigure_to_never_attach_detaches() {
        let mut policy = GradientPolicy::from_setting(0.0);
        policy.observe(0.3);

        let mut raised = policy;
        raised.reconfigure(0.9);
        assert_eq!(raised.state(), TargetGradient::Attached);

        policy.reconfigure(NEVER_ATTACH);
        assert_eq!(policy.state(), TargetGradient::Detached);
        assert!(!policy.observe(1.0));
    }

    #[test]
    fn test_transition_is_one_way() {
        let mut policy = GradientPolicy::from_setting(0.4);
        let states: Vec<TargetGradient> = [0.1, 0.3, 0.45, 0.2, 0.05]
            .into_iter()
            .map(|score| {
                policy.observe(score);
                policy.state()
            })
            .collect();

        assert_eq!(
            states,
            vec![
                TargetGradient::Detached,
                TargetGradient::Detached,
                TargetGradient::Attached,
                TargetGradient::Attached,
                TargetGradient::Attached,
            ]
        );
    }
}
