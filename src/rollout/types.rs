//! Data recorded for every GRPO step.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

/// One sampled expansion, terminal marker stripped and trimmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Sampling temperature used to produce it.
    pub temperature: f64,
}

impl Completion {
    pub fn new(text: impl Into<String>, temperature: f64) -> Self {
        Self {
            text: text.into(),
            temperature,
        }
    }
}

// ---------------------------------------------------------------------------
// Step record
// ---------------------------------------------------------------------------

/// Everything one training step produced for its group.
///
/// Index `i` of `completions`, `rewards`, `advantages` and
/// `reference_log_probs` all describe the same completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_index: usize,
    pub query: String,
    pub completions: Vec<Completion>,
    pub rewards: Vec<f64>,
    pub advantages: Vec<f64>,
    pub reference_log_probs: Vec<f64>,
    pub loss: f64,
    pub kl: f64,
}

impl StepRecord {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        step_index: usize,
        query: impl Into<String>,
        completions: Vec<Completion>,
        rewards: Vec<f64>,
        advantages: Vec<f64>,
        reference_log_probs: Vec<f64>,
        loss: f64,
        kl: f64,
    ) -> Result<Self> {
        let n = completions.len();
        if n == 0 {
            bail!("step {step_index} has an empty group");
        }
        if rewards.len() != n || advantages.len() != n || reference_log_probs.len() != n {
            bail!(
                "step {step_index}: group lengths differ (completions {n}, rewards {}, advantages {}, reference log-probs {})",
                rewards.len(),
                advantages.len(),
                reference_log_probs.len()
            );
        }
        Ok(Self {
            step_index,
            query: query.into(),
            completions,
            rewards,
            advantages,
            reference_log_probs,
            loss,
            kl,
        })
    }

    pub fn group_size(&self) -> usize {
        self.completions.len()
    }

    pub fn mean_reward(&self) -> f64 {
        self.rewards.iter().sum::<f64>() / self.rewards.len() as f64
    }
}
