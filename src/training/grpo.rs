//! Group Relative Policy Optimization (GRPO) loss and update.
//!
//! For a group of G completions of one prompt:
//!
//!   kl_i   = log pi_theta(c_i) - log pi_ref(c_i)
//!   term_i = -A_i * log pi_theta(c_i) + beta * |kl_i|
//!   loss   = 1/G * sum_i term_i
//!
//! where A_i are the group-relative advantages. Only `log pi_theta` carries
//! gradients; reference log-probs and advantages are constants.

use anyhow::{bail, Result};
use candle_core::Tensor;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use tracing::debug;

use crate::config::RlConfig;
use crate::model::{CausalLm, LoraPolicy};
use crate::rollout::Completion;

use super::logprob::sequence_log_prob;

// ---------------------------------------------------------------------------
// Loss
// ---------------------------------------------------------------------------

/// The loss of one group.
#[derive(Debug)]
pub struct GrpoLoss {
    /// Scalar loss tensor, differentiable w.r.t. the policy adapter.
    pub loss: Tensor,
    /// Mean of `policy_lp - ref_lp` over the group.
    pub kl: f64,
}

impl GrpoLoss {
    pub fn value(&self) -> Result<f64> {
        Ok(self.loss.to_scalar::<f32>()? as f64)
    }
}

/// Combine per-completion policy log-probs with constants into the group loss.
pub fn compose_loss(
    policy_log_probs: &[Tensor],
    reference_log_probs: &[f64],
    advantages: &[f64],
    beta: f64,
) -> Result<GrpoLoss> {
    let g = policy_log_probs.len();
    if g == 0 {
        bail!("Cannot compute GRPO loss for an empty group");
    }
    if reference_log_probs.len() != g || advantages.len() != g {
        bail!(
            "GRPO inputs differ in length: {g} policy log-probs, {} reference log-probs, {} advantages",
            reference_log_probs.len(),
            advantages.len()
        );
    }

    let mut terms = Vec::with_capacity(g);
    let mut total_kl = 0.0;
    for ((policy_lp, &ref_lp), &advantage) in policy_log_probs
        .iter()
        .zip(reference_log_probs)
        .zip(advantages)
    {
        let kl = policy_lp.affine(1.0, -ref_lp)?;
        total_kl += kl.to_scalar::<f32>()? as f64;

        let pg = policy_lp.affine(-advantage, 0.0)?;
        let penalty = kl.abs()?.affine(beta, 0.0)?;
        terms.push(pg.add(&penalty)?);
    }

    let loss = Tensor::stack(&terms, 0)?.mean_all()?;
    Ok(GrpoLoss {
        loss,
        kl: total_kl / g as f64,
    })
}

/// Score every completion under the live policy and compose the group loss.
pub fn compute_grpo_loss<M: CausalLm>(
    policy: &M,
    prompt: &str,
    completions: &[Completion],
    advantages: &[f64],
    reference_log_probs: &[f64],
    beta: f64,
) -> Result<GrpoLoss> {
    let policy_log_probs = completions
        .iter()
        .map(|c| sequence_log_prob(policy, prompt, &c.text))
        .collect::<Result<Vec<_>>>()?;
    compose_loss(&policy_log_probs, reference_log_probs, advantages, beta)
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Applies GRPO updates to the adapter of a [`LoraPolicy`].
pub struct GrpoTrainer {
    optimizer: AdamW,
    beta: f64,
}

impl GrpoTrainer {
    /// Adam over the policy's trainable variables (no weight decay).
    pub fn new(policy: &LoraPolicy, config: &RlConfig) -> Result<Self> {
        let params = ParamsAdamW {
            lr: config.learning_rate,
            weight_decay: 0.0,
            ..Default::default()
        };
        let optimizer = AdamW::new(policy.vars(), params)?;
        Ok(Self {
            optimizer,
            beta: config.beta,
        })
    }

    pub fn beta(&self) -> f64 {
        self.beta
    }

    /// Compute the group loss and take one optimizer step.
    ///
    /// Requires exclusive access to the policy, so no sampling can overlap
    /// with the update.
    pub fn train_step(
        &mut self,
        policy: &mut LoraPolicy,
        prompt: &str,
        completions: &[Completion],
        advantages: &[f64],
        reference_log_probs: &[f64],
    ) -> Result<(f64, f64)> {
        let grpo = compute_grpo_loss(
            &*policy,
            prompt,
            completions,
            advantages,
            reference_log_probs,
            self.beta,
        )?;
        let loss = grpo.value()?;
        self.optimizer.backward_step(&grpo.loss)?;
        debug!(loss, kl = grpo.kl, group = completions.len(), "applied GRPO update");
        Ok((loss, grpo.kl))
    }
}

/// Whether a cadence with the given interval fires at `step` (1-indexed).
/// An interval of 0 never fires.
pub fn is_due(step: usize, interval: usize) -> bool {
    interval != 0 && step > 0 && step % interval == 0
}
