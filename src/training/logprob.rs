//! Sequence log-probabilities of completions.

use anyhow::{Context, Result};
use candle_core::{DType, Tensor, D};
use candle_nn::ops::log_softmax;

use crate::model::CausalLm;
use crate::rollout::Completion;

/// `log P(completion | prompt)` summed over the completion tokens.
///
/// Gradients flow through the result when `model` holds trainable variables.
/// An empty completion has log-probability 0.
pub fn sequence_log_prob<M: CausalLm>(model: &M, prompt: &str, completion: &str) -> Result<Tensor> {
    let tokenizer = model.tokenizer();
    let mut ids = tokenizer.encode(prompt);
    let prompt_len = ids.len();
    let completion_ids = tokenizer.encode_raw(completion);
    if completion_ids.is_empty() {
        return Ok(Tensor::zeros((), DType::F32, model.device())?);
    }
    let n = completion_ids.len();
    ids.extend_from_slice(&completion_ids);

    // Position t predicts token t + 1.
    let logits = model.forward(&ids[..ids.len() - 1])?;
    let log_probs = log_softmax(&logits, D::Minus1)?;
    let rows = log_probs.narrow(0, prompt_len - 1, n)?;
    let targets = Tensor::new(completion_ids.as_slice(), model.device())?.unsqueeze(1)?;
    Ok(rows.gather(&targets, 1)?.sum_all()?)
}

/// Detached log-probabilities of every completion under a frozen model.
pub fn reference_log_probs<M: CausalLm>(
    reference: &M,
    prompt: &str,
    completions: &[Completion],
) -> Result<Vec<f64>> {
    completions
        .iter()
        .enumerate()
        .map(|(i, c)| {
            let lp = sequence_log_prob(reference, prompt, &c.text)
                .with_context(|| format!("reference log-prob failed for completion {i}"))?;
            Ok(lp.detach().to_scalar::<f32>()? as f64)
        })
        .collect()
}
