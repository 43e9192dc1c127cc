//! Group sampling with an ascending temperature schedule.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::prompt::strip_terminal_marker;
use crate::model::Generator;

use super::types::Completion;

/// Linear temperature ramp across a group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureSchedule {
    pub min: f64,
    pub max: f64,
}

impl Default for TemperatureSchedule {
    fn default() -> Self {
        Self { min: 1.0, max: 2.0 }
    }
}

impl TemperatureSchedule {
    /// Temperature for index `i` of a group of `n`.
    ///
    ///   t_i = min + (max - min) * i / max(1, n - 1)
    pub fn temperature(&self, i: usize, n: usize) -> f64 {
        let denom = n.saturating_sub(1).max(1) as f64;
        self.min + (self.max - self.min) * i as f64 / denom
    }
}

/// Draw `n` completions for `query`, one per scheduled temperature.
///
/// Completions are generated in order; the first generation error aborts the
/// group.
pub async fn sample_group<G: Generator>(
    generator: &mut G,
    query: &str,
    n: usize,
    schedule: TemperatureSchedule,
    max_tokens: usize,
) -> Result<Vec<Completion>> {
    if n == 0 {
        bail!("group size must be positive");
    }

    let mut group = Vec::with_capacity(n);
    for i in 0..n {
        let temperature = schedule.temperature(i, n);
        let raw = generator.generate(query, max_tokens, temperature).await?;
        let text = strip_terminal_marker(&raw);
        debug!(query, index = i, temperature, chars = text.len(), "sampled completion");
        group.push(Completion::new(text, temperature));
    }
    Ok(group)
}
