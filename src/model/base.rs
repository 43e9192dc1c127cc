//! Frozen bigram base model.
//!
//! The base is a `[vocab, vocab]` table of next-token log-probabilities
//! estimated from a text corpus with additive smoothing. It carries no
//! gradients and is shared read-only between the live policy and its frozen
//! reference.

use anyhow::{bail, Result};
use candle_core::{Device, Tensor};
use tracing::info;

use super::prompt::build_prompt;
use super::tokenizer::{ByteTokenizer, EOS, VOCAB_SIZE};

/// Pseudo-count added to every bigram cell.
const SMOOTHING: f64 = 0.01;

/// Built-in expansions used when no base corpus is configured.
const SEED_EXPANSIONS: &[(&str, &str)] = &[
    (
        "auth config",
        "hyde: Authentication is configured in config/auth.yaml, which sets the provider, token lifetime and allowed redirect URLs.\nlex: auth config\nlex: authentication configuration\nvec: how do I configure authentication for the app\nvec: where are the auth settings stored",
    ),
    (
        "rate limiting",
        "hyde: Rate limiting caps how many requests a client may send per window and returns 429 when the limit is exceeded.\nlex: rate limiting\nlex: request throttling\nvec: how to add rate limiting to an api\nvec: what happens when a client exceeds the rate limit",
    ),
    (
        "database connection",
        "hyde: The database connection is opened from a pool using the DATABASE_URL environment variable at startup.\nlex: database connection\nlex: connection pool\nvec: how to connect to the database\nvec: how is the database connection pool configured",
    ),
    (
        "docker compose networking",
        "hyde: Services in a compose file share a default network and reach each other by service name.\nlex: docker compose networking\nlex: compose network\nvec: how do containers talk to each other in docker compose\nvec: how to define a custom network in docker compose",
    ),
    (
        "memory leak debugging",
        "hyde: A heap snapshot taken before and after the suspect operation shows which objects are retained and never freed.\nlex: memory leak debugging\nlex: heap profiling\nvec: how to find a memory leak\nvec: which tools help debug growing memory usage",
    ),
];

/// Bigram next-token log-probability table.
#[derive(Debug, Clone)]
pub struct BigramBase {
    log_probs: Tensor,
}

impl BigramBase {
    /// Estimate the table from complete training sequences.
    ///
    /// Each text is encoded with a leading `BOS` and closed with `EOS`.
    pub fn from_corpus(texts: &[String], device: &Device) -> Result<Self> {
        if texts.is_empty() {
            bail!("base corpus is empty");
        }

        let tokenizer = ByteTokenizer;
        let mut counts = vec![0u64; VOCAB_SIZE * VOCAB_SIZE];
        for text in texts {
            let mut ids = tokenizer.encode(text);
            ids.push(EOS);
            for pair in ids.windows(2) {
                counts[pair[0] as usize * VOCAB_SIZE + pair[1] as usize] += 1;
            }
        }

        let mut table = Vec::with_capacity(counts.len());
        for row in counts.chunks(VOCAB_SIZE) {
            let total = row.iter().sum::<u64>() as f64 + SMOOTHING * VOCAB_SIZE as f64;
            table.extend(
                row.iter()
                    .map(|&c| ((c as f64 + SMOOTHING) / total).ln() as f32),
            );
        }

        info!(
            sequences = texts.len(),
            vocab = VOCAB_SIZE,
            "built bigram base model"
        );

        let log_probs = Tensor::from_vec(table, (VOCAB_SIZE, VOCAB_SIZE), device)?;
        Ok(Self { log_probs })
    }

    /// Base model estimated from the built-in seed expansions.
    pub fn seeded(device: &Device) -> Result<Self> {
        Self::from_corpus(&seed_corpus(), device)
    }

    /// `[vocab, vocab]` log-probability table.
    pub fn log_probs(&self) -> &Tensor {
        &self.log_probs
    }

    pub fn device(&self) -> &Device {
        self.log_probs.device()
    }
}

/// Render `(query, expansion)` pairs into full training sequences.
pub fn render_corpus<'a>(pairs: impl IntoIterator<Item = (&'a str, String)>) -> Vec<String> {
    pairs
        .into_iter()
        .map(|(query, expansion)| format!("{}{expansion}", build_prompt(query)))
        .collect()
}

/// The built-in seed sequences.
pub fn seed_corpus() -> Vec<String> {
    render_corpus(SEED_EXPANSIONS.iter().map(|(q, e)| (*q, e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expansion::score_expansion;

    #[test]
    fn test_seed_expansions_are_perfect() {
        for (_, expansion) in SEED_EXPANSIONS {
            assert!(score_expansion(expansion).is_perfect(), "{expansion}");
        }
    }

    #[test]
    fn test_rows_are_distributions() {
        let base = BigramBase::seeded(&Device::Cpu).unwrap();
        let probs = base.log_probs().exp().unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(probs.len(), VOCAB_SIZE);
        for row in probs.iter().take(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-3, "row sums to {sum}");
        }
    }

    #[test]
    fn test_observed_bigram_is_likelier() {
        let base = BigramBase::from_corpus(&["ab".to_string()], &Device::Cpu).unwrap();
        let table = base.log_probs().to_vec2::<f32>().unwrap();
        let a = b'a' as usize;
        assert!(table[a][b'b' as usize] > table[a][b'c' as usize]);
    }

    #[test]
    fn test_empty_corpus_is_error() {
        assert!(BigramBase::from_corpus(&[], &Device::Cpu).is_err());
    }
}
