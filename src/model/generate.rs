//! Text generation behind a common interface.
//!
//! [`Generator`] is implemented by [`LocalGenerator`], which samples from any
//! [`CausalLm`] in process, and by the remote chat client in
//! [`super::api`]. Both take a bare query and apply their own prompt format.

use anyhow::{Context, Result};
use rand::distributions::WeightedIndex;
use rand::prelude::Distribution;
use rand::rngs::StdRng;
use tracing::debug;

use super::lora::CausalLm;
use super::prompt::{build_prompt, TERMINAL_MARKER};
use super::tokenizer::EOS;

/// Produces a query expansion at a given sampling temperature.
#[allow(async_fn_in_trait)]
pub trait Generator {
    /// Generate raw text for `query`. A temperature `<= 0` means greedy.
    async fn generate(&mut self, query: &str, max_tokens: usize, temperature: f64)
        -> Result<String>;
}

/// Autoregressive sampler over an in-process model.
///
/// Holds a shared borrow of the model, so the model cannot be updated while
/// a generator is alive.
pub struct LocalGenerator<'a, M: CausalLm> {
    model: &'a M,
    rng: &'a mut StdRng,
    top_p: f64,
}

impl<'a, M: CausalLm> LocalGenerator<'a, M> {
    pub fn new(model: &'a M, rng: &'a mut StdRng, top_p: f64) -> Self {
        Self { model, rng, top_p }
    }

    /// Sample completion token ids for `query`, excluding the stop token.
    ///
    /// `BOS` is never sampled and the byte sequence is kept valid UTF-8, so
    /// the returned ids are exactly the bytes of the decoded text. A
    /// character cut off by `max_tokens` is dropped.
    pub fn sample_tokens(
        &mut self,
        query: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<Vec<u32>> {
        let tokenizer = *self.model.tokenizer();
        let mut ids = tokenizer.encode(&build_prompt(query));
        let prompt_len = ids.len();
        let marker = TERMINAL_MARKER.as_bytes();
        let mut guard = Utf8Guard::default();
        let mut complete = prompt_len;

        for _ in 0..max_tokens {
            let mut logits = self.model.next_token_logits(&ids)?;
            guard.mask(&mut logits);
            let next = self.sample(&logits, temperature)?;
            if next == EOS {
                break;
            }
            let byte = u8::try_from(next).context("sampled a non-byte token")?;
            ids.push(next);
            guard.push(byte);
            if guard.at_boundary() {
                complete = ids.len();
                if ends_with_marker(&ids[prompt_len..], marker) {
                    break;
                }
            }
        }

        ids.truncate(complete);
        Ok(ids.split_off(prompt_len))
    }

    fn sample(&mut self, logits: &[f32], temperature: f64) -> Result<u32> {
        if temperature <= 0.0 {
            return Ok(argmax(logits));
        }
        let probs = nucleus(logits, temperature, self.top_p);
        let dist = WeightedIndex::new(probs.iter().map(|&(_, p)| p))
            .context("degenerate sampling distribution")?;
        Ok(probs[dist.sample(&mut *self.rng)].0)
    }
}

impl<M: CausalLm> Generator for LocalGenerator<'_, M> {
    async fn generate(
        &mut self,
        query: &str,
        max_tokens: usize,
        temperature: f64,
    ) -> Result<String> {
        let ids = self.sample_tokens(query, max_tokens, temperature)?;
        debug!(query, temperature, tokens = ids.len(), "local generation finished");
        let bytes = ids.into_iter().map(|id| id as u8).collect();
        String::from_utf8(bytes).context("sampled bytes are not valid UTF-8")
    }
}

fn ends_with_marker(ids: &[u32], marker: &[u8]) -> bool {
    ids.len() >= marker.len()
        && ids[ids.len() - marker.len()..]
            .iter()
            .zip(marker)
            .all(|(&id, &b)| id == u32::from(b))
}

// ---------------------------------------------------------------------------
// UTF-8 constraint
// ---------------------------------------------------------------------------

/// Tracks a partially emitted UTF-8 character and the byte range allowed next.
#[derive(Debug, Clone, Copy)]
struct Utf8Guard {
    /// Continuation bytes still owed by the current character.
    remaining: u8,
    lo: u8,
    hi: u8,
}

impl Default for Utf8Guard {
    fn default() -> Self {
        Self {
            remaining: 0,
            lo: 0x80,
            hi: 0xBF,
        }
    }
}

impl Utf8Guard {
    fn at_boundary(&self) -> bool {
        self.remaining == 0
    }

    fn allows(&self, id: u32) -> bool {
        match u8::try_from(id) {
            // Only EOS among special ids, and never inside a character.
            Err(_) => id == EOS && self.at_boundary(),
            Ok(b) if !self.at_boundary() => (self.lo..=self.hi).contains(&b),
            Ok(b) => b < 0x80 || (0xC2..=0xF4).contains(&b),
        }
    }

    fn mask(&self, logits: &mut [f32]) {
        for (id, logit) in logits.iter_mut().enumerate() {
            if !self.allows(id as u32) {
                *logit = f32::NEG_INFINITY;
            }
        }
    }

    fn push(&mut self, byte: u8) {
        if !self.at_boundary() {
            *self = Self {
                remaining: self.remaining - 1,
                ..Self::default()
            };
            return;
        }
        let (remaining, lo, hi) = match byte {
            0xC2..=0xDF => (1, 0x80, 0xBF),
            0xE0 => (2, 0xA0, 0xBF),
            0xED => (2, 0x80, 0x9F),
            0xE1..=0xEF => (2, 0x80, 0xBF),
            0xF0 => (3, 0x90, 0xBF),
            0xF1..=0xF3 => (3, 0x80, 0xBF),
            0xF4 => (3, 0x80, 0x8F),
            _ => (0, 0x80, 0xBF),
        };
        *self = Self { remaining, lo, hi };
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map_or(0, |(i, _)| i as u32)
}

/// Temperature softmax restricted to the smallest set of tokens whose mass
/// reaches `top_p`. Returns `(token, probability)` in descending order.
fn nucleus(logits: &[f32], temperature: f64, top_p: f64) -> Vec<(u32, f64)> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let weights: Vec<f64> = logits
        .iter()
        .map(|&l| ((l as f64 - max) / temperature).exp())
        .collect();
    let total: f64 = weights.iter().sum();

    let mut probs: Vec<(u32, f64)> = weights
        .into_iter()
        .enumerate()
        .map(|(i, w)| (i as u32, w / total))
        .collect();
    probs.sort_by(|a, b| b.1.total_cmp(&a.1));

    let mut mass = 0.0;
    let mut keep = 0;
    for &(_, p) in &probs {
        keep += 1;
        mass += p;
        if mass >= top_p {
            break;
        }
    }
    probs.truncate(keep.max(1));
    probs
}
