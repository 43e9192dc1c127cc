//! Low-rank adapted policy on top of the bigram base.
//!
//! For a previous token `p`, the next-token logits are
//!
//!   logits = base[p] + (alpha / rank) * lora_a[p] . lora_b
//!
//! `lora_a` (`[vocab, rank]`) starts from a seeded uniform draw and `lora_b`
//! (`[rank, vocab]`) starts at zero, so a fresh policy reproduces the base.
//! Only the two adapter matrices are trainable.

use std::path::Path;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::base::BigramBase;
use super::tokenizer::{ByteTokenizer, VOCAB_SIZE};

pub const LORA_A: &str = "lora_a";
pub const LORA_B: &str = "lora_b";

// ---------------------------------------------------------------------------
// Model capability
// ---------------------------------------------------------------------------

/// A causal language model over [`ByteTokenizer`] ids.
pub trait CausalLm {
    fn tokenizer(&self) -> &ByteTokenizer;

    fn device(&self) -> &Device;

    /// Next-token logits for every position of `ids`, shape `[len, vocab]`.
    fn forward(&self, ids: &[u32]) -> Result<Tensor>;

    /// Logits for the token following `ids`.
    fn next_token_logits(&self, ids: &[u32]) -> Result<Vec<f32>> {
        if ids.is_empty() {
            bail!("cannot predict from an empty context");
        }
        let logits = self.forward(ids)?;
        Ok(logits.get(ids.len() - 1)?.to_vec1::<f32>()?)
    }
}

/// Shared forward pass of policy and reference.
fn adapted_logits(
    base: &BigramBase,
    lora_a: &Tensor,
    lora_b: &Tensor,
    scale: f64,
    ids: &[u32],
) -> Result<Tensor> {
    if ids.is_empty() {
        bail!("cannot run forward on an empty sequence");
    }
    let idx = Tensor::new(ids, base.device())?;
    let base_rows = base.log_probs().index_select(&idx, 0)?;
    let delta = lora_a.index_select(&idx, 0)?.matmul(lora_b)?;
    Ok(base_rows.add(&delta.affine(scale, 0.0)?)?)
}

// ---------------------------------------------------------------------------
// Trainable policy
// ---------------------------------------------------------------------------

/// The live policy. Owns the only trainable parameters in a run.
pub struct LoraPolicy {
    base: BigramBase,
    varmap: VarMap,
    lora_a: Tensor,
    lora_b: Tensor,
    rank: usize,
    alpha: f64,
    tokenizer: ByteTokenizer,
}

impl LoraPolicy {
    pub fn new(base: BigramBase, rank: usize, alpha: f64, seed: u64) -> Result<Self> {
        if rank == 0 {
            bail!("LoRA rank must be positive");
        }
        let device = base.device().clone();
        let mut varmap = VarMap::new();
        let (lora_a, lora_b) = {
            let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
            (
                vb.get_with_hints((VOCAB_SIZE, rank), LORA_A, Init::Const(0.0))?,
                vb.get_with_hints((rank, VOCAB_SIZE), LORA_B, Init::Const(0.0))?,
            )
        };

        let mut rng = StdRng::seed_from_u64(seed);
        let bound = 1.0 / (VOCAB_SIZE as f32).sqrt();
        let init: Vec<f32> = (0..VOCAB_SIZE * rank)
            .map(|_| rng.gen_range(-bound..bound))
            .collect();
        varmap.set_one(LORA_A, Tensor::from_vec(init, (VOCAB_SIZE, rank), &device)?)?;

        debug!(rank, alpha, seed, "initialised LoRA adapter");

        Ok(Self {
            base,
            varmap,
            lora_a,
            lora_b,
            rank,
            alpha,
            tokenizer: ByteTokenizer,
        })
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn scale(&self) -> f64 {
        self.alpha / self.rank as f64
    }

    pub fn base(&self) -> &BigramBase {
        &self.base
    }

    /// Trainable variables, for the optimizer.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    /// Snapshot the current adapter into an independent frozen reference.
    pub fn freeze(&self) -> Result<ReferencePolicy> {
        Ok(ReferencePolicy {
            base: self.base.clone(),
            lora_a: self.lora_a.copy()?.detach(),
            lora_b: self.lora_b.copy()?.detach(),
            scale: self.scale(),
            tokenizer: self.tokenizer,
        })
    }

    /// Write the adapter matrices as safetensors.
    pub fn save_adapter(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .save(path)
            .with_context(|| format!("Failed to save adapter to {}", path.display()))
    }

    /// Overwrite the adapter matrices from a safetensors file.
    pub fn load_adapter(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.varmap
            .load(path)
            .with_context(|| format!("Failed to load adapter from {}", path.display()))?;
        info!(path = %path.display(), "loaded LoRA adapter");
        Ok(())
    }
}

impl CausalLm for LoraPolicy {
    fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn forward(&self, ids: &[u32]) -> Result<Tensor> {
        adapted_logits(&self.base, &self.lora_a, &self.lora_b, self.scale(), ids)
    }

    fn next_token_logits(&self, ids: &[u32]) -> Result<Vec<f32>> {
        // Bigram: only the last token conditions the next one.
        let last = ids.last().context("cannot predict from an empty context")?;
        let logits = self.forward(std::slice::from_ref(last))?;
        Ok(logits.get(0)?.to_vec1::<f32>()?)
    }
}

// ---------------------------------------------------------------------------
// Frozen reference
// ---------------------------------------------------------------------------

/// Read-only policy snapshot used for the KL penalty.
///
/// Holds plain tensors, never [`Var`]s, so optimizer steps on the live
/// policy cannot reach it.
#[derive(Debug, Clone)]
pub struct ReferencePolicy {
    base: BigramBase,
    lora_a: Tensor,
    lora_b: Tensor,
    scale: f64,
    tokenizer: ByteTokenizer,
}

impl ReferencePolicy {
    /// Load a fixed adapter file as the reference.
    pub fn from_adapter_file(
        base: BigramBase,
        rank: usize,
        alpha: f64,
        path: impl AsRef<Path>,
    ) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, base.device())
            .with_context(|| format!("Failed to read reference adapter {}", path.display()))?;

        let take = |name: &str, dims: (usize, usize)| -> Result<Tensor> {
            let t = tensors
                .get(name)
                .with_context(|| format!("{} has no tensor {name}", path.display()))?;
            if t.dims2()? != dims {
                bail!(
                    "{name} in {} has shape {:?}, expected {dims:?}",
                    path.display(),
                    t.dims()
                );
            }
            Ok(t.to_dtype(DType::F32)?.detach())
        };

        Ok(Self {
            lora_a: take(LORA_A, (VOCAB_SIZE, rank))?,
            lora_b: take(LORA_B, (rank, VOCAB_SIZE))?,
            base,
            scale: alpha / rank as f64,
            tokenizer: ByteTokenizer,
        })
    }
}

impl CausalLm for ReferencePolicy {
    fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    fn device(&self) -> &Device {
        self.base.device()
    }

    fn forward(&self, ids: &[u32]) -> Result<Tensor> {
        adapted_logits(&self.base, &self.lora_a, &self.lora_b, self.scale, ids)
    }
}
