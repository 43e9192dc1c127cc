use std::path::PathBuf;

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::rollout::TemperatureSchedule;

/// Complete configuration for a GRPO query-expansion run.
///
/// Every section has defaults, so a config file only needs the fields it
/// overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QmdGrpoConfig {
    pub policy: PolicyConfig,
    pub rl: RlConfig,
    pub schedule: ScheduleConfig,
    pub eval: EvalConfig,
    pub remote: RemoteConfig,
    /// Directory receiving checkpoints and the final adapter.
    pub output_dir: PathBuf,
    /// Seed for adapter init, query selection and sampling.
    pub seed: u64,
    /// Training query pool; empty means the built-in pool.
    pub training_queries: Vec<String>,
}

/// Policy model configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Rank of the LoRA adapter (default: 8).
    pub lora_rank: usize,
    /// LoRA scaling numerator; the update is scaled by alpha / rank (default: 16).
    pub lora_alpha: f64,
    /// JSONL dataset used to estimate the base model (default: built-in seed set).
    pub base_corpus: Option<PathBuf>,
    /// Adapter to start training from, e.g. an SFT result.
    pub adapter: Option<PathBuf>,
    /// Fixed adapter to use as the KL reference. Defaults to a snapshot of the
    /// policy at run start.
    pub reference_adapter: Option<PathBuf>,
}

/// RL training configuration (GRPO).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlConfig {
    /// Completions sampled per query (default: 4).
    pub num_generations: usize,
    /// Generation budget per completion in tokens (default: 200).
    pub max_tokens: usize,
    /// KL penalty coefficient (default: 0.04).
    pub beta: f64,
    /// Adam learning rate (default: 5e-6).
    pub learning_rate: f64,
    /// Number of training steps (default: 200).
    pub max_steps: usize,
    /// Temperature of the first completion in a group (default: 1.0).
    pub temperature_min: f64,
    /// Temperature of the last completion in a group (default: 2.0).
    pub temperature_max: f64,
    /// Nucleus sampling mass (default: 0.9).
    pub top_p: f64,
}

impl RlConfig {
    pub fn temperature_schedule(&self) -> TemperatureSchedule {
        TemperatureSchedule {
            min: self.temperature_min,
            max: self.temperature_max,
        }
    }
}

/// Step cadences. An interval of 0 disables the action.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Log step metrics every N steps (default: 5).
    pub log_every: usize,
    /// Write a checkpoint every N steps (default: 50).
    pub save_every: usize,
    /// Run evaluation every N steps (default: 50).
    pub eval_every: usize,
}

/// Evaluation configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvalConfig {
    /// One query per line (default: `evals/queries.txt`).
    pub queries_file: PathBuf,
    /// Generation budget per evaluation query (default: 200).
    pub max_tokens: usize,
}

/// Remote OpenAI-compatible endpoint, used by `eval --remote` and
/// `expand --remote`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_base: String,
    /// Filled from `OPENAI_API_KEY` when empty.
    pub api_key: String,
    pub model_id: String,
}

impl Default for QmdGrpoConfig {
    fn default() -> Self {
        Self {
            policy: PolicyConfig::default(),
            rl: RlConfig::default(),
            schedule: ScheduleConfig::default(),
            eval: EvalConfig::default(),
            remote: RemoteConfig::default(),
            output_dir: PathBuf::from("adapters/qmd-grpo"),
            seed: 42,
            training_queries: Vec::new(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            lora_rank: 8,
            lora_alpha: 16.0,
            base_corpus: None,
            adapter: None,
            reference_adapter: None,
        }
    }
}

impl Default for RlConfig {
    fn default() -> Self {
        Self {
            num_generations: 4,
            max_tokens: 200,
            beta: 0.04,
            learning_rate: 5e-6,
            max_steps: 200,
            temperature_min: 1.0,
            temperature_max: 2.0,
            top_p: 0.9,
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            log_every: 5,
            save_every: 50,
            eval_every: 50,
        }
    }
}

impl Default for EvalConfig {
    fn default() -> Self {
        Self {
            queries_file: PathBuf::from("evals/queries.txt"),
            max_tokens: 200,
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_base: "http://localhost:8000/v1".into(),
            api_key: String::new(),
            model_id: "qmd-query-expansion".into(),
        }
    }
}

impl QmdGrpoConfig {
    /// Reject settings the trainer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rl;
        if rl.num_generations < 2 {
            bail!(
                "rl.num_generations must be at least 2 for group-relative advantages, got {}",
                rl.num_generations
            );
        }
        if rl.max_tokens == 0 {
            bail!("rl.max_tokens must be positive");
        }
        if self.eval.max_tokens == 0 {
            bail!("eval.max_tokens must be positive");
        }
        if rl.temperature_min > rl.temperature_max {
            bail!(
                "rl.temperature_min ({}) exceeds rl.temperature_max ({})",
                rl.temperature_min,
                rl.temperature_max
            );
        }
        if !(rl.top_p > 0.0 && rl.top_p <= 1.0) {
            bail!("rl.top_p must be in (0, 1], got {}", rl.top_p);
        }
        if rl.beta < 0.0 {
            bail!("rl.beta must be non-negative, got {}", rl.beta);
        }
        if self.policy.lora_rank == 0 {
            bail!("policy.lora_rank must be positive");
        }
        if self
            .training_queries
            .iter()
            .any(|q| q.trim().is_empty())
        {
            bail!("training_queries must not contain empty queries");
        }
        Ok(())
    }
}
