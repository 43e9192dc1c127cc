//! GRPO training loop as an explicit state machine.
//!
//! ```text
//! Idle ──> Running ──> Running ──> ... ──> Running (max_steps reached)
//!             │  ▲                              │
//!             ▼  │                              ▼
//!       Checkpointing ──> Evaluating     Checkpointing (final)
//!                                               │
//!                                               ▼
//!                                          Evaluating ──> Finished
//! ```
//!
//! Each call to [`Trainer::tick`] performs exactly one transition. A
//! `Running` tick executes one training step:
//!
//! 1. pick a query uniformly from the pool
//! 2. sample a group at ascending temperatures
//! 3. score every completion
//! 4. normalise rewards into advantages
//! 5. score completions under the frozen reference
//! 6. compose the loss and take one Adam step
//!
//! Cadences (`log_every`, `save_every`, `eval_every`) are independent; an
//! interval of 0 disables one. Failed checkpoint writes are logged and the
//! run continues; every other error aborts the run.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::Device;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::QmdGrpoConfig;
use crate::expansion::compute_reward;
use crate::expansion::dataset::load_examples;
use crate::model::base::{render_corpus, BigramBase};
use crate::model::prompt::build_prompt;
use crate::model::{LocalGenerator, LoraPolicy, ReferencePolicy};
use crate::rollout::{sample_group, StepRecord};

use super::advantage::compute_group_advantages;
use super::checkpoint::{
    load_adapter_config, resolve_adapter_path, CheckpointStore, ADAPTER_CONFIG_FILE,
};
use super::eval::{evaluate, EvalReport};
use super::grpo::{is_due, GrpoTrainer};
use super::logprob::reference_log_probs;

/// Built-in training query pool.
pub const DEFAULT_TRAINING_QUERIES: [&str; 20] = [
    "auth config",
    "how to deploy",
    "rate limiting",
    "database connection",
    "api keys",
    "error handling",
    "caching strategy",
    "user permissions",
    "typescript async await",
    "docker compose networking",
    "git rebase vs merge",
    "react useEffect cleanup",
    "kubernetes pod deployment",
    "AWS Lambda functions",
    "memory leak debugging",
    "cors error fix",
    "connection timeout error",
    "dependency injection",
    "sql vs nosql",
    "ci cd pipeline",
];

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

/// Where the trainer is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    Idle,
    Running,
    Checkpointing,
    Evaluating,
    Finished,
}

/// Metrics of one training step.
#[derive(Debug, Clone, Serialize)]
pub struct StepMetrics {
    /// 1-indexed step number.
    pub step: usize,
    pub query: String,
    pub loss: f64,
    pub kl: f64,
    pub mean_reward: f64,
    pub max_reward: f64,
    pub duration_secs: f64,
}

/// An evaluation and the step it ran after.
#[derive(Debug, Clone, Serialize)]
pub struct EvalRecord {
    pub step: usize,
    pub report: EvalReport,
}

/// What a finished run produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub steps: usize,
    pub metrics: Vec<StepMetrics>,
    pub evaluations: Vec<EvalRecord>,
    /// Step checkpoint directories written.
    pub checkpoints: Vec<PathBuf>,
    /// Directory holding the final adapter, if it was written.
    pub final_adapter: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// Construction helpers
// ---------------------------------------------------------------------------

/// Build the policy described by the config: base model from the configured
/// corpus (or the seed set), fresh adapter, then the starting adapter if any.
pub fn build_policy(config: &QmdGrpoConfig) -> Result<LoraPolicy> {
    let device = Device::Cpu;
    let base = match &config.policy.base_corpus {
        Some(path) => {
            let examples = load_examples(path)?;
            let pairs = examples
                .iter()
                .map(|ex| Ok((ex.query.as_str(), ex.output_text()?)))
                .collect::<Result<Vec<_>>>()?;
            BigramBase::from_corpus(&render_corpus(pairs), &device)?
        }
        None => BigramBase::seeded(&device)?,
    };

    let mut policy = LoraPolicy::new(
        base,
        config.policy.lora_rank,
        config.policy.lora_alpha,
        config.seed,
    )?;
    if let Some(adapter) = &config.policy.adapter {
        let path = resolve_adapter_path(adapter);
        if let Some(dir) = path.parent().filter(|d| d.join(ADAPTER_CONFIG_FILE).exists()) {
            let meta = load_adapter_config(dir)?;
            if meta.rank != policy.rank() {
                bail!(
                    "adapter {} has rank {}, config expects {}",
                    path.display(),
                    meta.rank,
                    policy.rank()
                );
            }
            info!(step = meta.step, run_id = %meta.run_id, "starting from adapter checkpoint");
        }
        policy.load_adapter(path)?;
    }
    Ok(policy)
}

/// The KL reference: a fixed adapter file if configured, else a snapshot of
/// `policy` as it is now.
pub fn build_reference(config: &QmdGrpoConfig, policy: &LoraPolicy) -> Result<ReferencePolicy> {
    match &config.policy.reference_adapter {
        Some(path) => ReferencePolicy::from_adapter_file(
            policy.base().clone(),
            policy.rank(),
            policy.alpha(),
            resolve_adapter_path(path),
        ),
        None => policy.freeze(),
    }
}

// ---------------------------------------------------------------------------
// Trainer
// ---------------------------------------------------------------------------

/// Drives a GRPO run. Owns the policy, its reference and the optimizer.
pub struct Trainer {
    config: QmdGrpoConfig,
    policy: LoraPolicy,
    reference: ReferencePolicy,
    optimizer: GrpoTrainer,
    store: CheckpointStore,
    queries: Vec<String>,
    eval_queries: Vec<String>,
    rng: StdRng,
    phase: Phase,
    step: usize,
    /// Set once `max_steps` is reached; the remaining phases are the final
    /// save and evaluation.
    finalizing: bool,
    eval_only: bool,
    last_record: Option<StepRecord>,
    summary: RunSummary,
}

impl Trainer {
    pub fn new(
        config: QmdGrpoConfig,
        policy: LoraPolicy,
        reference: ReferencePolicy,
        eval_queries: Vec<String>,
    ) -> Result<Self> {
        config.validate()?;
        if eval_queries.is_empty() {
            bail!("evaluation query list is empty");
        }

        let queries: Vec<String> = if config.training_queries.is_empty() {
            DEFAULT_TRAINING_QUERIES.iter().map(|q| q.to_string()).collect()
        } else {
            config.training_queries.clone()
        };

        let optimizer = GrpoTrainer::new(&policy, &config.rl)?;
        let store = CheckpointStore::new(&config.output_dir);
        let rng = StdRng::seed_from_u64(config.seed);

        Ok(Self {
            config,
            policy,
            reference,
            optimizer,
            store,
            queries,
            eval_queries,
            rng,
            phase: Phase::Idle,
            step: 0,
            finalizing: false,
            eval_only: false,
            last_record: None,
            summary: RunSummary::default(),
        })
    }

    /// Build policy and reference from the config.
    pub fn from_config(config: QmdGrpoConfig, eval_queries: Vec<String>) -> Result<Self> {
        let policy = build_policy(&config)?;
        let reference = build_reference(&config, &policy)?;
        Self::new(config, policy, reference, eval_queries)
    }

    /// Skip training: the run is a single evaluation.
    pub fn eval_only(mut self) -> Self {
        self.eval_only = true;
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Training steps completed.
    pub fn step(&self) -> usize {
        self.step
    }

    pub fn policy(&self) -> &LoraPolicy {
        &self.policy
    }

    pub fn reference(&self) -> &ReferencePolicy {
        &self.reference
    }

    pub fn last_record(&self) -> Option<&StepRecord> {
        self.last_record.as_ref()
    }

    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    /// Tick until `Finished` and return what the run produced.
    pub async fn run(mut self) -> Result<RunSummary> {
        while self.phase != Phase::Finished {
            self.tick().await?;
        }
        Ok(self.summary)
    }

    /// Perform one transition and return the new phase.
    pub async fn tick(&mut self) -> Result<Phase> {
        let next = match self.phase {
            Phase::Idle => self.start(),
            Phase::Running => self.run_phase().await?,
            Phase::Checkpointing => self.checkpoint_phase(),
            Phase::Evaluating => self.evaluate_phase().await?,
            Phase::Finished => Phase::Finished,
        };
        debug!(from = ?self.phase, to = ?next, step = self.step, "phase transition");
        self.phase = next;
        Ok(next)
    }

    fn start(&self) -> Phase {
        if self.eval_only {
            info!(queries = self.eval_queries.len(), "starting evaluation-only run");
            return Phase::Evaluating;
        }
        match self.store.list_checkpoints() {
            Ok(existing) if !existing.is_empty() => info!(
                existing = existing.len(),
                output_dir = %self.store.root().display(),
                "output directory holds earlier checkpoints, adding new ones alongside"
            ),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to list existing checkpoints"),
        }
        let rl = &self.config.rl;
        info!(
            max_steps = rl.max_steps,
            num_generations = rl.num_generations,
            beta = self.optimizer.beta(),
            learning_rate = rl.learning_rate,
            queries = self.queries.len(),
            output_dir = %self.config.output_dir.display(),
            "starting GRPO training"
        );
        Phase::Running
    }

    async fn run_phase(&mut self) -> Result<Phase> {
        if self.step >= self.config.rl.max_steps {
            self.finalizing = true;
            return Ok(Phase::Checkpointing);
        }

        let metrics = self.train_step().await?;
        if is_due(metrics.step, self.config.schedule.log_every) {
            info!(
                step = metrics.step,
                loss = metrics.loss,
                kl = metrics.kl,
                mean_reward = metrics.mean_reward,
                max_reward = metrics.max_reward,
                duration_secs = metrics.duration_secs,
                "training step"
            );
        }
        self.summary.metrics.push(metrics);
        self.summary.steps = self.step;

        let schedule = &self.config.schedule;
        Ok(if is_due(self.step, schedule.save_every) {
            Phase::Checkpointing
        } else if is_due(self.step, schedule.eval_every) {
            Phase::Evaluating
        } else {
            Phase::Running
        })
    }

    async fn train_step(&mut self) -> Result<StepMetrics> {
        let started = Instant::now();
        let rl = &self.config.rl;

        let query = self
            .queries
            .choose(&mut self.rng)
            .context("training query pool is empty")?
            .clone();
        let prompt = build_prompt(&query);

        // The generator borrows the policy immutably; no update can happen
        // until the whole group is sampled.
        let completions = {
            let mut generator = LocalGenerator::new(&self.policy, &mut self.rng, rl.top_p);
            sample_group(
                &mut generator,
                &query,
                rl.num_generations,
                rl.temperature_schedule(),
                rl.max_tokens,
            )
            .await?
        };

        let rewards: Vec<f64> = completions
            .iter()
            .map(|c| compute_reward(&query, &c.text))
            .collect();
        let advantages = compute_group_advantages(&rewards);
        let refs = reference_log_probs(&self.reference, &prompt, &completions)?;

        let (loss, kl) = self.optimizer.train_step(
            &mut self.policy,
            &prompt,
            &completions,
            &advantages,
            &refs,
        )?;
        self.step += 1;

        for (c, r) in completions.iter().zip(&rewards) {
            debug!(step = self.step, temperature = c.temperature, reward = r, text = %c.text, "completion");
        }

        let record = StepRecord::new(
            self.step,
            query.clone(),
            completions,
            rewards,
            advantages,
            refs,
            loss,
            kl,
        )?;
        let metrics = StepMetrics {
            step: self.step,
            query,
            loss,
            kl,
            mean_reward: record.mean_reward(),
            max_reward: record.rewards.iter().copied().fold(f64::MIN, f64::max),
            duration_secs: started.elapsed().as_secs_f64(),
        };
        self.last_record = Some(record);
        Ok(metrics)
    }

    fn checkpoint_phase(&mut self) -> Phase {
        if self.finalizing {
            match self.store.save_final(&self.policy, self.step) {
                Ok(dir) => {
                    info!(path = %dir.display(), step = self.step, "saved final adapter");
                    self.summary.final_adapter = Some(dir);
                }
                Err(e) => warn!(error = %e, "Failed to save final adapter"),
            }
            return Phase::Evaluating;
        }

        match self.store.save_step(&self.policy, self.step) {
            Ok(dir) => self.summary.checkpoints.push(dir),
            Err(e) => warn!(error = %e, step = self.step, "Failed to save checkpoint"),
        }
        if is_due(self.step, self.config.schedule.eval_every) {
            Phase::Evaluating
        } else {
            Phase::Running
        }
    }

    async fn evaluate_phase(&mut self) -> Result<Phase> {
        let report = {
            let mut generator =
                LocalGenerator::new(&self.policy, &mut self.rng, self.config.rl.top_p);
            evaluate(&mut generator, &self.eval_queries, self.config.eval.max_tokens).await?
        };
        self.summary.evaluations.push(EvalRecord {
            step: self.step,
            report,
        });

        Ok(if self.finalizing || self.eval_only {
            info!(steps = self.step, "run finished");
            Phase::Finished
        } else {
            Phase::Running
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CausalLm;
    use crate::training::checkpoint::ADAPTER_FILE;
    use crate::training::logprob::sequence_log_prob;

    fn test_config(output_dir: PathBuf) -> QmdGrpoConfig {
        let mut config = QmdGrpoConfig::default();
        config.rl.num_generations = 2;
        config.rl.max_tokens = 12;
        config.rl.max_steps = 4;
        config.rl.learning_rate = 1e-2;
        config.schedule.log_every = 1;
        config.schedule.save_every = 2;
        config.schedule.eval_every = 0;
        config.eval.max_tokens = 12;
        config.policy.lora_rank = 2;
        config.policy.lora_alpha = 4.0;
        config.output_dir = output_dir;
        config.training_queries = vec!["auth config".into(), "rate limiting".into()];
        config
    }

    fn eval_queries() -> Vec<String> {
        vec!["api keys".to_string()]
    }

    fn log_prob(model: &impl CausalLm) -> f32 {
        sequence_log_prob(model, &build_prompt("auth config"), "lex: auth config\nvec: auth")
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[tokio::test]
    async fn test_steps_and_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().join("out"));
        let trainer = Trainer::from_config(config, eval_queries()).unwrap();
        let summary = trainer.run().await.unwrap();

        assert_eq!(summary.steps, 4);
        assert_eq!(summary.metrics.len(), 4);
        let names: Vec<String> = summary
            .checkpoints
            .iter()
            .map(|p| {
                assert_eq!(p.parent(), Some(tmp.path().join("out").as_path()));
                p.file_name().unwrap().to_string_lossy().into_owned()
            })
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("ckpt_0002_"));
        assert!(names[1].starts_with("ckpt_0004_"));
        assert!(tmp.path().join("out").join(ADAPTER_FILE).exists());
        assert_eq!(summary.final_adapter, Some(tmp.path().join("out")));
        // Only the final evaluation runs when eval_every is 0.
        assert_eq!(summary.evaluations.len(), 1);
        assert_eq!(summary.evaluations[0].step, 4);
    }

    #[tokio::test]
    async fn test_exact_transitions() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path().to_path_buf());
        config.rl.max_steps = 2;
        config.schedule.save_every = 1;
        config.schedule.eval_every = 2;
        let mut trainer = Trainer::from_config(config, eval_queries()).unwrap();

        let mut phases = vec![trainer.phase()];
        while trainer.phase() != Phase::Finished {
            phases.push(trainer.tick().await.unwrap());
        }
        assert_eq!(
            phases,
            vec![
                Phase::Idle,
                Phase::Running,
                Phase::Checkpointing, // step 1
                Phase::Running,
                Phase::Checkpointing, // step 2
                Phase::Evaluating,
                Phase::Running,
                Phase::Checkpointing, // final
                Phase::Evaluating,
                Phase::Finished,
            ]
        );
        assert_eq!(trainer.step(), 2);
        assert_eq!(trainer.summary().evaluations.len(), 2);

        // Finished is terminal.
        assert_eq!(trainer.tick().await.unwrap(), Phase::Finished);
        assert_eq!(trainer.step(), 2);
    }

    #[tokio::test]
    async fn test_repeated_runs_keep_all_checkpoints() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out");

        let first = Trainer::from_config(test_config(out.clone()), eval_queries())
            .unwrap()
            .run()
            .await
            .unwrap();
        let second = Trainer::from_config(test_config(out.clone()), eval_queries())
            .unwrap()
            .run()
            .await
            .unwrap();

        assert_eq!(first.checkpoints.len(), 2);
        assert_eq!(second.checkpoints.len(), 2);
        assert!(first.checkpoints.iter().all(|p| p.exists()));
        assert_eq!(CheckpointStore::new(&out).list_checkpoints().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_step_record_lengths() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path().to_path_buf());
        config.rl.num_generations = 3;
        let mut trainer = Trainer::from_config(config, eval_queries()).unwrap();
        trainer.tick().await.unwrap();
        trainer.tick().await.unwrap();

        let record = trainer.last_record().unwrap();
        assert_eq!(record.step_index, 1);
        assert_eq!(record.group_size(), 3);
        assert_eq!(record.rewards.len(), 3);
        assert_eq!(record.advantages.len(), 3);
        assert_eq!(record.reference_log_probs.len(), 3);
        assert!(record.rewards.iter().all(|r| (0.0..=1.0).contains(r)));
        assert!(record.completions[0].temperature < record.completions[2].temperature);
    }

    #[tokio::test]
    async fn test_reference_is_frozen() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        let mut trainer = Trainer::from_config(config, eval_queries()).unwrap();

        let before = log_prob(trainer.reference());
        assert!((before - log_prob(trainer.policy())).abs() < 1e-5);

        trainer.tick().await.unwrap();
        for _ in 0..3 {
            trainer.tick().await.unwrap();
        }
        assert!(trainer.step() >= 1);
        assert_eq!(before, log_prob(trainer.reference()));
    }

    #[tokio::test]
    async fn test_eval_only() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().join("out"));
        let mut trainer = Trainer::from_config(config, eval_queries())
            .unwrap()
            .eval_only();

        assert_eq!(trainer.tick().await.unwrap(), Phase::Evaluating);
        assert_eq!(trainer.tick().await.unwrap(), Phase::Finished);
        assert_eq!(trainer.step(), 0);
        assert_eq!(trainer.summary().evaluations.len(), 1);
        assert!(!tmp.path().join("out").exists());
    }

    #[tokio::test]
    async fn test_checkpoint_failure_is_not_fatal() {
        let file = tempfile::NamedTempFile::new().unwrap();
        // A directory cannot be created below a regular file.
        let config = test_config(file.path().join("out"));
        let summary = Trainer::from_config(config, eval_queries())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(summary.steps, 4);
        assert!(summary.checkpoints.is_empty());
        assert!(summary.final_adapter.is_none());
    }

    #[tokio::test]
    async fn test_zero_steps_still_finalizes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path().to_path_buf());
        config.rl.max_steps = 0;
        let summary = Trainer::from_config(config, eval_queries())
            .unwrap()
            .run()
            .await
            .unwrap();
        assert_eq!(summary.steps, 0);
        assert!(summary.final_adapter.is_some());
        assert_eq!(summary.evaluations.len(), 1);
    }

    #[test]
    fn test_empty_eval_queries_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path().to_path_buf());
        assert!(Trainer::from_config(config, vec![]).is_err());
    }

    #[test]
    fn test_resume_from_adapter() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path().to_path_buf());
        let policy = build_policy(&config).unwrap();
        let path = tmp.path().join(ADAPTER_FILE);
        policy.save_adapter(&path).unwrap();

        config.policy.adapter = Some(tmp.path().to_path_buf());
        config.policy.reference_adapter = Some(path);
        let resumed = build_policy(&config).unwrap();
        let reference = build_reference(&config, &resumed).unwrap();
        assert!((log_prob(&resumed) - log_prob(&reference)).abs() < 1e-5);
    }

    #[test]
    fn test_resume_rejects_rank_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path().to_path_buf());
        let policy = build_policy(&config).unwrap();
        let dir = CheckpointStore::new(tmp.path()).save_step(&policy, 3).unwrap();

        config.policy.adapter = Some(dir.clone());
        assert!(build_policy(&config).is_ok());

        config.policy.lora_rank = 4;
        assert!(build_policy(&config).is_err());
    }
}
