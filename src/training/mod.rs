//! GRPO training for the query-expansion policy.
//!
//! - [`advantage`] -- group-relative reward normalisation.
//! - [`logprob`] -- sequence log-probabilities under policy and reference.
//! - [`grpo`] -- the KL-regularised loss and the Adam update.
//! - [`checkpoint`] -- adapter checkpoints on disk.
//! - [`eval`] -- greedy structural evaluation.
//! - [`pipeline`] -- the trainer state machine.

pub mod advantage;
pub mod checkpoint;
pub mod eval;
pub mod grpo;
pub mod logprob;
pub mod pipeline;

pub use advantage::compute_group_advantages;
pub use checkpoint::CheckpointStore;
pub use eval::{evaluate, load_queries, EvalReport};
pub use grpo::{compose_loss, compute_grpo_loss, GrpoLoss, GrpoTrainer};
pub use logprob::{reference_log_probs, sequence_log_prob};
pub use pipeline::{Phase, RunSummary, StepMetrics, Trainer};
