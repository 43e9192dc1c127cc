//! qmd-grpo: GRPO fine-tuning of a query-expansion policy
//!
//! Trains a LoRA-adapted policy to expand a short search query into
//! `lex:` keyword lines, `vec:` natural-language lines and a `hyde:`
//! hypothetical passage, rewarded by a deterministic structural scorer.

pub mod config;
pub mod expansion;
pub mod model;
pub mod rollout;
pub mod training;
