//! Query-expansion output format and its rule-based reward.
//!
//! - [`format`] -- parsing, normalising and rendering `lex:`/`vec:`/`hyde:` lines.
//! - [`reward`] -- the structural scorer and the detailed RL reward.
//! - [`dataset`] -- JSONL training examples and dataset score reports.

pub mod dataset;
pub mod format;
pub mod reward;

pub use format::{
    filter_expansion_lines, normalize_output_items, parse_output_text, render_output,
    reorder_hyde_first, OutputItem, OutputKind,
};
pub use reward::{
    compute_reward, score_expansion, score_expansion_detailed, DetailedScore, Rating,
    RewardScore, REWARD_SCALE,
};
