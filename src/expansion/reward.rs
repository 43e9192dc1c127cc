//! Rule-based reward for query expansions.
//!
//! Two scales are provided:
//!
//! - [`score_expansion`] -- the structural score in `[0, 100]`:
//!
//!   total = 40 * format_valid + 10 * min(lex, 3) + 10 * min(vec, 3) + 20 * has_hyde
//!
//! - [`score_expansion_detailed`] -- the structural score plus 40 quality
//!   points (query coverage, diversity, hyde length), in `[0, 140]`. This is
//!   the scale used as the RL reward, normalised by [`REWARD_SCALE`].
//!
//! Neither function can fail: empty or garbage text scores zero.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::format::{parse_output_text, OutputKind};

/// Weight of the format gate (all three kinds present).
pub const FORMAT_WEIGHT: u32 = 40;
/// Weight per counted lex or vec line.
pub const FIELD_WEIGHT: u32 = 10;
/// Weight of having a hyde passage.
pub const HYDE_WEIGHT: u32 = 20;
/// Lex/vec lines beyond this many are not rewarded.
pub const MAX_COUNTED_LINES: u32 = 3;
/// Maximum of the structural score.
pub const STRUCTURE_MAX: u32 = 100;

const COVERAGE_WEIGHT: f64 = 20.0;
const DIVERSITY_WEIGHT: f64 = 10.0;
const HYDE_LENGTH_WEIGHT: f64 = 10.0;
const HYDE_MIN_CHARS: usize = 20;
const HYDE_MAX_CHARS: usize = 400;

/// Maximum of the detailed score.
pub const DETAILED_MAX: f64 =
    STRUCTURE_MAX as f64 + COVERAGE_WEIGHT + DIVERSITY_WEIGHT + HYDE_LENGTH_WEIGHT;

/// Divisor mapping a detailed total into a `[0, 1]` reward.
pub const REWARD_SCALE: f64 = DETAILED_MAX;

// ---------------------------------------------------------------------------
// Structural score
// ---------------------------------------------------------------------------

/// Structural sub-scores of one expansion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardScore {
    pub has_lex: bool,
    pub has_vec: bool,
    pub has_hyde: bool,
    pub lex_count: u32,
    pub vec_count: u32,
    /// True iff lex, vec and hyde are all present.
    pub format_valid: bool,
    /// Weighted total in `[0, 100]`.
    pub total: u32,
}

impl RewardScore {
    /// Whether the score reaches the structural maximum.
    pub fn is_perfect(&self) -> bool {
        self.total >= STRUCTURE_MAX
    }
}

/// Score the structure of an expansion.
pub fn score_expansion(text: &str) -> RewardScore {
    let mut score = RewardScore::default();

    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match OutputKind::classify(line) {
            Some((OutputKind::Lex, _)) => {
                score.has_lex = true;
                score.lex_count += 1;
            }
            Some((OutputKind::Vec, _)) => {
                score.has_vec = true;
                score.vec_count += 1;
            }
            Some((OutputKind::Hyde, _)) => score.has_hyde = true,
            None => {}
        }
    }

    score.format_valid = score.has_lex && score.has_vec && score.has_hyde;
    score.total = u32::from(score.format_valid) * FORMAT_WEIGHT
        + score.lex_count.min(MAX_COUNTED_LINES) * FIELD_WEIGHT
        + score.vec_count.min(MAX_COUNTED_LINES) * FIELD_WEIGHT
        + u32::from(score.has_hyde) * HYDE_WEIGHT;

    score
}

// ---------------------------------------------------------------------------
// Detailed score
// ---------------------------------------------------------------------------

/// Coarse quality band derived from the detailed percentage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Rating {
    Failed,
    Poor,
    Acceptable,
    Good,
    Excellent,
}

impl Rating {
    pub fn from_percentage(pct: f64) -> Self {
        match pct {
            p if p >= 90.0 => Self::Excellent,
            p if p >= 70.0 => Self::Good,
            p if p >= 50.0 => Self::Acceptable,
            p if p >= 30.0 => Self::Poor,
            _ => Self::Failed,
        }
    }
}

impl fmt::Display for Rating {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Failed => "Failed",
            Self::Poor => "Poor",
            Self::Acceptable => "Acceptable",
            Self::Good => "Good",
            Self::Excellent => "Excellent",
        };
        f.write_str(s)
    }
}

/// Structural score plus quality sub-scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetailedScore {
    pub structure: RewardScore,
    /// Share of query terms echoed by the lex lines, scaled to 20.
    pub coverage: f64,
    /// Share of distinct entries, scaled to 10.
    pub diversity: f64,
    /// 10 when the hyde passage has a plausible length, else 0.
    pub hyde_length: f64,
    /// Sum of all parts, in `[0, DETAILED_MAX]`.
    pub total: f64,
    /// `total / DETAILED_MAX * 100`.
    pub percentage: f64,
    pub rating: Rating,
}

/// Score an expansion on the wider scale used for RL rewards.
pub fn score_expansion_detailed(query: &str, text: &str) -> DetailedScore {
    let structure = score_expansion(text);
    let items = parse_output_text(text);

    let query_terms: HashSet<String> = terms(query).collect();
    let lex_terms: HashSet<String> = items
        .iter()
        .filter(|item| item.kind == OutputKind::Lex)
        .flat_map(|item| terms(&item.text))
        .collect();
    let coverage = if query_terms.is_empty() {
        0.0
    } else {
        let hit = query_terms.intersection(&lex_terms).count();
        COVERAGE_WEIGHT * hit as f64 / query_terms.len() as f64
    };

    let diversity = if items.is_empty() {
        0.0
    } else {
        let distinct: HashSet<String> = items
            .iter()
            .map(|item| item.text.trim().to_lowercase())
            .filter(|text| !text.is_empty())
            .collect();
        DIVERSITY_WEIGHT * distinct.len() as f64 / items.len() as f64
    };

    let hyde_length = items
        .iter()
        .find(|item| item.kind == OutputKind::Hyde)
        .map(|item| item.text.chars().count())
        .filter(|len| (HYDE_MIN_CHARS..=HYDE_MAX_CHARS).contains(len))
        .map_or(0.0, |_| HYDE_LENGTH_WEIGHT);

    let total = structure.total as f64 + coverage + diversity + hyde_length;
    let percentage = total / DETAILED_MAX * 100.0;

    DetailedScore {
        structure,
        coverage,
        diversity,
        hyde_length,
        total,
        percentage,
        rating: Rating::from_percentage(percentage),
    }
}

/// RL reward for a completion, in `[0, 1]`.
pub fn compute_reward(query: &str, completion: &str) -> f64 {
    score_expansion_detailed(query, completion).total / REWARD_SCALE
}

fn terms(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERFECT: &str = "hyde: The Renaissance was a cultural movement in Europe.
lex: Renaissance period 14th century
lex: Renaissance art culture
vec: what was the Renaissance period
vec: how did the Renaissance transform art";

    #[test]
    fn test_empty_output() {
        let score = score_expansion("");
        assert_eq!(score.total, 0);
        assert!(!score.format_valid);
        assert_eq!(score, RewardScore::default());
    }

    #[test]
    fn test_garbage_output() {
        let score = score_expansion("\u{0}\u{1}???\n:::lex\n  \n<|im_end|>");
        assert_eq!(score.total, 0);
    }

    #[test]
    fn test_perfect_format() {
        let score = score_expansion(PERFECT);
        assert!(score.has_lex && score.has_vec && score.has_hyde);
        assert!(score.format_valid);
        assert_eq!(score.total, 40 + 20 + 20 + 20);
        assert!(score.is_perfect());
    }

    #[test]
    fn test_one_of_each_is_at_least_80() {
        let score = score_expansion("lex: a\nvec: b\nhyde: c");
        assert!(score.format_valid);
        assert_eq!(score.total, 80);
    }

    #[test]
    fn test_missing_hyde() {
        let score = score_expansion("lex: auth config\nlex: authentication setup\nvec: how to configure auth");
        assert!(!score.has_hyde);
        assert!(!score.format_valid);
        assert_eq!(score.total, 20 + 10);
    }

    #[test]
    fn test_missing_lex() {
        let score = score_expansion("hyde: To configure auth, use the config file.\nvec: how to set up auth");
        assert!(!score.has_lex);
        assert!(!score.format_valid);
        assert_eq!(score.total, 10 + 20);
    }

    #[test]
    fn test_multiple_lex_capped() {
        let text = "hyde: Test\nlex: term1\nlex: term2\nlex: term3\nlex: term4\nvec: query";
        let score = score_expansion(text);
        assert_eq!(score.lex_count, 4);
        assert_eq!(score.total, 40 + 30 + 10 + 20);
    }

    #[test]
    fn test_multiple_vec_capped() {
        let text = "hyde: Test\nlex: term\nvec: q1\nvec: q2\nvec: q3\nvec: q4";
        let score = score_expansion(text);
        assert_eq!(score.vec_count, 4);
        assert_eq!(score.total, 40 + 10 + 30 + 20);
    }

    #[test]
    fn test_whitespace_handling() {
        let score = score_expansion("  hyde: Some text  \n  lex: keyword  \n  vec: natural question  ");
        assert!(score.has_lex && score.has_vec && score.has_hyde);
    }

    #[test]
    fn test_case_sensitivity() {
        let score = score_expansion("HYDE: Some text\nLEX: keyword\nVEC: question");
        assert!(!score.has_lex);
        assert!(!score.has_vec);
        assert!(!score.has_hyde);
        assert_eq!(score.total, 0);
    }

    #[test]
    fn test_empty_trailing_text_still_counts() {
        let score = score_expansion("lex:\nvec:\nhyde:");
        assert!(score.format_valid);
        assert_eq!(score.total, 80);
    }

    #[test]
    fn test_detailed_perfect() {
        let text = "hyde: Authentication settings live in config/auth.yaml and control login.
lex: auth config
lex: authentication configuration
vec: how do I configure authentication
vec: where are auth settings stored";
        let detailed = score_expansion_detailed("auth config", text);
        assert_eq!(detailed.structure.total, 100);
        assert!((detailed.coverage - 20.0).abs() < 1e-9);
        assert!((detailed.diversity - 10.0).abs() < 1e-9);
        assert!((detailed.hyde_length - 10.0).abs() < 1e-9);
        assert!((detailed.total - DETAILED_MAX).abs() < 1e-9);
        assert!((detailed.percentage - 100.0).abs() < 1e-9);
        assert_eq!(detailed.rating, Rating::Excellent);
    }

    #[test]
    fn test_detailed_empty() {
        let detailed = score_expansion_detailed("auth config", "");
        assert_eq!(detailed.total, 0.0);
        assert_eq!(detailed.rating, Rating::Failed);
        assert_eq!(compute_reward("auth config", ""), 0.0);
    }

    #[test]
    fn test_detailed_partial_coverage_and_duplicates() {
        let text = "hyde: short\nlex: auth\nlex: auth\nvec: auth";
        let detailed = score_expansion_detailed("auth config", text);
        // One of two query terms covered.
        assert!((detailed.coverage - 10.0).abs() < 1e-9);
        // Two distinct texts ("short", "auth") over four entries.
        assert!((detailed.diversity - 5.0).abs() < 1e-9);
        // "short" is below the minimum passage length.
        assert_eq!(detailed.hyde_length, 0.0);
    }

    #[test]
    fn test_reward_is_normalized() {
        let reward = compute_reward("renaissance", PERFECT);
        assert!(reward > 0.0 && reward <= 1.0);
    }

    #[test]
    fn test_structure_ratio_preserved_in_detailed_scale() {
        // Format gate vs per-field weight is 4:1 on both scales.
        assert_eq!(FORMAT_WEIGHT, 4 * FIELD_WEIGHT);
        assert_eq!(DETAILED_MAX, 140.0);
    }

    #[test]
    fn test_rating_bands() {
        assert_eq!(Rating::from_percentage(95.0), Rating::Excellent);
        assert_eq!(Rating::from_percentage(70.0), Rating::Good);
        assert_eq!(Rating::from_percentage(50.0), Rating::Acceptable);
        assert_eq!(Rating::from_percentage(30.0), Rating::Poor);
        assert_eq!(Rating::from_percentage(29.9), Rating::Failed);
    }
}
