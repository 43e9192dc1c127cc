//! Greedy evaluation of a generator over a query list.

use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::expansion::{score_expansion, RewardScore};
use crate::model::prompt::strip_terminal_marker;
use crate::model::Generator;

/// Summary of one evaluation pass over structural scores (`0..=100`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalReport {
    pub avg: f64,
    /// Queries scoring the structural maximum.
    pub perfect: usize,
    pub total: usize,
    pub min: u32,
    pub max: u32,
}

impl EvalReport {
    pub fn from_scores(scores: &[RewardScore]) -> Option<Self> {
        let totals: Vec<u32> = scores.iter().map(|s| s.total).collect();
        let min = *totals.iter().min()?;
        let max = *totals.iter().max()?;
        Some(Self {
            avg: totals.iter().map(|&t| t as f64).sum::<f64>() / totals.len() as f64,
            perfect: scores.iter().filter(|s| s.is_perfect()).count(),
            total: totals.len(),
            min,
            max,
        })
    }
}

/// Read evaluation queries: one per line, trimmed. Blank lines and lines
/// starting with `#` are skipped.
pub fn load_queries(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read queries from {}", path.display()))?;
    let queries: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(String::from)
        .collect();
    if queries.is_empty() {
        bail!("{} contains no queries", path.display());
    }
    Ok(queries)
}

/// Generate greedily for every query and score the structure.
pub async fn evaluate<G: Generator>(
    generator: &mut G,
    queries: &[String],
    max_tokens: usize,
) -> Result<EvalReport> {
    let mut scores = Vec::with_capacity(queries.len());
    for query in queries {
        let raw = generator.generate(query, max_tokens, 0.0).await?;
        let score = score_expansion(&strip_terminal_marker(&raw));
        debug!(query = %query, total = score.total, "evaluated query");
        scores.push(score);
    }

    let report = EvalReport::from_scores(&scores).context("no queries to evaluate")?;
    info!(
        avg = report.avg,
        perfect = report.perfect,
        total = report.total,
        min = report.min,
        max = report.max,
        "evaluation finished"
    );
    Ok(report)
}
