//! JSONL training examples and dataset-level reward statistics.
//!
//! Every line of a dataset file is one example:
//!
//! ```text
//! {"query": "auth config", "output": [["hyde", "..."], ["lex", "..."], ["vec", "..."]]}
//! ```
//!
//! Extra fields are ignored. Any invalid line fails the whole load with a
//! `path:line` error.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use super::format::{normalize_output_items, render_output, OutputItem, OutputKind};
use super::reward::score_expansion_detailed;

/// One example in the canonical JSONL format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingExample {
    pub query: String,
    /// `[kind, text]` pairs.
    pub output: Vec<(String, String)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_short: Option<bool>,
}

impl TrainingExample {
    /// Check the schema rules and return the typed output items.
    pub fn items(&self) -> Result<Vec<OutputItem>> {
        if self.query.trim().is_empty() {
            bail!("query must not be empty");
        }
        if self.output.is_empty() {
            bail!("output must not be empty");
        }
        self.output
            .iter()
            .enumerate()
            .map(|(i, (kind, text))| {
                let kind = OutputKind::from_name(kind)
                    .with_context(|| format!("output[{i}] has unknown type {kind:?}"))?;
                if text.trim().is_empty() {
                    bail!("output[{i}] text must not be empty");
                }
                Ok(OutputItem::new(kind, text.clone()))
            })
            .collect()
    }

    /// Render the output as hyde-first prefixed text.
    pub fn output_text(&self) -> Result<String> {
        let items = self.items()?;
        Ok(render_output(&normalize_output_items(&items, true)))
    }
}

/// Load and validate a JSONL dataset. Blank lines are skipped.
pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<TrainingExample>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read dataset {}", path.display()))?;

    let mut examples = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let line_num = idx + 1;
        let example: TrainingExample = serde_json::from_str(line)
            .with_context(|| format!("{}:{line_num}: invalid JSON", path.display()))?;
        example
            .items()
            .with_context(|| format!("{}:{line_num}: schema violation", path.display()))?;
        examples.push(example);
    }
    Ok(examples)
}

// ---------------------------------------------------------------------------
// Dataset scoring
// ---------------------------------------------------------------------------

/// Aggregate detailed-score statistics for a dataset.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DatasetReport {
    pub scored: usize,
    pub errors: usize,
    pub avg: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    /// Percentage of examples scoring at least 70%.
    pub at_least_70_pct: f64,
    /// Count of examples per rating.
    pub ratings: BTreeMap<String, usize>,
}

/// Score every example by its detailed percentage.
///
/// Examples whose rendered output is empty are counted as errors.
pub fn score_examples(examples: &[TrainingExample]) -> DatasetReport {
    let mut report = DatasetReport::default();
    let mut scores = Vec::with_capacity(examples.len());

    for example in examples {
        let text = match example.output_text() {
            Ok(text) if !text.is_empty() => text,
            _ => {
                report.errors += 1;
                continue;
            }
        };
        let detailed = score_expansion_detailed(&example.query, &text);
        *report.ratings.entry(detailed.rating.to_string()).or_default() += 1;
        scores.push(detailed.percentage);
    }

    if scores.is_empty() {
        return report;
    }

    scores.sort_by(|a, b| a.total_cmp(b));
    let n = scores.len();
    report.scored = n;
    report.avg = scores.iter().sum::<f64>() / n as f64;
    report.median = if n % 2 == 1 {
        scores[n / 2]
    } else {
        (scores[n / 2 - 1] + scores[n / 2]) / 2.0
    };
    report.min = scores[0];
    report.max = scores[n - 1];
    report.at_least_70_pct =
        scores.iter().filter(|&&s| s >= 70.0).count() as f64 / n as f64 * 100.0;
    report
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn example(query: &str, output: &[(&str, &str)]) -> TrainingExample {
        TrainingExample {
            query: query.into(),
            output: output
                .iter()
                .map(|(k, t)| (k.to_string(), t.to_string()))
                .collect(),
            category: None,
            intent: None,
            is_short: None,
        }
    }

    #[test]
    fn test_load_examples() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"query": "auth config", "output": [["lex", "auth config"], ["vec", "how to configure auth"]], "category": "dev"}}"#
        )
        .unwrap();
        writeln!(file).unwrap();
        writeln!(
            file,
            r#"{{"query": "rate limiting", "output": [["hyde", "Rate limits cap requests."]], "extra": 1}}"#
        )
        .unwrap();

        let examples = load_examples(file.path()).unwrap();
        assert_eq!(examples.len(), 2);
        assert_eq!(examples[0].category.as_deref(), Some("dev"));
        assert_eq!(examples[1].items().unwrap()[0].kind, OutputKind::Hyde);
    }

    #[test]
    fn test_load_examples_reports_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"query": "ok", "output": [["lex", "ok"]]}}"#).unwrap();
        writeln!(file, r#"{{"query": "bad", "output": [["LEX", "bad"]]}}"#).unwrap();

        let err = load_examples(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains(":2:"), "got {err:#}");
    }

    #[test]
    fn test_items_rejects_empty_text() {
        let ex = example("q", &[("lex", "  ")]);
        assert!(ex.items().is_err());
        let ex = example(" ", &[("lex", "x")]);
        assert!(ex.items().is_err());
        let ex = example("q", &[]);
        assert!(ex.items().is_err());
    }

    #[test]
    fn test_output_text_is_hyde_first() {
        let ex = example("q", &[("vec", "v"), ("lex", "l"), ("hyde", "h")]);
        assert_eq!(ex.output_text().unwrap(), "hyde: h\nlex: l\nvec: v");
    }

    #[test]
    fn test_score_examples() {
        let good = example(
            "auth config",
            &[
                ("hyde", "Authentication settings live in config/auth.yaml."),
                ("lex", "auth config"),
                ("lex", "authentication configuration"),
                ("vec", "how do I configure authentication"),
                ("vec", "where are auth settings stored"),
            ],
        );
        let weak = example("auth config", &[("lex", "auth")]);
        let broken = example("auth config", &[("nope", "x")]);

        let report = score_examples(&[good, weak, broken]);
        assert_eq!(report.scored, 2);
        assert_eq!(report.errors, 1);
        assert!((report.max - 100.0).abs() < 1e-9);
        assert!(report.min < 30.0);
        assert!((report.at_least_70_pct - 50.0).abs() < 1e-9);
        assert_eq!(report.ratings.get("Excellent"), Some(&1));
    }

    #[test]
    fn test_score_examples_empty() {
        let report = score_examples(&[]);
        assert_eq!(report.scored, 0);
        assert_eq!(report.avg, 0.0);
    }
}
