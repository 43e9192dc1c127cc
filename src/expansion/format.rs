//! Line-oriented expansion format.
//!
//! A query expansion is a sequence of prefixed lines:
//!
//! ```text
//! hyde: Authentication is configured in config/auth.yaml ...
//! lex: auth config
//! lex: authentication settings
//! vec: how do I configure authentication
//! ```
//!
//! Prefixes are literal and case-sensitive. `LEX:` is not a lex line.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The three kinds of expansion line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputKind {
    /// Keyword query for lexical (BM25-style) search.
    Lex,
    /// Natural-language query for vector search.
    Vec,
    /// Hypothetical document passage.
    Hyde,
}

impl OutputKind {
    pub const ALL: [OutputKind; 3] = [OutputKind::Lex, OutputKind::Vec, OutputKind::Hyde];

    /// The literal line prefix, including the colon.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Lex => "lex:",
            Self::Vec => "vec:",
            Self::Hyde => "hyde:",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Lex => "lex",
            Self::Vec => "vec",
            Self::Hyde => "hyde",
        }
    }

    /// Parse a bare kind name (`"lex"`, `"vec"`, `"hyde"`).
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "lex" => Some(Self::Lex),
            "vec" => Some(Self::Vec),
            "hyde" => Some(Self::Hyde),
            _ => None,
        }
    }

    /// Classify an already-trimmed line by its prefix.
    ///
    /// Returns the kind and the remainder after the prefix (untrimmed).
    pub fn classify(line: &str) -> Option<(Self, &str)> {
        Self::ALL
            .into_iter()
            .find_map(|kind| line.strip_prefix(kind.prefix()).map(|rest| (kind, rest)))
    }

    fn order(self) -> u8 {
        match self {
            Self::Hyde => 0,
            Self::Lex => 1,
            Self::Vec => 2,
        }
    }
}

impl fmt::Display for OutputKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One `kind: text` line of an expansion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputItem {
    pub kind: OutputKind,
    pub text: String,
}

impl OutputItem {
    pub fn new(kind: OutputKind, text: impl Into<String>) -> Self {
        Self {
            kind,
            text: text.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Parsing and rendering
// ---------------------------------------------------------------------------

/// Parse prefixed output text into items.
///
/// Lines are trimmed; blank and unprefixed lines are skipped. The text after
/// the prefix is trimmed but may be empty.
pub fn parse_output_text(text: &str) -> Vec<OutputItem> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            OutputKind::classify(line).map(|(kind, rest)| OutputItem::new(kind, rest.trim()))
        })
        .collect()
}

/// Stable reorder: all hyde items, then lex, then vec.
pub fn reorder_hyde_first(items: &[OutputItem]) -> Vec<OutputItem> {
    let mut ordered = items.to_vec();
    // sort_by_key is stable, so relative order within a kind is kept.
    ordered.sort_by_key(|item| item.kind.order());
    ordered
}

/// Trim item texts, drop empty ones, and optionally reorder hyde-first.
pub fn normalize_output_items(items: &[OutputItem], hyde_first: bool) -> Vec<OutputItem> {
    let normalized: Vec<OutputItem> = items
        .iter()
        .filter_map(|item| {
            let text = item.text.trim();
            (!text.is_empty()).then(|| OutputItem::new(item.kind, text))
        })
        .collect();

    if hyde_first {
        reorder_hyde_first(&normalized)
    } else {
        normalized
    }
}

/// Render items as `kind: text` lines joined by newlines.
pub fn render_output(items: &[OutputItem]) -> String {
    items
        .iter()
        .map(|item| format!("{}: {}", item.kind, item.text))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Keep only the prefixed lines of raw model output, trimmed.
///
/// Used when handing an expansion to a downstream search pipeline, which
/// expects nothing but `lex:`/`vec:`/`hyde:` lines.
pub fn filter_expansion_lines(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .filter(|line| OutputKind::classify(line).is_some())
        .collect::<Vec<_>>()
        .join("\n")
}
