//! Include/exclude filtering for named collections
//!
//! States (and per-browser or per-resolution entries) are narrowed with
//! filter rules before submission. A rule is either a literal string,
//! matched by exact equality, or a regular expression pattern carried as a
//! `{source, flags}` record so it survives JSON serialization.

use serde::{Deserialize, Serialize};

/// One filtering rule applied against a named field of a collection item.
///
/// On the wire a literal is a bare string and a pattern is an object:
/// `{"source": "^Nav", "flags": "i"}`. Patterns are never transmitted as a
/// native regex type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterRule {
    /// Exact string equality.
    Literal(String),
    /// Regular expression test. `flags` follows the usual single-letter
    /// convention; only `i` (case-insensitive) is meaningful here.
    Pattern {
        source: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        flags: String,
    },
}

impl FilterRule {
    /// Create a pattern rule.
    pub fn pattern(source: impl Into<String>, flags: impl Into<String>) -> Self {
        FilterRule::Pattern {
            source: source.into(),
            flags: flags.into(),
        }
    }

    /// Test this rule against a field value.
    ///
    /// Literals match by equality only; there is no substring fallback.
    /// A pattern that fails to compile matches nothing.
    pub fn matches(&self, value: &str) -> bool {
        match self {
            FilterRule::Literal(s) => s == value,
            FilterRule::Pattern { source, flags } => {
                let source = if flags.contains('i') {
                    format!("(?i){}", source)
                } else {
                    source.clone()
                };
                match regex_lite::Regex::new(&source) {
                    Ok(re) => re.is_match(value),
                    Err(_) => false,
                }
            }
        }
    }
}

fn matches_any(rules: &[FilterRule], value: &str) -> bool {
    rules.iter().any(|rule| rule.matches(value))
}

/// Narrow `items` by include rules, then drop matches of exclude rules.
///
/// If `include` is non-empty, only items whose field matches at least one
/// include rule are kept; an absent or empty list keeps everything. Exclude
/// rules are applied afterwards, against the same original field values.
/// The caller's collection is never mutated.
pub fn filter<T, F>(
    items: &[T],
    field: F,
    include: Option<&[FilterRule]>,
    exclude: Option<&[FilterRule]>,
) -> Vec<T>
where
    T: Clone,
    F: Fn(&T) -> &str,
{
    let mut filtered: Vec<T> = items.to_vec();

    if let Some(rules) = include {
        if !rules.is_empty() {
            filtered.retain(|item| matches_any(rules, field(item)));
        }
    }

    if let Some(rules) = exclude {
        if !rules.is_empty() {
            filtered.retain(|item| !matches_any(rules, field(item)));
        }
    }

    filtered
}
