//! Renderer failure classification.
//!
//! The category only selects which corrective instruction to send back to the
//! model, so rules are "good enough to pick the right template" rather than a
//! full diagnosis. Rules are evaluated top to bottom and the first match wins;
//! bracket and parenthesis problems come first because they are the most
//! common root cause and have the most actionable fix.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCategory {
    UnclosedBracket,
    NumericLeadingId,
    DisallowedParen,
    MisplacedComment,
    Unknown,
}

impl ErrorCategory {
    pub fn describe(self) -> &'static str {
        match self {
            ErrorCategory::UnclosedBracket => "a node bracket was opened but never closed",
            ErrorCategory::NumericLeadingId => "a node ID starts with a digit",
            ErrorCategory::DisallowedParen => "a label contains parentheses",
            ErrorCategory::MisplacedComment => "a comment follows a node or edge on the same line",
            ErrorCategory::Unknown => "the diagram has a syntax error",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::UnclosedBracket => "unclosed bracket",
            ErrorCategory::NumericLeadingId => "numeric leading id",
            ErrorCategory::DisallowedParen => "disallowed parenthesis",
            ErrorCategory::MisplacedComment => "misplaced comment",
            ErrorCategory::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassifiedError {
    pub category: ErrorCategory,
    pub raw_message: String,
    pub offending_snippet: Option<String>,
}

static LINE_REF: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)on line (\d+)").expect("valid line regex"));
static EXPECTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)parse error|expecting").expect("valid expectation regex"));
static LEADING_DIGIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)got 'NUM'|leading digit|starts? with a (?:digit|number)")
        .expect("valid digit regex")
});
static PAREN_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)got '(?:PS|PE)'|parenthes").expect("valid paren regex")
});
/// A parenthesis after the first label character of a `[..]` or `{..}` shape.
static PAREN_IN_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[\[{][^\]}()]+[()]").expect("valid label regex"));
static STRING_TOKEN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)got 'STR'|unexpected string").expect("valid string regex")
});

struct Evidence<'a> {
    message: &'a str,
    snippet: Option<&'a str>,
    /// The snippet, or the parser's own echo of the failing line.
    context: Option<&'a str>,
}

type Rule = (fn(&Evidence<'_>) -> bool, ErrorCategory);

const RULES: &[Rule] = &[
    (unclosed_bracket, ErrorCategory::UnclosedBracket),
    (numeric_leading_id, ErrorCategory::NumericLeadingId),
    (disallowed_paren, ErrorCategory::DisallowedParen),
    (misplaced_comment, ErrorCategory::MisplacedComment),
];

/// Classify a renderer failure against the source that produced it.
pub fn classify(error_message: &str, source: &str) -> ClassifiedError {
    let snippet = offending_snippet(error_message, source);
    let evidence = Evidence {
        message: error_message,
        snippet,
        context: snippet.or_else(|| echoed_context(error_message)),
    };

    let category = RULES
        .iter()
        .find(|(matches, _)| matches(&evidence))
        .map(|(_, category)| *category)
        .unwrap_or(ErrorCategory::Unknown);

    ClassifiedError {
        category,
        raw_message: error_message.to_string(),
        offending_snippet: snippet.map(str::to_string),
    }
}

fn offending_snippet<'a>(message: &str, source: &'a str) -> Option<&'a str> {
    let line_no: usize = LINE_REF.captures(message)?.get(1)?.as_str().parse().ok()?;
    let line = source.split('\n').nth(line_no.checked_sub(1)?)?.trim();
    (!line.is_empty()).then_some(line)
}

/// Parser messages repeat the failing line right after the "Parse error" header.
fn echoed_context(message: &str) -> Option<&str> {
    let mut lines = message.lines();
    let header = lines.next()?;
    if !EXPECTATION.is_match(header) {
        return None;
    }
    let echoed = lines.next()?.trim().trim_start_matches("...");
    (!echoed.is_empty()).then_some(echoed)
}

fn has_unclosed_square(context: Option<&str>) -> bool {
    context.is_some_and(|c| c.matches('[').count() > c.matches(']').count())
}

fn unclosed_bracket(e: &Evidence<'_>) -> bool {
    EXPECTATION.is_match(e.message) && has_unclosed_square(e.context)
}

fn numeric_leading_id(e: &Evidence<'_>) -> bool {
    LEADING_DIGIT.is_match(e.message) && !has_unclosed_square(e.context)
}

fn disallowed_paren(e: &Evidence<'_>) -> bool {
    PAREN_TOKEN.is_match(e.message) || e.snippet.is_some_and(|s| PAREN_IN_LABEL.is_match(s))
}

fn misplaced_comment(e: &Evidence<'_>) -> bool {
    STRING_TOKEN.is_match(e.message) && e.snippet.is_some_and(|s| s.contains('%'))
}
