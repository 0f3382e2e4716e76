//! Finding diagram blocks in model output and trimming them to a renderable
//! prefix while tokens are still arriving.
//!
//! Flowchart source is cut at the first structurally incomplete line: a line
//! with unbalanced brackets, a connector whose right-hand side has not
//! started yet, or a link operator still being written (`A --`, `A -- text`). Everything after that line is dropped even if it looks well
//! formed. This is a conservative heuristic, not a parser; a stray bracket
//! inside a label that the renderer would accept still truncates the rest.
//! Outline source needs no trimming because a cut-off heading is still a
//! heading.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::{Dialect, DiagramBlock};

/// Link operators recognised on connector lines. `-->` also covers the
/// labelled `-- text -->` form.
const ARROW_TOKENS: &[&str] = &[
    "<-->", "-.->", "-->", "---", "==>", "===", "-.-", "--x", "--o", "~~~",
];

/// A connector is complete once its target identifier has started, after an
/// optional closed `|label|`.
static CONNECTOR_TARGET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*(?:\|[^|]*\|\s*)?[A-Za-z0-9_]").expect("valid connector regex")
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanedSource {
    pub source: String,
    /// False when trailing lines were dropped.
    pub complete: bool,
}

impl CleanedSource {
    /// Empty output means "not yet renderable": show a waiting state, not an error.
    pub fn is_renderable(&self) -> bool {
        !self.source.trim().is_empty()
    }
}

impl DiagramBlock {
    /// Source to hand to the renderer. Closed blocks render verbatim so real
    /// syntax errors surface; open blocks are trimmed to complete lines.
    pub fn renderable_source(&self) -> CleanedSource {
        if self.source_complete {
            CleanedSource {
                source: self.raw_source.clone(),
                complete: true,
            }
        } else {
            clean_streaming_source(self.dialect, &self.raw_source)
        }
    }
}

/// Trim a (possibly truncated) diagram buffer to its complete leading lines.
pub fn clean_streaming_source(dialect: Dialect, buffer: &str) -> CleanedSource {
    match dialect {
        Dialect::Outline => CleanedSource {
            source: buffer.to_string(),
            complete: true,
        },
        Dialect::Flowchart => clean_flowchart(buffer),
    }
}

fn clean_flowchart(buffer: &str) -> CleanedSource {
    let mut kept: Vec<&str> = Vec::new();
    let mut complete = true;

    for (index, line) in buffer.split('\n').enumerate() {
        if !line_is_complete(line) {
            debug!(line = index + 1, text = line, "truncating flowchart at incomplete line");
            complete = false;
            break;
        }
        kept.push(line);
    }

    let mut source = kept.join("\n");
    if !complete {
        source.truncate(source.trim_end().len());
    }
    CleanedSource { source, complete }
}

/// Whether a single flowchart line can be fed to the renderer.
pub fn line_is_complete(line: &str) -> bool {
    let trimmed = line.trim();
    if trimmed.is_empty() || is_exempt(trimmed) {
        return true;
    }
    if !brackets_balanced(trimmed) {
        return false;
    }
    let tail = match connector_target(trimmed) {
        Some(rhs) if !CONNECTOR_TARGET.is_match(rhs) => return false,
        Some(rhs) => rhs,
        None => trimmed,
    };
    !opens_link(tail)
}

/// Openers of a link whose closing operator has not arrived: `A -`, `A ==`,
/// `A -.`, `A ~~` or a text link such as `A -- sends`.
const LINK_OPENERS: &[&str] = &["--", "==", "-.", "~~"];

fn opens_link(tail: &str) -> bool {
    let bare = outside_labels(tail);
    let bare = bare.trim_end();
    bare.ends_with(['-', '=', '~']) || LINK_OPENERS.iter().any(|opener| bare.contains(opener))
}

/// The line with shape, edge and quoted label text removed, so operators
/// written inside labels are not mistaken for links.
fn outside_labels(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut in_pipe = false;
    let mut in_quote = false;
    for c in text.chars() {
        match c {
            '"' if depth == 0 && !in_pipe => in_quote = !in_quote,
            '|' if depth == 0 && !in_quote => in_pipe = !in_pipe,
            '[' | '(' | '{' if !in_pipe && !in_quote => depth += 1,
            ']' | ')' | '}' if !in_pipe && !in_quote => depth = depth.saturating_sub(1),
            _ if depth == 0 && !in_pipe && !in_quote => out.push(c),
            _ => {}
        }
    }
    out
}

fn is_exempt(trimmed: &str) -> bool {
    trimmed.starts_with("subgraph") || trimmed.starts_with("%%")
}

fn brackets_balanced(line: &str) -> bool {
    [('[', ']'), ('(', ')'), ('{', '}')].iter().all(|&(open, close)| {
        line.chars().filter(|&c| c == open).count() == line.chars().filter(|&c| c == close).count()
    })
}

/// Text after the last link operator on the line, if the line has one.
fn connector_target(line: &str) -> Option<&str> {
    ARROW_TOKENS
        .iter()
        .filter_map(|token| line.rfind(token).map(|at| at + token.len()))
        .max()
        .map(|end| &line[end..])
}

/// Locate every diagram fence in a message buffer, in order of appearance.
/// Fences of other languages are skipped along with their contents.
pub fn find_blocks(text: &str) -> Vec<DiagramBlock> {
    let mut blocks = Vec::new();
    let mut lines = text.split('\n');

    while let Some(line) = lines.next() {
        let Some((fence, tag)) = opening_fence(line) else {
            continue;
        };
        let dialect = Dialect::from_fence_tag(tag);

        let mut body: Vec<&str> = Vec::new();
        let mut closed = false;
        for inner in lines.by_ref() {
            if is_closing_fence(inner, fence) {
                closed = true;
                break;
            }
            body.push(inner);
        }

        if let Some(dialect) = dialect {
            blocks.push(DiagramBlock {
                dialect,
                raw_source: body.join("\n"),
                source_complete: closed,
            });
        }
    }

    blocks
}

/// Returns the fence marker (e.g. "```") and the info-string tag.
fn opening_fence(line: &str) -> Option<(&str, &str)> {
    let trimmed = line.trim_start();
    let marker = fence_marker(trimmed)?;
    let tag = trimmed[marker.len()..].split_whitespace().next().unwrap_or("");
    Some((marker, tag))
}

fn fence_marker(trimmed: &str) -> Option<&str> {
    let ch = trimmed.chars().next().filter(|c| *c == '`' || *c == '~')?;
    let len = trimmed.chars().take_while(|c| *c == ch).count();
    (len >= 3).then(|| &trimmed[..len])
}

fn is_closing_fence(line: &str, opener: &str) -> bool {
    let trimmed = line.trim();
    match fence_marker(trimmed) {
        Some(marker) => {
            marker.len() >= opener.len()
                && marker.starts_with(&opener[..1])
                && trimmed[marker.len()..].trim().is_empty()
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clean(buffer: &str) -> CleanedSource {
        clean_streaming_source(Dialect::Flowchart, buffer)
    }

    #[test]
    fn complete_buffer_is_returned_unchanged() {
        let input = "A[Start] --> B[Process]\nB --> C[End]";
        let out = clean(input);
        assert_eq!(out.source, input);
        assert!(out.complete);
    }

    #[test]
    fn full_flowchart_passes_through() {
        let input = "flowchart TD\nA[Start] --> B{Check}\nB -->|Yes| C[Done]\nB -->|No| A";
        assert_eq!(clean(input).source, input);
    }

    #[test]
    fn single_truncated_node_yields_waiting_state() {
        let out = clean("A[Start] --> B[Proc");
        assert_eq!(out.source, "");
        assert!(!out.complete);
        assert!(!out.is_renderable());
    }

    #[test]
    fn trailing_partial_line_is_dropped() {
        let out = clean("flowchart TD\nA[Start] --> B[Process]\nB --> C[En");
        assert_eq!(out.source, "flowchart TD\nA[Start] --> B[Process]");
        assert!(!out.complete);
    }

    #[test]
    fn dangling_arrow_is_incomplete() {
        let out = clean("flowchart LR\nA[Start] --> ");
        assert_eq!(out.source, "flowchart LR");
        assert!(!line_is_complete("A -->|Yes"));
        assert!(!line_is_complete("A -->|Yes|"));
        assert!(line_is_complete("A -->|Yes| B"));
        assert!(line_is_complete("A --> B"));
        assert!(!line_is_complete("A --> B[x"));
    }

    #[test]
    fn partial_link_operators_are_incomplete() {
        for line in [
            "A[Start] -",
            "A[Start] --",
            "A[Start] ==",
            "A -.",
            "A ~~",
            "A -- sends",
            "A == yes",
            "A --> B -- then",
        ] {
            assert!(!line_is_complete(line), "{line:?} should wait for more input");
        }
        let out = clean("flowchart TD\nA[Start] --");
        assert_eq!(out.source, "flowchart TD");
        assert!(!out.complete);
    }

    #[test]
    fn finished_links_and_dashes_inside_labels_are_complete() {
        for line in [
            "A -- sends --> B",
            "A == yes ==> B",
            "A -.-> B",
            "A --- B",
            "A ~~~ B",
            "A --> B[run --force]",
            "A -->|a--b| C",
            "A --> D(\"x == y\")",
            "classDef hot fill:#f96,stroke-width:2px",
        ] {
            assert!(line_is_complete(line), "{line:?} should be complete");
        }
    }

    #[test]
    fn first_incomplete_line_drops_everything_after_it() {
        let out = clean("graph TD\nA[One\nB --> C\nC --> D");
        assert_eq!(out.source, "graph TD");
    }

    #[test]
    fn subgraph_and_comment_lines_are_exempt() {
        let input = "flowchart TD\nsubgraph api [Public API\n%% note (draft\nA --> B\nend";
        assert_eq!(clean(input).source, input);
    }

    #[test]
    fn outline_passes_through_unmodified() {
        let input = "# Root\n## Branch\n### Half-writ";
        let out = clean_streaming_source(Dialect::Outline, input);
        assert_eq!(out.source, input);
        assert!(out.complete);
    }

    #[test]
    fn finds_closed_and_open_blocks() {
        let text = "Here you go:\n```mermaid\nflowchart TD\nA --> B\n```\nand\n```markmap\n# Root\n## Br";
        let blocks = find_blocks(text);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].dialect, Dialect::Flowchart);
        assert_eq!(blocks[0].raw_source, "flowchart TD\nA --> B");
        assert!(blocks[0].source_complete);
        assert_eq!(blocks[1].dialect, Dialect::Outline);
        assert!(!blocks[1].source_complete);
    }

    #[test]
    fn other_languages_are_skipped_including_body() {
        let text = "```rust\n```mermaid is not a fence here\n```\n```mermaid\ngraph LR\nA --> B\n```";
        let blocks = find_blocks(text);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].raw_source, "graph LR\nA --> B");
    }

    #[test]
    fn closed_blocks_render_verbatim_open_blocks_are_trimmed() {
        let closed = DiagramBlock {
            dialect: Dialect::Flowchart,
            raw_source: "flowchart TD\nA[Start] --> B[Proc".into(),
            source_complete: true,
        };
        assert_eq!(closed.renderable_source().source, closed.raw_source);

        let open = DiagramBlock { source_complete: false, ..closed };
        assert_eq!(open.renderable_source().source, "flowchart TD");
    }
}
