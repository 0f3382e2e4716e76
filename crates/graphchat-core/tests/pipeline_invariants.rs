//! Property tests for the streaming extractor, the renderer adapter and the
//! classifier.
//!
//! 1. Cleaning keeps a prefix of the buffer and never emits an incomplete line
//! 2. Cleaning is idempotent
//! 3. Rendering any prefix of a diagram never panics and is deterministic
//! 4. Classification is a pure function of (message, source)
//! 5. A valid diagram cut off anywhere after its header never renders as a failure

use graphchat_core::classify::{classify, ErrorCategory};
use graphchat_core::extract::{clean_streaming_source, find_blocks, line_is_complete};
use graphchat_core::render::{DiagramRenderer, RenderResult};
use graphchat_core::Dialect;
use proptest::prelude::*;

const SAMPLE: &str = "flowchart TD\nA[Start] --> B{Check}\nB -->|Yes| C[Done]\nB -->|No| A";

fn flowchart_line() -> impl Strategy<Value = String> {
    prop_oneof![
        Just("flowchart TD".to_string()),
        Just("A[Start] --> B[Process]".to_string()),
        Just("B -->|Yes| C".to_string()),
        Just("%% comment (open".to_string()),
        Just("subgraph api [API".to_string()),
        Just("end".to_string()),
        "[A-Za-z0-9 \\[\\](){}|>-]{0,24}",
    ]
}

fn flowchart_buffer() -> impl Strategy<Value = String> {
    prop::collection::vec(flowchart_line(), 0..8).prop_map(|lines| lines.join("\n"))
}

proptest! {
    #[test]
    fn cleaned_source_is_a_prefix_of_complete_lines(buffer in flowchart_buffer()) {
        let cleaned = clean_streaming_source(Dialect::Flowchart, &buffer);
        prop_assert!(buffer.starts_with(&cleaned.source));
        for line in cleaned.source.split('\n') {
            prop_assert!(line_is_complete(line), "kept incomplete line {line:?}");
        }
        if cleaned.complete {
            prop_assert_eq!(&cleaned.source, &buffer);
        }
    }

    #[test]
    fn cleaning_is_idempotent(buffer in flowchart_buffer()) {
        let once = clean_streaming_source(Dialect::Flowchart, &buffer);
        let twice = clean_streaming_source(Dialect::Flowchart, &once.source);
        prop_assert_eq!(once.source, twice.source);
        prop_assert!(twice.complete);
    }

    #[test]
    fn rendering_prefixes_is_total_and_deterministic(cut in 0usize..=SAMPLE.len()) {
        let renderer = DiagramRenderer::default();
        let text = format!("```mermaid\n{}", &SAMPLE[..cut]);
        for block in find_blocks(&text) {
            let cleaned = block.renderable_source();
            if !cleaned.is_renderable() {
                continue;
            }
            let first = renderer.render(block.dialect, &cleaned.source);
            let second = renderer.render(block.dialect, &cleaned.source);
            match (&first, &second) {
                (RenderResult::Success(a), RenderResult::Success(b)) => prop_assert_eq!(a.svg(), b.svg()),
                (
                    RenderResult::Failure { error_message: a, .. },
                    RenderResult::Failure { error_message: b, .. },
                ) => prop_assert_eq!(a, b),
                _ => prop_assert!(false, "render outcome changed between calls"),
            }
        }
    }

    #[test]
    fn truncated_valid_diagram_never_fails(cut in "flowchart TD\n".len()..=SAMPLE.len()) {
        let renderer = DiagramRenderer::default();
        let text = format!("```mermaid\n{}", &SAMPLE[..cut]);
        for block in find_blocks(&text) {
            let cleaned = block.renderable_source();
            if !cleaned.is_renderable() {
                continue;
            }
            let result = renderer.render(block.dialect, &cleaned.source);
            prop_assert!(result.is_success(), "prefix {:?} cleaned to {:?} failed", &SAMPLE[..cut], cleaned.source);
        }
    }

    #[test]
    fn classification_is_pure(message in ".{0,80}", source in ".{0,80}") {
        prop_assert_eq!(classify(&message, &source), classify(&message, &source));
    }

    #[test]
    fn outline_buffers_are_never_trimmed(buffer in "[#\\- A-Za-z\n]{0,64}") {
        let cleaned = clean_streaming_source(Dialect::Outline, &buffer);
        prop_assert_eq!(cleaned.source, buffer);
        prop_assert!(cleaned.complete);
    }
}

#[test]
fn renderer_errors_feed_the_classifier() {
    let renderer = DiagramRenderer::default();
    let cases = [
        ("flowchart TD\nA[Start] --> B[Proc", ErrorCategory::UnclosedBracket),
        ("flowchart TD\n1Client --> API", ErrorCategory::NumericLeadingId),
        ("flowchart TD\nCDN[Content Delivery Network (CDN)] --> B", ErrorCategory::DisallowedParen),
        ("flowchart TD\nCDN[Content Network] % This is CDN", ErrorCategory::MisplacedComment),
        ("sequenceDiagram\nA->>B: hi", ErrorCategory::Unknown),
    ];
    for (source, expected) in cases {
        let RenderResult::Failure { error_message, partial_source } =
            renderer.render(Dialect::Flowchart, source)
        else {
            panic!("expected {source:?} to fail");
        };
        assert_eq!(classify(&error_message, &partial_source).category, expected, "{error_message}");
    }
}
