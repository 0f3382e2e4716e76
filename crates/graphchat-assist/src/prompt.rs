use std::sync::LazyLock;

use graphchat_core::classify::{ClassifiedError, ErrorCategory};
use graphchat_core::rules::rules_for;
use graphchat_core::Dialect;

use crate::repair::MAX_AUTO_REGENERATIONS;

static REPAIR_BUDGET_EXHAUSTED_NOTICE: LazyLock<String> = LazyLock::new(|| {
    format!(
        "The diagram still fails to render after {MAX_AUTO_REGENERATIONS} automatic repair attempts, \
         so automatic repair has stopped for this conversation. Edit your request or use \
         Regenerate to try again."
    )
});

/// Fixed notice shown once when the automatic repair budget is spent.
pub fn repair_budget_exhausted_notice() -> &'static str {
    REPAIR_BUDGET_EXHAUSTED_NOTICE.as_str()
}

pub const TITLE_SYSTEM_PROMPT: &str = "You name conversations. Reply with JSON only: \
{\"title\": \"...\"}. The title is concise, descriptive and under 50 characters.";

const CHAT_SYSTEM_PROMPT: &str = "You are a helpful assistant. Answer clearly and concisely. \
Use markdown where it helps readability.";

/// System instruction for a conversation mode; `None` is plain chat.
pub fn system_prompt(mode: Option<Dialect>) -> String {
    let Some(dialect) = mode else {
        return CHAT_SYSTEM_PROMPT.to_string();
    };

    let fence = dialect.fence_tag();
    let (role, example) = match dialect {
        Dialect::Flowchart => (
            "You are a Mermaid diagram expert. Generate clear, well-structured Mermaid flowcharts.",
            "flowchart TD\n    A[User Login] --> B{Valid Credentials?}\n    B -->|Yes| C[Access Granted]\n    \
             B -->|No| D[Access Denied]\n    C --> E[Dashboard]\n    D --> A",
        ),
        Dialect::Outline => (
            "You are a Markmap mind map expert. Generate well-organized markdown for interactive mind maps.",
            "# Project Root\n## Frontend\n### React Components\n- Header\n- Footer\n## Backend\n### Database\n- PostgreSQL",
        ),
    };

    format!(
        "{role}\n\n\
         OUTPUT FORMAT:\n\
         1. An optional one or two sentence explanation.\n\
         2. The diagram in a single ```{fence} code block, closed with ```.\n\
         3. Every line inside the block must be complete before the next one starts. \
         A smaller complete diagram is better than a larger broken one.\n\n\
         RULES:\n{rules}\n\n\
         Example:\n```{fence}\n{example}\n```",
        rules = rules_for(dialect),
    )
}

fn wrong_right(dialect: Dialect, category: ErrorCategory) -> (&'static str, &'static str) {
    match (dialect, category) {
        (_, ErrorCategory::UnclosedBracket) => (
            "CDNSvc[Content",
            "CDNSvc[Content Delivery Network]",
        ),
        (_, ErrorCategory::NumericLeadingId) => ("1Client --> 2API", "Client1 --> API2"),
        (_, ErrorCategory::DisallowedParen) => (
            "CDN[Content Delivery Network (CDN)]",
            "CDN[Content Delivery Network CDN]",
        ),
        (_, ErrorCategory::MisplacedComment) => (
            "CDN[Content Network] % This is CDN",
            "%% This is CDN\nCDN[Content Network]",
        ),
        (Dialect::Flowchart, ErrorCategory::Unknown) => (
            "A[Start] --> B[Process\nData]",
            "flowchart TD\nA[Start] --> B[Process Data]",
        ),
        (Dialect::Outline, ErrorCategory::Unknown) => (
            "Project\n  Frontend\n  Backend",
            "# Project\n## Frontend\n## Backend",
        ),
    }
}

/// The user turn sent back to the model after a render failure.
pub fn corrective_instruction(dialect: Dialect, error: &ClassifiedError, attempt: u32) -> String {
    let (wrong, right) = wrong_right(dialect, error.category);
    let fence = dialect.fence_tag();

    let mut out = String::with_capacity(1024);
    out.push_str(&format!(
        "The {} in your last reply failed to render (automatic fix {attempt} of {MAX_AUTO_REGENERATIONS}).\n\n",
        dialect.display_name()
    ));
    out.push_str("Renderer error:\n```\n");
    out.push_str(&error.raw_message);
    out.push_str("\n```\n");
    if let Some(snippet) = &error.offending_snippet {
        out.push_str(&format!("Offending line: `{snippet}`\n"));
    }
    out.push_str(&format!("\nProblem: {}.\n\n", error.category.describe()));
    out.push_str(&format!("Wrong:\n```\n{wrong}\n```\nRight:\n```\n{right}\n```\n\n"));
    out.push_str("Check every line against these rules:\n");
    out.push_str(rules_for(dialect));
    out.push_str(&format!(
        "\n\nReply with the complete corrected diagram in a single ```{fence} code block."
    ));
    out
}

/// Title request for the first exchange. Only the start of the user message is sent.
pub fn title_prompt(first_user_message: &str) -> String {
    let excerpt: String = first_user_message.chars().take(200).collect();
    format!(
        "Create a concise title (under 50 characters) for this conversation. User message: \"{excerpt}\""
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphchat_core::classify::classify;

    #[test]
    fn diagram_prompts_embed_rules_and_fence() {
        let prompt = system_prompt(Some(Dialect::Flowchart));
        assert!(prompt.contains("```mermaid"));
        assert!(prompt.contains(graphchat_core::rules::FLOWCHART_RULES));
        assert!(system_prompt(Some(Dialect::Outline)).contains("```markmap"));
        assert!(!system_prompt(None).contains("```"));
    }

    #[test]
    fn corrective_instruction_carries_error_pair_and_checklist() {
        let source = "flowchart TD\nA[Start] --> B[Proc";
        let msg = "Parse error on line 2:\nA[Start] --> B[Proc\n-------------------^\nExpecting 'SQE', got 'EOF'";
        let text = corrective_instruction(Dialect::Flowchart, &classify(msg, source), 1);
        assert!(text.contains(msg));
        assert!(text.contains("CDNSvc[Content Delivery Network]"));
        assert!(text.contains("1 of 2"));
        assert!(text.contains("Offending line: `A[Start] --> B[Proc`"));
        assert!(text.contains(graphchat_core::rules::FLOWCHART_RULES));
    }

    #[test]
    fn exhaustion_notice_states_the_ceiling() {
        let notice = repair_budget_exhausted_notice();
        assert!(notice.contains(&format!("after {MAX_AUTO_REGENERATIONS} automatic repair attempts")));
    }

    #[test]
    fn title_prompt_truncates_long_messages() {
        let prompt = title_prompt(&"x".repeat(500));
        assert!(prompt.contains(&"x".repeat(200)));
        assert!(!prompt.contains(&"x".repeat(201)));
    }
}
