const MAX_TITLE_CHARS: usize = 50;
const FALLBACK_TITLE_CHARS: usize = 30;

#[derive(serde::Deserialize)]
struct LlmTitle {
    title: String,
}

/// Pull a title out of raw model output. Accepts the requested JSON object,
/// JSON wrapped in prose or a code fence, or a bare line of text.
pub fn parse_title(raw: &str) -> Option<String> {
    let from_json = extract_json_object(raw)
        .and_then(|json| serde_json::from_str::<LlmTitle>(json).ok())
        .map(|t| t.title);

    let title = match from_json {
        Some(title) => title,
        None => first_text_line(raw)?.to_string(),
    };
    clean_title(&title)
}

/// Title used when the model cannot produce one.
pub fn fallback_title(first_user_message: &str) -> String {
    let head: String = first_user_message.chars().take(FALLBACK_TITLE_CHARS).collect();
    format!("{head}...")
}

fn extract_json_object(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    Some(&raw[start..=end])
}

fn first_text_line(raw: &str) -> Option<&str> {
    raw.lines()
        .map(str::trim)
        .find(|line| !line.is_empty() && !line.starts_with("```"))
}

fn clean_title(title: &str) -> Option<String> {
    let title = title
        .trim()
        .trim_start_matches(|c| c == '#' || c == '*')
        .trim_start_matches("Title:")
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim();
    if title.is_empty() {
        return None;
    }
    Some(title.chars().take(MAX_TITLE_CHARS).collect())
}
