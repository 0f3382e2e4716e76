pub mod classify;
pub mod error;
pub mod extract;
pub mod memory;
pub mod render;
pub mod rules;
pub mod store;

pub use error::{Error, Result};
pub use memory::{FileMemoryStore, LocalMemoryStore, Memory, MemoryStore};
pub use store::{ChatStore, FileChatStore, MemoryChatStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

// --- Types ---

/// Which of the two supported diagram syntaxes a fenced block uses.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Dialect {
    /// Graph syntax (`flowchart TD`, `A --> B`), fenced as `mermaid`.
    #[serde(alias = "mermaid")]
    Flowchart,
    /// Heading-based outline rendered as a mind map, fenced as `markmap`.
    #[serde(alias = "markmap", alias = "mindmap")]
    Outline,
}

impl Dialect {
    /// The fence tag the model is asked to emit for this dialect.
    pub fn fence_tag(self) -> &'static str {
        match self {
            Dialect::Flowchart => "mermaid",
            Dialect::Outline => "markmap",
        }
    }

    pub fn from_fence_tag(tag: &str) -> Option<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "mermaid" | "flowchart" => Some(Dialect::Flowchart),
            "markmap" | "mindmap" => Some(Dialect::Outline),
            _ => None,
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Dialect::Flowchart => "Mermaid flowchart",
            Dialect::Outline => "Markmap mind map",
        }
    }
}

impl std::str::FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flowchart" | "mermaid" => Ok(Dialect::Flowchart),
            "outline" | "markmap" | "mindmap" => Ok(Dialect::Outline),
            other => Err(format!("unknown dialect: {other}")),
        }
    }
}

/// A fenced diagram block found in (possibly still streaming) model output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagramBlock {
    pub dialect: Dialect,
    pub raw_source: String,
    /// True once the closing fence has been seen.
    pub source_complete: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    User,
    Assistant,
    /// Shown to the user, never sent to the model.
    Notice,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Notice => "notice",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: format!("{}-{}", role.as_str(), uuid::Uuid::new_v4().simple()),
            role,
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

pub const UNTITLED_CHAT: &str = "New Chat";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Chat {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Diagram mode the chat was last used in; `None` for plain chat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dialect: Option<Dialect>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
}

impl Chat {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: None,
            dialect: None,
            created_at: now,
            updated_at: now,
            messages: Vec::new(),
        }
    }

    /// Generate a fresh chat ID.
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn display_title(&self) -> &str {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t,
            _ => UNTITLED_CHAT,
        }
    }

    /// Untitled (or placeholder-titled) chats with a first exchange get a generated title.
    pub fn needs_title(&self) -> bool {
        let untitled = self.display_title() == UNTITLED_CHAT;
        let has_user = self.messages.iter().any(|m| m.role == Role::User);
        let has_assistant = self.messages.iter().any(|m| m.role == Role::Assistant);
        untitled && self.messages.len() >= 2 && has_user && has_assistant
    }

    pub fn first_user_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    pub fn summary(&self) -> ChatSummary {
        let preview = self
            .messages
            .first()
            .map(|m| m.content.chars().take(100).collect())
            .unwrap_or_default();
        ChatSummary {
            id: self.id.clone(),
            title: self.display_title().to_string(),
            date: self.updated_at,
            preview,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatSummary {
    pub id: String,
    pub title: String,
    pub date: DateTime<Utc>,
    pub preview: String,
}

// --- Storage location ---

/// Resolve the data directory (`$GRAPHCHAT_HOME`, else `~/.graphchat/`).
pub fn data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("GRAPHCHAT_HOME").filter(|d| !d.is_empty()) {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".graphchat")
}

// --- AI Settings ---

pub const DEFAULT_PROVIDER: &str = "google";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const API_KEY_ENV_VARS: &[&str] = &["GRAPHCHAT_API_KEY", "GOOGLE_GENERATIVE_AI_API_KEY"];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub provider: String,
    pub api_key: String,
    pub model: String,
    pub chat_temperature: f32,
    /// Lower than chat so diagram syntax stays consistent.
    pub diagram_temperature: f32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            chat_temperature: 0.7,
            diagram_temperature: 0.5,
        }
    }
}

impl Settings {
    pub fn temperature_for(&self, dialect: Option<Dialect>) -> f32 {
        match dialect {
            Some(_) => self.diagram_temperature,
            None => self.chat_temperature,
        }
    }
}

fn settings_path() -> PathBuf {
    data_dir().join("settings.json")
}

/// Read settings from disk, falling back to defaults. An empty stored key is
/// filled from the environment.
pub fn read_settings() -> Settings {
    let path = settings_path();
    let mut settings: Settings = fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    if settings.api_key.is_empty() {
        if let Some(key) = API_KEY_ENV_VARS
            .iter()
            .find_map(|var| std::env::var(var).ok().filter(|v| !v.is_empty()))
        {
            settings.api_key = key;
        }
    }
    settings
}

pub fn write_settings(settings: &Settings) -> Result<()> {
    let dir = data_dir();
    fs::create_dir_all(&dir).map_err(|e| Error::io(&dir, e))?;
    let json = serde_json::to_string_pretty(settings)?;
    let path = settings_path();
    fs::write(&path, json).map_err(|e| Error::io(&path, e))
}

pub fn ai_configured(settings: &Settings) -> bool {
    !settings.provider.is_empty()
        && !settings.model.is_empty()
        && (settings.provider == "ollama" || !settings.api_key.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fence_tags_map_to_dialects() {
        assert_eq!(Dialect::from_fence_tag("mermaid"), Some(Dialect::Flowchart));
        assert_eq!(Dialect::from_fence_tag(" Markmap "), Some(Dialect::Outline));
        assert_eq!(Dialect::from_fence_tag("rust"), None);
        assert_eq!("mindmap".parse::<Dialect>(), Ok(Dialect::Outline));
    }

    #[test]
    fn dialect_accepts_legacy_names_in_json() {
        let d: Dialect = serde_json::from_str("\"mermaid\"").unwrap();
        assert_eq!(d, Dialect::Flowchart);
        assert_eq!(serde_json::to_string(&Dialect::Outline).unwrap(), "\"outline\"");
    }

    #[test]
    fn untitled_chat_needs_title_after_first_exchange() {
        let mut chat = Chat::new("c1");
        assert!(!chat.needs_title());
        chat.messages.push(ChatMessage::new(Role::User, "hello"));
        chat.messages.push(ChatMessage::new(Role::Assistant, "hi"));
        assert!(chat.needs_title());
        chat.title = Some("Greetings".into());
        assert!(!chat.needs_title());
    }

    #[test]
    fn summary_truncates_preview() {
        let mut chat = Chat::new("c1");
        chat.messages.push(ChatMessage::new(Role::User, "x".repeat(250)));
        let summary = chat.summary();
        assert_eq!(summary.title, UNTITLED_CHAT);
        assert_eq!(summary.preview.len(), 100);
    }

    #[test]
    fn partial_settings_fill_defaults() {
        let s: Settings = serde_json::from_str(r#"{"provider":"openai","model":"gpt-4o"}"#).unwrap();
        assert_eq!(s.provider, "openai");
        assert_eq!(s.diagram_temperature, 0.5);
        assert!(!ai_configured(&s));
        let local = Settings { provider: "ollama".into(), ..Settings::default() };
        assert!(ai_configured(&local));
    }
}
