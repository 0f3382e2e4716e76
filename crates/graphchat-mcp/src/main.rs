use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use rmcp::{
    handler::server::{router::tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
    schemars, tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use graphchat_assist::{ChatShell, LlmClient, ModelClient, TurnReport};
use graphchat_core::classify::classify;
use graphchat_core::extract::find_blocks;
use graphchat_core::render::{DiagramRenderer, RenderReport, RenderResult};
use graphchat_core::{ChatStore, Dialect, FileChatStore, FileMemoryStore, MemoryStore, Settings};

// --- Request types ---

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ChatIdRequest {
    /// ID of the chat (from list_chats)
    chat_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct DeleteChatsRequest {
    /// IDs of the chats to delete
    chat_ids: Vec<String>,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SaveMemoryRequest {
    /// A fact about the user worth keeping across chats
    content: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct MemoryIdRequest {
    /// ID of the memory (from list_memories)
    memory_id: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SendMessageRequest {
    /// Existing chat to continue. Omit to start a new chat.
    chat_id: Option<String>,
    /// "chat", "flowchart" or "outline". Omit to keep the chat's current mode (new chats start in "chat").
    mode: Option<String>,
    /// The user message
    message: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RenderDiagramRequest {
    /// "flowchart" (Mermaid) or "outline" (Markmap)
    dialect: Dialect,
    /// Diagram source without the code fence
    source: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ExtractDiagramRequest {
    /// Model output, possibly cut off mid-stream
    text: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct ClassifyRequest {
    /// Error message reported by the renderer
    error_message: String,
    /// The source that failed to render
    source: String,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct RulesRequest {
    dialect: Dialect,
}

#[derive(Debug, Deserialize, schemars::JsonSchema)]
struct SetSettingsRequest {
    /// "google", "openai", "anthropic", "ollama", "groq", "mistral" or "deepseek"
    provider: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    chat_temperature: Option<f32>,
    diagram_temperature: Option<f32>,
}

// --- Open shells ---

/// Most conversations kept open at once.
const MAX_OPEN_SHELLS: usize = 32;

/// Open conversations by chat id, least recently used first in `recent`.
/// Past capacity, idle entries are evicted oldest first; an entry whose
/// lock is held is mid-turn and stays.
struct ShellCache<T> {
    capacity: usize,
    entries: HashMap<String, Arc<Mutex<T>>>,
    recent: VecDeque<String>,
}

impl<T> ShellCache<T> {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    fn get(&mut self, id: &str) -> Option<Arc<Mutex<T>>> {
        let entry = self.entries.get(id)?.clone();
        self.touch(id);
        Some(entry)
    }

    fn insert(&mut self, id: String, entry: Arc<Mutex<T>>) {
        self.entries.insert(id.clone(), entry);
        self.touch(&id);
        while self.entries.len() > self.capacity {
            let idle = self
                .recent
                .iter()
                .find(|key| {
                    **key != id
                        && self
                            .entries
                            .get(key.as_str())
                            .is_some_and(|entry| entry.try_lock().is_ok())
                })
                .cloned();
            let Some(evicted) = idle else {
                warn!(open = self.entries.len(), "every open chat is busy; over capacity");
                break;
            };
            debug!(chat_id = %evicted, "closing idle chat");
            self.remove(&evicted);
        }
    }

    fn remove(&mut self, id: &str) {
        self.entries.remove(id);
        self.recent.retain(|key| key != id);
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    fn all(&self) -> Vec<Arc<Mutex<T>>> {
        self.entries.values().cloned().collect()
    }

    fn touch(&mut self, id: &str) {
        self.recent.retain(|key| key != id);
        self.recent.push_back(id.to_string());
    }
}

// --- Server ---

type SharedShell = Arc<Mutex<ChatShell>>;

#[derive(Clone)]
pub struct GraphchatServer {
    tool_router: ToolRouter<Self>,
    store: Arc<FileChatStore>,
    memories: Arc<dyn MemoryStore>,
    renderer: DiagramRenderer,
    /// Each open conversation keeps its repair budget between calls.
    shells: Arc<Mutex<ShellCache<ChatShell>>>,
}

#[tool_router]
impl GraphchatServer {
    pub fn new(store: FileChatStore, memories: Arc<dyn MemoryStore>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            store: Arc::new(store),
            memories,
            renderer: DiagramRenderer::default(),
            shells: Arc::new(Mutex::new(ShellCache::new(MAX_OPEN_SHELLS))),
        }
    }

    #[tool(description = "List saved chats, most recent first. Returns [{id, title, date, preview}].")]
    fn list_chats(&self) -> Result<CallToolResult, McpError> {
        match self.store.list_chats() {
            Ok(chats) if chats.is_empty() => Ok(text("No chats yet. Use send_message to start one.")),
            Ok(chats) => Ok(json(&chats)),
            Err(e) => Ok(error(format!("Failed to list chats: {e}"))),
        }
    }

    #[tool(description = "Get the full transcript of a chat, including its mode and title")]
    fn load_chat(
        &self,
        Parameters(req): Parameters<ChatIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.store.load_chat(&req.chat_id) {
            Ok(chat) => Ok(json(&chat)),
            Err(e) => Ok(error(format!("Failed to load chat '{}': {e}", req.chat_id))),
        }
    }

    #[tool(description = "Delete one or more chats")]
    async fn delete_chats(
        &self,
        Parameters(req): Parameters<DeleteChatsRequest>,
    ) -> Result<CallToolResult, McpError> {
        {
            let mut shells = self.shells.lock().await;
            for id in &req.chat_ids {
                shells.remove(id);
            }
        }
        match self.store.delete_chats(&req.chat_ids) {
            Ok(n) => Ok(text(format!("Deleted {n} of {} chat(s).", req.chat_ids.len()))),
            Err(e) => Ok(error(format!("Failed to delete chats: {e}"))),
        }
    }

    #[tool(description = "List remembered facts about the user, newest first (at most 100). Returns [{id, content, createdAt}].")]
    fn list_memories(&self) -> Result<CallToolResult, McpError> {
        match self.memories.list_memories() {
            Ok(memories) if memories.is_empty() => Ok(text("No memories saved.")),
            Ok(memories) => Ok(json(&memories)),
            Err(e) => Ok(error(format!("Failed to list memories: {e}"))),
        }
    }

    #[tool(description = "Remember a fact about the user")]
    fn save_memory(
        &self,
        Parameters(req): Parameters<SaveMemoryRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.memories.save_memory(&req.content) {
            Ok(memory) => Ok(json(&memory)),
            Err(e) => Ok(error(format!("Failed to save memory: {e}"))),
        }
    }

    #[tool(description = "Forget one memory")]
    fn delete_memory(
        &self,
        Parameters(req): Parameters<MemoryIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        match self.memories.delete_memory(&req.memory_id) {
            Ok(true) => Ok(text("Memory deleted.")),
            Ok(false) => Ok(error(format!("Memory '{}' not found.", req.memory_id))),
            Err(e) => Ok(error(format!("Failed to delete memory: {e}"))),
        }
    }

    #[tool(description = "Forget every memory. Returns how many were deleted.")]
    fn delete_memories(&self) -> Result<CallToolResult, McpError> {
        match self.memories.delete_memories() {
            Ok(n) => Ok(text(format!("Deleted {n} memory(ies)."))),
            Err(e) => Ok(error(format!("Failed to delete memories: {e}"))),
        }
    }

    #[tool(
        description = "Send a user message and wait for the full reply. In flowchart/outline mode the reply's diagrams are rendered, and a diagram that fails to render is repaired automatically (at most 2 times per chat and mode). Returns {chatId, title, mode, turn: {status, reply, diagrams, repairs, budgetExhausted, aborted, error}, repair: {attemptsUsed, hasAttemptedForCurrentResponse}}."
    )]
    async fn send_message(
        &self,
        Parameters(req): Parameters<SendMessageRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mode = match req.mode.as_deref().map(parse_mode).transpose() {
            Ok(mode) => mode,
            Err(e) => return Ok(error(e)),
        };
        let shell = match self.shell_for(req.chat_id.as_deref()).await {
            Ok(shell) => shell,
            Err(e) => return Ok(error(e)),
        };

        let mut shell = shell.lock().await;
        if let Some(dialect) = mode {
            shell.set_dialect(dialect);
        }
        match shell.dispatch_user_turn(&req.message).await {
            Ok(report) => Ok(turn_result(&shell, &report)),
            Err(e) => Ok(error(format!("Send failed: {e}"))),
        }
    }

    #[tool(
        description = "Discard the last reply of a chat and ask the model again. Does not reset the automatic repair budget."
    )]
    async fn regenerate(
        &self,
        Parameters(req): Parameters<ChatIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let shell = match self.shell_for(Some(&req.chat_id)).await {
            Ok(shell) => shell,
            Err(e) => return Ok(error(e)),
        };
        let mut shell = shell.lock().await;
        match shell.regenerate().await {
            Ok(report) => Ok(turn_result(&shell, &report)),
            Err(e) => Ok(error(format!("Regenerate failed: {e}"))),
        }
    }

    #[tool(
        description = "Render diagram source to SVG. Returns {render: {status: \"success\", svg} | {status: \"failure\", errorMessage, partialSource}, classification?}. Failures include the error classification."
    )]
    fn render_diagram(
        &self,
        Parameters(req): Parameters<RenderDiagramRequest>,
    ) -> Result<CallToolResult, McpError> {
        let result = self.renderer.render(req.dialect, &req.source);
        let classification = match &result {
            RenderResult::Failure {
                error_message,
                partial_source,
            } => Some(classify(error_message, partial_source)),
            RenderResult::Success(_) => None,
        };
        Ok(json(&serde_json::json!({
            "render": RenderReport::from(&result),
            "classification": classification,
        })))
    }

    #[tool(
        description = "Find fenced diagram blocks in model output and return what is renderable so far: [{dialect, complete, renderableSource, waiting}]. An incomplete trailing line is cut; waiting means nothing is renderable yet."
    )]
    fn extract_diagram(
        &self,
        Parameters(req): Parameters<ExtractDiagramRequest>,
    ) -> Result<CallToolResult, McpError> {
        let blocks: Vec<serde_json::Value> = find_blocks(&req.text)
            .iter()
            .map(|block| {
                let cleaned = block.renderable_source();
                serde_json::json!({
                    "dialect": block.dialect,
                    "complete": block.source_complete,
                    "renderableSource": cleaned.source,
                    "waiting": !cleaned.is_renderable(),
                })
            })
            .collect();
        if blocks.is_empty() {
            return Ok(text("No diagram blocks found."));
        }
        Ok(json(&blocks))
    }

    #[tool(description = "Classify a renderer error message into a repair category")]
    fn classify_render_error(
        &self,
        Parameters(req): Parameters<ClassifyRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(json(&classify(&req.error_message, &req.source)))
    }

    #[tool(description = "Get the syntax rules the model is given for a diagram dialect")]
    fn get_diagram_rules(
        &self,
        Parameters(req): Parameters<RulesRequest>,
    ) -> Result<CallToolResult, McpError> {
        Ok(text(graphchat_core::rules::rules_for(req.dialect)))
    }

    #[tool(description = "Get the model provider settings. The API key is masked.")]
    fn get_settings(&self) -> Result<CallToolResult, McpError> {
        let mut settings = graphchat_core::read_settings();
        let configured = graphchat_core::ai_configured(&settings);
        settings.api_key = mask_key(&settings.api_key);
        Ok(json(&serde_json::json!({
            "settings": settings,
            "configured": configured,
        })))
    }

    #[tool(description = "Update model provider settings. Omitted fields keep their current value.")]
    async fn set_settings(
        &self,
        Parameters(req): Parameters<SetSettingsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let mut settings = graphchat_core::read_settings();
        if let Some(provider) = req.provider {
            settings.provider = provider;
        }
        if let Some(model) = req.model {
            settings.model = model;
        }
        if let Some(api_key) = req.api_key {
            settings.api_key = api_key;
        }
        if let Some(t) = req.chat_temperature {
            settings.chat_temperature = t;
        }
        if let Some(t) = req.diagram_temperature {
            settings.diagram_temperature = t;
        }

        if let Err(e) = graphchat_core::write_settings(&settings) {
            return Ok(error(format!("Failed to save settings: {e}")));
        }
        let open = self.reconfigure_open_shells(&settings).await;
        info!(
            provider = %settings.provider,
            model = %settings.model,
            open_chats = open,
            "settings updated"
        );
        Ok(text(format!(
            "Saved. Provider: {}, model: {}.",
            settings.provider, settings.model
        )))
    }
}

impl GraphchatServer {
    /// Point every open conversation at a client built from `settings`.
    /// Transcripts and repair budgets are kept.
    async fn reconfigure_open_shells(&self, settings: &Settings) -> usize {
        let open = self.shells.lock().await.all();
        let client: Arc<dyn ModelClient> = Arc::new(LlmClient::new(settings.clone()));
        for shell in &open {
            shell.lock().await.set_client(client.clone(), settings.clone());
        }
        open.len()
    }

    async fn shell_for(&self, chat_id: Option<&str>) -> Result<SharedShell, String> {
        let mut shells = self.shells.lock().await;
        if let Some(shell) = chat_id.and_then(|id| shells.get(id)) {
            return Ok(shell);
        }

        let settings = graphchat_core::read_settings();
        if !graphchat_core::ai_configured(&settings) {
            return Err(
                "No model configured. Call set_settings with a provider, model and API key first."
                    .to_string(),
            );
        }
        let mut shell = new_shell(settings).with_store(self.store.clone());
        if let Some(id) = chat_id {
            shell
                .open_conversation(id)
                .map_err(|e| format!("Failed to open chat '{id}': {e}"))?;
        }

        let id = shell.chat().id.clone();
        let shell = Arc::new(Mutex::new(shell));
        shells.insert(id.clone(), shell.clone());
        debug!(chat_id = %id, open = shells.len(), "chat opened");
        Ok(shell)
    }
}

fn new_shell(settings: Settings) -> ChatShell {
    ChatShell::new(Arc::new(LlmClient::new(settings.clone())), settings)
}

#[tool_handler]
impl ServerHandler for GraphchatServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }
}

// --- Helpers ---

fn text(message: impl Into<String>) -> CallToolResult {
    CallToolResult::success(vec![Content::text(message.into())])
}

fn error(message: impl Into<String>) -> CallToolResult {
    CallToolResult::error(vec![Content::text(message.into())])
}

fn json<T: serde::Serialize + ?Sized>(value: &T) -> CallToolResult {
    match serde_json::to_string_pretty(value) {
        Ok(body) => text(body),
        Err(e) => error(format!("Serialization error: {e}")),
    }
}

/// `chat` selects plain chat; anything else must name a dialect.
fn parse_mode(mode: &str) -> Result<Option<Dialect>, String> {
    match mode.trim().to_ascii_lowercase().as_str() {
        "chat" | "" => Ok(None),
        other => other.parse::<Dialect>().map(Some),
    }
}

fn mode_name(mode: Option<Dialect>) -> &'static str {
    match mode {
        None => "chat",
        Some(Dialect::Flowchart) => "flowchart",
        Some(Dialect::Outline) => "outline",
    }
}

fn mask_key(key: &str) -> String {
    if key.is_empty() {
        return String::new();
    }
    let tail: String = key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();
    format!("****{tail}")
}

fn turn_result(shell: &ChatShell, report: &TurnReport) -> CallToolResult {
    let chat = shell.chat();
    let body = serde_json::json!({
        "chatId": chat.id,
        "title": chat.display_title(),
        "mode": mode_name(shell.mode()),
        "turn": report,
        "repair": shell.repair_state(),
    });
    if report.error.is_some() {
        warn!(chat_id = %chat.id, "turn ended with a model error");
    }
    json(&body)
}

const INSTRUCTIONS: &str = r#"graphchat: chat with a model that answers in Mermaid flowcharts or Markmap outlines.

## Modes
- **chat**: plain conversation, nothing is rendered.
- **flowchart**: replies contain a ```mermaid block rendered to SVG.
- **outline**: replies contain a ```markmap block rendered as a foldable mind map.

## Conversations
Call `send_message` without `chat_id` to start a chat; reuse the returned `chatId` to continue it. Chats are saved automatically and get a short generated title after the first exchange. `list_chats`, `load_chat` and `delete_chats` manage saved chats.

## Automatic repair
When a diagram in a finished reply fails to render, the error is classified and a corrective instruction is sent back to the model. This happens at most 2 times per chat and mode; after that a notice is added to the chat and repairs stop until the mode or chat changes. `regenerate` asks again without refilling that budget.

## Memories
`save_memory` keeps a fact about the user across chats. `list_memories`, `delete_memory` and `delete_memories` review and forget them.

## Working on diagrams directly
`render_diagram` renders source and classifies failures, `extract_diagram` shows what part of a partial reply is renderable, and `get_diagram_rules` returns the syntax rules the model follows."#;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("GRAPHCHAT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    // stdout carries the MCP protocol.
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let store = FileChatStore::open_default();
    let memories = FileMemoryStore::open_default();
    info!(
        dir = %store.dir().display(),
        memories = %memories.path().display(),
        "serving graphchat over stdio"
    );

    let service = GraphchatServer::new(store, Arc::new(memories))
        .serve(rmcp::transport::io::stdio())
        .await
        .inspect_err(|e| tracing::error!(error = %e, "MCP server error"))?;
    service.waiting().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use graphchat_core::LocalMemoryStore;

    #[test]
    fn modes_parse() {
        assert_eq!(parse_mode("chat"), Ok(None));
        assert_eq!(parse_mode("Flowchart"), Ok(Some(Dialect::Flowchart)));
        assert_eq!(parse_mode("markmap"), Ok(Some(Dialect::Outline)));
        assert!(parse_mode("sequence").is_err());
    }

    #[test]
    fn keys_are_masked() {
        assert_eq!(mask_key(""), "");
        assert_eq!(mask_key("sk-abcdef1234"), "****1234");
        assert_eq!(mask_key("ab"), "****ab");
    }

    fn entry(n: u32) -> Arc<Mutex<u32>> {
        Arc::new(Mutex::new(n))
    }

    #[test]
    fn idle_shells_are_evicted_least_recent_first() {
        let mut cache = ShellCache::new(2);
        cache.insert("a".into(), entry(1));
        cache.insert("b".into(), entry(2));
        assert!(cache.get("a").is_some());

        cache.insert("c".into(), entry(3));

        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));
        assert!(!cache.contains("b"));
        assert!(cache.contains("c"));
    }

    #[test]
    fn busy_shells_are_not_evicted() {
        let mut cache = ShellCache::new(1);
        let busy = entry(1);
        cache.insert("a".into(), busy.clone());
        let turn = busy.try_lock().unwrap();

        cache.insert("b".into(), entry(2));
        assert_eq!(cache.len(), 2);
        assert!(cache.contains("a"));

        drop(turn);
        cache.insert("c".into(), entry(3));
        assert_eq!(cache.len(), 1);
        assert!(cache.contains("c"));
    }

    #[test]
    fn removed_shells_leave_the_recency_order() {
        let mut cache = ShellCache::new(2);
        cache.insert("a".into(), entry(1));
        cache.insert("b".into(), entry(2));
        cache.remove("a");
        cache.insert("c".into(), entry(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.recent, ["b", "c"]);
    }

    fn server(dir: &tempfile::TempDir) -> GraphchatServer {
        GraphchatServer::new(
            FileChatStore::new(dir.path().join("chats")),
            Arc::new(LocalMemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn new_settings_keep_open_shells_and_their_budget() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir);
        let mut shell = new_shell(Settings::default());
        shell.set_dialect(Some(Dialect::Flowchart));
        let id = shell.chat().id.clone();
        let shell = Arc::new(Mutex::new(shell));
        server.shells.lock().await.insert(id.clone(), shell.clone());

        let settings = Settings {
            model: "replacement".to_string(),
            ..Settings::default()
        };
        assert_eq!(server.reconfigure_open_shells(&settings).await, 1);

        let cached = server.shells.lock().await.get(&id).unwrap();
        assert!(Arc::ptr_eq(&cached, &shell));
        let shell = shell.lock().await;
        assert_eq!(shell.settings().model, "replacement");
        assert_eq!(shell.mode(), Some(Dialect::Flowchart));
    }

    #[test]
    fn memory_tools_save_list_and_forget() {
        let dir = tempfile::tempdir().unwrap();
        let server = server(&dir);

        let saved = server
            .save_memory(Parameters(SaveMemoryRequest {
                content: "prefers left-to-right flowcharts".to_string(),
            }))
            .unwrap();
        assert_ne!(saved.is_error, Some(true));
        let memory = server.memories.list_memories().unwrap().remove(0);
        assert_eq!(memory.content, "prefers left-to-right flowcharts");

        let blank = server
            .save_memory(Parameters(SaveMemoryRequest { content: " ".to_string() }))
            .unwrap();
        assert_eq!(blank.is_error, Some(true));

        let deleted = server
            .delete_memory(Parameters(MemoryIdRequest { memory_id: memory.id.clone() }))
            .unwrap();
        assert_ne!(deleted.is_error, Some(true));
        let missing = server
            .delete_memory(Parameters(MemoryIdRequest { memory_id: memory.id }))
            .unwrap();
        assert_eq!(missing.is_error, Some(true));

        server.memories.save_memory("a").unwrap();
        server.memories.save_memory("b").unwrap();
        assert_ne!(server.delete_memories().unwrap().is_error, Some(true));
        assert!(server.memories.list_memories().unwrap().is_empty());
    }

    #[test]
    fn mode_names_round_trip_through_parse() {
        for mode in [None, Some(Dialect::Flowchart), Some(Dialect::Outline)] {
            assert_eq!(parse_mode(mode_name(mode)), Ok(mode));
        }
    }
}
