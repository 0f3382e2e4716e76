//! The chat orchestration shell.
//!
//! [`ChatShell`] owns the transcript, the response status and the repair
//! controller. It streams replies from a [`ModelClient`], renders diagram
//! blocks as they arrive and, once a reply has settled, feeds render
//! failures to the controller and dispatches whatever it decides.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use graphchat_core::extract::find_blocks;
use graphchat_core::render::{DiagramRenderer, RenderReport, RenderResult};
use graphchat_core::{Chat, ChatMessage, ChatStore, Dialect, Role, Settings};

use crate::engine::{ModelClient, ModelTurn};
use crate::error::{AssistError, Result};
use crate::parse::{fallback_title, parse_title};
use crate::prompt::{system_prompt, title_prompt, TITLE_SYSTEM_PROMPT};
use crate::repair::{
    RepairAttempt, RepairController, RepairDecision, RepairPhase, RepairSessionState, TurnOrigin,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResponseStatus {
    #[default]
    Idle,
    Streaming,
    Ready,
    Error,
}

/// Passed to every `on_block_rendered` callback.
#[derive(Debug, Clone)]
pub struct BlockRendered {
    pub message_id: String,
    pub block_index: usize,
    pub dialect: Dialect,
    /// What the renderer was given.
    pub source: String,
    /// False for progressive renders while the reply is still streaming.
    pub settled: bool,
    pub result: RenderResult,
}

pub type BlockCallback = Box<dyn Fn(&BlockRendered) + Send + Sync>;

/// Cancels the response currently streaming, from any task.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<Mutex<CancellationToken>>);

impl StopHandle {
    pub fn stop(&self) {
        self.slot().cancel();
    }

    /// Whether the response most recently started has been stopped.
    pub fn is_stopped(&self) -> bool {
        self.slot().is_cancelled()
    }

    fn arm(&self) -> CancellationToken {
        let mut slot = self.slot();
        *slot = CancellationToken::new();
        slot.clone()
    }

    fn slot(&self) -> MutexGuard<'_, CancellationToken> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnReport {
    pub status: ResponseStatus,
    /// Text of the last reply that settled.
    pub reply: Option<String>,
    /// Final renders of the diagram blocks in that reply.
    pub diagrams: Vec<RenderReport>,
    pub repairs: Vec<RepairAttempt>,
    pub budget_exhausted: bool,
    pub aborted: bool,
    pub error: Option<String>,
}

enum StreamOutcome {
    Settled(String),
    Aborted,
    Failed(String),
}

pub struct ChatShell {
    client: Arc<dyn ModelClient>,
    settings: Settings,
    renderer: DiagramRenderer,
    store: Option<Arc<dyn ChatStore>>,
    chat: Chat,
    status: ResponseStatus,
    repair: RepairController,
    callbacks: Vec<BlockCallback>,
    stop: StopHandle,
    last_error: Option<String>,
}

impl ChatShell {
    pub fn new(client: Arc<dyn ModelClient>, settings: Settings) -> Self {
        let chat = Chat::new(Chat::new_id());
        let mut repair = RepairController::new();
        repair.enter_context(&chat.id, chat.dialect);
        Self {
            client,
            settings,
            renderer: DiagramRenderer::default(),
            store: None,
            chat,
            status: ResponseStatus::Idle,
            repair,
            callbacks: Vec::new(),
            stop: StopHandle::default(),
            last_error: None,
        }
    }

    /// Persist the transcript after every turn.
    pub fn with_store(mut self, store: Arc<dyn ChatStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_renderer(mut self, renderer: DiagramRenderer) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn status(&self) -> ResponseStatus {
        self.status
    }

    pub fn chat(&self) -> &Chat {
        &self.chat
    }

    pub fn mode(&self) -> Option<Dialect> {
        self.chat.dialect
    }

    pub fn repair_state(&self) -> RepairSessionState {
        self.repair.state()
    }

    pub fn repair_phase(&self) -> RepairPhase {
        self.repair.phase()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Swap the model client and settings without touching the transcript
    /// or the repair budget.
    pub fn set_client(&mut self, client: Arc<dyn ModelClient>, settings: Settings) {
        self.client = client;
        self.settings = settings;
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn on_block_rendered(&mut self, callback: impl Fn(&BlockRendered) + Send + Sync + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    /// Switch between plain chat (`None`) and a diagram dialect.
    pub fn set_dialect(&mut self, dialect: Option<Dialect>) {
        self.chat.dialect = dialect;
        self.repair.enter_context(&self.chat.id, dialect);
    }

    pub fn load_conversation(&mut self, chat: Chat) -> Result<()> {
        if self.status == ResponseStatus::Streaming {
            return Err(AssistError::Busy);
        }
        info!(chat_id = %chat.id, messages = chat.messages.len(), "conversation loaded");
        self.repair.enter_context(&chat.id, chat.dialect);
        self.chat = chat;
        self.status = ResponseStatus::Idle;
        self.last_error = None;
        Ok(())
    }

    /// Load a stored conversation by id.
    pub fn open_conversation(&mut self, id: &str) -> Result<()> {
        let chat = match &self.store {
            Some(store) => store.load_chat(id)?,
            None => return Err(graphchat_core::Error::ChatNotFound(id.to_string()).into()),
        };
        self.load_conversation(chat)
    }

    /// Start an empty conversation in the current mode.
    pub fn new_conversation(&mut self) -> Result<()> {
        let mut chat = Chat::new(Chat::new_id());
        chat.dialect = self.chat.dialect;
        self.load_conversation(chat)
    }

    pub async fn dispatch_user_turn(&mut self, text: &str) -> Result<TurnReport> {
        if self.status == ResponseStatus::Streaming {
            return Err(AssistError::Busy);
        }
        self.chat.messages.push(ChatMessage::new(Role::User, text));
        self.chat.updated_at = Utc::now();
        self.run(TurnOrigin::User).await
    }

    /// Drop the trailing reply (and any notice) and ask again. Does not
    /// refill the repair budget.
    pub async fn regenerate(&mut self) -> Result<TurnReport> {
        if self.status == ResponseStatus::Streaming {
            return Err(AssistError::Busy);
        }
        while self.chat.messages.last().is_some_and(|m| m.role != Role::User) {
            self.chat.messages.pop();
        }
        if self.chat.messages.is_empty() {
            return Err(AssistError::NothingToRegenerate);
        }
        self.run(TurnOrigin::User).await
    }

    async fn run(&mut self, mut origin: TurnOrigin) -> Result<TurnReport> {
        let mut report = TurnReport::default();

        loop {
            let reply_id = match self.stream_response(origin).await {
                StreamOutcome::Aborted => {
                    report.aborted = true;
                    break;
                }
                StreamOutcome::Failed(message) => {
                    report.error = Some(message);
                    break;
                }
                StreamOutcome::Settled(reply_id) => reply_id,
            };

            self.repair.on_response_settled(&reply_id);
            // A stop that lands after the last token still cancels follow-up repairs.
            let stopped = self.stop.is_stopped();
            if stopped {
                self.repair.on_user_abort();
                report.aborted = true;
            }
            let (diagrams, decision) = self.render_settled(&reply_id, !stopped);
            report.diagrams = diagrams;
            report.reply = self.message(&reply_id).map(|m| m.content.clone());

            match decision {
                Some(RepairDecision::Dispatch(attempt)) => {
                    self.chat
                        .messages
                        .push(ChatMessage::new(Role::User, attempt.corrective_instruction.as_str()));
                    report.repairs.push(attempt);
                    origin = TurnOrigin::Repair;
                    continue;
                }
                Some(RepairDecision::NotifyExhausted(notice)) => {
                    self.chat.messages.push(ChatMessage::new(Role::Notice, notice));
                    report.budget_exhausted = true;
                }
                Some(RepairDecision::Ignore(_)) | None => {}
            }

            self.maybe_generate_title().await;
            break;
        }

        self.chat.updated_at = Utc::now();
        self.persist();
        report.status = self.status;
        Ok(report)
    }

    async fn stream_response(&mut self, origin: TurnOrigin) -> StreamOutcome {
        let token = self.stop.arm();
        let turns = self.model_turns();
        let reply = ChatMessage::new(Role::Assistant, "");
        let reply_id = reply.id.clone();
        self.chat.messages.push(reply);
        self.repair.begin_response(&reply_id, origin);
        self.status = ResponseStatus::Streaming;
        self.last_error = None;

        let dialect = self.chat.dialect;
        let system = system_prompt(dialect);
        let temperature = self.settings.temperature_for(dialect);
        info!(
            chat_id = %self.chat.id,
            ?origin,
            ?dialect,
            turns = turns.len(),
            "dispatching turn"
        );

        let opened = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            opened = self.client.stream_reply(&system, &turns, temperature) => Some(opened),
        };
        let mut stream = match opened {
            None => return self.finish_aborted(&reply_id),
            Some(Err(e)) => return self.finish_failed(&reply_id, e),
            Some(Ok(stream)) => stream,
        };

        let mut rendered: Vec<String> = Vec::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return self.finish_aborted(&reply_id),
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    if let Some(message) = self.message_mut(&reply_id) {
                        message.content.push_str(&chunk);
                    }
                    self.render_progress(&reply_id, &mut rendered);
                }
                Some(Err(e)) => return self.finish_failed(&reply_id, e),
                None => break,
            }
        }

        self.status = ResponseStatus::Ready;
        debug!(%reply_id, "reply settled");
        StreamOutcome::Settled(reply_id)
    }

    fn finish_aborted(&mut self, reply_id: &str) -> StreamOutcome {
        self.repair.on_user_abort();
        self.drop_if_empty(reply_id);
        self.status = ResponseStatus::Idle;
        info!(reply_id, "response stopped by user");
        StreamOutcome::Aborted
    }

    fn finish_failed(&mut self, reply_id: &str, error: AssistError) -> StreamOutcome {
        self.drop_if_empty(reply_id);
        self.status = ResponseStatus::Error;
        let message = error.to_string();
        warn!(reply_id, error = %message, "model request failed");
        self.last_error = Some(message.clone());
        StreamOutcome::Failed(message)
    }

    fn drop_if_empty(&mut self, reply_id: &str) {
        self.chat
            .messages
            .retain(|m| m.id != reply_id || !m.content.is_empty());
    }

    /// Render blocks whose renderable prefix changed since the last chunk.
    /// These renders are for display only and never reach the controller.
    fn render_progress(&mut self, reply_id: &str, rendered: &mut Vec<String>) {
        if self.chat.dialect.is_none() {
            return;
        }
        let Some(content) = self.message(reply_id).map(|m| m.content.clone()) else {
            return;
        };
        for (index, block) in find_blocks(&content).into_iter().enumerate() {
            let cleaned = block.renderable_source();
            if !cleaned.is_renderable() {
                continue;
            }
            if rendered.len() <= index {
                rendered.resize(index + 1, String::new());
            }
            if rendered[index] == cleaned.source {
                continue;
            }
            let result = self.renderer.render(block.dialect, &cleaned.source);
            rendered[index] = cleaned.source.clone();
            self.emit(&BlockRendered {
                message_id: reply_id.to_string(),
                block_index: index,
                dialect: block.dialect,
                source: cleaned.source,
                settled: false,
                result,
            });
        }
    }

    fn render_settled(
        &mut self,
        reply_id: &str,
        repairable: bool,
    ) -> (Vec<RenderReport>, Option<RepairDecision>) {
        let mut reports = Vec::new();
        let mut decision = None;
        if self.chat.dialect.is_none() {
            return (reports, decision);
        }
        let Some(content) = self.message(reply_id).map(|m| m.content.clone()) else {
            return (reports, decision);
        };

        for (index, block) in find_blocks(&content).into_iter().enumerate() {
            let cleaned = block.renderable_source();
            if !cleaned.is_renderable() {
                debug!(reply_id, index, "block has no complete lines yet");
                continue;
            }
            let result = self.renderer.render(block.dialect, &cleaned.source);

            if let (
                true,
                RenderResult::Failure {
                    error_message,
                    partial_source,
                },
            ) = (repairable, &result)
            {
                match self.repair.on_render_failure(
                    reply_id,
                    self.status,
                    block.dialect,
                    error_message,
                    partial_source,
                ) {
                    RepairDecision::Ignore(reason) => {
                        debug!(reply_id, index, ?reason, "render failure not repaired");
                    }
                    acted => {
                        decision.get_or_insert(acted);
                    }
                }
            }

            reports.push(RenderReport::from(&result));
            self.emit(&BlockRendered {
                message_id: reply_id.to_string(),
                block_index: index,
                dialect: block.dialect,
                source: cleaned.source,
                settled: true,
                result,
            });
        }
        (reports, decision)
    }

    fn emit(&self, event: &BlockRendered) {
        for callback in &self.callbacks {
            callback(event);
        }
    }

    async fn maybe_generate_title(&mut self) {
        if !self.chat.needs_title() {
            return;
        }
        let Some(first_user) = self.chat.first_user_text().map(str::to_string) else {
            return;
        };

        let title = match self
            .client
            .complete(TITLE_SYSTEM_PROMPT, &title_prompt(&first_user))
            .await
        {
            Ok(raw) => parse_title(&raw),
            Err(e) => {
                warn!(error = %e, "title generation failed");
                None
            }
        };
        let title = title.unwrap_or_else(|| fallback_title(&first_user));
        info!(chat_id = %self.chat.id, %title, "chat titled");
        self.chat.title = Some(title);
    }

    fn persist(&self) {
        let Some(store) = &self.store else {
            return;
        };
        if self.chat.messages.is_empty() {
            return;
        }
        if let Err(e) = store.save_chat(&self.chat) {
            warn!(chat_id = %self.chat.id, error = %e, "failed to save chat");
        }
    }

    /// Transcript as the model sees it: notices and empty replies left out.
    fn model_turns(&self) -> Vec<ModelTurn> {
        self.chat
            .messages
            .iter()
            .filter_map(|m| match m.role {
                Role::User => Some(ModelTurn::user(m.content.as_str())),
                Role::Assistant if !m.content.is_empty() => {
                    Some(ModelTurn::assistant(m.content.as_str()))
                }
                _ => None,
            })
            .collect()
    }

    fn message(&self, id: &str) -> Option<&ChatMessage> {
        self.chat.messages.iter().rev().find(|m| m.id == id)
    }

    fn message_mut(&mut self, id: &str) -> Option<&mut ChatMessage> {
        self.chat.messages.iter_mut().rev().find(|m| m.id == id)
    }
}
