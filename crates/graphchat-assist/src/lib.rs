//! Model access and chat orchestration for graphchat.
//!
//! The diagram pipeline itself (extraction, rendering, classification) lives
//! in `graphchat-core`; this crate drives it from a streaming model reply and
//! closes the loop with bounded automatic repair.

pub mod engine;
pub mod error;
mod parse;
pub mod prompt;
pub mod repair;
pub mod shell;

pub use engine::{LlmClient, ModelClient, ModelTurn, TokenStream, TurnRole};
pub use error::{AssistError, Result};
pub use repair::{
    IgnoreReason, RepairAttempt, RepairController, RepairDecision, RepairPhase,
    RepairSessionState, TurnOrigin, MAX_AUTO_REGENERATIONS,
};
pub use shell::{BlockRendered, ChatShell, ResponseStatus, StopHandle, TurnReport};
