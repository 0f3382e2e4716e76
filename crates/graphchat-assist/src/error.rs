#[derive(Debug, thiserror::Error)]
pub enum AssistError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),
    #[error("build LLM: {0}")]
    Build(String),
    #[error("chat: {0}")]
    Request(String),
    #[error("stream: {0}")]
    Stream(String),
    #[error("LLM returned empty text")]
    EmptyReply,
    #[error("a response is already streaming")]
    Busy,
    #[error("no user message to regenerate from")]
    NothingToRegenerate,
    #[error(transparent)]
    Core(#[from] graphchat_core::Error),
}

pub type Result<T, E = AssistError> = std::result::Result<T, E>;
