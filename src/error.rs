//! Crate-level error type.
//!
//! Every fallible operation in the library returns [`ChatError`]. The stream
//! session controller converts the stream-related variants into transcript
//! content, so only rejections (`Busy`, `EmptyQuestion`) reach callers of
//! [`crate::session::ChatSession::send`].

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    /// The request could not be sent or the response never arrived.
    #[error("transport error: {0}")]
    Transport(String),

    /// The backend replied with a non-2xx status.
    #[error("server returned HTTP {status}: {body}")]
    Server { status: u16, body: String },

    /// A byte sequence in the response body is not valid UTF-8.
    #[error("decode error: {0}")]
    Decode(String),

    /// `mutate` was called with an index past the end of the transcript.
    #[error("turn index {index} out of range (transcript has {len} turns)")]
    InvalidIndex { index: usize, len: usize },

    /// User turns never change after they are appended.
    #[error("turn {0} is a user turn and cannot be mutated")]
    ImmutableTurn(usize),

    /// The turn already left the streaming state.
    #[error("turn {0} is no longer streaming")]
    TurnFinalized(usize),

    /// Another chat stream is still active.
    #[error("a chat stream is already in flight")]
    Busy,

    #[error("question is empty")]
    EmptyQuestion,

    #[error("storage error: {0}")]
    Storage(String),

    /// Persisted data does not match the expected schema.
    #[error("schema error for key '{key}': {detail}")]
    Schema { key: String, detail: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, ChatError>;

impl From<reqwest::Error> for ChatError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ChatError::Decode(err.to_string())
        } else {
            ChatError::Transport(err.to_string())
        }
    }
}

impl From<rusqlite::Error> for ChatError {
    fn from(err: rusqlite::Error) -> Self {
        ChatError::Storage(err.to_string())
    }
}
