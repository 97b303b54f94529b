pub mod api;
pub mod cli;
pub mod config;
pub mod decoder;
pub mod error;
pub mod persistence;
pub mod render;
pub mod session;
pub mod transcript;
pub mod transport;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

pub use error::{ChatError, Result};
pub use persistence::{PersistenceBridge, Storage};
pub use session::{ChatSession, SendOutcome};
pub use transcript::{Role, TranscriptStore, Turn};
pub use transport::{ChatBody, ChatTransport, HttpTransport};

/// Current Unix epoch in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Build a chat session whose transcript is restored from, and mirrored to,
/// `storage`.
pub fn open_session(transport: Arc<dyn ChatTransport>, storage: Arc<dyn Storage>) -> ChatSession {
    let transcript = TranscriptStore::with_persistence(PersistenceBridge::new(storage));
    ChatSession::new(transport, transcript)
}
