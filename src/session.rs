//! Stream session controller.
//!
//! One [`ChatSession::send`] call is one request/response cycle:
//!
//! 1. append the user turn, then an empty streaming assistant turn
//! 2. open `/chat` through the injected [`ChatTransport`]
//! 3. feed the body through [`decoder::lines`] and append each line to the
//!    assistant turn, in order
//! 4. finalize the turn on end-of-stream, failure, or cancellation
//!
//! Only one stream may be in flight; a concurrent `send` is rejected with
//! [`ChatError::Busy`] before anything is appended. Both suspension points
//! (awaiting headers, awaiting the next read) honor the session's
//! cancellation token.
//!
//! Stream failures never escape `send`: they become transcript content and a
//! [`SendOutcome::Failed`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::api::ChatRequest;
use crate::decoder;
use crate::error::{ChatError, Result};
use crate::transcript::{TranscriptEvent, TranscriptStore, Turn, TurnUpdate};
use crate::transport::{ChatBody, ChatTransport};

/// User-visible text written into a turn whose stream failed.
pub const FAILURE_NOTICE: &str = "Error contacting server.";

/// How a `send` call that was accepted ended.
#[derive(Debug)]
pub enum SendOutcome {
    Completed { index: usize },
    Failed { index: usize, error: ChatError },
    /// Cancelled via [`ChatSession::cancel`] or superseded by
    /// [`ChatSession::clear`].
    Cancelled { index: usize },
}

impl SendOutcome {
    /// Index of the assistant turn the session wrote to.
    pub fn index(&self) -> usize {
        match self {
            SendOutcome::Completed { index }
            | SendOutcome::Failed { index, .. }
            | SendOutcome::Cancelled { index } => *index,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, SendOutcome::Completed { .. })
    }
}

/// Text appended to a turn when its stream fails.
pub fn failure_notice(error: &ChatError) -> String {
    match error {
        ChatError::Server { body, .. } if !body.trim().is_empty() => {
            format!("Error contacting server: {}", body.trim())
        }
        _ => FAILURE_NOTICE.to_string(),
    }
}

struct ActiveStream {
    cancel: CancellationToken,
}

pub struct ChatSession {
    transport: Arc<dyn ChatTransport>,
    transcript: Mutex<TranscriptStore>,
    active: Mutex<Option<ActiveStream>>,
}

impl ChatSession {
    pub fn new(transport: Arc<dyn ChatTransport>, transcript: TranscriptStore) -> Self {
        ChatSession {
            transport,
            transcript: Mutex::new(transcript),
            active: Mutex::new(None),
        }
    }

    /// Ask `question`, optionally narrowed to one processed file.
    ///
    /// # Returns
    /// - `Err(ChatError::EmptyQuestion)` / `Err(ChatError::Busy)`: rejected,
    ///   the transcript is untouched.
    /// - `Ok(outcome)`: the question was appended and the assistant turn has
    ///   been finalized.
    pub async fn send(&self, question: &str, context_filter: Option<&str>) -> Result<SendOutcome> {
        let question = question.trim();
        if question.is_empty() {
            return Err(ChatError::EmptyQuestion);
        }

        let cancel = CancellationToken::new();
        let mut guard = self.begin(cancel.clone())?;

        let (index, generation) = {
            let mut store = self.lock_transcript();
            if store.active_index().is_some() {
                warn!("chat request rejected: transcript already has a streaming turn");
                return Err(ChatError::Busy);
            }
            store.append(Turn::user(question))?;
            let index = store.append(Turn::assistant_placeholder())?;
            (index, store.generation())
        };
        guard.track(index, generation);

        info!(index, context_filter = ?context_filter, "chat stream started");
        let request = ChatRequest {
            question: question.to_string(),
            selected_file: context_filter.map(str::to_string),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(self.finish_cancelled(index, generation)),
            opened = self.transport.open_chat(&request) => opened,
        };

        let body = match opened {
            Ok(body) => body,
            Err(e) => return Ok(self.finish_failed(index, generation, e)),
        };

        match body {
            ChatBody::Complete(text) => {
                if !text.trim().is_empty()
                    && !self.update(index, generation, |t| t.content.push_str(&text))
                {
                    return Ok(SendOutcome::Cancelled { index });
                }
            }
            ChatBody::Stream(bytes) => {
                let lines = decoder::lines(bytes);
                tokio::pin!(lines);
                let mut chunks = 0usize;
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Ok(self.finish_cancelled(index, generation)),
                        next = lines.next() => next,
                    };
                    match next {
                        Some(Ok(line)) => {
                            chunks += 1;
                            debug!(index, chunk = chunks, bytes = line.len(), "applying chunk");
                            if !self.update(index, generation, |t| t.content.push_str(&line)) {
                                return Ok(SendOutcome::Cancelled { index });
                            }
                        }
                        Some(Err(e)) => return Ok(self.finish_failed(index, generation, e)),
                        None => break,
                    }
                }
            }
        }

        self.update(index, generation, |t| *t.streaming = false);
        info!(index, "chat stream completed");
        Ok(SendOutcome::Completed { index })
    }

    /// Abort the in-flight stream, if any. Content received so far is kept.
    pub fn cancel(&self) {
        if let Some(active) = self.lock_active().as_ref() {
            active.cancel.cancel();
        }
    }

    /// Remove every turn. An in-flight stream is cancelled first and will not
    /// write to the cleared transcript.
    pub fn clear(&self) {
        self.cancel();
        self.lock_transcript().clear();
    }

    pub fn is_streaming(&self) -> bool {
        self.lock_active().is_some()
    }

    pub fn snapshot(&self) -> Vec<Turn> {
        self.lock_transcript().snapshot()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TranscriptEvent> {
        self.lock_transcript().subscribe()
    }

    fn begin(&self, cancel: CancellationToken) -> Result<ActiveGuard<'_>> {
        let mut active = self.lock_active();
        if active.is_some() {
            warn!("chat request rejected: a stream is already in flight");
            return Err(ChatError::Busy);
        }
        *active = Some(ActiveStream { cancel });
        Ok(ActiveGuard { session: self, turn: None })
    }

    /// Apply `f` to the active turn. Returns `false` when the transcript was
    /// cleared since the stream started, in which case nothing is written.
    fn update<F>(&self, index: usize, generation: u64, f: F) -> bool
    where
        F: FnOnce(&mut TurnUpdate<'_>),
    {
        let mut store = self.lock_transcript();
        if store.generation() != generation {
            debug!(index, "transcript cleared mid-stream; dropping update");
            return false;
        }
        match store.mutate(index, f) {
            Ok(_) => true,
            Err(e) => {
                error!(index, error = %e, "active turn rejected update");
                false
            }
        }
    }

    fn finish_failed(&self, index: usize, generation: u64, err: ChatError) -> SendOutcome {
        error!(index, error = %err, "chat stream failed");
        let notice = failure_notice(&err);
        self.update(index, generation, |t| {
            if !t.content.is_empty() {
                t.content.push_str("\n\n");
            }
            t.content.push_str(&notice);
            *t.streaming = false;
        });
        SendOutcome::Failed { index, error: err }
    }

    fn finish_cancelled(&self, index: usize, generation: u64) -> SendOutcome {
        info!(index, "chat stream cancelled");
        self.finalize_if_streaming(index, generation);
        SendOutcome::Cancelled { index }
    }

    fn finalize_if_streaming(&self, index: usize, generation: u64) {
        let mut store = self.lock_transcript();
        let streaming = store.generation() == generation
            && store.get(index).is_some_and(|t| t.streaming);
        if streaming {
            if let Err(e) = store.mutate(index, |t| *t.streaming = false) {
                error!(index, error = %e, "could not finalize turn");
            }
        }
    }

    fn lock_transcript(&self) -> MutexGuard<'_, TranscriptStore> {
        self.transcript.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveStream>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the busy slot when a `send` call ends, including when its future
/// is dropped mid-stream, and finalizes a turn left streaming.
struct ActiveGuard<'a> {
    session: &'a ChatSession,
    turn: Option<(usize, u64)>,
}

impl ActiveGuard<'_> {
    fn track(&mut self, index: usize, generation: u64) {
        self.turn = Some((index, generation));
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        if let Some((index, generation)) = self.turn {
            self.session.finalize_if_streaming(index, generation);
        }
        *self.session.lock_active() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transcript::Role;
    use crate::transport::ByteStream;
    use async_trait::async_trait;

    /// Replies with the given reads, or with a server error.
    struct Scripted {
        reply: std::result::Result<Vec<&'static str>, (u16, &'static str)>,
    }

    #[async_trait]
    impl ChatTransport for Scripted {
        async fn open_chat(&self, _request: &ChatRequest) -> Result<ChatBody> {
            match &self.reply {
                Ok(reads) => {
                    let items: Vec<Result<Vec<u8>>> =
                        reads.iter().map(|r| Ok(r.as_bytes().to_vec())).collect();
                    let stream: ByteStream = Box::pin(futures_util::stream::iter(items));
                    Ok(ChatBody::Stream(stream))
                }
                Err((status, body)) => Err(ChatError::Server {
                    status: *status,
                    body: body.to_string(),
                }),
            }
        }
    }

    fn session(reply: std::result::Result<Vec<&'static str>, (u16, &'static str)>) -> ChatSession {
        ChatSession::new(Arc::new(Scripted { reply }), TranscriptStore::new())
    }

    #[tokio::test]
    async fn test_send_appends_user_then_assistant() {
        let s = session(Ok(vec!["Hello\n"]));
        let outcome = s.send("  Hi there  ", None).await.unwrap();
        assert!(outcome.is_completed());
        assert_eq!(outcome.index(), 1);
        let turns = s.snapshot();
        assert_eq!(turns[0].role, Role::User);
        assert_eq!(turns[0].content, "Hi there");
        assert_eq!(turns[1].content, "Hello");
        assert!(!turns[1].streaming);
        assert!(!s.is_streaming());
    }

    #[tokio::test]
    async fn test_blank_question_is_rejected_without_mutation() {
        let s = session(Ok(vec!["x\n"]));
        assert!(matches!(s.send("   ", None).await, Err(ChatError::EmptyQuestion)));
        assert!(s.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_server_error_becomes_notice() {
        let s = session(Err((503, "")));
        let outcome = s.send("q", None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { error: ChatError::Server { status: 503, .. }, .. }));
        assert_eq!(s.snapshot()[1].content, FAILURE_NOTICE);
    }

    #[tokio::test]
    async fn test_decode_error_keeps_partial_content() {
        struct BadBytes;
        #[async_trait]
        impl ChatTransport for BadBytes {
            async fn open_chat(&self, _request: &ChatRequest) -> Result<ChatBody> {
                let items: Vec<Result<Vec<u8>>> = vec![Ok(b"partial\n".to_vec()), Ok(vec![0xff, b'\n'])];
                Ok(ChatBody::Stream(Box::pin(futures_util::stream::iter(items))))
            }
        }
        let s = ChatSession::new(Arc::new(BadBytes), TranscriptStore::new());
        let outcome = s.send("q", None).await.unwrap();
        assert!(matches!(outcome, SendOutcome::Failed { error: ChatError::Decode(_), .. }));
        let turn = &s.snapshot()[1];
        assert_eq!(turn.content, format!("partial\n\n{FAILURE_NOTICE}"));
        assert!(!turn.streaming);
    }

    #[tokio::test]
    async fn test_bodyless_response_is_single_chunk() {
        struct NoBody;
        #[async_trait]
        impl ChatTransport for NoBody {
            async fn open_chat(&self, _request: &ChatRequest) -> Result<ChatBody> {
                Ok(ChatBody::Complete("line one\nline two".to_string()))
            }
        }
        let s = ChatSession::new(Arc::new(NoBody), TranscriptStore::new());
        assert!(s.send("q", None).await.unwrap().is_completed());
        assert_eq!(s.snapshot()[1].content, "line one\nline two");
    }

    #[test]
    fn test_failure_notice_text() {
        let server = ChatError::Server { status: 500, body: " server busy \n".into() };
        assert_eq!(failure_notice(&server), "Error contacting server: server busy");
        assert_eq!(failure_notice(&ChatError::Transport("refused".into())), FAILURE_NOTICE);
    }
}
