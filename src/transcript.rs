//! Transcript store: the ordered conversation log.
//!
//! ## Invariants
//! - Turns are never reordered or removed individually; only [`TranscriptStore::clear`]
//!   removes them.
//! - At most one turn has `streaming = true`.
//! - User turns never change after `append`. Assistant turns change only while
//!   streaming, and leave the streaming state exactly once.
//! - Every operation is mirrored to the persistence bridge (if attached) and to
//!   subscribers before it returns.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{ChatError, Result};
use crate::persistence::PersistenceBridge;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

/// One conversation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
    /// True only while this turn receives decoded chunks. Records written
    /// before the flag existed omit it.
    #[serde(default)]
    pub streaming: bool,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Turn { role: Role::User, content: content.into(), streaming: false }
    }

    /// Empty assistant turn that will receive a stream.
    pub fn assistant_placeholder() -> Self {
        Turn { role: Role::Assistant, content: String::new(), streaming: true }
    }
}

/// Mutable view handed to [`TranscriptStore::mutate`] closures. The role is
/// not exposed.
pub struct TurnUpdate<'a> {
    pub content: &'a mut String,
    pub streaming: &'a mut bool,
}

/// Change notification for observers (the CLI renderer, tests).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TranscriptEvent {
    Appended { index: usize, turn: Turn },
    Updated { index: usize, turn: Turn },
    Cleared,
}

#[derive(Default)]
pub struct TranscriptStore {
    turns: Vec<Turn>,
    /// Bumped by every `clear`, so holders of an index can tell it went stale.
    generation: u64,
    bridge: Option<PersistenceBridge>,
    subscribers: Vec<mpsc::UnboundedSender<TranscriptEvent>>,
}

impl TranscriptStore {
    /// In-memory store with no persistence.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate from the bridge, then mirror every later change to it.
    pub fn with_persistence(bridge: PersistenceBridge) -> Self {
        let turns = bridge.load();
        TranscriptStore {
            turns,
            generation: 0,
            bridge: Some(bridge),
            subscribers: Vec::new(),
        }
    }

    /// Add `turn` at the end and return its index.
    pub fn append(&mut self, turn: Turn) -> Result<usize> {
        if turn.streaming {
            if turn.role == Role::User {
                return Err(ChatError::InvalidInput(
                    "user turns cannot be streaming".to_string(),
                ));
            }
            if self.active_index().is_some() {
                return Err(ChatError::Busy);
            }
        }
        let index = self.turns.len();
        self.turns.push(turn.clone());
        self.persist();
        self.notify(TranscriptEvent::Appended { index, turn });
        Ok(index)
    }

    /// Apply `f` to the streaming assistant turn at `index`.
    pub fn mutate<F>(&mut self, index: usize, f: F) -> Result<&Turn>
    where
        F: FnOnce(&mut TurnUpdate<'_>),
    {
        let len = self.turns.len();
        let turn = self
            .turns
            .get_mut(index)
            .ok_or(ChatError::InvalidIndex { index, len })?;
        if turn.role == Role::User {
            return Err(ChatError::ImmutableTurn(index));
        }
        if !turn.streaming {
            return Err(ChatError::TurnFinalized(index));
        }

        f(&mut TurnUpdate {
            content: &mut turn.content,
            streaming: &mut turn.streaming,
        });
        let updated = turn.clone();

        self.persist();
        self.notify(TranscriptEvent::Updated { index, turn: updated });
        Ok(&self.turns[index])
    }

    /// Remove every turn.
    pub fn clear(&mut self) {
        self.turns.clear();
        self.generation += 1;
        self.persist();
        self.notify(TranscriptEvent::Cleared);
    }

    /// Immutable copy for persistence or display.
    pub fn snapshot(&self) -> Vec<Turn> {
        self.turns.clone()
    }

    pub fn get(&self, index: usize) -> Option<&Turn> {
        self.turns.get(index)
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Index of the turn currently receiving a stream, if any.
    pub fn active_index(&self) -> Option<usize> {
        self.turns.iter().position(|t| t.streaming)
    }

    /// Receive every subsequent change. Closed receivers are pruned lazily.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<TranscriptEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn persist(&self) {
        if let Some(bridge) = &self.bridge {
            bridge.save(&self.turns);
        }
    }

    fn notify(&mut self, event: TranscriptEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with_stream() -> (TranscriptStore, usize) {
        let mut store = TranscriptStore::new();
        store.append(Turn::user("What changed?")).unwrap();
        let idx = store.append(Turn::assistant_placeholder()).unwrap();
        (store, idx)
    }

    #[test]
    fn test_append_returns_sequential_indices() {
        let mut store = TranscriptStore::new();
        assert_eq!(store.append(Turn::user("a")).unwrap(), 0);
        assert_eq!(store.append(Turn::user("b")).unwrap(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_mutate_appends_content_in_place() {
        let (mut store, idx) = store_with_stream();
        store.mutate(idx, |t| t.content.push_str("The ")).unwrap();
        let turn = store.mutate(idx, |t| t.content.push_str("end")).unwrap();
        assert_eq!(turn.content, "The end");
        assert!(turn.streaming);
        assert_eq!(store.active_index(), Some(idx));
    }

    #[test]
    fn test_mutate_out_of_range_is_invalid_index() {
        let (mut store, _) = store_with_stream();
        let err = store.mutate(9, |_| {}).unwrap_err();
        assert!(matches!(err, ChatError::InvalidIndex { index: 9, len: 2 }));
    }

    #[test]
    fn test_user_turn_is_immutable() {
        let (mut store, _) = store_with_stream();
        let err = store.mutate(0, |t| t.content.push('!')).unwrap_err();
        assert!(matches!(err, ChatError::ImmutableTurn(0)));
        assert_eq!(store.get(0).unwrap().content, "What changed?");
    }

    #[test]
    fn test_finalized_turn_rejects_further_mutation() {
        let (mut store, idx) = store_with_stream();
        store.mutate(idx, |t| *t.streaming = false).unwrap();
        assert_eq!(store.active_index(), None);
        let err = store.mutate(idx, |t| t.content.push('x')).unwrap_err();
        assert!(matches!(err, ChatError::TurnFinalized(i) if i == idx));
    }

    #[test]
    fn test_second_streaming_turn_is_rejected() {
        let (mut store, _) = store_with_stream();
        let err = store.append(Turn::assistant_placeholder()).unwrap_err();
        assert!(matches!(err, ChatError::Busy));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_streaming_user_turn_is_rejected() {
        let mut store = TranscriptStore::new();
        let turn = Turn { role: Role::User, content: "q".into(), streaming: true };
        assert!(matches!(store.append(turn), Err(ChatError::InvalidInput(_))));
    }

    #[test]
    fn test_clear_empties_and_bumps_generation() {
        let (mut store, _) = store_with_stream();
        let before = store.generation();
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.generation(), before + 1);
        assert_eq!(store.active_index(), None);
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let (mut store, idx) = store_with_stream();
        let snap = store.snapshot();
        store.mutate(idx, |t| t.content.push_str("later")).unwrap();
        assert_eq!(snap[idx].content, "");
    }

    #[test]
    fn test_subscribers_see_every_change_in_order() {
        let mut store = TranscriptStore::new();
        let mut rx = store.subscribe();
        store.append(Turn::user("q")).unwrap();
        let idx = store.append(Turn::assistant_placeholder()).unwrap();
        store.mutate(idx, |t| t.content.push_str("a")).unwrap();
        store.clear();

        assert!(matches!(rx.try_recv().unwrap(), TranscriptEvent::Appended { index: 0, .. }));
        assert!(matches!(rx.try_recv().unwrap(), TranscriptEvent::Appended { index: 1, .. }));
        match rx.try_recv().unwrap() {
            TranscriptEvent::Updated { index, turn } => {
                assert_eq!(index, 1);
                assert_eq!(turn.content, "a");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert_eq!(rx.try_recv().unwrap(), TranscriptEvent::Cleared);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let mut store = TranscriptStore::new();
        drop(store.subscribe());
        store.append(Turn::user("q")).unwrap();
        assert!(store.subscribers.is_empty());
    }

    #[test]
    fn test_turn_serde_shape() {
        let json = serde_json::to_string(&Turn::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi","streaming":false}"#);
        let legacy: Turn = serde_json::from_str(r#"{"role":"assistant","content":"ok"}"#).unwrap();
        assert_eq!(legacy.role, Role::Assistant);
        assert!(!legacy.streaming);
    }
}
