//! Turn transcripts.
//!
//! `TranscriptionAccumulator` merges streaming deltas for one turn;
//! `ConversationLog` keeps the finalized turns for the presentation layer and
//! outlives individual sessions.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::ipc::events::TurnEvent;

/// Broadcast capacity for turn events.
const TURN_BROADCAST_CAP: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    User,
    Model,
}

/// One finalized utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRecord {
    pub speaker: Speaker,
    pub text: String,
}

impl TurnRecord {
    pub fn new(speaker: Speaker, text: impl Into<String>) -> Self {
        Self {
            speaker,
            text: text.into(),
        }
    }
}

/// Per-turn text buffers for both sides of the conversation.
#[derive(Debug, Default)]
pub struct TranscriptionAccumulator {
    user: String,
    model: String,
}

impl TranscriptionAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_user(&mut self, delta: &str) {
        self.user.push_str(delta);
    }

    pub fn append_model(&mut self, delta: &str) {
        self.model.push_str(delta);
    }

    /// Close the turn: user record first, then model record, skipping any
    /// side whose text is empty after trimming. Both buffers are cleared.
    pub fn on_turn_complete(&mut self) -> Vec<TurnRecord> {
        let mut records = Vec::with_capacity(2);
        for (speaker, buf) in [
            (Speaker::User, &mut self.user),
            (Speaker::Model, &mut self.model),
        ] {
            let text = buf.trim();
            if !text.is_empty() {
                records.push(TurnRecord::new(speaker, text));
            }
            buf.clear();
        }
        records
    }

    pub fn clear(&mut self) {
        self.user.clear();
        self.model.clear();
    }

    pub fn pending_user(&self) -> &str {
        &self.user
    }

    pub fn pending_model(&self) -> &str {
        &self.model
    }
}

/// Append-only, shareable record of finalized turns.
///
/// Clones share the same log. Readers get snapshots or subscribe to
/// [`TurnEvent`]s; only the session appends. Emptying a non-empty log is
/// broadcast as [`TurnEvent::Cleared`].
#[derive(Clone)]
pub struct ConversationLog {
    records: Arc<RwLock<Vec<TurnRecord>>>,
    seq: Arc<AtomicU64>,
    tx: broadcast::Sender<TurnEvent>,
}

impl ConversationLog {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TURN_BROADCAST_CAP);
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            seq: Arc::new(AtomicU64::new(0)),
            tx,
        }
    }

    pub fn snapshot(&self) -> Vec<TurnRecord> {
        self.records.read().clone()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TurnEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn extend(&self, records: Vec<TurnRecord>) {
        if records.is_empty() {
            return;
        }
        self.records.write().extend(records.iter().cloned());
        for record in records {
            let seq = self.seq.fetch_add(1, Ordering::Relaxed);
            let _ = self.tx.send(TurnEvent::Appended { seq, record });
        }
    }

    pub(crate) fn clear(&self) {
        {
            let mut records = self.records.write();
            if records.is_empty() {
                return;
            }
            records.clear();
        }
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let _ = self.tx.send(TurnEvent::Cleared { seq });
    }
}

impl Default for ConversationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ConversationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationLog")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
