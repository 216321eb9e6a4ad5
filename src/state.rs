// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Application state management.
//!
//! The read model hosts render: connection states, the conversation and
//! the busy flags. Every mutation publishes a fresh [`Snapshot`].

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::bluetooth::PeripheralConnectionState;
use crate::session::ConnectionState;

/// Who produced a conversation entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    User,
    Assistant,
    /// Connection notices generated locally.
    System,
}

/// One line of the conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub id: String,
    pub text: String,
    pub origin: Origin,
    pub created_at: DateTime<Utc>,
}

impl ConversationEntry {
    /// User entry sharing the id of its outbound envelope.
    pub fn user(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::with_id(id.into(), text, Origin::User)
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), text, Origin::Assistant)
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), text, Origin::System)
    }

    fn with_id(id: String, text: impl Into<String>, origin: Origin) -> Self {
        Self {
            id,
            text: text.into(),
            origin,
            created_at: Utc::now(),
        }
    }
}

/// Ordered conversation log.
#[derive(Debug, Clone, Default)]
pub struct Conversation {
    entries: Vec<ConversationEntry>,
    corrected: HashSet<String>,
}

impl Conversation {
    pub fn push(&mut self, entry: ConversationEntry) {
        self.entries.push(entry);
    }

    /// Replace the text of user entry `id` with the server transcription.
    /// Applies at most once per entry; returns whether it did.
    pub fn correct(&mut self, id: &str, text: &str) -> bool {
        if self.corrected.contains(id) {
            return false;
        }
        let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.id == id && e.origin == Origin::User)
        else {
            return false;
        };

        entry.text = text.to_string();
        self.corrected.insert(id.to_string());
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.corrected.clear();
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Immutable view of the application state.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub session_state: ConnectionState,
    pub peripheral_state: PeripheralConnectionState,
    pub conversation: Vec<ConversationEntry>,
    /// Envelopes waiting in the outbox.
    pub pending_count: usize,
    /// Capturing or speaking.
    pub is_busy: bool,
}

/// Shared application state.
#[derive(Debug)]
pub struct AppState {
    session_state: RwLock<ConnectionState>,
    peripheral_state: RwLock<PeripheralConnectionState>,
    conversation: RwLock<Conversation>,
    pending_count: RwLock<usize>,
    capturing: RwLock<bool>,
    speaking: RwLock<bool>,
    updates: watch::Sender<Snapshot>,
}

impl Default for AppState {
    fn default() -> Self {
        let (updates, _) = watch::channel(Snapshot {
            session_state: ConnectionState::Idle,
            peripheral_state: PeripheralConnectionState::Disconnected,
            conversation: Vec::new(),
            pending_count: 0,
            is_busy: false,
        });

        Self {
            session_state: RwLock::new(ConnectionState::Idle),
            peripheral_state: RwLock::new(PeripheralConnectionState::Disconnected),
            conversation: RwLock::new(Conversation::default()),
            pending_count: RwLock::new(0),
            capturing: RwLock::new(false),
            speaking: RwLock::new(false),
            updates,
        }
    }
}

impl AppState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.updates.subscribe()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            session_state: *self.session_state.read(),
            peripheral_state: *self.peripheral_state.read(),
            conversation: self.conversation.read().entries().to_vec(),
            pending_count: *self.pending_count.read(),
            is_busy: self.is_busy(),
        }
    }

    pub fn session_state(&self) -> ConnectionState {
        *self.session_state.read()
    }

    pub fn peripheral_state(&self) -> PeripheralConnectionState {
        *self.peripheral_state.read()
    }

    pub fn set_session_state(&self, state: ConnectionState) {
        *self.session_state.write() = state;
        self.publish();
    }

    pub fn set_peripheral_state(&self, state: PeripheralConnectionState) {
        *self.peripheral_state.write() = state;
        self.publish();
    }

    pub fn push_entry(&self, entry: ConversationEntry) {
        self.conversation.write().push(entry);
        self.publish();
    }

    pub fn correct_entry(&self, id: &str, text: &str) -> bool {
        let corrected = self.conversation.write().correct(id, text);
        if corrected {
            self.publish();
        }
        corrected
    }

    pub fn clear_conversation(&self) {
        self.conversation.write().clear();
        self.publish();
    }

    pub fn set_pending_count(&self, count: usize) {
        *self.pending_count.write() = count;
        self.publish();
    }

    pub fn set_capturing(&self, capturing: bool) {
        *self.capturing.write() = capturing;
        self.publish();
    }

    pub fn set_speaking(&self, speaking: bool) {
        *self.speaking.write() = speaking;
        self.publish();
    }

    pub fn is_capturing(&self) -> bool {
        *self.capturing.read()
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.read()
    }

    pub fn is_busy(&self) -> bool {
        self.is_capturing() || self.is_speaking()
    }

    fn publish(&self) {
        self.updates.send_replace(self.snapshot());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correction_applies_once() {
        let mut conversation = Conversation::default();
        conversation.push(ConversationEntry::user("m1", "[voice message]"));

        assert!(conversation.correct("m1", "turn on the lights"));
        assert!(!conversation.correct("m1", "turn off the lights"));
        assert_eq!(conversation.entries()[0].text, "turn on the lights");
    }

    #[test]
    fn test_correction_ignores_other_origins() {
        let mut conversation = Conversation::default();
        let reply = ConversationEntry::assistant("Sure");
        let id = reply.id.clone();
        conversation.push(reply);

        assert!(!conversation.correct(&id, "rewritten"));
        assert!(!conversation.correct("missing", "rewritten"));
        assert_eq!(conversation.entries()[0].text, "Sure");
    }

    #[test]
    fn test_clear_resets_corrections() {
        let mut conversation = Conversation::default();
        conversation.push(ConversationEntry::user("m1", "a"));
        conversation.correct("m1", "b");
        conversation.clear();
        assert!(conversation.is_empty());

        conversation.push(ConversationEntry::user("m1", "c"));
        assert!(conversation.correct("m1", "d"));
    }

    #[test]
    fn test_subscribers_see_updates() {
        let state = AppState::new();
        let mut updates = state.subscribe();

        state.set_session_state(ConnectionState::Open);
        state.set_speaking(true);

        assert!(updates.has_changed().unwrap());
        let snapshot = updates.borrow_and_update().clone();
        assert_eq!(snapshot.session_state, ConnectionState::Open);
        assert!(snapshot.is_busy);
        assert_eq!(snapshot, state.snapshot());
    }
}
