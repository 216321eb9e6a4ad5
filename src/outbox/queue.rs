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

//! Durable FIFO of envelopes waiting for the session.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tracing::warn;

use crate::envelope::OutboundEnvelope;
use crate::storage::{self, Store, OUTBOX_KEY};

/// Bounded FIFO persisted after every mutation.
pub struct PendingQueue {
    items: VecDeque<OutboundEnvelope>,
    capacity: usize,
    store: Arc<dyn Store>,
}

impl PendingQueue {
    /// Restore the queue left by the previous run.
    pub fn load(store: Arc<dyn Store>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut items: VecDeque<OutboundEnvelope> = storage::load_json(store.as_ref(), OUTBOX_KEY);

        let mut seen = HashSet::new();
        items.retain(|e| seen.insert(e.message_id().to_string()));

        while items.len() > capacity {
            if let Some(dropped) = items.pop_front() {
                warn!("Outbox over capacity, dropping {}", dropped.message_id());
            }
        }

        Self {
            items,
            capacity,
            store,
        }
    }

    /// Append at the tail. Returns the oldest envelope if it had to make room.
    pub fn push(&mut self, envelope: OutboundEnvelope) -> Option<OutboundEnvelope> {
        let dropped = if self.items.len() >= self.capacity {
            let dropped = self.items.pop_front();
            if let Some(d) = &dropped {
                warn!(
                    "Outbox full ({} envelopes), dropping oldest {}",
                    self.capacity,
                    d.message_id()
                );
            }
            dropped
        } else {
            None
        };

        self.items.push_back(envelope);
        self.persist();
        dropped
    }

    pub fn front(&self) -> Option<&OutboundEnvelope> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<OutboundEnvelope> {
        let head = self.items.pop_front();
        if head.is_some() {
            self.persist();
        }
        head
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.items.iter().map(|e| e.message_id().to_string()).collect()
    }

    fn persist(&self) -> bool {
        storage::save_json(self.store.as_ref(), OUTBOX_KEY, &self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UserProfile;
    use crate::storage::MemoryStore;

    fn text(body: &str) -> OutboundEnvelope {
        OutboundEnvelope::text(&UserProfile::default(), body)
    }

    #[test]
    fn test_fifo_survives_reload() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut queue = PendingQueue::load(store.clone(), 10);

        let first = text("one");
        let second = text("two");
        queue.push(first.clone());
        queue.push(second.clone());

        let reloaded = PendingQueue::load(store.clone(), 10);
        assert_eq!(
            reloaded.ids(),
            vec![first.message_id().to_string(), second.message_id().to_string()]
        );

        queue.pop_front();
        let reloaded = PendingQueue::load(store, 10);
        assert_eq!(reloaded.ids(), vec![second.message_id().to_string()]);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut queue = PendingQueue::load(store, 2);

        let oldest = text("a");
        assert!(queue.push(oldest.clone()).is_none());
        assert!(queue.push(text("b")).is_none());

        let dropped = queue.push(text("c")).unwrap();
        assert_eq!(dropped.message_id(), oldest.message_id());
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_load_drops_duplicates() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let envelope = text("twice");
        let stored = vec![envelope.clone(), envelope.clone()];
        storage::save_json(store.as_ref(), OUTBOX_KEY, &stored);

        let queue = PendingQueue::load(store, 10);
        assert_eq!(queue.ids(), vec![envelope.message_id().to_string()]);
    }

    #[test]
    fn test_pop_on_empty_queue() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut queue = PendingQueue::load(store.clone(), 10);
        assert!(queue.pop_front().is_none());
        assert!(store.get(OUTBOX_KEY).unwrap().is_none());
    }
}
