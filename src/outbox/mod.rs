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

//! Offline outbox.
//!
//! Envelopes that cannot be handed to the session right away are kept in a
//! durable FIFO and replayed, one at a time and in order, every time the
//! session opens.

mod queue;

pub use queue::PendingQueue;

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::envelope::OutboundEnvelope;
use crate::session::SessionManager;
use crate::storage::Store;

/// Where the outbox delivers envelopes.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    fn is_open(&self) -> bool;

    /// Returns whether the envelope was handed off.
    async fn send(&self, envelope: &OutboundEnvelope) -> bool;
}

#[async_trait]
impl EnvelopeSink for SessionManager {
    fn is_open(&self) -> bool {
        SessionManager::is_open(self)
    }

    async fn send(&self, envelope: &OutboundEnvelope) -> bool {
        SessionManager::send(self, envelope).await
    }
}

/// Result of submitting an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Handed to the session immediately.
    Sent,
    /// Waiting for the next open.
    Queued,
    /// Queued, and the oldest pending envelope was dropped to make room.
    QueuedWithDrop { dropped: String },
}

/// Serializes direct sends and replays against one pending queue.
pub struct OutboxCoordinator {
    sink: Arc<dyn EnvelopeSink>,
    queue: Mutex<PendingQueue>,
}

impl OutboxCoordinator {
    pub fn new(sink: Arc<dyn EnvelopeSink>, store: Arc<dyn Store>, config: &OutboxConfig) -> Self {
        let queue = PendingQueue::load(store, config.capacity);
        if !queue.is_empty() {
            info!("Outbox restored {} pending envelopes", queue.len());
        }

        Self {
            sink,
            queue: Mutex::new(queue),
        }
    }

    /// Send now if the session is open and nothing is waiting ahead of this
    /// envelope; queue it otherwise.
    pub async fn enqueue_and_attempt(&self, envelope: OutboundEnvelope) -> EnqueueOutcome {
        let mut queue = self.queue.lock().await;

        if queue.is_empty() && self.sink.is_open() {
            if self.sink.send(&envelope).await {
                return EnqueueOutcome::Sent;
            }
            debug!("Direct send of {} failed, queueing", envelope.message_id());
        }

        let id = envelope.message_id().to_string();
        match queue.push(envelope) {
            Some(dropped) => EnqueueOutcome::QueuedWithDrop {
                dropped: dropped.message_id().to_string(),
            },
            None => {
                debug!("Queued {} ({} pending)", id, queue.len());
                EnqueueOutcome::Queued
            }
        }
    }

    /// Replay pending envelopes in order. Stops at the first failure and
    /// leaves the rest for the next open. Returns how many were delivered.
    pub async fn on_session_opened(&self) -> usize {
        let mut queue = self.queue.lock().await;
        if queue.is_empty() {
            return 0;
        }

        info!("Replaying {} queued envelopes", queue.len());
        let mut delivered = 0;
        while let Some(head) = queue.front() {
            if !self.sink.send(head).await {
                warn!(
                    "Replay stopped at {}, {} envelopes left",
                    head.message_id(),
                    queue.len()
                );
                break;
            }
            queue.pop_front();
            delivered += 1;
        }

        delivered
    }

    pub async fn pending(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Ids of pending envelopes, oldest first.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.queue.lock().await.ids()
    }
}
