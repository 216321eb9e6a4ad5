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

//! Recency-ordered list of peripherals the user connected to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

use crate::storage::{self, Store, PERIPHERAL_HISTORY_KEY};

/// A remembered peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeripheralRecord {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub last_connected_at: Option<DateTime<Utc>>,
}

/// Most recent connection first. Ids are unique and the list never exceeds
/// its limit.
#[derive(Debug, Clone)]
pub struct PeripheralHistory {
    records: Vec<PeripheralRecord>,
    limit: usize,
}

impl PeripheralHistory {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            limit: limit.max(1),
        }
    }

    /// Load from the store, repairing ordering and duplicates left by older
    /// writers.
    pub fn load(store: &dyn Store, limit: usize) -> Self {
        let mut records: Vec<PeripheralRecord> = storage::load_json(store, PERIPHERAL_HISTORY_KEY);

        // Newest first; records never connected sink to the end.
        records.sort_by(|a, b| b.last_connected_at.cmp(&a.last_connected_at));

        let mut seen = HashSet::new();
        records.retain(|r| seen.insert(r.id.clone()));

        let mut history = Self::new(limit);
        if records.len() > history.limit {
            warn!(
                "Peripheral history holds {} entries, keeping {}",
                records.len(),
                history.limit
            );
            records.truncate(history.limit);
        }
        history.records = records;
        history
    }

    pub fn save(&self, store: &dyn Store) -> bool {
        storage::save_json(store, PERIPHERAL_HISTORY_KEY, &self.records)
    }

    /// Move `id` to the front, stamping the connection time.
    pub fn record_connection(&mut self, id: &str, display_name: &str, at: DateTime<Utc>) {
        self.records.retain(|r| r.id != id);
        self.records.insert(
            0,
            PeripheralRecord {
                id: id.to_string(),
                display_name: display_name.to_string(),
                last_connected_at: Some(at),
            },
        );
        self.records.truncate(self.limit);
    }

    /// Forget `id`. Returns whether it was remembered.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        self.records.len() != before
    }

    pub fn most_recent(&self) -> Option<&PeripheralRecord> {
        self.records.first()
    }

    pub fn get(&self, id: &str) -> Option<&PeripheralRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn records(&self) -> &[PeripheralRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
