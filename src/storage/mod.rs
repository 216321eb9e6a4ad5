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

//! Durable key/value storage.
//!
//! Every component persists under its own key; each put replaces the whole
//! value atomically.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, warn};

use crate::error::Result;

/// Key holding the offline outbox.
pub const OUTBOX_KEY: &str = "outbox.pending";

/// Key holding the peripheral recency list.
pub const PERIPHERAL_HISTORY_KEY: &str = "bluetooth.history";

/// Key/value store of JSON documents.
pub trait Store: Send + Sync {
    /// Fetch a value, `None` when the key is absent.
    fn get(&self, key: &str) -> Result<Option<Value>>;

    /// Replace the value under `key`.
    fn set(&self, key: &str, value: &Value) -> Result<()>;

    /// Delete `key`. Returns whether it existed.
    fn remove(&self, key: &str) -> Result<bool>;
}

/// Load and decode a value, falling back to the default on any failure.
pub fn load_json<T>(store: &dyn Store, key: &str) -> T
where
    T: DeserializeOwned + Default,
{
    match store.get(key) {
        Ok(Some(value)) => match serde_json::from_value(value) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("Discarding unreadable value under '{}': {}", key, e);
                T::default()
            }
        },
        Ok(None) => T::default(),
        Err(e) => {
            error!("Failed to load '{}': {}", key, e);
            T::default()
        }
    }
}

/// Encode and store a value. Failures are logged, never propagated.
pub fn save_json<T>(store: &dyn Store, key: &str, value: &T) -> bool
where
    T: Serialize + ?Sized,
{
    let encoded = match serde_json::to_value(value) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to encode '{}': {}", key, e);
            return false;
        }
    };

    match store.set(key, &encoded) {
        Ok(()) => true,
        Err(e) => {
            error!("Failed to persist '{}': {}", key, e);
            false
        }
    }
}
