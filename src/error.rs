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

//! Error taxonomy shared by the connection core.

use thiserror::Error;

use crate::media::Capability;

/// Errors crossing the trait seams of the core.
///
/// Session and peripheral failures are turned into state transitions and
/// events at the manager boundary; these values only surface from the
/// transport, adapter and store seams and from permission-gated actions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoreError {
    /// Connect, send or parse failure on the duplex transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Scan or connect failure on the Bluetooth adapter.
    #[error("peripheral error: {0}")]
    Peripheral(String),

    /// The user refused a capability. Never retried automatically.
    #[error("permission denied: {0}")]
    PermissionDenied(Capability),

    /// Durable storage failed. Callers continue with in-memory state.
    #[error("storage error: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn peripheral(msg: impl Into<String>) -> Self {
        Self::Peripheral(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }
}

impl From<rusqlite::Error> for CoreError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Storage(e.to_string())
    }
}

/// Result alias for the core.
pub type Result<T> = std::result::Result<T, CoreError>;
