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

//! AirAssist connection core.
//!
//! Keeps a voice assistant client usable on flaky networks and flaky
//! radios: a self-healing session to the assistant service, a durable
//! outbox for messages written while offline, and a Bluetooth peripheral
//! manager that remembers and reconnects the user's headset. The
//! [`Orchestrator`] ties them to a read model hosts render.

pub mod bluetooth;
pub mod config;
pub mod envelope;
pub mod error;
pub mod media;
pub mod orchestrator;
pub mod outbox;
pub mod session;
pub mod state;
pub mod storage;
pub mod testing;

pub use config::Config;
pub use envelope::{OutboundEnvelope, Payload};
pub use error::{CoreError, Result};
pub use orchestrator::{auto_listen_allowed, Collaborators, Orchestrator};
pub use state::{AppState, ConversationEntry, Origin, Snapshot};
