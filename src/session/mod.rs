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

//! Remote session module.
//!
//! Keeps one duplex connection to the assistant service alive: backoff
//! reconnects, heartbeat, and a JSON wire protocol over WebSocket.

mod manager;
mod policy;
pub mod protocol;
pub mod transport;

pub use manager::{ConnectionState, SessionEvent, SessionManager};
pub use policy::ReconnectPolicy;
pub use protocol::{AiResponse, ClientMessage, ServerMessage, UserMessage};
pub use transport::{
    IncomingFrame, OutgoingFrame, Transport, TransportLink, WebSocketTransport, ABNORMAL_CLOSURE,
    HEARTBEAT_TIMEOUT, NORMAL_CLOSURE,
};
