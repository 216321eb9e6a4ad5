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

//! Outbound envelopes: units of user content awaiting transmission.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::UserProfile;
use crate::session::protocol::{ClientMessage, UserMessage};

/// Content carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Payload {
    Audio {
        #[serde(with = "base64_bytes")]
        bytes: Vec<u8>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transcription_hint: Option<String>,
    },
    Text {
        text: String,
    },
}

/// A single user message, immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    message_id: String,
    user_id: String,
    user_name: String,
    voice: String,
    /// Epoch milliseconds.
    created_at: i64,
    payload: Payload,
}

impl OutboundEnvelope {
    fn new(profile: &UserProfile, payload: Payload) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            user_id: profile.user_id.clone(),
            user_name: profile.user_name.clone(),
            voice: profile.voice.clone(),
            created_at: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Create an audio envelope.
    pub fn audio(profile: &UserProfile, bytes: Vec<u8>, transcription_hint: Option<String>) -> Self {
        Self::new(
            profile,
            Payload::Audio {
                bytes,
                transcription_hint,
            },
        )
    }

    /// Create a text envelope.
    pub fn text(profile: &UserProfile, text: impl Into<String>) -> Self {
        Self::new(profile, Payload::Text { text: text.into() })
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// Text shown for this envelope in the conversation.
    pub fn display_text(&self) -> String {
        match &self.payload {
            Payload::Text { text } => text.clone(),
            Payload::Audio {
                transcription_hint: Some(hint),
                ..
            } if !hint.trim().is_empty() => hint.clone(),
            Payload::Audio { .. } => "[voice message]".to_string(),
        }
    }

    /// Wire form of this envelope.
    pub fn to_wire(&self) -> ClientMessage {
        let base = UserMessage {
            audio: None,
            text: None,
            transcription: None,
            user_id: self.user_id.clone(),
            user_name: self.user_name.clone(),
            voice: self.voice.clone(),
            timestamp: self.created_at,
            message_id: self.message_id.clone(),
        };

        match &self.payload {
            Payload::Audio {
                bytes,
                transcription_hint,
            } => ClientMessage::Audio(UserMessage {
                audio: Some(STANDARD.encode(bytes)),
                transcription: transcription_hint.clone(),
                ..base
            }),
            Payload::Text { text } => ClientMessage::Text(UserMessage {
                text: Some(text.clone()),
                ..base
            }),
        }
    }
}

/// Audio bytes stored as base64 rather than a JSON number array.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}
