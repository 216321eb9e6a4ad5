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

//! Configuration module.
//!
//! Handles loading and saving the tunables of the connection core.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "airassist";

/// Core configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Data directory for the persisted store.
    #[serde(skip)]
    pub data_dir: PathBuf,

    /// Remote session settings.
    pub session: SessionConfig,

    /// Offline outbox settings.
    pub outbox: OutboxConfig,

    /// Peripheral settings.
    pub bluetooth: BluetoothConfig,

    /// Identity stamped on every outbound envelope.
    pub user: UserProfile,

    /// Conversation behavior.
    pub conversation: ConversationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// WebSocket endpoint of the assistant service.
    pub url: String,

    /// Interval between heartbeat pings.
    pub heartbeat_interval_ms: u64,

    /// Silence window after which the link is considered dead.
    /// `None` disables the forced reconnect.
    pub heartbeat_timeout_ms: Option<u64>,

    /// Longest wait for the transport to flush one frame. A stalled write
    /// is treated as a dead link.
    pub send_timeout_ms: u64,

    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/ws".to_string(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: Some(45_000),
            send_timeout_ms: 10_000,
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl SessionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        self.heartbeat_timeout_ms.map(Duration::from_millis)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms.max(1))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 30_000,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    /// Maximum queued envelopes before the oldest is dropped.
    pub capacity: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self { capacity: 500 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Scans stop on their own after this window.
    pub scan_window_ms: u64,

    /// Connection attempts before giving up.
    pub connect_attempts: u32,

    /// Pause between connection attempts.
    pub retry_delay_ms: u64,

    /// Remembered peripherals.
    pub history_limit: usize,

    /// Reconnect to the most recent peripheral on startup.
    pub auto_connect: bool,

    /// Delay before the startup reconnect, lets the adapter settle.
    pub settle_delay_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            scan_window_ms: 10_000,
            connect_attempts: 3,
            retry_delay_ms: 1_000,
            history_limit: 10,
            auto_connect: true,
            settle_delay_ms: 750,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_window(&self) -> Duration {
        Duration::from_millis(self.scan_window_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Identity of the local user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserProfile {
    pub user_id: String,
    pub user_name: String,
    /// Voice the assistant should answer with.
    pub voice: String,
}

impl Default for UserProfile {
    fn default() -> Self {
        Self {
            user_id: "local-user".to_string(),
            user_name: "User".to_string(),
            voice: "alloy".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationConfig {
    /// Start the next capture after an assistant reply.
    pub auto_listen: bool,

    pub auto_listen_delay_ms: u64,

    pub capture: CaptureSettings,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            auto_listen: true,
            auto_listen_delay_ms: 600,
            capture: CaptureSettings::default(),
        }
    }
}

impl ConversationConfig {
    pub fn auto_listen_delay(&self) -> Duration {
        Duration::from_millis(self.auto_listen_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub max_duration_ms: u64,
    /// Normalized RMS below which a frame counts as silence.
    pub silence_threshold: f32,
    /// Trailing silence after speech that ends the capture.
    pub silence_timeout_ms: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            sample_rate: 16_000,
            channels: 1,
            max_duration_ms: 30_000,
            silence_threshold: 0.02,
            silence_timeout_ms: 1_500,
        }
    }
}

fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Config {
    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        let config_dir = config_dir();
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml_str(&content)?
        } else {
            let config = Self::default();
            let content = toml::to_string_pretty(&config)?;
            std::fs::write(&config_path, content)?;
            config
        };

        config.data_dir = data_dir();
        std::fs::create_dir_all(&config.data_dir)?;

        Ok(config)
    }

    /// Parse a TOML document. Missing sections take their defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(content)?;
        config.data_dir = data_dir();
        Ok(config)
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        let config_path = config_dir().join("config.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;

        Ok(())
    }
}
