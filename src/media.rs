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

//! Audio and permission collaborators.
//!
//! The core never touches audio hardware or platform permission dialogs
//! directly; hosts plug in implementations of these traits.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::config::CaptureSettings;
use crate::error::Result;

/// Capabilities that must be granted before the core may use them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Bluetooth,
    Microphone,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Bluetooth => "bluetooth",
            Capability::Microphone => "microphone",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform permission broker.
#[async_trait]
pub trait PermissionService: Send + Sync {
    /// Request the capability if needed. Returns whether it is granted.
    async fn ensure_granted(&self, capability: Capability) -> bool;
}

/// Permission broker for hosts without runtime permissions.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPermissions;

#[async_trait]
impl PermissionService for AllowAllPermissions {
    async fn ensure_granted(&self, _capability: Capability) -> bool {
        true
    }
}

/// Parameters for a single capture.
#[derive(Clone)]
pub struct CaptureConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub max_duration: Duration,
    /// Decides which frames are silence.
    pub silence: Arc<dyn SilenceDetector>,
    /// Trailing silence after speech that ends the capture.
    pub silence_timeout: Duration,
}

impl fmt::Debug for CaptureConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaptureConfig")
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("max_duration", &self.max_duration)
            .field("silence_timeout", &self.silence_timeout)
            .finish_non_exhaustive()
    }
}

impl From<&CaptureSettings> for CaptureConfig {
    fn from(settings: &CaptureSettings) -> Self {
        Self {
            sample_rate: settings.sample_rate,
            channels: settings.channels,
            max_duration: Duration::from_millis(settings.max_duration_ms),
            silence: Arc::new(RmsSilenceDetector::new(settings.silence_threshold)),
            silence_timeout: Duration::from_millis(settings.silence_timeout_ms),
        }
    }
}

impl CaptureConfig {
    /// Swap in a different silence detector.
    pub fn with_detector(mut self, detector: Arc<dyn SilenceDetector>) -> Self {
        self.silence = detector;
        self
    }

    /// Fresh end-of-speech tracker for one capture.
    pub fn silence_gate(&self) -> SilenceGate {
        SilenceGate {
            detector: self.silence.clone(),
            timeout: self.silence_timeout,
            heard_speech: false,
            silent_for: Duration::ZERO,
        }
    }
}

/// Audio capture and playback service.
#[async_trait]
pub trait AudioService: Send + Sync {
    /// Record until `config.silence_gate()` reports the end of speech,
    /// `stop_capture` is called, or `max_duration` passes.
    /// Resolves with the encoded clip.
    async fn start_capture(&self, config: &CaptureConfig) -> Result<Vec<u8>>;

    /// Finish the capture in progress early. No-op when idle.
    fn stop_capture(&self);

    /// Play a clip. Resolves when playback completes.
    async fn play(&self, audio: &[u8]) -> Result<()>;
}

/// Decides whether a PCM frame counts as silence.
pub trait SilenceDetector: Send + Sync {
    fn is_silent(&self, frame: &[i16]) -> bool;
}

/// Ends a capture once speech was heard and then trailing silence lasted
/// the configured timeout. Silence before any speech never ends it.
pub struct SilenceGate {
    detector: Arc<dyn SilenceDetector>,
    timeout: Duration,
    heard_speech: bool,
    silent_for: Duration,
}

impl SilenceGate {
    /// Feed one frame of `duration`. Returns `true` once the capture should end.
    pub fn observe(&mut self, frame: &[i16], duration: Duration) -> bool {
        if !self.detector.is_silent(frame) {
            self.heard_speech = true;
            self.silent_for = Duration::ZERO;
            return false;
        }
        if !self.heard_speech {
            return false;
        }
        self.silent_for += duration;
        self.silent_for >= self.timeout
    }
}

/// Silence detector comparing frame RMS against a fixed threshold.
#[derive(Debug, Clone, Copy)]
pub struct RmsSilenceDetector {
    /// Normalized RMS (0.0..=1.0) below which a frame is silent.
    threshold: f32,
}

impl Default for RmsSilenceDetector {
    fn default() -> Self {
        Self { threshold: 0.02 }
    }
}

impl RmsSilenceDetector {
    pub fn new(threshold: f32) -> Self {
        Self {
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    /// Normalized RMS of an i16 frame.
    pub fn rms(frame: &[i16]) -> f32 {
        if frame.is_empty() {
            return 0.0;
        }

        let sum: f32 = frame
            .iter()
            .map(|&s| {
                let normalized = s as f32 / i16::MAX as f32;
                normalized * normalized
            })
            .sum();

        (sum / frame.len() as f32).sqrt()
    }
}

impl SilenceDetector for RmsSilenceDetector {
    fn is_silent(&self, frame: &[i16]) -> bool {
        Self::rms(frame) < self.threshold
    }
}
