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

//! Reconnect backoff policy.

use std::time::Duration;

use crate::config::ReconnectConfig;

/// Exponential backoff with a ceiling and an optional attempt limit.
///
/// `delay(n) = min(base * multiplier^(n-1), cap)` for the n-th consecutive
/// failure. The counter resets on every successful open.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    base: Duration,
    multiplier: f64,
    cap: Duration,
    max_attempts: Option<u32>,
    attempt: u32,
}

impl ReconnectPolicy {
    pub fn new(base: Duration, multiplier: f64, cap: Duration, max_attempts: Option<u32>) -> Self {
        Self {
            base,
            // A multiplier at or below 1 would never grow.
            multiplier: if multiplier > 1.0 { multiplier } else { 2.0 },
            cap: cap.max(base),
            max_attempts,
            attempt: 0,
        }
    }

    /// Consecutive failures since the last successful open.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let cap = self.cap.as_millis() as f64;

        if !millis.is_finite() || millis >= cap {
            self.cap
        } else {
            Duration::from_millis(millis as u64)
        }
    }

    /// Record a failure and return the delay before the next try,
    /// or `None` once the attempt limit is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt = self.attempt.saturating_add(1);
        Some(self.delay_for(self.attempt))
    }

    /// Forget prior failures.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            config.multiplier,
            Duration::from_millis(config.max_delay_ms),
            config.max_attempts,
        )
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from(&ReconnectConfig::default())
    }
}
