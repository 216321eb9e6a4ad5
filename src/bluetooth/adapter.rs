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

//! Adapter seam between the peripheral manager and the platform radio.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredPeripheral {
    /// Stable platform identifier (the device address on BlueZ).
    pub id: String,
    /// Advertised name, if any.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

impl DiscoveredPeripheral {
    /// Name to show the user, falling back to the identifier.
    pub fn display_name(&self) -> String {
        self.name.clone().unwrap_or_else(|| self.id.clone())
    }
}

/// Unsolicited notifications from the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The radio was switched on or off.
    PoweredChanged(bool),
    /// An established link dropped.
    PeripheralLost(String),
}

/// Platform Bluetooth adapter.
#[async_trait]
pub trait PeripheralAdapter: Send + Sync {
    async fn is_powered(&self) -> Result<bool>;

    /// Start discovery. Advertisements arrive on the returned channel until
    /// the receiver is dropped, which also stops discovery.
    async fn discover(&self) -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>>;

    /// Single connection attempt. Retrying is the caller's concern.
    async fn connect(&self, id: &str) -> Result<()>;

    async fn disconnect(&self, id: &str) -> Result<()>;

    /// Subscribe to adapter notifications. A new subscription replaces the
    /// previous one.
    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name_falls_back_to_id() {
        let named = DiscoveredPeripheral {
            id: "AA:BB:CC:DD:EE:01".to_string(),
            name: Some("Buds Pro".to_string()),
            rssi: Some(-48),
        };
        assert_eq!(named.display_name(), "Buds Pro");

        let anonymous = DiscoveredPeripheral {
            name: None,
            ..named
        };
        assert_eq!(anonymous.display_name(), "AA:BB:CC:DD:EE:01");
    }
}
