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

//! Bluetooth audio peripheral module.
//!
//! Scans for, connects to and remembers the headset the assistant talks
//! through. The platform radio sits behind [`PeripheralAdapter`]; BlueZ
//! support is behind the `bluez` feature.

mod adapter;
#[cfg(feature = "bluez")]
mod bluez;
mod history;
mod manager;

pub use adapter::{AdapterEvent, DiscoveredPeripheral, PeripheralAdapter};
#[cfg(feature = "bluez")]
pub use bluez::BluezAdapter;
pub use history::{PeripheralHistory, PeripheralRecord};
pub use manager::{PeripheralConnectionState, PeripheralEvent, PeripheralManager};
