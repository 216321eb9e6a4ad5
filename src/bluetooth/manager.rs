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

//! Peripheral manager: scanning, bounded-retry connects and the recency list.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::adapter::{AdapterEvent, DiscoveredPeripheral, PeripheralAdapter};
use super::history::{PeripheralHistory, PeripheralRecord};
use crate::config::BluetoothConfig;
use crate::error::{CoreError, Result};
use crate::media::{Capability, PermissionService};
use crate::storage::Store;

/// Connection state of the audio peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralConnectionState {
    /// The adapter is off or missing.
    Disabled,
    Disconnected,
    Scanning,
    Connecting,
    Connected,
    /// The last connect gave up.
    Error,
}

impl PeripheralConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "Bluetooth off",
            Self::Disconnected => "Disconnected",
            Self::Scanning => "Scanning...",
            Self::Connecting => "Connecting...",
            Self::Connected => "Connected",
            Self::Error => "Connection failed",
        }
    }
}

/// Events emitted by the peripheral manager.
#[derive(Debug, Clone, PartialEq)]
pub enum PeripheralEvent {
    StateChanged(PeripheralConnectionState),
    /// First sighting of a peripheral during the current scan.
    Discovered(DiscoveredPeripheral),
    /// The adapter was switched on or off.
    AvailabilityChanged(bool),
    ScanFinished { found: usize },
    /// All attempts to connect failed.
    ConnectFailed { id: String, attempts: u32, reason: String },
    Error(String),
}

struct PeripheralState {
    status: PeripheralConnectionState,
    powered: bool,
    connected: Option<String>,
    discovered: Vec<DiscoveredPeripheral>,
    history: PeripheralHistory,
    /// Bumped by every connect and disconnect; stale attempts compare it.
    generation: u64,
    scan: Option<JoinHandle<()>>,
    scan_deadline: Option<JoinHandle<()>>,
    auto_connect: Option<JoinHandle<()>>,
    adapter_events: Option<JoinHandle<()>>,
}

struct Shared {
    adapter: Arc<dyn PeripheralAdapter>,
    permissions: Arc<dyn PermissionService>,
    store: Arc<dyn Store>,
    config: BluetoothConfig,
    event_tx: mpsc::UnboundedSender<PeripheralEvent>,
    state: Mutex<PeripheralState>,
}

/// Owner of the Bluetooth audio peripheral.
#[derive(Clone)]
pub struct PeripheralManager {
    shared: Arc<Shared>,
}

fn cancel(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

impl PeripheralManager {
    /// Create the manager and load the recency list. Nothing touches the
    /// adapter until `initialize`.
    pub fn new(
        adapter: Arc<dyn PeripheralAdapter>,
        permissions: Arc<dyn PermissionService>,
        store: Arc<dyn Store>,
        config: &BluetoothConfig,
        event_tx: mpsc::UnboundedSender<PeripheralEvent>,
    ) -> Self {
        let history = PeripheralHistory::load(store.as_ref(), config.history_limit);
        debug!("Loaded {} remembered peripherals", history.len());

        Self {
            shared: Arc::new(Shared {
                adapter,
                permissions,
                store,
                config: config.clone(),
                event_tx,
                state: Mutex::new(PeripheralState {
                    status: PeripheralConnectionState::Disconnected,
                    powered: false,
                    connected: None,
                    discovered: Vec::new(),
                    history,
                    generation: 0,
                    scan: None,
                    scan_deadline: None,
                    auto_connect: None,
                    adapter_events: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> PeripheralConnectionState {
        self.shared.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeripheralConnectionState::Connected
    }

    /// Id of the connected peripheral.
    pub fn connected(&self) -> Option<String> {
        self.shared.state.lock().connected.clone()
    }

    /// Peripherals seen by the current or last scan, in discovery order.
    pub fn discovered(&self) -> Vec<DiscoveredPeripheral> {
        self.shared.state.lock().discovered.clone()
    }

    /// Remembered peripherals, most recent first.
    pub fn history(&self) -> Vec<PeripheralRecord> {
        self.shared.state.lock().history.records().to_vec()
    }

    /// Check permission and power, follow adapter notifications, and
    /// schedule a reconnect to the most recent peripheral.
    pub async fn initialize(&self) -> Result<()> {
        if !self
            .shared
            .permissions
            .ensure_granted(Capability::Bluetooth)
            .await
        {
            warn!("Bluetooth permission denied");
            let mut st = self.shared.state.lock();
            self.set_status(&mut st, PeripheralConnectionState::Error);
            self.emit(PeripheralEvent::Error("Bluetooth permission denied".to_string()));
            return Err(CoreError::PermissionDenied(Capability::Bluetooth));
        }

        match self.shared.adapter.events().await {
            Ok(events) => {
                let handle = self.spawn_adapter_events(events);
                let mut st = self.shared.state.lock();
                cancel(&mut st.adapter_events);
                st.adapter_events = Some(handle);
            }
            Err(e) => {
                warn!("Adapter notifications unavailable: {}", e);
                self.emit(PeripheralEvent::Error(e.to_string()));
            }
        }

        let powered = self.refresh_power().await;
        info!(
            "Bluetooth adapter is {}",
            if powered { "on" } else { "off" }
        );

        let mut st = self.shared.state.lock();
        self.emit(PeripheralEvent::AvailabilityChanged(powered));
        if powered {
            if st.status == PeripheralConnectionState::Disabled {
                self.set_status(&mut st, PeripheralConnectionState::Disconnected);
            }
            self.schedule_auto_connect(&mut st);
        } else {
            self.set_status(&mut st, PeripheralConnectionState::Disabled);
        }
        Ok(())
    }

    /// Start a scan. It stops by itself after the scan window.
    ///
    /// Refused while a peripheral is connected; disconnect first to look
    /// for another one.
    pub async fn start_scan(&self) -> Result<()> {
        if !self
            .shared
            .permissions
            .ensure_granted(Capability::Bluetooth)
            .await
        {
            self.emit(PeripheralEvent::Error("Bluetooth permission denied".to_string()));
            return Err(CoreError::PermissionDenied(Capability::Bluetooth));
        }

        if !self.refresh_power().await {
            let mut st = self.shared.state.lock();
            self.set_status(&mut st, PeripheralConnectionState::Disabled);
            return Err(CoreError::peripheral("Bluetooth is off"));
        }

        {
            let mut st = self.shared.state.lock();
            match st.status {
                PeripheralConnectionState::Scanning => {
                    debug!("Scan already running");
                    return Ok(());
                }
                PeripheralConnectionState::Connecting => {
                    return Err(CoreError::peripheral("connect in progress"));
                }
                PeripheralConnectionState::Connected => {
                    return Err(CoreError::peripheral("peripheral already connected"));
                }
                _ => {}
            }
            st.discovered.clear();
            self.set_status(&mut st, PeripheralConnectionState::Scanning);
        }

        let advertisements = match self.shared.adapter.discover().await {
            Ok(rx) => rx,
            Err(e) => {
                error!("Failed to start scan: {}", e);
                let mut st = self.shared.state.lock();
                if st.status == PeripheralConnectionState::Scanning {
                    let settled = Self::idle_status(&st);
                    self.set_status(&mut st, settled);
                }
                self.emit(PeripheralEvent::Error(e.to_string()));
                return Err(e);
            }
        };

        let mut st = self.shared.state.lock();
        if st.status != PeripheralConnectionState::Scanning {
            debug!("Scan stopped before discovery started");
            return Ok(());
        }

        info!("Scanning for {:?}", self.shared.config.scan_window());
        cancel(&mut st.scan);
        st.scan = Some(self.spawn_scan(advertisements));

        let this = self.clone();
        let window = self.shared.config.scan_window();
        cancel(&mut st.scan_deadline);
        st.scan_deadline = Some(tokio::spawn(async move {
            sleep(window).await;
            this.stop_scan();
        }));
        Ok(())
    }

    /// Stop the scan in progress. Safe at any time.
    pub fn stop_scan(&self) {
        let mut st = self.shared.state.lock();
        self.end_scan(&mut st);
    }

    /// Connect to `id`, retrying up to the configured attempt count.
    ///
    /// Any other connected peripheral is released first. Returns whether
    /// the link is up.
    pub async fn connect(&self, id: &str) -> bool {
        if !self
            .shared
            .permissions
            .ensure_granted(Capability::Bluetooth)
            .await
        {
            self.emit(PeripheralEvent::Error("Bluetooth permission denied".to_string()));
            return false;
        }

        if !self.refresh_power().await {
            let mut st = self.shared.state.lock();
            self.set_status(&mut st, PeripheralConnectionState::Disabled);
            return false;
        }

        let (generation, previous) = {
            let mut st = self.shared.state.lock();
            if st.connected.as_deref() == Some(id) {
                return true;
            }
            if st.status == PeripheralConnectionState::Connecting {
                warn!("Connect to {} ignored, another connect is running", id);
                return false;
            }

            self.end_scan(&mut st);
            cancel(&mut st.auto_connect);
            st.generation += 1;
            let previous = st.connected.take();
            self.set_status(&mut st, PeripheralConnectionState::Connecting);
            (st.generation, previous)
        };

        if let Some(previous) = previous {
            info!("Releasing {} before connecting to {}", previous, id);
            if let Err(e) = self.shared.adapter.disconnect(&previous).await {
                warn!("Failed to disconnect {}: {}", previous, e);
            }
        }

        let attempts = self.shared.config.connect_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.shared.adapter.connect(id).await {
                Ok(()) => return self.on_connected(generation, id).await,
                Err(e) => {
                    warn!(
                        "Connect to {} failed (attempt {}/{}): {}",
                        id, attempt, attempts, e
                    );
                    last_error = e.to_string();
                }
            }

            if attempt < attempts {
                sleep(self.shared.config.retry_delay()).await;
            }
            if self.shared.state.lock().generation != generation {
                debug!("Connect to {} superseded", id);
                return false;
            }
        }

        let mut st = self.shared.state.lock();
        if st.generation == generation {
            error!("Giving up on {} after {} attempts", id, attempts);
            self.set_status(&mut st, PeripheralConnectionState::Error);
            self.emit(PeripheralEvent::ConnectFailed {
                id: id.to_string(),
                attempts,
                reason: last_error,
            });
        }
        false
    }

    /// Drop the current link. Also cancels a connect in progress.
    pub async fn disconnect(&self) {
        let target = {
            let mut st = self.shared.state.lock();
            cancel(&mut st.auto_connect);
            st.generation += 1;

            if matches!(
                st.status,
                PeripheralConnectionState::Connected
                    | PeripheralConnectionState::Connecting
                    | PeripheralConnectionState::Error
            ) {
                let settled = if st.powered {
                    PeripheralConnectionState::Disconnected
                } else {
                    PeripheralConnectionState::Disabled
                };
                self.set_status(&mut st, settled);
            }
            st.connected.take()
        };

        if let Some(id) = target {
            if let Err(e) = self.shared.adapter.disconnect(&id).await {
                warn!("Failed to disconnect {}: {}", id, e);
            }
            info!("Disconnected from {}", id);
        }
    }

    /// Remove `id` from the recency list, disconnecting it first if needed.
    pub async fn forget(&self, id: &str) {
        if self.connected().as_deref() == Some(id) {
            self.disconnect().await;
        }

        let mut st = self.shared.state.lock();
        if st.history.remove(id) {
            st.history.save(self.shared.store.as_ref());
            info!("Forgot peripheral {}", id);
        }
    }

    /// Stop every background task. Safe before `initialize`.
    pub fn shutdown(&self) {
        let mut st = self.shared.state.lock();
        self.end_scan(&mut st);
        cancel(&mut st.auto_connect);
        cancel(&mut st.adapter_events);
        st.generation += 1;
    }

    fn emit(&self, event: PeripheralEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    fn set_status(&self, st: &mut PeripheralState, status: PeripheralConnectionState) {
        if st.status != status {
            debug!("Peripheral: {} -> {}", st.status.as_str(), status.as_str());
            st.status = status;
            self.emit(PeripheralEvent::StateChanged(status));
        }
    }

    fn idle_status(st: &PeripheralState) -> PeripheralConnectionState {
        if !st.powered {
            PeripheralConnectionState::Disabled
        } else if st.connected.is_some() {
            PeripheralConnectionState::Connected
        } else {
            PeripheralConnectionState::Disconnected
        }
    }

    async fn refresh_power(&self) -> bool {
        let powered = match self.shared.adapter.is_powered().await {
            Ok(powered) => powered,
            Err(e) => {
                warn!("Cannot read adapter power: {}", e);
                false
            }
        };
        self.shared.state.lock().powered = powered;
        powered
    }

    fn end_scan(&self, st: &mut PeripheralState) {
        cancel(&mut st.scan);
        cancel(&mut st.scan_deadline);

        if st.status == PeripheralConnectionState::Scanning {
            let settled = Self::idle_status(st);
            self.set_status(st, settled);
            info!("Scan finished, {} peripherals found", st.discovered.len());
            self.emit(PeripheralEvent::ScanFinished {
                found: st.discovered.len(),
            });
        }
    }

    fn on_discovered(&self, peripheral: DiscoveredPeripheral) {
        let mut st = self.shared.state.lock();
        if st.status != PeripheralConnectionState::Scanning {
            return;
        }

        if let Some(known) = st.discovered.iter_mut().find(|p| p.id == peripheral.id) {
            known.rssi = peripheral.rssi;
            if known.name.is_none() {
                known.name = peripheral.name;
            }
            return;
        }

        debug!("Discovered {} ({})", peripheral.display_name(), peripheral.id);
        st.discovered.push(peripheral.clone());
        self.emit(PeripheralEvent::Discovered(peripheral));
    }

    async fn on_connected(&self, generation: u64, id: &str) -> bool {
        {
            let mut st = self.shared.state.lock();
            if st.generation == generation {
                let name = st
                    .discovered
                    .iter()
                    .find(|p| p.id == id)
                    .map(|p| p.display_name())
                    .or_else(|| st.history.get(id).map(|r| r.display_name.clone()))
                    .unwrap_or_else(|| id.to_string());

                st.connected = Some(id.to_string());
                st.history.record_connection(id, &name, Utc::now());
                st.history.save(self.shared.store.as_ref());
                self.set_status(&mut st, PeripheralConnectionState::Connected);
                info!("Connected to {} ({})", name, id);
                return true;
            }
        }

        debug!("Connect to {} was cancelled, releasing link", id);
        if let Err(e) = self.shared.adapter.disconnect(id).await {
            warn!("Failed to release {}: {}", id, e);
        }
        false
    }

    fn on_availability(&self, powered: bool) {
        let mut st = self.shared.state.lock();
        if st.powered == powered {
            return;
        }
        st.powered = powered;
        info!("Bluetooth turned {}", if powered { "on" } else { "off" });
        self.emit(PeripheralEvent::AvailabilityChanged(powered));

        if powered {
            if st.status == PeripheralConnectionState::Disabled {
                self.set_status(&mut st, PeripheralConnectionState::Disconnected);
            }
            self.schedule_auto_connect(&mut st);
        } else {
            self.end_scan(&mut st);
            cancel(&mut st.auto_connect);
            st.generation += 1;
            st.connected = None;
            self.set_status(&mut st, PeripheralConnectionState::Disabled);
        }
    }

    fn on_link_lost(&self, id: &str) {
        let mut st = self.shared.state.lock();
        if st.connected.as_deref() != Some(id) {
            return;
        }

        warn!("Lost connection to {}", id);
        st.connected = None;
        if st.status == PeripheralConnectionState::Connected {
            let settled = Self::idle_status(&st);
            self.set_status(&mut st, settled);
        }
    }

    fn schedule_auto_connect(&self, st: &mut PeripheralState) {
        if !self.shared.config.auto_connect || !st.powered || st.connected.is_some() {
            return;
        }
        let Some(target) = st.history.most_recent().map(|r| r.id.clone()) else {
            return;
        };

        let delay = self.shared.config.settle_delay();
        debug!("Reconnecting to {} in {:?}", target, delay);

        let this = self.clone();
        cancel(&mut st.auto_connect);
        st.auto_connect = Some(tokio::spawn(async move {
            sleep(delay).await;
            {
                let mut st = this.shared.state.lock();
                // Detach our own handle so connect() does not abort us
                st.auto_connect.take();
                if st.connected.is_some()
                    || !matches!(
                        st.status,
                        PeripheralConnectionState::Disconnected | PeripheralConnectionState::Error
                    )
                {
                    return;
                }
            }
            info!("Auto-connecting to {}", target);
            this.connect(&target).await;
        }));
    }

    fn spawn_scan(&self, mut advertisements: mpsc::UnboundedReceiver<DiscoveredPeripheral>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(peripheral) = advertisements.recv().await {
                this.on_discovered(peripheral);
            }
        })
    }

    fn spawn_adapter_events(&self, mut events: mpsc::UnboundedReceiver<AdapterEvent>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    AdapterEvent::PoweredChanged(powered) => this.on_availability(powered),
                    AdapterEvent::PeripheralLost(id) => this.on_link_lost(&id),
                }
            }
        })
    }
}
