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

//! BlueZ implementation of the peripheral adapter.

use async_trait::async_trait;
use bluer::{Adapter, AdapterProperty, Address, DeviceEvent, DeviceProperty, Session};
use futures::{pin_mut, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::adapter::{AdapterEvent, DiscoveredPeripheral, PeripheralAdapter};
use crate::error::{CoreError, Result};

fn bluez_error(e: bluer::Error) -> CoreError {
    CoreError::peripheral(e.to_string())
}

/// Peripheral adapter backed by the default BlueZ adapter.
pub struct BluezAdapter {
    adapter: Adapter,
    _session: Session,
    events_tx: Mutex<Option<mpsc::UnboundedSender<AdapterEvent>>>,
}

impl BluezAdapter {
    /// Open a BlueZ session on the default adapter.
    pub async fn new() -> anyhow::Result<Self> {
        info!("Initializing BlueZ adapter...");

        let session = Session::new().await?;
        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        Ok(Self {
            adapter,
            _session: session,
            events_tx: Mutex::new(None),
        })
    }

    fn address(id: &str) -> Result<Address> {
        id.parse::<Address>()
            .map_err(|e| CoreError::peripheral(format!("invalid address {}: {}", id, e)))
    }

    /// Report the link to `device` once it drops.
    fn watch_link(&self, id: String, device: bluer::Device) {
        let Some(tx) = self.events_tx.lock().clone() else {
            return;
        };

        tokio::spawn(async move {
            let events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot watch {}: {}", id, e);
                    return;
                }
            };
            pin_mut!(events);

            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    debug!("Link to {} dropped", id);
                    let _ = tx.send(AdapterEvent::PeripheralLost(id));
                    return;
                }
            }
        });
    }
}

/// Forward sightings until the stream ends or the receiver is dropped.
///
/// Returning drops the stream, which ends BlueZ discovery.
async fn forward_sightings<S>(sightings: S, tx: mpsc::UnboundedSender<DiscoveredPeripheral>)
where
    S: Stream<Item = DiscoveredPeripheral>,
{
    pin_mut!(sightings);
    loop {
        let peripheral = tokio::select! {
            next = sightings.next() => match next {
                Some(peripheral) => peripheral,
                None => break,
            },
            _ = tx.closed() => break,
        };
        if tx.send(peripheral).is_err() {
            break;
        }
    }
}

#[async_trait]
impl PeripheralAdapter for BluezAdapter {
    async fn is_powered(&self) -> Result<bool> {
        self.adapter.is_powered().await.map_err(bluez_error)
    }

    async fn discover(&self) -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>> {
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();

        tokio::spawn(async move {
            let stream = match adapter.discover_devices().await {
                Ok(stream) => {
                    let _ = ready_tx.send(Ok(()));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(bluez_error(e)));
                    return;
                }
            };

            let lookup = adapter.clone();
            let sightings = stream.filter_map(move |event| {
                let adapter = lookup.clone();
                async move {
                    let bluer::AdapterEvent::DeviceAdded(addr) = event else {
                        return None;
                    };
                    let device = match adapter.device(addr) {
                        Ok(device) => device,
                        Err(e) => {
                            debug!("Skipping {}: {}", addr, e);
                            return None;
                        }
                    };
                    Some(DiscoveredPeripheral {
                        id: addr.to_string(),
                        name: device.name().await.ok().flatten(),
                        rssi: device.rssi().await.ok().flatten(),
                    })
                }
            });
            forward_sightings(sightings, tx).await;
            debug!("Discovery stopped");
        });

        ready_rx
            .await
            .map_err(|_| CoreError::peripheral("discovery task ended"))??;
        Ok(rx)
    }

    async fn connect(&self, id: &str) -> Result<()> {
        let device = self
            .adapter
            .device(Self::address(id)?)
            .map_err(bluez_error)?;
        device.connect().await.map_err(bluez_error)?;
        info!("Connected to {}", id);

        self.watch_link(id.to_string(), device);
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        let device = self
            .adapter
            .device(Self::address(id)?)
            .map_err(bluez_error)?;
        device.disconnect().await.map_err(bluez_error)
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>> {
        let adapter = self.adapter.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        *self.events_tx.lock() = Some(tx.clone());

        tokio::spawn(async move {
            let events = match adapter.events().await {
                Ok(events) => {
                    let _ = ready_tx.send(Ok(()));
                    events
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(bluez_error(e)));
                    return;
                }
            };
            pin_mut!(events);

            while let Some(event) = events.next().await {
                if let bluer::AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
                    if tx.send(AdapterEvent::PoweredChanged(powered)).is_err() {
                        break;
                    }
                }
            }
        });

        ready_rx
            .await
            .map_err(|_| CoreError::peripheral("adapter event task ended"))??;
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::time::Duration;

    fn sighting(id: &str) -> DiscoveredPeripheral {
        DiscoveredPeripheral {
            id: id.to_string(),
            name: None,
            rssi: Some(-50),
        }
    }

    #[tokio::test]
    async fn test_forwarding_stops_when_scan_abandoned() {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(forward_sightings(stream::pending(), tx));

        drop(rx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("discovery kept running without a receiver")
            .unwrap();
    }

    #[tokio::test]
    async fn test_forwarding_delivers_until_stream_ends() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_sightings(stream::iter(vec![sighting("AA"), sighting("BB")]), tx).await;

        assert_eq!(rx.recv().await.map(|p| p.id).as_deref(), Some("AA"));
        assert_eq!(rx.recv().await.map(|p| p.id).as_deref(), Some("BB"));
        assert!(rx.recv().await.is_none());
    }
}
