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

//! Scripted collaborators for exercising the core without hardware or network.
//!
//! Every double records what the core asked of it and lets a test steer the
//! outcome: refuse connections, reject sends, fail Bluetooth connects, drop
//! links, deny permissions.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::sleep;

use crate::bluetooth::{AdapterEvent, DiscoveredPeripheral, PeripheralAdapter};
use crate::error::{CoreError, Result};
use crate::media::{AudioService, CaptureConfig, Capability, PermissionService};
use crate::session::protocol::ClientMessage;
use crate::session::transport::{IncomingFrame, OutgoingFrame, Transport, TransportLink};

/// Let spawned tasks run until they block, then advance the clock by 1ms.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
    sleep(Duration::from_millis(1)).await;
}

#[derive(Default)]
struct TransportScript {
    unreachable: bool,
    reject_sends: bool,
    stall_sends: bool,
    held: Vec<oneshot::Sender<bool>>,
    connect_delay: Duration,
    connects: usize,
    sent: Vec<String>,
    close_codes: Vec<u16>,
    server: Option<mpsc::Sender<IncomingFrame>>,
}

/// In-process stand-in for the assistant service.
#[derive(Clone, Default)]
pub struct MockTransport {
    script: Arc<Mutex<TransportScript>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse (`false`) or accept new connections.
    pub fn set_reachable(&self, reachable: bool) {
        self.script.lock().unreachable = !reachable;
    }

    /// Fail (`false`) or flush every frame written on open links.
    pub fn set_accept_sends(&self, accept: bool) {
        self.script.lock().reject_sends = !accept;
    }

    /// Keep text frames without ever flushing them, like a writer stuck on
    /// a dead TCP peer. Close frames still go through.
    pub fn set_stall_sends(&self, stall: bool) {
        self.script.lock().stall_sends = stall;
    }

    /// Make each handshake take this long.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.script.lock().connect_delay = delay;
    }

    pub fn connect_count(&self) -> usize {
        self.script.lock().connects
    }

    /// Every frame flushed so far, in order.
    pub fn sent_frames(&self) -> Vec<String> {
        self.script.lock().sent.clone()
    }

    /// Flushed audio/text messages, in order.
    pub fn sent_messages(&self) -> Vec<ClientMessage> {
        self.sent_frames()
            .iter()
            .filter_map(|f| ClientMessage::from_json(f).ok())
            .filter(|m| m.message_id().is_some())
            .collect()
    }

    pub fn sent_message_ids(&self) -> Vec<String> {
        self.sent_messages()
            .iter()
            .filter_map(|m| m.message_id().map(str::to_string))
            .collect()
    }

    pub fn pings_sent(&self) -> usize {
        self.sent_frames()
            .iter()
            .filter(|f| matches!(ClientMessage::from_json(f), Ok(ClientMessage::Ping { .. })))
            .count()
    }

    pub fn pongs_sent(&self) -> usize {
        self.sent_frames()
            .iter()
            .filter(|f| matches!(ClientMessage::from_json(f), Ok(ClientMessage::Pong)))
            .count()
    }

    /// Close codes the client sent on its own initiative.
    pub fn close_codes(&self) -> Vec<u16> {
        self.script.lock().close_codes.clone()
    }

    pub fn is_linked(&self) -> bool {
        self.script.lock().server.is_some()
    }

    /// Deliver a frame to the client on the current link.
    pub async fn push(&self, json: impl Into<String>) -> bool {
        let server = self.script.lock().server.clone();
        match server {
            Some(tx) => tx.send(IncomingFrame::Text(json.into())).await.is_ok(),
            None => false,
        }
    }

    /// Drop the current link from the service side.
    pub async fn drop_link(&self, code: u16, reason: &str) {
        let server = self.script.lock().server.take();
        if let Some(tx) = server {
            let _ = tx
                .send(IncomingFrame::Closed {
                    code,
                    reason: reason.to_string(),
                })
                .await;
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, _url: &str) -> Result<TransportLink> {
        let delay = {
            let mut script = self.script.lock();
            script.connects += 1;
            script.connect_delay
        };
        if !delay.is_zero() {
            sleep(delay).await;
        }
        if self.script.lock().unreachable {
            return Err(CoreError::transport("connection refused"));
        }

        let (out_tx, mut out_rx) = mpsc::channel::<OutgoingFrame>(64);
        let (in_tx, in_rx) = mpsc::channel::<IncomingFrame>(64);
        self.script.lock().server = Some(in_tx);

        let script = self.script.clone();
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutgoingFrame::Text { text, done } => {
                        let accepted = {
                            let mut script = script.lock();
                            if script.stall_sends {
                                script.held.push(done);
                                continue;
                            }
                            if !script.reject_sends {
                                script.sent.push(text);
                            }
                            !script.reject_sends
                        };
                        let _ = done.send(accepted);
                    }
                    OutgoingFrame::Close { code, .. } => {
                        let mut script = script.lock();
                        script.close_codes.push(code);
                        script.held.clear();
                        script.server = None;
                        break;
                    }
                }
            }
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}

#[derive(Default)]
struct AdapterScript {
    powered: bool,
    advertisements: Vec<DiscoveredPeripheral>,
    failures: HashMap<String, u32>,
    unreachable: HashSet<String>,
    connect_calls: Vec<String>,
    disconnect_calls: Vec<String>,
    discover_calls: usize,
    scan_tx: Option<mpsc::UnboundedSender<DiscoveredPeripheral>>,
    events_tx: Option<mpsc::UnboundedSender<AdapterEvent>>,
}

/// Scripted Bluetooth adapter.
#[derive(Clone)]
pub struct MockAdapter {
    script: Arc<Mutex<AdapterScript>>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    /// A powered adapter with nothing in range.
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(AdapterScript {
                powered: true,
                ..Default::default()
            })),
        }
    }

    /// Flip adapter power and notify subscribers.
    pub fn set_powered(&self, powered: bool) {
        let mut script = self.script.lock();
        script.powered = powered;
        if let Some(tx) = &script.events_tx {
            let _ = tx.send(AdapterEvent::PoweredChanged(powered));
        }
    }

    /// Peripheral reported by every subsequent scan.
    pub fn add_advertisement(&self, id: &str, name: Option<&str>, rssi: Option<i16>) {
        self.script.lock().advertisements.push(DiscoveredPeripheral {
            id: id.to_string(),
            name: name.map(str::to_string),
            rssi,
        });
    }

    /// Report an advertisement on the scan in progress.
    pub fn advertise(&self, id: &str, name: Option<&str>, rssi: Option<i16>) -> bool {
        let script = self.script.lock();
        match &script.scan_tx {
            Some(tx) => tx
                .send(DiscoveredPeripheral {
                    id: id.to_string(),
                    name: name.map(str::to_string),
                    rssi,
                })
                .is_ok(),
            None => false,
        }
    }

    /// The next `count` connects to `id` fail.
    pub fn fail_connects(&self, id: &str, count: u32) {
        self.script.lock().failures.insert(id.to_string(), count);
    }

    /// Every connect to `id` fails.
    pub fn make_unreachable(&self, id: &str) {
        self.script.lock().unreachable.insert(id.to_string());
    }

    /// Report that the link to `id` dropped.
    pub fn lose_link(&self, id: &str) {
        let script = self.script.lock();
        if let Some(tx) = &script.events_tx {
            let _ = tx.send(AdapterEvent::PeripheralLost(id.to_string()));
        }
    }

    pub fn connect_calls(&self) -> Vec<String> {
        self.script.lock().connect_calls.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<String> {
        self.script.lock().disconnect_calls.clone()
    }

    pub fn discover_calls(&self) -> usize {
        self.script.lock().discover_calls
    }

    /// Whether the core still holds the current scan open.
    pub fn scan_active(&self) -> bool {
        self.script
            .lock()
            .scan_tx
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }
}

#[async_trait]
impl PeripheralAdapter for MockAdapter {
    async fn is_powered(&self) -> Result<bool> {
        Ok(self.script.lock().powered)
    }

    async fn discover(&self) -> Result<mpsc::UnboundedReceiver<DiscoveredPeripheral>> {
        let mut script = self.script.lock();
        if !script.powered {
            return Err(CoreError::peripheral("adapter is off"));
        }
        script.discover_calls += 1;

        let (tx, rx) = mpsc::unbounded_channel();
        for advertisement in &script.advertisements {
            let _ = tx.send(advertisement.clone());
        }
        script.scan_tx = Some(tx);
        Ok(rx)
    }

    async fn connect(&self, id: &str) -> Result<()> {
        let mut script = self.script.lock();
        script.connect_calls.push(id.to_string());

        if !script.powered || script.unreachable.contains(id) {
            return Err(CoreError::peripheral(format!("{} unreachable", id)));
        }
        if let Some(remaining) = script.failures.get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(CoreError::peripheral(format!("{} refused", id)));
            }
        }
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<()> {
        self.script.lock().disconnect_calls.push(id.to_string());
        Ok(())
    }

    async fn events(&self) -> Result<mpsc::UnboundedReceiver<AdapterEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.script.lock().events_tx = Some(tx);
        Ok(rx)
    }
}

struct AudioScript {
    clip: Vec<u8>,
    capture_time: Duration,
    frames: Vec<Vec<i16>>,
    playback_time: Duration,
    fail_capture: bool,
    captures: usize,
    played: Vec<Vec<u8>>,
}

const FRAME: Duration = Duration::from_millis(100);

/// Audio service returning a fixed clip.
pub struct MockAudio {
    script: Mutex<AudioScript>,
    stop: Notify,
}

impl Default for MockAudio {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAudio {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(AudioScript {
                clip: vec![0x52, 0x49, 0x46, 0x46],
                capture_time: Duration::from_secs(2),
                frames: Vec::new(),
                playback_time: Duration::from_secs(1),
                fail_capture: false,
                captures: 0,
                played: Vec::new(),
            }),
            stop: Notify::new(),
        }
    }

    pub fn set_clip(&self, clip: Vec<u8>) {
        self.script.lock().clip = clip;
    }

    pub fn set_capture_time(&self, time: Duration) {
        self.script.lock().capture_time = time;
    }

    /// Microphone input, one 100ms frame each. While set, captures run
    /// through the silence gate instead of a fixed capture time.
    pub fn set_capture_frames(&self, frames: Vec<Vec<i16>>) {
        self.script.lock().frames = frames;
    }

    pub fn set_playback_time(&self, time: Duration) {
        self.script.lock().playback_time = time;
    }

    pub fn set_fail_capture(&self, fail: bool) {
        self.script.lock().fail_capture = fail;
    }

    /// Captures started so far.
    pub fn captures(&self) -> usize {
        self.script.lock().captures
    }

    pub fn played(&self) -> Vec<Vec<u8>> {
        self.script.lock().played.clone()
    }
}

#[async_trait]
impl AudioService for MockAudio {
    async fn start_capture(&self, config: &CaptureConfig) -> Result<Vec<u8>> {
        let (capture_time, frames) = {
            let mut script = self.script.lock();
            script.captures += 1;
            (script.capture_time, script.frames.clone())
        };

        if frames.is_empty() {
            tokio::select! {
                _ = sleep(capture_time.min(config.max_duration)) => {}
                _ = self.stop.notified() => {}
            }
        } else {
            let mut gate = config.silence_gate();
            let mut elapsed = Duration::ZERO;
            for frame in &frames {
                tokio::select! {
                    _ = sleep(FRAME) => {}
                    _ = self.stop.notified() => break,
                }
                elapsed += FRAME;
                if gate.observe(frame, FRAME) || elapsed >= config.max_duration {
                    break;
                }
            }
        }

        let script = self.script.lock();
        if script.fail_capture {
            return Err(CoreError::transport("microphone unavailable"));
        }
        Ok(script.clip.clone())
    }

    fn stop_capture(&self) {
        self.stop.notify_waiters();
    }

    async fn play(&self, audio: &[u8]) -> Result<()> {
        let playback_time = {
            let mut script = self.script.lock();
            script.played.push(audio.to_vec());
            script.playback_time
        };
        sleep(playback_time).await;
        Ok(())
    }
}

/// Permission broker with a deny list.
#[derive(Default)]
pub struct MockPermissions {
    denied: Mutex<HashSet<Capability>>,
}

impl MockPermissions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deny(&self, capability: Capability) {
        self.denied.lock().insert(capability);
    }

    pub fn allow(&self, capability: Capability) {
        self.denied.lock().remove(&capability);
    }
}

#[async_trait]
impl PermissionService for MockPermissions {
    async fn ensure_granted(&self, capability: Capability) -> bool {
        !self.denied.lock().contains(&capability)
    }
}
