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

//! Orchestrator: wires the session, outbox and peripheral managers to the
//! read model and exposes the user actions.
//!
//! Manager events are consumed by a single loop, so the read model changes
//! in the order the managers report.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::bluetooth::{
    PeripheralAdapter, PeripheralConnectionState, PeripheralEvent, PeripheralManager,
};
use crate::config::{Config, ConversationConfig, UserProfile};
use crate::envelope::OutboundEnvelope;
use crate::error::{CoreError, Result};
use crate::media::{AudioService, Capability, CaptureConfig, PermissionService};
use crate::outbox::{EnqueueOutcome, OutboxCoordinator};
use crate::session::{ConnectionState, ServerMessage, SessionEvent, SessionManager, Transport};
use crate::state::{AppState, ConversationEntry, Snapshot};
use crate::storage::Store;

/// Platform services the core runs on.
pub struct Collaborators {
    pub transport: Arc<dyn Transport>,
    pub adapter: Arc<dyn PeripheralAdapter>,
    pub audio: Arc<dyn AudioService>,
    pub permissions: Arc<dyn PermissionService>,
    pub store: Arc<dyn Store>,
}

/// Whether a capture may start on its own after an assistant reply.
pub fn auto_listen_allowed(
    session: ConnectionState,
    peripheral: PeripheralConnectionState,
    busy: bool,
) -> bool {
    session == ConnectionState::Open && peripheral == PeripheralConnectionState::Connected && !busy
}

#[derive(Default)]
struct Tasks {
    event_loop: Option<JoinHandle<()>>,
    auto_listen: Option<JoinHandle<()>>,
    capture: Option<JoinHandle<()>>,
    playback: Option<JoinHandle<()>>,
}

#[derive(Default)]
struct Flags {
    /// The session dropped while open and has not come back yet.
    session_lost: bool,
    shutting_down: bool,
}

fn cancel(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

/// Application core.
pub struct Orchestrator {
    session: SessionManager,
    outbox: OutboxCoordinator,
    peripherals: PeripheralManager,
    audio: Arc<dyn AudioService>,
    permissions: Arc<dyn PermissionService>,
    state: Arc<AppState>,
    profile: UserProfile,
    url: String,
    conversation: ConversationConfig,
    capture: CaptureConfig,
    tasks: Mutex<Tasks>,
    flags: Mutex<Flags>,
    stop: Notify,
}

impl Orchestrator {
    /// Build the managers, start the event loop, bring up Bluetooth and
    /// open the session.
    pub async fn start(config: &Config, collaborators: Collaborators) -> Arc<Self> {
        let Collaborators {
            transport,
            adapter,
            audio,
            permissions,
            store,
        } = collaborators;

        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (peripheral_tx, peripheral_rx) = mpsc::unbounded_channel();

        let session = SessionManager::new(transport, &config.session, session_tx);
        let outbox = OutboxCoordinator::new(Arc::new(session.clone()), store.clone(), &config.outbox);
        let peripherals = PeripheralManager::new(
            adapter,
            permissions.clone(),
            store,
            &config.bluetooth,
            peripheral_tx,
        );

        let this = Arc::new(Self {
            session,
            outbox,
            peripherals,
            audio,
            permissions,
            state: AppState::new(),
            profile: config.user.clone(),
            url: config.session.url.clone(),
            conversation: config.conversation.clone(),
            capture: CaptureConfig::from(&config.conversation.capture),
            tasks: Mutex::new(Tasks::default()),
            flags: Mutex::new(Flags::default()),
            stop: Notify::new(),
        });

        this.refresh_pending().await;

        let event_loop = tokio::spawn(this.clone().run(session_rx, peripheral_rx));
        this.tasks.lock().event_loop = Some(event_loop);

        if let Err(e) = this.peripherals.initialize().await {
            warn!("Bluetooth unavailable: {}", e);
            this.notice(format!("Bluetooth unavailable: {}", e));
        }

        this.session.open(&this.url).await;
        info!("AirAssist core v{} started", env!("CARGO_PKG_VERSION"));
        this
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    pub fn peripherals(&self) -> &PeripheralManager {
        &self.peripherals
    }

    pub fn snapshot(&self) -> Snapshot {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.state.subscribe()
    }

    /// Send a typed message. Blank input is ignored.
    pub async fn send_text(&self, text: &str) -> Option<EnqueueOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        Some(self.submit(OutboundEnvelope::text(&self.profile, text)).await)
    }

    /// Send a recorded clip. Empty clips are ignored.
    pub async fn send_audio(
        &self,
        clip: Vec<u8>,
        transcription_hint: Option<String>,
    ) -> Option<EnqueueOutcome> {
        if clip.is_empty() {
            return None;
        }
        Some(
            self.submit(OutboundEnvelope::audio(&self.profile, clip, transcription_hint))
                .await,
        )
    }

    pub fn clear_conversation(&self) {
        self.state.clear_conversation();
    }

    /// Start a capture now. The clip is sent when the capture ends.
    ///
    /// Returns `Ok(false)` while a capture or playback is running.
    pub async fn start_listening(self: &Arc<Self>) -> Result<bool> {
        if !self.permissions.ensure_granted(Capability::Microphone).await {
            self.notice("Microphone permission denied");
            return Err(CoreError::PermissionDenied(Capability::Microphone));
        }
        Ok(self.begin_capture(false))
    }

    /// End the capture in progress early and drop a pending auto-listen.
    pub fn stop_listening(&self) {
        cancel(&mut self.tasks.lock().auto_listen);
        if self.state.is_capturing() {
            self.audio.stop_capture();
        }
    }

    /// Host returned to the foreground; revive a dropped session.
    pub async fn on_foreground(&self) {
        self.session.check_connectivity().await;
    }

    /// Close the session and stop every task. Pending envelopes stay queued.
    pub fn shutdown(&self) {
        self.flags.lock().shutting_down = true;
        self.session.close();
        self.peripherals.shutdown();
        self.audio.stop_capture();

        {
            let mut tasks = self.tasks.lock();
            cancel(&mut tasks.auto_listen);
            cancel(&mut tasks.capture);
            cancel(&mut tasks.playback);
            tasks.event_loop.take();
        }
        self.state.set_capturing(false);
        self.state.set_speaking(false);
        self.state.set_session_state(self.session.state());
        self.stop.notify_one();
        info!("AirAssist core stopped");
    }

    async fn run(
        self: Arc<Self>,
        mut session_rx: mpsc::UnboundedReceiver<SessionEvent>,
        mut peripheral_rx: mpsc::UnboundedReceiver<PeripheralEvent>,
    ) {
        loop {
            tokio::select! {
                Some(event) = session_rx.recv() => self.handle_session_event(event).await,
                Some(event) = peripheral_rx.recv() => self.handle_peripheral_event(event),
                _ = self.stop.notified() => break,
                else => break,
            }
        }
        debug!("Event loop stopped");
    }

    async fn handle_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Connecting { attempt } => {
                debug!("Session connecting (attempt {})", attempt);
                self.state.set_session_state(ConnectionState::Connecting);
            }
            SessionEvent::Opened => {
                self.state.set_session_state(ConnectionState::Open);
                if std::mem::take(&mut self.flags.lock().session_lost) {
                    self.notice("Reconnected to assistant");
                }

                let delivered = self.outbox.on_session_opened().await;
                if delivered > 0 {
                    info!("Delivered {} queued messages", delivered);
                }
                self.refresh_pending().await;
            }
            SessionEvent::Message(raw) => self.handle_server_message(&raw),
            SessionEvent::Error(e) => debug!("Session error: {}", e),
            SessionEvent::Closed { code, reason } => {
                let was_open = self.state.session_state() == ConnectionState::Open;
                self.state.set_session_state(ConnectionState::Closed);
                cancel(&mut self.tasks.lock().auto_listen);

                let mut flags = self.flags.lock();
                if was_open && !flags.shutting_down {
                    info!("Session lost ({}): {}", code, reason);
                    flags.session_lost = true;
                    drop(flags);
                    self.notice("Connection lost, reconnecting...");
                }
            }
            SessionEvent::ReconnectScheduled { attempt, delay } => {
                debug!("Reconnect attempt {} in {:?}", attempt, delay);
            }
            SessionEvent::ReconnectExhausted { attempts } => {
                self.notice(format!(
                    "Unable to reach the assistant after {} attempts",
                    attempts
                ));
            }
        }
    }

    fn handle_peripheral_event(&self, event: PeripheralEvent) {
        match event {
            PeripheralEvent::StateChanged(status) => {
                self.state.set_peripheral_state(status);
                if status != PeripheralConnectionState::Connected {
                    cancel(&mut self.tasks.lock().auto_listen);
                }
            }
            PeripheralEvent::AvailabilityChanged(powered) => {
                if !powered {
                    self.notice("Bluetooth is off");
                }
            }
            PeripheralEvent::ConnectFailed { id, attempts, reason } => {
                warn!("Peripheral {} failed: {}", id, reason);
                self.notice(format!(
                    "Could not connect to {} after {} attempts",
                    id, attempts
                ));
            }
            PeripheralEvent::Discovered(peripheral) => {
                debug!("Peripheral in range: {}", peripheral.display_name());
            }
            PeripheralEvent::ScanFinished { found } => debug!("Scan found {}", found),
            PeripheralEvent::Error(e) => warn!("Peripheral error: {}", e),
        }
    }

    fn handle_server_message(self: &Arc<Self>, raw: &str) {
        let message = match ServerMessage::from_json(raw) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring unreadable frame: {}", e);
                return;
            }
        };

        match message {
            ServerMessage::AiResponse(response) => {
                if let (Some(id), Some(transcription)) =
                    (&response.message_id, &response.transcription)
                {
                    if self.state.correct_entry(id, transcription) {
                        debug!("Transcription applied to {}", id);
                    }
                }
                self.state
                    .push_entry(ConversationEntry::assistant(response.text.clone()));

                match response.audio() {
                    Ok(Some(clip)) => self.play_reply(clip),
                    Ok(None) => self.schedule_auto_listen(),
                    Err(e) => {
                        error!("Failed to decode reply audio: {}", e);
                        self.notice("Could not play the assistant reply");
                        self.schedule_auto_listen();
                    }
                }
            }
            ServerMessage::Error { message } => {
                warn!("Assistant error: {}", message);
                self.notice(format!("Assistant error: {}", message));
            }
            ServerMessage::Ping | ServerMessage::Pong => {}
        }
    }

    async fn submit(&self, envelope: OutboundEnvelope) -> EnqueueOutcome {
        self.state.push_entry(ConversationEntry::user(
            envelope.message_id(),
            envelope.display_text(),
        ));

        let outcome = self.outbox.enqueue_and_attempt(envelope).await;
        if let EnqueueOutcome::QueuedWithDrop { dropped } = &outcome {
            self.notice(format!("Outbox full, dropped unsent message {}", dropped));
        }
        self.refresh_pending().await;
        outcome
    }

    fn auto_listen_ready(&self) -> bool {
        auto_listen_allowed(
            self.session.state(),
            self.peripherals.state(),
            self.state.is_busy(),
        )
    }

    fn schedule_auto_listen(self: &Arc<Self>) {
        if !self.conversation.auto_listen {
            return;
        }
        if !self.auto_listen_ready() {
            debug!(
                "Auto-listen skipped (session {}, peripheral {})",
                self.session.state().as_str(),
                self.peripherals.state().as_str()
            );
            return;
        }

        let this = self.clone();
        let delay = self.conversation.auto_listen_delay();
        let mut tasks = self.tasks.lock();
        cancel(&mut tasks.auto_listen);
        tasks.auto_listen = Some(tokio::spawn(async move {
            sleep(delay).await;
            this.tasks.lock().auto_listen.take();

            if !this.auto_listen_ready() {
                debug!("Auto-listen dropped, conditions changed");
                return;
            }
            if !this.permissions.ensure_granted(Capability::Microphone).await {
                this.notice("Microphone permission denied");
                return;
            }
            this.begin_capture(true);
        }));
    }

    fn begin_capture(self: &Arc<Self>, gated: bool) -> bool {
        let mut tasks = self.tasks.lock();
        if self.state.is_busy() {
            debug!("Capture ignored, already busy");
            return false;
        }
        if gated && !self.auto_listen_ready() {
            return false;
        }

        cancel(&mut tasks.auto_listen);
        self.state.set_capturing(true);

        let this = self.clone();
        tasks.capture = Some(tokio::spawn(async move {
            let result = this.audio.start_capture(&this.capture).await;
            this.state.set_capturing(false);

            match result {
                Ok(clip) if clip.is_empty() => debug!("Empty capture discarded"),
                Ok(clip) => {
                    this.send_audio(clip, None).await;
                }
                Err(e) => {
                    error!("Capture failed: {}", e);
                    this.notice(format!("Audio capture failed: {}", e));
                }
            }
        }));
        true
    }

    fn play_reply(self: &Arc<Self>, clip: Vec<u8>) {
        let this = self.clone();
        let mut tasks = self.tasks.lock();
        cancel(&mut tasks.auto_listen);
        cancel(&mut tasks.playback);
        self.state.set_speaking(true);

        tasks.playback = Some(tokio::spawn(async move {
            let result = this.audio.play(&clip).await;
            this.state.set_speaking(false);
            if let Err(e) = result {
                error!("Playback failed: {}", e);
                this.notice("Could not play the assistant reply");
            }
            this.schedule_auto_listen();
        }));
    }

    async fn refresh_pending(&self) {
        self.state.set_pending_count(self.outbox.pending().await);
    }

    fn notice(&self, text: impl Into<String>) {
        let text = text.into();
        info!("{}", text);
        self.state.push_entry(ConversationEntry::system(text));
    }
}
