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

//! Session manager: one logical duplex connection with reconnect and heartbeat.
//!
//! State machine:
//!
//! ```text
//! Idle --open--> Connecting --link up--> Open --drop/timeout--> Closed
//!                    ^                                             |
//!                    +------------- reconnect timer ---------------+
//! ```
//!
//! Only `close()` ends the cycle. Every task the manager spawns (reader,
//! heartbeat, reconnect timer) is tracked by handle and aborted before it is
//! replaced. Callbacks from superseded links are discarded by comparing the
//! link generation.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::policy::ReconnectPolicy;
use super::protocol::{ClientMessage, ServerMessage};
use super::transport::{
    IncomingFrame, OutgoingFrame, Transport, TransportLink, ABNORMAL_CLOSURE, HEARTBEAT_TIMEOUT,
    NORMAL_CLOSURE,
};
use crate::config::SessionConfig;
use crate::envelope::OutboundEnvelope;

/// Connection state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Open,
    /// Reserved for transports with a close handshake. A local `close()`
    /// completes immediately, so this manager never rests here.
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Open => "Open",
            ConnectionState::Closing => "Closing...",
            ConnectionState::Closed => "Closed",
        }
    }
}

/// Events emitted by the session manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A connection attempt started. `attempt` is 0 for a fresh open.
    Connecting { attempt: u32 },
    /// The link is up. Fires once per successful open.
    Opened,
    /// Raw content frame from the service.
    Message(String),
    /// Transport-level failure.
    Error(String),
    /// The link went down.
    Closed { code: u16, reason: String },
    /// A retry was scheduled after a failure.
    ReconnectScheduled { attempt: u32, delay: Duration },
    /// The attempt limit is spent; no further retries.
    ReconnectExhausted { attempts: u32 },
}

struct SessionState {
    status: ConnectionState,
    url: Option<String>,
    policy: ReconnectPolicy,
    /// Bumped for every connection attempt and every local close.
    generation: u64,
    outgoing: Option<mpsc::Sender<OutgoingFrame>>,
    last_inbound: Instant,
    closed_locally: bool,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect_timer: Option<JoinHandle<()>>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    heartbeat_interval: Duration,
    heartbeat_timeout: Option<Duration>,
    send_timeout: Duration,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
    state: Mutex<SessionState>,
}

/// Owner of the duplex connection to the assistant service.
#[derive(Clone)]
pub struct SessionManager {
    shared: Arc<Shared>,
}

/// Queue a ping or pong without waiting for the flush.
fn queue_keepalive(tx: &mpsc::Sender<OutgoingFrame>, text: String) -> bool {
    let (done, _) = oneshot::channel();
    tx.try_send(OutgoingFrame::Text { text, done }).is_ok()
}

fn cancel(handle: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = handle.take() {
        handle.abort();
    }
}

impl SessionManager {
    /// Create a new session manager. Nothing connects until `open`.
    pub fn new(
        transport: Arc<dyn Transport>,
        config: &SessionConfig,
        event_tx: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                heartbeat_interval: config.heartbeat_interval(),
                heartbeat_timeout: config.heartbeat_timeout(),
                send_timeout: config.send_timeout(),
                event_tx,
                state: Mutex::new(SessionState {
                    status: ConnectionState::Idle,
                    url: None,
                    policy: ReconnectPolicy::from(&config.reconnect),
                    generation: 0,
                    outgoing: None,
                    last_inbound: Instant::now(),
                    closed_locally: false,
                    reader: None,
                    heartbeat: None,
                    reconnect_timer: None,
                }),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state.lock().status
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Consecutive failed attempts since the last successful open.
    pub fn reconnect_attempt(&self) -> u32 {
        self.shared.state.lock().policy.attempt()
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.shared.state.lock().reconnect_timer.is_some()
    }

    /// Open the session. No-op while already open or connecting.
    ///
    /// A pending reconnect timer is cancelled and the attempt made now.
    /// Resolves once the handshake succeeded or failed.
    pub async fn open(&self, url: &str) {
        let target = {
            let mut st = self.shared.state.lock();
            st.url = Some(url.to_string());
            st.closed_locally = false;

            if matches!(st.status, ConnectionState::Open | ConnectionState::Connecting) {
                debug!("open() ignored, session is {}", st.status.as_str());
                return;
            }

            // Fresh cycle unless we are interrupting a backoff in progress
            if st.reconnect_timer.is_none() {
                st.policy.reset();
            }
            cancel(&mut st.reconnect_timer);
            self.begin_connecting(&mut st)
        };

        if let Some((generation, url)) = target {
            self.connect(generation, url).await;
        }
    }

    /// Close the session for good. Safe in any state.
    pub fn close(&self) {
        let mut st = self.shared.state.lock();
        st.closed_locally = true;
        cancel(&mut st.reconnect_timer);

        match st.status {
            ConnectionState::Idle | ConnectionState::Closed => {
                debug!("close() on a session that is not connected");
            }
            ConnectionState::Connecting => {
                st.generation += 1;
                st.status = ConnectionState::Closed;
                info!("Session connect cancelled");
                self.emit(SessionEvent::Closed {
                    code: NORMAL_CLOSURE,
                    reason: "closed by client".to_string(),
                });
            }
            ConnectionState::Open | ConnectionState::Closing => {
                st.generation += 1;
                self.drop_link(&mut st, NORMAL_CLOSURE, "closed by client".to_string(), true);
                info!("Session closed");
            }
        }
    }

    /// Hand an envelope to the transport.
    ///
    /// Returns `false` without side effects when the session is not open,
    /// and `false` when the transport failed to flush it.
    pub async fn send(&self, envelope: &OutboundEnvelope) -> bool {
        let text = match envelope.to_wire().to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode envelope {}: {}", envelope.message_id(), e);
                return false;
            }
        };

        let sent = self.send_text(text).await;
        if sent {
            debug!("Envelope {} handed to transport", envelope.message_id());
        }
        sent
    }

    /// Reconnect now if the session dropped. Cheap when already open.
    pub async fn check_connectivity(&self) {
        let url = {
            let st = self.shared.state.lock();
            if st.closed_locally
                || matches!(st.status, ConnectionState::Open | ConnectionState::Connecting)
            {
                return;
            }
            st.url.clone()
        };

        if let Some(url) = url {
            info!("Connectivity check: session is down, reconnecting");
            self.open(&url).await;
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.shared.event_tx.send(event);
    }

    fn begin_connecting(&self, st: &mut SessionState) -> Option<(u64, String)> {
        let url = st.url.clone()?;
        st.generation += 1;
        st.status = ConnectionState::Connecting;
        self.emit(SessionEvent::Connecting {
            attempt: st.policy.attempt(),
        });
        Some((st.generation, url))
    }

    async fn connect(&self, generation: u64, url: String) {
        info!("Opening session to {}", url);
        match self.shared.transport.connect(&url).await {
            Ok(link) => self.on_link_open(generation, link),
            Err(e) => self.on_link_failed(generation, e.to_string()),
        }
    }

    fn on_link_open(&self, generation: u64, link: TransportLink) {
        let TransportLink { outgoing, incoming } = link;
        let mut st = self.shared.state.lock();

        if st.generation != generation || st.status != ConnectionState::Connecting {
            debug!("Discarding superseded link");
            let _ = outgoing.try_send(OutgoingFrame::Close {
                code: NORMAL_CLOSURE,
                reason: "superseded".to_string(),
            });
            return;
        }

        st.status = ConnectionState::Open;
        st.policy.reset();
        st.outgoing = Some(outgoing);
        st.last_inbound = Instant::now();

        cancel(&mut st.reader);
        st.reader = Some(self.spawn_reader(generation, incoming));
        cancel(&mut st.heartbeat);
        st.heartbeat = Some(self.spawn_heartbeat(generation));

        info!("Session open");
        self.emit(SessionEvent::Opened);
    }

    fn on_link_failed(&self, generation: u64, reason: String) {
        let mut st = self.shared.state.lock();
        if st.generation != generation || st.status != ConnectionState::Connecting {
            return;
        }

        warn!("Session connect failed: {}", reason);
        st.status = ConnectionState::Closed;
        self.emit(SessionEvent::Error(reason.clone()));
        self.emit(SessionEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason,
        });
        self.schedule_reconnect(&mut st);
    }

    fn on_text(&self, generation: u64, text: String) {
        let pong_to = {
            let mut st = self.shared.state.lock();
            if st.generation != generation {
                return;
            }
            st.last_inbound = Instant::now();

            match ServerMessage::from_json(&text) {
                Ok(ServerMessage::Ping) => st.outgoing.clone(),
                Ok(ServerMessage::Pong) => return,
                _ => {
                    self.emit(SessionEvent::Message(text));
                    return;
                }
            }
        };

        if let (Some(tx), Ok(pong)) = (pong_to, ClientMessage::Pong.to_json()) {
            if !queue_keepalive(&tx, pong) {
                debug!("Pong not queued");
            }
        }
    }

    fn on_link_closed(&self, generation: u64, code: u16, reason: String) {
        let mut st = self.shared.state.lock();
        if st.generation != generation || st.status != ConnectionState::Open {
            return;
        }

        warn!("Session dropped ({}): {}", code, reason);
        self.drop_link(&mut st, code, reason, false);
        if !st.closed_locally {
            self.schedule_reconnect(&mut st);
        }
    }

    fn on_send_stalled(&self, generation: u64) {
        let mut st = self.shared.state.lock();
        if st.generation != generation || st.status != ConnectionState::Open {
            return;
        }

        warn!(
            "Transport did not flush within {:?}, forcing reconnect",
            self.shared.send_timeout
        );
        self.drop_link(&mut st, ABNORMAL_CLOSURE, "send timed out".to_string(), true);
        self.schedule_reconnect(&mut st);
    }

    fn on_heartbeat_timeout(&self, generation: u64) {
        let mut st = self.shared.state.lock();
        if st.generation != generation || st.status != ConnectionState::Open {
            return;
        }

        warn!(
            "No traffic from service for {:?}, forcing reconnect",
            st.last_inbound.elapsed()
        );
        self.drop_link(&mut st, HEARTBEAT_TIMEOUT, "heartbeat timeout".to_string(), true);
        self.schedule_reconnect(&mut st);
    }

    /// Tear down the current link and report it closed.
    fn drop_link(&self, st: &mut SessionState, code: u16, reason: String, notify_peer: bool) {
        if let Some(tx) = st.outgoing.take() {
            if notify_peer {
                let _ = tx.try_send(OutgoingFrame::Close {
                    code,
                    reason: reason.clone(),
                });
            }
        }
        cancel(&mut st.reader);
        cancel(&mut st.heartbeat);
        st.status = ConnectionState::Closed;
        self.emit(SessionEvent::Closed { code, reason });
    }

    fn schedule_reconnect(&self, st: &mut SessionState) {
        cancel(&mut st.reconnect_timer);

        let Some(delay) = st.policy.next_delay() else {
            let attempts = st.policy.attempt();
            error!("Giving up on session after {} attempts", attempts);
            self.emit(SessionEvent::ReconnectExhausted { attempts });
            return;
        };

        let attempt = st.policy.attempt();
        info!("Reconnecting in {:?} (attempt {})", delay, attempt);
        self.emit(SessionEvent::ReconnectScheduled { attempt, delay });

        let this = self.clone();
        st.reconnect_timer = Some(tokio::spawn(async move {
            sleep(delay).await;
            this.reconnect_now().await;
        }));
    }

    async fn reconnect_now(&self) {
        let target = {
            let mut st = self.shared.state.lock();
            // Detach our own handle; the attempt below must not be aborted by it
            st.reconnect_timer.take();
            if st.closed_locally || st.status != ConnectionState::Closed {
                return;
            }
            self.begin_connecting(&mut st)
        };

        if let Some((generation, url)) = target {
            self.connect(generation, url).await;
        }
    }

    /// Write one frame and wait for the flush, at most `send_timeout`.
    async fn send_text(&self, text: String) -> bool {
        let (generation, tx) = {
            let st = self.shared.state.lock();
            if st.status != ConnectionState::Open {
                return false;
            }
            match &st.outgoing {
                Some(tx) => (st.generation, tx.clone()),
                None => return false,
            }
        };

        let flush = async move {
            let (done_tx, done_rx) = oneshot::channel();
            if tx
                .send(OutgoingFrame::Text {
                    text,
                    done: done_tx,
                })
                .await
                .is_err()
            {
                warn!("Transport writer is gone");
                return false;
            }
            done_rx.await.unwrap_or(false)
        };

        match timeout(self.shared.send_timeout, flush).await {
            Ok(sent) => sent,
            Err(_) => {
                self.on_send_stalled(generation);
                false
            }
        }
    }

    fn spawn_reader(&self, generation: u64, mut incoming: mpsc::Receiver<IncomingFrame>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = incoming.recv().await {
                match frame {
                    IncomingFrame::Text(text) => this.on_text(generation, text),
                    IncomingFrame::Closed { code, reason } => {
                        this.on_link_closed(generation, code, reason);
                        return;
                    }
                    IncomingFrame::Error(e) => {
                        error!("Transport error: {}", e);
                        this.emit(SessionEvent::Error(e.clone()));
                        this.on_link_closed(generation, ABNORMAL_CLOSURE, e);
                        return;
                    }
                }
            }
            this.on_link_closed(generation, ABNORMAL_CLOSURE, "transport ended".to_string());
        })
    }

    fn spawn_heartbeat(&self, generation: u64) -> JoinHandle<()> {
        let this = self.clone();
        let period = self.shared.heartbeat_interval;
        let timeout = self.shared.heartbeat_timeout;

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let (silent_for, outgoing) = {
                    let st = this.shared.state.lock();
                    if st.generation != generation || st.status != ConnectionState::Open {
                        return;
                    }
                    (st.last_inbound.elapsed(), st.outgoing.clone())
                };

                if let Some(limit) = timeout {
                    if silent_for >= limit {
                        this.on_heartbeat_timeout(generation);
                        return;
                    }
                }

                // Fire and forget: a stalled writer must not stall the liveness check
                match (outgoing, ClientMessage::ping().to_json()) {
                    (Some(tx), Ok(ping)) => {
                        if !queue_keepalive(&tx, ping) {
                            debug!("Heartbeat ping not queued");
                        }
                    }
                    (None, _) => return,
                    (_, Err(e)) => error!("Failed to encode ping: {}", e),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ReconnectConfig, UserProfile};
    use crate::testing::{settle, MockTransport};

    const URL: &str = "ws://assist.test/ws";

    fn config() -> SessionConfig {
        SessionConfig {
            url: URL.to_string(),
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: None,
            send_timeout_ms: 3_000,
            reconnect: ReconnectConfig {
                base_delay_ms: 1_000,
                multiplier: 2.0,
                max_delay_ms: 30_000,
                max_attempts: None,
            },
        }
    }

    fn manager(
        transport: &MockTransport,
        config: &SessionConfig,
    ) -> (SessionManager, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (SessionManager::new(Arc::new(transport.clone()), config, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn scheduled_delays(events: &[SessionEvent]) -> Vec<Duration> {
        events
            .iter()
            .filter_map(|e| match e {
                SessionEvent::ReconnectScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .collect()
    }

    fn hello() -> OutboundEnvelope {
        OutboundEnvelope::text(&UserProfile::default(), "hello")
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_idempotent() {
        let transport = MockTransport::new();
        transport.set_connect_delay(Duration::from_millis(100));
        let (session, mut events) = manager(&transport, &config());

        let background = session.clone();
        tokio::spawn(async move { background.open(URL).await });
        settle().await;
        assert_eq!(session.state(), ConnectionState::Connecting);

        // Second open while the handshake is in flight
        session.open(URL).await;
        sleep(Duration::from_millis(200)).await;
        assert_eq!(session.state(), ConnectionState::Open);

        // And once more while open
        session.open(URL).await;
        settle().await;

        assert_eq!(transport.connect_count(), 1);
        let opened = drain(&mut events)
            .into_iter()
            .filter(|e| *e == SessionEvent::Opened)
            .count();
        assert_eq!(opened, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_when_not_connected_is_noop() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.close();
        session.close();
        assert_eq!(session.state(), ConnectionState::Idle);
        assert!(drain(&mut events).is_empty());

        session.open(URL).await;
        session.close();
        drain(&mut events);
        session.close();
        assert!(drain(&mut events).is_empty());
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_close_does_not_reconnect() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        session.close();
        settle().await;

        assert_eq!(transport.close_codes(), vec![NORMAL_CLOSURE]);
        assert!(drain(&mut events).contains(&SessionEvent::Closed {
            code: NORMAL_CLOSURE,
            reason: "closed by client".to_string(),
        }));

        sleep(Duration::from_secs(120)).await;
        assert_eq!(transport.connect_count(), 1);
        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(!session.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_local_close_settles_immediately() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        drain(&mut events);

        session.close();
        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(
            drain(&mut events),
            vec![SessionEvent::Closed {
                code: NORMAL_CLOSURE,
                reason: "closed by client".to_string(),
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_after_abnormal_drop() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        transport.drop_link(ABNORMAL_CLOSURE, "gone").await;
        settle().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert!(session.has_pending_reconnect());
        let seen = drain(&mut events);
        assert!(seen.contains(&SessionEvent::ReconnectScheduled {
            attempt: 1,
            delay: Duration::from_secs(1),
        }));

        sleep(Duration::from_secs(1)).await;
        settle().await;

        assert_eq!(session.state(), ConnectionState::Open);
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(session.reconnect_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_resets_after_open() {
        let transport = MockTransport::new();
        transport.set_reachable(false);
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(session.reconnect_attempt(), 2);

        transport.set_reachable(true);
        sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(session.is_open());
        drain(&mut events);

        transport.drop_link(ABNORMAL_CLOSURE, "gone").await;
        settle().await;
        assert_eq!(
            scheduled_delays(&drain(&mut events)),
            vec![Duration::from_secs(1)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_normal_close_still_reconnects() {
        let transport = MockTransport::new();
        let (session, _events) = manager(&transport, &config());

        session.open(URL).await;
        transport.drop_link(NORMAL_CLOSURE, "server restart").await;
        settle().await;

        assert!(session.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_delays_follow_policy() {
        let transport = MockTransport::new();
        transport.set_reachable(false);
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        for secs in [1, 2, 4, 8, 16, 30, 30] {
            sleep(Duration::from_secs(secs)).await;
            settle().await;
        }

        let delays = scheduled_delays(&drain(&mut events));
        let expected: Vec<Duration> = [1, 2, 4, 8, 16, 30, 30]
            .iter()
            .map(|s| Duration::from_secs(*s))
            .collect();
        assert_eq!(&delays[..7], &expected[..]);
        assert_eq!(transport.connect_count(), 8);
        assert_eq!(session.state(), ConnectionState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_and_manual_recovery() {
        let transport = MockTransport::new();
        transport.set_reachable(false);
        let mut config = config();
        config.reconnect.max_attempts = Some(2);
        let (session, mut events) = manager(&transport, &config);

        session.open(URL).await;
        sleep(Duration::from_secs(1)).await;
        settle().await;
        sleep(Duration::from_secs(2)).await;
        settle().await;

        assert!(drain(&mut events).contains(&SessionEvent::ReconnectExhausted { attempts: 2 }));
        assert!(!session.has_pending_reconnect());

        sleep(Duration::from_secs(300)).await;
        assert_eq!(transport.connect_count(), 3);

        transport.set_reachable(true);
        session.open(URL).await;
        assert!(session.is_open());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_cancels_pending_timer() {
        let transport = MockTransport::new();
        transport.set_reachable(false);
        let (session, _events) = manager(&transport, &config());

        session.open(URL).await;
        assert!(session.has_pending_reconnect());

        transport.set_reachable(true);
        session.open(URL).await;
        assert!(session.is_open());
        assert!(!session.has_pending_reconnect());

        sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_requires_open_session() {
        let transport = MockTransport::new();
        let (session, _events) = manager(&transport, &config());

        assert!(!session.send(&hello()).await);
        assert!(transport.sent_frames().is_empty());

        session.open(URL).await;
        let envelope = hello();
        assert!(session.send(&envelope).await);
        assert_eq!(transport.sent_message_ids(), vec![envelope.message_id().to_string()]);

        transport.set_accept_sends(false);
        assert!(!session.send(&hello()).await);
        assert_eq!(transport.sent_message_ids().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_answered_and_not_forwarded() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        drain(&mut events);

        assert!(transport.push(r#"{"type":"ping"}"#).await);
        assert!(transport.push(r#"{"type":"pong"}"#).await);
        settle().await;
        assert_eq!(transport.pongs_sent(), 1);
        assert!(drain(&mut events).is_empty());

        let reply = r#"{"type":"aiResponse","text":"Hi there"}"#;
        assert!(transport.push(reply).await);
        settle().await;
        assert_eq!(drain(&mut events), vec![SessionEvent::Message(reply.to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_forces_reconnect() {
        let transport = MockTransport::new();
        let mut config = config();
        config.heartbeat_interval_ms = 1_000;
        config.heartbeat_timeout_ms = Some(2_500);
        let (session, mut events) = manager(&transport, &config);

        session.open(URL).await;
        sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(transport.pings_sent(), 2);
        assert!(session.is_open());

        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert_eq!(transport.close_codes(), vec![HEARTBEAT_TIMEOUT]);
        assert!(drain(&mut events).contains(&SessionEvent::Closed {
            code: HEARTBEAT_TIMEOUT,
            reason: "heartbeat timeout".to_string(),
        }));

        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(session.is_open());
        assert_eq!(transport.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_with_stalled_writer() {
        let transport = MockTransport::new();
        let mut config = config();
        config.heartbeat_interval_ms = 1_000;
        config.heartbeat_timeout_ms = Some(2_500);
        let (session, mut events) = manager(&transport, &config);

        session.open(URL).await;
        transport.set_stall_sends(true);
        sleep(Duration::from_secs(3)).await;
        settle().await;

        assert_eq!(transport.close_codes(), vec![HEARTBEAT_TIMEOUT]);
        assert!(drain(&mut events).contains(&SessionEvent::Closed {
            code: HEARTBEAT_TIMEOUT,
            reason: "heartbeat timeout".to_string(),
        }));
        assert!(session.has_pending_reconnect());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_send_fails_and_reconnects() {
        let transport = MockTransport::new();
        let (session, mut events) = manager(&transport, &config());

        session.open(URL).await;
        transport.set_stall_sends(true);

        let started = Instant::now();
        assert!(!session.send(&hello()).await);
        assert!(started.elapsed() >= Duration::from_secs(3));
        settle().await;

        assert_eq!(session.state(), ConnectionState::Closed);
        assert_eq!(transport.close_codes(), vec![ABNORMAL_CLOSURE]);
        assert!(drain(&mut events).contains(&SessionEvent::Closed {
            code: ABNORMAL_CLOSURE,
            reason: "send timed out".to_string(),
        }));

        transport.set_stall_sends(false);
        sleep(Duration::from_secs(1)).await;
        settle().await;
        assert!(session.is_open());
        assert_eq!(transport.connect_count(), 2);
        assert!(session.send(&hello()).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_traffic_keeps_link_alive() {
        let transport = MockTransport::new();
        let mut config = config();
        config.heartbeat_interval_ms = 1_000;
        config.heartbeat_timeout_ms = Some(2_500);
        let (session, _events) = manager(&transport, &config);

        session.open(URL).await;
        for _ in 0..6 {
            sleep(Duration::from_millis(900)).await;
            transport.push(r#"{"type":"pong"}"#).await;
            settle().await;
        }

        assert!(session.is_open());
        assert!(transport.close_codes().is_empty());
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_connectivity() {
        let transport = MockTransport::new();
        let (session, _events) = manager(&transport, &config());

        // Nothing to do before the first open
        session.check_connectivity().await;
        assert_eq!(transport.connect_count(), 0);

        session.open(URL).await;
        session.check_connectivity().await;
        assert_eq!(transport.connect_count(), 1);

        transport.drop_link(ABNORMAL_CLOSURE, "network change").await;
        settle().await;
        session.check_connectivity().await;
        assert!(session.is_open());
        assert!(!session.has_pending_reconnect());
        assert_eq!(transport.connect_count(), 2);

        session.close();
        session.check_connectivity().await;
        assert_eq!(transport.connect_count(), 2);
    }
}
