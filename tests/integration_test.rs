//! Integration tests for the full client flow.

use base64::{engine::general_purpose::STANDARD, Engine};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

use airassist_core::bluetooth::PeripheralConnectionState;
use airassist_core::media::Capability;
use airassist_core::outbox::EnqueueOutcome;
use airassist_core::session::{AiResponse, ClientMessage, ConnectionState, ServerMessage, ABNORMAL_CLOSURE};
use airassist_core::storage::{MemoryStore, SqliteStore, Store};
use airassist_core::testing::{settle, MockAdapter, MockAudio, MockPermissions, MockTransport};
use airassist_core::{Collaborators, Config, CoreError, Orchestrator, Origin, Snapshot};

struct Harness {
    transport: MockTransport,
    adapter: MockAdapter,
    audio: Arc<MockAudio>,
    permissions: Arc<MockPermissions>,
    store: Arc<dyn Store>,
}

impl Harness {
    fn new() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    fn with_store(store: Arc<dyn Store>) -> Self {
        Self {
            transport: MockTransport::new(),
            adapter: MockAdapter::new(),
            audio: Arc::new(MockAudio::new()),
            permissions: Arc::new(MockPermissions::new()),
            store,
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.session.url = "ws://assist.test/ws".to_string();
        config.session.heartbeat_timeout_ms = None;
        config
    }

    async fn start(&self) -> Arc<Orchestrator> {
        self.start_with(Self::config()).await
    }

    async fn start_with(&self, config: Config) -> Arc<Orchestrator> {
        let collaborators = Collaborators {
            transport: Arc::new(self.transport.clone()),
            adapter: Arc::new(self.adapter.clone()),
            audio: self.audio.clone(),
            permissions: self.permissions.clone(),
            store: self.store.clone(),
        };
        let orchestrator = Orchestrator::start(&config, collaborators).await;
        settle().await;
        orchestrator
    }
}

fn reply(text: &str) -> ServerMessage {
    ServerMessage::AiResponse(AiResponse {
        text: text.to_string(),
        audio_base64: None,
        message_id: None,
        transcription: None,
        timestamp: None,
    })
}

fn system_entries(snapshot: &Snapshot) -> Vec<String> {
    snapshot
        .conversation
        .iter()
        .filter(|e| e.origin == Origin::System)
        .map(|e| e.text.clone())
        .collect()
}

fn audio_messages_sent(transport: &MockTransport) -> usize {
    transport
        .sent_messages()
        .iter()
        .filter(|m| matches!(m, ClientMessage::Audio(_)))
        .count()
}

#[tokio::test(start_paused = true)]
async fn test_offline_messages_replay_in_order() {
    let harness = Harness::new();
    harness.transport.set_reachable(false);
    let core = harness.start().await;
    assert_eq!(core.snapshot().session_state, ConnectionState::Closed);

    assert_eq!(core.send_text("first").await, Some(EnqueueOutcome::Queued));
    assert_eq!(core.send_text("second").await, Some(EnqueueOutcome::Queued));
    assert_eq!(core.snapshot().pending_count, 2);

    harness.transport.set_reachable(true);
    sleep(Duration::from_secs(1)).await;
    settle().await;

    let texts: Vec<String> = harness
        .transport
        .sent_messages()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Text(body) => body.text,
            _ => None,
        })
        .collect();
    assert_eq!(texts, vec!["first", "second"]);

    let snapshot = core.snapshot();
    assert_eq!(snapshot.session_state, ConnectionState::Open);
    assert_eq!(snapshot.pending_count, 0);
    core.shutdown();
}

fn texts_sent(transport: &MockTransport) -> Vec<String> {
    transport
        .sent_messages()
        .into_iter()
        .filter_map(|m| match m {
            ClientMessage::Text(body) => body.text,
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_stalled_send_keeps_envelopes_queued() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert_eq!(core.snapshot().session_state, ConnectionState::Open);

    harness.transport.set_stall_sends(true);
    assert_eq!(core.send_text("first").await, Some(EnqueueOutcome::Queued));
    assert_eq!(core.send_text("second").await, Some(EnqueueOutcome::Queued));
    settle().await;

    let snapshot = core.snapshot();
    assert_eq!(snapshot.pending_count, 2);
    assert_eq!(snapshot.session_state, ConnectionState::Closed);
    assert_eq!(harness.transport.close_codes(), vec![ABNORMAL_CLOSURE]);
    assert!(system_entries(&snapshot).contains(&"Connection lost, reconnecting...".to_string()));

    harness.transport.set_stall_sends(false);
    sleep(Duration::from_secs(1)).await;
    settle().await;

    assert_eq!(texts_sent(&harness.transport), vec!["first", "second"]);
    let snapshot = core.snapshot();
    assert_eq!(snapshot.session_state, ConnectionState::Open);
    assert_eq!(snapshot.pending_count, 0);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_outbox_overflow_adds_notice() {
    let harness = Harness::new();
    harness.transport.set_reachable(false);
    let mut config = Harness::config();
    config.outbox.capacity = 2;
    let core = harness.start_with(config).await;

    assert_eq!(core.send_text("one").await, Some(EnqueueOutcome::Queued));
    assert_eq!(core.send_text("two").await, Some(EnqueueOutcome::Queued));
    let oldest = core.snapshot().conversation[0].id.clone();

    assert_eq!(
        core.send_text("three").await,
        Some(EnqueueOutcome::QueuedWithDrop {
            dropped: oldest.clone()
        })
    );

    let snapshot = core.snapshot();
    assert_eq!(snapshot.pending_count, 2);
    assert_eq!(
        system_entries(&snapshot),
        vec![format!("Outbox full, dropped unsent message {}", oldest)]
    );

    harness.transport.set_reachable(true);
    sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(texts_sent(&harness.transport), vec!["two", "three"]);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_bluetooth_off_notices() {
    let harness = Harness::new();
    harness.adapter.set_powered(false);
    let core = harness.start().await;

    let snapshot = core.snapshot();
    assert_eq!(snapshot.peripheral_state, PeripheralConnectionState::Disabled);
    assert_eq!(system_entries(&snapshot), vec!["Bluetooth is off"]);

    harness.adapter.set_powered(true);
    settle().await;
    assert_eq!(
        core.snapshot().peripheral_state,
        PeripheralConnectionState::Disconnected
    );

    harness.adapter.set_powered(false);
    settle().await;
    assert_eq!(
        system_entries(&core.snapshot()),
        vec!["Bluetooth is off", "Bluetooth is off"]
    );
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_bluetooth_unavailable_notice() {
    let harness = Harness::new();
    harness.permissions.deny(Capability::Bluetooth);
    let core = harness.start().await;

    let snapshot = core.snapshot();
    assert_eq!(snapshot.peripheral_state, PeripheralConnectionState::Error);
    assert_eq!(
        system_entries(&snapshot),
        vec!["Bluetooth unavailable: permission denied: bluetooth"]
    );
    // The session comes up regardless
    assert_eq!(snapshot.session_state, ConnectionState::Open);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_capture_ends_on_silence() {
    let harness = Harness::new();
    let mut frames = vec![vec![12_000i16; 160]; 5];
    frames.extend(vec![vec![0i16; 160]; 100]);
    harness.audio.set_capture_frames(frames);
    let core = harness.start().await;

    assert_eq!(core.start_listening().await, Ok(true));

    // 0.5s of speech, then 1.5s of trailing silence
    sleep(Duration::from_millis(1_900)).await;
    settle().await;
    assert_eq!(audio_messages_sent(&harness.transport), 0);
    assert!(core.snapshot().is_busy);

    sleep(Duration::from_millis(200)).await;
    settle().await;
    assert_eq!(audio_messages_sent(&harness.transport), 1);
    assert!(!core.snapshot().is_busy);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_send_while_open_is_direct() {
    let harness = Harness::new();
    let core = harness.start().await;

    assert_eq!(core.send_text("hello").await, Some(EnqueueOutcome::Sent));
    assert_eq!(core.send_text("   ").await, None);
    assert_eq!(harness.transport.sent_message_ids().len(), 1);

    let snapshot = core.snapshot();
    assert_eq!(snapshot.conversation.len(), 1);
    assert_eq!(snapshot.conversation[0].origin, Origin::User);
    assert_eq!(snapshot.conversation[0].text, "hello");
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_restart_restores_outbox_from_sqlite() {
    let dir = tempfile::tempdir().unwrap();

    let queued_id = {
        let store: Arc<dyn Store> = Arc::new(SqliteStore::open(dir.path()).unwrap());
        let harness = Harness::with_store(store);
        harness.transport.set_reachable(false);
        let core = harness.start().await;

        core.send_text("written offline").await;
        let id = core.snapshot().conversation[0].id.clone();
        core.shutdown();
        id
    };

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(dir.path()).unwrap());
    let harness = Harness::with_store(store);
    let core = harness.start().await;

    assert_eq!(harness.transport.sent_message_ids(), vec![queued_id]);
    assert_eq!(core.snapshot().pending_count, 0);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_transcription_corrects_user_entry_once() {
    let harness = Harness::new();
    let core = harness.start().await;

    assert_eq!(
        core.send_audio(vec![1, 2, 3], None).await,
        Some(EnqueueOutcome::Sent)
    );
    let id = harness.transport.sent_message_ids()[0].clone();
    assert_eq!(core.snapshot().conversation[0].text, "[voice message]");

    let first = ServerMessage::AiResponse(AiResponse {
        text: "Lights are on".to_string(),
        audio_base64: None,
        message_id: Some(id.clone()),
        transcription: Some("turn on the lights".to_string()),
        timestamp: None,
    });
    harness.transport.push(first.to_json().unwrap()).await;
    settle().await;

    let again = ServerMessage::AiResponse(AiResponse {
        text: "Still on".to_string(),
        audio_base64: None,
        message_id: Some(id.clone()),
        transcription: Some("something else".to_string()),
        timestamp: None,
    });
    harness.transport.push(again.to_json().unwrap()).await;
    settle().await;

    let snapshot = core.snapshot();
    let texts: Vec<(&str, Origin)> = snapshot
        .conversation
        .iter()
        .map(|e| (e.text.as_str(), e.origin))
        .collect();
    assert_eq!(
        texts,
        vec![
            ("turn on the lights", Origin::User),
            ("Lights are on", Origin::Assistant),
            ("Still on", Origin::Assistant),
        ]
    );
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_connection_notices() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(system_entries(&core.snapshot()).is_empty());

    harness.transport.drop_link(ABNORMAL_CLOSURE, "network lost").await;
    settle().await;
    assert_eq!(core.snapshot().session_state, ConnectionState::Closed);
    assert_eq!(
        system_entries(&core.snapshot()),
        vec!["Connection lost, reconnecting..."]
    );

    sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(core.snapshot().session_state, ConnectionState::Open);
    assert_eq!(
        system_entries(&core.snapshot()),
        vec!["Connection lost, reconnecting...", "Reconnected to assistant"]
    );
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_failed_connects_add_no_notices() {
    let harness = Harness::new();
    harness.transport.set_reachable(false);
    let core = harness.start().await;

    sleep(Duration::from_secs(10)).await;
    settle().await;

    assert!(harness.transport.connect_count() > 1);
    assert!(system_entries(&core.snapshot()).is_empty());
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_auto_listen_after_text_reply() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(core.peripherals().connect("AA:BB:CC:DD:EE:01").await);
    settle().await;

    harness.transport.push(reply("What else?").to_json().unwrap()).await;
    settle().await;
    assert_eq!(harness.audio.captures(), 0);

    sleep(Duration::from_millis(600)).await;
    settle().await;
    assert_eq!(harness.audio.captures(), 1);
    assert!(core.snapshot().is_busy);

    // The clip is sent when the capture ends
    sleep(Duration::from_secs(2)).await;
    settle().await;
    assert_eq!(audio_messages_sent(&harness.transport), 1);
    assert!(!core.snapshot().is_busy);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_auto_listen_waits_for_playback() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(core.peripherals().connect("AA:BB:CC:DD:EE:01").await);
    settle().await;

    let spoken = ServerMessage::AiResponse(AiResponse {
        text: "Here you go".to_string(),
        audio_base64: Some(STANDARD.encode([9u8, 9, 9])),
        message_id: None,
        transcription: None,
        timestamp: None,
    });
    harness.transport.push(spoken.to_json().unwrap()).await;
    settle().await;
    assert!(core.snapshot().is_busy);
    assert_eq!(harness.audio.played(), vec![vec![9u8, 9, 9]]);

    sleep(Duration::from_secs(1)).await;
    settle().await;
    assert!(!core.snapshot().is_busy);
    assert_eq!(harness.audio.captures(), 0);

    sleep(Duration::from_millis(600)).await;
    settle().await;
    assert_eq!(harness.audio.captures(), 1);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_no_auto_listen_without_peripheral() {
    let harness = Harness::new();
    let core = harness.start().await;

    harness.transport.push(reply("Anything else?").to_json().unwrap()).await;
    sleep(Duration::from_secs(5)).await;

    assert_eq!(harness.audio.captures(), 0);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_auto_listen_dropped_when_peripheral_leaves() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(core.peripherals().connect("AA:BB:CC:DD:EE:01").await);
    settle().await;

    harness.transport.push(reply("Go on").to_json().unwrap()).await;
    settle().await;
    core.peripherals().disconnect().await;

    sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.audio.captures(), 0);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_auto_listen_dropped_when_session_drops() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(core.peripherals().connect("AA:BB:CC:DD:EE:01").await);
    settle().await;

    harness.transport.set_reachable(false);
    harness.transport.push(reply("Go on").to_json().unwrap()).await;
    settle().await;
    harness.transport.drop_link(ABNORMAL_CLOSURE, "network lost").await;

    sleep(Duration::from_secs(2)).await;
    assert_eq!(harness.audio.captures(), 0);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_no_auto_listen_while_capturing() {
    let harness = Harness::new();
    let core = harness.start().await;
    assert!(core.peripherals().connect("AA:BB:CC:DD:EE:01").await);
    settle().await;

    assert_eq!(core.start_listening().await, Ok(true));
    harness.transport.push(reply("Still there?").to_json().unwrap()).await;

    // The manual capture ends after 2s; nothing else may start on its own
    sleep(Duration::from_secs(5)).await;
    settle().await;
    assert_eq!(harness.audio.captures(), 1);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_manual_listening() {
    let harness = Harness::new();
    let core = harness.start().await;

    assert_eq!(core.start_listening().await, Ok(true));
    settle().await;
    assert_eq!(core.start_listening().await, Ok(false));

    core.stop_listening();
    settle().await;

    assert_eq!(harness.audio.captures(), 1);
    assert_eq!(audio_messages_sent(&harness.transport), 1);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_microphone_permission_denied() {
    let harness = Harness::new();
    harness.permissions.deny(Capability::Microphone);
    let core = harness.start().await;

    assert_eq!(
        core.start_listening().await,
        Err(CoreError::PermissionDenied(Capability::Microphone))
    );
    assert_eq!(harness.audio.captures(), 0);
    assert_eq!(
        system_entries(&core.snapshot()),
        vec!["Microphone permission denied"]
    );
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_reconnecting() {
    let harness = Harness::new();
    harness.transport.set_reachable(false);
    let core = harness.start().await;

    core.shutdown();
    sleep(Duration::from_secs(60)).await;

    assert_eq!(harness.transport.connect_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_foreground_revives_session() {
    let harness = Harness::new();
    let core = harness.start().await;

    harness.transport.drop_link(ABNORMAL_CLOSURE, "suspended").await;
    settle().await;
    core.on_foreground().await;
    settle().await;

    assert_eq!(core.snapshot().session_state, ConnectionState::Open);
    assert_eq!(harness.transport.connect_count(), 2);
    core.shutdown();
}

#[tokio::test(start_paused = true)]
async fn test_subscribers_follow_conversation() {
    let harness = Harness::new();
    let core = harness.start().await;
    let mut updates = core.subscribe();
    updates.borrow_and_update();

    core.send_text("ping?").await;
    assert!(updates.has_changed().unwrap());
    let snapshot = updates.borrow_and_update().clone();
    assert_eq!(snapshot.conversation.last().unwrap().text, "ping?");

    core.clear_conversation();
    assert!(updates.borrow_and_update().conversation.is_empty());
    core.shutdown();
}
