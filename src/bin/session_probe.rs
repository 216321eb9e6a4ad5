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

//! Diagnostic client for the session and outbox.
//!
//! Usage: cargo run --bin session_probe -- [ws-url]
//!
//! Every line typed on stdin is sent as a text message. Lines typed while
//! the service is unreachable are queued and replayed on reconnect.

use anyhow::Result;
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use airassist_core::outbox::OutboxCoordinator;
use airassist_core::session::{ServerMessage, SessionEvent, SessionManager, WebSocketTransport};
use airassist_core::storage::{SqliteStore, Store};
use airassist_core::{Config, OutboundEnvelope};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("airassist_core=info".parse()?))
        .init();

    let mut config = Config::load()?;
    if let Some(url) = env::args().nth(1) {
        config.session.url = url;
    }
    info!("Probing {}", config.session.url);

    let store: Arc<dyn Store> = Arc::new(SqliteStore::open(&config.data_dir)?);
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let session = SessionManager::new(Arc::new(WebSocketTransport::new()), &config.session, event_tx);
    let outbox = OutboxCoordinator::new(Arc::new(session.clone()), store, &config.outbox);
    info!("{} messages pending from earlier runs", outbox.pending().await);

    session.open(&config.session.url).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            Some(event) = event_rx.recv() => match event {
                SessionEvent::Opened => {
                    let delivered = outbox.on_session_opened().await;
                    println!("* open, replayed {} queued", delivered);
                }
                SessionEvent::Message(raw) => match ServerMessage::from_json(&raw) {
                    Ok(ServerMessage::AiResponse(reply)) => println!("< {}", reply.text),
                    Ok(other) => println!("< {:?}", other),
                    Err(e) => warn!("Unreadable frame: {}", e),
                },
                SessionEvent::Closed { code, reason } => println!("* closed ({}): {}", code, reason),
                SessionEvent::ReconnectScheduled { attempt, delay } => {
                    println!("* retry {} in {:?}", attempt, delay)
                }
                SessionEvent::ReconnectExhausted { attempts } => {
                    println!("* gave up after {} attempts", attempts)
                }
                SessionEvent::Connecting { .. } | SessionEvent::Error(_) => {}
            },
            line = lines.next_line() => match line? {
                Some(line) if !line.trim().is_empty() => {
                    let envelope = OutboundEnvelope::text(&config.user, line.trim());
                    println!("> {:?}", outbox.enqueue_and_attempt(envelope).await);
                }
                Some(_) => {}
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    session.close();
    info!("{} messages left queued", outbox.pending().await);
    Ok(())
}
