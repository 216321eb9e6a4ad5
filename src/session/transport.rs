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

//! Duplex transport abstraction and its WebSocket implementation.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

use crate::error::{CoreError, Result};

/// Local, intentional close.
pub const NORMAL_CLOSURE: u16 = 1000;

/// The link dropped without a close handshake.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// The peer went silent past the heartbeat window.
pub const HEARTBEAT_TIMEOUT: u16 = 4000;

/// Channel capacity in either direction.
const FRAME_BUFFER: usize = 64;

/// Frame handed to the transport for transmission.
#[derive(Debug)]
pub enum OutgoingFrame {
    /// Text frame. `done` resolves `true` once the frame was flushed.
    Text {
        text: String,
        done: oneshot::Sender<bool>,
    },
    /// Close the link with a close code.
    Close { code: u16, reason: String },
}

/// Frame received from the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IncomingFrame {
    Text(String),
    Closed { code: u16, reason: String },
    Error(String),
}

/// An established link: one channel per direction.
///
/// Dropping `outgoing` closes the link.
#[derive(Debug)]
pub struct TransportLink {
    pub outgoing: mpsc::Sender<OutgoingFrame>,
    pub incoming: mpsc::Receiver<IncomingFrame>,
}

/// Opens links to the assistant service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform the handshake. Resolves once the link is usable.
    async fn connect(&self, url: &str) -> Result<TransportLink>;
}

/// WebSocket transport.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, url: &str) -> Result<TransportLink> {
        debug!("Connecting to {}", url);
        let (ws, _response) = connect_async(url)
            .await
            .map_err(|e| CoreError::transport(format!("connect {}: {}", url, e)))?;
        info!("WebSocket connected: {}", url);

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<OutgoingFrame>(FRAME_BUFFER);
        let (in_tx, in_rx) = mpsc::channel::<IncomingFrame>(FRAME_BUFFER);

        // Writer: flush each frame before acknowledging it
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                match frame {
                    OutgoingFrame::Text { text, done } => {
                        let sent = match sink.send(Message::Text(text)).await {
                            Ok(()) => true,
                            Err(e) => {
                                error!("WebSocket write failed: {}", e);
                                false
                            }
                        };
                        let _ = done.send(sent);
                        if !sent {
                            break;
                        }
                    }
                    OutgoingFrame::Close { code, reason } => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                }
            }
            let _ = sink.close().await;
            debug!("WebSocket writer exited");
        });

        // Reader
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                let frame = match message {
                    Ok(Message::Text(text)) => IncomingFrame::Text(text),
                    Ok(Message::Close(close)) => {
                        let (code, reason) = close
                            .map(|f| (u16::from(f.code), f.reason.to_string()))
                            .unwrap_or((ABNORMAL_CLOSURE, String::new()));
                        let _ = in_tx.send(IncomingFrame::Closed { code, reason }).await;
                        return;
                    }
                    // Control frames are answered by tungstenite itself
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = in_tx.send(IncomingFrame::Error(e.to_string())).await;
                        return;
                    }
                };

                if in_tx.send(frame).await.is_err() {
                    return;
                }
            }

            let _ = in_tx
                .send(IncomingFrame::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "stream ended".to_string(),
                })
                .await;
        });

        Ok(TransportLink {
            outgoing: out_tx,
            incoming: in_rx,
        })
    }
}
