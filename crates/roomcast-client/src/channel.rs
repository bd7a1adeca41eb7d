//! The single duplex connection to the SFU
//!
//! Owns the WebSocket, serializes outbound messages, and delivers inbound
//! traffic either to the pending-request table (replies) or to the session
//! event loop (unsolicited events).

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use roomcast_protocol::{ClientMessage, ServerMessage};
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::ChannelError;
use crate::pending::{CorrelationKey, PendingRequestRegistry, ResponseKind};

/// Traffic surfaced to the session event loop
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound message no pending request claimed
    Message(ServerMessage),
    /// The connection is gone; every pending request has already failed
    Disconnected,
}

enum Outbound {
    Message(ClientMessage),
    Shutdown,
}

/// Correlation-aware handle to the control connection
///
/// Cloning shares the underlying connection.
#[derive(Clone)]
pub struct ControlChannel {
    outbound: mpsc::Sender<Outbound>,
    pending: Arc<PendingRequestRegistry>,
}

impl ControlChannel {
    /// Connect to the SFU and spawn the reader and writer tasks
    ///
    /// The returned receiver carries unsolicited events followed by a
    /// final `Disconnected` once the connection is gone.
    pub async fn connect(url: &str) -> Result<(Self, mpsc::Receiver<ChannelEvent>), ChannelError> {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("control channel connected to {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::channel::<Outbound>(100);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(100);
        let pending = Arc::new(PendingRequestRegistry::new());

        // Writer task: drains the outbound queue onto the socket
        tokio::spawn(async move {
            while let Some(outbound) = rx.recv().await {
                let msg = match outbound {
                    Outbound::Message(msg) => msg,
                    Outbound::Shutdown => break,
                };
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("failed to serialize outbound message: {}", e);
                        continue;
                    }
                };
                tracing::debug!("outbound: {}", json);
                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("failed to send on control channel");
                    break;
                }
            }
            let _ = write.send(Message::Close(None)).await;
        });

        // Reader task: replies go to the pending table, the rest to the
        // session event loop
        let pending_reader = pending.clone();
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(&text) {
                        Ok(msg) => {
                            tracing::debug!("inbound: {:?}", msg);
                            if let Some(unmatched) = pending_reader.resolve(msg) {
                                if event_tx.send(ChannelEvent::Message(unmatched)).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Err(e) => {
                            tracing::warn!("malformed message from the SFU: {}", e);
                        }
                    },
                    Ok(Message::Close(_)) => {
                        tracing::info!("control channel closed by the SFU");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!("control channel error: {}", e);
                        break;
                    }
                }
            }
            // outstanding requests must fail, not hang
            pending_reader.fail_all();
            let _ = event_tx.send(ChannelEvent::Disconnected).await;
        });

        Ok((
            Self {
                outbound: tx,
                pending,
            },
            event_rx,
        ))
    }

    /// Fire-and-forget send
    pub async fn send(&self, msg: ClientMessage) -> Result<(), ChannelError> {
        self.outbound
            .send(Outbound::Message(msg))
            .await
            .map_err(|_| ChannelError::Closed)
    }

    /// Send a request and wait, bounded, for the reply that matches it
    ///
    /// The reply may be the expected kind or a server error scoped to the
    /// same correlation key; unrelated messages never satisfy the wait.
    pub async fn request(
        &self,
        msg: ClientMessage,
        expected: ResponseKind,
        key: CorrelationKey,
        wait: Duration,
    ) -> Result<ServerMessage, ChannelError> {
        let rx = self.pending.register(expected, key.clone());
        if let Err(e) = self.send(msg).await {
            self.pending.abandon(expected, &key);
            return Err(e);
        }
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            // sender dropped: the reader failed the table on close
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.pending.abandon(expected, &key);
                Err(ChannelError::RequestTimeout(expected))
            }
        }
    }

    /// Number of requests currently awaiting a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    /// Close the connection; pending requests fail immediately
    pub async fn close(&self) {
        self.pending.fail_all();
        let _ = self.outbound.send(Outbound::Shutdown).await;
    }
}
