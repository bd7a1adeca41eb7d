//! Transport lifecycle
//!
//! One controller per transport, one transport per direction (and per
//! remote peer on the receive side). The controller issues the
//! `create_transport` exchange, instantiates the engine transport from
//! the reply, and services the engine's connect/produce intents by
//! turning them into correlated control-channel requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use roomcast_protocol::{
    ClientMessage, DtlsParameters, MediaKind, PeerId, ProducerId, RtpParameters, ServerMessage,
    TransportDirection, TransportId,
};
use tokio::sync::watch;

use crate::channel::ControlChannel;
use crate::engine::{EngineError, MediaEngine, MediaTransport, TransportIntent};
use crate::error::{ChannelError, Result, SessionError};
use crate::pending::{CorrelationKey, ResponseKind};

/// Lifecycle of a single transport
///
/// `Requested` exists only inside [`TransportController::create`]; a
/// controller is observable from `Created` onward. `Failed` is terminal:
/// a fresh transport must be requested, never a retry of this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Requested,
    Created,
    Connecting,
    Connected,
    Failed,
    Closed,
}

pub(crate) struct TransportTimeouts {
    pub request: Duration,
    pub connect: Duration,
}

pub struct TransportController {
    id: TransportId,
    direction: TransportDirection,
    peer_id: Option<PeerId>,
    state: watch::Sender<TransportState>,
    engine_transport: Arc<dyn MediaTransport>,
    channel: ControlChannel,
    request_timeout: Duration,
    connect_timeout: Duration,
    connect_timed_out: AtomicBool,
}

impl TransportController {
    /// Request a transport from the SFU and instantiate it in the engine
    pub(crate) async fn create(
        channel: ControlChannel,
        engine: Arc<dyn MediaEngine>,
        direction: TransportDirection,
        peer_id: Option<PeerId>,
        timeouts: TransportTimeouts,
    ) -> Result<Arc<Self>> {
        tracing::info!(?direction, peer = ?peer_id, "requesting transport");

        let reply = channel
            .request(
                ClientMessage::CreateTransport {
                    direction,
                    peer_id: peer_id.clone(),
                },
                ResponseKind::TransportCreated,
                CorrelationKey::Endpoint(direction, peer_id.clone()),
                timeouts.request,
            )
            .await
            .map_err(|e| match e {
                ChannelError::RequestTimeout(_) => {
                    SessionError::TransportCreate("no reply from the SFU".to_string())
                }
                other => SessionError::Channel(other),
            })?;

        let options = match reply {
            ServerMessage::TransportCreated {
                id,
                ice_parameters,
                ice_candidates,
                dtls_parameters,
                ..
            } => crate::engine::TransportOptions {
                id,
                ice_parameters,
                ice_candidates,
                dtls_parameters,
            },
            ServerMessage::Error { message, .. } => {
                return Err(SessionError::TransportCreate(message));
            }
            other => {
                return Err(SessionError::TransportCreate(format!(
                    "unexpected reply: {other:?}"
                )));
            }
        };
        let id = options.id.clone();

        let engine_transport = match direction {
            TransportDirection::Send => engine.create_send_transport(options).await,
            TransportDirection::Recv => engine.create_recv_transport(options).await,
        }
        .map_err(|e| SessionError::TransportCreate(e.to_string()))?;

        let (state, _) = watch::channel(TransportState::Created);
        let controller = Arc::new(Self {
            id: id.clone(),
            direction,
            peer_id,
            state,
            engine_transport,
            channel,
            request_timeout: timeouts.request,
            connect_timeout: timeouts.connect,
            connect_timed_out: AtomicBool::new(false),
        });
        tracing::info!(transport = %id, ?direction, "transport created");

        controller.spawn_intent_task();
        Ok(controller)
    }

    pub fn id(&self) -> &TransportId {
        &self.id
    }

    pub fn direction(&self) -> TransportDirection {
        self.direction
    }

    pub fn peer_id(&self) -> Option<&PeerId> {
        self.peer_id.as_ref()
    }

    pub fn state(&self) -> TransportState {
        *self.state.borrow()
    }

    pub(crate) fn engine_transport(&self) -> &Arc<dyn MediaTransport> {
        &self.engine_transport
    }

    /// Wait until the transport reaches `Connected`, bounded by the
    /// configured connect timeout
    pub async fn wait_connected(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        let settled = tokio::time::timeout(
            self.connect_timeout,
            rx.wait_for(|s| {
                matches!(
                    s,
                    TransportState::Connected | TransportState::Failed | TransportState::Closed
                )
            }),
        )
        .await;
        match settled {
            Ok(Ok(state)) => match *state {
                TransportState::Connected => Ok(()),
                _ if self.connect_timed_out.load(Ordering::SeqCst) => Err(
                    SessionError::ConnectTimeout(self.id.clone(), self.connect_timeout),
                ),
                _ => Err(SessionError::TransportFailed(self.id.clone())),
            },
            Ok(Err(_)) => Err(SessionError::TransportFailed(self.id.clone())),
            Err(_) => Err(SessionError::ConnectTimeout(
                self.id.clone(),
                self.connect_timeout,
            )),
        }
    }

    /// Close the transport; idempotent. Producers and consumers bound to
    /// it become invalid on the engine side.
    pub async fn close(&self) {
        let already_closed = {
            let mut closed = false;
            self.state.send_if_modified(|s| {
                if *s == TransportState::Closed {
                    closed = true;
                    false
                } else {
                    *s = TransportState::Closed;
                    true
                }
            });
            closed
        };
        if already_closed {
            return;
        }
        self.engine_transport.close().await;
        tracing::info!(transport = %self.id, "transport closed");
    }

    fn set_state(&self, next: TransportState) {
        self.state.send_if_modified(|s| {
            // terminal states stick
            if matches!(*s, TransportState::Failed | TransportState::Closed) || *s == next {
                return false;
            }
            tracing::info!(transport = %self.id, from = ?*s, to = ?next, "transport state");
            *s = next;
            true
        });
    }

    fn spawn_intent_task(self: &Arc<Self>) {
        let Some(mut intents) = self.engine_transport.take_intents() else {
            tracing::warn!(transport = %self.id, "engine transport yielded no intent stream");
            return;
        };
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(intent) = intents.recv().await {
                match intent {
                    TransportIntent::Connect {
                        dtls_parameters,
                        done,
                    } => {
                        let result = this.handle_connect(dtls_parameters).await;
                        if let Err(e) = &result {
                            tracing::warn!(transport = %this.id, "connect failed: {}", e);
                        }
                        let _ = done.send(result.map_err(|e| EngineError::new(e.to_string())));
                    }
                    TransportIntent::Produce {
                        kind,
                        rtp_parameters,
                        done,
                    } => {
                        let result = this.handle_produce(kind, rtp_parameters).await;
                        if let Err(e) = &result {
                            tracing::warn!(transport = %this.id, %kind, "produce failed: {}", e);
                        }
                        let _ = done.send(result.map_err(|e| EngineError::new(e.to_string())));
                    }
                }
            }
        });
    }

    async fn handle_connect(&self, dtls_parameters: DtlsParameters) -> Result<()> {
        self.set_state(TransportState::Connecting);
        let reply = self
            .channel
            .request(
                ClientMessage::ConnectTransport {
                    transport_id: self.id.clone(),
                    dtls_parameters,
                },
                ResponseKind::TransportConnected,
                CorrelationKey::Transport(self.id.clone()),
                self.connect_timeout,
            )
            .await;

        match reply {
            Ok(ServerMessage::TransportConnected { .. }) => {
                self.set_state(TransportState::Connected);
                Ok(())
            }
            Ok(ServerMessage::Error { message, .. }) => {
                self.set_state(TransportState::Failed);
                tracing::error!(transport = %self.id, "SFU rejected connect: {}", message);
                Err(SessionError::TransportFailed(self.id.clone()))
            }
            Ok(other) => {
                self.set_state(TransportState::Failed);
                tracing::error!(transport = %self.id, "unexpected connect reply: {:?}", other);
                Err(SessionError::TransportFailed(self.id.clone()))
            }
            Err(ChannelError::RequestTimeout(_)) => {
                self.connect_timed_out.store(true, Ordering::SeqCst);
                self.set_state(TransportState::Failed);
                Err(SessionError::ConnectTimeout(
                    self.id.clone(),
                    self.connect_timeout,
                ))
            }
            Err(e) => {
                self.set_state(TransportState::Failed);
                Err(e.into())
            }
        }
    }

    async fn handle_produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId> {
        let reply = self
            .channel
            .request(
                ClientMessage::Produce {
                    transport_id: self.id.clone(),
                    kind,
                    rtp_parameters,
                },
                ResponseKind::Produced,
                CorrelationKey::Producing(self.id.clone(), kind),
                self.request_timeout,
            )
            .await?;

        match reply {
            ServerMessage::Produced { producer_id, .. } => {
                tracing::info!(transport = %self.id, %kind, producer = %producer_id, "produced");
                Ok(producer_id)
            }
            ServerMessage::Error { message, .. } => Err(SessionError::Produce {
                kind,
                reason: message,
            }),
            other => Err(SessionError::Produce {
                kind,
                reason: format!("unexpected reply: {other:?}"),
            }),
        }
    }
}
