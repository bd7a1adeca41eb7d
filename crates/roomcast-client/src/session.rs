//! Top-level session orchestration
//!
//! Sequences join → capability negotiation → transports →
//! produce/consume → steady state → teardown, and owns the event loop
//! that feeds unsolicited SFU traffic to the producer and consumer sides.
//! Reconnection is a fresh `join` on a fresh controller; a half-torn-down
//! session is never patched in place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use roomcast_protocol::{
    ClientMessage, MediaKind, PeerId, ProducerId, RemoteProducerInfo, RtpCapabilities,
    ServerMessage, SessionRole, TransportDirection,
};
use tokio::sync::{mpsc, watch, RwLock};

use crate::capabilities::CapabilityNegotiator;
use crate::channel::{ChannelEvent, ControlChannel};
use crate::config::ClientConfig;
use crate::consumer::{ConsumerRegistry, RemoteStream};
use crate::engine::{MediaEngine, MediaTrack};
use crate::error::{Result, SessionError};
use crate::pending::{CorrelationKey, ResponseKind};
use crate::producer::ProducerController;
use crate::transport::{TransportController, TransportState, TransportTimeouts};

/// Session status surfaced to the UI layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Connecting,
    Joined,
    Negotiating,
    Ready,
    Streaming,
    Error,
    Closed,
}

pub struct SessionController {
    channel: ControlChannel,
    role: SessionRole,
    status: watch::Sender<SessionStatus>,
    last_error: RwLock<Option<String>>,
    producer: Option<ProducerController>,
    consumers: Arc<ConsumerRegistry>,
    left: AtomicBool,
}

impl std::fmt::Debug for SessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionController")
            .field("role", &self.role)
            .field("status", &*self.status.borrow())
            .field("left", &self.left)
            .finish_non_exhaustive()
    }
}

impl SessionController {
    /// Run the full join pipeline and enter steady state
    pub async fn join(
        config: ClientConfig,
        engine: Arc<dyn MediaEngine>,
        role: SessionRole,
    ) -> Result<Arc<Self>> {
        tracing::info!(?role, "joining session at {}", config.server_url);
        let (status, _) = watch::channel(SessionStatus::Connecting);

        let (channel, events) = ControlChannel::connect(&config.server_url)
            .await
            .map_err(SessionError::Channel)?;

        let pipeline = Self::join_pipeline(&config, &engine, role, &channel, &status).await;
        let (capabilities, producer, existing) = match pipeline {
            Ok(parts) => parts,
            Err(e) => {
                channel.close().await;
                return Err(e);
            }
        };

        let consumers = Arc::new(ConsumerRegistry::new(
            channel.clone(),
            engine.clone(),
            capabilities,
            config.request_timeout,
            config.connect_timeout,
        ));

        status.send_replace(SessionStatus::Ready);
        let controller = Arc::new(Self {
            channel,
            role,
            status,
            last_error: RwLock::new(None),
            producer,
            consumers,
            left: AtomicBool::new(false),
        });
        controller.spawn_event_loop(events);

        // producers that existed before we joined are announced in the
        // join reply and consumed exactly like live announcements
        if role.subscribes() {
            for info in existing {
                controller.spawn_consume(info);
            }
        }

        tracing::info!("session ready");
        Ok(controller)
    }

    async fn join_pipeline(
        config: &ClientConfig,
        engine: &Arc<dyn MediaEngine>,
        role: SessionRole,
        channel: &ControlChannel,
        status: &watch::Sender<SessionStatus>,
    ) -> Result<(
        RtpCapabilities,
        Option<ProducerController>,
        Vec<RemoteProducerInfo>,
    )> {
        let reply = channel
            .request(
                ClientMessage::Join { role },
                ResponseKind::Joined,
                CorrelationKey::Session,
                config.request_timeout,
            )
            .await?;
        let (router_caps, existing) = match reply {
            ServerMessage::Joined {
                router_rtp_capabilities,
                existing_producers,
            } => (router_rtp_capabilities, existing_producers),
            ServerMessage::Error { message, .. } => {
                return Err(SessionError::JoinRejected(message));
            }
            other => {
                return Err(SessionError::JoinRejected(format!(
                    "unexpected reply: {other:?}"
                )));
            }
        };
        status.send_replace(SessionStatus::Joined);

        status.send_replace(SessionStatus::Negotiating);
        let capabilities = CapabilityNegotiator::negotiate(engine.as_ref(), &router_caps).await?;

        let producer = if role.publishes() {
            let transport = TransportController::create(
                channel.clone(),
                engine.clone(),
                TransportDirection::Send,
                None,
                TransportTimeouts {
                    request: config.request_timeout,
                    connect: config.connect_timeout,
                },
            )
            .await?;
            // the engine raises its connect intent on creation; produce
            // requires a connected transport
            transport.wait_connected().await?;
            Some(ProducerController::new(
                channel.clone(),
                transport,
                config.request_timeout,
            ))
        } else {
            None
        };

        Ok((capabilities, producer, existing))
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Watch for status changes
    pub fn status_watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    /// Current map of remote peer streams
    pub async fn remote_streams(&self) -> std::collections::HashMap<PeerId, RemoteStream> {
        self.consumers.remote_streams().await
    }

    /// Publish local tracks over the send transport; per-track outcomes
    pub async fn publish(
        &self,
        tracks: Vec<(MediaTrack, serde_json::Value)>,
    ) -> Vec<(MediaKind, Result<ProducerId>)> {
        let Some(producer) = &self.producer else {
            return tracks
                .into_iter()
                .map(|(track, _)| (track.kind, Err(SessionError::InvalidState("publish"))))
                .collect();
        };

        let outcomes = producer.publish(tracks).await;

        if producer.transport().state() == TransportState::Failed {
            self.fail_session("send transport failed").await;
        } else if outcomes.iter().any(|(_, r)| r.is_ok()) {
            self.mark_streaming();
        }
        outcomes
    }

    /// Flip the pause state of the local producer of the given kind;
    /// returns the new paused state
    pub async fn toggle_track(&self, kind: MediaKind) -> Result<bool> {
        let Some(producer) = &self.producer else {
            return Err(SessionError::InvalidState("toggle_track"));
        };
        let paused = producer
            .is_paused(kind)
            .await
            .ok_or(SessionError::Produce {
                kind,
                reason: "no producer for this kind".to_string(),
            })?;
        producer.set_paused(kind, !paused).await?;
        Ok(!paused)
    }

    /// Stop publishing: close every producer, then the send transport
    pub async fn unpublish(&self) {
        if let Some(producer) = &self.producer {
            producer.unpublish().await;
        }
    }

    /// Leave the session; safe to call more than once
    pub async fn leave(&self) {
        if self.left.swap(true, Ordering::SeqCst) {
            tracing::debug!("leave called on an already-closed session");
            return;
        }
        tracing::info!("leaving session");
        let _ = self.channel.send(ClientMessage::Leave).await;
        self.teardown().await;
        self.channel.close().await;
        self.status.send_replace(SessionStatus::Closed);
    }

    fn spawn_event_loop(self: &Arc<Self>, mut events: mpsc::Receiver<ChannelEvent>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    ChannelEvent::Message(msg) => this.handle_event(msg).await,
                    ChannelEvent::Disconnected => {
                        if !this.left.load(Ordering::SeqCst) {
                            this.fail_session("control channel disconnected").await;
                            this.teardown().await;
                        }
                        break;
                    }
                }
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, msg: ServerMessage) {
        match msg {
            ServerMessage::NewProducer {
                producer_id,
                kind,
                peer_id,
            } => {
                if !self.role.subscribes() {
                    tracing::debug!(producer = %producer_id, "ignoring announcement, role does not subscribe");
                    return;
                }
                self.spawn_consume(RemoteProducerInfo {
                    producer_id,
                    kind,
                    peer_id,
                });
            }
            ServerMessage::ProducerClosed {
                producer_id,
                peer_id,
            } => {
                self.consumers
                    .on_remote_producer_closed(&producer_id, &peer_id)
                    .await;
            }
            ServerMessage::Error {
                message,
                transport_id,
                ..
            } => {
                let send_transport_failed = match (&transport_id, &self.producer) {
                    (Some(tid), Some(producer)) => producer.transport().id() == tid,
                    _ => false,
                };
                if send_transport_failed {
                    tracing::error!("SFU reported send transport error: {}", message);
                    self.fail_session(&message).await;
                    self.teardown().await;
                } else {
                    tracing::warn!("SFU error: {}", message);
                    *self.last_error.write().await = Some(message);
                }
            }
            other => {
                tracing::debug!("unhandled message: {:?}", other);
            }
        }
    }

    /// Consume a remote producer off the event path so announcements for
    /// distinct peers proceed concurrently
    fn spawn_consume(self: &Arc<Self>, info: RemoteProducerInfo) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.consumers.on_new_remote_producer(info.clone()).await {
                // a benign no-op consume (producer gone before we got to
                // it) is Ok but adds no consumer and starts no stream
                Ok(()) => {
                    if this.consumers.consumer_count(&info.peer_id).await > 0 {
                        this.mark_streaming();
                    }
                }
                Err(e) => {
                    // contained: one peer's consume failure never takes
                    // the session down
                    tracing::warn!(peer = %info.peer_id, "consume failed: {}", e);
                    *this.last_error.write().await =
                        Some(format!("peer {}: {}", info.peer_id, e));
                }
            }
        });
    }

    fn mark_streaming(&self) {
        self.status.send_if_modified(|s| {
            if *s == SessionStatus::Ready {
                tracing::info!("session streaming");
                *s = SessionStatus::Streaming;
                true
            } else {
                false
            }
        });
    }

    async fn fail_session(&self, reason: &str) {
        *self.last_error.write().await = Some(reason.to_string());
        self.status.send_if_modified(|s| {
            if matches!(*s, SessionStatus::Closed | SessionStatus::Error) {
                false
            } else {
                tracing::error!("session failed: {}", reason);
                *s = SessionStatus::Error;
                true
            }
        });
    }

    async fn teardown(&self) {
        if let Some(producer) = &self.producer {
            producer.unpublish().await;
        }
        self.consumers.clear().await;
    }
}
