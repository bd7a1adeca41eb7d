//! Local media publication
//!
//! Owns the send transport and one producer slot per media kind. Track
//! publication failures are isolated: one track failing to produce never
//! tears down its siblings.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomcast_protocol::{ClientMessage, MediaKind, ProducerId, ServerMessage};
use tokio::sync::RwLock;

use crate::channel::ControlChannel;
use crate::engine::{EngineProducer, MediaTrack};
use crate::error::{Result, SessionError};
use crate::pending::{CorrelationKey, ResponseKind};
use crate::transport::{TransportController, TransportState};

/// One published local track
pub struct Producer {
    pub id: ProducerId,
    pub kind: MediaKind,
    pub track_id: String,
    engine_producer: Arc<dyn EngineProducer>,
    paused: bool,
}

pub struct ProducerController {
    channel: ControlChannel,
    transport: Arc<TransportController>,
    producers: RwLock<HashMap<MediaKind, Producer>>,
    /// Kinds with a produce in flight, reserved before the first await
    pending_kinds: Mutex<HashSet<MediaKind>>,
    request_timeout: Duration,
}

impl ProducerController {
    pub(crate) fn new(
        channel: ControlChannel,
        transport: Arc<TransportController>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            transport,
            producers: RwLock::new(HashMap::new()),
            pending_kinds: Mutex::new(HashSet::new()),
            request_timeout,
        }
    }

    pub fn transport(&self) -> &Arc<TransportController> {
        &self.transport
    }

    /// Publish local tracks; each track succeeds or fails independently
    pub async fn publish(
        &self,
        tracks: Vec<(MediaTrack, serde_json::Value)>,
    ) -> Vec<(MediaKind, Result<ProducerId>)> {
        let mut outcomes = Vec::with_capacity(tracks.len());

        if self.transport.state() != TransportState::Connected {
            for (track, _) in tracks {
                outcomes.push((track.kind, Err(SessionError::InvalidState("publish"))));
            }
            return outcomes;
        }

        for (track, encodings) in tracks {
            let kind = track.kind;
            match self.produce_track(track, encodings).await {
                Ok(id) => outcomes.push((kind, Ok(id))),
                Err(e) => {
                    tracing::warn!(%kind, "track publication failed: {}", e);
                    outcomes.push((kind, Err(e)));
                }
            }
        }
        outcomes
    }

    async fn produce_track(
        &self,
        track: MediaTrack,
        encodings: serde_json::Value,
    ) -> Result<ProducerId> {
        let kind = track.kind;
        // reserve the kind before the first await; concurrent publishes of
        // the same kind must fail, not race into duplicate produces
        {
            let mut pending = self.pending_kinds.lock().expect("pending kinds poisoned");
            if !pending.insert(kind) {
                return Err(SessionError::Produce {
                    kind,
                    reason: "already publishing this kind".to_string(),
                });
            }
        }
        let result = self.produce_reserved(track, encodings).await;
        self.pending_kinds
            .lock()
            .expect("pending kinds poisoned")
            .remove(&kind);
        result
    }

    async fn produce_reserved(
        &self,
        track: MediaTrack,
        encodings: serde_json::Value,
    ) -> Result<ProducerId> {
        let kind = track.kind;
        if self.producers.read().await.contains_key(&kind) {
            return Err(SessionError::Produce {
                kind,
                reason: "already publishing this kind".to_string(),
            });
        }

        let track_id = track.id.clone();
        let engine_producer = self
            .transport
            .engine_transport()
            .produce(track, encodings)
            .await
            .map_err(|e| SessionError::Produce {
                kind,
                reason: e.to_string(),
            })?;

        let id = engine_producer.id().clone();
        self.producers.write().await.insert(
            kind,
            Producer {
                id: id.clone(),
                kind,
                track_id,
                engine_producer,
                paused: false,
            },
        );
        tracing::info!(producer = %id, %kind, "publishing");
        Ok(id)
    }

    /// Pause or resume the producer of the given kind, engine-side and
    /// server-side; failures are contained to this track
    pub async fn set_paused(&self, kind: MediaKind, paused: bool) -> Result<()> {
        let (id, engine_producer) = {
            let producers = self.producers.read().await;
            let producer = producers.get(&kind).ok_or(SessionError::Produce {
                kind,
                reason: "no producer for this kind".to_string(),
            })?;
            (producer.id.clone(), producer.engine_producer.clone())
        };

        engine_producer.set_paused(paused).await;

        let (msg, expected) = if paused {
            (
                ClientMessage::PauseProducer {
                    producer_id: id.clone(),
                },
                ResponseKind::ProducerPaused,
            )
        } else {
            (
                ClientMessage::ResumeProducer {
                    producer_id: id.clone(),
                },
                ResponseKind::ProducerResumed,
            )
        };

        let reply = self
            .channel
            .request(
                msg,
                expected,
                CorrelationKey::Producer(id.clone()),
                self.request_timeout,
            )
            .await?;
        match reply {
            ServerMessage::ProducerPaused { .. } | ServerMessage::ProducerResumed { .. } => {
                if let Some(producer) = self.producers.write().await.get_mut(&kind) {
                    producer.paused = paused;
                }
                tracing::info!(producer = %id, %kind, paused, "producer pause state changed");
                Ok(())
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

    pub async fn is_paused(&self, kind: MediaKind) -> Option<bool> {
        self.producers.read().await.get(&kind).map(|p| p.paused)
    }

    /// Close every producer, then the send transport
    pub async fn unpublish(&self) {
        let producers: Vec<Producer> = {
            let mut map = self.producers.write().await;
            map.drain().map(|(_, p)| p).collect()
        };
        for producer in producers {
            producer.engine_producer.close().await;
            tracing::info!(producer = %producer.id, kind = %producer.kind, "producer closed");
        }
        self.transport.close().await;
    }
}
