//! Remote media subscription
//!
//! One receive transport per remote peer, one consumer per remote
//! producer, aggregated into a `RemoteStream` per peer. Consumers are
//! created paused and only count as live after the resume handshake.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use roomcast_protocol::{
    ClientMessage, ConsumerId, MediaKind, PeerId, ProducerId, RemoteProducerInfo, RtpCapabilities,
    ServerMessage, TransportDirection,
};
use tokio::sync::{OnceCell, RwLock};

use crate::channel::ControlChannel;
use crate::engine::{ConsumeOptions, EngineConsumer, MediaEngine, MediaTrack};
use crate::error::{Result, SessionError};
use crate::pending::{CorrelationKey, ResponseKind};
use crate::transport::{TransportController, TransportState, TransportTimeouts};

/// One remotely subscribed track
pub struct Consumer {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
    engine_consumer: Arc<dyn EngineConsumer>,
    live: bool,
}

/// A peer's consumers aggregated into one playable unit
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub peer_id: PeerId,
    pub consumer_ids: Vec<ConsumerId>,
    pub tracks: Vec<MediaTrack>,
}

/// Per-peer state; the transport cell guarantees at most one receive
/// transport per peer even when announcements overlap
struct PeerEntry {
    transport: OnceCell<Arc<TransportController>>,
    consumers: RwLock<HashMap<ConsumerId, Consumer>>,
}

impl PeerEntry {
    fn new() -> Self {
        Self {
            transport: OnceCell::new(),
            consumers: RwLock::new(HashMap::new()),
        }
    }
}

/// Consume attempts are marked in `active` before their first await; a
/// producer closure landing inside that window is recorded in `closed`
/// and settled once the consume returns
#[derive(Default)]
struct InflightConsumes {
    active: HashSet<ProducerId>,
    closed: HashSet<ProducerId>,
}

pub struct ConsumerRegistry {
    channel: ControlChannel,
    engine: Arc<dyn MediaEngine>,
    capabilities: RtpCapabilities,
    peers: RwLock<HashMap<PeerId, Arc<PeerEntry>>>,
    inflight: Mutex<InflightConsumes>,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl ConsumerRegistry {
    pub(crate) fn new(
        channel: ControlChannel,
        engine: Arc<dyn MediaEngine>,
        capabilities: RtpCapabilities,
        request_timeout: Duration,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            channel,
            engine,
            capabilities,
            peers: RwLock::new(HashMap::new()),
            inflight: Mutex::new(InflightConsumes::default()),
            request_timeout,
            connect_timeout,
        }
    }

    /// React to a newly announced remote producer: ensure the peer's
    /// receive transport, consume, and run the resume handshake
    pub async fn on_new_remote_producer(&self, info: RemoteProducerInfo) -> Result<()> {
        if self.is_consuming(&info.producer_id).await {
            tracing::debug!(producer = %info.producer_id, "already consuming, ignoring announcement");
            return Ok(());
        }
        {
            let mut inflight = self.inflight.lock().expect("inflight set poisoned");
            if !inflight.active.insert(info.producer_id.clone()) {
                tracing::debug!(producer = %info.producer_id, "consume already in flight");
                return Ok(());
            }
        }

        let result = self.consume(&info).await;

        // removing the mark and reading the closure record must be one
        // step, or a closure could land between them unobserved
        let closed_mid_consume = {
            let mut inflight = self.inflight.lock().expect("inflight set poisoned");
            inflight.active.remove(&info.producer_id);
            inflight.closed.remove(&info.producer_id)
        };
        if closed_mid_consume {
            tracing::debug!(
                producer = %info.producer_id,
                "producer closed during consume, discarding consumer"
            );
            self.remove_consumer(&info.producer_id, &info.peer_id).await;
        }
        // a consume that added no consumer (failure or benign race) must
        // not leave behind a peer entry with an idle receive transport
        self.drop_peer_if_empty(&info.peer_id).await;
        result
    }

    async fn consume(&self, info: &RemoteProducerInfo) -> Result<()> {
        let entry = self.ensure_peer(&info.peer_id).await;

        let transport = entry
            .transport
            .get_or_try_init(|| {
                TransportController::create(
                    self.channel.clone(),
                    self.engine.clone(),
                    TransportDirection::Recv,
                    Some(info.peer_id.clone()),
                    TransportTimeouts {
                        request: self.request_timeout,
                        connect: self.connect_timeout,
                    },
                )
            })
            .await?
            .clone();

        let reply = self
            .channel
            .request(
                ClientMessage::Consume {
                    transport_id: transport.id().clone(),
                    producer_id: info.producer_id.clone(),
                    rtp_capabilities: self.capabilities.clone(),
                },
                ResponseKind::ConsumerCreated,
                CorrelationKey::Consuming(info.producer_id.clone()),
                self.request_timeout,
            )
            .await
            .map_err(|e| SessionError::Consume {
                producer_id: info.producer_id.clone(),
                reason: e.to_string(),
            })?;

        let options = match reply {
            ServerMessage::ConsumerCreated {
                id,
                producer_id,
                kind,
                rtp_parameters,
                ..
            } => ConsumeOptions {
                id,
                producer_id,
                kind,
                rtp_parameters,
            },
            ServerMessage::Error { message, .. } => {
                // the producer may have closed between the announcement
                // and our consume; that is not an error
                if producer_already_gone(&message) {
                    tracing::debug!(
                        producer = %info.producer_id,
                        "producer gone before consume completed: {}",
                        message
                    );
                    return Ok(());
                }
                return Err(SessionError::Consume {
                    producer_id: info.producer_id.clone(),
                    reason: message,
                });
            }
            other => {
                return Err(SessionError::Consume {
                    producer_id: info.producer_id.clone(),
                    reason: format!("unexpected reply: {other:?}"),
                });
            }
        };
        let consumer_id = options.id.clone();

        let engine_consumer = transport.engine_transport().consume(options).await.map_err(|e| {
            SessionError::Consume {
                producer_id: info.producer_id.clone(),
                reason: e.to_string(),
            }
        })?;

        entry.consumers.write().await.insert(
            consumer_id.clone(),
            Consumer {
                id: consumer_id.clone(),
                producer_id: info.producer_id.clone(),
                kind: info.kind,
                peer_id: info.peer_id.clone(),
                engine_consumer: engine_consumer.clone(),
                live: false,
            },
        );

        // the peer may have been torn down while the consume was in
        // flight; do not leak the consumer into an orphaned entry
        let still_registered = self
            .peers
            .read()
            .await
            .get(&info.peer_id)
            .map(|current| Arc::ptr_eq(current, &entry))
            .unwrap_or(false);
        if !still_registered {
            tracing::debug!(peer = %info.peer_id, "peer torn down mid-consume, discarding consumer");
            entry.consumers.write().await.remove(&consumer_id);
            engine_consumer.close().await;
            return Ok(());
        }

        tracing::info!(
            consumer = %consumer_id,
            producer = %info.producer_id,
            peer = %info.peer_id,
            kind = %info.kind,
            "consumer created"
        );

        self.resume_consumer(&entry, &consumer_id, info).await
    }

    /// Consumers start paused so no packets flow before we are ready;
    /// only the SFU's ack makes one live
    async fn resume_consumer(
        &self,
        entry: &Arc<PeerEntry>,
        consumer_id: &ConsumerId,
        info: &RemoteProducerInfo,
    ) -> Result<()> {
        let reply = self
            .channel
            .request(
                ClientMessage::Resume {
                    consumer_id: consumer_id.clone(),
                },
                ResponseKind::ConsumerResumed,
                CorrelationKey::Consumer(consumer_id.clone()),
                self.request_timeout,
            )
            .await;

        let failure = match reply {
            Ok(ServerMessage::ConsumerResumed { .. }) => None,
            Ok(ServerMessage::Error { message, .. }) => Some(message),
            Ok(other) => Some(format!("unexpected reply: {other:?}")),
            Err(e) => Some(e.to_string()),
        };

        if let Some(reason) = failure {
            // a consumer that never went live is removed, not kept half-open
            if let Some(consumer) = entry.consumers.write().await.remove(consumer_id) {
                consumer.engine_consumer.close().await;
            }
            return Err(SessionError::Consume {
                producer_id: info.producer_id.clone(),
                reason,
            });
        }

        let mut consumers = entry.consumers.write().await;
        if let Some(consumer) = consumers.get_mut(consumer_id) {
            consumer.engine_consumer.resume().await;
            consumer.live = true;
            tracing::info!(consumer = %consumer_id, peer = %info.peer_id, "consumer live");
        }
        Ok(())
    }

    /// React to a remote producer closing: drop its consumer and, when the
    /// peer has none left, the peer's stream and receive transport
    ///
    /// The closure can also arrive while the consume for that producer is
    /// still in flight; it is then recorded and the consumer discarded the
    /// moment the consume returns, never left live.
    pub async fn on_remote_producer_closed(&self, producer_id: &ProducerId, peer_id: &PeerId) {
        if self.remove_consumer(producer_id, peer_id).await {
            self.drop_peer_if_empty(peer_id).await;
            return;
        }

        let deferred = {
            let mut inflight = self.inflight.lock().expect("inflight set poisoned");
            if inflight.active.contains(producer_id) {
                inflight.closed.insert(producer_id.clone());
                true
            } else {
                false
            }
        };
        if deferred {
            tracing::debug!(producer = %producer_id, "producer closed while its consume is in flight");
            return;
        }

        // the consume may have finished between the two checks
        if self.remove_consumer(producer_id, peer_id).await {
            self.drop_peer_if_empty(peer_id).await;
        } else {
            tracing::debug!(producer = %producer_id, peer = %peer_id, "no consumer for closed producer");
        }
    }

    async fn remove_consumer(&self, producer_id: &ProducerId, peer_id: &PeerId) -> bool {
        let Some(entry) = self.peers.read().await.get(peer_id).cloned() else {
            return false;
        };
        let removed = {
            let mut consumers = entry.consumers.write().await;
            let id = consumers
                .values()
                .find(|c| &c.producer_id == producer_id)
                .map(|c| c.id.clone());
            id.and_then(|id| consumers.remove(&id))
        };
        let Some(consumer) = removed else {
            return false;
        };
        consumer.engine_consumer.close().await;
        tracing::info!(consumer = %consumer.id, producer = %producer_id, peer = %peer_id, "consumer closed");
        true
    }

    /// Close every consumer and receive transport
    pub async fn clear(&self) {
        let peers: Vec<(PeerId, Arc<PeerEntry>)> =
            self.peers.write().await.drain().collect();
        for (peer_id, entry) in peers {
            let consumers: Vec<Consumer> = entry
                .consumers
                .write()
                .await
                .drain()
                .map(|(_, c)| c)
                .collect();
            for consumer in consumers {
                consumer.engine_consumer.close().await;
            }
            if let Some(transport) = entry.transport.get() {
                transport.close().await;
            }
            tracing::info!(peer = %peer_id, "remote stream cleared");
        }
    }

    /// Current per-peer streams
    pub async fn remote_streams(&self) -> HashMap<PeerId, RemoteStream> {
        let peers = self.peers.read().await;
        let mut streams = HashMap::with_capacity(peers.len());
        for (peer_id, entry) in peers.iter() {
            let consumers = entry.consumers.read().await;
            // consumers start paused; only ones whose resume the SFU acked
            // are part of the visible stream
            let live: Vec<&Consumer> = consumers.values().filter(|c| c.live).collect();
            if live.is_empty() {
                continue;
            }
            streams.insert(
                peer_id.clone(),
                RemoteStream {
                    peer_id: peer_id.clone(),
                    consumer_ids: live.iter().map(|c| c.id.clone()).collect(),
                    tracks: live.iter().map(|c| c.engine_consumer.track()).collect(),
                },
            );
        }
        streams
    }

    pub async fn consumer_count(&self, peer_id: &PeerId) -> usize {
        match self.peers.read().await.get(peer_id) {
            Some(entry) => entry.consumers.read().await.len(),
            None => 0,
        }
    }

    /// State of a peer's receive transport, when one exists
    pub async fn transport_state(&self, peer_id: &PeerId) -> Option<TransportState> {
        let entry = self.peers.read().await.get(peer_id).cloned()?;
        entry.transport.get().map(|t| t.state())
    }

    async fn is_consuming(&self, producer_id: &ProducerId) -> bool {
        let peers = self.peers.read().await;
        for entry in peers.values() {
            let consumers = entry.consumers.read().await;
            if consumers.values().any(|c| &c.producer_id == producer_id) {
                return true;
            }
        }
        false
    }

    async fn ensure_peer(&self, peer_id: &PeerId) -> Arc<PeerEntry> {
        let mut peers = self.peers.write().await;
        peers
            .entry(peer_id.clone())
            .or_insert_with(|| Arc::new(PeerEntry::new()))
            .clone()
    }

    /// A receive transport has no purpose with zero consumers
    async fn drop_peer_if_empty(&self, peer_id: &PeerId) {
        let entry = {
            let mut peers = self.peers.write().await;
            let Some(entry) = peers.get(peer_id) else {
                return;
            };
            if !entry.consumers.read().await.is_empty() {
                return;
            }
            peers.remove(peer_id)
        };
        if let Some(entry) = entry {
            if let Some(transport) = entry.transport.get() {
                transport.close().await;
            }
            tracing::info!(peer = %peer_id, "remote stream destroyed");
        }
    }
}

fn producer_already_gone(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unknown producer") || lower.contains("producer not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gone_producer_errors_are_recognized() {
        assert!(producer_already_gone("Unknown producer p1"));
        assert!(producer_already_gone("producer not found"));
        assert!(!producer_already_gone("transport congested"));
    }
}
