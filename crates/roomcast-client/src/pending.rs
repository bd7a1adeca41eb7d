//! Correlation of inbound replies to in-flight requests
//!
//! The control channel is a single ordered stream carrying replies to
//! several independently issued requests, so "next message of kind X" is
//! not a sound matching rule: two receive transports connecting at the
//! same time both expect a `transport_connected`. Every request that
//! expects a reply registers here under the most specific identifying
//! field its reply will carry, and an inbound message is offered to the
//! table before it is dispatched as an unsolicited event.

use std::collections::HashMap;
use std::sync::Mutex;

use roomcast_protocol::{
    ConsumerId, MediaKind, PeerId, ProducerId, ServerMessage, TransportDirection, TransportId,
};
use tokio::sync::oneshot;

/// The server message kind a pending request is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Joined,
    TransportCreated,
    TransportConnected,
    Produced,
    ConsumerCreated,
    ConsumerResumed,
    ProducerPaused,
    ProducerResumed,
}

/// The identifying field used to tell concurrent requests of the same
/// kind apart
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CorrelationKey {
    /// One join per connection
    Session,
    /// `create_transport`: the reply names direction and peer
    Endpoint(TransportDirection, Option<PeerId>),
    /// `connect_transport`: the reply names the transport
    Transport(TransportId),
    /// `produce`: the reply names transport and kind
    Producing(TransportId, MediaKind),
    /// `consume`: the reply names the producer being consumed
    Consuming(ProducerId),
    /// `pause_producer` / `resume_producer`
    Producer(ProducerId),
    /// `resume`: the reply names the consumer
    Consumer(ConsumerId),
}

impl CorrelationKey {
    fn references_transport(&self, id: &TransportId) -> bool {
        match self {
            CorrelationKey::Transport(t) | CorrelationKey::Producing(t, _) => t == id,
            _ => false,
        }
    }

    fn references_producer(&self, id: &ProducerId) -> bool {
        match self {
            CorrelationKey::Consuming(p) | CorrelationKey::Producer(p) => p == id,
            _ => false,
        }
    }
}

/// Derives the table key an inbound message resolves, when it is a reply
/// kind at all
fn reply_key(msg: &ServerMessage) -> Option<(ResponseKind, CorrelationKey)> {
    match msg {
        ServerMessage::Joined { .. } => Some((ResponseKind::Joined, CorrelationKey::Session)),
        ServerMessage::TransportCreated {
            direction, peer_id, ..
        } => Some((
            ResponseKind::TransportCreated,
            CorrelationKey::Endpoint(*direction, peer_id.clone()),
        )),
        ServerMessage::TransportConnected { transport_id } => Some((
            ResponseKind::TransportConnected,
            CorrelationKey::Transport(transport_id.clone()),
        )),
        ServerMessage::Produced {
            transport_id, kind, ..
        } => Some((
            ResponseKind::Produced,
            CorrelationKey::Producing(transport_id.clone(), *kind),
        )),
        ServerMessage::ConsumerCreated { producer_id, .. } => Some((
            ResponseKind::ConsumerCreated,
            CorrelationKey::Consuming(producer_id.clone()),
        )),
        ServerMessage::ConsumerResumed { consumer_id } => Some((
            ResponseKind::ConsumerResumed,
            CorrelationKey::Consumer(consumer_id.clone()),
        )),
        ServerMessage::ProducerPaused { producer_id } => Some((
            ResponseKind::ProducerPaused,
            CorrelationKey::Producer(producer_id.clone()),
        )),
        ServerMessage::ProducerResumed { producer_id } => Some((
            ResponseKind::ProducerResumed,
            CorrelationKey::Producer(producer_id.clone()),
        )),
        _ => None,
    }
}

/// Table of requests awaiting their reply
///
/// Every entry is removed exactly once: when its reply (or a scoped error)
/// arrives, when the requester gives up, or when the channel closes.
#[derive(Default)]
pub(crate) struct PendingRequestRegistry {
    entries: Mutex<HashMap<(ResponseKind, CorrelationKey), oneshot::Sender<ServerMessage>>>,
}

impl PendingRequestRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an in-flight request and get the receiver its reply will
    /// be delivered on
    pub(crate) fn register(
        &self,
        kind: ResponseKind,
        key: CorrelationKey,
    ) -> oneshot::Receiver<ServerMessage> {
        let (tx, rx) = oneshot::channel();
        let mut entries = self.entries.lock().expect("pending table poisoned");
        if entries.insert((kind, key.clone()), tx).is_some() {
            // the displaced waiter's receiver fails; callers keep at most
            // one request per key in flight, so this indicates a bug
            tracing::warn!(?kind, ?key, "replaced an in-flight request with the same key");
        }
        rx
    }

    /// Drop an entry after the requester stopped waiting for it
    pub(crate) fn abandon(&self, kind: ResponseKind, key: &CorrelationKey) {
        let mut entries = self.entries.lock().expect("pending table poisoned");
        entries.remove(&(kind, key.clone()));
    }

    /// Offer an inbound message to the table
    ///
    /// Returns `None` when a waiter consumed it, or gives the message back
    /// for unsolicited-event dispatch. Scoped server errors resolve every
    /// entry that references the failed transport or producer, so no
    /// request keeps waiting for a reply that will never come.
    pub(crate) fn resolve(&self, msg: ServerMessage) -> Option<ServerMessage> {
        if let Some(key) = reply_key(&msg) {
            let waiter = {
                let mut entries = self.entries.lock().expect("pending table poisoned");
                entries.remove(&key)
            };
            return match waiter {
                Some(tx) => {
                    // a dropped receiver means the requester timed out
                    // between delivery and removal; nothing to do
                    let _ = tx.send(msg);
                    None
                }
                None => Some(msg),
            };
        }

        if let ServerMessage::Error {
            transport_id,
            producer_id,
            ..
        } = &msg
        {
            let waiters: Vec<_> = {
                let mut entries = self.entries.lock().expect("pending table poisoned");
                // most specific scope wins: producer, then transport. An
                // unscoped error can only concern an exchange whose subject
                // has no id yet, so it fails pending joins and creates
                let keys: Vec<_> = entries
                    .keys()
                    .filter(|(_, key)| match (producer_id, transport_id) {
                        (Some(p), _) => key.references_producer(p),
                        (None, Some(t)) => key.references_transport(t),
                        (None, None) => matches!(
                            key,
                            CorrelationKey::Session | CorrelationKey::Endpoint(..)
                        ),
                    })
                    .cloned()
                    .collect();
                keys.into_iter()
                    .filter_map(|key| entries.remove(&key))
                    .collect()
            };
            if !waiters.is_empty() {
                for tx in waiters {
                    let _ = tx.send(msg.clone());
                }
                return None;
            }
        }

        Some(msg)
    }

    /// Fail every outstanding request; their receivers observe the drop
    /// as a closed channel
    pub(crate) fn fail_all(&self) {
        let mut entries = self.entries.lock().expect("pending table poisoned");
        let count = entries.len();
        entries.clear();
        if count > 0 {
            tracing::debug!("failed {} pending requests on channel close", count);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().expect("pending table poisoned").len()
    }
}
