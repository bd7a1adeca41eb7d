//! Media engine abstraction
//!
//! The session layer never touches ICE, DTLS, or RTP itself; everything
//! below the signaling protocol is delegated to an engine implementing
//! these traits. The engine raises intents (connect, produce) that need a
//! signaling exchange before the engine-side operation can complete; the
//! transport controller services them and reports back through the
//! intent's completion channel.

use async_trait::async_trait;
use roomcast_protocol::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ProducerId,
    RtpCapabilities, RtpParameters, TransportId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Error raised by the media engine collaborator
#[derive(Debug, Clone, thiserror::Error)]
#[error("media engine: {0}")]
pub struct EngineError(String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// A live media track held by the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaTrack {
    pub id: String,
    pub kind: MediaKind,
}

impl MediaTrack {
    /// A fresh local track handle
    pub fn new(kind: MediaKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
        }
    }
}

/// Parameters handed to the engine when instantiating a transport,
/// straight from the `transport_created` reply
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Parameters for an engine-side consume, straight from the
/// `consumer_created` reply
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// An engine operation that needs a signaling exchange to complete
pub enum TransportIntent {
    /// The engine gathered DTLS parameters and wants the transport
    /// connected; ack only after the SFU confirms
    Connect {
        dtls_parameters: DtlsParameters,
        done: oneshot::Sender<Result<(), EngineError>>,
    },
    /// The engine prepared a local track and needs the server-assigned
    /// producer id
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        done: oneshot::Sender<Result<ProducerId, EngineError>>,
    },
}

/// Capability-negotiating media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load local capabilities against the router's; must succeed before
    /// any transport is created
    async fn load_capabilities(
        &self,
        router: &RtpCapabilities,
    ) -> Result<RtpCapabilities, EngineError>;

    async fn create_send_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;

    async fn create_recv_transport(
        &self,
        options: TransportOptions,
    ) -> Result<Arc<dyn MediaTransport>, EngineError>;
}

/// One engine-level transport, one direction
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &TransportId;

    /// Hand over the intent stream; yields `Some` exactly once
    fn take_intents(&self) -> Option<mpsc::UnboundedReceiver<TransportIntent>>;

    /// Begin publishing a local track; resolves once the produce intent
    /// completed its signaling exchange
    async fn produce(
        &self,
        track: MediaTrack,
        encodings: serde_json::Value,
    ) -> Result<Arc<dyn EngineProducer>, EngineError>;

    /// Instantiate a consumer for a remote producer
    async fn consume(&self, options: ConsumeOptions) -> Result<Arc<dyn EngineConsumer>, EngineError>;

    async fn close(&self);
}

/// Engine handle for one published track
#[async_trait]
pub trait EngineProducer: Send + Sync {
    fn id(&self) -> &ProducerId;
    fn kind(&self) -> MediaKind;
    async fn set_paused(&self, paused: bool);
    async fn close(&self);
}

/// Engine handle for one subscribed track; created paused
#[async_trait]
pub trait EngineConsumer: Send + Sync {
    fn id(&self) -> &ConsumerId;
    fn kind(&self) -> MediaKind;
    fn track(&self) -> MediaTrack;
    async fn resume(&self);
    async fn close(&self);
}
