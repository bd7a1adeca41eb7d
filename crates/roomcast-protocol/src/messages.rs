use serde::{Deserialize, Serialize};

use crate::types::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, PeerId, ProducerId,
    RemoteProducerInfo, RtpCapabilities, RtpParameters, SessionRole, TransportDirection,
    TransportId,
};

/// Messages sent from client to SFU over the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join the session with the given role
    Join { role: SessionRole },

    /// Request a new transport for the given direction
    ///
    /// `peer_id` is set for receive transports and names the remote
    /// participant whose media will flow over it.
    CreateTransport {
        direction: TransportDirection,
        #[serde(skip_serializing_if = "Option::is_none")]
        peer_id: Option<PeerId>,
    },

    /// Forward locally gathered DTLS parameters for a created transport
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },

    /// Publish one local track over a send transport
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },

    /// Subscribe to a remote producer over a receive transport
    Consume {
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },

    /// Unpause a consumer that was created paused
    Resume { consumer_id: ConsumerId },

    /// Pause a local producer server-side
    PauseProducer { producer_id: ProducerId },

    /// Resume a paused local producer server-side
    ResumeProducer { producer_id: ProducerId },

    /// Leave the session
    Leave,
}

/// Messages sent from SFU to client over the control channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Join accepted; carries router capabilities and producers that
    /// already existed when this client joined
    Joined {
        router_rtp_capabilities: RtpCapabilities,
        #[serde(default)]
        existing_producers: Vec<RemoteProducerInfo>,
    },

    /// Reply to `CreateTransport`
    TransportCreated {
        id: TransportId,
        direction: TransportDirection,
        ice_parameters: IceParameters,
        #[serde(default)]
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
        #[serde(default)]
        peer_id: Option<PeerId>,
    },

    /// Reply to `ConnectTransport`
    TransportConnected { transport_id: TransportId },

    /// Reply to `Produce`; the server-assigned producer id is used for
    /// all subsequent pause/resume/close correlation
    Produced {
        producer_id: ProducerId,
        transport_id: TransportId,
        kind: MediaKind,
    },

    /// Reply to `Consume`
    ConsumerCreated {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        peer_id: PeerId,
        transport_id: TransportId,
    },

    /// Reply to `Resume`
    ConsumerResumed { consumer_id: ConsumerId },

    /// Reply to `PauseProducer`
    ProducerPaused { producer_id: ProducerId },

    /// Reply to `ResumeProducer`
    ProducerResumed { producer_id: ProducerId },

    /// A remote participant started publishing
    NewProducer {
        producer_id: ProducerId,
        kind: MediaKind,
        peer_id: PeerId,
    },

    /// A remote producer went away
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },

    /// Server-side error, scoped to a transport or producer when one is
    /// involved
    Error {
        message: String,
        #[serde(default)]
        transport_id: Option<TransportId>,
        #[serde(default)]
        producer_id: Option<ProducerId>,
    },
}
