//! Shared protocol definitions for Roomcast
//!
//! Wire messages exchanged between a client and the SFU over the control
//! channel, plus the media/session types they carry.

mod messages;
mod types;

pub use messages::{ClientMessage, ServerMessage};
pub use types::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ParseMediaKindError,
    PeerId, ProducerId, RemoteProducerInfo, RtpCapabilities, RtpCodecCapability, RtpParameters,
    SessionRole, TransportDirection, TransportId,
};
