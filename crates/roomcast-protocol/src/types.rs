use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

string_id!(
    /// SFU-assigned transport identifier, immutable once set
    TransportId
);
string_id!(
    /// SFU-assigned producer identifier
    ProducerId
);
string_id!(
    /// SFU-assigned consumer identifier
    ConsumerId
);
string_id!(
    /// Identifier of a remote participant
    PeerId
);

/// What a participant intends to do in the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    /// Publishes local media only
    Publisher,
    /// Consumes remote media only
    Subscriber,
    /// Publishes and consumes
    Participant,
}

impl SessionRole {
    pub fn publishes(&self) -> bool {
        matches!(self, SessionRole::Publisher | SessionRole::Participant)
    }

    pub fn subscribes(&self) -> bool {
        matches!(self, SessionRole::Subscriber | SessionRole::Participant)
    }
}

/// Media kind of a track, producer, or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown media kind: {0}")]
pub struct ParseMediaKindError(String);

impl FromStr for MediaKind {
    type Err = ParseMediaKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "audio" => Ok(MediaKind::Audio),
            "video" => Ok(MediaKind::Video),
            other => Err(ParseMediaKindError(other.to_string())),
        }
    }
}

/// Direction of media flow on a transport, from the client's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

/// One codec the router or client can handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default)]
    pub channels: u16,
    /// Codec-specific parameters (fmtp-style), passed through opaquely
    #[serde(default)]
    pub parameters: serde_json::Value,
}

/// The set of codecs a router or client supports
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    /// Header extensions, opaque to the session layer
    #[serde(default)]
    pub header_extensions: serde_json::Value,
}

/// Negotiated per-stream RTP parameters, opaque to the session layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// DTLS handshake parameters, opaque to the session layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// ICE parameters for a transport, opaque to the session layer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceParameters(pub serde_json::Value);

/// One ICE candidate, opaque to the session layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

/// A remote producer the client may consume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProducerInfo {
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub peer_id: PeerId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_kind_round_trips_through_str() {
        assert_eq!("video".parse::<MediaKind>().unwrap(), MediaKind::Video);
        assert_eq!(MediaKind::Audio.to_string(), "audio");
        assert!("screen".parse::<MediaKind>().is_err());
    }

    #[test]
    fn role_capability_split() {
        assert!(SessionRole::Publisher.publishes());
        assert!(!SessionRole::Publisher.subscribes());
        assert!(SessionRole::Participant.publishes());
        assert!(SessionRole::Participant.subscribes());
    }

    #[test]
    fn transport_id_serializes_transparently() {
        let id = TransportId::new("t1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"t1\"");
    }
}
