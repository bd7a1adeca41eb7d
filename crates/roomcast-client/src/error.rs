use std::time::Duration;

use roomcast_protocol::{MediaKind, ProducerId, TransportId};
use thiserror::Error;

use crate::pending::ResponseKind;

/// Errors raised by the control channel itself
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to reach the SFU: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("control channel closed")]
    Closed,

    #[error("request timed out waiting for {0:?}")]
    RequestTimeout(ResponseKind),
}

/// Errors surfaced by the session, transport, producer and consumer
/// controllers
///
/// Per-track and per-peer variants (`Produce`, `Consume`) are contained by
/// the session and never abort it; everything else is session-fatal when it
/// hits the send path, the negotiator, or the channel.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("join rejected by the SFU: {0}")]
    JoinRejected(String),

    #[error("no local codec matches the router capabilities")]
    UnsupportedRouter,

    #[error("failed to load local capabilities: {0}")]
    CapabilityLoadFailed(String),

    #[error("transport create failed: {0}")]
    TransportCreate(String),

    #[error("transport {0} did not connect within {1:?}")]
    ConnectTimeout(TransportId, Duration),

    #[error("transport {0} failed")]
    TransportFailed(TransportId),

    #[error("produce failed for {kind}: {reason}")]
    Produce { kind: MediaKind, reason: String },

    #[error("consume failed for producer {producer_id}: {reason}")]
    Consume {
        producer_id: ProducerId,
        reason: String,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("session state does not allow {0}")]
    InvalidState(&'static str),
}

pub type Result<T> = std::result::Result<T, SessionError>;
