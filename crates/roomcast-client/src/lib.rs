//! Roomcast client
//!
//! A client-side session controller for an SFU-routed media session. It
//! speaks the signaling protocol over one WebSocket control channel,
//! correlates interleaved replies to their in-flight requests, and drives
//! the independent lifecycles of transports, producers, and consumers.
//! The media engine itself (ICE/DTLS/RTP) is a collaborator behind the
//! [`MediaEngine`] trait.

mod capabilities;
mod channel;
mod config;
mod consumer;
mod engine;
mod error;
mod pending;
mod producer;
mod session;
mod transport;

pub use capabilities::CapabilityNegotiator;
pub use channel::{ChannelEvent, ControlChannel};
pub use config::{ClientConfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT};
pub use consumer::{Consumer, ConsumerRegistry, RemoteStream};
pub use engine::{
    ConsumeOptions, EngineConsumer, EngineError, EngineProducer, MediaEngine, MediaTrack,
    MediaTransport, TransportIntent, TransportOptions,
};
pub use error::{ChannelError, Result, SessionError};
pub use pending::{CorrelationKey, ResponseKind};
pub use producer::{Producer, ProducerController};
pub use session::{SessionController, SessionStatus};
pub use transport::{TransportController, TransportState};
