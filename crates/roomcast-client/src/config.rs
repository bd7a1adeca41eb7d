use std::time::Duration;

/// Bound on a `connect_transport` exchange
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Bound on every other control-channel request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the SFU control channel
    pub server_url: String,
    /// Bound on ordinary control-channel requests
    pub request_timeout: Duration,
    /// Bound on the transport connect handshake
    pub connect_timeout: Duration,
}

impl ClientConfig {
    /// Load from environment variables, falling back to defaults
    pub fn load() -> Self {
        let server_url = std::env::var("ROOMCAST_SERVER_URL")
            .unwrap_or_else(|_| "ws://localhost:8000/ws".to_string());

        let request_timeout = std::env::var("ROOMCAST_REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);

        let connect_timeout = std::env::var("ROOMCAST_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        Self {
            server_url,
            request_timeout,
            connect_timeout,
        }
    }

    /// Configuration for a specific server with default timeouts
    pub fn for_url(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}
