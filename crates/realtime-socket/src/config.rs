//! Socket endpoint configuration.

/// Connection settings for the realtime websocket endpoint.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Full websocket url, e.g. `wss://<project>.supabase.co/realtime/v1/websocket`.
    pub endpoint: String,
    /// Project api key, sent as a query parameter and used as the access
    /// token when no user is signed in.
    pub api_key: String,
    /// Seconds between socket heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait for the server's join verdict.
    pub subscribe_timeout_secs: u64,
}

impl SocketConfig {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            heartbeat_interval_secs: 30,
            subscribe_timeout_secs: 10,
        }
    }
}
