use std::time::Duration;

/// Client tuning knobs. The defaults match the server's expectations.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket URL of the gateway, e.g. `ws://localhost:4003/gateway`.
    pub gateway_url: String,
    /// How long to wait for `ready` after opening the transport.
    pub handshake_timeout: Duration,
    /// Window over which token changes are coalesced before reconnecting.
    pub debounce: Duration,
    /// Consecutive failures after which automatic attempts stop.
    pub max_attempts: u32,
    /// How often the cross-instance notifier re-reads the shared session.
    pub reconcile_interval: Duration,
    /// Local inactivity after which a `typing_stop` is sent.
    pub typing_idle: Duration,
    /// How long a remote typing indicator is shown without a refresh.
    pub remote_typing_expiry: Duration,
    /// Buffered inbound events per session.
    pub event_queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            gateway_url: "ws://localhost:4003/gateway".to_string(),
            handshake_timeout: Duration::from_secs(10),
            debounce: Duration::from_millis(100),
            max_attempts: 3,
            reconcile_interval: Duration::from_secs(2),
            typing_idle: Duration::from_secs(2),
            remote_typing_expiry: Duration::from_secs(5),
            event_queue_capacity: 256,
        }
    }
}

impl ClientConfig {
    pub fn with_url(gateway_url: impl Into<String>) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            ..Self::default()
        }
    }
}
