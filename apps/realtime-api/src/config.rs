use std::time::Duration;

/// A token seeded into the in-memory validator, parsed from `DEV_TOKENS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevToken {
    pub token: String,
    pub user_id: String,
    pub display_name: String,
}

/// Realtime API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// How long a new connection has to send its handshake frame.
    pub handshake_timeout: Duration,
    /// Interval between server pings. A connection that misses a full
    /// interval without any inbound frame is closed.
    pub heartbeat_interval: Duration,
    /// Per-connection outbound queue size. Events beyond it are dropped.
    pub outbound_queue_capacity: usize,
    /// Tokens to seed when running with the in-memory validator.
    pub dev_tokens: Vec<DevToken>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4003,
            handshake_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            outbound_queue_capacity: 256,
            dev_tokens: Vec::new(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            handshake_timeout: parsed_var("HANDSHAKE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.handshake_timeout),
            heartbeat_interval: parsed_var("HEARTBEAT_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            outbound_queue_capacity: parsed_var("OUTBOUND_QUEUE_CAPACITY")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.outbound_queue_capacity),
            dev_tokens: std::env::var("DEV_TOKENS")
                .map(|v| parse_dev_tokens(&v))
                .unwrap_or_default(),
        }
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Parse `token=user_id:Display Name,token2=user_id2:Other`. Malformed
/// entries are skipped with a warning.
pub fn parse_dev_tokens(raw: &str) -> Vec<DevToken> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry.split_once('=').and_then(|(token, user)| {
                let (user_id, display_name) = user.split_once(':').unwrap_or((user, user));
                (!token.is_empty() && !user_id.is_empty()).then(|| DevToken {
                    token: token.to_string(),
                    user_id: user_id.to_string(),
                    display_name: display_name.to_string(),
                })
            });
            if parsed.is_none() {
                tracing::warn!(%entry, "ignoring malformed DEV_TOKENS entry");
            }
            parsed
        })
        .collect()
}
