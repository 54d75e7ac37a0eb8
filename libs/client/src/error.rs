/// Why a connection attempt (or a send) failed.
///
/// `Clone` because one attempt's outcome is shared by every caller awaiting it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("no token set")]
    NoToken,
    /// The server refused the handshake; carries its reason
    /// (`no-token`, `invalid-token`, `user-not-found`).
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("connection closed ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("not connected")]
    NotConnected,
    #[error("retry limit reached")]
    RetryLimitReached,
    #[error("attempt cancelled")]
    Cancelled,
}
