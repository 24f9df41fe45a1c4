use thiserror::Error;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, ReverbError>;

/// Error kinds surfaced by the client.
///
/// Errors raised on the receive path never reach user code as `Err` values;
/// they are dispatched as `error` events or trigger a controlled reconnect.
/// User-initiated operations (`connect`, `subscribe`, `trigger`, ...) return
/// these directly.
#[derive(Error, Debug)]
pub enum ReverbError {
    /// Transport could not be opened, closed unexpectedly during the
    /// handshake, or reconnection attempts were exhausted.
    #[error("connection error: {0}")]
    Connection(String),

    /// The server rejected the admission token for a restricted channel.
    #[error("authentication error: {0}")]
    Authentication(String),

    /// The server rejected a subscribe request for a non-auth reason.
    #[error("subscription error: {0}")]
    Subscription(String),

    /// Malformed envelope, unexpected first envelope, or a `pusher:error`
    /// outside a subscribe context.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A subscribe waiter or the handshake deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// The caller violated an API contract, e.g. triggering on an
    /// unsubscribed channel.
    #[error("precondition violated: {0}")]
    Precondition(String),

    /// Required configuration is missing or invalid.
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for ReverbError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        ReverbError::Connection(e.to_string())
    }
}

impl From<serde_json::Error> for ReverbError {
    fn from(e: serde_json::Error) -> Self {
        ReverbError::Protocol(e.to_string())
    }
}

impl From<url::ParseError> for ReverbError {
    fn from(e: url::ParseError) -> Self {
        ReverbError::Configuration(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_kind_and_message() {
        let err = ReverbError::Precondition("trigger on public channel".into());
        assert_eq!(
            err.to_string(),
            "precondition violated: trigger on public channel"
        );
    }

    #[test]
    fn json_errors_map_to_protocol() {
        let err: ReverbError = serde_json::from_str::<serde_json::Value>("{nope")
            .unwrap_err()
            .into();
        assert!(matches!(err, ReverbError::Protocol(_)));
    }
}
