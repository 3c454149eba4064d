use std::time::Duration;

use thiserror::Error;

/// Failures surfaced to callers of the session; `Clone` so one disconnect can
/// be delivered to every pending call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("{operation} timed out after {}ms", .timeout.as_millis())]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("connection lost")]
    Disconnected,

    #[error("authentication expired, sign in again")]
    AuthenticationExpired,

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("websocket error: {0}")]
    WebSocket(String),
}

impl TransportError {
    /// Timeouts and dropped connections may succeed on a later attempt;
    /// everything else needs a different request or a new login.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. } | TransportError::Disconnected | TransportError::WebSocket(_)
        )
    }
}
