//! Error types for channel-rpc

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RpcError {
    /// Socket-level failure. Triggers the reconnection policy.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Handshake rejected by the peer.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// The user declined to sign. Never retried automatically.
    #[error("User rejected: {0}")]
    UserRejected(String),

    #[error("Request timeout: {0}")]
    Timeout(String),

    /// Synthetic error used to fail pending requests when the socket drops.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Malformed or unroutable frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Not connected (status: {0})")]
    NotConnected(String),

    /// The peer answered the request with an `error` response.
    #[error("Server error: {0}")]
    Server(String),

    #[error("Request id {0} is already pending")]
    DuplicateRequestId(u64),

    #[error("Signer error: {0}")]
    Signer(String),

    #[error("Credential storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Client shut down")]
    Shutdown,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// Whether this error points at a bad cached credential rather than at
    /// the identity or the transport.
    pub fn is_credential_problem(&self) -> bool {
        match self {
            RpcError::Authentication(msg) | RpcError::Server(msg) => is_credential_message(msg),
            _ => false,
        }
    }

    /// A copy of this error, for settling several waiters with one failure.
    pub(crate) fn duplicate(&self) -> RpcError {
        match self {
            RpcError::Transport(m) => RpcError::Transport(m.clone()),
            RpcError::Authentication(m) => RpcError::Authentication(m.clone()),
            RpcError::UserRejected(m) => RpcError::UserRejected(m.clone()),
            RpcError::Timeout(m) => RpcError::Timeout(m.clone()),
            RpcError::ConnectionLost(m) => RpcError::ConnectionLost(m.clone()),
            RpcError::Protocol(m) => RpcError::Protocol(m.clone()),
            RpcError::NotConnected(m) => RpcError::NotConnected(m.clone()),
            RpcError::Server(m) => RpcError::Server(m.clone()),
            RpcError::DuplicateRequestId(id) => RpcError::DuplicateRequestId(*id),
            RpcError::Signer(m) => RpcError::Signer(m.clone()),
            RpcError::Storage(m) => RpcError::Storage(m.clone()),
            RpcError::Config(m) => RpcError::Config(m.clone()),
            RpcError::Shutdown => RpcError::Shutdown,
            RpcError::Io(e) => RpcError::Io(std::io::Error::new(e.kind(), e.to_string())),
            RpcError::Json(e) => RpcError::Protocol(e.to_string()),
        }
    }

    /// Errors the reconnection policy may recover from on its own. Anything
    /// else ends the connection for good.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RpcError::Transport(_) | RpcError::ConnectionLost(_) | RpcError::Timeout(_)
        )
    }
}

/// Match the error texts peers use for expired, malformed or revoked tokens.
///
/// Only token-specific phrases count: an application error that merely says
/// "unauthorized" or "expired" is about the request, not the session.
pub fn is_credential_message(message: &str) -> bool {
    const PATTERNS: &[&str] = &[
        "token expired",
        "jwt expired",
        "expired token",
        "expired jwt",
        "invalid token",
        "invalid jwt",
        "malformed token",
        "malformed jwt",
        "token is invalid",
        "invalid claims",
        "invalid signature on token",
        "token verification failed",
    ];

    let lower = message.to_ascii_lowercase();
    PATTERNS.iter().any(|p| lower.contains(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_messages() {
        assert!(is_credential_message("JWT expired"));
        assert!(is_credential_message("invalid token: bad claims"));
        assert!(is_credential_message("Malformed token"));
        assert!(!is_credential_message("insufficient balance"));
        assert!(!is_credential_message("invalid signature"));
    }

    #[test]
    fn test_application_errors_are_not_credential_messages() {
        assert!(!is_credential_message("unauthorized: not a channel participant"));
        assert!(!is_credential_message("quote expired"));
        assert!(!is_credential_message("jwt field missing from payload"));
        assert!(!is_credential_message("malformed amount"));
    }

    #[test]
    fn test_error_classification() {
        assert!(RpcError::Authentication("token expired".into()).is_credential_problem());
        assert!(!RpcError::Server("unauthorized".into()).is_credential_problem());
        assert!(!RpcError::Authentication("challenge mismatch".into()).is_credential_problem());
        assert!(!RpcError::Timeout("expired".into()).is_credential_problem());

        assert!(RpcError::Transport("reset".into()).is_retryable());
        assert!(!RpcError::UserRejected("no".into()).is_retryable());
        assert!(!RpcError::Authentication("nope".into()).is_retryable());
    }

    #[test]
    fn test_duplicate_keeps_variant() {
        let original = RpcError::UserRejected("declined".into());
        assert!(matches!(original.duplicate(), RpcError::UserRejected(m) if m == "declined"));
        assert!(matches!(RpcError::Shutdown.duplicate(), RpcError::Shutdown));
    }
}
