//! Error types for the upstream pool session.

use std::time::Duration;

use thiserror::Error;

/// Upstream session errors.
///
/// Every variant except [`UpstreamError::SessionClosed`] ends the handshake:
/// the session closes its transport and reports Disconnected.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// Network I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error on an outbound request
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Dialing the pool failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Dialing the pool did not finish in time
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    /// Write attempted while no usable connection exists
    #[error("Connection closed")]
    ConnectionClosed,

    /// Peer closed the connection (EOF)
    #[error("Connection lost")]
    Disconnected,

    /// Ex-Message header declares a length shorter than the header itself
    #[error("Broken ex-message: declared length {length} is shorter than its header")]
    BrokenExMessage { length: u16 },

    /// Subscribe response missing or malformed
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(String),

    /// Pool offers fewer extranonce2 bytes than the proxy needs
    #[error("Extranonce2 is too short ({size} bytes), need at least {min} bytes")]
    IncompatibleExtranonce2Size { size: i64, min: usize },

    /// Authorize response was not `true`
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(String),

    /// Pool index is outside the configured pool list
    #[error("No pool configured at index {0}")]
    UnknownPool(usize),

    /// Handshake did not complete in time
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Shutdown was requested while the handshake was in progress
    #[error("Shutdown requested")]
    Shutdown,

    /// Event sent to a session whose event loop is no longer consuming
    #[error("Upstream session is closed")]
    SessionClosed,
}

/// Convenient Result type for upstream operations.
pub type UpstreamResult<T> = Result<T, UpstreamError>;
