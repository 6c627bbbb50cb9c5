//! Signaling error type.

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Errors produced by the signaling client.
///
/// Some variants are delivered to callbacks and leave the session usable
/// (`HandshakeRejected`, `SignalRejected`, `Encode`, `NotConnected`); the rest end the
/// receive loop. See [`SignalingError::is_fatal`].
#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("{0} handler is not set")]
    MissingHandler(&'static str),

    #[error("invalid signaling url: {0}")]
    InvalidUrl(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("acknowledgment for unknown message id {0}")]
    UnmatchedAck(u64),

    #[error("syn failed: {0}")]
    HandshakeRejected(String),

    #[error("sig failed: {0}")]
    SignalRejected(String),

    #[error("not connected")]
    NotConnected,
}

impl SignalingError {
    /// Whether the error ends the signaling session.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SignalingError::HandshakeRejected(_)
                | SignalingError::SignalRejected(_)
                | SignalingError::Encode(_)
                | SignalingError::NotConnected
        )
    }
}
