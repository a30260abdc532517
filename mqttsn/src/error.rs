//! Error types for mqttsn.

use std::io;

use crate::types::ReturnCode;

/// Result type alias for mqttsn.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttsn operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed packet or packet not permitted in the current session state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Connection refused by the gateway or broker.
    #[error("connection refused: {0}")]
    ConnectionRefused(ReturnCode),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// No free topic alias or message id.
    #[error("exhausted: {0}")]
    Exhausted(&'static str),

    /// A transaction did not complete.
    #[error("transaction failed: {0}")]
    Transaction(#[from] TransactionError),

    /// Topic name or filter cannot be used here.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Gateway is already running.
    #[error("gateway already running")]
    AlreadyRunning,
}

impl From<rumqttc::mqttbytes::Error> for Error {
    fn from(e: rumqttc::mqttbytes::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}

/// Why a transaction resolved without succeeding.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransactionError {
    /// Superseded by a newer transaction or torn down with its session.
    #[error("canceled")]
    Canceled,

    /// The retry budget ran out before an acknowledgement arrived.
    #[error("no more retries")]
    NoMoreRetries,

    /// The one-shot deadline passed.
    #[error("deadline exceeded")]
    Timeout,

    /// The peer answered with a rejection code.
    #[error("rejected: {0}")]
    Rejected(ReturnCode),

    /// The session closed underneath the transaction.
    #[error("session closed")]
    Closed,
}
