#![forbid(unsafe_code)]

use thiserror::Error;

/// Client-side failures.
///
/// `Signaling` carries the server's error string verbatim; "Cannot consume"
/// is recoverable (that one remote track is skipped), everything else is
/// fatal to the current join attempt.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("incompatible capabilities: {0}")]
    Incompatible(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("signaling channel closed")]
    ChannelClosed,

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] serde_json::Error),
}
