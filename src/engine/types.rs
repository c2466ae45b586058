#![forbid(unsafe_code)]

// Common types and error handling for the media engine

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// String-backed identifier newtypes for engine-owned objects.
///
/// Identifiers are opaque handles minted by the engine; the registry and the
/// wire protocol carry them around but never interpret them.
macro_rules! engine_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn random() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }
    };
}

engine_id!(RouterId);
engine_id!(TransportId);
engine_id!(ProducerId);
engine_id!(ConsumerId);

// Session-level identifiers minted by the signaling layer rather than the
// engine. Same shape, so they share the macro.
engine_id!(ParticipantId);
engine_id!(RoomId);

/// Kind of a media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
        }
    }
}

/// Direction of a WebRTC transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

// Negotiation blobs are relayed verbatim between the engine and the client.
// Neither the registry nor the signaling layer inspects their contents, so
// they are carried as opaque JSON.

/// RTP parameters describing an individual media stream
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// RTP capabilities of a router or a client device
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

/// DTLS handshake parameters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// ICE parameters of a transport
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceParameters(pub serde_json::Value);

/// A single ICE candidate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidate(pub serde_json::Value);

/// Codec supported by a router, advertised in its RTP capabilities
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecConfig {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub parameters: serde_json::Value,
}

/// Transport connection parameters returned to the client for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportDescriptor {
    pub id: TransportId,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Consumer parameters returned to the consuming client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// Custom error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Router not found: {0}")]
    RouterNotFound(RouterId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Producer not found: {0}")]
    ProducerNotFound(ProducerId),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(ConsumerId),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Engine operation failed: {0}")]
    Operation(String),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
