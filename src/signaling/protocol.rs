#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::engine::{
    ConsumerId, DtlsParameters, IceCandidate, IceParameters, MediaKind, ParticipantId, ProducerId,
    RtpCapabilities, RtpParameters, TransportId,
};
use serde::{Deserialize, Serialize};

/// A client-to-server frame.
///
/// Request/reply messages carry a `requestId` that the server echoes in
/// exactly one reply frame. Fire-and-forget messages (`join-room`,
/// `leave-room`, `mute-status-change`, `camera-status-change`,
/// `close-producer`) carry none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientRequest {
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub command: ClientCommand,
}

impl ClientRequest {
    pub fn notification(command: ClientCommand) -> Self {
        Self {
            request_id: None,
            command,
        }
    }
}

/// Client-to-server commands
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientCommand {
    /// Join a room (fire-and-forget; the server answers with the
    /// existing-producers snapshot event)
    #[serde(rename = "join-room", rename_all = "camelCase")]
    JoinRoom {
        room_id: String,
        display_name: String,
    },
    /// Leave the current room
    #[serde(rename = "leave-room")]
    LeaveRoom,
    /// Get the router RTP capabilities (request)
    #[serde(rename = "routerRtpCapabilities")]
    RouterRtpCapabilities,
    /// Create a WebRTC transport (request)
    #[serde(rename = "create-transport", rename_all = "camelCase")]
    CreateTransport { is_sender: bool },
    /// Connect a transport with DTLS parameters (request)
    #[serde(rename = "connect-transport", rename_all = "camelCase")]
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    },
    /// Produce a media track on the send transport (request)
    #[serde(rename = "produce", rename_all = "camelCase")]
    Produce {
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        app_data: ProducerAppData,
    },
    /// Consume a remote producer on the receive transport (request)
    #[serde(rename = "consume", rename_all = "camelCase")]
    Consume {
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    /// Resume a paused consumer (request, ack only)
    #[serde(rename = "resume-consumer", rename_all = "camelCase")]
    ResumeConsumer { consumer_id: ConsumerId },
    /// Close an owned producer (fire-and-forget)
    #[serde(rename = "close-producer", rename_all = "camelCase")]
    CloseProducer { producer_id: ProducerId },
    /// Advertise a mute state change (fire-and-forget)
    #[serde(rename = "mute-status-change")]
    MuteStatusChange { muted: bool },
    /// Pause or resume the camera producer (fire-and-forget)
    #[serde(rename = "camera-status-change")]
    CameraStatusChange { enabled: bool },
}

/// Application data attached to a produce request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAppData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub is_screen_share: bool,
}

/// Server-to-client frames: correlated replies and room events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// Error reply; `requestId` is absent for failures of fire-and-forget
    /// messages or unparseable frames
    #[serde(rename = "error", rename_all = "camelCase")]
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        request_id: Option<u64>,
        error: String,
    },
    /// Router RTP capabilities reply
    #[serde(rename = "routerRtpCapabilities", rename_all = "camelCase")]
    RouterRtpCapabilities {
        request_id: u64,
        rtp_capabilities: RtpCapabilities,
    },
    /// Transport created reply
    #[serde(rename = "transport-created", rename_all = "camelCase")]
    TransportCreated {
        request_id: u64,
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    /// Transport connected ack
    #[serde(rename = "transport-connected", rename_all = "camelCase")]
    TransportConnected { request_id: u64 },
    /// Producer created reply
    #[serde(rename = "produced", rename_all = "camelCase")]
    Produced { request_id: u64, id: ProducerId },
    /// Consumer created reply
    #[serde(rename = "consumed", rename_all = "camelCase")]
    Consumed {
        request_id: u64,
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Consumer resumed ack
    #[serde(rename = "consumer-resumed", rename_all = "camelCase")]
    ConsumerResumed { request_id: u64 },
    /// Snapshot of producers already live in the room, sent once on join
    #[serde(rename = "existing-producers")]
    ExistingProducers { producers: Vec<ProducerAnnouncement> },
    /// A participant started producing a new track
    #[serde(rename = "new-producer")]
    NewProducer(ProducerAnnouncement),
    /// A participant left the room
    #[serde(rename = "user-disconnected", rename_all = "camelCase")]
    UserDisconnected { socket_id: ParticipantId },
    /// A participant changed their mute state
    #[serde(rename = "user-mute-status-changed", rename_all = "camelCase")]
    UserMuteStatusChanged {
        socket_id: ParticipantId,
        muted: bool,
    },
    /// A producer was closed; every consumer of it is already gone
    #[serde(rename = "producer-closed", rename_all = "camelCase")]
    ProducerClosed { producer_id: ProducerId },
}

impl ServerMessage {
    /// Correlation id of a reply frame; `None` for broadcast events and for
    /// errors triggered by fire-and-forget messages.
    pub fn request_id(&self) -> Option<u64> {
        match self {
            Self::Error { request_id, .. } => *request_id,
            Self::RouterRtpCapabilities { request_id, .. }
            | Self::TransportCreated { request_id, .. }
            | Self::TransportConnected { request_id }
            | Self::Produced { request_id, .. }
            | Self::Consumed { request_id, .. }
            | Self::ConsumerResumed { request_id } => Some(*request_id),
            _ => None,
        }
    }
}

/// A producer advertised to the rest of the room, either in the join
/// snapshot or as a new-producer event
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerAnnouncement {
    pub producer_id: ProducerId,
    /// Connection id of the producing participant
    pub socket_id: ParticipantId,
    pub name: String,
    pub kind: MediaKind,
    #[serde(default)]
    pub is_screen_share: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn join_room_wire_shape() {
        let frame = ClientRequest::notification(ClientCommand::JoinRoom {
            room_id: "r1".to_string(),
            display_name: "Alice".to_string(),
        });
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({ "type": "join-room", "roomId": "r1", "displayName": "Alice" })
        );
    }

    #[test]
    fn request_id_round_trips() {
        let frame = ClientRequest {
            request_id: Some(7),
            command: ClientCommand::CreateTransport { is_sender: true },
        };
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: ClientRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.request_id, Some(7));
        assert!(matches!(
            parsed.command,
            ClientCommand::CreateTransport { is_sender: true }
        ));
    }

    #[test]
    fn produce_app_data_defaults() {
        let json = json!({
            "type": "produce",
            "kind": "audio",
            "rtpParameters": { "codecs": [] },
        });
        let parsed: ClientRequest = serde_json::from_value(json).unwrap();
        match parsed.command {
            ClientCommand::Produce { app_data, kind, .. } => {
                assert_eq!(kind, MediaKind::Audio);
                assert!(app_data.name.is_none());
                assert!(!app_data.is_screen_share);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn new_producer_event_uses_socket_id_field() {
        let msg = ServerMessage::NewProducer(ProducerAnnouncement {
            producer_id: ProducerId::new("p1"),
            socket_id: ParticipantId::new("c1"),
            name: "Bob".to_string(),
            kind: MediaKind::Video,
            is_screen_share: true,
        });
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "new-producer",
                "producerId": "p1",
                "socketId": "c1",
                "name": "Bob",
                "kind": "video",
                "isScreenShare": true,
            })
        );
    }

    #[test]
    fn error_reply_shape() {
        let msg = ServerMessage::Error {
            request_id: Some(3),
            error: "Cannot consume".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({ "type": "error", "requestId": 3, "error": "Cannot consume" })
        );
    }
}
