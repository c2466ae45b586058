#![forbid(unsafe_code)]

// Client-side view of remote room members

use crate::engine::{ConsumerId, MediaKind, ParticipantId, ProducerId, RtpParameters};
use std::collections::HashMap;

/// One remote media track the session is consuming.
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub kind: MediaKind,
    pub is_screen_share: bool,
    pub rtp_parameters: RtpParameters,
}

/// A remote room member, keyed by its connection id. Created synchronously
/// when the first announcement for that owner arrives; tracks are attached
/// as their consume round trips complete.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub socket_id: ParticipantId,
    pub name: String,
    pub muted: bool,
    /// Tracks keyed by source producer id.
    pub tracks: HashMap<ProducerId, RemoteTrack>,
}

impl RemoteParticipant {
    pub fn new(socket_id: ParticipantId, name: String) -> Self {
        Self {
            socket_id,
            name,
            muted: false,
            tracks: HashMap::new(),
        }
    }

    pub fn has_track_for(&self, producer_id: &ProducerId) -> bool {
        self.tracks.contains_key(producer_id)
    }

    pub fn screen_share_track(&self) -> Option<&RemoteTrack> {
        self.tracks.values().find(|t| t.is_screen_share)
    }
}
