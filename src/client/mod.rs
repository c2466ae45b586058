#![forbid(unsafe_code)]

// Client module - negotiation state machine driving the signaling protocol

pub mod channel;
pub mod device;
pub mod error;
pub mod events;
pub mod participant;

pub use channel::{SignalingChannel, WsChannel};
pub use device::Device;
pub use error::ClientError;
pub use events::{EventHub, ScreenShareOrigin, Subscription};
pub use participant::{RemoteParticipant, RemoteTrack};

use crate::engine::{MediaKind, ParticipantId, ProducerId, RoomId, TransportId};
use crate::signaling::protocol::{
    ClientCommand, ProducerAnnouncement, ProducerAppData, ServerMessage,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Lifecycle of one join attempt. `Idle` is re-enterable; there is no
/// terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Idle,
    AwaitingCapabilities,
    TransportsReady,
    Joined,
    Leaving,
}

/// Which local tracks to publish once transports are ready.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalMedia {
    pub audio: bool,
    pub video: bool,
}

/// Client-side session: drives capability exchange, transport setup,
/// producing local tracks, and consuming announced remote tracks.
///
/// Inbound server events are fed through [`CallSession::handle_event`] in
/// arrival order; everything here runs on one task.
pub struct CallSession<C: SignalingChannel> {
    channel: C,
    device: Device,
    state: JoinState,
    room_id: Option<RoomId>,
    display_name: String,
    send_transport: Option<TransportId>,
    recv_transport: Option<TransportId>,
    send_connected: bool,
    recv_connected: bool,
    /// At most one regular producer per kind; toggling pauses rather than
    /// renegotiating.
    producers: HashMap<MediaKind, ProducerId>,
    screen_producer: Option<ProducerId>,
    muted: bool,
    camera_enabled: bool,
    participants: HashMap<ParticipantId, RemoteParticipant>,
    pub events: EventHub,
}

impl<C: SignalingChannel> CallSession<C> {
    pub fn new(channel: C) -> Self {
        Self {
            channel,
            device: Device::new(),
            state: JoinState::Idle,
            room_id: None,
            display_name: String::new(),
            send_transport: None,
            recv_transport: None,
            send_connected: false,
            recv_connected: false,
            producers: HashMap::new(),
            screen_producer: None,
            muted: false,
            camera_enabled: true,
            participants: HashMap::new(),
            events: EventHub::default(),
        }
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    pub fn participants(&self) -> &HashMap<ParticipantId, RemoteParticipant> {
        &self.participants
    }

    pub fn producer_for(&self, kind: MediaKind) -> Option<&ProducerId> {
        self.producers.get(&kind)
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_camera_enabled(&self) -> bool {
        self.camera_enabled
    }

    pub fn is_screen_sharing(&self) -> bool {
        self.screen_producer.is_some()
    }

    #[cfg(test)]
    pub(crate) fn restrict_codecs(&mut self, mime_types: &[&str]) {
        self.device = Device::with_supported(mime_types);
    }

    /// Joins a room and publishes the given local tracks. Fails fatally if
    /// capability negotiation or transport setup fails; the session is back
    /// in `Idle` afterwards and can retry.
    pub async fn join_room(
        &mut self,
        room_id: &str,
        display_name: &str,
        media: LocalMedia,
    ) -> Result<(), ClientError> {
        if self.state != JoinState::Idle {
            return Err(ClientError::InvalidState("join is only valid from Idle"));
        }
        self.state = JoinState::AwaitingCapabilities;

        match self.join_inner(room_id, display_name, media).await {
            Ok(()) => {
                self.state = JoinState::Joined;
                Ok(())
            }
            Err(e) => {
                let _ = self.channel.notify(ClientCommand::LeaveRoom).await;
                self.reset_local_state();
                Err(e)
            }
        }
    }

    async fn join_inner(
        &mut self,
        room_id: &str,
        display_name: &str,
        media: LocalMedia,
    ) -> Result<(), ClientError> {
        self.room_id = Some(RoomId::from(room_id));
        self.display_name = display_name.to_string();
        self.channel
            .notify(ClientCommand::JoinRoom {
                room_id: room_id.to_string(),
                display_name: display_name.to_string(),
            })
            .await?;

        let capabilities = match self
            .channel
            .request(ClientCommand::RouterRtpCapabilities)
            .await?
        {
            ServerMessage::RouterRtpCapabilities {
                rtp_capabilities, ..
            } => rtp_capabilities,
            other => return Err(unexpected(other)),
        };
        self.device.load(&capabilities)?;

        self.send_transport = Some(self.create_transport(true).await?);
        self.recv_transport = Some(self.create_transport(false).await?);
        self.state = JoinState::TransportsReady;

        if media.audio {
            self.produce_local(MediaKind::Audio, false).await?;
        }
        if media.video {
            self.produce_local(MediaKind::Video, false).await?;
        }
        Ok(())
    }

    async fn create_transport(&mut self, is_sender: bool) -> Result<TransportId, ClientError> {
        match self
            .channel
            .request(ClientCommand::CreateTransport { is_sender })
            .await?
        {
            ServerMessage::TransportCreated { id, .. } => Ok(id),
            other => Err(unexpected(other)),
        }
    }

    async fn connect_transport(&self, transport_id: &TransportId) -> Result<(), ClientError> {
        match self
            .channel
            .request(ClientCommand::ConnectTransport {
                transport_id: transport_id.clone(),
                dtls_parameters: self.device.dtls_parameters(),
            })
            .await?
        {
            ServerMessage::TransportConnected { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// The connect handshake runs lazily, at most once per transport.
    async fn ensure_send_connected(&mut self) -> Result<(), ClientError> {
        let id = self
            .send_transport
            .clone()
            .ok_or(ClientError::InvalidState("no send transport"))?;
        if !self.send_connected {
            self.connect_transport(&id).await?;
            self.send_connected = true;
        }
        Ok(())
    }

    async fn ensure_recv_connected(&mut self) -> Result<(), ClientError> {
        let id = self
            .recv_transport
            .clone()
            .ok_or(ClientError::InvalidState("no receive transport"))?;
        if !self.recv_connected {
            self.connect_transport(&id).await?;
            self.recv_connected = true;
        }
        Ok(())
    }

    async fn produce_local(
        &mut self,
        kind: MediaKind,
        is_screen_share: bool,
    ) -> Result<ProducerId, ClientError> {
        self.ensure_send_connected().await?;
        let rtp_parameters = self.device.rtp_parameters_for(kind)?;
        let app_data = ProducerAppData {
            name: Some(self.display_name.clone()),
            is_screen_share,
        };

        let id = match self
            .channel
            .request(ClientCommand::Produce {
                kind,
                rtp_parameters,
                app_data,
            })
            .await?
        {
            ServerMessage::Produced { id, .. } => id,
            other => return Err(unexpected(other)),
        };

        if is_screen_share {
            self.screen_producer = Some(id.clone());
        } else {
            self.producers.insert(kind, id.clone());
        }
        Ok(id)
    }

    /// Feeds one inbound server event into the state machine.
    pub async fn handle_event(&mut self, message: ServerMessage) -> Result<(), ClientError> {
        match message {
            ServerMessage::ExistingProducers { producers } => {
                for announcement in producers {
                    self.consume_announcement(announcement).await?;
                }
            }
            ServerMessage::NewProducer(announcement) => {
                self.consume_announcement(announcement).await?;
            }
            ServerMessage::UserDisconnected { socket_id } => {
                if self.participants.remove(&socket_id).is_some() {
                    self.events.participant_left.emit(&socket_id);
                }
            }
            ServerMessage::UserMuteStatusChanged { socket_id, muted } => {
                if let Some(participant) = self.participants.get_mut(&socket_id) {
                    participant.muted = muted;
                    let snapshot = participant.clone();
                    self.events.participant_updated.emit(&snapshot);
                }
            }
            ServerMessage::ProducerClosed { producer_id } => {
                self.drop_remote_track(&producer_id);
            }
            ServerMessage::Error { error, .. } => {
                warn!("Signaling error event: {}", error);
            }
            other => {
                debug!("Ignoring frame outside a request: {:?}", other);
            }
        }
        Ok(())
    }

    /// Consumes one announced remote producer. The participant record is
    /// created synchronously, before the consume round trip, so a second
    /// announcement for the same owner arriving mid-flight finds the record
    /// instead of creating a duplicate.
    async fn consume_announcement(
        &mut self,
        announcement: ProducerAnnouncement,
    ) -> Result<(), ClientError> {
        if self.state != JoinState::Joined {
            debug!(
                "Dropping announcement for {} outside a joined session",
                announcement.producer_id
            );
            return Ok(());
        }

        let owner = announcement.socket_id.clone();
        match self.participants.get(&owner) {
            None => {
                let record = RemoteParticipant::new(owner.clone(), announcement.name.clone());
                self.events.participant_joined.emit(&record);
                self.participants.insert(owner.clone(), record);
            }
            Some(participant) => {
                if participant.has_track_for(&announcement.producer_id) {
                    debug!("Duplicate announcement for {}", announcement.producer_id);
                    return Ok(());
                }
            }
        }

        self.ensure_recv_connected().await?;
        let rtp_capabilities = self.device.rtp_capabilities()?;
        let reply = self
            .channel
            .request(ClientCommand::Consume {
                producer_id: announcement.producer_id.clone(),
                rtp_capabilities,
            })
            .await;

        let (consumer_id, kind, rtp_parameters) = match reply {
            Ok(ServerMessage::Consumed {
                id,
                kind,
                rtp_parameters,
                ..
            }) => (id, kind, rtp_parameters),
            Ok(other) => return Err(unexpected(other)),
            // Codec mismatch skips this one track, not the room
            Err(ClientError::Signaling(message)) if message == "Cannot consume" => {
                warn!(
                    "Skipping incompatible track {} from {}",
                    announcement.producer_id, owner
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        self.channel
            .request(ClientCommand::ResumeConsumer {
                consumer_id: consumer_id.clone(),
            })
            .await?;

        if let Some(participant) = self.participants.get_mut(&owner) {
            participant.tracks.insert(
                announcement.producer_id.clone(),
                RemoteTrack {
                    producer_id: announcement.producer_id.clone(),
                    consumer_id,
                    kind,
                    is_screen_share: announcement.is_screen_share,
                    rtp_parameters,
                },
            );
            let snapshot = participant.clone();
            if announcement.is_screen_share {
                self.events
                    .screen_share_started
                    .emit(&ScreenShareOrigin::Remote(owner));
            }
            self.events.participant_updated.emit(&snapshot);
        }
        Ok(())
    }

    fn drop_remote_track(&mut self, producer_id: &ProducerId) {
        for participant in self.participants.values_mut() {
            if let Some(track) = participant.tracks.remove(producer_id) {
                let snapshot = participant.clone();
                if track.is_screen_share {
                    self.events
                        .screen_share_stopped
                        .emit(&ScreenShareOrigin::Remote(snapshot.socket_id.clone()));
                }
                self.events.participant_updated.emit(&snapshot);
                return;
            }
        }
        debug!("producer-closed for unknown producer {}", producer_id);
    }

    /// Flags the local mute state and advertises it to the room. The server
    /// pauses or resumes the audio producer.
    pub async fn toggle_mute(&mut self, muted: bool) -> Result<(), ClientError> {
        if self.state != JoinState::Joined {
            return Err(ClientError::InvalidState("not in a room"));
        }
        self.muted = muted;
        self.channel
            .notify(ClientCommand::MuteStatusChange { muted })
            .await
    }

    /// Flags the local camera state and tells the server to pause or resume
    /// the video producer. The producer is kept registered, so re-enabling
    /// never renegotiates.
    pub async fn toggle_camera(&mut self, enabled: bool) -> Result<(), ClientError> {
        if self.state != JoinState::Joined {
            return Err(ClientError::InvalidState("not in a room"));
        }
        self.camera_enabled = enabled;
        self.channel
            .notify(ClientCommand::CameraStatusChange { enabled })
            .await
    }

    pub async fn start_screen_share(&mut self) -> Result<ProducerId, ClientError> {
        if self.state != JoinState::Joined {
            return Err(ClientError::InvalidState("not in a room"));
        }
        if self.screen_producer.is_some() {
            return Err(ClientError::InvalidState("screen share already active"));
        }
        let id = self.produce_local(MediaKind::Video, true).await?;
        self.events
            .screen_share_started
            .emit(&ScreenShareOrigin::Local);
        Ok(id)
    }

    /// Stops an active share. The local stopped signal fires immediately;
    /// the sharer's own UI must not wait on the server round trip.
    pub async fn stop_screen_share(&mut self) -> Result<(), ClientError> {
        let Some(producer_id) = self.screen_producer.take() else {
            return Ok(());
        };
        self.events
            .screen_share_stopped
            .emit(&ScreenShareOrigin::Local);
        self.channel
            .notify(ClientCommand::CloseProducer { producer_id })
            .await
    }

    /// Leaves the current room. Callable from any state; always lands back
    /// in `Idle`.
    pub async fn leave_room(&mut self) -> Result<(), ClientError> {
        if self.state == JoinState::Idle {
            return Ok(());
        }
        self.state = JoinState::Leaving;
        if let Err(e) = self.channel.notify(ClientCommand::LeaveRoom).await {
            debug!("Leave notification failed: {}", e);
        }
        self.reset_local_state();
        Ok(())
    }

    fn reset_local_state(&mut self) {
        self.state = JoinState::Idle;
        self.room_id = None;
        self.send_transport = None;
        self.recv_transport = None;
        self.send_connected = false;
        self.recv_connected = false;
        self.producers.clear();
        self.screen_producer = None;
        self.muted = false;
        self.camera_enabled = true;
        self.participants.clear();
        self.device = Device::new();
    }
}

fn unexpected(message: ServerMessage) -> ClientError {
    ClientError::UnexpectedReply(format!("{message:?}"))
}
