#![forbid(unsafe_code)]

// Room registry - authoritative server-side state for rooms, participants,
// and the media objects attached to them

pub mod error;

pub use error::{RegistryError, RegistryResult};

use crate::engine::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, EngineError, MediaEngine, MediaKind,
    ParticipantId, ProducerId, RoomId, RouterId, RtpCapabilities, RtpParameters,
    TransportDescriptor, TransportDirection, TransportId,
};
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{ProducerAppData, ProducerAnnouncement, ServerMessage};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// A producer owned by a participant
#[derive(Debug, Clone)]
pub struct ProducerRecord {
    pub kind: MediaKind,
    pub is_screen_share: bool,
}

/// A consumer held by a participant, pointing at another participant's producer
#[derive(Debug, Clone)]
pub struct ConsumerRecord {
    pub producer_id: ProducerId,
}

/// Participant in a room
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub muted: bool,
    pub sender: mpsc::Sender<Arc<String>>,
    pub send_transport: Option<TransportId>,
    pub recv_transport: Option<TransportId>,
    pub producers: HashMap<ProducerId, ProducerRecord>,
    pub consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl Participant {
    fn new(id: ParticipantId, name: String, sender: mpsc::Sender<Arc<String>>) -> Self {
        Self {
            id,
            name,
            muted: false,
            sender,
            send_transport: None,
            recv_transport: None,
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }
}

/// Room state
pub struct Room {
    pub id: RoomId,
    pub router_id: RouterId,
    pub participants: HashMap<ParticipantId, Participant>,
}

impl Room {
    fn new(id: RoomId, router_id: RouterId) -> Self {
        Self {
            id,
            router_id,
            participants: HashMap::new(),
        }
    }

    fn encode(&self, message: &ServerMessage) -> Option<Arc<String>> {
        match serde_json::to_string(message) {
            Ok(j) => Some(Arc::new(j)),
            Err(e) => {
                warn!("Failed to serialize message for room {}: {}", self.id, e);
                None
            }
        }
    }

    fn deliver(&self, participant_id: &ParticipantId, sender: &mpsc::Sender<Arc<String>>, json: Arc<String>) {
        match sender.try_send(json) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    "Channel full for participant {} in room {}, dropping message",
                    participant_id, self.id
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    "Channel closed for participant {} in room {} (disconnected)",
                    participant_id, self.id
                );
            }
        }
    }

    /// Send a message to a specific participant
    fn send_to(&self, participant_id: &ParticipantId, message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        if let Some(participant) = self.participants.get(participant_id) {
            self.deliver(participant_id, &participant.sender, json);
        }
    }

    /// Broadcast a message to all participants except the sender
    fn broadcast_except(&self, sender_id: &ParticipantId, message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        for (id, participant) in &self.participants {
            if id != sender_id {
                self.deliver(id, &participant.sender, json.clone());
            }
        }
    }

    /// Broadcast a message to all participants
    fn broadcast_all(&self, message: &ServerMessage) {
        let Some(json) = self.encode(message) else { return };
        for (id, participant) in &self.participants {
            self.deliver(id, &participant.sender, json.clone());
        }
    }

    /// Removes every consumer record pointing at `producer_id`, returning
    /// the affected (owner, consumer) pairs for engine-side cleanup.
    fn remove_consumers_of(&mut self, producer_id: &ProducerId) -> Vec<(ParticipantId, ConsumerId)> {
        let mut removed = Vec::new();
        for (owner_id, participant) in &mut self.participants {
            let dead: Vec<ConsumerId> = participant
                .consumers
                .iter()
                .filter(|(_, record)| record.producer_id == *producer_id)
                .map(|(id, _)| id.clone())
                .collect();
            for consumer_id in dead {
                participant.consumers.remove(&consumer_id);
                removed.push((owner_id.clone(), consumer_id));
            }
        }
        removed
    }

    /// Snapshot of every producer in the room except `exclude`'s own,
    /// in announcement form.
    fn producer_snapshot(&self, exclude: &ParticipantId) -> Vec<ProducerAnnouncement> {
        self.participants
            .values()
            .filter(|p| p.id != *exclude)
            .flat_map(|p| {
                p.producers.iter().map(|(producer_id, record)| ProducerAnnouncement {
                    producer_id: producer_id.clone(),
                    socket_id: p.id.clone(),
                    name: p.name.clone(),
                    kind: record.kind,
                    is_screen_share: record.is_screen_share,
                })
            })
            .collect()
    }
}

/// Registered connection and its current room membership
struct ConnectionEntry {
    sender: mpsc::Sender<Arc<String>>,
    room_id: Option<RoomId>,
}

/// Media objects to release after the room lock is dropped
#[derive(Default)]
struct EngineCleanup {
    consumers: Vec<ConsumerId>,
    producers: Vec<ProducerId>,
    transports: Vec<TransportId>,
}

/// Authoritative registry of rooms, participants, and their media objects.
///
/// Uses per-room locking: the outer HashMap is protected by a std::sync::RwLock
/// (held only for brief lookups/inserts, never across await points), while each
/// room is protected by its own tokio::sync::RwLock (held across async operations
/// but only blocking participants in that specific room). Engine calls are made
/// outside room locks wherever the result does not affect broadcast ordering.
pub struct RoomRegistry {
    engine: Arc<dyn MediaEngine>,
    rooms: StdRwLock<HashMap<RoomId, Arc<TokioRwLock<Room>>>>,
    connections: StdRwLock<HashMap<ParticipantId, ConnectionEntry>>,
    metrics: ServerMetrics,
}

impl RoomRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, metrics: ServerMetrics) -> Self {
        Self {
            engine,
            rooms: StdRwLock::new(HashMap::new()),
            connections: StdRwLock::new(HashMap::new()),
            metrics,
        }
    }

    pub fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.engine
    }

    /// Registers a connection before it has joined any room.
    pub fn register(&self, participant_id: ParticipantId, sender: mpsc::Sender<Arc<String>>) {
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.insert(
            participant_id,
            ConnectionEntry {
                sender,
                room_id: None,
            },
        );
    }

    /// Tears down a connection: leaves its room (if any) and drops the entry.
    pub async fn disconnect(&self, participant_id: &ParticipantId) {
        if let Err(e) = self.leave_room(participant_id).await {
            debug!("Cleanup on disconnect for {}: {}", participant_id, e);
        }
        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.remove(participant_id);
    }

    fn sender_for(&self, participant_id: &ParticipantId) -> RegistryResult<mpsc::Sender<Arc<String>>> {
        let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
        connections
            .get(participant_id)
            .map(|entry| entry.sender.clone())
            .ok_or_else(|| RegistryError::NotRegistered(participant_id.clone()))
    }

    /// Resolves the caller's current room (brief locks, no await).
    fn current_room(
        &self,
        participant_id: &ParticipantId,
    ) -> RegistryResult<(RoomId, Arc<TokioRwLock<Room>>)> {
        let room_id = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            let entry = connections
                .get(participant_id)
                .ok_or_else(|| RegistryError::NotRegistered(participant_id.clone()))?;
            entry
                .room_id
                .clone()
                .ok_or_else(|| RegistryError::NotInRoom(participant_id.clone()))?
        };
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        let room = rooms
            .get(&room_id)
            .cloned()
            .ok_or_else(|| RegistryError::RoomNotFound(room_id.clone()))?;
        Ok((room_id, room))
    }

    /// Gets or creates a room, creating a router if needed
    async fn get_or_create_room(&self, room_id: &RoomId) -> RegistryResult<Arc<TokioRwLock<Room>>> {
        // Fast path: room exists (brief outer read lock)
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Ok(room.clone());
            }
        }

        // Slow path: create router (no lock held during the engine call)
        info!("Creating new room: {}", room_id);
        let router_id = self.engine.create_router().await?;

        // Insert under write lock (re-check for concurrent creation)
        let (room, lost_race) = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = rooms.get(room_id) {
                (existing.clone(), true)
            } else {
                let new_room = Arc::new(TokioRwLock::new(Room::new(
                    room_id.clone(),
                    router_id.clone(),
                )));
                rooms.insert(room_id.clone(), new_room.clone());
                (new_room, false)
            }
        };

        if lost_race {
            // Another join won; release the router we created
            self.engine.close_router(&router_id).await.ok();
        } else {
            self.metrics.inc_rooms_created();
        }
        Ok(room)
    }

    /// Adds a connection to a room and returns the snapshot of producers
    /// already live there.
    ///
    /// The snapshot and the membership insert happen under one room write
    /// lock, so no producer can be announced in between: every producer is
    /// either in the snapshot or arrives later as a new-producer event.
    pub async fn join_room(
        &self,
        participant_id: &ParticipantId,
        room_id: &RoomId,
        display_name: String,
    ) -> RegistryResult<Vec<ProducerAnnouncement>> {
        // A connection can be in at most one room
        let previous = {
            let connections = self.connections.read().unwrap_or_else(|e| e.into_inner());
            connections
                .get(participant_id)
                .ok_or_else(|| RegistryError::NotRegistered(participant_id.clone()))?
                .room_id
                .clone()
        };
        if previous.is_some() {
            self.leave_room(participant_id).await?;
        }

        let sender = self.sender_for(participant_id)?;
        let room_lock = self.get_or_create_room(room_id).await?;

        let snapshot = {
            let mut room = room_lock.write().await;
            room.participants.insert(
                participant_id.clone(),
                Participant::new(participant_id.clone(), display_name.clone(), sender),
            );
            let snapshot = room.producer_snapshot(participant_id);
            // Queued under the same lock as the membership insert, so any
            // new-producer broadcast lands strictly after the snapshot frame
            room.send_to(
                participant_id,
                &ServerMessage::ExistingProducers {
                    producers: snapshot.clone(),
                },
            );
            snapshot
        };

        let registered = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            match connections.get_mut(participant_id) {
                Some(entry) => {
                    entry.room_id = Some(room_id.clone());
                    true
                }
                None => false,
            }
        }; // guard released before any await
        if !registered {
            // Connection vanished while we were joining; undo the insert
            let mut room = room_lock.write().await;
            room.participants.remove(participant_id);
            return Err(RegistryError::NotRegistered(participant_id.clone()));
        }

        info!(
            "Participant {} ({}) joined room {}",
            participant_id, display_name, room_id
        );
        self.metrics.inc_joins();
        Ok(snapshot)
    }

    /// Removes a participant from their room, cascading closure of their
    /// producers and every consumer attached to them.
    ///
    /// Affected consumers' owners receive producer-closed before anyone sees
    /// user-disconnected; all of it is sequenced under one room write lock.
    pub async fn leave_room(&self, participant_id: &ParticipantId) -> RegistryResult<()> {
        let room_id = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            let entry = connections
                .get_mut(participant_id)
                .ok_or_else(|| RegistryError::NotRegistered(participant_id.clone()))?;
            match entry.room_id.take() {
                Some(id) => id,
                // Leaving while not in a room is a no-op
                None => return Ok(()),
            }
        };

        let room_lock = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            match rooms.get(&room_id) {
                Some(r) => r.clone(),
                None => return Ok(()),
            }
        };

        let mut cleanup = EngineCleanup::default();
        let mut router_id = None;
        let room_empty = {
            let mut room = room_lock.write().await;
            let Some(participant) = room.participants.remove(participant_id) else {
                return Ok(());
            };

            // Close cascade: each of the leaver's producers takes down every
            // consumer pointing at it, with a targeted producer-closed per
            // consumer
            for producer_id in participant.producers.keys() {
                let removed = room.remove_consumers_of(producer_id);
                for (owner_id, consumer_id) in removed {
                    room.send_to(
                        &owner_id,
                        &ServerMessage::ProducerClosed {
                            producer_id: producer_id.clone(),
                        },
                    );
                    cleanup.consumers.push(consumer_id);
                }
            }

            cleanup.producers.extend(participant.producers.keys().cloned());
            cleanup.consumers.extend(participant.consumers.keys().cloned());
            cleanup.transports.extend(participant.send_transport.clone());
            cleanup.transports.extend(participant.recv_transport.clone());

            room.broadcast_all(&ServerMessage::UserDisconnected {
                socket_id: participant_id.clone(),
            });

            if room.participants.is_empty() {
                router_id = Some(room.router_id.clone());
                true
            } else {
                false
            }
        }; // room lock released

        self.release_engine_objects(cleanup).await;

        if room_empty {
            // Re-check emptiness under the outer write lock before removing
            let still_empty = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                match rooms.get(&room_id) {
                    Some(lock) => {
                        if lock.try_write().map_or(false, |room| room.participants.is_empty()) {
                            rooms.remove(&room_id);
                            true
                        } else {
                            false
                        }
                    }
                    None => false,
                }
            };
            if still_empty {
                info!("Room {} is empty, cleaning up", room_id);
                if let Some(router_id) = router_id {
                    if let Err(e) = self.engine.close_router(&router_id).await {
                        warn!("Failed to close router for room {}: {}", room_id, e);
                    }
                }
            }
        }

        info!("Participant {} left room {}", participant_id, room_id);
        self.metrics.inc_leaves();
        Ok(())
    }

    async fn release_engine_objects(&self, cleanup: EngineCleanup) {
        for consumer_id in &cleanup.consumers {
            self.engine.close_consumer(consumer_id).await.ok();
        }
        for producer_id in &cleanup.producers {
            self.engine.close_producer(producer_id).await.ok();
            self.metrics.inc_producers_closed();
        }
        for transport_id in &cleanup.transports {
            self.engine.close_transport(transport_id).await.ok();
        }
    }

    /// RTP capabilities of the caller's room router
    pub async fn router_rtp_capabilities(
        &self,
        participant_id: &ParticipantId,
    ) -> RegistryResult<RtpCapabilities> {
        let (_, room_lock) = self.current_room(participant_id)?;
        let router_id = room_lock.read().await.router_id.clone();
        Ok(self.engine.router_rtp_capabilities(&router_id).await?)
    }

    /// Creates a send or receive transport for the caller and records it.
    pub async fn create_transport(
        &self,
        participant_id: &ParticipantId,
        is_sender: bool,
    ) -> RegistryResult<TransportDescriptor> {
        let (_, room_lock) = self.current_room(participant_id)?;
        let router_id = room_lock.read().await.router_id.clone();

        let direction = if is_sender {
            TransportDirection::Send
        } else {
            TransportDirection::Recv
        };
        let descriptor = self.engine.create_transport(&router_id, direction).await?;

        let orphaned = {
            let mut room = room_lock.write().await;
            match room.participants.get_mut(participant_id) {
                Some(participant) => {
                    let slot = if is_sender {
                        &mut participant.send_transport
                    } else {
                        &mut participant.recv_transport
                    };
                    // Replacing an existing transport closes the old one
                    slot.replace(descriptor.id.clone())
                }
                None => {
                    drop(room);
                    self.engine.close_transport(&descriptor.id).await.ok();
                    return Err(RegistryError::NotInRoom(participant_id.clone()));
                }
            }
        };
        if let Some(old) = orphaned {
            self.engine.close_transport(&old).await.ok();
        }

        debug!(
            "Created {} transport {} for participant {}",
            if is_sender { "send" } else { "recv" },
            descriptor.id,
            participant_id
        );
        Ok(descriptor)
    }

    /// Completes the DTLS handshake for one of the caller's transports.
    pub async fn connect_transport(
        &self,
        participant_id: &ParticipantId,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> RegistryResult<()> {
        let (_, room_lock) = self.current_room(participant_id)?;
        {
            let room = room_lock.read().await;
            let participant = room
                .participants
                .get(participant_id)
                .ok_or_else(|| RegistryError::NotInRoom(participant_id.clone()))?;
            let owned = participant.send_transport.as_ref() == Some(transport_id)
                || participant.recv_transport.as_ref() == Some(transport_id);
            if !owned {
                return Err(RegistryError::TransportNotFound(transport_id.clone()));
            }
        } // read lock released before the engine call

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await?;
        debug!(
            "Connected transport {} for participant {}",
            transport_id, participant_id
        );
        Ok(())
    }

    /// Creates a producer on the caller's send transport and announces it to
    /// the rest of the room.
    ///
    /// At most one camera/microphone producer per kind: producing again with
    /// the same kind replaces the previous producer, closing it and its
    /// consumers. Screen-share producers live in their own slot, tagged via
    /// `app_data.is_screen_share`.
    pub async fn produce(
        &self,
        participant_id: &ParticipantId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        app_data: ProducerAppData,
    ) -> RegistryResult<ProducerId> {
        let (_, room_lock) = self.current_room(participant_id)?;

        let send_transport = {
            let room = room_lock.read().await;
            let participant = room
                .participants
                .get(participant_id)
                .ok_or_else(|| RegistryError::NotInRoom(participant_id.clone()))?;
            participant
                .send_transport
                .clone()
                .ok_or_else(|| RegistryError::NoSendTransport(participant_id.clone()))?
        };

        // Engine call without the room lock
        let producer_id = self
            .engine
            .produce(&send_transport, kind, rtp_parameters)
            .await?;
        let is_screen_share = app_data.is_screen_share;

        // Record, replace, and broadcast under one write lock so the
        // new-producer event carries consistent state
        let (victim, victim_consumers) = {
            let mut room = room_lock.write().await;
            let Some(participant) = room.participants.get_mut(participant_id) else {
                drop(room);
                self.engine.close_producer(&producer_id).await.ok();
                return Err(RegistryError::NotInRoom(participant_id.clone()));
            };

            if let Some(name) = app_data.name {
                participant.name = name;
            }

            let victim = participant
                .producers
                .iter()
                .find(|(_, r)| r.kind == kind && r.is_screen_share == is_screen_share)
                .map(|(id, _)| id.clone());
            if let Some(victim_id) = &victim {
                participant.producers.remove(victim_id);
            }
            participant.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    kind,
                    is_screen_share,
                },
            );
            let announcement = ProducerAnnouncement {
                producer_id: producer_id.clone(),
                socket_id: participant_id.clone(),
                name: participant.name.clone(),
                kind,
                is_screen_share,
            };

            let victim_consumers = match &victim {
                Some(victim_id) => {
                    let removed = room.remove_consumers_of(victim_id);
                    for (owner_id, _) in &removed {
                        room.send_to(
                            owner_id,
                            &ServerMessage::ProducerClosed {
                                producer_id: victim_id.clone(),
                            },
                        );
                    }
                    removed
                }
                None => Vec::new(),
            };

            room.broadcast_except(participant_id, &ServerMessage::NewProducer(announcement));
            (victim, victim_consumers)
        }; // room lock released

        for (_, consumer_id) in &victim_consumers {
            self.engine.close_consumer(consumer_id).await.ok();
        }
        if let Some(victim_id) = &victim {
            self.engine.close_producer(victim_id).await.ok();
            self.metrics.inc_producers_closed();
            debug!(
                "Producer {} replaced by {} for participant {}",
                victim_id, producer_id, participant_id
            );
        }

        info!(
            "Created {} producer {} for participant {} (screen share: {})",
            kind, producer_id, participant_id, is_screen_share
        );
        self.metrics.inc_producers_created();
        Ok(producer_id)
    }

    /// Creates a consumer on the caller's receive transport for a producer
    /// owned by another participant in the same room.
    pub async fn consume(
        &self,
        participant_id: &ParticipantId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> RegistryResult<ConsumerDescriptor> {
        let (_, room_lock) = self.current_room(participant_id)?;

        let (router_id, recv_transport, producer_live) = {
            let room = room_lock.read().await;
            let participant = room
                .participants
                .get(participant_id)
                .ok_or_else(|| RegistryError::NotInRoom(participant_id.clone()))?;
            let recv = participant
                .recv_transport
                .clone()
                .ok_or_else(|| RegistryError::NoRecvTransport(participant_id.clone()))?;
            let live = room
                .participants
                .values()
                .any(|p| p.producers.contains_key(producer_id));
            (room.router_id.clone(), recv, live)
        };

        // An unknown or already-closed producer is not consumable
        if !producer_live {
            return Err(RegistryError::CannotConsume);
        }
        if !self
            .engine
            .can_consume(&router_id, producer_id, &rtp_capabilities)
            .await?
        {
            return Err(RegistryError::CannotConsume);
        }

        let descriptor = self
            .engine
            .consume(&recv_transport, producer_id, rtp_capabilities)
            .await
            .map_err(|e| match e {
                // The producer can vanish between the liveness check and the
                // engine call; that is still just "cannot consume"
                EngineError::ProducerNotFound(_) => RegistryError::CannotConsume,
                other => RegistryError::Engine(other),
            })?;

        {
            let mut room = room_lock.write().await;
            match room.participants.get_mut(participant_id) {
                Some(participant) => {
                    participant.consumers.insert(
                        descriptor.id.clone(),
                        ConsumerRecord {
                            producer_id: producer_id.clone(),
                        },
                    );
                }
                None => {
                    drop(room);
                    self.engine.close_consumer(&descriptor.id).await.ok();
                    return Err(RegistryError::NotInRoom(participant_id.clone()));
                }
            }
        }

        debug!(
            "Created consumer {} for participant {} on producer {}",
            descriptor.id, participant_id, producer_id
        );
        self.metrics.inc_consumers_created();
        Ok(descriptor)
    }

    /// Resumes one of the caller's consumers. A resume for a consumer that
    /// no longer exists (closed by a cascade the client has not seen yet)
    /// is logged and ignored.
    pub async fn resume_consumer(
        &self,
        participant_id: &ParticipantId,
        consumer_id: &ConsumerId,
    ) -> RegistryResult<()> {
        let (_, room_lock) = self.current_room(participant_id)?;
        let known = {
            let room = room_lock.read().await;
            room.participants
                .get(participant_id)
                .map_or(false, |p| p.consumers.contains_key(consumer_id))
        };
        if !known {
            debug!(
                "Resume for unknown consumer {} from participant {}, ignoring",
                consumer_id, participant_id
            );
            return Ok(());
        }
        if let Err(e) = self.engine.resume_consumer(consumer_id).await {
            warn!("Failed to resume consumer {}: {}", consumer_id, e);
        }
        Ok(())
    }

    /// Records the caller's mute state, pauses or resumes their microphone
    /// producer, and notifies the rest of the room.
    pub async fn set_mute(&self, participant_id: &ParticipantId, muted: bool) -> RegistryResult<()> {
        let (_, room_lock) = self.current_room(participant_id)?;

        let mic_producers: Vec<ProducerId> = {
            let mut room = room_lock.write().await;
            let Some(participant) = room.participants.get_mut(participant_id) else {
                return Err(RegistryError::NotInRoom(participant_id.clone()));
            };
            participant.muted = muted;
            let mics = participant
                .producers
                .iter()
                .filter(|(_, r)| r.kind == MediaKind::Audio && !r.is_screen_share)
                .map(|(id, _)| id.clone())
                .collect();
            room.broadcast_except(
                participant_id,
                &ServerMessage::UserMuteStatusChanged {
                    socket_id: participant_id.clone(),
                    muted,
                },
            );
            mics
        }; // room lock released

        for producer_id in &mic_producers {
            let result = if muted {
                self.engine.pause_producer(producer_id).await
            } else {
                self.engine.resume_producer(producer_id).await
            };
            if let Err(e) = result {
                warn!("Failed to update pause state of producer {}: {}", producer_id, e);
            }
        }

        debug!("Participant {} muted: {}", participant_id, muted);
        Ok(())
    }

    /// Pauses or resumes the caller's camera producer. The producer stays
    /// registered, so re-enabling the camera never renegotiates. Screen-share
    /// producers are untouched.
    pub async fn set_camera_enabled(
        &self,
        participant_id: &ParticipantId,
        enabled: bool,
    ) -> RegistryResult<()> {
        let (_, room_lock) = self.current_room(participant_id)?;

        let camera_producers: Vec<ProducerId> = {
            let room = room_lock.read().await;
            let Some(participant) = room.participants.get(participant_id) else {
                return Err(RegistryError::NotInRoom(participant_id.clone()));
            };
            participant
                .producers
                .iter()
                .filter(|(_, r)| r.kind == MediaKind::Video && !r.is_screen_share)
                .map(|(id, _)| id.clone())
                .collect()
        }; // room lock released

        for producer_id in &camera_producers {
            let result = if enabled {
                self.engine.resume_producer(producer_id).await
            } else {
                self.engine.pause_producer(producer_id).await
            };
            if let Err(e) = result {
                warn!("Failed to update pause state of producer {}: {}", producer_id, e);
            }
        }

        debug!("Participant {} camera enabled: {}", participant_id, enabled);
        Ok(())
    }

    /// Closes one of the caller's producers, cascading to every consumer of
    /// it. Each affected participant gets a producer-closed event. Closing a
    /// producer the caller does not own (already replaced or torn down) is a
    /// no-op.
    pub async fn close_producer(
        &self,
        participant_id: &ParticipantId,
        producer_id: &ProducerId,
    ) -> RegistryResult<()> {
        let (_, room_lock) = self.current_room(participant_id)?;

        let victim_consumers = {
            let mut room = room_lock.write().await;
            let Some(participant) = room.participants.get_mut(participant_id) else {
                return Err(RegistryError::NotInRoom(participant_id.clone()));
            };
            if participant.producers.remove(producer_id).is_none() {
                debug!(
                    "Close for unowned producer {} from participant {}, ignoring",
                    producer_id, participant_id
                );
                return Ok(());
            }
            let removed = room.remove_consumers_of(producer_id);
            for (owner_id, _) in &removed {
                room.send_to(
                    owner_id,
                    &ServerMessage::ProducerClosed {
                        producer_id: producer_id.clone(),
                    },
                );
            }
            removed
        }; // room lock released

        for (_, consumer_id) in &victim_consumers {
            self.engine.close_consumer(consumer_id).await.ok();
        }
        if let Err(e) = self.engine.close_producer(producer_id).await {
            warn!("Failed to close producer {}: {}", producer_id, e);
        }

        info!(
            "Closed producer {} for participant {} ({} consumers cascaded)",
            producer_id,
            participant_id,
            victim_consumers.len()
        );
        self.metrics.inc_producers_closed();
        Ok(())
    }

    /// Gracefully shuts down all rooms and their engine objects.
    pub async fn shutdown(&self) {
        info!("Shutting down all rooms...");

        let all_rooms: Vec<(RoomId, Arc<TokioRwLock<Room>>)> = {
            let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
            rooms.drain().collect()
        };

        for (room_id, room_lock) in &all_rooms {
            let router_id = {
                let room = room_lock.read().await;
                room.router_id.clone()
            };
            self.engine.close_router(&router_id).await.ok();
            info!("Shut down room {}", room_id);
        }

        let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
        connections.clear();

        info!("All rooms shut down ({} total)", all_rooms.len());
    }

    /// Gets current room count
    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Gets total participant count across all rooms
    pub async fn total_participant_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };

        let mut total = 0;
        for room_lock in room_locks {
            if let Ok(room) = room_lock.try_read() {
                total += room.participants.len();
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_codecs;
    use crate::engine::LocalMediaEngine;
    use serde_json::json;

    struct TestPeer {
        id: ParticipantId,
        rx: mpsc::Receiver<Arc<String>>,
    }

    impl TestPeer {
        /// Drains every message delivered so far, in order.
        fn drain(&mut self) -> Vec<ServerMessage> {
            let mut out = Vec::new();
            while let Ok(json) = self.rx.try_recv() {
                out.push(serde_json::from_str(&json).unwrap());
            }
            out
        }
    }

    fn setup() -> (Arc<RoomRegistry>, Arc<LocalMediaEngine>) {
        let engine = Arc::new(LocalMediaEngine::new(default_codecs()));
        let registry = Arc::new(RoomRegistry::new(engine.clone(), ServerMetrics::new()));
        (registry, engine)
    }

    fn connect(registry: &RoomRegistry) -> TestPeer {
        let id = ParticipantId::random();
        let (tx, rx) = mpsc::channel(64);
        registry.register(id.clone(), tx);
        TestPeer { id, rx }
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
        }))
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters(json!({
            "codecs": [{ "mimeType": "audio/opus", "payloadType": 111, "clockRate": 48000 }],
        }))
    }

    fn full_capabilities() -> RtpCapabilities {
        RtpCapabilities(json!({
            "codecs": [
                { "mimeType": "audio/opus", "clockRate": 48000 },
                { "mimeType": "video/VP8", "clockRate": 90000 },
            ],
        }))
    }

    async fn join(registry: &RoomRegistry, peer: &TestPeer, room: &str, name: &str) -> Vec<ProducerAnnouncement> {
        registry
            .join_room(&peer.id, &RoomId::new(room), name.to_string())
            .await
            .unwrap()
    }

    /// Joins, creates both transports, and returns the send transport id.
    async fn join_with_transports(
        registry: &RoomRegistry,
        peer: &TestPeer,
        room: &str,
        name: &str,
    ) -> Vec<ProducerAnnouncement> {
        let snapshot = join(registry, peer, room, name).await;
        registry.create_transport(&peer.id, true).await.unwrap();
        registry.create_transport(&peer.id, false).await.unwrap();
        snapshot
    }

    async fn produce_video(registry: &RoomRegistry, peer: &TestPeer) -> ProducerId {
        registry
            .produce(&peer.id, MediaKind::Video, vp8_parameters(), ProducerAppData::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn join_snapshot_lists_prior_producers_only() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        let video = produce_video(&registry, &alice).await;

        let bob = connect(&registry);
        let snapshot = join(&registry, &bob, "r1", "Bob").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].producer_id, video);
        assert_eq!(snapshot[0].socket_id, alice.id);
        assert_eq!(snapshot[0].name, "Alice");

        // The producing participant never sees their own producer announced
        let own_snapshot = join(&registry, &alice, "r2", "Alice").await;
        assert!(own_snapshot.is_empty());
    }

    #[tokio::test]
    async fn join_room_runs_on_a_spawned_task() {
        // spawn requires the future to be Send; joining must not hold a
        // std lock guard across an await
        let (registry, _) = setup();
        let alice = connect(&registry);
        let task_registry = registry.clone();
        let id = alice.id.clone();
        tokio::spawn(async move {
            task_registry
                .join_room(&id, &RoomId::new("r1"), "Alice".to_string())
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn join_snapshot_frame_precedes_later_broadcasts() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        let first = produce_video(&registry, &alice).await;

        let mut bob = connect(&registry);
        join(&registry, &bob, "r1", "Bob").await;
        let second = produce_video(&registry, &alice).await;

        // The snapshot is queued under the same lock as the membership
        // insert, so it is always first in the joiner's channel
        let events = bob.drain();
        assert!(matches!(
            &events[0],
            ServerMessage::ExistingProducers { producers }
                if producers.len() == 1 && producers[0].producer_id == first
        ));
        assert!(matches!(
            &events[1],
            ServerMessage::NewProducer(a) if a.producer_id == second
        ));
    }

    #[tokio::test]
    async fn produce_without_send_transport_is_rejected() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        join(&registry, &alice, "r1", "Alice").await;
        let err = registry
            .produce(&alice.id, MediaKind::Video, vp8_parameters(), ProducerAppData::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoSendTransport(_)));
    }

    #[tokio::test]
    async fn new_producer_reaches_everyone_but_the_owner() {
        let (registry, _) = setup();
        let mut alice = connect(&registry);
        let mut bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join(&registry, &bob, "r1", "Bob").await;

        let video = produce_video(&registry, &alice).await;

        let bob_events = bob.drain();
        assert_eq!(bob_events.len(), 1);
        match &bob_events[0] {
            ServerMessage::NewProducer(a) => {
                assert_eq!(a.producer_id, video);
                assert_eq!(a.socket_id, alice.id);
                assert_eq!(a.kind, MediaKind::Video);
                assert!(!a.is_screen_share);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn consume_unknown_producer_is_cannot_consume() {
        let (registry, _) = setup();
        let bob = connect(&registry);
        join_with_transports(&registry, &bob, "r1", "Bob").await;

        let err = registry
            .consume(&bob.id, &ProducerId::random(), full_capabilities())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CannotConsume));
        assert_eq!(err.to_string(), "Cannot consume");
    }

    #[tokio::test]
    async fn consume_with_incompatible_capabilities_is_cannot_consume() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        let bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join_with_transports(&registry, &bob, "r1", "Bob").await;
        let video = produce_video(&registry, &alice).await;

        let audio_only = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }],
        }));
        let err = registry
            .consume(&bob.id, &video, audio_only)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CannotConsume));
    }

    #[tokio::test]
    async fn close_producer_notifies_each_consumer_exactly_once() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        let mut bob = connect(&registry);
        let mut carol = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join_with_transports(&registry, &bob, "r1", "Bob").await;
        join_with_transports(&registry, &carol, "r1", "Carol").await;

        let video = produce_video(&registry, &alice).await;
        let bob_consumer = registry.consume(&bob.id, &video, full_capabilities()).await.unwrap();
        let carol_consumer = registry.consume(&carol.id, &video, full_capabilities()).await.unwrap();
        bob.drain();
        carol.drain();

        registry.close_producer(&alice.id, &video).await.unwrap();

        for (peer, consumer) in [(&mut bob, &bob_consumer), (&mut carol, &carol_consumer)] {
            let events = peer.drain();
            let closed: Vec<_> = events
                .iter()
                .filter(|m| matches!(m, ServerMessage::ProducerClosed { producer_id } if *producer_id == video))
                .collect();
            assert_eq!(closed.len(), 1, "expected exactly one producer-closed");
            assert!(engine.consumer_paused(&consumer.id).is_none(), "consumer should be closed");
        }
        assert_eq!(engine.live_producer_count(), 0);

        // Closing again is a no-op
        registry.close_producer(&alice.id, &video).await.unwrap();
    }

    #[tokio::test]
    async fn producing_same_kind_replaces_previous_producer() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        let mut bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join_with_transports(&registry, &bob, "r1", "Bob").await;

        let first = produce_video(&registry, &alice).await;
        registry.consume(&bob.id, &first, full_capabilities()).await.unwrap();
        bob.drain();

        let second = produce_video(&registry, &alice).await;
        assert_ne!(first, second);
        assert_eq!(engine.live_producer_count(), 1);

        let events = bob.drain();
        assert!(events.iter().any(|m| matches!(
            m,
            ServerMessage::ProducerClosed { producer_id } if *producer_id == first
        )));
        assert!(events.iter().any(|m| matches!(
            m,
            ServerMessage::NewProducer(a) if a.producer_id == second
        )));
    }

    #[tokio::test]
    async fn screen_share_occupies_its_own_slot() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;

        produce_video(&registry, &alice).await;
        registry
            .produce(
                &alice.id,
                MediaKind::Video,
                vp8_parameters(),
                ProducerAppData {
                    name: None,
                    is_screen_share: true,
                },
            )
            .await
            .unwrap();

        // Camera and screen share coexist
        assert_eq!(engine.live_producer_count(), 2);
    }

    #[tokio::test]
    async fn leave_delivers_producer_closed_before_user_disconnected() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        let mut bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join_with_transports(&registry, &bob, "r1", "Bob").await;

        let video = produce_video(&registry, &alice).await;
        registry.consume(&bob.id, &video, full_capabilities()).await.unwrap();
        bob.drain();

        registry.leave_room(&alice.id).await.unwrap();

        let events = bob.drain();
        let closed_pos = events
            .iter()
            .position(|m| matches!(m, ServerMessage::ProducerClosed { .. }))
            .expect("producer-closed missing");
        let gone_pos = events
            .iter()
            .position(|m| matches!(m, ServerMessage::UserDisconnected { socket_id } if *socket_id == alice.id))
            .expect("user-disconnected missing");
        assert!(closed_pos < gone_pos);
    }

    #[tokio::test]
    async fn empty_room_is_removed_and_router_closed() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        produce_video(&registry, &alice).await;
        assert_eq!(registry.room_count(), 1);

        registry.leave_room(&alice.id).await.unwrap();

        assert_eq!(registry.room_count(), 0);
        assert_eq!(engine.live_producer_count(), 0);
        // Rejoining mints a fresh room
        join(&registry, &alice, "r1", "Alice").await;
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn leave_without_room_is_a_noop() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        registry.leave_room(&alice.id).await.unwrap();
        registry.leave_room(&alice.id).await.unwrap();
    }

    #[tokio::test]
    async fn set_mute_pauses_microphone_and_notifies_others() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        let mut bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join(&registry, &bob, "r1", "Bob").await;

        let mic = registry
            .produce(&alice.id, MediaKind::Audio, opus_parameters(), ProducerAppData::default())
            .await
            .unwrap();
        bob.drain();

        registry.set_mute(&alice.id, true).await.unwrap();
        assert_eq!(engine.producer_paused(&mic), Some(true));
        let events = bob.drain();
        assert!(events.iter().any(|m| matches!(
            m,
            ServerMessage::UserMuteStatusChanged { socket_id, muted: true } if *socket_id == alice.id
        )));

        registry.set_mute(&alice.id, false).await.unwrap();
        assert_eq!(engine.producer_paused(&mic), Some(false));
    }

    #[tokio::test]
    async fn camera_toggle_pauses_only_the_camera_producer() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;

        let camera = produce_video(&registry, &alice).await;
        let screen = registry
            .produce(
                &alice.id,
                MediaKind::Video,
                vp8_parameters(),
                ProducerAppData {
                    name: None,
                    is_screen_share: true,
                },
            )
            .await
            .unwrap();

        registry.set_camera_enabled(&alice.id, false).await.unwrap();
        assert_eq!(engine.producer_paused(&camera), Some(true));
        assert_eq!(engine.producer_paused(&screen), Some(false));

        registry.set_camera_enabled(&alice.id, true).await.unwrap();
        assert_eq!(engine.producer_paused(&camera), Some(false));
    }

    #[tokio::test]
    async fn resume_unknown_consumer_is_silently_ignored() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        registry
            .resume_consumer(&alice.id, &ConsumerId::random())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn connect_transport_rejects_foreign_ids() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        let err = registry
            .connect_transport(&alice.id, &TransportId::random(), DtlsParameters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::TransportNotFound(_)));
    }

    #[tokio::test]
    async fn disconnect_tears_down_like_leave() {
        let (registry, engine) = setup();
        let alice = connect(&registry);
        let mut bob = connect(&registry);
        join_with_transports(&registry, &alice, "r1", "Alice").await;
        join_with_transports(&registry, &bob, "r1", "Bob").await;
        let video = produce_video(&registry, &alice).await;
        registry.consume(&bob.id, &video, full_capabilities()).await.unwrap();
        bob.drain();

        registry.disconnect(&alice.id).await;

        let events = bob.drain();
        assert!(events.iter().any(|m| matches!(m, ServerMessage::ProducerClosed { .. })));
        assert!(events.iter().any(|m| matches!(m, ServerMessage::UserDisconnected { .. })));
        assert_eq!(engine.live_producer_count(), 0);

        // The connection slot is gone too
        let err = registry
            .join_room(&alice.id, &RoomId::new("r1"), "Alice".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::NotRegistered(_)));
    }

    #[tokio::test]
    async fn operations_outside_a_room_fail_with_not_in_room() {
        let (registry, _) = setup();
        let alice = connect(&registry);
        let err = registry.router_rtp_capabilities(&alice.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotInRoom(_)));
        let err = registry.create_transport(&alice.id, true).await.unwrap_err();
        assert!(matches!(err, RegistryError::NotInRoom(_)));
    }
}
