#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::protocol::{ClientCommand, ClientRequest, ServerMessage};
use crate::engine::ParticipantId;
use crate::metrics::ServerMetrics;
use crate::registry::RoomRegistry;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
/// Messages queued beyond this are stale — drop them early.
pub const CHANNEL_CAPACITY: usize = 64;

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

const MAX_ROOM_ID_LEN: usize = 128;
const MAX_DISPLAY_NAME_LEN: usize = 64;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Dispatch state for one signaling session, independent of the socket that
/// feeds it. The WebSocket loop below drives it in production; tests drive
/// it directly.
pub struct SessionConnection {
    participant_id: ParticipantId,
    registry: Arc<RoomRegistry>,
    sender: mpsc::Sender<Arc<String>>,
    metrics: ServerMetrics,
}

impl SessionConnection {
    /// Registers a fresh connection with the registry.
    pub fn new(
        registry: Arc<RoomRegistry>,
        sender: mpsc::Sender<Arc<String>>,
        metrics: ServerMetrics,
    ) -> Self {
        let participant_id = ParticipantId::random();
        registry.register(participant_id.clone(), sender.clone());
        Self {
            participant_id,
            registry,
            sender,
            metrics,
        }
    }

    pub fn participant_id(&self) -> &ParticipantId {
        &self.participant_id
    }

    /// Handles one inbound text frame. Command failures become `error`
    /// replies carrying the request's correlation id; they never tear the
    /// connection down.
    pub async fn handle_text(&self, text: &str) {
        self.metrics.inc_messages_received();
        match serde_json::from_str::<ClientRequest>(text) {
            Ok(request) => {
                let request_id = request.request_id;
                let start = Instant::now();
                let result = self.handle_command(request.command, request_id).await;
                self.metrics.observe_message_handling(start.elapsed());

                if let Err(e) = result {
                    debug!(
                        "Error handling message from {}: {}",
                        self.participant_id, e
                    );
                    self.metrics.inc_errors();
                    let _ = send_json(
                        &self.sender,
                        &ServerMessage::Error {
                            request_id,
                            error: e.to_string(),
                        },
                    );
                }
            }
            Err(e) => {
                warn!("Invalid message format from {}: {}", self.participant_id, e);
                self.metrics.inc_errors();
                let _ = send_json(
                    &self.sender,
                    &ServerMessage::Error {
                        request_id: None,
                        error: format!("Invalid message format: {e}"),
                    },
                );
            }
        }
    }

    /// Tears down the session's registry state.
    pub async fn close(&self) {
        self.registry.disconnect(&self.participant_id).await;
    }

    async fn handle_command(
        &self,
        command: ClientCommand,
        request_id: Option<u64>,
    ) -> anyhow::Result<()> {
        match command {
            ClientCommand::JoinRoom {
                room_id,
                display_name,
            } => {
                if room_id.is_empty() || room_id.len() > MAX_ROOM_ID_LEN {
                    anyhow::bail!("Invalid roomId: must be 1-{MAX_ROOM_ID_LEN} characters");
                }
                if display_name.is_empty() || display_name.len() > MAX_DISPLAY_NAME_LEN {
                    anyhow::bail!(
                        "Invalid displayName: must be 1-{MAX_DISPLAY_NAME_LEN} characters"
                    );
                }

                // The registry queues the existing-producers snapshot to the
                // joiner itself, under the room lock
                self.registry
                    .join_room(&self.participant_id, &room_id.into(), display_name)
                    .await?;
            }

            ClientCommand::LeaveRoom => {
                self.registry.leave_room(&self.participant_id).await?;
            }

            ClientCommand::RouterRtpCapabilities => {
                let request_id = require_request_id(request_id)?;
                let rtp_capabilities = self
                    .registry
                    .router_rtp_capabilities(&self.participant_id)
                    .await?;
                send_json(
                    &self.sender,
                    &ServerMessage::RouterRtpCapabilities {
                        request_id,
                        rtp_capabilities,
                    },
                )?;
            }

            ClientCommand::CreateTransport { is_sender } => {
                let request_id = require_request_id(request_id)?;
                let descriptor = self
                    .registry
                    .create_transport(&self.participant_id, is_sender)
                    .await?;
                send_json(
                    &self.sender,
                    &ServerMessage::TransportCreated {
                        request_id,
                        id: descriptor.id,
                        ice_parameters: descriptor.ice_parameters,
                        ice_candidates: descriptor.ice_candidates,
                        dtls_parameters: descriptor.dtls_parameters,
                    },
                )?;
            }

            ClientCommand::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let request_id = require_request_id(request_id)?;
                self.registry
                    .connect_transport(&self.participant_id, &transport_id, dtls_parameters)
                    .await?;
                send_json(
                    &self.sender,
                    &ServerMessage::TransportConnected { request_id },
                )?;
            }

            ClientCommand::Produce {
                kind,
                rtp_parameters,
                app_data,
            } => {
                let request_id = require_request_id(request_id)?;
                let id = self
                    .registry
                    .produce(&self.participant_id, kind, rtp_parameters, app_data)
                    .await?;
                send_json(&self.sender, &ServerMessage::Produced { request_id, id })?;
            }

            ClientCommand::Consume {
                producer_id,
                rtp_capabilities,
            } => {
                let request_id = require_request_id(request_id)?;
                let descriptor = self
                    .registry
                    .consume(&self.participant_id, &producer_id, rtp_capabilities)
                    .await?;
                send_json(
                    &self.sender,
                    &ServerMessage::Consumed {
                        request_id,
                        id: descriptor.id,
                        producer_id: descriptor.producer_id,
                        kind: descriptor.kind,
                        rtp_parameters: descriptor.rtp_parameters,
                    },
                )?;
            }

            ClientCommand::ResumeConsumer { consumer_id } => {
                let request_id = require_request_id(request_id)?;
                self.registry
                    .resume_consumer(&self.participant_id, &consumer_id)
                    .await?;
                send_json(&self.sender, &ServerMessage::ConsumerResumed { request_id })?;
            }

            ClientCommand::CloseProducer { producer_id } => {
                self.registry
                    .close_producer(&self.participant_id, &producer_id)
                    .await?;
            }

            ClientCommand::MuteStatusChange { muted } => {
                self.registry.set_mute(&self.participant_id, muted).await?;
            }

            ClientCommand::CameraStatusChange { enabled } => {
                self.registry
                    .set_camera_enabled(&self.participant_id, enabled)
                    .await?;
            }
        }

        Ok(())
    }
}

fn require_request_id(request_id: Option<u64>) -> anyhow::Result<u64> {
    request_id.ok_or_else(|| anyhow::anyhow!("Missing requestId"))
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    registry: Arc<RoomRegistry>,
    metrics: ServerMetrics,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let connection = SessionConnection::new(registry, tx.clone(), metrics.clone());
    let participant_id = connection.participant_id().clone();
    info!("New WebSocket connection: {}", participant_id);

    // Spawn task to send messages to client
    let send_task_id = participant_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender.send(Message::Text((*json).clone())).await.is_err() {
                break;
            }
        }
        debug!("Send task finished for participant: {}", send_task_id);
    });

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close the connection if no message arrives in time
        let msg = match tokio::time::timeout(idle_timeout, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for participant {}", participant_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for participant {}", participant_id);
                        let _ = send_json(
                            &tx,
                            &ServerMessage::Error {
                                request_id: None,
                                error: format!(
                                    "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                connection.handle_text(&text).await;
            }
            Message::Close(_) => {
                info!("Client {} closed connection", participant_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", participant_id);
            }
        }
    }

    // Leaves the room (if any) and drops the registry entry; this is where
    // the user-disconnected fanout happens for abrupt socket closes
    connection.close().await;

    // _conn_guard dropped here → dec_connections_active
    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for participant: {}", participant_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_codecs;
    use crate::engine::LocalMediaEngine;
    use serde_json::json;

    fn setup() -> Arc<RoomRegistry> {
        let engine = Arc::new(LocalMediaEngine::new(default_codecs()));
        Arc::new(RoomRegistry::new(engine, ServerMetrics::new()))
    }

    fn session(registry: &Arc<RoomRegistry>) -> (SessionConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection = SessionConnection::new(registry.clone(), tx, ServerMetrics::new());
        (connection, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn malformed_frame_yields_uncorrelated_error() {
        let registry = setup();
        let (connection, mut rx) = session(&registry);
        connection.handle_text("not json at all").await;
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Error { request_id, error } => {
                assert!(request_id.is_none());
                assert!(error.starts_with("Invalid message format"));
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_before_join_fails_with_correlated_error() {
        let registry = setup();
        let (connection, mut rx) = session(&registry);
        let frame = json!({ "type": "routerRtpCapabilities", "requestId": 5 }).to_string();
        connection.handle_text(&frame).await;
        let messages = drain(&mut rx);
        assert_eq!(messages.len(), 1);
        match &messages[0] {
            ServerMessage::Error { request_id, .. } => assert_eq!(*request_id, Some(5)),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn join_then_capabilities_round_trip() {
        let registry = setup();
        let (connection, mut rx) = session(&registry);

        let join = json!({ "type": "join-room", "roomId": "r1", "displayName": "Alice" });
        connection.handle_text(&join.to_string()).await;
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::ExistingProducers { ref producers } if producers.is_empty()
        ));

        let caps = json!({ "type": "routerRtpCapabilities", "requestId": 1 });
        connection.handle_text(&caps.to_string()).await;
        let messages = drain(&mut rx);
        match &messages[0] {
            ServerMessage::RouterRtpCapabilities {
                request_id,
                rtp_capabilities,
            } => {
                assert_eq!(*request_id, 1);
                assert!(rtp_capabilities.0.get("codecs").is_some());
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_room_id_is_rejected() {
        let registry = setup();
        let (connection, mut rx) = session(&registry);
        let join = json!({ "type": "join-room", "roomId": "", "displayName": "Alice" });
        connection.handle_text(&join.to_string()).await;
        let messages = drain(&mut rx);
        assert!(matches!(messages[0], ServerMessage::Error { .. }));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn request_without_request_id_is_rejected() {
        let registry = setup();
        let (connection, mut rx) = session(&registry);
        let join = json!({ "type": "join-room", "roomId": "r1", "displayName": "Alice" });
        connection.handle_text(&join.to_string()).await;
        drain(&mut rx);

        let frame = json!({ "type": "create-transport", "isSender": true });
        connection.handle_text(&frame.to_string()).await;
        let messages = drain(&mut rx);
        match &messages[0] {
            ServerMessage::Error { error, .. } => assert!(error.contains("requestId")),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_removes_participant_from_room() {
        let registry = setup();
        let (connection, _rx) = session(&registry);
        let join = json!({ "type": "join-room", "roomId": "r1", "displayName": "Alice" });
        connection.handle_text(&join.to_string()).await;
        assert_eq!(registry.room_count(), 1);

        connection.close().await;
        assert_eq!(registry.room_count(), 0);
    }
}
