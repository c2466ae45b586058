#![forbid(unsafe_code)]

// Signaling channel: request/response correlation over a persistent
// connection. Each request carries a fresh requestId; the reader routes
// reply frames back to the waiting caller and everything else onto the
// event stream.

use super::error::ClientError;
use crate::signaling::protocol::{ClientCommand, ClientRequest, ServerMessage};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Sends a request and waits for its correlated reply. An `error` reply
    /// becomes `ClientError::Signaling`.
    async fn request(&self, command: ClientCommand) -> Result<ServerMessage, ClientError>;

    /// Sends a fire-and-forget message.
    async fn notify(&self, command: ClientCommand) -> Result<(), ClientError>;
}

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<ServerMessage>>>>;

fn check_reply(message: ServerMessage) -> Result<ServerMessage, ClientError> {
    match message {
        ServerMessage::Error { error, .. } => Err(ClientError::Signaling(error)),
        other => Ok(other),
    }
}

fn route_inbound(
    message: ServerMessage,
    pending: &PendingMap,
    events: &mpsc::UnboundedSender<ServerMessage>,
) {
    match message.request_id() {
        Some(id) => {
            let waiter = pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            match waiter {
                Some(tx) => {
                    let _ = tx.send(message);
                }
                None => debug!("Reply for unknown request {}", id),
            }
        }
        None => {
            let _ = events.send(message);
        }
    }
}

/// WebSocket-backed signaling channel.
pub struct WsChannel {
    outbound: mpsc::UnboundedSender<WsMessage>,
    pending: PendingMap,
    next_request_id: AtomicU64,
}

impl WsChannel {
    /// Connects to the signaling server. Returns the channel plus the stream
    /// of server events (everything that is not a correlated reply).
    pub async fn connect(
        url: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ServerMessage>), ClientError> {
        let (stream, _) = connect_async(url)
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;
        let (mut sink, mut source) = stream.split();

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<WsMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                if sink.send(frame).await.is_err() {
                    break;
                }
            }
        });

        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(frame) = source.next().await {
                let text = match frame {
                    Ok(WsMessage::Text(text)) => text,
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match serde_json::from_str::<ServerMessage>(&text) {
                    Ok(message) => route_inbound(message, &reader_pending, &event_tx),
                    Err(e) => warn!("Unparseable server frame: {}", e),
                }
            }
            // Dropping the waiters wakes every in-flight request with
            // ChannelClosed
            reader_pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clear();
        });

        Ok((
            Self {
                outbound,
                pending,
                next_request_id: AtomicU64::new(1),
            },
            event_rx,
        ))
    }

    fn send_frame(&self, frame: &ClientRequest) -> Result<(), ClientError> {
        let json = serde_json::to_string(frame)?;
        self.outbound
            .send(WsMessage::Text(json))
            .map_err(|_| ClientError::ChannelClosed)
    }
}

#[async_trait]
impl SignalingChannel for WsChannel {
    async fn request(&self, command: ClientCommand) -> Result<ServerMessage, ClientError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);

        let frame = ClientRequest {
            request_id: Some(id),
            command,
        };
        if let Err(e) = self.send_frame(&frame) {
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&id);
            return Err(e);
        }

        let reply = rx.await.map_err(|_| ClientError::ChannelClosed)?;
        check_reply(reply)
    }

    async fn notify(&self, command: ClientCommand) -> Result<(), ClientError> {
        self.send_frame(&ClientRequest::notification(command))
    }
}

/// In-process channel that drives a server-side session directly, without a
/// socket. Frames the server pushes between requests are buffered until
/// `pump` moves them onto the event stream.
#[cfg(test)]
pub struct LoopbackChannel {
    connection: crate::signaling::connection::SessionConnection,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Arc<String>>>,
    events: mpsc::UnboundedSender<ServerMessage>,
    next_request_id: AtomicU64,
}

#[cfg(test)]
impl LoopbackChannel {
    pub fn new(
        registry: Arc<crate::registry::RoomRegistry>,
    ) -> (Self, mpsc::UnboundedReceiver<ServerMessage>) {
        use crate::signaling::connection::{SessionConnection, CHANNEL_CAPACITY};

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let connection =
            SessionConnection::new(registry, tx, crate::metrics::ServerMetrics::new());
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (
            Self {
                connection,
                inbound: tokio::sync::Mutex::new(rx),
                events: event_tx,
                next_request_id: AtomicU64::new(1),
            },
            event_rx,
        )
    }

    pub fn participant_id(&self) -> &crate::engine::ParticipantId {
        self.connection.participant_id()
    }

    /// Moves buffered server frames onto the event stream.
    pub async fn pump(&self) {
        let mut inbound = self.inbound.lock().await;
        while let Ok(json) = inbound.try_recv() {
            match serde_json::from_str::<ServerMessage>(&json) {
                Ok(message) => {
                    let _ = self.events.send(message);
                }
                Err(e) => warn!("Unparseable server frame: {}", e),
            }
        }
    }

    pub async fn close(&self) {
        self.connection.close().await;
    }
}

#[cfg(test)]
#[async_trait]
impl SignalingChannel for LoopbackChannel {
    async fn request(&self, command: ClientCommand) -> Result<ServerMessage, ClientError> {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let frame = ClientRequest {
            request_id: Some(id),
            command,
        };
        let json = serde_json::to_string(&frame)?;
        self.connection.handle_text(&json).await;

        let mut reply = None;
        let mut inbound = self.inbound.lock().await;
        while let Ok(json) = inbound.try_recv() {
            let message: ServerMessage = serde_json::from_str(&json)?;
            if message.request_id() == Some(id) {
                reply = Some(message);
            } else {
                let _ = self.events.send(message);
            }
        }
        check_reply(reply.ok_or(ClientError::ChannelClosed)?)
    }

    async fn notify(&self, command: ClientCommand) -> Result<(), ClientError> {
        let json = serde_json::to_string(&ClientRequest::notification(command))?;
        self.connection.handle_text(&json).await;
        self.pump().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_codecs;
    use crate::engine::LocalMediaEngine;
    use crate::metrics::ServerMetrics;
    use crate::registry::RoomRegistry;

    fn setup() -> Arc<RoomRegistry> {
        let engine = Arc::new(LocalMediaEngine::new(default_codecs()));
        Arc::new(RoomRegistry::new(engine, ServerMetrics::new()))
    }

    #[tokio::test]
    async fn error_reply_surfaces_as_signaling_error() {
        let registry = setup();
        let (channel, _events) = LoopbackChannel::new(registry);
        let err = channel
            .request(ClientCommand::RouterRtpCapabilities)
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Signaling(_)));
    }

    #[tokio::test]
    async fn join_notification_delivers_snapshot_event() {
        let registry = setup();
        let (channel, mut events) = LoopbackChannel::new(registry);
        channel
            .notify(ClientCommand::JoinRoom {
                room_id: "r1".to_string(),
                display_name: "Alice".to_string(),
            })
            .await
            .unwrap();
        let event = events.try_recv().unwrap();
        assert!(matches!(
            event,
            ServerMessage::ExistingProducers { ref producers } if producers.is_empty()
        ));
    }
}
