#![forbid(unsafe_code)]

// In-process media engine: allocates handles and tracks object lifecycles
// without moving any media. Stands in for an out-of-process SFU worker.

use crate::engine::types::*;
use crate::engine::MediaEngine;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::debug;

struct TransportState {
    router_id: RouterId,
    direction: TransportDirection,
    connected: bool,
}

struct ProducerState {
    transport_id: TransportId,
    router_id: RouterId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: bool,
}

struct ConsumerState {
    #[allow(dead_code)]
    transport_id: TransportId,
    producer_id: ProducerId,
    paused: bool,
}

#[derive(Default)]
struct Inner {
    routers: HashMap<RouterId, RtpCapabilities>,
    transports: HashMap<TransportId, TransportState>,
    producers: HashMap<ProducerId, ProducerState>,
    consumers: HashMap<ConsumerId, ConsumerState>,
}

/// Engine implementation backed by in-memory bookkeeping.
///
/// Every handle it mints is a fresh UUID. Liveness, pause state, and the
/// parent/child relationships between routers, transports, producers, and
/// consumers are tracked faithfully so the orchestration layer above sees
/// the same observable contract a real SFU presents.
pub struct LocalMediaEngine {
    codecs: Vec<CodecConfig>,
    inner: Mutex<Inner>,
}

impl LocalMediaEngine {
    pub fn new(codecs: Vec<CodecConfig>) -> Self {
        Self {
            codecs,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn router_capabilities(&self) -> RtpCapabilities {
        let codecs: Vec<serde_json::Value> = self
            .codecs
            .iter()
            .map(|c| {
                json!({
                    "kind": c.kind,
                    "mimeType": c.mime_type,
                    "clockRate": c.clock_rate,
                    "channels": c.channels,
                    "parameters": c.parameters,
                })
            })
            .collect();
        RtpCapabilities(json!({ "codecs": codecs, "headerExtensions": [] }))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Extracts the lowercased mime types from the `codecs` array of a
/// capabilities or parameters blob.
fn mime_types(value: &serde_json::Value) -> Vec<String> {
    value
        .get("codecs")
        .and_then(|c| c.as_array())
        .map(|codecs| {
            codecs
                .iter()
                .filter_map(|c| c.get("mimeType").and_then(|m| m.as_str()))
                .map(str::to_ascii_lowercase)
                .collect()
        })
        .unwrap_or_default()
}

/// Mime types a producer offers; falls back to the canonical codec for its
/// kind when the parameters blob does not carry a codec list.
fn producer_mime_types(state: &ProducerState) -> Vec<String> {
    let listed = mime_types(&state.rtp_parameters.0);
    if !listed.is_empty() {
        return listed;
    }
    match state.kind {
        MediaKind::Audio => vec!["audio/opus".to_string()],
        MediaKind::Video => vec!["video/vp8".to_string()],
    }
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_router(&self) -> EngineResult<RouterId> {
        let capabilities = self.router_capabilities();
        let id = RouterId::random();
        self.lock().routers.insert(id.clone(), capabilities);
        debug!("Created router {}", id);
        Ok(id)
    }

    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.routers.remove(router_id).is_none() {
            return Err(EngineError::RouterNotFound(router_id.clone()));
        }
        // Cascade: drop everything parented by this router
        inner.producers.retain(|_, p| p.router_id != *router_id);
        let dead_transports: Vec<TransportId> = inner
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == *router_id)
            .map(|(id, _)| id.clone())
            .collect();
        inner
            .transports
            .retain(|_, t| t.router_id != *router_id);
        inner
            .consumers
            .retain(|_, c| !dead_transports.contains(&c.transport_id));
        debug!("Closed router {}", router_id);
        Ok(())
    }

    async fn router_rtp_capabilities(&self, router_id: &RouterId) -> EngineResult<RtpCapabilities> {
        self.lock()
            .routers
            .get(router_id)
            .cloned()
            .ok_or_else(|| EngineError::RouterNotFound(router_id.clone()))
    }

    async fn create_transport(
        &self,
        router_id: &RouterId,
        direction: TransportDirection,
    ) -> EngineResult<TransportDescriptor> {
        let mut inner = self.lock();
        if !inner.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.clone()));
        }
        let id = TransportId::random();
        inner.transports.insert(
            id.clone(),
            TransportState {
                router_id: router_id.clone(),
                direction,
                connected: false,
            },
        );
        Ok(TransportDescriptor {
            id: id.clone(),
            ice_parameters: IceParameters(json!({
                "usernameFragment": uuid::Uuid::new_v4().to_string(),
                "password": uuid::Uuid::new_v4().to_string(),
                "iceLite": true,
            })),
            ice_candidates: vec![IceCandidate(json!({
                "foundation": "udpcandidate",
                "ip": "127.0.0.1",
                "port": 40000,
                "priority": 1_076_302_079_u32,
                "protocol": "udp",
                "type": "host",
            }))],
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [{
                    "algorithm": "sha-256",
                    "value": uuid::Uuid::new_v4().to_string(),
                }],
            })),
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        _dtls_parameters: DtlsParameters,
    ) -> EngineResult<()> {
        let mut inner = self.lock();
        let transport = inner
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        if transport.connected {
            return Err(EngineError::InvalidState(format!(
                "transport {transport_id} already connected"
            )));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.transports.remove(transport_id).is_none() {
            return Err(EngineError::TransportNotFound(transport_id.clone()));
        }
        inner
            .producers
            .retain(|_, p| p.transport_id != *transport_id);
        inner
            .consumers
            .retain(|_, c| c.transport_id != *transport_id);
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerId> {
        let mut inner = self.lock();
        let transport = inner
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != TransportDirection::Send {
            return Err(EngineError::InvalidState(format!(
                "transport {transport_id} is not a send transport"
            )));
        }
        let router_id = transport.router_id.clone();
        let id = ProducerId::random();
        inner.producers.insert(
            id.clone(),
            ProducerState {
                transport_id: transport_id.clone(),
                router_id,
                kind,
                rtp_parameters,
                paused: false,
            },
        );
        debug!("Created {} producer {}", kind, id);
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.producers.remove(producer_id).is_none() {
            return Err(EngineError::ProducerNotFound(producer_id.clone()));
        }
        Ok(())
    }

    async fn pause_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        let mut inner = self.lock();
        let producer = inner
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        producer.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &ProducerId) -> EngineResult<()> {
        let mut inner = self.lock();
        let producer = inner
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;
        producer.paused = false;
        Ok(())
    }

    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<bool> {
        let inner = self.lock();
        if !inner.routers.contains_key(router_id) {
            return Err(EngineError::RouterNotFound(router_id.clone()));
        }
        let producer = match inner.producers.get(producer_id) {
            Some(p) if p.router_id == *router_id => p,
            _ => return Ok(false),
        };
        let offered = producer_mime_types(producer);
        let supported = mime_types(&rtp_capabilities.0);
        Ok(offered.iter().any(|m| supported.contains(m)))
    }

    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> EngineResult<ConsumerDescriptor> {
        let mut inner = self.lock();
        let transport = inner
            .transports
            .get(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.clone()))?;
        if transport.direction != TransportDirection::Recv {
            return Err(EngineError::InvalidState(format!(
                "transport {transport_id} is not a receive transport"
            )));
        }
        let producer = inner
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.clone()))?;

        let offered = producer_mime_types(producer);
        let supported = mime_types(&rtp_capabilities.0);
        if !offered.iter().any(|m| supported.contains(m)) {
            return Err(EngineError::InvalidState(format!(
                "capabilities cannot consume producer {producer_id}"
            )));
        }

        let kind = producer.kind;
        let rtp_parameters = producer.rtp_parameters.clone();
        let id = ConsumerId::random();
        inner.consumers.insert(
            id.clone(),
            ConsumerState {
                transport_id: transport_id.clone(),
                producer_id: producer_id.clone(),
                // Consumers start paused; the client resumes once wired up
                paused: true,
            },
        );
        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.clone(),
            kind,
            rtp_parameters,
        })
    }

    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        let mut inner = self.lock();
        let consumer = inner
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| EngineError::ConsumerNotFound(consumer_id.clone()))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()> {
        let mut inner = self.lock();
        if inner.consumers.remove(consumer_id).is_none() {
            return Err(EngineError::ConsumerNotFound(consumer_id.clone()));
        }
        Ok(())
    }
}

impl LocalMediaEngine {
    /// Pause state of a producer (test and diagnostics hook).
    pub fn producer_paused(&self, producer_id: &ProducerId) -> Option<bool> {
        self.lock().producers.get(producer_id).map(|p| p.paused)
    }

    /// Pause state of a consumer (test and diagnostics hook).
    pub fn consumer_paused(&self, consumer_id: &ConsumerId) -> Option<bool> {
        self.lock().consumers.get(consumer_id).map(|c| c.paused)
    }

    /// Producer a consumer is attached to, if the consumer is alive.
    pub fn consumer_producer(&self, consumer_id: &ConsumerId) -> Option<ProducerId> {
        self.lock()
            .consumers
            .get(consumer_id)
            .map(|c| c.producer_id.clone())
    }

    pub fn live_producer_count(&self) -> usize {
        self.lock().producers.len()
    }

    pub fn live_consumer_count(&self) -> usize {
        self.lock().consumers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_codecs;

    fn engine() -> LocalMediaEngine {
        LocalMediaEngine::new(default_codecs())
    }

    fn vp8_parameters() -> RtpParameters {
        RtpParameters(json!({
            "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }],
            "encodings": [{ "ssrc": 1111 }],
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

    #[tokio::test]
    async fn router_capabilities_list_configured_codecs() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let caps = engine.router_rtp_capabilities(&router).await.unwrap();
        let mimes = mime_types(&caps.0);
        assert!(mimes.contains(&"audio/opus".to_string()));
        assert!(mimes.contains(&"video/vp8".to_string()));
    }

    #[tokio::test]
    async fn transport_connects_exactly_once() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let transport = engine
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        engine
            .connect_transport(&transport.id, DtlsParameters::default())
            .await
            .unwrap();
        let err = engine
            .connect_transport(&transport.id, DtlsParameters::default())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn produce_requires_send_transport() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let recv = engine
            .create_transport(&router, TransportDirection::Recv)
            .await
            .unwrap();
        let err = engine
            .produce(&recv.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn can_consume_requires_codec_overlap() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let send = engine
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();

        assert!(engine
            .can_consume(&router, &producer, &full_capabilities())
            .await
            .unwrap());

        let audio_only = RtpCapabilities(json!({
            "codecs": [{ "mimeType": "audio/opus", "clockRate": 48000 }],
        }));
        assert!(!engine
            .can_consume(&router, &producer, &audio_only)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn can_consume_is_false_for_unknown_producer() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let unknown = ProducerId::random();
        assert!(!engine
            .can_consume(&router, &unknown, &full_capabilities())
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn consumers_start_paused_and_resume_is_idempotent() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let send = engine
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_transport(&router, TransportDirection::Recv)
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer, full_capabilities())
            .await
            .unwrap();

        assert_eq!(engine.consumer_paused(&consumer.id), Some(true));
        engine.resume_consumer(&consumer.id).await.unwrap();
        engine.resume_consumer(&consumer.id).await.unwrap();
        assert_eq!(engine.consumer_paused(&consumer.id), Some(false));
    }

    #[tokio::test]
    async fn closing_router_cascades_to_children() {
        let engine = engine();
        let router = engine.create_router().await.unwrap();
        let send = engine
            .create_transport(&router, TransportDirection::Send)
            .await
            .unwrap();
        let recv = engine
            .create_transport(&router, TransportDirection::Recv)
            .await
            .unwrap();
        let producer = engine
            .produce(&send.id, MediaKind::Video, vp8_parameters())
            .await
            .unwrap();
        engine
            .consume(&recv.id, &producer, full_capabilities())
            .await
            .unwrap();

        engine.close_router(&router).await.unwrap();
        assert_eq!(engine.live_producer_count(), 0);
        assert_eq!(engine.live_consumer_count(), 0);
        assert!(matches!(
            engine.router_rtp_capabilities(&router).await.unwrap_err(),
            EngineError::RouterNotFound(_)
        ));
    }
}
