#![forbid(unsafe_code)]

// Media engine adapter - the boundary between session orchestration and the SFU

pub mod local;
pub mod types;

pub use local::LocalMediaEngine;
pub use types::*;

use async_trait::async_trait;

/// Abstract interface to the SFU media plane.
///
/// The registry drives this trait and never assumes anything about the
/// implementation beyond the documented contract: handles are opaque,
/// operations on unknown handles fail with a typed error, and closing a
/// parent object invalidates its children.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a media router (one per room).
    async fn create_router(&self) -> EngineResult<RouterId>;

    /// Closes a router and every transport, producer, and consumer under it.
    async fn close_router(&self, router_id: &RouterId) -> EngineResult<()>;

    /// Returns the RTP capabilities clients must load before consuming.
    async fn router_rtp_capabilities(&self, router_id: &RouterId) -> EngineResult<RtpCapabilities>;

    /// Creates a WebRTC transport on a router.
    async fn create_transport(
        &self,
        router_id: &RouterId,
        direction: TransportDirection,
    ) -> EngineResult<TransportDescriptor>;

    /// Completes the DTLS handshake for a transport.
    async fn connect_transport(
        &self,
        transport_id: &TransportId,
        dtls_parameters: DtlsParameters,
    ) -> EngineResult<()>;

    /// Closes a transport and its producers/consumers.
    async fn close_transport(&self, transport_id: &TransportId) -> EngineResult<()>;

    /// Creates a producer on a send transport.
    async fn produce(
        &self,
        transport_id: &TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerId>;

    /// Closes a producer. Consumers of it are NOT closed here; the registry
    /// owns that cascade so it can notify affected participants.
    async fn close_producer(&self, producer_id: &ProducerId) -> EngineResult<()>;

    /// Pauses a producer (media keeps flowing into the transport but is dropped).
    async fn pause_producer(&self, producer_id: &ProducerId) -> EngineResult<()>;

    /// Resumes a paused producer.
    async fn resume_producer(&self, producer_id: &ProducerId) -> EngineResult<()>;

    /// Returns whether a client with the given capabilities can consume the producer.
    async fn can_consume(
        &self,
        router_id: &RouterId,
        producer_id: &ProducerId,
        rtp_capabilities: &RtpCapabilities,
    ) -> EngineResult<bool>;

    /// Creates a consumer on a receive transport. Consumers start paused and
    /// must be resumed explicitly once the client is ready to receive.
    async fn consume(
        &self,
        transport_id: &TransportId,
        producer_id: &ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> EngineResult<ConsumerDescriptor>;

    /// Resumes a paused consumer. Idempotent.
    async fn resume_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()>;

    /// Closes a consumer.
    async fn close_consumer(&self, consumer_id: &ConsumerId) -> EngineResult<()>;
}
