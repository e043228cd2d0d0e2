//! In-process media engine
//!
//! Keeps routers, transports, producers and consumers as plain objects and
//! implements the negotiation rules the signaling layer depends on:
//! - routers only accept producers whose codec is in their capability set
//! - `can_consume` requires a live producer and a matching receiver codec
//! - closing a transport closes its producers and consumers
//! - closing a producer closes every consumer of it
//!
//! No RTP is relayed. The engine tracks live resources so callers can verify
//! that nothing leaks.

use super::{
    Consumer, DtlsFingerprint, DtlsParameters, DtlsRole, DtlsState, EngineError, EngineResource,
    EngineResult, IceCandidate, IceParameters, MediaEngine, Producer, Router, RtpCapabilities,
    RtpCodecCapability, RtpParameters, Transport, TransportProtocol, WebRtcTransportOptions,
};
use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::debug;
use uuid::Uuid;

/// First payload type handed out to codecs without a preferred one
const DYNAMIC_PAYLOAD_TYPE_START: u8 = 100;

/// First port used for candidates
const CANDIDATE_PORT_START: u16 = 40000;

#[derive(Default)]
struct EngineState {
    routers_created: AtomicUsize,
    live_routers: AtomicUsize,
    live_transports: AtomicUsize,
    live_producers: AtomicUsize,
    live_consumers: AtomicUsize,
    next_port: AtomicU16,
    transports: DashMap<TransportId, Weak<LocalTransport>>,
}

/// In-process [`MediaEngine`]
#[derive(Clone, Default)]
pub struct LocalEngine {
    state: Arc<EngineState>,
}

impl LocalEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total routers ever created by this engine
    #[must_use]
    pub fn routers_created(&self) -> usize {
        self.state.routers_created.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_routers(&self) -> usize {
        self.state.live_routers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_transports(&self) -> usize {
        self.state.live_transports.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_producers(&self) -> usize {
        self.state.live_producers.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn live_consumers(&self) -> usize {
        self.state.live_consumers.load(Ordering::SeqCst)
    }

    /// Look up a live transport, e.g. to drive its DTLS state
    #[must_use]
    pub fn transport(&self, id: &TransportId) -> Option<Arc<LocalTransport>> {
        self.state.transports.get(id).and_then(|entry| entry.upgrade())
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self, media_codecs: Vec<RtpCodecCapability>) -> EngineResult<Arc<dyn Router>> {
        if media_codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one media codec".to_string(),
            ));
        }

        // Router creation is a round trip to the engine
        tokio::task::yield_now().await;

        let mut next_payload_type = DYNAMIC_PAYLOAD_TYPE_START;
        let codecs = media_codecs
            .into_iter()
            .map(|mut codec| {
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        let router = Arc::new_cyclic(|me| LocalRouter {
            id: Uuid::new_v4().to_string(),
            me: me.clone(),
            capabilities: RtpCapabilities {
                codecs,
                header_extensions: Vec::new(),
            },
            transports: DashMap::new(),
            producers: DashMap::new(),
            closed: AtomicBool::new(false),
            engine: Arc::clone(&self.state),
        });

        self.state.routers_created.fetch_add(1, Ordering::SeqCst);
        self.state.live_routers.fetch_add(1, Ordering::SeqCst);
        debug!(router_id = %router.id, "Router created");

        Ok(router)
    }
}

pub struct LocalRouter {
    id: String,
    me: Weak<LocalRouter>,
    capabilities: RtpCapabilities,
    transports: DashMap<TransportId, Arc<LocalTransport>>,
    producers: DashMap<ProducerId, Arc<LocalProducer>>,
    closed: AtomicBool,
    engine: Arc<EngineState>,
}

impl LocalRouter {
    fn supports(&self, rtp_parameters: &RtpParameters, kind: MediaKind) -> EngineResult<()> {
        let codec = rtp_parameters
            .codecs
            .first()
            .ok_or_else(|| EngineError::InvalidParameters("rtpParameters has no codecs".to_string()))?;

        if codec.kind() != Some(kind) {
            return Err(EngineError::InvalidParameters(format!(
                "codec {} does not match kind {kind}",
                codec.mime_type
            )));
        }

        if self.capabilities.codecs.iter().any(|cap| codec.is_instance_of(cap)) {
            Ok(())
        } else {
            Err(EngineError::Unsupported(format!(
                "codec {} is not enabled on this router",
                codec.mime_type
            )))
        }
    }

    fn next_port(&self) -> u16 {
        CANDIDATE_PORT_START.wrapping_add(self.engine.next_port.fetch_add(1, Ordering::SeqCst))
    }
}

impl Drop for LocalRouter {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.engine.live_routers.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl Router for LocalRouter {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn rtp_capabilities(&self) -> RtpCapabilities {
        self.capabilities.clone()
    }

    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool {
        let Some(producer) = self.producers.get(producer_id).map(|p| Arc::clone(p.value())) else {
            return false;
        };
        if producer.is_closed() {
            return false;
        }
        producer.rtp_parameters.codecs.first().is_some_and(|codec| {
            rtp_capabilities
                .codecs
                .iter()
                .any(|cap| codec.is_instance_of(cap))
        })
    }

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }
        if !options.enable_udp && !options.enable_tcp {
            return Err(EngineError::InvalidParameters(
                "at least one of UDP or TCP must be enabled".to_string(),
            ));
        }

        tokio::task::yield_now().await;

        // The router may have been closed while we were away
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed(format!("router {}", self.id)));
        }

        let address = options
            .announced_address
            .clone()
            .unwrap_or_else(|| options.listen_ip.to_string());
        let (udp_priority, tcp_priority) = if options.prefer_udp {
            (1_076_558_079, 1_076_302_079)
        } else {
            (1_076_302_079, 1_076_558_079)
        };

        let mut ice_candidates = Vec::new();
        if options.enable_udp {
            ice_candidates.push(IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: udp_priority,
                address: address.clone(),
                protocol: TransportProtocol::Udp,
                port: self.next_port(),
                candidate_type: "host".to_string(),
                tcp_type: None,
            });
        }
        if options.enable_tcp {
            ice_candidates.push(IceCandidate {
                foundation: "tcpcandidate".to_string(),
                priority: tcp_priority,
                address,
                protocol: TransportProtocol::Tcp,
                port: self.next_port(),
                candidate_type: "host".to_string(),
                tcp_type: Some("passive".to_string()),
            });
        }

        let (dtls_tx, _) = watch::channel(DtlsState::New);
        let transport = Arc::new(LocalTransport {
            id: TransportId::new(Uuid::new_v4().to_string()),
            router: self.me.clone(),
            ice_parameters: IceParameters {
                username_fragment: nanoid::nanoid!(16),
                password: nanoid::nanoid!(32),
                ice_lite: true,
            },
            ice_candidates,
            dtls_parameters: DtlsParameters {
                role: Some(DtlsRole::Auto),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
            dtls_tx,
            closed: AtomicBool::new(false),
            producers: Mutex::new(Vec::new()),
            consumers: Mutex::new(Vec::new()),
            engine: Arc::clone(&self.engine),
        });

        self.transports
            .insert(transport.id.clone(), Arc::clone(&transport));
        self.engine
            .transports
            .insert(transport.id.clone(), Arc::downgrade(&transport));
        self.engine.live_transports.fetch_add(1, Ordering::SeqCst);
        debug!(router_id = %self.id, transport_id = %transport.id, "Transport created");

        Ok(transport)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let transports: Vec<_> = self
            .transports
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for transport in transports {
            let _ = transport.close();
        }
        self.engine.live_routers.fetch_sub(1, Ordering::SeqCst);
        debug!(router_id = %self.id, "Router closed");
    }
}

fn random_fingerprint() -> String {
    let bytes = [*Uuid::new_v4().as_bytes(), *Uuid::new_v4().as_bytes()].concat();
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub struct LocalTransport {
    id: TransportId,
    router: Weak<LocalRouter>,
    ice_parameters: IceParameters,
    ice_candidates: Vec<IceCandidate>,
    dtls_parameters: DtlsParameters,
    dtls_tx: watch::Sender<DtlsState>,
    closed: AtomicBool,
    producers: Mutex<Vec<Arc<LocalProducer>>>,
    consumers: Mutex<Vec<Arc<LocalConsumer>>>,
    engine: Arc<EngineState>,
}

impl LocalTransport {
    /// Report a DTLS state change, as the network side of a real engine would
    pub fn set_dtls_state(&self, state: DtlsState) {
        self.dtls_tx.send_replace(state);
    }

    fn router(&self) -> EngineResult<Arc<LocalRouter>> {
        self.router
            .upgrade()
            .filter(|router| !router.closed.load(Ordering::SeqCst))
            .ok_or_else(|| EngineError::Closed("router".to_string()))
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(EngineError::Closed(format!("transport {}", self.id)))
        } else {
            Ok(())
        }
    }
}

impl EngineResource for LocalTransport {
    fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers {
            let _ = consumer.close();
        }
        let producers = std::mem::take(&mut *self.producers.lock());
        for producer in producers {
            let _ = producer.close();
        }

        self.dtls_tx.send_replace(DtlsState::Closed);
        if let Some(router) = self.router.upgrade() {
            router.transports.remove(&self.id);
        }
        self.engine.transports.remove(&self.id);
        self.engine.live_transports.fetch_sub(1, Ordering::SeqCst);
        debug!(transport_id = %self.id, "Transport closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    fn id(&self) -> TransportId {
        self.id.clone()
    }

    fn ice_parameters(&self) -> IceParameters {
        self.ice_parameters.clone()
    }

    fn ice_candidates(&self) -> Vec<IceCandidate> {
        self.ice_candidates.clone()
    }

    fn dtls_parameters(&self) -> DtlsParameters {
        self.dtls_parameters.clone()
    }

    fn dtls_state(&self) -> watch::Receiver<DtlsState> {
        self.dtls_tx.subscribe()
    }

    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()> {
        self.ensure_open()?;
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters has no fingerprints".to_string(),
            ));
        }
        if *self.dtls_tx.borrow() != DtlsState::New {
            return Err(EngineError::Request("connect() already called".to_string()));
        }

        self.dtls_tx.send_replace(DtlsState::Connecting);
        tokio::task::yield_now().await;
        self.ensure_open()?;
        self.dtls_tx.send_replace(DtlsState::Connected);
        debug!(transport_id = %self.id, "Transport connected");
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>> {
        self.ensure_open()?;
        let router = self.router()?;
        router.supports(&rtp_parameters, kind)?;

        tokio::task::yield_now().await;
        self.ensure_open()?;

        let producer = Arc::new(LocalProducer {
            id: ProducerId::new(Uuid::new_v4().to_string()),
            kind,
            rtp_parameters,
            router: Arc::downgrade(&router),
            closed: AtomicBool::new(false),
            consumers: Mutex::new(Vec::new()),
            engine: Arc::clone(&self.engine),
        });

        router
            .producers
            .insert(producer.id.clone(), Arc::clone(&producer));
        self.producers.lock().push(Arc::clone(&producer));
        self.engine.live_producers.fetch_add(1, Ordering::SeqCst);
        debug!(transport_id = %self.id, producer_id = %producer.id, kind = %kind, "Producer created");

        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>> {
        self.ensure_open()?;
        let router = self.router()?;
        if !router.can_consume(&producer_id, &rtp_capabilities) {
            return Err(EngineError::InvalidParameters(format!(
                "cannot consume producer {producer_id}"
            )));
        }
        let producer = router
            .producers
            .get(&producer_id)
            .map(|p| Arc::clone(p.value()))
            .ok_or_else(|| EngineError::NotFound(format!("producer {producer_id}")))?;

        tokio::task::yield_now().await;
        self.ensure_open()?;
        if producer.is_closed() {
            return Err(EngineError::Closed(format!("producer {producer_id}")));
        }

        let mid = self.consumers.lock().len().to_string();
        let rtp_parameters = RtpParameters {
            mid: Some(mid),
            ..producer.rtp_parameters.clone()
        };

        let consumer = Arc::new(LocalConsumer {
            id: ConsumerId::new(Uuid::new_v4().to_string()),
            producer_id: producer_id.clone(),
            kind: producer.kind,
            rtp_parameters,
            paused: AtomicBool::new(paused),
            closed: AtomicBool::new(false),
            engine: Arc::clone(&self.engine),
        });

        producer.consumers.lock().push(Arc::downgrade(&consumer));
        self.consumers.lock().push(Arc::clone(&consumer));
        self.engine.live_consumers.fetch_add(1, Ordering::SeqCst);
        debug!(
            transport_id = %self.id,
            consumer_id = %consumer.id,
            producer_id = %producer_id,
            "Consumer created"
        );

        Ok(consumer)
    }
}

pub struct LocalProducer {
    id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    router: Weak<LocalRouter>,
    closed: AtomicBool,
    consumers: Mutex<Vec<Weak<LocalConsumer>>>,
    engine: Arc<EngineState>,
}

impl EngineResource for LocalProducer {
    fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Consumers cannot outlive the producer they read from
        let consumers = std::mem::take(&mut *self.consumers.lock());
        for consumer in consumers.iter().filter_map(Weak::upgrade) {
            let _ = consumer.close();
        }

        if let Some(router) = self.router.upgrade() {
            router.producers.remove(&self.id);
        }
        self.engine.live_producers.fetch_sub(1, Ordering::SeqCst);
        debug!(producer_id = %self.id, "Producer closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Producer for LocalProducer {
    fn id(&self) -> ProducerId {
        self.id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }
}

pub struct LocalConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    closed: AtomicBool,
    engine: Arc<EngineState>,
}

impl EngineResource for LocalConsumer {
    fn close(&self) -> EngineResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.engine.live_consumers.fetch_sub(1, Ordering::SeqCst);
        debug!(consumer_id = %self.id, "Consumer closed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Consumer for LocalConsumer {
    fn id(&self) -> ConsumerId {
        self.id.clone()
    }

    fn producer_id(&self) -> ProducerId {
        self.producer_id.clone()
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> EngineResult<()> {
        if self.is_closed() {
            return Err(EngineError::Closed(format!("consumer {}", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::RtpCodecParameters;
    use serde_json::Map;

    pub(crate) fn opus_parameters() -> RtpParameters {
        RtpParameters {
            mid: Some("0".to_string()),
            codecs: vec![RtpCodecParameters {
                mime_type: "audio/opus".to_string(),
                payload_type: 100,
                clock_rate: 48000,
                channels: Some(2),
                parameters: Map::new(),
                rtcp_feedback: Vec::new(),
            }],
            ..RtpParameters::default()
        }
    }

    pub(crate) fn opus_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![RtpCodecCapability::opus()],
            header_extensions: Vec::new(),
        }
    }

    pub(crate) fn client_dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some(DtlsRole::Client),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    async fn router(engine: &LocalEngine) -> Arc<dyn Router> {
        engine
            .create_router(vec![RtpCodecCapability::opus()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;

        let caps = router.rtp_capabilities();
        assert_eq!(caps.codecs[0].preferred_payload_type, Some(DYNAMIC_PAYLOAD_TYPE_START));
        assert_eq!(engine.routers_created(), 1);
        assert_eq!(engine.live_routers(), 1);

        router.close();
        assert_eq!(engine.live_routers(), 0);
    }

    #[tokio::test]
    async fn test_router_rejects_empty_codecs() {
        let engine = LocalEngine::new();
        let result = engine.create_router(Vec::new()).await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_transport_candidates_follow_options() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;

        let options = WebRtcTransportOptions {
            announced_address: Some("relay.example.com".to_string()),
            enable_tcp: false,
            ..WebRtcTransportOptions::default()
        };
        let transport = router.create_webrtc_transport(options).await.unwrap();
        let candidates = transport.ice_candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].protocol, TransportProtocol::Udp);
        assert_eq!(candidates[0].address, "relay.example.com");

        let disabled = WebRtcTransportOptions {
            enable_udp: false,
            enable_tcp: false,
            ..WebRtcTransportOptions::default()
        };
        assert!(router.create_webrtc_transport(disabled).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        transport.connect(client_dtls()).await.unwrap();
        assert_eq!(*transport.dtls_state().borrow(), DtlsState::Connected);
        assert!(transport.connect(client_dtls()).await.is_err());
    }

    #[tokio::test]
    async fn test_produce_requires_enabled_codec() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        let mut vp8 = opus_parameters();
        vp8.codecs[0].mime_type = "video/VP8".to_string();
        vp8.codecs[0].clock_rate = 90000;
        vp8.codecs[0].channels = None;
        let result = transport.produce(MediaKind::Video, vp8).await;
        assert!(matches!(result, Err(EngineError::Unsupported(_))));

        let result = transport.produce(MediaKind::Video, opus_parameters()).await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));

        transport
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        assert_eq!(engine.live_producers(), 1);
    }

    #[tokio::test]
    async fn test_can_consume_and_cascade_close() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let send = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        let recv = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        let producer = send
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        assert!(router.can_consume(&producer.id(), &opus_capabilities()));
        assert!(!router.can_consume(&producer.id(), &RtpCapabilities::default()));
        assert!(!router.can_consume(&ProducerId::from("missing"), &opus_capabilities()));

        let consumer = recv
            .consume(producer.id(), opus_capabilities(), false)
            .await
            .unwrap();
        assert_eq!(consumer.kind(), MediaKind::Audio);
        assert!(!consumer.is_paused());
        assert_eq!(engine.live_consumers(), 1);

        // Closing the send transport takes the producer and its consumer with it
        send.close().unwrap();
        assert!(producer.is_closed());
        assert!(consumer.is_closed());
        assert_eq!(engine.live_producers(), 0);
        assert_eq!(engine.live_consumers(), 0);

        // Closing twice is harmless
        send.close().unwrap();
        assert_eq!(engine.live_transports(), 1);
    }

    #[tokio::test]
    async fn test_transport_lookup_and_dtls_state() {
        let engine = LocalEngine::new();
        let router = router(&engine).await;
        let transport = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();

        let local = engine.transport(&transport.id()).unwrap();
        let mut state = transport.dtls_state();
        local.set_dtls_state(DtlsState::Failed);
        state.changed().await.unwrap();
        assert_eq!(*state.borrow(), DtlsState::Failed);

        router.close();
        assert!(transport.is_closed());
        assert!(engine.transport(&transport.id()).is_none());
    }
}
