//! Peer session
//!
//! The resources one connection owns in one room. Handles are kept in creation
//! order and released in dependency order on teardown:
//! consumers, then producers, then transports.

use crate::resource::{CloseOutcome, ConsumerHandle, ProducerHandle, TransportHandle};
use crate::types::{Direction, PeerId, ProducerId, RoomId, TransportId, UserId};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-connection state inside a room
pub struct PeerSession {
    pub peer_id: PeerId,
    pub user_id: UserId,
    pub room_id: RoomId,
    pub joined_at: DateTime<Utc>,
    transports: Vec<Arc<TransportHandle>>,
    producers: Vec<Arc<ProducerHandle>>,
    consumers: Vec<Arc<ConsumerHandle>>,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer_id: PeerId, user_id: UserId, room_id: RoomId) -> Self {
        Self {
            peer_id,
            user_id,
            room_id,
            joined_at: Utc::now(),
            transports: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
        }
    }

    pub fn add_transport(&mut self, transport: Arc<TransportHandle>) {
        self.transports.push(transport);
    }

    pub fn add_producer(&mut self, producer: Arc<ProducerHandle>) {
        self.producers.push(producer);
    }

    pub fn add_consumer(&mut self, consumer: Arc<ConsumerHandle>) {
        self.consumers.push(consumer);
    }

    /// Transport owned by this session. Never looks at other peers.
    #[must_use]
    pub fn transport(&self, transport_id: &TransportId) -> Option<Arc<TransportHandle>> {
        self.transports
            .iter()
            .find(|t| t.id() == transport_id.as_str())
            .cloned()
    }

    /// First open transport with the given direction
    #[must_use]
    pub fn open_transport(&self, direction: Direction) -> Option<Arc<TransportHandle>> {
        self.transports
            .iter()
            .find(|t| t.direction() == direction && t.is_open())
            .cloned()
    }

    #[must_use]
    pub fn owns_producer(&self, producer_id: &ProducerId) -> bool {
        self.producers
            .iter()
            .any(|p| p.id() == producer_id.as_str())
    }

    /// Ids of producers that are still open
    #[must_use]
    pub fn open_producer_ids(&self) -> Vec<ProducerId> {
        self.producers
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.producer_id())
            .collect()
    }

    #[must_use]
    pub fn transports(&self) -> &[Arc<TransportHandle>] {
        &self.transports
    }

    #[must_use]
    pub fn producers(&self) -> &[Arc<ProducerHandle>] {
        &self.producers
    }

    #[must_use]
    pub fn consumers(&self) -> &[Arc<ConsumerHandle>] {
        &self.consumers
    }

    /// Release every resource, consumers first and transports last.
    ///
    /// Each close is attempted independently; a failure is logged and counted
    /// but does not stop the rest of the cascade.
    pub fn close_all(&self) -> CloseReport {
        let mut report = CloseReport::default();

        for consumer in &self.consumers {
            report.record(consumer.close(), consumer.id(), "consumer", &self.peer_id, |r| {
                &mut r.consumers
            });
        }
        for producer in &self.producers {
            report.record(producer.close(), producer.id(), "producer", &self.peer_id, |r| {
                &mut r.producers
            });
        }
        for transport in &self.transports {
            report.record(transport.close(), transport.id(), "transport", &self.peer_id, |r| {
                &mut r.transports
            });
        }

        debug!(
            peer_id = %self.peer_id,
            consumers = report.consumers,
            producers = report.producers,
            transports = report.transports,
            already_closed = report.already_closed,
            failures = report.failures,
            "Peer session resources released"
        );

        report
    }
}

/// Summary of a [`PeerSession::close_all`] cascade
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloseReport {
    /// Consumers closed by this cascade
    pub consumers: usize,
    /// Producers closed by this cascade
    pub producers: usize,
    /// Transports closed by this cascade
    pub transports: usize,
    /// Handles that were already closed
    pub already_closed: usize,
    /// Close calls the engine rejected
    pub failures: usize,
}

impl CloseReport {
    fn record<E: std::fmt::Display>(
        &mut self,
        outcome: Result<CloseOutcome, E>,
        id: &str,
        what: &str,
        peer_id: &PeerId,
        counter: impl FnOnce(&mut Self) -> &mut usize,
    ) {
        match outcome {
            Ok(CloseOutcome::Closed) => *counter(self) += 1,
            Ok(CloseOutcome::AlreadyClosed) => self.already_closed += 1,
            Err(e) => {
                self.failures += 1;
                warn!(peer_id = %peer_id, resource = what, id, error = %e, "Failed to close resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::local::tests::{opus_capabilities, opus_parameters};
    use crate::engine::{LocalEngine, MediaEngine, RtpCodecCapability, WebRtcTransportOptions};
    use crate::types::MediaKind;

    #[tokio::test]
    async fn test_close_all_releases_everything_once() {
        let engine = LocalEngine::new();
        let router = engine
            .create_router(vec![RtpCodecCapability::opus()])
            .await
            .unwrap();

        let mut session = PeerSession::new(PeerId::from("c1"), UserId::from("1"), RoomId::from("r1"));

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
        let consumer = recv
            .consume(producer.id(), opus_capabilities(), false)
            .await
            .unwrap();

        session.add_transport(Arc::new(TransportHandle::from_transport(
            Arc::clone(&send),
            Direction::Send,
        )));
        session.add_transport(Arc::new(TransportHandle::from_transport(
            Arc::clone(&recv),
            Direction::Recv,
        )));
        session.add_producer(Arc::new(ProducerHandle::from_producer(
            Arc::clone(&producer),
            send.id(),
        )));
        session.add_consumer(Arc::new(ConsumerHandle::from_consumer(Arc::clone(&consumer))));

        let report = session.close_all();
        assert_eq!(report.consumers, 1);
        assert_eq!(report.producers, 1);
        assert_eq!(report.transports, 2);
        assert_eq!(report.failures, 0);
        assert!(consumer.is_closed() && producer.is_closed() && send.is_closed() && recv.is_closed());
        assert_eq!(engine.live_transports(), 0);

        // A second cascade finds nothing left to do
        let again = session.close_all();
        assert_eq!(again.already_closed, 4);
        assert_eq!(again.consumers + again.producers + again.transports, 0);
    }

    #[tokio::test]
    async fn test_externally_closed_transport_counts_as_already_closed() {
        let engine = LocalEngine::new();
        let router = engine
            .create_router(vec![RtpCodecCapability::opus()])
            .await
            .unwrap();
        let mut session = PeerSession::new(PeerId::from("c1"), UserId::from("1"), RoomId::from("r1"));

        let send = router
            .create_webrtc_transport(WebRtcTransportOptions::default())
            .await
            .unwrap();
        let producer = send
            .produce(MediaKind::Audio, opus_parameters())
            .await
            .unwrap();
        session.add_transport(Arc::new(TransportHandle::from_transport(
            Arc::clone(&send),
            Direction::Send,
        )));
        session.add_producer(Arc::new(ProducerHandle::from_producer(producer, send.id())));

        // Engine-side close cascades to the producer before the session tears down
        send.close().unwrap();
        assert!(session.open_transport(Direction::Send).is_none());
        assert!(session.open_producer_ids().is_empty());

        let report = session.close_all();
        assert_eq!(report.already_closed, 2);
        assert_eq!(report.failures, 0);
    }

    #[test]
    fn test_lookups_on_empty_session() {
        let session = PeerSession::new(PeerId::from("c1"), UserId::from("1"), RoomId::from("r1"));
        assert!(session.transport(&TransportId::from("t1")).is_none());
        assert!(session.open_transport(Direction::Recv).is_none());
        assert!(!session.owns_producer(&ProducerId::from("p1")));
        assert_eq!(session.close_all(), CloseReport::default());
    }
}
