//! Handles around engine-created resources
//!
//! A handle pairs an engine resource with its identity and a role tag
//! (transport direction, producer kind, consumer source) and guarantees the
//! engine close is issued at most once, no matter how many teardown paths
//! race for it.

use crate::engine::{Consumer, EngineResource, EngineResult, Producer, Transport};
use crate::types::{ConsumerId, Direction, MediaKind, ProducerId, TransportId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Outcome of [`ResourceHandle::close`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// This call closed the resource
    Closed,
    /// The handle was already released, or the engine had closed the resource on its own
    AlreadyClosed,
}

/// One engine resource owned by a peer session
pub struct ResourceHandle<R: ?Sized, Tag> {
    id: String,
    tag: Tag,
    resource: Arc<R>,
    released: AtomicBool,
}

impl<R, Tag> ResourceHandle<R, Tag>
where
    R: EngineResource + ?Sized,
{
    pub fn new(id: impl Into<String>, tag: Tag, resource: Arc<R>) -> Self {
        Self {
            id: id.into(),
            tag,
            resource,
            released: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// The underlying engine resource
    #[must_use]
    pub fn resource(&self) -> &Arc<R> {
        &self.resource
    }

    /// Whether the resource is still usable
    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.released.load(Ordering::SeqCst) && !self.resource.is_closed()
    }

    /// Close the resource exactly once.
    ///
    /// Only the first call reaches the engine. If the engine already closed
    /// the resource (e.g. a cascade from its transport) no call is made.
    pub fn close(&self) -> EngineResult<CloseOutcome> {
        if self.released.swap(true, Ordering::SeqCst) || self.resource.is_closed() {
            return Ok(CloseOutcome::AlreadyClosed);
        }
        self.resource.close()?;
        Ok(CloseOutcome::Closed)
    }
}

/// Role tag of a producer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerTag {
    pub kind: MediaKind,
    pub transport_id: TransportId,
}

/// Role tag of a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerTag {
    pub kind: MediaKind,
    pub producer_id: ProducerId,
}

pub type TransportHandle = ResourceHandle<dyn Transport, Direction>;
pub type ProducerHandle = ResourceHandle<dyn Producer, ProducerTag>;
pub type ConsumerHandle = ResourceHandle<dyn Consumer, ConsumerTag>;

impl TransportHandle {
    pub fn from_transport(transport: Arc<dyn Transport>, direction: Direction) -> Self {
        Self::new(transport.id().as_str(), direction, transport)
    }

    #[must_use]
    pub fn transport_id(&self) -> TransportId {
        TransportId::new(self.id.as_str())
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.tag
    }
}

impl ProducerHandle {
    pub fn from_producer(producer: Arc<dyn Producer>, transport_id: TransportId) -> Self {
        let tag = ProducerTag {
            kind: producer.kind(),
            transport_id,
        };
        Self::new(producer.id().as_str(), tag, producer)
    }

    #[must_use]
    pub fn producer_id(&self) -> ProducerId {
        ProducerId::new(self.id.as_str())
    }

    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.tag.kind
    }
}

impl ConsumerHandle {
    pub fn from_consumer(consumer: Arc<dyn Consumer>) -> Self {
        let tag = ConsumerTag {
            kind: consumer.kind(),
            producer_id: consumer.producer_id(),
        };
        Self::new(consumer.id().as_str(), tag, consumer)
    }

    #[must_use]
    pub fn consumer_id(&self) -> ConsumerId {
        ConsumerId::new(self.id.as_str())
    }

    #[must_use]
    pub fn producer_id(&self) -> &ProducerId {
        &self.tag.producer_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineError;
    use std::sync::atomic::AtomicUsize;

    struct CountingResource {
        closes: AtomicUsize,
        closed: AtomicBool,
        fail: bool,
    }

    impl CountingResource {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                closes: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                fail,
            })
        }
    }

    impl EngineResource for CountingResource {
        fn close(&self) -> EngineResult<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(EngineError::Request("worker died".to_string()));
            }
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn test_close_reaches_engine_once() {
        let resource = CountingResource::new(false);
        let handle = ResourceHandle::new("t1", Direction::Send, Arc::clone(&resource));

        assert!(handle.is_open());
        assert_eq!(handle.close().unwrap(), CloseOutcome::Closed);
        assert_eq!(handle.close().unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
        assert!(!handle.is_open());
    }

    #[test]
    fn test_externally_closed_resource_is_skipped() {
        let resource = CountingResource::new(false);
        let handle = ResourceHandle::new("p1", Direction::Recv, Arc::clone(&resource));

        resource.closed.store(true, Ordering::SeqCst);
        assert!(!handle.is_open());
        assert_eq!(handle.close().unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(resource.closes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_close_is_not_retried() {
        let resource = CountingResource::new(true);
        let handle = ResourceHandle::new("c1", Direction::Recv, Arc::clone(&resource));

        assert!(handle.close().is_err());
        assert_eq!(handle.close().unwrap(), CloseOutcome::AlreadyClosed);
        assert_eq!(resource.closes.load(Ordering::SeqCst), 1);
    }
}
