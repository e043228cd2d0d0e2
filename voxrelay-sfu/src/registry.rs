//! Room registry
//!
//! Maps room ids to rooms and owns the room lifecycle:
//! - a room is created on the first successful join and holds exactly one router
//! - concurrent first joiners of the same id share one creation (per-id `OnceCell`)
//! - a room is removed, and its router closed, as soon as its last peer leaves
//!
//! Attaching a peer and removing an empty room both run under the map shard
//! lock of the room id, so a joiner can never land in a room that is being
//! removed. A failed creation leaves the slot in place while other joiners
//! still wait on it; the next waiter retries on the same cell.

use crate::config::SfuConfig;
use crate::engine::MediaEngine;
use crate::error::{Error, Result};
use crate::peer::{CloseReport, PeerSession};
use crate::room::SfuRoom;
use crate::types::{PeerId, RoomId};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

type RoomSlot = Arc<OnceCell<Arc<SfuRoom>>>;

/// Registry-wide statistics
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub peers: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

pub struct RoomRegistry {
    config: Arc<SfuConfig>,
    engine: Arc<dyn MediaEngine>,
    rooms: DashMap<RoomId, RoomSlot>,
    /// Slots in `rooms`, reserved before insert so `max_rooms` holds under concurrency
    slot_count: AtomicUsize,
}

impl RoomRegistry {
    pub fn new(config: SfuConfig, engine: Arc<dyn MediaEngine>) -> Self {
        info!(
            max_rooms = config.max_rooms,
            max_peers_per_room = config.max_peers_per_room,
            codecs = config.media_codecs.len(),
            "Room registry initialized"
        );
        Self {
            config: Arc::new(config),
            engine,
            rooms: DashMap::new(),
            slot_count: AtomicUsize::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> &SfuConfig {
        &self.config
    }

    /// Get a room, creating it (and its router) if the id is unseen
    pub async fn get_or_create_room(&self, room_id: &RoomId) -> Result<Arc<SfuRoom>> {
        loop {
            let slot = self.slot(room_id)?;
            let room = self.init_slot(room_id, &slot).await?;
            if self.is_registered(room_id, &slot) {
                return Ok(room);
            }
            self.retire_orphan(room_id, &room);
        }
    }

    /// Get or create the room named by `session.room_id` and attach the session to it
    pub async fn join(&self, session: PeerSession) -> Result<Arc<SfuRoom>> {
        let room_id = session.room_id.clone();
        let peer_id = session.peer_id.clone();

        loop {
            let slot = self.slot(&room_id)?;
            let room = self.init_slot(&room_id, &slot).await?;

            // Hold the shard lock so remove_if_empty cannot run between the check and the insert
            let current = match self.rooms.get(&room_id) {
                Some(current) if Arc::ptr_eq(current.value(), &slot) => current,
                _ => {
                    self.retire_orphan(&room_id, &room);
                    continue;
                }
            };
            let max_peers = self.config.max_peers_per_room;
            let attached = room.add_peer(session, max_peers);
            drop(current);

            return match attached {
                Ok(peer_count) => {
                    info!(
                        room_id = %room_id,
                        peer_id = %peer_id,
                        peer_count,
                        "Added peer to room"
                    );
                    Ok(room)
                }
                Err(e) => {
                    if matches!(e, Error::RoomFull(_)) {
                        warn!(room_id = %room_id, max_peers, "Peer limit reached for room");
                    }
                    Err(e)
                }
            };
        }
    }

    /// Remove the room iff it has no peers. Closes its router.
    pub fn remove_if_empty(&self, room_id: &RoomId) -> bool {
        let removed = self.rooms.remove_if(room_id, |_, slot| {
            slot.get().is_some_and(|room| room.is_empty())
        });

        match removed {
            Some((_, slot)) => {
                self.release_slot();
                if let Some(room) = slot.get() {
                    room.router().close();
                }
                info!(
                    room_id = %room_id,
                    remaining_rooms = self.rooms.len(),
                    "Room deleted"
                );
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn get(&self, room_id: &RoomId) -> Option<Arc<SfuRoom>> {
        self.rooms
            .get(room_id)
            .and_then(|slot| slot.value().get().cloned())
    }

    /// Every room that currently holds a session for `peer_id`
    #[must_use]
    pub fn rooms_with_peer(&self, peer_id: &PeerId) -> Vec<Arc<SfuRoom>> {
        self.rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .filter(|room| room.contains_peer(peer_id))
            .collect()
    }

    /// Number of rooms that finished creation
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms
            .iter()
            .filter(|entry| entry.value().initialized())
            .count()
    }

    #[must_use]
    pub fn get_room_ids(&self) -> Vec<RoomId> {
        self.rooms
            .iter()
            .filter(|entry| entry.value().initialized())
            .map(|entry| entry.key().clone())
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let rooms: Vec<_> = self
            .rooms
            .iter()
            .filter_map(|entry| entry.value().get().cloned())
            .collect();

        rooms.iter().fold(
            RegistryStats {
                rooms: rooms.len(),
                ..Default::default()
            },
            |mut stats, room| {
                let room_stats = room.get_stats();
                stats.peers += room_stats.peer_count;
                stats.transports += room_stats.transports;
                stats.producers += room_stats.producers;
                stats.consumers += room_stats.consumers;
                stats
            },
        )
    }

    /// Tear down every room: release all peer resources and close the routers
    pub fn shutdown(&self) -> CloseReport {
        let mut total = CloseReport::default();
        for room_id in self.get_room_ids() {
            let Some((_, slot)) = self.rooms.remove(&room_id) else {
                continue;
            };
            self.release_slot();
            let Some(room) = slot.get() else {
                continue;
            };
            for peer_id in room.peer_ids() {
                if let Some(session) = room.remove_peer(&peer_id) {
                    let report = session.close_all();
                    total.consumers += report.consumers;
                    total.producers += report.producers;
                    total.transports += report.transports;
                    total.already_closed += report.already_closed;
                    total.failures += report.failures;
                }
            }
            room.router().close();
        }
        info!(
            consumers = total.consumers,
            producers = total.producers,
            transports = total.transports,
            "Room registry shut down"
        );
        total
    }

    fn slot(&self, room_id: &RoomId) -> Result<RoomSlot> {
        if let Some(slot) = self.rooms.get(room_id) {
            return Ok(Arc::clone(slot.value()));
        }

        match self.rooms.entry(room_id.clone()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                self.reserve_slot()?;
                Ok(Arc::clone(entry.insert(Arc::new(OnceCell::new())).value()))
            }
        }
    }

    /// Count a new slot against the room limit (0 = unlimited)
    fn reserve_slot(&self) -> Result<()> {
        let max_rooms = self.config.max_rooms;
        self.slot_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (max_rooms == 0 || count < max_rooms).then_some(count + 1)
            })
            .map(|_| ())
            .map_err(|current_rooms| {
                warn!(current_rooms, max_rooms, "Room limit reached");
                Error::RoomLimitReached
            })
    }

    fn release_slot(&self) {
        self.slot_count.fetch_sub(1, Ordering::SeqCst);
    }

    /// Close the router of a room whose slot left the map before it could be used
    fn retire_orphan(&self, room_id: &RoomId, room: &SfuRoom) {
        debug!(room_id = %room_id, router_id = %room.router().id(), "Room was removed during creation, retrying");
        room.router().close();
    }

    async fn init_slot(&self, room_id: &RoomId, slot: &RoomSlot) -> Result<Arc<SfuRoom>> {
        let result = slot
            .get_or_try_init(|| async {
                let router = self
                    .engine
                    .create_router(self.config.media_codecs.clone())
                    .await?;
                info!(
                    room_id = %room_id,
                    router_id = %router.id(),
                    "Created new room"
                );
                Ok::<_, Error>(Arc::new(SfuRoom::new(room_id.clone(), router)))
            })
            .await;

        match result {
            Ok(room) => Ok(Arc::clone(room)),
            Err(e) => {
                // Joiners still holding the slot retry creation on it; the last one out removes it.
                // The map and this caller account for two references.
                let removed = self.rooms.remove_if(room_id, |_, current| {
                    Arc::ptr_eq(current, slot)
                        && !current.initialized()
                        && Arc::strong_count(current) <= 2
                });
                if removed.is_some() {
                    self.release_slot();
                }
                warn!(room_id = %room_id, error = %e, "Failed to create room");
                Err(e)
            }
        }
    }

    fn is_registered(&self, room_id: &RoomId, slot: &RoomSlot) -> bool {
        self.rooms
            .get(room_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{
        EngineError, EngineResult, LocalEngine, MockMediaEngine, Router, RtpCodecCapability,
    };
    use crate::types::UserId;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Fails its first router creation once `release` is notified, then behaves like `LocalEngine`
    struct FailFirstEngine {
        inner: LocalEngine,
        calls: AtomicUsize,
        release: Notify,
    }

    #[async_trait]
    impl MediaEngine for FailFirstEngine {
        async fn create_router(&self, media_codecs: Vec<RtpCodecCapability>) -> EngineResult<Arc<dyn Router>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.release.notified().await;
                return Err(EngineError::Request("worker restarting".to_string()));
            }
            self.inner.create_router(media_codecs).await
        }
    }

    fn registry(config: SfuConfig) -> (Arc<RoomRegistry>, LocalEngine) {
        let engine = LocalEngine::new();
        let registry = Arc::new(RoomRegistry::new(config, Arc::new(engine.clone())));
        (registry, engine)
    }

    fn session(peer: &str, room: &str) -> PeerSession {
        PeerSession::new(PeerId::from(peer), UserId::from(peer), RoomId::from(room))
    }

    #[tokio::test]
    async fn test_room_lifecycle() {
        let (registry, engine) = registry(SfuConfig::default());
        let room_id = RoomId::from("test-room");

        let room = registry.get_or_create_room(&room_id).await.unwrap();
        assert_eq!(registry.room_count(), 1);

        // Getting the same room should return the existing one
        let room2 = registry.get_or_create_room(&room_id).await.unwrap();
        assert!(Arc::ptr_eq(&room, &room2));
        assert_eq!(engine.routers_created(), 1);

        // An empty room is removed and its router closed
        assert!(registry.remove_if_empty(&room_id));
        assert!(registry.get(&room_id).is_none());
        assert_eq!(engine.live_routers(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_joins_create_one_router() {
        let (registry, engine) = registry(SfuConfig::default());

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.join(session(&format!("p{i}"), "fresh")).await })
            })
            .collect();

        let mut rooms = Vec::new();
        for handle in handles {
            rooms.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(engine.routers_created(), 1);
        assert!(rooms.iter().all(|room| Arc::ptr_eq(room, &rooms[0])));
        assert_eq!(rooms[0].peer_count(), 16);
        assert_eq!(registry.room_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_if_empty_keeps_occupied_rooms() {
        let (registry, _engine) = registry(SfuConfig::default());
        let room_id = RoomId::from("r1");

        let room = registry.join(session("a", "r1")).await.unwrap();
        assert!(!registry.remove_if_empty(&room_id));

        room.remove_peer(&PeerId::from("a"));
        assert!(registry.remove_if_empty(&room_id));
        assert!(!registry.remove_if_empty(&room_id));
        assert_eq!(registry.room_count(), 0);
    }

    #[tokio::test]
    async fn test_join_after_removal_creates_a_new_room() {
        let (registry, engine) = registry(SfuConfig::default());

        let first = registry.join(session("a", "r1")).await.unwrap();
        first.remove_peer(&PeerId::from("a"));
        registry.remove_if_empty(&RoomId::from("r1"));

        let second = registry.join(session("b", "r1")).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(engine.routers_created(), 2);
        assert_eq!(engine.live_routers(), 1);
    }

    #[tokio::test]
    async fn test_peer_limit() {
        let config = SfuConfig {
            max_peers_per_room: 2,
            ..SfuConfig::default()
        };
        let (registry, _engine) = registry(config);

        registry.join(session("peer1", "room")).await.unwrap();
        registry.join(session("peer2", "room")).await.unwrap();

        let result = registry.join(session("peer3", "room")).await;
        assert!(matches!(result, Err(Error::RoomFull(_))));
        assert_eq!(registry.get(&RoomId::from("room")).unwrap().peer_count(), 2);
    }

    #[tokio::test]
    async fn test_room_limit() {
        let config = SfuConfig {
            max_rooms: 2,
            ..SfuConfig::default()
        };
        let (registry, _engine) = registry(config);

        registry.get_or_create_room(&RoomId::from("room1")).await.unwrap();
        registry.get_or_create_room(&RoomId::from("room2")).await.unwrap();

        let result = registry.get_or_create_room(&RoomId::from("room3")).await;
        assert!(matches!(result, Err(Error::RoomLimitReached)));

        // Existing rooms are still reachable at the limit
        assert!(registry.get_or_create_room(&RoomId::from("room1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_duplicate_peer_is_rejected() {
        let (registry, _engine) = registry(SfuConfig::default());
        registry.join(session("a", "r1")).await.unwrap();
        let result = registry.join(session("a", "r1")).await;
        assert!(matches!(result, Err(Error::AlreadyJoined(_))));
    }

    #[tokio::test]
    async fn test_router_failure_leaves_no_room() {
        let mut engine = MockMediaEngine::new();
        engine
            .expect_create_router()
            .times(1)
            .returning(|_| Err(EngineError::Request("worker unavailable".to_string())));
        let registry = RoomRegistry::new(SfuConfig::default(), Arc::new(engine));

        let result = registry.join(session("a", "r1")).await;
        assert!(matches!(result, Err(Error::Engine(_))));
        assert_eq!(registry.room_count(), 0);
        assert!(registry.rooms.is_empty());
        assert_eq!(registry.slot_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_creation_is_retried_by_waiting_joiner() {
        let engine = Arc::new(FailFirstEngine {
            inner: LocalEngine::new(),
            calls: AtomicUsize::new(0),
            release: Notify::new(),
        });
        let registry = Arc::new(RoomRegistry::new(SfuConfig::default(), engine.clone()));
        let room_id = RoomId::from("r");

        let first = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.join(session("a", "r")).await }
        });
        let second = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { registry.join(session("b", "r")).await }
        });

        // Wait until both joiners hold the slot: one creating, one queued behind it
        for _ in 0..1000 {
            let holders = registry.rooms.get(&room_id).map(|slot| Arc::strong_count(slot.value()));
            if holders == Some(3) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);
        engine.release.notify_one();

        assert!(matches!(first.await.unwrap(), Err(Error::Engine(_))));
        let room = second.await.unwrap().unwrap();

        assert_eq!(engine.calls.load(Ordering::SeqCst), 2);
        assert_eq!(engine.inner.routers_created(), 1);
        assert_eq!(engine.inner.live_routers(), 1);
        assert!(Arc::ptr_eq(&room, &registry.get(&room_id).unwrap()));
        assert_eq!(room.peer_ids(), vec![PeerId::from("b")]);
        assert_eq!(registry.slot_count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_limits_hold_under_concurrent_joins() {
        let config = SfuConfig {
            max_rooms: 2,
            max_peers_per_room: 3,
            ..SfuConfig::default()
        };
        let (registry, engine) = registry(config);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let room = format!("room{}", i % 4);
                tokio::spawn(async move { registry.join(session(&format!("p{i}"), &room)).await })
            })
            .collect();

        let mut joined = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => joined += 1,
                Err(Error::RoomFull(_) | Error::RoomLimitReached) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(registry.room_count(), 2);
        assert_eq!(joined, 6);
        for room_id in registry.get_room_ids() {
            assert_eq!(registry.get(&room_id).unwrap().peer_count(), 3);
        }
        assert_eq!(engine.live_routers(), 2);
    }

    #[tokio::test]
    async fn test_room_limit_frees_up_after_removal() {
        let config = SfuConfig {
            max_rooms: 1,
            ..SfuConfig::default()
        };
        let (registry, _engine) = registry(config);

        let room = registry.join(session("a", "r1")).await.unwrap();
        assert!(matches!(
            registry.join(session("b", "r2")).await,
            Err(Error::RoomLimitReached)
        ));

        room.remove_peer(&PeerId::from("a"));
        assert!(registry.remove_if_empty(&RoomId::from("r1")));
        assert!(registry.join(session("b", "r2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_rooms_with_peer_and_stats() {
        let (registry, _engine) = registry(SfuConfig::default());
        registry.join(session("a", "r1")).await.unwrap();
        registry.join(session("b", "r2")).await.unwrap();

        let rooms = registry.rooms_with_peer(&PeerId::from("b"));
        assert_eq!(rooms.len(), 1);
        assert_eq!(rooms[0].id, RoomId::from("r2"));

        let stats = registry.stats();
        assert_eq!(stats.rooms, 2);
        assert_eq!(stats.peers, 2);

        registry.shutdown();
        assert_eq!(registry.room_count(), 0);
    }
}
