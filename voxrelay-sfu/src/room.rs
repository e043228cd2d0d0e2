//! SFU Room
//!
//! One media router plus the peer sessions attached to it. The peer map sits
//! behind a synchronous mutex that is never held across an engine call.

use crate::engine::Router;
use crate::error::{Error, Result};
use crate::peer::PeerSession;
use crate::types::{PeerId, ProducerId, RoomId};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub struct SfuRoom {
    pub id: RoomId,
    pub created_at: DateTime<Utc>,
    router: Arc<dyn Router>,
    peers: Mutex<HashMap<PeerId, PeerSession>>,
}

impl SfuRoom {
    pub fn new(id: RoomId, router: Arc<dyn Router>) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            router,
            peers: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn router(&self) -> &Arc<dyn Router> {
        &self.router
    }

    /// Attach a peer session, returning the new peer count.
    ///
    /// Fails if the peer is already present or the room already holds
    /// `max_peers` sessions (0 = unlimited). Both checks run under the same
    /// lock as the insert.
    pub(crate) fn add_peer(&self, session: PeerSession, max_peers: usize) -> Result<usize> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&session.peer_id) {
            return Err(Error::AlreadyJoined(self.id.clone()));
        }
        if max_peers > 0 && peers.len() >= max_peers {
            return Err(Error::RoomFull(self.id.clone()));
        }
        peers.insert(session.peer_id.clone(), session);
        Ok(peers.len())
    }

    /// Detach a peer session, handing it to the caller for teardown
    pub fn remove_peer(&self, peer_id: &PeerId) -> Option<PeerSession> {
        self.peers.lock().remove(peer_id)
    }

    #[must_use]
    pub fn contains_peer(&self, peer_id: &PeerId) -> bool {
        self.peers.lock().contains_key(peer_id)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    #[must_use]
    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Run `f` against a peer session, if it is still attached
    pub fn with_peer<T>(&self, peer_id: &PeerId, f: impl FnOnce(&PeerSession) -> T) -> Option<T> {
        self.peers.lock().get(peer_id).map(f)
    }

    /// Run `f` against a mutable peer session, if it is still attached
    pub fn with_peer_mut<T>(
        &self,
        peer_id: &PeerId,
        f: impl FnOnce(&mut PeerSession) -> T,
    ) -> Option<T> {
        self.peers.lock().get_mut(peer_id).map(f)
    }

    /// Peer that owns `producer_id`, if any peer of this room does
    #[must_use]
    pub fn producer_owner(&self, producer_id: &ProducerId) -> Option<PeerId> {
        self.peers
            .lock()
            .values()
            .find(|peer| peer.owns_producer(producer_id))
            .map(|peer| peer.peer_id.clone())
    }

    /// Open producers of every peer except `except`
    #[must_use]
    pub fn producers_except(&self, except: &PeerId) -> Vec<(ProducerId, PeerId)> {
        self.peers
            .lock()
            .values()
            .filter(|peer| &peer.peer_id != except)
            .flat_map(|peer| {
                peer.open_producer_ids()
                    .into_iter()
                    .map(|id| (id, peer.peer_id.clone()))
            })
            .collect()
    }

    #[must_use]
    pub fn get_stats(&self) -> RoomStats {
        let peers = self.peers.lock();
        let mut stats = RoomStats {
            peer_count: peers.len(),
            created_at: Some(self.created_at),
            ..Default::default()
        };
        for peer in peers.values() {
            stats.transports += peer.transports().iter().filter(|t| t.is_open()).count();
            stats.producers += peer.producers().iter().filter(|p| p.is_open()).count();
            stats.consumers += peer.consumers().iter().filter(|c| c.is_open()).count();
        }
        stats
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RoomStats {
    pub peer_count: usize,
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
    pub created_at: Option<DateTime<Utc>>,
}
