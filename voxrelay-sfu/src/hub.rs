use crate::protocol::ServerMessage;
use crate::types::{PeerId, RoomId};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Outbound queue of one connection
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// Subscriber information
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub peer_id: PeerId,
    pub sender: MessageSender,
}

/// In-memory hub routing room-scoped notifications to connections
#[derive(Clone, Default)]
pub struct RoomMessageHub {
    /// Map of room_id -> subscribers
    rooms: Arc<DashMap<RoomId, Vec<Subscriber>>>,

    /// Map of peer_id -> room_id for cleanup
    connections: Arc<DashMap<PeerId, RoomId>>,
}

impl RoomMessageHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a connection to a room's notifications.
    ///
    /// A connection listens to at most one room; an earlier subscription is dropped.
    pub fn subscribe(&self, room_id: RoomId, peer_id: PeerId, sender: MessageSender) {
        if self.connections.contains_key(&peer_id) {
            self.unsubscribe(&peer_id);
        }

        self.rooms
            .entry(room_id.clone())
            .or_default()
            .push(Subscriber {
                peer_id: peer_id.clone(),
                sender,
            });
        self.connections.insert(peer_id.clone(), room_id.clone());

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            "Connection subscribed to room"
        );
    }

    /// Unsubscribe a connection. Returns the room it was subscribed to.
    pub fn unsubscribe(&self, peer_id: &PeerId) -> Option<RoomId> {
        let Some((_, room_id)) = self.connections.remove(peer_id) else {
            debug!(peer_id = %peer_id, "Unsubscribe of unknown connection");
            return None;
        };

        if let Some(mut subscribers) = self.rooms.get_mut(&room_id) {
            subscribers.retain(|sub| &sub.peer_id != peer_id);
        }
        if self
            .rooms
            .remove_if(&room_id, |_, subscribers| subscribers.is_empty())
            .is_some()
        {
            debug!(room_id = %room_id, "Room has no more subscribers, removed");
        }

        info!(
            room_id = %room_id,
            peer_id = %peer_id,
            "Connection unsubscribed from room"
        );
        Some(room_id)
    }

    /// Send a message to every subscriber of a room
    pub fn broadcast(&self, room_id: &RoomId, message: ServerMessage) -> usize {
        self.send_filtered(room_id, None, message)
    }

    /// Send a message to every subscriber of a room except `except`
    pub fn broadcast_except(&self, room_id: &RoomId, except: &PeerId, message: ServerMessage) -> usize {
        self.send_filtered(room_id, Some(except), message)
    }

    #[must_use]
    pub fn subscriber_count(&self, room_id: &RoomId) -> usize {
        self.rooms.get(room_id).map_or(0, |subscribers| subscribers.len())
    }

    #[must_use]
    pub fn is_subscribed(&self, peer_id: &PeerId) -> bool {
        self.connections.contains_key(peer_id)
    }

    fn send_filtered(&self, room_id: &RoomId, except: Option<&PeerId>, message: ServerMessage) -> usize {
        let mut sent_count = 0;
        let mut failed_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(room_id) {
            for subscriber in subscribers.iter() {
                if except == Some(&subscriber.peer_id) {
                    continue;
                }
                match subscriber.sender.send(message.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(err) => {
                        warn!(
                            room_id = %room_id,
                            peer_id = %subscriber.peer_id,
                            error = %err,
                            "Failed to send message to connection, marking for cleanup"
                        );
                        failed_connections.push(subscriber.peer_id.clone());
                    }
                }
            }
        }

        // Clean up closed connections
        for peer_id in failed_connections {
            self.unsubscribe(&peer_id);
        }

        if sent_count > 0 {
            debug!(
                room_id = %room_id,
                sent_count,
                message_type = message.message_type(),
                "Broadcast complete"
            );
        }

        sent_count
    }
}
