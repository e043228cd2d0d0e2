use crate::engine::EngineError;
use crate::types::{Direction, PeerId, RoomId, TransportId};
use thiserror::Error;

/// Errors reported to the requesting connection.
///
/// None of them is fatal: the connection keeps running and no other
/// connection or room is affected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("You are not allowed to join this room: {0}")]
    AdmissionDenied(String),

    #[error("Room not found: {0}")]
    RoomNotFound(RoomId),

    #[error("Peer {0} not found in room")]
    PeerNotFound(PeerId),

    #[error("Transport not found: {0}")]
    TransportNotFound(TransportId),

    #[error("Cannot consume")]
    CannotConsume,

    #[error("No recv transport available")]
    NoRecvTransport,

    #[error("Cannot consume a producer owned by the same peer")]
    SelfConsumption,

    #[error("Already joined room {0}")]
    AlreadyJoined(RoomId),

    #[error("Not joined to any room")]
    NotJoined,

    #[error("A {0} transport is already open")]
    TransportExists(Direction),

    #[error("Maximum number of rooms reached")]
    RoomLimitReached,

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Media engine error: {0}")]
    Engine(#[from] EngineError),
}

impl Error {
    /// Stable machine-readable code sent on the wire
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AdmissionDenied(_) => "admissionDenied",
            Self::RoomNotFound(_) => "roomNotFound",
            Self::PeerNotFound(_) => "peerNotFound",
            Self::TransportNotFound(_) => "transportNotFound",
            Self::CannotConsume => "cannotConsume",
            Self::NoRecvTransport => "noRecvTransport",
            Self::SelfConsumption => "selfConsumption",
            Self::AlreadyJoined(_) => "alreadyJoined",
            Self::NotJoined => "notJoined",
            Self::TransportExists(_) => "transportExists",
            Self::RoomLimitReached => "roomLimitReached",
            Self::RoomFull(_) => "roomFull",
            Self::InvalidMessage(_) => "invalidMessage",
            Self::Engine(_) => "engine",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
