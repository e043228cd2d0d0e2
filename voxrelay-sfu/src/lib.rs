//! `VoxRelay` SFU (Selective Forwarding Unit) signaling layer
//!
//! Admits participants into rooms, negotiates their transports, producers and
//! consumers against a media engine, and releases every engine resource
//! deterministically when they leave.
//!
//! ## Architecture
//!
//! - **`AdmissionPolicy`**: decides whether a user may join a room
//! - **`ResourceHandle`**: one engine resource with an exactly-once close
//! - **`PeerSession`**: resources one connection owns in one room
//! - **`RoomRegistry`**: room id to room map with exactly-once room creation
//! - **`SessionHandler`**: per-connection request/response state machine
//! - **`MediaEngine`**: the engine seam; `LocalEngine` is the in-process implementation
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voxrelay_sfu::{DenyListPolicy, LocalEngine, RoomRegistry, SfuConfig, SignalingService};
//!
//! let registry = Arc::new(RoomRegistry::new(SfuConfig::default(), Arc::new(LocalEngine::new())));
//! let service = SignalingService::new(registry, Arc::new(DenyListPolicy::new()));
//! service.serve(websocket_stream).await;
//! ```

pub mod admission;
mod config;
pub mod engine;
mod error;
mod hub;
mod peer;
pub mod protocol;
mod registry;
mod resource;
mod room;
mod signaling;
mod types;

pub use admission::{Admission, AdmissionConfig, AdmissionPolicy, DenyListPolicy};
pub use config::SfuConfig;
pub use engine::{EngineError, LocalEngine, MediaEngine};
pub use error::{Error, Result};
pub use hub::{MessageSender, RoomMessageHub};
pub use peer::{CloseReport, PeerSession};
pub use protocol::{ClientEnvelope, ClientRequest, InvalidFrame, ResponseData, ServerMessage};
pub use registry::{RegistryStats, RoomRegistry};
pub use resource::{CloseOutcome, ConsumerHandle, ProducerHandle, ResourceHandle, TransportHandle};
pub use room::{RoomStats, SfuRoom};
pub use signaling::{ConnectionState, MessageStream, SessionHandler, SignalingService};
pub use types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId, UserId};
