//! Media routing engine abstraction
//!
//! The signaling layer never touches media. It drives an engine that can:
//! - create one router per room, scoped to a codec capability set
//! - create WebRTC transports on a router
//! - create producers and consumers on those transports
//!
//! Every engine call is async and returns an [`EngineResult`] so that failures
//! degrade into errors reported to the requesting connection.
//!
//! [`local::LocalEngine`] is the in-process implementation used by the server
//! binary and by tests.

pub mod local;

use crate::types::{ConsumerId, MediaKind, ProducerId, TransportId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

pub use local::LocalEngine;

/// Errors reported by the media engine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("{0} is closed")]
    Closed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("Engine request failed: {0}")]
    Request(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// A codec the router (or a receiving client) is able to handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecCapability {
    /// Opus stereo at 48kHz, the default room codec
    #[must_use]
    pub fn opus() -> Self {
        Self {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: Some(2),
            preferred_payload_type: None,
            parameters: Map::new(),
            rtcp_feedback: Vec::new(),
        }
    }

    /// Whether two capabilities describe the same codec.
    /// Payload types and fmtp parameters are negotiated and do not take part.
    #[must_use]
    pub fn matches(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }
}

/// RTP capabilities of a router or of a receiving endpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
}

/// Codec entry of negotiated RTP parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<Value>,
}

impl RtpCodecParameters {
    /// Media kind derived from the mime type prefix
    #[must_use]
    pub fn kind(&self) -> Option<MediaKind> {
        let (prefix, _) = self.mime_type.split_once('/')?;
        match prefix.to_ascii_lowercase().as_str() {
            "audio" => Some(MediaKind::Audio),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }

    /// Whether this negotiated codec is an instance of `capability`
    #[must_use]
    pub fn is_instance_of(&self, capability: &RtpCodecCapability) -> bool {
        self.kind() == Some(capability.kind)
            && self.mime_type.eq_ignore_ascii_case(&capability.mime_type)
            && self.clock_rate == capability.clock_rate
            && self.channels.unwrap_or(1) == capability.channels.unwrap_or(1)
    }
}

/// Negotiated RTP parameters of a producer or consumer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

/// ICE parameters of a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    pub ice_lite: bool,
}

/// ICE candidate gathered by a server-side transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub address: String,
    pub protocol: TransportProtocol,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS handshake parameters exchanged between client and server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<DtlsRole>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// DTLS handshake state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// Listen options for WebRTC transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcTransportOptions {
    /// Local IP the transport binds to
    pub listen_ip: IpAddr,
    /// Address advertised in ICE candidates (public IP or hostname)
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
}

impl Default for WebRtcTransportOptions {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
        }
    }
}

/// Entry point of the media engine
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Create a router restricted to `media_codecs`
    async fn create_router(&self, media_codecs: Vec<RtpCodecCapability>) -> EngineResult<Arc<dyn Router>>;
}

/// Per-room media router
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Router: Send + Sync {
    fn id(&self) -> String;

    /// Capabilities the router accepts, handed to clients on join
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// Whether an endpoint with `rtp_capabilities` can consume `producer_id`
    fn can_consume(&self, producer_id: &ProducerId, rtp_capabilities: &RtpCapabilities) -> bool;

    async fn create_webrtc_transport(
        &self,
        options: WebRtcTransportOptions,
    ) -> EngineResult<Arc<dyn Transport>>;

    /// Close the router and everything created on it
    fn close(&self);
}

/// Common lifecycle of transports, producers and consumers
pub trait EngineResource: Send + Sync {
    /// Close the resource. Closing an already closed resource is a no-op.
    fn close(&self) -> EngineResult<()>;

    fn is_closed(&self) -> bool;
}

#[async_trait]
pub trait Transport: EngineResource {
    fn id(&self) -> TransportId;

    fn ice_parameters(&self) -> IceParameters;

    fn ice_candidates(&self) -> Vec<IceCandidate>;

    fn dtls_parameters(&self) -> DtlsParameters;

    /// Watch DTLS state changes
    fn dtls_state(&self) -> watch::Receiver<DtlsState>;

    /// Complete the DTLS handshake with the remote parameters
    async fn connect(&self, dtls_parameters: DtlsParameters) -> EngineResult<()>;

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<Arc<dyn Producer>>;

    async fn consume(
        &self,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
        paused: bool,
    ) -> EngineResult<Arc<dyn Consumer>>;
}

pub trait Producer: EngineResource {
    fn id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;
}

#[async_trait]
pub trait Consumer: EngineResource {
    fn id(&self) -> ConsumerId;

    fn producer_id(&self) -> ProducerId;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn is_paused(&self) -> bool;

    async fn resume(&self) -> EngineResult<()>;
}
