//! Signaling wire schema
//!
//! JSON text frames with a `type` tag. Client frames may carry a numeric
//! `requestId` that is echoed on the matching `response`.

use crate::engine::{
    DtlsParameters, IceCandidate, IceParameters, RtpCapabilities, RtpParameters,
};
use crate::error::Error;
use crate::types::{ConsumerId, Direction, MediaKind, PeerId, ProducerId, RoomId, TransportId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One inbound frame
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub request: ClientRequest,
}

/// A frame that failed schema validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidFrame {
    /// Recovered when the frame was valid JSON with a numeric `requestId`
    pub request_id: Option<u64>,
    pub reason: String,
}

impl ClientEnvelope {
    #[must_use]
    pub fn new(request_id: Option<u64>, request: ClientRequest) -> Self {
        Self {
            request_id,
            request,
        }
    }

    /// Validate a text frame against the closed request schema
    pub fn parse(text: &str) -> Result<Self, InvalidFrame> {
        let value: Value = serde_json::from_str(text).map_err(|e| InvalidFrame {
            request_id: None,
            reason: e.to_string(),
        })?;
        let request_id = value.get("requestId").and_then(Value::as_u64);
        let request = serde_json::from_value(value).map_err(|e| InvalidFrame {
            request_id,
            reason: e.to_string(),
        })?;
        Ok(Self {
            request_id,
            request,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientRequest {
    Join {
        room_id: RoomId,
        user_id: UserId,
    },
    CreateTransport {
        room_id: RoomId,
        direction: Direction,
    },
    ConnectTransport {
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
        room_id: RoomId,
    },
    Produce {
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        room_id: RoomId,
    },
    Consume {
        room_id: RoomId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    },
    Leave {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<RoomId>,
    },
}

impl ClientRequest {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::CreateTransport { .. } => "createTransport",
            Self::ConnectTransport { .. } => "connectTransport",
            Self::Produce { .. } => "produce",
            Self::Consume { .. } => "consume",
            Self::Leave { .. } => "leave",
        }
    }
}

/// A producer announced to a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerInfo {
    pub producer_id: ProducerId,
    pub peer_id: PeerId,
}

/// Successful response payloads
///
/// Untagged: variants are tried in declaration order, so the ones with more
/// required fields come first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged, rename_all_fields = "camelCase")]
pub enum ResponseData {
    Joined {
        rtp_capabilities: RtpCapabilities,
        producers: Vec<ProducerInfo>,
    },
    TransportCreated {
        id: TransportId,
        ice_parameters: IceParameters,
        ice_candidates: Vec<IceCandidate>,
        dtls_parameters: DtlsParameters,
    },
    Consumed {
        id: ConsumerId,
        producer_id: ProducerId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    Produced {
        id: ProducerId,
    },
    Ack {},
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(error: &Error) -> Self {
        Self {
            code: error.code().to_string(),
            message: error.to_string(),
        }
    }
}

/// One outbound frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Response {
        request_id: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        data: Option<ResponseData>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },
    NewProducer {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    ProducerClosed {
        producer_id: ProducerId,
        peer_id: PeerId,
    },
    PeerLeft {
        peer_id: PeerId,
    },
}

impl ServerMessage {
    #[must_use]
    pub const fn ok(request_id: Option<u64>, data: ResponseData) -> Self {
        Self::Response {
            request_id,
            data: Some(data),
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: Option<u64>, error: &Error) -> Self {
        Self::Response {
            request_id,
            data: None,
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn from_result(request_id: Option<u64>, result: &Result<ResponseData, Error>) -> Self {
        match result {
            Ok(data) => Self::ok(request_id, data.clone()),
            Err(e) => Self::error(request_id, e),
        }
    }

    #[must_use]
    pub const fn message_type(&self) -> &'static str {
        match self {
            Self::Response { .. } => "response",
            Self::NewProducer { .. } => "newProducer",
            Self::ProducerClosed { .. } => "producerClosed",
            Self::PeerLeft { .. } => "peerLeft",
        }
    }
}
