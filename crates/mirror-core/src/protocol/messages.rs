//! JSON message types for the signaling WebSocket.
//!
//! Every message is a JSON text frame holding one object whose `"type"` field
//! identifies the variant.  All other fields sit next to it:
//!
//! ```json
//! {"type":"device_info","device_name":"Pixel 7","device_id":"R5CT"}
//! {"type":"ice_candidate","candidate":"candidate:1 1 udp ...","sdpMid":"0","sdpMLineIndex":0}
//! ```
//!
//! # Message flow
//!
//! ```text
//! Controller → Device:  ping | start_negotiation | offer | answer | ice_candidate | control_event
//! Device → Controller:  device_info | offer | answer | ice_candidate
//! ```
//!
//! The two directions use distinct enums so a device-only message can never be
//! accepted from a controller by accident.  `offer` and `answer` exist in both:
//! the device normally offers, but answers when the controller offers first.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::protocol::control::ControlEvent;

/// Every `type` value the device understands, including legacy aliases.
const KNOWN_INBOUND_TYPES: &[&str] = &[
    "ping",
    "start_negotiation",
    "start_webrtc",
    "offer",
    "answer",
    "ice_candidate",
    "control_event",
];

/// Errors raised while parsing or encoding a signaling message.
#[derive(Debug, Error, PartialEq)]
pub enum ProtocolError {
    /// The frame is not a JSON object or its fields do not match the declared type.
    #[error("malformed message: {0}")]
    Malformed(String),

    /// The object has no string `type` field.
    #[error("message has no \"type\" field")]
    MissingType,

    /// The `type` field names a message this device does not handle.
    #[error("unknown message type: {0}")]
    UnknownType(String),

    /// An outbound message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(String),
}

/// One ICE candidate as exchanged on the signaling socket.
///
/// Field names follow the browser `RTCIceCandidateInit` dictionary so a
/// controller can forward candidates without renaming keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The `candidate:` attribute line.
    pub candidate: String,

    /// Media stream identification tag the candidate belongs to.
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,

    /// Zero-based index of the m-line the candidate belongs to.
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

// ── Controller → Device ───────────────────────────────────────────────────────

/// All messages a controller can send to the device.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Liveness check; answered with a fresh `device_info`.
    Ping,

    /// Asks the device to create a peer connection and send an offer.
    ///
    /// Older controllers send this as `start_webrtc`.
    #[serde(alias = "start_webrtc")]
    StartNegotiation,

    /// A controller-originated offer.  Parsed so it can be logged; never applied.
    Offer { sdp: String },

    /// The controller's answer to the device's offer.
    Answer { sdp: String },

    /// A remote ICE candidate for the session's peer connection.
    IceCandidate(IceCandidate),

    /// A touch or key command sent over the signaling socket instead of the
    /// data channel.
    ControlEvent { event: ControlEvent },
}

impl InboundMessage {
    /// Returns the wire name of the variant.
    ///
    /// Used in log lines so SDP bodies and candidates are never printed at
    /// `debug` level.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::StartNegotiation => "start_negotiation",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice_candidate",
            Self::ControlEvent { .. } => "control_event",
        }
    }
}

// ── Device → Controller ───────────────────────────────────────────────────────

/// All messages the device sends to a controller.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundMessage {
    /// Identifies the device.  Sent on accept and in reply to every `ping`.
    DeviceInfo {
        device_name: String,
        device_id: String,
    },

    /// The device's send-only offer for this session.
    Offer { sdp: String },

    /// The device's answer to a controller-originated offer.
    Answer { sdp: String },

    /// A locally gathered ICE candidate.
    IceCandidate(IceCandidate),
}

impl OutboundMessage {
    /// Returns the wire name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::DeviceInfo { .. } => "device_info",
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate(_) => "ice_candidate",
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses one signaling text frame.
///
/// The envelope is inspected first so an unrecognised `type` is reported as
/// [`ProtocolError::UnknownType`] rather than a generic decoding failure.
///
/// # Errors
///
/// - [`ProtocolError::Malformed`] if the text is not a JSON object or the
///   fields do not match the declared type.
/// - [`ProtocolError::MissingType`] if there is no string `type` field.
/// - [`ProtocolError::UnknownType`] for any other `type` value.
pub fn parse_inbound(text: &str) -> Result<InboundMessage, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?;

    if !KNOWN_INBOUND_TYPES.contains(&kind) {
        return Err(ProtocolError::UnknownType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))
}

/// Serializes an outbound message to the JSON text sent in one WebSocket frame.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn encode_outbound(message: &OutboundMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Encode(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
