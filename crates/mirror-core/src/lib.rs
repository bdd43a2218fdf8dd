//! # mirror-core
//!
//! Shared library for Screen-Mirror containing the signaling protocol, the
//! control-event decoder, and the domain types that describe sessions and the
//! shared screen-capture resource.
//!
//! This crate has zero dependencies on sockets, async runtimes, or platform
//! APIs.  Everything here can be unit-tested in isolation.
//!
//! # Architecture overview
//!
//! Screen-Mirror lets a controller device view and operate a target device's
//! screen over the local network.  The target runs a signaling server
//! (`mirror-device`); controllers connect over WebSocket, negotiate a peer
//! connection, receive the screen as a video track, and send touch/key
//! commands back over a data channel.
//!
//! - **`protocol`** – The JSON messages exchanged over the signaling socket
//!   and the control-event payload carried by both the signaling socket and
//!   the `control` data channel.
//!
//! - **`domain`** – Session identity, the negotiation state enum, and the
//!   capture-side value types (grants, screen metrics, video frames).

pub mod domain;
pub mod protocol;

pub use domain::capture::{
    AttachPolicy, CaptureGrant, FrameCounters, PendingGrant, ScreenMetrics, VideoFrame,
};
pub use domain::session::{NegotiationState, SessionId};
pub use protocol::control::{
    decode_control_event, parse_control_payload, ControlDecodeError, ControlEvent, ControlKind,
    GestureTimings, InputAction, Point, SpecialKey,
};
pub use protocol::messages::{
    encode_outbound, parse_inbound, IceCandidate, InboundMessage, OutboundMessage, ProtocolError,
};
