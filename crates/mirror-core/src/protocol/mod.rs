//! Protocol module containing the signaling messages and the control-event codec.

pub mod control;
pub mod messages;

pub use control::{decode_control_event, parse_control_payload, ControlDecodeError, ControlEvent};
pub use messages::{encode_outbound, parse_inbound, InboundMessage, OutboundMessage, ProtocolError};
