//! Application layer use cases for the device engine.
//!
//! Everything here depends on traits, never on the WebSocket server, the
//! WebRTC stack, or the platform capture and input APIs.  The infrastructure
//! layer provides the implementations; the tests provide recording doubles.
//!
//! # Sub-modules
//!
//! - **`session_registry`** – Owns every live session and routes signaling
//!   messages, peer events, and capture grants to the right place.
//!
//! - **`negotiation`** – Per-session offer/answer/ICE state machine.
//!
//! - **`capture_manager`** – The single screen-capture resource and the
//!   sinks attached to it.
//!
//! - **`control`** – Turns control events into OS input actions.
//!
//! - **`signal`** – Outbound signaling seam.

pub mod capture_manager;
pub mod control;
pub mod negotiation;
pub mod session_registry;
pub mod signal;

pub use capture_manager::{
    AttachOutcome, CaptureError, CaptureHandle, CaptureManager, CaptureSettings, CaptureStatus,
    FrameFeed, FrameSink, ScreenCapturer,
};
pub use control::{ControlTranslator, InjectionError, InputInjector};
pub use negotiation::{
    NegotiationContext, NegotiationError, PeerConnector, PeerError, PeerEvent, PeerHandle,
    TransportState, CONTROL_CHANNEL_LABEL,
};
pub use session_registry::{DeviceInfo, RegistryError, SessionHandle, SessionRegistry};
pub use signal::{SendError, SignalSink};
