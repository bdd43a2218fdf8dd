//! Infrastructure layer for the device engine.
//!
//! Everything that touches the network, the OS, or the file system lives
//! here, behind the traits the application layer defines.
//!
//! # Responsibilities
//!
//! - Binding the signaling listener and running one task per connection
//!   (`ws_server`)
//! - Creating WebRTC peer connections, the control data channel, and the
//!   H.264 sample track (`webrtc_peer`)
//! - Producing frames for the capture manager (`capture_source`)
//! - Injecting input through the platform `input` tool (`input_injection`)
//! - Loading the TOML configuration file (`storage`)
//!
//! # What does NOT belong here?
//!
//! - Session and negotiation state (application layer)
//! - Wire message and control-event definitions (`mirror-core`)

pub mod capture_source;
pub mod input_injection;
pub mod storage;
pub mod webrtc_peer;
pub mod ws_server;

pub use capture_source::SyntheticCapturer;
pub use input_injection::{RecordingInjector, ShellInjector};
pub use storage::load_config;
pub use webrtc_peer::WebRtcConnector;
pub use ws_server::{serve, SignalingServer, WsSignalSink};
