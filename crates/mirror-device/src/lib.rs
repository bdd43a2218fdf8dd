//! mirror-device library crate.
//!
//! The target-device side of Screen-Mirror: a WebSocket signaling server that
//! controllers connect to, a per-connection WebRTC negotiation that streams
//! the device screen as H.264, and a control path that turns taps, swipes,
//! and navigation keys from the controller into OS input.
//!
//! # Architecture (clean architecture)
//!
//! ```text
//! Controller (JSON over WebSocket, then WebRTC media + data channel)
//!         ↕
//! [mirror-device]
//!   ├── domain/           DeviceConfig and its sections
//!   ├── application/      SessionRegistry, Negotiation, CaptureManager,
//!   │                     ControlTranslator
//!   └── infrastructure/
//!         ├── ws_server/       signaling listener (tokio-tungstenite)
//!         ├── webrtc_peer/     peer connections (webrtc)
//!         ├── capture_source/  frame producers
//!         ├── input_injection/ `input` command, in-memory recorder
//!         └── storage/         TOML config loading
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O.
//! - `application` depends on `domain`, `mirror-core`, and its own traits.
//! - `infrastructure` implements those traits with tokio, tungstenite and
//!   webrtc.

/// Domain layer: configuration types (no I/O).
pub mod domain;

/// Application layer: sessions, negotiation, capture sharing, control.
pub mod application;

/// Infrastructure layer: network, WebRTC, capture, input, and storage adapters.
pub mod infrastructure;
