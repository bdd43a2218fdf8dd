//! Domain layer: device configuration.
//!
//! Protocol and session types live in `mirror-core`; this layer only holds
//! what is specific to running the device binary.

pub mod config;

pub use config::{
    CaptureConfig, ConfigError, ControlConfig, DeviceConfig, DeviceIdentity, InputBackend,
    ServerConfig, WebRtcConfig,
};
