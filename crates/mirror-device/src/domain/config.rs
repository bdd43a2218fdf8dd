//! Device configuration types.
//!
//! [`DeviceConfig`] is the single source of truth for all runtime settings.
//! It is deserialized from an optional TOML file, then individual fields are
//! overridden by CLI flags (see `main.rs`).  Every field has a default, so an
//! empty file, or no file at all, yields a working device:
//!
//! ```toml
//! log_level = "debug"
//!
//! [server]
//! port = 4321
//!
//! [capture]
//! frame_rate = 30
//! attach_policy = "exclusive"
//!
//! [webrtc]
//! stun_servers = ["stun:stun.l.google.com:19302"]
//! ```
//!
//! Durations are stored as integer milliseconds and exposed as
//! [`std::time::Duration`] through accessor methods.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use mirror_core::{AttachPolicy, GestureTimings, ScreenMetrics};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error type for loading and validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A field holds a value the device cannot run with.
    #[error("invalid config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level device configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub device: DeviceIdentity,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub webrtc: WebRtcConfig,
    /// `tracing` filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Signaling listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// IP address to bind.  `"0.0.0.0"` accepts controllers on every interface.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Wait between failed bind attempts.
    #[serde(default = "default_bind_retry_ms")]
    pub bind_retry_ms: u64,
    /// Pause between stopping a previous listener and binding again.
    #[serde(default = "default_rebind_delay_ms")]
    pub rebind_delay_ms: u64,
    /// Upper bound on how long shutdown waits for the listener and capture.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

/// How the device identifies itself in `device_info`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceIdentity {
    #[serde(default = "default_device_name")]
    pub name: String,
    #[serde(default = "default_device_id")]
    pub id: String,
}

/// Screen-capture pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CaptureConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_density")]
    pub density: u32,
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,
    /// Encoder target bitrate in bits per second.
    #[serde(default = "default_bitrate_bps")]
    pub bitrate_bps: u32,
    /// Drop frames that arrive faster than `frame_rate`.
    #[serde(default)]
    pub drop_excess_frames: bool,
    #[serde(default)]
    pub attach_policy: AttachPolicy,
}

/// Input-injection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlConfig {
    #[serde(default = "default_long_press_ms")]
    pub long_press_ms: u64,
    #[serde(default = "default_swipe_ms")]
    pub default_swipe_ms: u64,
    /// Longest swipe a controller may request; longer ones are shortened.
    #[serde(default = "default_max_gesture_ms")]
    pub max_gesture_ms: u64,
    #[serde(default)]
    pub input_backend: InputBackend,
    /// Program invoked by the shell backend (`input tap x y`, ...).
    #[serde(default = "default_input_program")]
    pub input_program: String,
    /// Actions waiting for the shell backend before new ones are dropped.
    #[serde(default = "default_input_queue")]
    pub input_queue: usize,
}

/// Peer-connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebRtcConfig {
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Frames queued per peer before new frames are dropped.
    #[serde(default = "default_sample_queue")]
    pub sample_queue: usize,
}

/// Which [`crate::application::InputInjector`] the binary wires in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputBackend {
    /// Run the platform `input` command for every action.
    #[default]
    Shell,
    /// Record actions in memory and log them; nothing is injected.
    Record,
}

impl fmt::Display for InputBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shell => f.write_str("shell"),
            Self::Record => f.write_str("record"),
        }
    }
}

impl FromStr for InputBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shell" => Ok(Self::Shell),
            "record" => Ok(Self::Record),
            other => Err(format!(
                "unknown input backend '{other}' (expected shell or record)"
            )),
        }
    }
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    4321
}
fn default_bind_retry_ms() -> u64 {
    2000
}
fn default_rebind_delay_ms() -> u64 {
    100
}
fn default_shutdown_grace_ms() -> u64 {
    1000
}
fn default_device_name() -> String {
    "screen-mirror".to_string()
}
fn default_device_id() -> String {
    Uuid::new_v4().simple().to_string()
}
fn default_width() -> u32 {
    mirror_core::domain::capture::DEFAULT_SCREEN_WIDTH
}
fn default_height() -> u32 {
    mirror_core::domain::capture::DEFAULT_SCREEN_HEIGHT
}
fn default_density() -> u32 {
    mirror_core::domain::capture::DEFAULT_SCREEN_DENSITY
}
fn default_frame_rate() -> u32 {
    30
}
fn default_bitrate_bps() -> u32 {
    2_000_000
}
fn default_long_press_ms() -> u64 {
    1000
}
fn default_swipe_ms() -> u64 {
    500
}
fn default_max_gesture_ms() -> u64 {
    5000
}
fn default_input_queue() -> usize {
    16
}
fn default_input_program() -> String {
    "input".to_string()
}
fn default_stun_servers() -> Vec<String> {
    vec!["stun:stun.l.google.com:19302".to_string()]
}
fn default_sample_queue() -> usize {
    8
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            device: DeviceIdentity::default(),
            capture: CaptureConfig::default(),
            control: ControlConfig::default(),
            webrtc: WebRtcConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            bind_retry_ms: default_bind_retry_ms(),
            rebind_delay_ms: default_rebind_delay_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for DeviceIdentity {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            id: default_device_id(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            density: default_density(),
            frame_rate: default_frame_rate(),
            bitrate_bps: default_bitrate_bps(),
            drop_excess_frames: false,
            attach_policy: AttachPolicy::default(),
        }
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            long_press_ms: default_long_press_ms(),
            default_swipe_ms: default_swipe_ms(),
            max_gesture_ms: default_max_gesture_ms(),
            input_backend: InputBackend::default(),
            input_program: default_input_program(),
            input_queue: default_input_queue(),
        }
    }
}

impl Default for WebRtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            sample_queue: default_sample_queue(),
        }
    }
}

// ── Accessors ─────────────────────────────────────────────────────────────────

impl ServerConfig {
    /// Resolves `bind_address` and `port` into a socket address.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `bind_address` is not an IP address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        let ip: IpAddr = self
            .bind_address
            .parse()
            .map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                field: "server.bind_address",
                reason: e.to_string(),
            })?;
        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn bind_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.bind_retry_ms)
    }

    pub fn rebind_delay(&self) -> Duration {
        Duration::from_millis(self.rebind_delay_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl CaptureConfig {
    pub fn metrics(&self) -> ScreenMetrics {
        ScreenMetrics::new(self.width, self.height, self.density)
    }
}

impl ControlConfig {
    pub fn gesture_timings(&self) -> GestureTimings {
        GestureTimings {
            long_press: Duration::from_millis(self.long_press_ms),
            default_swipe: Duration::from_millis(self.default_swipe_ms),
            max_gesture: Duration::from_millis(self.max_gesture_ms),
        }
    }
}

impl DeviceConfig {
    /// Checks cross-field constraints that serde defaults cannot express.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.bind_addr()?;
        if self.server.bind_retry_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "server.bind_retry_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !self.capture.metrics().is_valid() {
            return Err(ConfigError::Invalid {
                field: "capture.width/height",
                reason: format!("{} has no area", self.capture.metrics()),
            });
        }
        if self.capture.frame_rate == 0 || self.capture.frame_rate > 120 {
            return Err(ConfigError::Invalid {
                field: "capture.frame_rate",
                reason: format!("{} is outside 1..=120", self.capture.frame_rate),
            });
        }
        if self.webrtc.sample_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "webrtc.sample_queue",
                reason: "must be greater than zero".to_string(),
            });
        }
        let longest_fixed = self.control.long_press_ms.max(self.control.default_swipe_ms);
        if self.control.max_gesture_ms < longest_fixed {
            return Err(ConfigError::Invalid {
                field: "control.max_gesture_ms",
                reason: format!(
                    "{} is shorter than the long-press or default swipe duration",
                    self.control.max_gesture_ms
                ),
            });
        }
        if self.control.input_queue == 0 {
            return Err(ConfigError::Invalid {
                field: "control.input_queue",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.control.input_program.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "control.input_program",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
