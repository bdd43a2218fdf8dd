//! Capture-side value types.
//!
//! The device owns exactly one screen-capture pipeline.  Starting it needs a
//! [`CaptureGrant`] from the platform's permission flow; a grant that arrives
//! before any session can use it is parked as a [`PendingGrant`].  Frames
//! leave the pipeline as [`VideoFrame`]s and are fanned out according to the
//! configured [`AttachPolicy`].

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Default capture width in pixels when the platform reports none.
pub const DEFAULT_SCREEN_WIDTH: u32 = 1080;
/// Default capture height in pixels when the platform reports none.
pub const DEFAULT_SCREEN_HEIGHT: u32 = 1920;
/// Default display density (dots per inch).
pub const DEFAULT_SCREEN_DENSITY: u32 = 440;

/// Display geometry, read once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenMetrics {
    pub width: u32,
    pub height: u32,
    pub density: u32,
}

impl ScreenMetrics {
    pub fn new(width: u32, height: u32, density: u32) -> Self {
        Self {
            width,
            height,
            density,
        }
    }

    /// A capture surface needs a non-empty area.
    pub fn is_valid(&self) -> bool {
        self.width > 0 && self.height > 0
    }

    /// Number of pixels in one frame.
    pub fn pixel_count(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl Default for ScreenMetrics {
    fn default() -> Self {
        Self::new(
            DEFAULT_SCREEN_WIDTH,
            DEFAULT_SCREEN_HEIGHT,
            DEFAULT_SCREEN_DENSITY,
        )
    }
}

impl fmt::Display for ScreenMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}dpi", self.width, self.height, self.density)
    }
}

/// Opaque screen-capture permission returned by the platform.
///
/// Two grants are the same grant when both fields are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CaptureGrant {
    pub result_code: i32,
    pub data: String,
}

impl CaptureGrant {
    pub fn new(result_code: i32, data: impl Into<String>) -> Self {
        Self {
            result_code,
            data: data.into(),
        }
    }
}

/// A grant received while no session was ready for media.
///
/// At most one is retained; a newer grant replaces an unconsumed one.
#[derive(Debug, Clone)]
pub struct PendingGrant {
    pub grant: CaptureGrant,
    pub received_at: Instant,
}

impl PendingGrant {
    pub fn new(grant: CaptureGrant) -> Self {
        Self {
            grant,
            received_at: Instant::now(),
        }
    }

    /// How long the grant has been waiting.
    pub fn age(&self) -> Duration {
        self.received_at.elapsed()
    }
}

/// One encoded frame from the capture pipeline.
///
/// The payload is shared: cloning a frame for each attached sink never copies
/// the encoded bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFrame {
    /// Production order, starting at 0 for each capture handle.
    pub sequence: u64,
    /// Capture time in microseconds, relative to the handle's start.
    pub timestamp_us: u64,
    /// `true` for a frame that can be decoded on its own.
    pub keyframe: bool,
    pub data: Arc<[u8]>,
}

impl VideoFrame {
    pub fn new(sequence: u64, timestamp_us: u64, keyframe: bool, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            sequence,
            timestamp_us,
            keyframe,
            data: data.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// How the single capture stream is shared between ready sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// Every ready session receives every frame.
    #[default]
    FanOut,
    /// The first attached session holds the stream; later attaches are refused
    /// until it detaches.
    Exclusive,
}

impl fmt::Display for AttachPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FanOut => f.write_str("fan-out"),
            Self::Exclusive => f.write_str("exclusive"),
        }
    }
}

impl FromStr for AttachPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fan-out" | "fan_out" | "fanout" => Ok(Self::FanOut),
            "exclusive" => Ok(Self::Exclusive),
            other => Err(format!(
                "unknown attach policy '{other}' (expected fan-out or exclusive)"
            )),
        }
    }
}

/// Running totals kept by the capture manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameCounters {
    /// Frames handed to the manager by the current and previous handles.
    pub produced: u64,
    /// Frame deliveries to sinks (one frame sent to two sinks counts twice).
    pub forwarded: u64,
    /// Frames released without reaching any sink.
    pub dropped: u64,
}
