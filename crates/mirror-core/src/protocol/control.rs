//! Control events: the touch/key command payload and its decoder.
//!
//! A controller sends one JSON object per command, either over the `control`
//! data channel or wrapped in a `control_event` signaling message:
//!
//! ```json
//! {"type":"click","x":540.0,"y":1200.0,"timestamp":1700000000000}
//! {"type":"swipe","x":540,"y":1600,"endX":540,"endY":400,"duration":300}
//! {"type":"click","x":-1,"y":-1}
//! ```
//!
//! [`decode_control_event`] turns such an object into an [`InputAction`] by
//! applying, in order:
//!
//! 1. **Sentinel keys** – both coordinates equal to (-1,-1), (-2,-2) or
//!    (-3,-3) select Back, Home or Menu regardless of `type`.
//! 2. **Tap** (`tap` / `click`).
//! 3. **Long press** (`long_press` / `long_click`), held for
//!    [`GestureTimings::long_press`].
//! 4. **Swipe** with an end point, over `duration` or
//!    [`GestureTimings::default_swipe`], capped at
//!    [`GestureTimings::max_gesture`].
//! 5. Anything else is rejected.
//!
//! Coordinates are JSON numbers and are truncated toward zero to whole pixels.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hold time for a long press.
pub const LONG_PRESS_DURATION: Duration = Duration::from_millis(1000);

/// Swipe duration used when the event carries none.
pub const DEFAULT_SWIPE_DURATION: Duration = Duration::from_millis(500);

/// Longest gesture a controller may request.
pub const MAX_GESTURE_DURATION: Duration = Duration::from_millis(5000);

/// Errors raised while decoding a control event.  None of them is reported to
/// the controller; the event is logged and dropped.
#[derive(Debug, Error, PartialEq)]
pub enum ControlDecodeError {
    /// The payload is not a JSON control-event object.
    #[error("malformed control event: {0}")]
    Malformed(String),

    /// A coordinate is NaN or infinite.
    #[error("coordinate is not a finite number")]
    NotFinite,

    /// Negative coordinates that are not one of the key sentinels.
    #[error("negative coordinate ({x}, {y}) is not a key sentinel")]
    NegativeCoordinate { x: f64, y: f64 },

    /// A `swipe` without both `endX` and `endY`.
    #[error("swipe is missing its end coordinate")]
    MissingSwipeEnd,

    /// A `key` event whose coordinates select no known key.
    #[error("no key is mapped to ({x}, {y})")]
    UnknownKey { x: f64, y: f64 },

    /// The `type` field names no supported gesture.
    #[error("unsupported control event type")]
    UnsupportedKind,
}

/// Gesture kind named by the event's `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlKind {
    #[serde(alias = "click")]
    Tap,
    #[serde(alias = "long_click")]
    LongPress,
    Swipe,
    Key,
    /// Any `type` string this device does not know.
    #[default]
    #[serde(other)]
    Unknown,
}

/// One inbound command, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlEvent {
    #[serde(rename = "type", default)]
    pub kind: ControlKind,

    pub x: f64,
    pub y: f64,

    #[serde(rename = "endX", default, skip_serializing_if = "Option::is_none")]
    pub end_x: Option<f64>,

    #[serde(rename = "endY", default, skip_serializing_if = "Option::is_none")]
    pub end_y: Option<f64>,

    /// Gesture duration in milliseconds.  Only swipes use it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u64>,

    /// Controller-side creation time, milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: i64,
}

impl ControlEvent {
    /// Convenience constructor for a single-point event.
    pub fn new(kind: ControlKind, x: f64, y: f64) -> Self {
        Self {
            kind,
            x,
            y,
            end_x: None,
            end_y: None,
            duration: None,
            timestamp: 0,
        }
    }
}

/// Platform hardware keys reachable through coordinate sentinels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialKey {
    Back,
    Home,
    Menu,
}

impl SpecialKey {
    /// Maps a coordinate pair to a key when both components match a sentinel.
    pub fn from_sentinel(x: f64, y: f64) -> Option<Self> {
        if x != y {
            return None;
        }
        if x == -1.0 {
            Some(Self::Back)
        } else if x == -2.0 {
            Some(Self::Home)
        } else if x == -3.0 {
            Some(Self::Menu)
        } else {
            None
        }
    }

    /// The platform key code injected for this key.
    pub fn key_code(self) -> u32 {
        match self {
            Self::Back => 4,
            Self::Home => 3,
            Self::Menu => 82,
        }
    }
}

/// A screen position in whole pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Converts wire coordinates, truncating toward zero.
    fn from_wire(x: f64, y: f64) -> Result<Self, ControlDecodeError> {
        if !x.is_finite() || !y.is_finite() {
            return Err(ControlDecodeError::NotFinite);
        }
        if x < 0.0 || y < 0.0 {
            return Err(ControlDecodeError::NegativeCoordinate { x, y });
        }
        Ok(Self {
            x: x as i32,
            y: y as i32,
        })
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// A normalized input action ready for injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputAction {
    Key(SpecialKey),
    Tap { at: Point },
    LongPress { at: Point, duration: Duration },
    Swipe {
        from: Point,
        to: Point,
        duration: Duration,
    },
}

impl fmt::Display for InputAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key(key) => write!(f, "key {key:?} ({})", key.key_code()),
            Self::Tap { at } => write!(f, "tap {at}"),
            Self::LongPress { at, duration } => {
                write!(f, "long press {at} for {}ms", duration.as_millis())
            }
            Self::Swipe { from, to, duration } => {
                write!(f, "swipe {from} -> {to} over {}ms", duration.as_millis())
            }
        }
    }
}

/// Fixed gesture durations applied by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GestureTimings {
    pub long_press: Duration,
    pub default_swipe: Duration,
    /// Upper bound for a controller-supplied swipe duration.
    pub max_gesture: Duration,
}

impl Default for GestureTimings {
    fn default() -> Self {
        Self {
            long_press: LONG_PRESS_DURATION,
            default_swipe: DEFAULT_SWIPE_DURATION,
            max_gesture: MAX_GESTURE_DURATION,
        }
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses a data-channel payload into a [`ControlEvent`].
///
/// # Errors
///
/// Returns [`ControlDecodeError::Malformed`] if the bytes are not a JSON
/// control-event object.
pub fn parse_control_payload(payload: &[u8]) -> Result<ControlEvent, ControlDecodeError> {
    serde_json::from_slice(payload).map_err(|e| ControlDecodeError::Malformed(e.to_string()))
}

/// Decodes a control event into the action to inject.
///
/// # Errors
///
/// Returns a [`ControlDecodeError`] describing why the event was rejected.
pub fn decode_control_event(
    event: &ControlEvent,
    timings: &GestureTimings,
) -> Result<InputAction, ControlDecodeError> {
    // Sentinels win over the declared kind.
    if let Some(key) = SpecialKey::from_sentinel(event.x, event.y) {
        return Ok(InputAction::Key(key));
    }

    if event.kind == ControlKind::Key {
        return Err(ControlDecodeError::UnknownKey {
            x: event.x,
            y: event.y,
        });
    }

    let at = Point::from_wire(event.x, event.y)?;

    match event.kind {
        ControlKind::Tap => Ok(InputAction::Tap { at }),
        ControlKind::LongPress => Ok(InputAction::LongPress {
            at,
            duration: timings.long_press,
        }),
        ControlKind::Swipe => {
            let (Some(end_x), Some(end_y)) = (event.end_x, event.end_y) else {
                return Err(ControlDecodeError::MissingSwipeEnd);
            };
            let to = Point::from_wire(end_x, end_y)?;
            let duration = event
                .duration
                .map(Duration::from_millis)
                .unwrap_or(timings.default_swipe)
                .min(timings.max_gesture);
            Ok(InputAction::Swipe {
                from: at,
                to,
                duration,
            })
        }
        ControlKind::Key | ControlKind::Unknown => Err(ControlDecodeError::UnsupportedKind),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
