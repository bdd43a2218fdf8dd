//! Screen-capture sources.
//!
//! A source implements [`ScreenCapturer`](crate::application::ScreenCapturer)
//! and pushes encoded frames into the [`FrameFeed`](crate::application::FrameFeed)
//! it is opened with.  The engine never talks to a platform capture API
//! directly; the host process plugs its own capturer into the
//! [`CaptureManager`](crate::application::CaptureManager).
//!
//! `synthetic` produces Annex-B shaped frames on a timer.  It is what the
//! standalone binary runs and what the integration tests stream.

pub mod synthetic;

pub use synthetic::{SyntheticCapturer, GRANT_OK};
