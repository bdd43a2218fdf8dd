//! Timer-driven capture source producing synthetic H.264-shaped frames.
//!
//! Frames carry an Annex-B start code and a NAL header: an IDR slice once per
//! second (every `frame_rate` frames) and a non-IDR slice otherwise.  The
//! payload is a per-frame byte pattern sized from the configured bitrate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use mirror_core::{CaptureGrant, VideoFrame};
use tracing::{debug, info};

use crate::application::capture_manager::{
    CaptureError, CaptureHandle, CaptureSettings, FrameFeed, ScreenCapturer,
};

/// Result code the platform reports for an accepted capture request.
pub const GRANT_OK: i32 = -1;

const START_CODE: [u8; 4] = [0, 0, 0, 1];
const NAL_IDR: u8 = 0x65;
const NAL_SLICE: u8 = 0x41;
const MIN_PAYLOAD: usize = 64;
const MAX_PAYLOAD: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct SyntheticCapturer;

impl SyntheticCapturer {
    pub fn new() -> Self {
        Self
    }
}

impl ScreenCapturer for SyntheticCapturer {
    fn open(
        &self,
        grant: &CaptureGrant,
        settings: &CaptureSettings,
        feed: FrameFeed,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        if grant.result_code != GRANT_OK {
            return Err(CaptureError::GrantRejected(format!(
                "result code {}",
                grant.result_code
            )));
        }
        if settings.frame_rate == 0 {
            return Err(CaptureError::Open("frame rate must be positive".into()));
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let settings = *settings;
        let generation = feed.generation();
        let thread = thread::Builder::new()
            .name(format!("capture-{generation}"))
            .spawn(move || produce(feed, settings, flag))
            .map_err(|e| CaptureError::Open(e.to_string()))?;

        info!(
            "synthetic capture opened: {} at {} fps",
            settings.metrics, settings.frame_rate
        );
        Ok(Box::new(SyntheticHandle {
            running,
            thread: Some(thread),
        }))
    }
}

struct SyntheticHandle {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl CaptureHandle for SyntheticHandle {
    fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                debug!("capture thread panicked");
            }
        }
    }
}

impl Drop for SyntheticHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn payload_len(settings: &CaptureSettings) -> usize {
    let per_frame = settings.bitrate_bps as usize / 8 / settings.frame_rate.max(1) as usize;
    per_frame.clamp(MIN_PAYLOAD, MAX_PAYLOAD)
}

/// Builds frame `sequence` for `settings`.
pub fn synthetic_frame(sequence: u64, timestamp_us: u64, settings: &CaptureSettings) -> VideoFrame {
    let keyframe = sequence % u64::from(settings.frame_rate.max(1)) == 0;
    let len = payload_len(settings);
    let mut data = Vec::with_capacity(START_CODE.len() + 1 + len);
    data.extend_from_slice(&START_CODE);
    data.push(if keyframe { NAL_IDR } else { NAL_SLICE });
    let base = (sequence % 256) as u8;
    data.extend((0..len).map(|i| base.wrapping_add((i % 251) as u8)));
    VideoFrame::new(sequence, timestamp_us, keyframe, data)
}

fn produce(feed: FrameFeed, settings: CaptureSettings, running: Arc<AtomicBool>) {
    let interval = Duration::from_secs(1) / settings.frame_rate;
    let started = Instant::now();
    let mut sequence: u64 = 0;
    let mut next = started;

    while running.load(Ordering::SeqCst) {
        let timestamp_us = started.elapsed().as_micros() as u64;
        feed.push(synthetic_frame(sequence, timestamp_us, &settings));
        sequence += 1;

        next += interval;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        } else {
            next = now;
        }
    }
    debug!("capture generation {} produced {sequence} frame(s)", feed.generation());
}
