//! Test doubles shared by the mirror-device integration tests.
//!
//! Every collaborator seam is replaced with an in-memory recorder so the
//! registry, negotiation and capture manager run for real without a network
//! peer, a screen, or an `input` tool.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use mirror_core::{
    AttachPolicy, CaptureGrant, GestureTimings, IceCandidate, OutboundMessage, ScreenMetrics,
    SessionId, VideoFrame,
};
use tokio::sync::mpsc;

use mirror_device::application::{
    CaptureError, CaptureHandle, CaptureManager, CaptureSettings, ControlTranslator, DeviceInfo,
    FrameFeed, FrameSink, PeerConnector, PeerError, PeerEvent, PeerHandle, ScreenCapturer,
    SendError, SessionRegistry, SignalSink,
};
use mirror_device::infrastructure::RecordingInjector;

// ── Frames ────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingSink {
    pub frames: AtomicU64,
}

impl CountingSink {
    pub fn count(&self) -> u64 {
        self.frames.load(Ordering::SeqCst)
    }
}

impl FrameSink for CountingSink {
    fn deliver(&self, _frame: &VideoFrame) {
        self.frames.fetch_add(1, Ordering::SeqCst);
    }
}

// ── Peer transport ────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct FakePeer {
    pub remote_candidates: Mutex<Vec<String>>,
    pub closed: AtomicUsize,
    pub answered: AtomicBool,
    pub sink: Arc<CountingSink>,
}

#[async_trait]
impl PeerHandle for FakePeer {
    async fn create_control_channel(&self) -> Result<(), PeerError> {
        Ok(())
    }
    async fn create_offer(&self) -> Result<String, PeerError> {
        Ok("v=0\r\na=sendonly\r\n".to_string())
    }
    async fn set_local_description(&self, _sdp: &str) -> Result<(), PeerError> {
        Ok(())
    }
    async fn set_remote_answer(&self, _sdp: &str) -> Result<(), PeerError> {
        if self.answered.swap(true, Ordering::SeqCst) {
            return Err(PeerError::Description("answer already applied".to_string()));
        }
        Ok(())
    }
    async fn answer_offer(&self, _sdp: &str) -> Result<String, PeerError> {
        self.answered.store(true, Ordering::SeqCst);
        Ok("v=0\r\na=sendonly\r\n".to_string())
    }
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.remote_candidates
            .lock()
            .unwrap()
            .push(candidate.candidate);
        Ok(())
    }
    fn video_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }
    async fn close(&self) -> Result<(), PeerError> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Creates one [`FakePeer`] per connect, keyed by session.
#[derive(Default)]
pub struct FakeConnector {
    pub peers: Mutex<Vec<(SessionId, Arc<FakePeer>)>>,
}

impl FakeConnector {
    /// Most recent peer created for `session`.
    pub fn peer(&self, session: SessionId) -> Arc<FakePeer> {
        self.peers
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(id, _)| *id == session)
            .map(|(_, p)| p.clone())
            .expect("no peer for session")
    }
}

#[async_trait]
impl PeerConnector for FakeConnector {
    async fn connect(
        &self,
        session: SessionId,
        _events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError> {
        let peer = Arc::new(FakePeer::default());
        self.peers.lock().unwrap().push((session, peer.clone()));
        Ok(peer)
    }
}

// ── Capture ───────────────────────────────────────────────────────────────────

/// Capturer whose frames are pushed by the test through [`ManualCapturer::emit`].
#[derive(Default)]
pub struct ManualCapturer {
    feed: Arc<Mutex<Option<FrameFeed>>>,
    pub live: Arc<AtomicUsize>,
    pub opened: AtomicUsize,
}

struct ManualHandle {
    feed: Arc<Mutex<Option<FrameFeed>>>,
    live: Arc<AtomicUsize>,
}

impl CaptureHandle for ManualHandle {
    fn stop(&mut self) {
        self.feed.lock().unwrap().take();
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScreenCapturer for ManualCapturer {
    fn open(
        &self,
        _grant: &CaptureGrant,
        _settings: &CaptureSettings,
        feed: FrameFeed,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError> {
        *self.feed.lock().unwrap() = Some(feed);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ManualHandle {
            feed: Arc::clone(&self.feed),
            live: Arc::clone(&self.live),
        }))
    }
}

impl ManualCapturer {
    /// Pushes `n` frames through the active handle.  Returns `false` if no
    /// handle is open.
    pub fn emit(&self, n: u64) -> bool {
        let feed = self.feed.lock().unwrap().clone();
        match feed {
            Some(feed) => {
                for seq in 0..n {
                    feed.push(VideoFrame::new(seq, seq * 33_333, seq == 0, vec![0u8; 32]));
                }
                true
            }
            None => false,
        }
    }

    pub fn live_handles(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

// ── Signaling ─────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingSignal {
    pub sent: Mutex<Vec<OutboundMessage>>,
}

impl SignalSink for RecordingSignal {
    fn send(&self, message: &OutboundMessage) -> Result<(), SendError> {
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}

impl RecordingSignal {
    pub fn types(&self) -> Vec<&'static str> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(OutboundMessage::type_name)
            .collect()
    }

    pub fn count(&self, type_name: &str) -> usize {
        self.types().iter().filter(|t| **t == type_name).count()
    }
}

// ── Harness ───────────────────────────────────────────────────────────────────

pub struct Harness {
    pub registry: Arc<SessionRegistry>,
    pub connector: Arc<FakeConnector>,
    pub capturer: Arc<ManualCapturer>,
    pub injector: Arc<RecordingInjector>,
}

pub fn harness(policy: AttachPolicy) -> Harness {
    let connector = Arc::new(FakeConnector::default());
    let capturer = Arc::new(ManualCapturer::default());
    let injector = Arc::new(RecordingInjector::new());
    let capture = CaptureManager::new(
        capturer.clone(),
        CaptureSettings {
            metrics: ScreenMetrics::default(),
            frame_rate: 30,
            bitrate_bps: 2_000_000,
        },
        policy,
        false,
    );
    let translator = Arc::new(ControlTranslator::new(
        injector.clone(),
        GestureTimings::default(),
    ));
    let registry = Arc::new(SessionRegistry::new(
        connector.clone(),
        capture,
        translator,
        DeviceInfo {
            name: "test-device".to_string(),
            id: "device-0001".to_string(),
        },
    ));
    Harness {
        registry,
        connector,
        capturer,
        injector,
    }
}

pub fn grant() -> CaptureGrant {
    CaptureGrant::new(-1, "grant-token")
}
