//! Use case: own the single screen-capture pipeline and share its frames.
//!
//! The device has exactly one capture pipeline.  [`CaptureManager`] is the
//! explicit owner of it: sessions never touch a capture handle directly, they
//! attach a [`FrameSink`] and receive every frame the pipeline produces while
//! they stay attached.
//!
//! # Threading
//!
//! Two locks guard two different concerns:
//!
//! - the **lifecycle lock** serializes start, stop and attach, so a new handle
//!   is only opened after the previous one has fully stopped and no sink is
//!   ever added to a pipeline that is being stopped;
//! - the **sink list** is read by [`FrameFeed::push`] on the producer thread.
//!
//! Lock order is lifecycle, then sinks.  `push` never takes the lifecycle lock.  Stopping a handle joins the
//! producer thread while holding the lifecycle lock, so the two must stay
//! disjoint.  Every handle is tagged with a generation number; frames pushed
//! by a handle that has since been stopped carry a stale generation and are
//! dropped.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use mirror_core::{
    AttachPolicy, CaptureGrant, FrameCounters, PendingGrant, ScreenMetrics, SessionId, VideoFrame,
};
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Collaborator traits ───────────────────────────────────────────────────────

/// Errors reported by a [`ScreenCapturer`].
#[derive(Debug, Error, PartialEq)]
pub enum CaptureError {
    /// The platform refused the grant (expired, revoked, or never valid).
    #[error("capture grant rejected: {0}")]
    GrantRejected(String),

    /// The screen metrics describe an empty surface.
    #[error("invalid screen metrics {0}")]
    InvalidMetrics(ScreenMetrics),

    /// The pipeline could not be created.
    #[error("failed to open capture pipeline: {0}")]
    Open(String),
}

/// Fixed parameters for every capture handle the manager opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureSettings {
    pub metrics: ScreenMetrics,
    pub frame_rate: u32,
    pub bitrate_bps: u32,
}

/// Receives frames from the manager.
///
/// Called on the capture producer thread; implementations must not block.
pub trait FrameSink: Send + Sync {
    fn deliver(&self, frame: &VideoFrame);
}

/// A running capture pipeline.
pub trait CaptureHandle: Send {
    /// Stops production and releases the pipeline.
    ///
    /// Must not return until no further frame can be pushed by this handle.
    fn stop(&mut self);
}

/// Platform screen capture + encoder, seen from the engine.
pub trait ScreenCapturer: Send + Sync {
    /// Opens a new pipeline that pushes encoded frames into `feed`.
    fn open(
        &self,
        grant: &CaptureGrant,
        settings: &CaptureSettings,
        feed: FrameFeed,
    ) -> Result<Box<dyn CaptureHandle>, CaptureError>;
}

// ── Outcomes ──────────────────────────────────────────────────────────────────

/// Result of [`CaptureManager::start_capture`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new handle is running (any previous handle was stopped first).
    Started,
    /// The same grant is already capturing; nothing changed.
    AlreadyActive,
}

/// Result of [`CaptureManager::attach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Attached,
    /// This session's sink was already attached.
    AlreadyAttached,
    /// The exclusive policy is in force and another session holds the stream.
    Rejected,
    /// No capture handle is active.
    NotCapturing,
}

/// Point-in-time view of the capture resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    pub capturing: bool,
    pub metrics: ScreenMetrics,
    pub frame_rate: u32,
    pub attached: usize,
    pub pending_grant: bool,
    pub counters: FrameCounters,
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Handle given to a capture pipeline for pushing frames.
#[derive(Clone)]
pub struct FrameFeed {
    inner: Arc<Inner>,
    generation: u64,
}

impl FrameFeed {
    /// Hands one encoded frame to the manager.
    pub fn push(&self, frame: VideoFrame) {
        self.inner.on_frame(self.generation, frame);
    }

    /// Generation of the handle this feed belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Owner of the shared capture resource.  Cheap to clone.
#[derive(Clone)]
pub struct CaptureManager {
    inner: Arc<Inner>,
}

struct Lifecycle {
    handle: Option<Box<dyn CaptureHandle>>,
    grant: Option<CaptureGrant>,
    pending: Option<PendingGrant>,
}

struct Inner {
    capturer: Arc<dyn ScreenCapturer>,
    settings: CaptureSettings,
    policy: AttachPolicy,
    drop_excess_frames: bool,
    lifecycle: Mutex<Lifecycle>,
    sinks: RwLock<Vec<(SessionId, Arc<dyn FrameSink>)>>,
    /// Generation of the active handle; 0 while stopped.
    generation: AtomicU64,
    next_generation: AtomicU64,
    capturing: AtomicBool,
    produced: AtomicU64,
    forwarded: AtomicU64,
    dropped: AtomicU64,
    last_forward: Mutex<Option<Instant>>,
}

/// Locks a std mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl CaptureManager {
    pub fn new(
        capturer: Arc<dyn ScreenCapturer>,
        settings: CaptureSettings,
        policy: AttachPolicy,
        drop_excess_frames: bool,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                capturer,
                settings,
                policy,
                drop_excess_frames,
                lifecycle: Mutex::new(Lifecycle {
                    handle: None,
                    grant: None,
                    pending: None,
                }),
                sinks: RwLock::new(Vec::new()),
                generation: AtomicU64::new(0),
                next_generation: AtomicU64::new(1),
                capturing: AtomicBool::new(false),
                produced: AtomicU64::new(0),
                forwarded: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                last_forward: Mutex::new(None),
            }),
        }
    }

    /// Starts capturing with `grant`.
    ///
    /// The same grant while already capturing is ignored.  Otherwise any
    /// active handle is stopped and released before the new one is opened, so
    /// at most one handle exists at any time.
    ///
    /// # Errors
    ///
    /// Returns the capturer's [`CaptureError`]; the manager is then stopped.
    pub fn start_capture(&self, grant: CaptureGrant) -> Result<StartOutcome, CaptureError> {
        let mut life = lock(&self.inner.lifecycle);
        self.inner.start_locked(&mut life, grant)
    }

    /// Stops and releases the active handle.  Returns `false` when already stopped.
    pub fn stop_capture(&self) -> bool {
        let mut life = lock(&self.inner.lifecycle);
        let stopped = self.inner.stop_locked(&mut life).is_some();
        if stopped {
            info!("capture stopped");
        }
        stopped
    }

    /// Stops capture when no sink is attached, keeping the grant as pending so
    /// a later session can restart it without a new platform grant.
    ///
    /// Returns `true` when capture was stopped.
    pub fn release_if_idle(&self) -> bool {
        let mut life = lock(&self.inner.lifecycle);
        if self.attached_count() > 0 {
            return false;
        }
        match self.inner.stop_locked(&mut life) {
            Some(grant) => {
                if life.pending.is_none() {
                    life.pending = Some(PendingGrant::new(grant));
                }
                info!("capture stopped: no session attached");
                true
            }
            None => false,
        }
    }

    /// Parks a grant until a session is ready for media.  Replaces any
    /// unconsumed pending grant.
    pub fn store_pending(&self, grant: CaptureGrant) {
        let mut life = lock(&self.inner.lifecycle);
        if life.pending.is_some() {
            debug!("replacing unconsumed pending grant");
        }
        life.pending = Some(PendingGrant::new(grant));
    }

    /// Removes and returns the pending grant.
    pub fn take_pending(&self) -> Option<PendingGrant> {
        lock(&self.inner.lifecycle).pending.take()
    }

    pub fn has_pending(&self) -> bool {
        lock(&self.inner.lifecycle).pending.is_some()
    }

    /// Adds `sink` as the receiver for `session` according to the attach policy.
    pub fn attach(&self, session: SessionId, sink: Arc<dyn FrameSink>) -> AttachOutcome {
        let life = lock(&self.inner.lifecycle);
        self.inner.attach_locked(&life, session, sink)
    }

    /// Like [`attach`](Self::attach), but first starts capture from the
    /// pending grant when nothing is running.  Both steps happen under one
    /// lifecycle lock, so an idle release cannot slip in between.
    pub fn attach_or_resume(
        &self,
        session: SessionId,
        sink: Arc<dyn FrameSink>,
    ) -> AttachOutcome {
        let mut life = lock(&self.inner.lifecycle);
        if life.handle.is_none() {
            if let Some(pending) = life.pending.take() {
                debug!(
                    "session {session}: consuming grant pending for {:?}",
                    pending.age()
                );
                if let Err(e) = self.inner.start_locked(&mut life, pending.grant) {
                    warn!("session {session}: capture start failed: {e}");
                }
            }
        }
        self.inner.attach_locked(&life, session, sink)
    }

    /// Removes the sink of `session`.  Returns whether it was attached.
    pub fn detach(&self, session: SessionId) -> bool {
        let mut sinks = self
            .inner
            .sinks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let before = sinks.len();
        sinks.retain(|(id, _)| *id != session);
        let detached = sinks.len() != before;
        if detached {
            info!(
                "session {session}: detached from capture ({} sink(s) left)",
                sinks.len()
            );
        }
        detached
    }

    pub fn is_capturing(&self) -> bool {
        self.inner.capturing.load(Ordering::SeqCst)
    }

    pub fn is_attached(&self, session: SessionId) -> bool {
        self.inner
            .sinks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .any(|(id, _)| *id == session)
    }

    pub fn attached_count(&self) -> usize {
        self.inner
            .sinks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn policy(&self) -> AttachPolicy {
        self.inner.policy
    }

    pub fn counters(&self) -> FrameCounters {
        FrameCounters {
            produced: self.inner.produced.load(Ordering::Relaxed),
            forwarded: self.inner.forwarded.load(Ordering::Relaxed),
            dropped: self.inner.dropped.load(Ordering::Relaxed),
        }
    }

    pub fn status(&self) -> CaptureStatus {
        CaptureStatus {
            capturing: self.is_capturing(),
            metrics: self.inner.settings.metrics,
            frame_rate: self.inner.settings.frame_rate,
            attached: self.attached_count(),
            pending_grant: self.has_pending(),
            counters: self.counters(),
        }
    }
}

impl Inner {
    /// Opens a handle for `grant`, stopping any previous one first.
    fn start_locked(
        self: &Arc<Self>,
        life: &mut Lifecycle,
        grant: CaptureGrant,
    ) -> Result<StartOutcome, CaptureError> {
        if !self.settings.metrics.is_valid() {
            return Err(CaptureError::InvalidMetrics(self.settings.metrics));
        }
        if life.handle.is_some() && life.grant.as_ref() == Some(&grant) {
            debug!("capture already running with this grant; ignoring start");
            return Ok(StartOutcome::AlreadyActive);
        }

        if let Some(mut previous) = life.handle.take() {
            info!("replacing active capture handle");
            self.retire_generation();
            previous.stop();
        }
        life.grant = None;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.generation.store(generation, Ordering::SeqCst);
        let feed = FrameFeed {
            inner: Arc::clone(self),
            generation,
        };

        match self.capturer.open(&grant, &self.settings, feed) {
            Ok(handle) => {
                life.handle = Some(handle);
                life.grant = Some(grant.clone());
                if life.pending.as_ref().map(|p| &p.grant) == Some(&grant) {
                    life.pending = None;
                }
                *lock(&self.last_forward) = None;
                self.capturing.store(true, Ordering::SeqCst);
                info!(
                    "capture started: {} at {} fps (generation {generation})",
                    self.settings.metrics, self.settings.frame_rate
                );
                Ok(StartOutcome::Started)
            }
            Err(e) => {
                self.retire_generation();
                warn!("capture failed to start: {e}");
                Err(e)
            }
        }
    }

    /// Adds a sink.  The caller holds the lifecycle lock.
    fn attach_locked(
        &self,
        life: &Lifecycle,
        session: SessionId,
        sink: Arc<dyn FrameSink>,
    ) -> AttachOutcome {
        if life.handle.is_none() {
            return AttachOutcome::NotCapturing;
        }
        let mut sinks = self
            .sinks
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if sinks.iter().any(|(id, _)| *id == session) {
            return AttachOutcome::AlreadyAttached;
        }
        if self.policy == AttachPolicy::Exclusive && !sinks.is_empty() {
            debug!("session {session}: exclusive stream already held; attach refused");
            return AttachOutcome::Rejected;
        }
        sinks.push((session, sink));
        info!(
            "session {session}: attached to capture ({} sink(s))",
            sinks.len()
        );
        AttachOutcome::Attached
    }

    /// Marks the current generation stale so late frames are dropped.
    fn retire_generation(&self) {
        self.generation.store(0, Ordering::SeqCst);
        self.capturing.store(false, Ordering::SeqCst);
    }

    /// Stops the active handle, returning the grant it was started with.
    fn stop_locked(&self, life: &mut Lifecycle) -> Option<CaptureGrant> {
        let mut handle = life.handle.take()?;
        self.retire_generation();
        handle.stop();
        life.grant.take()
    }

    fn on_frame(&self, generation: u64, frame: VideoFrame) {
        self.produced.fetch_add(1, Ordering::Relaxed);

        if generation == 0 || generation != self.generation.load(Ordering::SeqCst) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if self.drop_excess_frames && self.exceeds_frame_rate() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let sinks: Vec<Arc<dyn FrameSink>> = self
            .sinks
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        if sinks.is_empty() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for sink in &sinks {
            sink.deliver(&frame);
        }
        self.forwarded
            .fetch_add(sinks.len() as u64, Ordering::Relaxed);
    }

    /// `true` when the previous forwarded frame is closer than one frame interval.
    fn exceeds_frame_rate(&self) -> bool {
        let interval = Duration::from_secs(1) / self.settings.frame_rate.max(1);
        let now = Instant::now();
        let mut last = lock(&self.last_forward);
        match *last {
            Some(prev) if now.duration_since(prev) < interval => true,
            _ => {
                *last = Some(now);
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
