//! Use case: drive one session's offer/answer/ICE handshake.
//!
//! Each accepted connection owns one [`Negotiation`].  It creates the peer
//! connection through the injected [`PeerConnector`], sends a single
//! send-only offer, applies the controller's answer, and replays ICE
//! candidates that arrived before the answer in the order they arrived.  A
//! controller may instead send its own offer; the device then answers it on
//! the same state machine.  Once
//! the transport is usable and the [`CaptureManager`] has an active frame
//! source, the session's video sink is attached and the state becomes
//! `Attached`.
//!
//! All methods take `&mut self`; the caller (the session registry) holds the
//! session's lock for the duration of each call, which serializes everything
//! that happens to one connection.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use mirror_core::{IceCandidate, NegotiationState, OutboundMessage, SessionId};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::application::capture_manager::{AttachOutcome, CaptureManager, FrameSink};
use crate::application::signal::{SendError, SignalSink};

/// Label of the ordered data channel carrying control events.
pub const CONTROL_CHANNEL_LABEL: &str = "control";

// ── Transport collaborator ────────────────────────────────────────────────────

/// Errors reported by the peer-connection library.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PeerError {
    #[error("failed to create peer connection: {0}")]
    Create(String),

    #[error("failed to create data channel: {0}")]
    DataChannel(String),

    #[error("failed to create offer: {0}")]
    Offer(String),

    #[error("failed to create answer: {0}")]
    Answer(String),

    #[error("failed to apply session description: {0}")]
    Description(String),

    #[error("failed to add ICE candidate: {0}")]
    Candidate(String),

    #[error("peer connection already closed")]
    Closed,
}

/// Connection state reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for TransportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Something the transport reports for a session.  Delivered through the
/// session's event channel so it is handled on the same serialized context as
/// signaling messages.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// A locally gathered ICE candidate to forward to the controller.
    LocalCandidate(IceCandidate),
    /// Raw bytes received on the `control` data channel.
    ControlMessage(Vec<u8>),
    StateChanged(TransportState),
}

/// Creates peer connections.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    /// Creates a peer connection for `session` whose events go to `events`.
    async fn connect(
        &self,
        session: SessionId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError>;
}

/// One peer connection, as needed by the negotiation.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Creates the ordered outbound `control` data channel.
    async fn create_control_channel(&self) -> Result<(), PeerError>;

    /// Creates a send-only video offer and returns its SDP.
    async fn create_offer(&self) -> Result<String, PeerError>;

    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerError>;

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerError>;

    /// Applies a controller-originated offer, creates the answer, applies it
    /// locally, and returns its SDP.
    async fn answer_offer(&self, sdp: &str) -> Result<String, PeerError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError>;

    /// Sink feeding this peer's outbound video track.
    fn video_sink(&self) -> Arc<dyn FrameSink>;

    /// Releases the data channel and the connection.
    async fn close(&self) -> Result<(), PeerError>;
}

// ── Negotiation ───────────────────────────────────────────────────────────────

/// Errors surfaced to the registry.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The transport failed; the session stays `Negotiating` until restarted.
    #[error(transparent)]
    Peer(#[from] PeerError),

    /// An answer or candidate arrived before any peer connection existed.
    /// The registry closes the session for an early answer and drops an
    /// early candidate.
    #[error("{0} received before negotiation started")]
    NoPeer(&'static str),

    #[error("failed to signal controller: {0}")]
    Signal(#[from] SendError),
}

/// Shared collaborators used by every negotiation.
#[derive(Clone)]
pub struct NegotiationContext {
    pub connector: Arc<dyn PeerConnector>,
    pub capture: CaptureManager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new peer connection was created and the offer sent.
    OfferSent,
    /// Already negotiating or attached; nothing was done.
    AlreadyStarted,
    /// The session is closed.
    Ignored,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateOutcome {
    Applied,
    /// Held until the remote description is applied.
    Buffered,
}

/// Result of trying to attach to the capture resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachResult {
    Attached,
    /// Already attached before this call.
    Unchanged,
    /// Transport not usable yet.
    NotReady,
    /// No capture is active and no grant is pending.
    WaitingForCapture,
    /// Another session holds the exclusive stream.
    Rejected,
}

/// Per-connection negotiation state machine.
pub struct Negotiation {
    session_id: SessionId,
    state: NegotiationState,
    peer: Option<Arc<dyn PeerHandle>>,
    pending_candidates: VecDeque<IceCandidate>,
    remote_applied: bool,
    needs_restart: bool,
}

impl Negotiation {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: NegotiationState::New,
            peer: None,
            pending_candidates: VecDeque::new(),
            remote_applied: false,
            needs_restart: false,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    /// Candidates held until the answer is applied.
    pub fn pending_candidate_count(&self) -> usize {
        self.pending_candidates.len()
    }

    /// `true` after a negotiation step failed; the next start recreates the peer.
    pub fn needs_restart(&self) -> bool {
        self.needs_restart
    }

    /// `true` when the transport is usable and only capture is missing.
    pub fn is_ready_for_media(&self) -> bool {
        self.state == NegotiationState::Negotiating
            && self.remote_applied
            && self.peer.is_some()
            && !self.needs_restart
    }

    /// `New → Negotiating`: create the peer, the control channel and the offer.
    ///
    /// A start while negotiating or attached is a no-op unless an earlier step
    /// failed, in which case the old peer is discarded and a fresh offer is
    /// sent.
    ///
    /// # Errors
    ///
    /// Any transport or signaling failure.  The session stays `Negotiating`
    /// and is marked for restart.
    pub async fn start(
        &mut self,
        ctx: &NegotiationContext,
        signal: &dyn SignalSink,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<StartOutcome, NegotiationError> {
        match self.state {
            NegotiationState::Closed => return Ok(StartOutcome::Ignored),
            NegotiationState::Negotiating | NegotiationState::Attached if !self.needs_restart => {
                debug!(
                    "session {}: start ignored, already {}",
                    self.session_id, self.state
                );
                return Ok(StartOutcome::AlreadyStarted);
            }
            NegotiationState::Negotiating | NegotiationState::Attached => {
                info!("session {}: restarting negotiation", self.session_id);
                self.release_peer(ctx).await;
            }
            NegotiationState::New => {}
        }

        self.state = NegotiationState::Negotiating;
        self.needs_restart = false;
        self.remote_applied = false;
        self.pending_candidates.clear();

        let result = self.create_and_offer(ctx, signal, events).await;
        if result.is_err() {
            self.needs_restart = true;
        }
        result.map(|()| StartOutcome::OfferSent)
    }

    async fn create_and_offer(
        &mut self,
        ctx: &NegotiationContext,
        signal: &dyn SignalSink,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<(), NegotiationError> {
        let peer = ctx.connector.connect(self.session_id, events).await?;
        // Stored before the remaining steps so teardown releases it on failure.
        self.peer = Some(Arc::clone(&peer));

        peer.create_control_channel().await?;
        let sdp = peer.create_offer().await?;
        peer.set_local_description(&sdp).await?;
        signal.send(&OutboundMessage::Offer { sdp })?;

        info!("session {}: offer sent", self.session_id);
        Ok(())
    }

    /// Applies the controller's answer, replays buffered candidates in arrival
    /// order, and attaches to capture if possible.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::NoPeer`] if no peer connection exists (the caller
    /// closes the session); [`NegotiationError::Peer`] if the answer is
    /// rejected.
    pub async fn apply_answer(
        &mut self,
        ctx: &NegotiationContext,
        sdp: &str,
    ) -> Result<AttachResult, NegotiationError> {
        if self.state.is_terminal() {
            return Ok(AttachResult::NotReady);
        }
        let peer = self.peer.clone().ok_or(NegotiationError::NoPeer("answer"))?;

        if let Err(e) = peer.set_remote_answer(sdp).await {
            self.needs_restart = true;
            return Err(e.into());
        }
        self.remote_applied = true;
        self.replay_candidates(peer.as_ref()).await;

        Ok(self.try_attach(ctx))
    }

    /// Answers an offer sent by the controller.
    ///
    /// A healthy peer whose remote description is already applied is reused
    /// (renegotiation).  Otherwise any peer still waiting for an answer to the
    /// device's own offer is discarded and a fresh one answers.  Buffered
    /// candidates are replayed and capture is attached if possible.
    ///
    /// # Errors
    ///
    /// Any transport or signaling failure.  The session stays `Negotiating`
    /// and is marked for restart.
    pub async fn accept_offer(
        &mut self,
        ctx: &NegotiationContext,
        signal: &dyn SignalSink,
        events: mpsc::Sender<PeerEvent>,
        sdp: &str,
    ) -> Result<AttachResult, NegotiationError> {
        if self.state.is_terminal() {
            return Ok(AttachResult::NotReady);
        }

        let reusable = self.remote_applied && !self.needs_restart;
        let peer = match self.peer.clone() {
            Some(peer) if reusable => peer,
            _ => {
                if self.peer.is_some() {
                    info!(
                        "session {}: controller offer replaces pending negotiation",
                        self.session_id
                    );
                    self.release_peer(ctx).await;
                }
                self.state = NegotiationState::Negotiating;
                self.needs_restart = false;
                self.remote_applied = false;
                match ctx.connector.connect(self.session_id, events).await {
                    Ok(peer) => {
                        self.peer = Some(Arc::clone(&peer));
                        peer
                    }
                    Err(e) => {
                        self.needs_restart = true;
                        return Err(e.into());
                    }
                }
            }
        };

        let result = self.answer_with(peer.as_ref(), signal, sdp).await;
        if result.is_err() {
            self.needs_restart = true;
        }
        result?;

        self.remote_applied = true;
        self.replay_candidates(peer.as_ref()).await;
        Ok(self.try_attach(ctx))
    }

    async fn answer_with(
        &self,
        peer: &dyn PeerHandle,
        signal: &dyn SignalSink,
        offer: &str,
    ) -> Result<(), NegotiationError> {
        let sdp = peer.answer_offer(offer).await?;
        signal.send(&OutboundMessage::Answer { sdp })?;
        info!("session {}: answer sent", self.session_id);
        Ok(())
    }

    async fn replay_candidates(&mut self, peer: &dyn PeerHandle) {
        let buffered = self.pending_candidates.len();
        while let Some(candidate) = self.pending_candidates.pop_front() {
            if let Err(e) = peer.add_ice_candidate(candidate).await {
                warn!("session {}: buffered candidate rejected: {e}", self.session_id);
            }
        }
        if buffered > 0 {
            debug!(
                "session {}: replayed {buffered} buffered candidate(s)",
                self.session_id
            );
        }
    }

    /// Applies a remote candidate, or buffers it until the answer is applied.
    ///
    /// # Errors
    ///
    /// [`NegotiationError::NoPeer`] if negotiation never started;
    /// [`NegotiationError::Peer`] if the transport rejects the candidate.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<CandidateOutcome, NegotiationError> {
        let peer = self
            .peer
            .clone()
            .ok_or(NegotiationError::NoPeer("ice_candidate"))?;

        if !self.remote_applied {
            self.pending_candidates.push_back(candidate);
            return Ok(CandidateOutcome::Buffered);
        }

        peer.add_ice_candidate(candidate).await?;
        Ok(CandidateOutcome::Applied)
    }

    /// `Negotiating → Attached` once the transport is usable and capture is
    /// active.  Consumes a pending grant to start capture when none is running.
    pub fn try_attach(&mut self, ctx: &NegotiationContext) -> AttachResult {
        if self.state == NegotiationState::Attached {
            return AttachResult::Unchanged;
        }
        if !self.is_ready_for_media() {
            return AttachResult::NotReady;
        }
        let Some(peer) = self.peer.clone() else {
            return AttachResult::NotReady;
        };

        match ctx.capture.attach_or_resume(self.session_id, peer.video_sink()) {
            AttachOutcome::Attached | AttachOutcome::AlreadyAttached => {
                self.state = NegotiationState::Attached;
                info!("session {}: attached, streaming", self.session_id);
                AttachResult::Attached
            }
            AttachOutcome::Rejected => AttachResult::Rejected,
            AttachOutcome::NotCapturing => {
                debug!("session {}: ready, waiting for capture", self.session_id);
                AttachResult::WaitingForCapture
            }
        }
    }

    /// Reacts to a transport state change.  Returns `true` when the session
    /// was detached from capture as a result.
    pub fn on_transport_state(&mut self, ctx: &NegotiationContext, state: TransportState) -> bool {
        if state != TransportState::Failed || self.state.is_terminal() {
            return false;
        }
        warn!(
            "session {}: transport failed; waiting for a new start",
            self.session_id
        );
        self.needs_restart = true;
        if self.state == NegotiationState::Attached {
            self.state = NegotiationState::Negotiating;
            return ctx.capture.detach(self.session_id);
        }
        false
    }

    /// `* → Closed`: detach from capture and release the peer.  Idempotent.
    ///
    /// Returns `true` if this call performed the teardown.
    pub async fn teardown(&mut self, ctx: &NegotiationContext) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.release_peer(ctx).await;
        self.state = NegotiationState::Closed;
        true
    }

    async fn release_peer(&mut self, ctx: &NegotiationContext) {
        ctx.capture.detach(self.session_id);
        self.pending_candidates.clear();
        self.remote_applied = false;
        if let Some(peer) = self.peer.take() {
            if let Err(e) = peer.close().await {
                debug!("session {}: peer close: {e}", self.session_id);
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
