//! Use case: track live sessions and route everything that happens to them.
//!
//! [`SessionRegistry`] is the entry point for the transport layer:
//!
//! | call                | trigger                                      |
//! |---------------------|----------------------------------------------|
//! | `accept`            | a controller connected                       |
//! | `dispatch`          | one signaling text frame arrived             |
//! | `on_peer_event`     | the peer connection reported something       |
//! | `close`             | the connection ended                         |
//! | `submit_grant`      | the platform granted screen capture          |
//! | `shutdown`          | the device is stopping                       |
//!
//! # Locking
//!
//! Each session sits behind its own async mutex, held for the whole of one
//! `dispatch` / `on_peer_event` call.  That serializes one connection's work
//! without serializing different connections.  The session map lock is held
//! only to look up, insert, or remove an entry.  A task never holds two
//! session locks at once: cross-session decisions (auto-start, rebalancing
//! after a close) read a separate status table and then lock sessions one at
//! a time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use mirror_core::{
    parse_inbound, CaptureGrant, IceCandidate, InboundMessage, NegotiationState, OutboundMessage,
    SessionId,
};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::capture_manager::{CaptureError, CaptureManager};
use crate::application::control::ControlTranslator;
use crate::application::negotiation::{
    Negotiation, NegotiationContext, NegotiationError, PeerConnector, PeerEvent, TransportState,
};
use crate::application::signal::SignalSink;

/// Capacity of each session's peer-event channel.
const PEER_EVENT_CAPACITY: usize = 64;

/// Errors returned to the transport layer.
#[derive(Debug, Error, PartialEq)]
pub enum RegistryError {
    #[error("device is shutting down")]
    ShuttingDown,
}

/// What a newly accepted connection needs to run its loop.
pub struct SessionHandle {
    pub id: SessionId,
    /// Events from this session's peer connection; feed them back through
    /// [`SessionRegistry::on_peer_event`].
    pub events: mpsc::Receiver<PeerEvent>,
}

/// Identity reported in `device_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub id: String,
}

struct Session {
    peer_addr: SocketAddr,
    signal: Arc<dyn SignalSink>,
    events: mpsc::Sender<PeerEvent>,
    negotiation: Negotiation,
    closing: bool,
}

/// Lock-free-to-read summary used for cross-session decisions.
#[derive(Debug, Clone, Copy)]
struct SessionStatus {
    /// Accept order; lower is older.
    order: u64,
    state: NegotiationState,
    ready_for_media: bool,
}

/// Live-session table plus the collaborators every session shares.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    status: StdMutex<HashMap<SessionId, SessionStatus>>,
    ctx: NegotiationContext,
    translator: Arc<ControlTranslator>,
    device: DeviceInfo,
    accepted: AtomicU64,
    shutting_down: AtomicBool,
}

impl SessionRegistry {
    pub fn new(
        connector: Arc<dyn PeerConnector>,
        capture: CaptureManager,
        translator: Arc<ControlTranslator>,
        device: DeviceInfo,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            status: StdMutex::new(HashMap::new()),
            ctx: NegotiationContext { connector, capture },
            translator,
            device,
            accepted: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn capture(&self) -> &CaptureManager {
        &self.ctx.capture
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn session_state(&self, id: SessionId) -> Option<NegotiationState> {
        self.status_table().get(&id).map(|s| s.state)
    }

    // ── Connection lifecycle ──────────────────────────────────────────────────

    /// Registers a new connection and greets it with `device_info`.
    ///
    /// If a capture grant is pending and no other session is negotiating or
    /// streaming, negotiation starts immediately.
    ///
    /// # Errors
    ///
    /// [`RegistryError::ShuttingDown`] once [`shutdown`](Self::shutdown) has begun.
    pub async fn accept(
        &self,
        peer_addr: SocketAddr,
        signal: Arc<dyn SignalSink>,
    ) -> Result<SessionHandle, RegistryError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RegistryError::ShuttingDown);
        }

        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::channel(PEER_EVENT_CAPACITY);
        let negotiation = Negotiation::new(id);
        let order = self.accepted.fetch_add(1, Ordering::SeqCst);

        if let Err(e) = signal.send(&self.device_info()) {
            warn!("session {id}: failed to send device_info: {e}");
        }

        let session = Arc::new(Mutex::new(Session {
            peer_addr,
            signal,
            events: events_tx,
            negotiation,
            closing: false,
        }));
        self.sessions.write().await.insert(id, Arc::clone(&session));
        self.status_table().insert(
            id,
            SessionStatus {
                order,
                state: NegotiationState::New,
                ready_for_media: false,
            },
        );
        info!("session {id}: accepted from {peer_addr}");

        if self.ctx.capture.has_pending() && !self.any_active_except(id) {
            info!("session {id}: capture grant pending; starting negotiation");
            let mut guard = session.lock().await;
            self.start_negotiation(id, &mut guard).await;
        }

        Ok(SessionHandle {
            id,
            events: events_rx,
        })
    }

    /// Routes one signaling text frame from session `id`.
    pub async fn dispatch(&self, id: SessionId, text: &str) {
        let message = match parse_inbound(text) {
            Ok(m) => m,
            Err(e) => {
                warn!("session {id}: dropping message: {e}");
                return;
            }
        };

        let Some(session) = self.lookup(id).await else {
            debug!(
                "dropping {} for unknown session {id}",
                message.type_name()
            );
            return;
        };

        debug!("session {id}: ← {}", message.type_name());
        let mut guard = session.lock().await;
        if guard.closing {
            debug!("session {id}: closing; {} dropped", message.type_name());
            return;
        }

        let was_attached = guard.negotiation.state() == NegotiationState::Attached;
        let violation = match message {
            InboundMessage::Ping => {
                self.send(id, &guard, &self.device_info());
                false
            }
            InboundMessage::StartNegotiation => {
                self.start_negotiation(id, &mut guard).await;
                false
            }
            InboundMessage::Offer { sdp } => {
                self.accept_offer(id, &mut guard, &sdp).await;
                false
            }
            InboundMessage::Answer { sdp } => self.apply_answer(id, &mut guard, &sdp).await,
            InboundMessage::IceCandidate(candidate) => {
                self.add_candidate(id, &mut guard, candidate).await;
                false
            }
            InboundMessage::ControlEvent { event } => {
                self.translator.handle_event(id, &event);
                false
            }
        };

        // A restart or a replacing offer may have detached an attached session.
        let detached = was_attached && guard.negotiation.state() != NegotiationState::Attached;
        self.publish(id, &guard);
        drop(guard);

        if violation {
            warn!("session {id}: protocol contract violated; closing session");
            self.close(id).await;
        } else if detached {
            self.rebalance().await;
        }
    }

    /// Handles an event reported by session `id`'s peer connection.
    pub async fn on_peer_event(&self, id: SessionId, event: PeerEvent) {
        let Some(session) = self.lookup(id).await else {
            debug!("peer event for unknown session {id} dropped");
            return;
        };
        let mut guard = session.lock().await;
        if guard.closing {
            return;
        }

        let mut detached = false;
        match event {
            PeerEvent::LocalCandidate(candidate) => {
                self.send(id, &guard, &OutboundMessage::IceCandidate(candidate));
            }
            PeerEvent::ControlMessage(bytes) => {
                self.translator.handle_payload(id, &bytes);
            }
            PeerEvent::StateChanged(state) => {
                info!("session {id}: transport {state}");
                detached = guard.negotiation.on_transport_state(&self.ctx, state);
                if state == TransportState::Connected {
                    guard.negotiation.try_attach(&self.ctx);
                }
            }
        }

        self.publish(id, &guard);
        drop(guard);

        if detached {
            self.rebalance().await;
        }
    }

    /// Removes session `id` and releases everything it held.
    ///
    /// Idempotent: returns `false` for an unknown or already-closed session.
    pub async fn close(&self, id: SessionId) -> bool {
        let Some(session) = self.sessions.write().await.remove(&id) else {
            return false;
        };

        let mut guard = session.lock().await;
        guard.closing = true;
        guard.negotiation.teardown(&self.ctx).await;
        let peer_addr = guard.peer_addr;
        drop(guard);

        self.status_table().remove(&id);
        info!("session {id}: closed ({peer_addr})");

        self.rebalance().await;
        true
    }

    /// Accepts a platform screen-capture grant.
    ///
    /// If capture is already running, or a session is ready for media, capture
    /// starts now with this grant and waiting sessions attach.  Otherwise the
    /// grant is parked until a session becomes ready, and the oldest idle
    /// session starts negotiating if nobody else is.
    ///
    /// # Errors
    ///
    /// The capturer's error when capture had to start now and could not.
    pub async fn submit_grant(&self, grant: CaptureGrant) -> Result<(), CaptureError> {
        let ready = self.ready_sessions();
        if self.ctx.capture.is_capturing() || !ready.is_empty() {
            self.ctx.capture.start_capture(grant)?;
            self.attach_waiting(ready).await;
            return Ok(());
        }

        info!("capture grant received; no session ready, keeping it pending");
        self.ctx.capture.store_pending(grant);

        if self.any_active_except(Uuid::nil()) {
            return Ok(());
        }
        if let Some(id) = self.oldest_idle_session() {
            if let Some(session) = self.lookup(id).await {
                let mut guard = session.lock().await;
                if !guard.closing {
                    self.start_negotiation(id, &mut guard).await;
                    self.publish(id, &guard);
                }
            }
        }
        Ok(())
    }

    /// Refuses new connections, closes every session, and stops capture.
    ///
    /// Bounded by `grace`; sessions still closing after that are abandoned.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<SessionId> = self.sessions.read().await.keys().copied().collect();
        info!("shutting down {} session(s)", ids.len());

        let close_all = async {
            for id in ids {
                self.close(id).await;
            }
        };
        if tokio::time::timeout(grace, close_all).await.is_err() {
            warn!("session teardown exceeded {grace:?}; continuing shutdown");
        }
        self.ctx.capture.stop_capture();
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn device_info(&self) -> OutboundMessage {
        OutboundMessage::DeviceInfo {
            device_name: self.device.name.clone(),
            device_id: self.device.id.clone(),
        }
    }

    fn status_table(&self) -> MutexGuard<'_, HashMap<SessionId, SessionStatus>> {
        self.status
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    async fn lookup(&self, id: SessionId) -> Option<Arc<Mutex<Session>>> {
        self.sessions.read().await.get(&id).cloned()
    }

    fn send(&self, id: SessionId, session: &Session, message: &OutboundMessage) {
        if let Err(e) = session.signal.send(message) {
            warn!("session {id}: failed to send {}: {e}", message.type_name());
        }
    }

    fn publish(&self, id: SessionId, session: &Session) {
        if let Some(status) = self.status_table().get_mut(&id) {
            status.state = session.negotiation.state();
            status.ready_for_media = session.negotiation.is_ready_for_media();
        }
    }

    async fn start_negotiation(&self, id: SessionId, session: &mut Session) {
        let events = session.events.clone();
        let signal = Arc::clone(&session.signal);
        match session
            .negotiation
            .start(&self.ctx, signal.as_ref(), events)
            .await
        {
            Ok(outcome) => debug!("session {id}: start → {outcome:?}"),
            Err(e) => warn!("session {id}: negotiation failed: {e}"),
        }
        self.publish(id, session);
    }

    /// Returns `true` when the session must be closed.
    async fn apply_answer(&self, id: SessionId, session: &mut Session, sdp: &str) -> bool {
        match session.negotiation.apply_answer(&self.ctx, sdp).await {
            Ok(result) => {
                debug!("session {id}: answer applied → {result:?}");
                false
            }
            Err(NegotiationError::NoPeer(what)) => {
                warn!("session {id}: {what} before start_negotiation");
                true
            }
            Err(e) => {
                warn!("session {id}: answer failed: {e}");
                false
            }
        }
    }

    async fn accept_offer(&self, id: SessionId, session: &mut Session, sdp: &str) {
        let events = session.events.clone();
        let signal = Arc::clone(&session.signal);
        match session
            .negotiation
            .accept_offer(&self.ctx, signal.as_ref(), events, sdp)
            .await
        {
            Ok(result) => debug!("session {id}: controller offer answered → {result:?}"),
            Err(e) => warn!("session {id}: controller offer failed: {e}"),
        }
    }

    /// A candidate with no peer to receive it is dropped; the session stays.
    async fn add_candidate(&self, id: SessionId, session: &mut Session, candidate: IceCandidate) {
        match session.negotiation.add_remote_candidate(candidate).await {
            Ok(outcome) => debug!("session {id}: remote candidate {outcome:?}"),
            Err(NegotiationError::NoPeer(what)) => {
                warn!("session {id}: {what} before start_negotiation; dropped");
            }
            Err(e) => warn!("session {id}: candidate failed: {e}"),
        }
    }

    fn any_active_except(&self, except: SessionId) -> bool {
        self.status_table()
            .iter()
            .any(|(id, s)| *id != except && s.state.is_active())
    }

    fn ready_sessions(&self) -> Vec<SessionId> {
        let table = self.status_table();
        let mut ready: Vec<(u64, SessionId)> = table
            .iter()
            .filter(|(_, s)| s.ready_for_media)
            .map(|(id, s)| (s.order, *id))
            .collect();
        ready.sort_unstable();
        ready.into_iter().map(|(_, id)| id).collect()
    }

    fn oldest_idle_session(&self) -> Option<SessionId> {
        self.status_table()
            .iter()
            .filter(|(_, s)| s.state == NegotiationState::New)
            .min_by_key(|(_, s)| s.order)
            .map(|(id, _)| *id)
    }

    /// Attaches each listed session that is still ready, oldest first.
    async fn attach_waiting(&self, ids: Vec<SessionId>) {
        for id in ids {
            let Some(session) = self.lookup(id).await else {
                continue;
            };
            let mut guard = session.lock().await;
            if guard.closing {
                continue;
            }
            let result = guard.negotiation.try_attach(&self.ctx);
            debug!("session {id}: attach → {result:?}");
            self.publish(id, &guard);
        }
    }

    /// After a session leaves the stream: hand it to a waiting session, or
    /// stop capture if nobody is left to receive frames.
    async fn rebalance(&self) {
        if self.ctx.capture.attached_count() > 0 {
            return;
        }
        let ready = self.ready_sessions();
        if !ready.is_empty() && self.ctx.capture.is_capturing() {
            self.attach_waiting(ready).await;
        }
        if self.ctx.capture.attached_count() == 0 {
            self.ctx.capture.release_if_idle();
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::capture_manager::{CaptureSettings, FrameSink};
    use crate::application::control::{InjectionError, InputInjector};
    use crate::application::negotiation::tests::{
        FakeConnector, NullCapturer, RecordingSignal,
    };
    use mirror_core::{AttachPolicy, GestureTimings, InputAction, ScreenMetrics};
    use std::sync::Mutex as SyncMutex;

    #[derive(Default)]
    struct RecordingInjector {
        actions: SyncMutex<Vec<InputAction>>,
    }

    impl InputInjector for RecordingInjector {
        fn inject(&self, action: &InputAction) -> Result<(), InjectionError> {
            self.actions.lock().unwrap().push(*action);
            Ok(())
        }
    }

    struct Fixture {
        registry: SessionRegistry,
        connector: Arc<FakeConnector>,
        injector: Arc<RecordingInjector>,
    }

    fn fixture(policy: AttachPolicy) -> Fixture {
        let connector = Arc::new(FakeConnector::default());
        let injector = Arc::new(RecordingInjector::default());
        let capture = CaptureManager::new(
            Arc::new(NullCapturer),
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
        let registry = SessionRegistry::new(
            connector.clone(),
            capture,
            translator,
            DeviceInfo {
                name: "Pixel".to_string(),
                id: "dev-1".to_string(),
            },
        );
        Fixture {
            registry,
            connector,
            injector,
        }
    }

    fn addr() -> SocketAddr {
        "192.168.1.30:50000".parse().unwrap()
    }

    async fn connect(registry: &SessionRegistry) -> (SessionHandle, Arc<RecordingSignal>) {
        let signal = Arc::new(RecordingSignal::default());
        let handle = registry.accept(addr(), signal.clone()).await.unwrap();
        (handle, signal)
    }

    #[tokio::test]
    async fn test_accept_sends_device_info() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);

        // Act
        let (handle, signal) = connect(&fx.registry).await;

        // Assert
        assert_eq!(
            signal.sent.lock().unwrap()[0],
            OutboundMessage::DeviceInfo {
                device_name: "Pixel".to_string(),
                device_id: "dev-1".to_string(),
            }
        );
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::New)
        );
    }

    #[tokio::test]
    async fn test_ping_resends_device_info() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;

        fx.registry.dispatch(handle.id, r#"{"type":"ping"}"#).await;

        assert_eq!(signal.sent.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_and_malformed_messages_are_dropped() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;

        fx.registry.dispatch(handle.id, r#"{"type":"reboot"}"#).await;
        fx.registry.dispatch(handle.id, "not json").await;

        assert_eq!(signal.sent.lock().unwrap().len(), 1);
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::New)
        );
    }

    #[tokio::test]
    async fn test_controller_offer_is_answered() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;

        // Act
        fx.registry
            .dispatch(handle.id, r#"{"type":"offer","sdp":"v=0"}"#)
            .await;

        // Assert
        assert_eq!(signal.answers(), 1);
        assert_eq!(signal.offers(), 0);
        assert_eq!(fx.connector.peers.lock().unwrap().len(), 1);
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Negotiating)
        );
    }

    #[tokio::test]
    async fn test_controller_offer_attaches_to_running_capture() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (handle, _signal) = connect(&fx.registry).await;

        // Act
        fx.registry
            .dispatch(handle.id, r#"{"type":"offer","sdp":"v=0"}"#)
            .await;
        fx.registry
            .dispatch(
                handle.id,
                r#"{"type":"ice_candidate","candidate":"c1","sdpMid":"0","sdpMLineIndex":0}"#,
            )
            .await;

        // Assert
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Attached)
        );
        assert!(fx.registry.capture().is_attached(handle.id));
        let peer = fx.connector.peers.lock().unwrap()[0].clone();
        assert_eq!(*peer.candidates.lock().unwrap(), vec!["c1"]);
    }

    #[tokio::test]
    async fn test_start_negotiation_sends_exactly_one_offer() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;

        fx.registry
            .dispatch(handle.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(handle.id, r#"{"type":"start_webrtc"}"#)
            .await;

        assert_eq!(signal.offers(), 1);
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Negotiating)
        );
    }

    #[tokio::test]
    async fn test_answer_before_start_closes_session() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, _signal) = connect(&fx.registry).await;

        fx.registry
            .dispatch(handle.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        assert_eq!(fx.registry.session_state(handle.id), None);
        assert_eq!(fx.registry.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_candidate_before_start_is_dropped_and_session_survives() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;

        // Act
        fx.registry
            .dispatch(
                handle.id,
                r#"{"type":"ice_candidate","candidate":"early","sdpMid":"0","sdpMLineIndex":0}"#,
            )
            .await;
        fx.registry
            .dispatch(handle.id, r#"{"type":"start_negotiation"}"#)
            .await;

        // Assert
        assert_eq!(fx.registry.session_count().await, 1);
        assert_eq!(signal.offers(), 1);
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Negotiating)
        );
        let peer = fx.connector.peers.lock().unwrap()[0].clone();
        assert!(peer.candidates.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restart_from_attached_stops_idle_capture_until_reattached() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (a, signal) = connect(&fx.registry).await;
        fx.registry
            .dispatch(a.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        // Act
        fx.registry
            .dispatch(a.id, r#"{"type":"start_negotiation"}"#)
            .await;

        // Assert
        assert_eq!(signal.offers(), 2);
        assert!(!fx.registry.capture().is_attached(a.id));
        assert!(!fx.registry.capture().is_capturing());
        assert!(fx.registry.capture().has_pending());

        // Act
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        // Assert
        assert_eq!(fx.registry.session_state(a.id), Some(NegotiationState::Attached));
        assert!(fx.registry.capture().is_capturing());
        assert!(!fx.registry.capture().has_pending());
    }

    #[tokio::test]
    async fn test_control_event_message_reaches_injector() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, _signal) = connect(&fx.registry).await;

        fx.registry
            .dispatch(
                handle.id,
                r#"{"type":"control_event","event":{"type":"click","x":10,"y":20}}"#,
            )
            .await;

        assert_eq!(fx.injector.actions.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_data_channel_message_reaches_injector() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, _signal) = connect(&fx.registry).await;

        fx.registry
            .on_peer_event(
                handle.id,
                PeerEvent::ControlMessage(br#"{"type":"click","x":-2,"y":-2}"#.to_vec()),
            )
            .await;

        assert_eq!(
            *fx.injector.actions.lock().unwrap(),
            vec![InputAction::Key(mirror_core::SpecialKey::Home)]
        );
    }

    #[tokio::test]
    async fn test_local_candidate_is_forwarded() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;
        let candidate = IceCandidate {
            candidate: "candidate:9".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        fx.registry
            .on_peer_event(handle.id, PeerEvent::LocalCandidate(candidate.clone()))
            .await;

        assert_eq!(
            signal.sent.lock().unwrap().last(),
            Some(&OutboundMessage::IceCandidate(candidate))
        );
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, _signal) = connect(&fx.registry).await;

        assert!(fx.registry.close(handle.id).await);
        assert!(!fx.registry.close(handle.id).await);
        assert!(!fx.registry.close(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_message_after_close_is_dropped() {
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, signal) = connect(&fx.registry).await;
        fx.registry.close(handle.id).await;

        fx.registry
            .dispatch(handle.id, r#"{"type":"start_negotiation"}"#)
            .await;

        assert_eq!(signal.offers(), 0);
    }

    #[tokio::test]
    async fn test_pending_grant_auto_starts_next_connection() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .submit_grant(CaptureGrant::new(-1, "g"))
            .await
            .unwrap();
        assert!(fx.registry.capture().has_pending());

        // Act
        let (first, first_signal) = connect(&fx.registry).await;
        let (second, second_signal) = connect(&fx.registry).await;

        // Assert
        assert_eq!(first_signal.offers(), 1);
        assert_eq!(second_signal.offers(), 0);
        assert_eq!(
            fx.registry.session_state(first.id),
            Some(NegotiationState::Negotiating)
        );
        assert_eq!(
            fx.registry.session_state(second.id),
            Some(NegotiationState::New)
        );
    }

    #[tokio::test]
    async fn test_grant_after_connect_starts_oldest_idle_session() {
        let fx = fixture(AttachPolicy::FanOut);
        let (first, first_signal) = connect(&fx.registry).await;
        let (_second, second_signal) = connect(&fx.registry).await;

        fx.registry
            .submit_grant(CaptureGrant::new(-1, "g"))
            .await
            .unwrap();

        assert_eq!(first_signal.offers(), 1);
        assert_eq!(second_signal.offers(), 0);
        assert_eq!(
            fx.registry.session_state(first.id),
            Some(NegotiationState::Negotiating)
        );
    }

    #[tokio::test]
    async fn test_grant_attaches_ready_session() {
        // Arrange
        let fx = fixture(AttachPolicy::FanOut);
        let (handle, _signal) = connect(&fx.registry).await;
        fx.registry
            .dispatch(handle.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(handle.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Negotiating)
        );

        // Act
        fx.registry
            .submit_grant(CaptureGrant::new(-1, "g"))
            .await
            .unwrap();

        // Assert
        assert_eq!(
            fx.registry.session_state(handle.id),
            Some(NegotiationState::Attached)
        );
        assert!(fx.registry.capture().is_capturing());
    }

    #[tokio::test]
    async fn test_exclusive_hands_stream_to_waiting_session_on_close() {
        // Arrange
        let fx = fixture(AttachPolicy::Exclusive);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (a, _) = connect(&fx.registry).await;
        let (b, _) = connect(&fx.registry).await;
        for id in [a.id, b.id] {
            fx.registry
                .dispatch(id, r#"{"type":"start_negotiation"}"#)
                .await;
            fx.registry
                .dispatch(id, r#"{"type":"answer","sdp":"v=0"}"#)
                .await;
        }
        assert_eq!(fx.registry.session_state(a.id), Some(NegotiationState::Attached));
        assert_eq!(
            fx.registry.session_state(b.id),
            Some(NegotiationState::Negotiating)
        );

        // Act
        fx.registry.close(a.id).await;

        // Assert
        assert_eq!(fx.registry.session_state(b.id), Some(NegotiationState::Attached));
        assert!(fx.registry.capture().is_attached(b.id));
        assert!(fx.registry.capture().is_capturing());
    }

    #[tokio::test]
    async fn test_last_close_stops_capture_and_rearms_grant() {
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (a, _) = connect(&fx.registry).await;
        fx.registry
            .dispatch(a.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        fx.registry.close(a.id).await;

        assert!(!fx.registry.capture().is_capturing());
        assert!(fx.registry.capture().has_pending());
    }

    #[tokio::test]
    async fn test_transport_failure_detaches_and_stops_idle_capture() {
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (a, _) = connect(&fx.registry).await;
        fx.registry
            .dispatch(a.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        fx.registry
            .on_peer_event(a.id, PeerEvent::StateChanged(TransportState::Failed))
            .await;

        assert_eq!(
            fx.registry.session_state(a.id),
            Some(NegotiationState::Negotiating)
        );
        assert!(!fx.registry.capture().is_capturing());
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything_and_refuses_new_sessions() {
        let fx = fixture(AttachPolicy::FanOut);
        let (_a, _) = connect(&fx.registry).await;
        let (_b, _) = connect(&fx.registry).await;

        fx.registry.shutdown(Duration::from_secs(1)).await;

        assert_eq!(fx.registry.session_count().await, 0);
        let refused = fx
            .registry
            .accept(addr(), Arc::new(RecordingSignal::default()))
            .await;
        assert!(matches!(refused, Err(RegistryError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_attached_session_receives_frames() {
        // Frames pushed by the capturer must reach the peer's video sink.
        let fx = fixture(AttachPolicy::FanOut);
        fx.registry
            .capture()
            .start_capture(CaptureGrant::new(-1, "g"))
            .unwrap();
        let (a, _) = connect(&fx.registry).await;
        fx.registry
            .dispatch(a.id, r#"{"type":"start_negotiation"}"#)
            .await;
        fx.registry
            .dispatch(a.id, r#"{"type":"answer","sdp":"v=0"}"#)
            .await;

        let peer = fx.connector.peers.lock().unwrap()[0].clone();
        let sink: Arc<dyn FrameSink> = peer.frames.clone();
        sink.deliver(&mirror_core::VideoFrame::new(0, 0, true, vec![1u8]));

        assert_eq!(*peer.frames.0.lock().unwrap(), 1);
        assert!(fx.registry.capture().is_attached(a.id));
    }
}
