//! WebRTC transport: peer connections, the control data channel, and the
//! H.264 sample track fed from capture.
//!
//! [`WebRtcConnector`] builds one `webrtc` API (codecs and interceptors
//! registered once) and creates a [`WebRtcPeer`] per session.  Each peer:
//!
//! - adds a send-only H.264 video transceiver at creation,
//! - answers a controller's offer when the controller negotiates first,
//!   adopting the `control` data channel it opened,
//! - forwards gathered ICE candidates, data-channel bytes, and connection
//!   state changes to the session as [`PeerEvent`]s,
//! - exposes a [`FrameSink`] that queues frames for a writer task; when the
//!   queue is full the frame is dropped rather than stalling capture.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mirror_core::{IceCandidate, SessionId, VideoFrame};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::application::{
    FrameSink, PeerConnector, PeerError, PeerEvent, PeerHandle, TransportState,
    CONTROL_CHANNEL_LABEL,
};
use crate::domain::config::WebRtcConfig;

const H264_FMTP: &str =
    "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id=42e01f";
const STREAM_ID: &str = "screen";

// ── Connector ─────────────────────────────────────────────────────────────────

/// Creates peer connections sharing one configured `webrtc` API.
pub struct WebRtcConnector {
    api: API,
    ice_servers: Vec<RTCIceServer>,
    frame_duration: Duration,
    sample_queue: usize,
}

impl WebRtcConnector {
    /// # Errors
    ///
    /// [`PeerError::Create`] if codec or interceptor registration fails.
    pub fn new(config: &WebRtcConfig, frame_rate: u32) -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| PeerError::Create(format!("failed to register codecs: {e}")))?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(|e| PeerError::Create(format!("failed to register interceptors: {e}")))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self {
            api,
            ice_servers,
            frame_duration: Duration::from_secs(1) / frame_rate.max(1),
            sample_queue: config.sample_queue.max(1),
        })
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect(
        &self,
        session: SessionId,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, PeerError> {
        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(|e| PeerError::Create(e.to_string()))?,
        );

        let channel = Arc::new(Mutex::new(None));
        register_handlers(&pc, session, &events, &channel);

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_string(),
                clock_rate: 90_000,
                channels: 0,
                sdp_fmtp_line: H264_FMTP.to_string(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", session.simple()),
            STREAM_ID.to_string(),
        ));

        let transceiver = pc
            .add_transceiver_from_track(
                Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Sendonly,
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(|e| PeerError::Create(format!("failed to add video transceiver: {e}")))?;

        // RTCP must be read for the interceptors (NACK, reports) to run.
        let sender = transceiver.sender().await;
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let (frame_tx, frame_rx) = mpsc::channel(self.sample_queue);
        let writer = tokio::spawn(write_samples(session, track, frame_rx, self.frame_duration));

        info!("session {session}: peer connection created");
        Ok(Arc::new(WebRtcPeer {
            session,
            pc,
            events,
            channel,
            sink: Arc::new(WebRtcVideoSink::new(session, frame_tx)),
            writer: StdMutex::new(Some(writer)),
        }))
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

fn register_handlers(
    pc: &RTCPeerConnection,
    session: SessionId,
    events: &mpsc::Sender<PeerEvent>,
    channel: &ChannelSlot,
) {
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let tx = tx.clone();
        Box::pin(async move {
            if let Some(state) = transport_state(s) {
                let _ = tx.send(PeerEvent::StateChanged(state)).await;
            }
        })
    }));

    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(c) = candidate else {
                debug!("session {session}: ICE gathering complete");
                return;
            };
            match c.to_json() {
                Ok(init) => {
                    let _ = tx.send(PeerEvent::LocalCandidate(from_init(init))).await;
                }
                Err(e) => warn!("session {session}: unserializable local candidate: {e}"),
            }
        })
    }));

    // Channels opened by the controller when it sent the offer.
    let tx = events.clone();
    let slot = Arc::clone(channel);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        let slot = Arc::clone(&slot);
        Box::pin(async move {
            if dc.label() != CONTROL_CHANNEL_LABEL {
                debug!("session {session}: ignoring data channel {:?}", dc.label());
                return;
            }
            wire_control_channel(&dc, session, tx);
            *slot.lock().await = Some(dc);
        })
    }));
}

fn wire_control_channel(dc: &RTCDataChannel, session: SessionId, tx: mpsc::Sender<PeerEvent>) {
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(PeerEvent::ControlMessage(msg.data.to_vec())).await;
        })
    }));

    dc.on_open(Box::new(move || {
        Box::pin(async move {
            info!("session {session}: control channel open");
        })
    }));
}

fn transport_state(state: RTCPeerConnectionState) -> Option<TransportState> {
    match state {
        RTCPeerConnectionState::New => Some(TransportState::New),
        RTCPeerConnectionState::Connecting => Some(TransportState::Connecting),
        RTCPeerConnectionState::Connected => Some(TransportState::Connected),
        RTCPeerConnectionState::Disconnected => Some(TransportState::Disconnected),
        RTCPeerConnectionState::Failed => Some(TransportState::Failed),
        RTCPeerConnectionState::Closed => Some(TransportState::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
    }
}

fn to_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: None,
    }
}

// ── Video sink ────────────────────────────────────────────────────────────────

/// Queues frames for one peer's sample writer.
pub struct WebRtcVideoSink {
    session: SessionId,
    tx: mpsc::Sender<VideoFrame>,
    dropped: AtomicU64,
}

impl WebRtcVideoSink {
    fn new(session: SessionId, tx: mpsc::Sender<VideoFrame>) -> Self {
        Self {
            session,
            tx,
            dropped: AtomicU64::new(0),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl FrameSink for WebRtcVideoSink {
    fn deliver(&self, frame: &VideoFrame) {
        if self.tx.try_send(frame.clone()).is_err() {
            let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if n.is_power_of_two() {
                debug!("session {}: {n} frame(s) dropped (peer queue full)", self.session);
            }
        }
    }
}

async fn write_samples(
    session: SessionId,
    track: Arc<TrackLocalStaticSample>,
    mut rx: mpsc::Receiver<VideoFrame>,
    duration: Duration,
) {
    while let Some(frame) = rx.recv().await {
        let sample = Sample {
            data: Bytes::copy_from_slice(&frame.data),
            duration,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("session {session}: write_sample failed: {e}");
        }
    }
    debug!("session {session}: sample writer finished");
}

// ── Peer ──────────────────────────────────────────────────────────────────────

/// One session's peer connection.
pub struct WebRtcPeer {
    session: SessionId,
    pc: Arc<RTCPeerConnection>,
    events: mpsc::Sender<PeerEvent>,
    channel: ChannelSlot,
    sink: Arc<WebRtcVideoSink>,
    writer: StdMutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_control_channel(&self) -> Result<(), PeerError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(CONTROL_CHANNEL_LABEL, Some(init))
            .await
            .map_err(|e| PeerError::DataChannel(e.to_string()))?;

        wire_control_channel(&dc, self.session, self.events.clone());
        *self.channel.lock().await = Some(dc);
        Ok(())
    }

    async fn create_offer(&self) -> Result<String, PeerError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| PeerError::Offer(e.to_string()))?;
        Ok(offer.sdp)
    }

    async fn set_local_description(&self, sdp: &str) -> Result<(), PeerError> {
        let desc = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PeerError::Description(e.to_string()))?;
        self.pc
            .set_local_description(desc)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn set_remote_answer(&self, sdp: &str) -> Result<(), PeerError> {
        let desc = RTCSessionDescription::answer(sdp.to_string())
            .map_err(|e| PeerError::Description(e.to_string()))?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))
    }

    async fn answer_offer(&self, sdp: &str) -> Result<String, PeerError> {
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| PeerError::Description(e.to_string()))?;
        self.pc
            .set_remote_description(offer)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;

        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| PeerError::Answer(e.to_string()))?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(|e| PeerError::Description(e.to_string()))?;
        Ok(sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(to_init(candidate))
            .await
            .map_err(|e| PeerError::Candidate(e.to_string()))
    }

    fn video_sink(&self) -> Arc<dyn FrameSink> {
        self.sink.clone()
    }

    async fn close(&self) -> Result<(), PeerError> {
        if let Some(writer) = self
            .writer
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
        {
            writer.abort();
        }
        if let Some(dc) = self.channel.lock().await.take() {
            if let Err(e) = dc.close().await {
                debug!("session {}: data channel close: {e}", self.session);
            }
        }
        let dropped = self.sink.dropped();
        if dropped > 0 {
            info!("session {}: {dropped} frame(s) dropped over the session", self.session);
        }
        self.pc.close().await.map_err(|e| {
            debug!("session {}: peer close: {e}", self.session);
            PeerError::Closed
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;
    use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

    fn offline_config() -> WebRtcConfig {
        WebRtcConfig {
            stun_servers: vec![],
            sample_queue: 2,
        }
    }

    #[test]
    fn test_transport_state_mapping() {
        assert_eq!(
            transport_state(RTCPeerConnectionState::Connected),
            Some(TransportState::Connected)
        );
        assert_eq!(
            transport_state(RTCPeerConnectionState::Failed),
            Some(TransportState::Failed)
        );
        assert_eq!(transport_state(RTCPeerConnectionState::Unspecified), None);
    }

    #[test]
    fn test_candidate_conversion_keeps_fields() {
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 2122260223 192.168.1.30 50000 typ host".to_string(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
        };

        let back = from_init(to_init(candidate.clone()));

        assert_eq!(back, candidate);
    }

    #[test]
    fn test_full_sink_drops_instead_of_blocking() {
        // Arrange
        let (tx, _rx) = mpsc::channel(1);
        let sink = WebRtcVideoSink::new(Uuid::new_v4(), tx);
        let frame = VideoFrame::new(0, 0, true, vec![0u8; 16]);

        // Act
        sink.deliver(&frame);
        sink.deliver(&frame);
        sink.deliver(&frame);

        // Assert
        assert_eq!(sink.dropped(), 2);
    }

    #[tokio::test]
    async fn test_offer_is_send_only_video_with_control_channel() {
        // Arrange
        let connector = WebRtcConnector::new(&offline_config(), 30).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let peer = connector.connect(Uuid::new_v4(), tx).await.unwrap();

        // Act
        peer.create_control_channel().await.unwrap();
        let sdp = peer.create_offer().await.unwrap();

        // Assert
        assert!(sdp.contains("m=video"));
        assert!(sdp.contains("a=sendonly"));
        assert!(sdp.contains("m=application"));
        assert!(sdp.contains("H264"));
        peer.close().await.unwrap();
    }

    /// A peer shaped like the controller's: receive-only video plus the
    /// control channel, offering first.
    async fn controller_offer(api: &API) -> (Arc<RTCPeerConnection>, String) {
        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .unwrap(),
        );
        pc.add_transceiver_from_kind(
            RTPCodecType::Video,
            Some(RTCRtpTransceiverInit {
                direction: RTCRtpTransceiverDirection::Recvonly,
                send_encodings: vec![],
            }),
        )
        .await
        .unwrap();
        pc.create_data_channel(CONTROL_CHANNEL_LABEL, None)
            .await
            .unwrap();
        let offer = pc.create_offer(None).await.unwrap();
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer).await.unwrap();
        (pc, sdp)
    }

    #[tokio::test]
    async fn test_controller_offer_is_answered_with_send_only_video() {
        // Arrange
        let connector = WebRtcConnector::new(&offline_config(), 30).unwrap();
        let (controller, offer) = controller_offer(&connector.api).await;
        let (tx, _rx) = mpsc::channel(16);
        let peer = connector.connect(Uuid::new_v4(), tx).await.unwrap();

        // Act
        let answer = peer.answer_offer(&offer).await.unwrap();

        // Assert
        assert!(answer.contains("m=video"));
        assert!(answer.contains("a=sendonly"));
        assert!(answer.contains("m=application"));
        let desc = RTCSessionDescription::answer(answer).unwrap();
        controller.set_remote_description(desc).await.unwrap();
        peer.close().await.unwrap();
        controller.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_offer_is_rejected() {
        let connector = WebRtcConnector::new(&offline_config(), 30).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let peer = connector.connect(Uuid::new_v4(), tx).await.unwrap();

        let result = peer.answer_offer("not an sdp").await;

        assert!(matches!(result, Err(PeerError::Description(_))));
        peer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_garbage_answer_is_rejected() {
        let connector = WebRtcConnector::new(&offline_config(), 30).unwrap();
        let (tx, _rx) = mpsc::channel(16);
        let peer = connector.connect(Uuid::new_v4(), tx).await.unwrap();
        peer.create_control_channel().await.unwrap();
        let sdp = peer.create_offer().await.unwrap();
        peer.set_local_description(&sdp).await.unwrap();

        let result = peer.set_remote_answer("not an sdp").await;

        assert!(matches!(result, Err(PeerError::Description(_))));
        peer.close().await.unwrap();
    }
}
