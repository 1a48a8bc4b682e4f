//! Native connection stack on top of the `webrtc` crate.
//!
//! Callbacks registered on the `RTCPeerConnection` only translate what they
//! see into [`PeerEvent`]s; every decision is taken by the session loop.

use crate::config::RtcConfig;
use crate::error::{Result, RtcError};
use crate::logger::dump_selected_pair;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::connection::{
    MediaSender, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
};
use crate::peer::ice::{analyze_candidates, apply_pending_candidates, from_rtc_init, to_rtc_init, PendingCandidates};
use crate::peer::sdp;
use crate::peer::types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, RemoteTrack, SdpType,
    ServerConfig, SessionDescription, SignalingState,
};
use crate::quality::EncodingParams;
use crate::utils::add_ice_url_scheme;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::RTCOfferOptions;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Builds the peer connection configuration.
pub fn rtc_configuration(config: &RtcConfig) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers(&config.ice_servers),
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

pub fn ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

fn codec_for(kind: TrackKind) -> RTCRtpCodecCapability {
    match kind {
        TrackKind::Audio => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        TrackKind::Video => RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn track_kind(kind: RTPCodecType) -> Option<TrackKind> {
    match kind {
        RTPCodecType::Audio => Some(TrackKind::Audio),
        RTPCodecType::Video => Some(TrackKind::Video),
        _ => None,
    }
}

pub fn to_rtc_description(desc: &SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp.clone())?,
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp.clone())?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp.clone())?,
        SdpType::Rollback => {
            let mut rollback = RTCSessionDescription::default();
            rollback.sdp_type = RTCSdpType::Rollback;
            rollback
        }
    };
    Ok(rtc)
}

pub fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(RtcError::Negotiation("description without a type".into()))
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn signaling_state(state: RTCSignalingState) -> SignalingState {
    match state {
        RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
        RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
        RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
        RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
        RTCSignalingState::Closed => SignalingState::Closed,
        RTCSignalingState::Stable | RTCSignalingState::Unspecified => SignalingState::Stable,
    }
}

fn ice_state(state: RTCIceConnectionState) -> Option<IceConnectionState> {
    Some(match state {
        RTCIceConnectionState::New => IceConnectionState::New,
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        RTCIceConnectionState::Unspecified => return None,
    })
}

fn connection_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    Some(match state {
        RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        RTCPeerConnectionState::Unspecified => return None,
    })
}

/// Senders across every native connection, so one capture pipeline can feed
/// all of them.
#[derive(Clone, Default)]
struct SenderRegistry(Arc<Mutex<Vec<Weak<WebRtcSender>>>>);

impl SenderRegistry {
    fn register(&self, sender: &Arc<WebRtcSender>) {
        if let Ok(mut senders) = self.0.lock() {
            senders.retain(|s| s.strong_count() > 0);
            senders.push(Arc::downgrade(sender));
        }
    }

    fn bound_to(&self, track: &LocalTrack) -> Vec<Arc<WebRtcSender>> {
        self.0
            .lock()
            .map(|senders| {
                senders
                    .iter()
                    .filter_map(Weak::upgrade)
                    .filter(|s| s.is_bound_to(track))
                    .collect()
            })
            .unwrap_or_default()
    }
}

pub struct WebRtcSender {
    kind: TrackKind,
    rtc_track: Arc<TrackLocalStaticSample>,
    track: Mutex<LocalTrack>,
    encoding: Mutex<Option<EncodingParams>>,
    last_frame: Mutex<Option<Instant>>,
}

impl WebRtcSender {
    fn is_bound_to(&self, track: &LocalTrack) -> bool {
        self.track.lock().map(|t| t.same_track(track)).unwrap_or(false)
    }

    /// Framerate gate. Audio and unconstrained video always pass.
    fn admit(&self, now: Instant) -> bool {
        let fps = match (self.kind, self.encoding()) {
            (TrackKind::Video, Some(params)) if params.max_framerate > 0 => params.max_framerate,
            _ => return true,
        };
        let interval = Duration::from_secs(1) / fps;
        let Ok(mut last) = self.last_frame.lock() else {
            return true;
        };
        match *last {
            Some(prev) if now.duration_since(prev) < interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[async_trait]
impl MediaSender for WebRtcSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn track_id(&self) -> Option<String> {
        self.track.lock().ok().map(|t| t.id().to_string())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        if track.kind() != self.kind {
            return Err(RtcError::InvalidState(format!(
                "cannot replace {} track with {}",
                self.kind,
                track.kind()
            )));
        }
        // the RTP track stays; only the capture feeding it changes
        if let Ok(mut bound) = self.track.lock() {
            *bound = track.clone();
        }
        Ok(())
    }

    /// Limits are enforced here rather than by the RTP sender: the
    /// framerate gate drops samples, the bitrate is read by the encoder
    /// through `target_bitrate`.
    async fn set_encoding(&self, params: EncodingParams) -> Result<()> {
        if let Ok(mut encoding) = self.encoding.lock() {
            *encoding = Some(params);
        }
        if let Ok(mut last) = self.last_frame.lock() {
            *last = None;
        }
        Ok(())
    }

    fn encoding(&self) -> Option<EncodingParams> {
        self.encoding.lock().ok().and_then(|e| *e)
    }
}

/// Pushes encoded capture samples into every sender bound to a track.
#[derive(Clone)]
pub struct SampleWriter {
    registry: SenderRegistry,
}

impl SampleWriter {
    /// Returns how many senders accepted the sample. Disabled or stopped
    /// tracks write nothing.
    pub async fn write(&self, track: &LocalTrack, sample: &Sample) -> Result<usize> {
        if track.is_stopped() || !track.is_enabled() {
            return Ok(0);
        }
        let now = Instant::now();
        let mut written = 0;
        for sender in self.registry.bound_to(track) {
            if sender.admit(now) {
                sender.rtc_track.write_sample(sample).await?;
                written += 1;
            }
        }
        Ok(written)
    }

    /// Lowest bitrate ceiling among the senders of a track, for the encoder.
    pub fn target_bitrate(&self, track: &LocalTrack) -> Option<u32> {
        self.registry
            .bound_to(track)
            .iter()
            .filter_map(|s| s.encoding())
            .map(|p| p.max_bitrate)
            .min()
    }
}

pub struct WebRtcConnection {
    remote_id: PeerId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<WebRtcSender>>>,
    transceivers: AtomicUsize,
    pending: PendingCandidates,
    registry: SenderRegistry,
}

impl WebRtcConnection {
    pub fn peer_connection(&self) -> &Arc<RTCPeerConnection> {
        &self.pc
    }

    fn sender_track_ids(&self) -> Vec<String> {
        self.senders
            .lock()
            .map(|s| s.iter().map(|s| s.rtc_track.id().to_string()).collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PeerConnection for WebRtcConnection {
    fn signaling_state(&self) -> SignalingState {
        signaling_state(self.pc.signaling_state())
    }

    fn connection_state(&self) -> PeerConnectionState {
        connection_state(self.pc.connection_state()).unwrap_or(PeerConnectionState::New)
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let options = RTCOfferOptions {
            ice_restart,
            ..Default::default()
        };
        let offer = self.pc.create_offer(Some(options)).await?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc_description(&desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc_description(&desc)?).await?;
        apply_pending_candidates(&self.remote_id, &self.pc, &self.pending).await;
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        let desc = self.pc.remote_description().await?;
        from_rtc_description(desc).ok()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if self.pc.remote_description().await.is_none() {
            debug!(peer = %self.remote_id, "remote description not set yet, queuing candidate");
            self.pending.push(candidate);
            return Ok(());
        }
        self.pc.add_ice_candidate(to_rtc_init(candidate)).await?;
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<Arc<dyn MediaSender>> {
        let rtc_track = Arc::new(TrackLocalStaticSample::new(
            codec_for(track.kind()),
            track.id().to_string(),
            stream_id.to_string(),
        ));
        self.pc
            .add_track(rtc_track.clone() as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let sender = Arc::new(WebRtcSender {
            kind: track.kind(),
            rtc_track,
            track: Mutex::new(track.clone()),
            encoding: Mutex::new(None),
            last_frame: Mutex::new(None),
        });
        self.registry.register(&sender);
        if let Ok(mut senders) = self.senders.lock() {
            senders.push(sender.clone());
        }
        Ok(sender)
    }

    async fn add_transceiver(&self, kind: TrackKind) -> Result<()> {
        self.pc.add_transceiver_from_kind(codec_type(kind), None).await?;
        self.transceivers.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn needs_negotiation(&self) -> bool {
        let senders = self.sender_track_ids();
        match self.pc.local_description().await {
            None => !senders.is_empty() || self.transceivers.load(Ordering::Relaxed) > 0,
            Some(desc) => {
                let announced = sdp::track_ids(&desc.sdp);
                senders.iter().any(|id| !announced.contains(id))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        Ok(())
    }
}

/// Creates native connections sharing one media engine.
pub struct WebRtcConnectionFactory {
    api: API,
    config: RtcConfig,
    registry: SenderRegistry,
}

impl WebRtcConnectionFactory {
    pub fn new(config: RtcConfig) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self {
            api,
            config,
            registry: SenderRegistry::default(),
        })
    }

    pub fn sample_writer(&self) -> SampleWriter {
        SampleWriter {
            registry: self.registry.clone(),
        }
    }

    fn wire_events(pc: &Arc<RTCPeerConnection>, events: &PeerEventSink) {
        let remote_id = events.remote_id().to_string();

        let sink = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            sink.emit(PeerEvent::NegotiationNeeded);
            Box::pin(async {})
        }));

        let sink = events.clone();
        let gathered: Arc<Mutex<Vec<IceCandidate>>> = Arc::default();
        let peer = remote_id.clone();
        pc.on_ice_candidate(Box::new(move |cand: Option<RTCIceCandidate>| {
            match cand {
                Some(c) => match c.to_json() {
                    Ok(init) => {
                        let candidate = from_rtc_init(init);
                        if let Ok(mut all) = gathered.lock() {
                            all.push(candidate.clone());
                        }
                        sink.emit(PeerEvent::LocalCandidate(candidate));
                    }
                    Err(e) => warn!(peer = %peer, error = %e, "unserializable local candidate"),
                },
                None => {
                    let all = gathered
                        .lock()
                        .map(|mut g| std::mem::take(&mut *g))
                        .unwrap_or_default();
                    analyze_candidates(&peer, &all);
                }
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        let weak = Arc::downgrade(pc);
        let peer = remote_id.clone();
        pc.on_ice_connection_state_change(Box::new(move |st: RTCIceConnectionState| {
            debug!(peer = %peer, state = ?st, "ICE connection state changed");
            if matches!(st, RTCIceConnectionState::Disconnected | RTCIceConnectionState::Failed) {
                let weak = weak.clone();
                let peer = peer.clone();
                tokio::spawn(async move {
                    if let Some(pc) = weak.upgrade() {
                        dump_selected_pair(&pc, &peer, "BEFORE-RESTART").await;
                    }
                });
            }
            if let Some(state) = ice_state(st) {
                sink.emit(PeerEvent::IceConnectionState(state));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        let peer = remote_id.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            info!(peer = %peer, state = ?st, "peer connection state changed");
            if let Some(state) = connection_state(st) {
                sink.emit(PeerEvent::ConnectionState(state));
            }
            Box::pin(async {})
        }));

        let sink = events.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _, _| {
            if let Some(kind) = track_kind(track.kind()) {
                sink.emit(PeerEvent::Track(RemoteTrack {
                    id: track.id(),
                    kind,
                    stream_id: track.stream_id(),
                }));
            }
            let peer = remote_id.clone();
            Box::pin(async move {
                // rendering happens outside the core; keep the receive buffers moving
                let mut packets = 0u64;
                while track.read_rtp().await.is_ok() {
                    packets += 1;
                }
                trace!(peer = %peer, track = %track.id(), packets, "remote track ended");
            })
        }));
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcConnectionFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_configuration(&self.config))
                .await?,
        );
        Self::wire_events(&pc, &events);
        debug!(peer = events.remote_id(), "native peer connection created");

        Ok(Arc::new(WebRtcConnection {
            remote_id: events.remote_id().to_string(),
            pc,
            senders: Mutex::new(Vec::new()),
            transceivers: AtomicUsize::new(0),
            pending: PendingCandidates::default(),
            registry: self.registry.clone(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn offline_config() -> RtcConfig {
        RtcConfig {
            ice_servers: Vec::new(),
            ..RtcConfig::default()
        }
    }

    #[test]
    fn servers_get_a_scheme() {
        let servers = ice_servers(&[ServerConfig {
            id: "t".into(),
            r#type: "turn".into(),
            url: "turn.example.org:3478".into(),
            username: Some("u".into()),
            credential: Some("p".into()),
        }]);
        assert_eq!(servers[0].urls, vec!["turn:turn.example.org:3478".to_string()]);
        assert_eq!(servers[0].username, "u");
    }

    #[test]
    fn rollback_description_has_no_sdp() {
        let rtc = to_rtc_description(&SessionDescription::rollback()).unwrap();
        assert_eq!(rtc.sdp_type, RTCSdpType::Rollback);
        assert!(rtc.sdp.is_empty());
    }

    #[tokio::test]
    async fn offer_announces_attached_tracks() {
        let factory = WebRtcConnectionFactory::new(offline_config()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory
            .create(PeerEventSink::new("B".into(), 1, tx))
            .await
            .unwrap();

        let mic = LocalTrack::new(TrackKind::Audio, "mic");
        conn.add_track(&mic, "stream-a").await.unwrap();
        assert!(conn.needs_negotiation().await);

        let offer = conn.create_offer(false).await.unwrap();
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(sdp::track_ids(&offer.sdp).contains(&mic.id().to_string()));

        conn.set_local_description(offer).await.unwrap();
        assert_eq!(conn.signaling_state(), SignalingState::HaveLocalOffer);
        assert!(!conn.needs_negotiation().await);
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn early_candidates_are_queued() {
        let factory = WebRtcConnectionFactory::new(offline_config()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory
            .create(PeerEventSink::new("B".into(), 1, tx))
            .await
            .unwrap();
        conn.add_ice_candidate(IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        })
        .await
        .unwrap();
        conn.close().await.unwrap();
    }

    #[tokio::test]
    async fn disabled_tracks_write_nothing() {
        let factory = WebRtcConnectionFactory::new(offline_config()).unwrap();
        let writer = factory.sample_writer();
        let cam = LocalTrack::new(TrackKind::Video, "cam");
        cam.set_enabled(false);
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(33),
            ..Default::default()
        };
        assert_eq!(writer.write(&cam, &sample).await.unwrap(), 0);
        assert_eq!(writer.target_bitrate(&cam), None);
    }
    #[tokio::test]
    async fn encoding_limits_gate_samples_and_bitrate() {
        let factory = WebRtcConnectionFactory::new(offline_config()).unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = factory
            .create(PeerEventSink::new("B".into(), 1, tx))
            .await
            .unwrap();
        let cam = LocalTrack::new(TrackKind::Video, "cam");
        let sender = conn.add_track(&cam, "stream-a").await.unwrap();
        sender
            .set_encoding(EncodingParams {
                max_bitrate: 500_000,
                max_framerate: 15,
            })
            .await
            .unwrap();

        let writer = factory.sample_writer();
        assert_eq!(writer.target_bitrate(&cam), Some(500_000));
        let sample = Sample {
            data: bytes::Bytes::from_static(&[0u8; 4]),
            duration: Duration::from_millis(33),
            ..Default::default()
        };
        assert_eq!(writer.write(&cam, &sample).await.unwrap(), 1);
        // second frame inside the 15 fps interval is dropped
        assert_eq!(writer.write(&cam, &sample).await.unwrap(), 0);
        conn.close().await.unwrap();
    }
}
