//! In-memory doubles for the relay, the connection stack and capture
//! devices. Used by unit and integration tests and by hosts that want to
//! exercise a session without a network.
//!
//! The connection double follows the JSEP signaling lifecycle closely
//! enough for negotiation to be deterministic: rollback restores the
//! previous local description, ICE restarts rotate the username fragment,
//! and connectivity succeeds once both descriptions are applied and a
//! remote candidate with the current credentials is known.

use crate::error::{Result, RtcError};
use crate::media::{DeviceInfo, DeviceKind, LocalTrack, MediaConstraints, MediaDevices, TrackKind};
use crate::peer::connection::{
    MediaSender, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventSink,
};
use crate::peer::sdp;
use crate::peer::types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, RemoteTrack, SdpType,
    SessionDescription, SignalingState,
};
use crate::quality::EncodingParams;
use crate::signaling::{InboundSignal, OutboundSignal, SignalingLink};
use crate::utils::random_id;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::trace;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn new_ufrag() -> String {
    random_id()[..8].to_string()
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

struct RelayClient {
    room: Option<String>,
    inbound: mpsc::UnboundedSender<InboundSignal>,
}

#[derive(Default)]
struct RelayInner {
    clients: HashMap<PeerId, RelayClient>,
    offline: bool,
    sent: Vec<(PeerId, OutboundSignal)>,
}

/// Room-scoped relay. `join` announces the newcomer to everyone already in
/// the room; addressed messages are delivered only inside the same room.
#[derive(Clone, Default)]
pub struct MockRelay {
    inner: Arc<Mutex<RelayInner>>,
}

impl MockRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a client and returns its link plus its inbound stream.
    pub fn connect(&self, id: &str) -> (MockSignalingLink, mpsc::UnboundedReceiver<InboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.inner).clients.insert(
            id.to_string(),
            RelayClient {
                room: None,
                inbound: tx,
            },
        );
        (
            MockSignalingLink {
                id: Some(id.to_string()),
                relay: self.clone(),
            },
            rx,
        )
    }

    /// A link that never learned its identity.
    pub fn anonymous_link(&self) -> MockSignalingLink {
        MockSignalingLink {
            id: None,
            relay: self.clone(),
        }
    }

    /// While offline every emit fails with `SignalingUnavailable`.
    pub fn set_online(&self, online: bool) {
        lock(&self.inner).offline = !online;
    }

    /// Every message accepted by the relay, with its sender.
    pub fn sent(&self) -> Vec<(PeerId, OutboundSignal)> {
        lock(&self.inner).sent.clone()
    }

    pub fn sent_by(&self, id: &str) -> Vec<OutboundSignal> {
        lock(&self.inner)
            .sent
            .iter()
            .filter(|(from, _)| from == id)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    /// Delivers a message straight to one client, bypassing routing.
    pub fn inject(&self, to: &str, msg: InboundSignal) -> bool {
        lock(&self.inner)
            .clients
            .get(to)
            .map(|c| c.inbound.send(msg).is_ok())
            .unwrap_or(false)
    }

    fn route(&self, from: &str, msg: OutboundSignal) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if inner.offline {
            return Err(RtcError::SignalingUnavailable);
        }
        inner.sent.push((from.to_string(), msg.clone()));
        let sender = from.to_string();

        match msg {
            OutboundSignal::Join { room } => {
                if let Some(client) = inner.clients.get_mut(from) {
                    client.room = Some(room.clone());
                }
                for id in inner.members(&room, from) {
                    inner.deliver(&id, &room, InboundSignal::Joined { from: sender.clone() });
                }
            }
            OutboundSignal::Leave { room } => {
                for id in inner.members(&room, from) {
                    inner.deliver(&id, &room, InboundSignal::Left { from: sender.clone() });
                }
                if let Some(client) = inner.clients.get_mut(from) {
                    client.room = None;
                }
            }
            OutboundSignal::Offer { room, to, offer } => {
                if inner.is_member(from, &room) {
                    inner.deliver(&to, &room, InboundSignal::Offer { from: sender, offer });
                }
            }
            OutboundSignal::Answer { room, to, answer } => {
                if inner.is_member(from, &room) {
                    inner.deliver(&to, &room, InboundSignal::Answer { from: sender, answer });
                }
            }
            OutboundSignal::Ice { room, to, candidate } => {
                if inner.is_member(from, &room) {
                    inner.deliver(&to, &room, InboundSignal::Ice { from: sender, candidate });
                }
            }
        }
        Ok(())
    }
}

impl RelayInner {
    fn is_member(&self, id: &str, room: &str) -> bool {
        self.clients
            .get(id)
            .map_or(false, |c| c.room.as_deref() == Some(room))
    }

    fn members(&self, room: &str, except: &str) -> Vec<PeerId> {
        self.clients
            .iter()
            .filter(|(id, c)| id.as_str() != except && c.room.as_deref() == Some(room))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn deliver(&self, to: &str, room: &str, signal: InboundSignal) {
        match self.clients.get(to) {
            Some(client) if client.room.as_deref() == Some(room) => {
                if client.inbound.send(signal).is_err() {
                    trace!(to, "relay client stopped listening");
                }
            }
            _ => trace!(to, "relay dropped message for absent client"),
        }
    }
}

pub struct MockSignalingLink {
    id: Option<PeerId>,
    relay: MockRelay,
}

impl SignalingLink for MockSignalingLink {
    fn local_id(&self) -> Option<PeerId> {
        self.id.clone()
    }

    fn emit(&self, msg: OutboundSignal) -> Result<()> {
        let Some(id) = &self.id else {
            return Err(RtcError::SignalingUnavailable);
        };
        self.relay.route(id, msg)
    }
}

// ---------------------------------------------------------------------------
// Connection stack
// ---------------------------------------------------------------------------

pub struct MockSender {
    kind: TrackKind,
    stream_id: String,
    /// Track id announced in the description; fixed for the sender's life.
    sdp_track_id: String,
    track: Mutex<Option<LocalTrack>>,
    encoding: Mutex<Option<EncodingParams>>,
}

impl MockSender {
    pub fn new(track: &LocalTrack) -> Self {
        Self::with_stream(track, "stream")
    }

    fn with_stream(track: &LocalTrack, stream_id: &str) -> Self {
        Self {
            kind: track.kind(),
            stream_id: stream_id.to_string(),
            sdp_track_id: track.id().to_string(),
            track: Mutex::new(Some(track.clone())),
            encoding: Mutex::new(None),
        }
    }

    pub fn track(&self) -> Option<LocalTrack> {
        lock(&self.track).clone()
    }
}

#[async_trait]
impl MediaSender for MockSender {
    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn track_id(&self) -> Option<String> {
        lock(&self.track).as_ref().map(|t| t.id().to_string())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<()> {
        if track.kind() != self.kind {
            return Err(RtcError::InvalidState(format!(
                "cannot replace {} track with {}",
                self.kind,
                track.kind()
            )));
        }
        *lock(&self.track) = Some(track.clone());
        Ok(())
    }

    async fn set_encoding(&self, params: EncodingParams) -> Result<()> {
        *lock(&self.encoding) = Some(params);
        Ok(())
    }

    fn encoding(&self) -> Option<EncodingParams> {
        *lock(&self.encoding)
    }
}

struct ConnState {
    signaling: SignalingState,
    connection: PeerConnectionState,
    ice: IceConnectionState,
    local: Option<SessionDescription>,
    /// Local description to restore on rollback.
    rollback_to: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    senders: Vec<Arc<MockSender>>,
    transceivers: Vec<TrackKind>,
    ufrag: String,
    /// Credentials a local candidate was already trickled for.
    gathered_ufrag: Option<String>,
    remote_candidates: Vec<IceCandidate>,
    seen_remote_tracks: HashSet<String>,
    version: u64,
    offers_created: usize,
    ice_restarts: usize,
    rollbacks: usize,
}

impl ConnState {
    fn render(&mut self) -> String {
        self.version += 1;
        let mut sdp = format!(
            "v=0\r\no=- 4611731400430051336 {} IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\na=ice-ufrag:{}\r\n",
            self.version, self.ufrag
        );
        let mut mid = 0;
        for sender in &self.senders {
            sdp.push_str(&format!(
                "m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=msid:{} {}\r\na=sendrecv\r\n",
                sender.kind, mid, sender.stream_id, sender.sdp_track_id
            ));
            mid += 1;
        }
        for kind in &self.transceivers {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 96\r\na=mid:{}\r\na=recvonly\r\n", kind, mid));
            mid += 1;
        }
        sdp
    }

    fn needs_negotiation(&self) -> bool {
        match &self.local {
            None => !self.senders.is_empty() || !self.transceivers.is_empty(),
            Some(desc) => {
                let announced = sdp::track_ids(&desc.sdp);
                self.senders.iter().any(|s| !announced.contains(&s.sdp_track_id))
            }
        }
    }

    fn remote_ufrag(&self) -> Option<String> {
        self.remote
            .as_ref()
            .and_then(|d| sdp::ice_ufrag(&d.sdp))
            .map(str::to_string)
    }

    fn gather(&mut self, out: &mut Vec<PeerEvent>) {
        if self.gathered_ufrag.as_deref() == Some(self.ufrag.as_str()) {
            return;
        }
        self.gathered_ufrag = Some(self.ufrag.clone());
        out.push(PeerEvent::LocalCandidate(IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                50000 + self.version
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: Some(self.ufrag.clone()),
        }));
    }

    fn check_connectivity(&mut self, out: &mut Vec<PeerEvent>) {
        if self.signaling != SignalingState::Stable || self.local.is_none() {
            return;
        }
        let Some(ufrag) = self.remote_ufrag() else {
            return;
        };
        let reachable = self
            .remote_candidates
            .iter()
            .any(|c| c.username_fragment.as_deref().map_or(true, |u| u == ufrag));
        if !reachable {
            return;
        }
        if !matches!(self.ice, IceConnectionState::Connected | IceConnectionState::Completed) {
            self.ice = IceConnectionState::Connected;
            out.push(PeerEvent::IceConnectionState(IceConnectionState::Checking));
            out.push(PeerEvent::IceConnectionState(IceConnectionState::Connected));
        }
        if self.connection != PeerConnectionState::Connected {
            self.connection = PeerConnectionState::Connected;
            out.push(PeerEvent::ConnectionState(PeerConnectionState::Connecting));
            out.push(PeerEvent::ConnectionState(PeerConnectionState::Connected));
        }
    }

    fn settle(&mut self, out: &mut Vec<PeerEvent>) {
        self.check_connectivity(out);
        if self.needs_negotiation() {
            out.push(PeerEvent::NegotiationNeeded);
        }
    }

    fn announce_remote_tracks(&mut self, desc: &SessionDescription, out: &mut Vec<PeerEvent>) {
        for entry in sdp::msid_entries(&desc.sdp) {
            if self.seen_remote_tracks.insert(entry.track_id.clone()) {
                out.push(PeerEvent::Track(RemoteTrack {
                    id: entry.track_id,
                    kind: entry.kind,
                    stream_id: entry.stream_id,
                }));
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.signaling == SignalingState::Closed {
            return Err(RtcError::InvalidState("connection closed".into()));
        }
        Ok(())
    }
}

pub struct MockPeerConnection {
    events: PeerEventSink,
    state: Mutex<ConnState>,
}

impl MockPeerConnection {
    fn new(events: PeerEventSink) -> Self {
        Self {
            events,
            state: Mutex::new(ConnState {
                signaling: SignalingState::Stable,
                connection: PeerConnectionState::New,
                ice: IceConnectionState::New,
                local: None,
                rollback_to: None,
                remote: None,
                senders: Vec::new(),
                transceivers: Vec::new(),
                ufrag: new_ufrag(),
                gathered_ufrag: None,
                remote_candidates: Vec::new(),
                seen_remote_tracks: HashSet::new(),
                version: 0,
                offers_created: 0,
                ice_restarts: 0,
                rollbacks: 0,
            }),
        }
    }

    fn dispatch(&self, events: Vec<PeerEvent>) {
        for event in events {
            self.events.emit(event);
        }
    }

    pub fn remote_id(&self) -> &str {
        self.events.remote_id()
    }

    pub fn ice_state(&self) -> IceConnectionState {
        lock(&self.state).ice
    }

    /// Simulates a connectivity-check transition reported by the stack.
    pub fn force_ice_state(&self, state: IceConnectionState) {
        lock(&self.state).ice = state;
        self.events.emit(PeerEvent::IceConnectionState(state));
    }

    pub fn force_connection_state(&self, state: PeerConnectionState) {
        lock(&self.state).connection = state;
        self.events.emit(PeerEvent::ConnectionState(state));
    }

    pub fn rollbacks(&self) -> usize {
        lock(&self.state).rollbacks
    }

    pub fn ice_restarts(&self) -> usize {
        lock(&self.state).ice_restarts
    }

    pub fn offers_created(&self) -> usize {
        lock(&self.state).offers_created
    }

    /// Track ids announced by this connection's senders.
    pub fn local_track_ids(&self) -> Vec<String> {
        lock(&self.state)
            .senders
            .iter()
            .map(|s| s.sdp_track_id.clone())
            .collect()
    }

    pub fn senders(&self) -> Vec<Arc<MockSender>> {
        lock(&self.state).senders.clone()
    }

    pub fn transceivers(&self) -> Vec<TrackKind> {
        lock(&self.state).transceivers.clone()
    }

    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.state).remote_candidates.clone()
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.state).signaling == SignalingState::Closed
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> PeerConnectionState {
        lock(&self.state).connection
    }

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription> {
        let mut st = lock(&self.state);
        st.ensure_open()?;
        st.offers_created += 1;
        if ice_restart {
            st.ice_restarts += 1;
            st.ufrag = new_ufrag();
        }
        Ok(SessionDescription::offer(st.render()))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut st = lock(&self.state);
        if st.signaling != SignalingState::HaveRemoteOffer {
            return Err(RtcError::InvalidState(format!(
                "cannot answer in {:?}",
                st.signaling
            )));
        }
        Ok(SessionDescription::answer(st.render()))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut st = lock(&self.state);
            st.ensure_open()?;
            match (desc.sdp_type, st.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    st.rollback_to = st.local.take();
                    st.local = Some(desc);
                    st.signaling = SignalingState::HaveLocalOffer;
                    st.gather(&mut out);
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => {
                    st.local = Some(desc);
                    st.signaling = SignalingState::Stable;
                    st.gather(&mut out);
                    st.settle(&mut out);
                }
                (SdpType::Rollback, SignalingState::HaveLocalOffer) => {
                    st.local = st.rollback_to.take();
                    st.signaling = SignalingState::Stable;
                    st.gathered_ufrag = None;
                    st.rollbacks += 1;
                    st.settle(&mut out);
                }
                (kind, state) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply local {kind:?} in {state:?}"
                    )));
                }
            }
        }
        self.dispatch(out);
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut st = lock(&self.state);
            st.ensure_open()?;
            match (desc.sdp_type, st.signaling) {
                (SdpType::Offer, SignalingState::Stable) => {
                    let previous = st.remote_ufrag();
                    let offered = sdp::ice_ufrag(&desc.sdp).map(str::to_string);
                    if previous.is_some() && previous != offered {
                        // remote restarted ICE, answer with fresh credentials
                        st.ufrag = new_ufrag();
                    }
                    st.announce_remote_tracks(&desc, &mut out);
                    st.remote = Some(desc);
                    st.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpType::Answer, SignalingState::HaveLocalOffer) => {
                    st.announce_remote_tracks(&desc, &mut out);
                    st.remote = Some(desc);
                    st.rollback_to = None;
                    st.signaling = SignalingState::Stable;
                    st.settle(&mut out);
                }
                (kind, state) => {
                    return Err(RtcError::InvalidState(format!(
                        "cannot apply remote {kind:?} in {state:?}"
                    )));
                }
            }
        }
        self.dispatch(out);
        Ok(())
    }

    async fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut out = Vec::new();
        {
            let mut st = lock(&self.state);
            st.ensure_open()?;
            st.remote_candidates.push(candidate);
            st.check_connectivity(&mut out);
        }
        self.dispatch(out);
        Ok(())
    }

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<Arc<dyn MediaSender>> {
        let sender = Arc::new(MockSender::with_stream(track, stream_id));
        let stable = {
            let mut st = lock(&self.state);
            st.ensure_open()?;
            st.senders.push(sender.clone());
            st.signaling == SignalingState::Stable
        };
        if stable {
            self.events.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(sender)
    }

    async fn add_transceiver(&self, kind: TrackKind) -> Result<()> {
        let stable = {
            let mut st = lock(&self.state);
            st.ensure_open()?;
            st.transceivers.push(kind);
            st.signaling == SignalingState::Stable
        };
        if stable {
            self.events.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(())
    }

    async fn needs_negotiation(&self) -> bool {
        lock(&self.state).needs_negotiation()
    }

    async fn close(&self) -> Result<()> {
        let mut st = lock(&self.state);
        st.signaling = SignalingState::Closed;
        st.connection = PeerConnectionState::Closed;
        st.ice = IceConnectionState::Closed;
        Ok(())
    }
}

/// Hands out [`MockPeerConnection`]s and keeps every one it created.
#[derive(Default)]
pub struct MockConnectionFactory {
    created: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<Arc<MockPeerConnection>> {
        lock(&self.created).last().cloned()
    }

    pub fn connections(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.created).clone()
    }

    /// Most recent connection created for a remote participant.
    pub fn connection_for(&self, remote_id: &str) -> Option<Arc<MockPeerConnection>> {
        lock(&self.created)
            .iter()
            .rev()
            .find(|c| c.remote_id() == remote_id)
            .cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockConnectionFactory {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>> {
        let conn = Arc::new(MockPeerConnection::new(events));
        lock(&self.created).push(conn.clone());
        Ok(conn)
    }
}

// ---------------------------------------------------------------------------
// Capture devices
// ---------------------------------------------------------------------------

#[derive(Default)]
struct DevicesState {
    has_camera: bool,
    refuse_video: bool,
    refuse_all: bool,
    acquisitions: usize,
    requests: Vec<MediaConstraints>,
}

/// Capture devices with a microphone and an optional camera.
#[derive(Default)]
pub struct MockMediaDevices {
    state: Mutex<DevicesState>,
}

impl MockMediaDevices {
    pub fn new(has_camera: bool) -> Self {
        Self {
            state: Mutex::new(DevicesState {
                has_camera,
                ..Default::default()
            }),
        }
    }

    pub fn set_camera(&self, present: bool) {
        lock(&self.state).has_camera = present;
    }

    /// Refuses any request that includes video.
    pub fn refuse_video(&self, refuse: bool) {
        lock(&self.state).refuse_video = refuse;
    }

    /// Refuses every request, as if permission was denied outright.
    pub fn refuse_all(&self, refuse: bool) {
        lock(&self.state).refuse_all = refuse;
    }

    /// Number of requests that produced tracks.
    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }

    pub fn requests(&self) -> Vec<MediaConstraints> {
        lock(&self.state).requests.clone()
    }
}

#[async_trait]
impl MediaDevices for MockMediaDevices {
    async fn enumerate(&self) -> Result<Vec<DeviceInfo>> {
        let st = lock(&self.state);
        let mut devices = vec![DeviceInfo {
            kind: DeviceKind::AudioInput,
            device_id: "default-mic".into(),
            label: "Built-in Microphone".into(),
        }];
        if st.has_camera {
            devices.push(DeviceInfo {
                kind: DeviceKind::VideoInput,
                device_id: "default-cam".into(),
                label: "Built-in Camera".into(),
            });
        }
        Ok(devices)
    }

    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<Vec<LocalTrack>> {
        let mut st = lock(&self.state);
        st.requests.push(constraints);
        if st.refuse_all {
            return Err(RtcError::MediaUnavailable("permission denied".into()));
        }
        if constraints.video && (st.refuse_video || !st.has_camera) {
            return Err(RtcError::MediaUnavailable("camera unavailable".into()));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, "Built-in Microphone"));
        }
        if constraints.video {
            tracks.push(LocalTrack::new(TrackKind::Video, "Built-in Camera"));
        }
        st.acquisitions += 1;
        Ok(tracks)
    }
}
