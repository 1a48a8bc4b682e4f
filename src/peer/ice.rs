use crate::peer::types::{IceCandidate, PeerId};
use std::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::RTCPeerConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    Srflx,
    Prflx,
    Relay,
}

impl CandidateType {
    /// Reads the `typ` field of an SDP candidate line.
    pub fn parse(candidate: &str) -> Option<Self> {
        let mut fields = candidate.split_whitespace();
        fields.find(|f| *f == "typ")?;
        match fields.next()? {
            "host" => Some(Self::Host),
            "srflx" => Some(Self::Srflx),
            "prflx" => Some(Self::Prflx),
            "relay" => Some(Self::Relay),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CandidateCounts {
    pub host: usize,
    pub srflx: usize,
    pub relay: usize,
}

/// Counts gathered candidates by type and warns when no TURN relay
/// candidate was found.
pub fn analyze_candidates(remote_id: &str, candidates: &[IceCandidate]) -> CandidateCounts {
    let mut counts = CandidateCounts::default();
    for candidate in candidates {
        match CandidateType::parse(&candidate.candidate) {
            Some(CandidateType::Host) => counts.host += 1,
            Some(CandidateType::Srflx) | Some(CandidateType::Prflx) => counts.srflx += 1,
            Some(CandidateType::Relay) => counts.relay += 1,
            None => {}
        }
    }

    info!(
        peer = remote_id,
        host = counts.host,
        srflx = counts.srflx,
        relay = counts.relay,
        "candidate gathering complete"
    );
    if counts.relay == 0 {
        warn!(peer = remote_id, "no TURN relay candidates found, connection through NAT may fail");
    }
    counts
}

pub fn to_rtc_init(candidate: IceCandidate) -> RTCIceCandidateInit {
    RTCIceCandidateInit {
        candidate: candidate.candidate,
        sdp_mid: candidate.sdp_mid,
        sdp_mline_index: candidate.sdp_mline_index,
        username_fragment: candidate.username_fragment,
    }
}

pub fn from_rtc_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

/// Remote candidates that arrived before the remote description.
#[derive(Debug, Default)]
pub struct PendingCandidates {
    queue: Mutex<Vec<IceCandidate>>,
}

impl PendingCandidates {
    pub fn push(&self, candidate: IceCandidate) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(candidate);
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn drain(&self) -> Vec<IceCandidate> {
        self.queue
            .lock()
            .map(|mut q| q.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Applies every queued candidate once a remote description is in place.
pub async fn apply_pending_candidates(remote_id: &PeerId, pc: &RTCPeerConnection, pending: &PendingCandidates) {
    for candidate in pending.drain() {
        debug!(peer = %remote_id, candidate = %candidate.candidate, "applying queued candidate");
        if let Err(e) = pc.add_ice_candidate(to_rtc_init(candidate)).await {
            warn!(peer = %remote_id, error = %e, "failed to apply queued candidate");
        }
    }
}
