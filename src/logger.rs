use crate::config::DEFAULT_LOG_FILTER;
use crate::peer::ice::CandidateType;
use crate::peer::types::IceCandidate;
use once_cell::sync::OnceCell;
use tracing::{debug, info};
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::EnvFilter;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::stats::StatsReportType;

static INIT: OnceCell<()> = OnceCell::new();

/// Local wall-clock timestamps with millisecond precision.
struct LocalTimer;

impl FormatTime for LocalTimer {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Installs the global subscriber. `RUST_LOG` overrides the default
/// filter. Safe to call more than once; a subscriber installed by the host
/// is left in place.
pub fn init() {
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let installed = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_timer(LocalTimer)
            .with_target(true)
            .try_init()
            .is_ok();
        if installed {
            debug!(filter = DEFAULT_LOG_FILTER, "logging initialized");
        }
    });
}

/// Trace of a trickled candidate (local or remote).
pub fn dump_candidate(label: &str, remote_id: &str, candidate: &IceCandidate) {
    debug!(
        peer = remote_id,
        label,
        kind = ?CandidateType::parse(&candidate.candidate),
        candidate = %candidate.candidate,
        sdp_mid = ?candidate.sdp_mid,
        sdp_mline_index = ?candidate.sdp_mline_index,
        ufrag = ?candidate.username_fragment,
        "trickle candidate"
    );
}

/// Quick getStats snapshot of the nominated candidate pair.
pub async fn dump_selected_pair(pc: &RTCPeerConnection, remote_id: &str, moment: &str) {
    let stats = pc.get_stats().await;
    for (_, report) in stats.reports {
        if let StatsReportType::CandidatePair(pair) = report {
            if pair.nominated {
                info!(
                    peer = remote_id,
                    moment,
                    local = %pair.local_candidate_id,
                    remote = %pair.remote_candidate_id,
                    bytes_sent = pair.bytes_sent,
                    bytes_received = pair.bytes_received,
                    state = ?pair.state,
                    "selected candidate pair"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
        dump_candidate(
            "local",
            "B",
            &IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 10.0.0.2 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
                username_fragment: None,
            },
        );
        assert!(INIT.get().is_some());
    }
}
