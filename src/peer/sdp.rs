//! Minimal SDP inspection.
//!
//! The session never rewrites descriptions; it only needs to know which
//! tracks a remote description announces (to assemble composite streams)
//! and which ICE credentials it carries.

use crate::media::TrackKind;
use std::collections::HashMap;

/// One `a=msid:` announcement, tagged with the kind of its `m=` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MsidEntry {
    pub kind: TrackKind,
    pub stream_id: String,
    pub track_id: String,
}

pub fn msid_entries(sdp: &str) -> Vec<MsidEntry> {
    let mut kind = None;
    let mut out = Vec::new();

    for line in sdp.lines() {
        if let Some(media) = line.strip_prefix("m=") {
            kind = media.split_whitespace().next().and_then(TrackKind::from_media);
            continue;
        }
        let (Some(kind), Some(value)) = (kind, line.strip_prefix("a=msid:")) else {
            continue;
        };
        let mut parts = value.split_whitespace();
        if let (Some(stream_id), Some(track_id)) = (parts.next(), parts.next()) {
            out.push(MsidEntry {
                kind,
                stream_id: stream_id.to_string(),
                track_id: track_id.to_string(),
            });
        }
    }
    out
}

/// Number of tracks announced per media group.
pub fn tracks_per_stream(sdp: &str) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for entry in msid_entries(sdp) {
        *counts.entry(entry.stream_id).or_insert(0) += 1;
    }
    counts
}

/// Track ids announced by a description.
pub fn track_ids(sdp: &str) -> Vec<String> {
    msid_entries(sdp).into_iter().map(|e| e.track_id).collect()
}

pub fn ice_ufrag(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|l| l.strip_prefix("a=ice-ufrag:"))
        .map(str::trim)
}
