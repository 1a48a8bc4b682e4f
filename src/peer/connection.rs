//! Connection port.
//!
//! The negotiator drives a [`PeerConnection`] and never touches the
//! platform stack directly. Connection callbacks are turned into
//! [`PeerEvent`] messages and posted to the owning session through a
//! [`PeerEventSink`].

use crate::error::Result;
use crate::media::{LocalTrack, TrackKind};
use crate::peer::types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, RemoteTrack,
    SessionDescription, SignalingState,
};
use crate::quality::EncodingParams;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// The set of outbound tracks changed and a new offer is due.
    NegotiationNeeded,
    /// A local candidate was gathered and should be trickled to the peer.
    LocalCandidate(IceCandidate),
    IceConnectionState(IceConnectionState),
    ConnectionState(PeerConnectionState),
    Track(RemoteTrack),
}

#[derive(Debug)]
pub struct PeerEventEnvelope {
    pub remote_id: PeerId,
    /// Record generation the event belongs to; events of a replaced record
    /// are discarded.
    pub generation: u64,
    pub event: PeerEvent,
}

/// Posts connection events into the session loop.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    remote_id: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<PeerEventEnvelope>,
}

impl PeerEventSink {
    pub fn new(
        remote_id: PeerId,
        generation: u64,
        tx: mpsc::UnboundedSender<PeerEventEnvelope>,
    ) -> Self {
        Self {
            remote_id,
            generation,
            tx,
        }
    }

    pub fn remote_id(&self) -> &str {
        &self.remote_id
    }

    pub fn emit(&self, event: PeerEvent) {
        let envelope = PeerEventEnvelope {
            remote_id: self.remote_id.clone(),
            generation: self.generation,
            event,
        };
        if self.tx.send(envelope).is_err() {
            trace!(peer = %self.remote_id, "session loop gone, peer event dropped");
        }
    }
}

/// Outbound media sender attached to one connection.
#[async_trait]
pub trait MediaSender: Send + Sync {
    fn kind(&self) -> TrackKind;

    fn track_id(&self) -> Option<String>;

    async fn replace_track(&self, track: &LocalTrack) -> Result<()>;

    /// Updates encoding limits in place. Never triggers renegotiation.
    async fn set_encoding(&self, params: EncodingParams) -> Result<()>;

    fn encoding(&self) -> Option<EncodingParams>;
}

/// One direct connection to a remote participant.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> PeerConnectionState;

    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn remote_description(&self) -> Option<SessionDescription>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn add_track(&self, track: &LocalTrack, stream_id: &str) -> Result<Arc<dyn MediaSender>>;

    /// Adds a send/receive transceiver without a track.
    async fn add_transceiver(&self, kind: TrackKind) -> Result<()>;

    /// Whether the current local description is missing outbound tracks.
    async fn needs_negotiation(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(&self, events: PeerEventSink) -> Result<Arc<dyn PeerConnection>>;
}
