//! Notifications toward the UI layer.

use crate::peer::types::{PeerId, RemoteStream};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Coarse connectivity label shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone)]
pub enum SessionEvent {
    ParticipantJoined(PeerId),
    ParticipantLeft(PeerId),
    /// Composite media of one remote participant.
    Stream {
        remote_id: PeerId,
        stream: RemoteStream,
    },
    PeerStatus {
        remote_id: PeerId,
        status: ConnectionStatus,
    },
    Status(ConnectionStatus),
}

/// Observer channel. A session built with [`SessionEvents::silent`] drops
/// every notification.
#[derive(Debug, Clone, Default)]
pub struct SessionEvents {
    tx: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl SessionEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn silent() -> Self {
        Self { tx: None }
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                trace!("event observer gone");
            }
        }
    }

    pub fn emit_participant_joined(&self, remote_id: &str) {
        debug!(peer = remote_id, "participant joined");
        self.emit(SessionEvent::ParticipantJoined(remote_id.to_string()));
    }

    pub fn emit_participant_left(&self, remote_id: &str) {
        debug!(peer = remote_id, "participant left");
        self.emit(SessionEvent::ParticipantLeft(remote_id.to_string()));
    }

    pub fn emit_stream(&self, remote_id: &str, stream: RemoteStream) {
        debug!(peer = remote_id, stream = %stream.id, tracks = stream.tracks.len(), "remote stream ready");
        self.emit(SessionEvent::Stream {
            remote_id: remote_id.to_string(),
            stream,
        });
    }

    pub fn emit_peer_status(&self, remote_id: &str, status: ConnectionStatus) {
        self.emit(SessionEvent::PeerStatus {
            remote_id: remote_id.to_string(),
            status,
        });
    }

    pub fn emit_status(&self, status: ConnectionStatus) {
        debug!(?status, "session status");
        self.emit(SessionEvent::Status(status));
    }
}
