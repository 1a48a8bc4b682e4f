use crate::error::{Result, RtcError};
use crate::quality::{EncodingParams, QualityPreset};
use crate::session::{JoinOutcome, SessionSnapshot};
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug)]
pub enum Command {
    Join {
        room_id: String,
        reply: oneshot::Sender<Result<JoinOutcome>>,
    },
    Leave {
        reply: oneshot::Sender<()>,
    },
    ToggleMic {
        enabled: bool,
        reply: oneshot::Sender<bool>,
    },
    ToggleCamera {
        enabled: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    SetPreset {
        preset: QualityPreset,
        reply: oneshot::Sender<EncodingParams>,
    },
    Snapshot {
        reply: oneshot::Sender<SessionSnapshot>,
    },
    /// Leaves the room and stops the loop.
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::ToggleMic { .. } => "toggle_mic",
            Self::ToggleCamera { .. } => "toggle_camera",
            Self::SetPreset { .. } => "set_preset",
            Self::Snapshot { .. } => "snapshot",
            Self::Shutdown { .. } => "shutdown",
        }
    }
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub(crate) fn new(tx: mpsc::Sender<Command>) -> Self {
        Self { tx }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        let command = make(reply);
        debug!(command = command.name(), "session command");
        self.tx
            .send(command)
            .await
            .map_err(|_| RtcError::InvalidState("session loop stopped".into()))?;
        rx.await
            .map_err(|_| RtcError::InvalidState("session loop dropped the reply".into()))
    }

    pub async fn join(&self, room_id: impl Into<String>) -> Result<JoinOutcome> {
        let room_id = room_id.into();
        self.request(|reply| Command::Join { room_id, reply }).await?
    }

    pub async fn leave(&self) -> Result<()> {
        self.request(|reply| Command::Leave { reply }).await
    }

    /// Returns whether a microphone track was there to toggle.
    pub async fn toggle_mic(&self, enabled: bool) -> Result<bool> {
        self.request(|reply| Command::ToggleMic { enabled, reply }).await
    }

    pub async fn toggle_camera(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::ToggleCamera { enabled, reply })
            .await?
    }

    pub async fn set_preset(&self, preset: QualityPreset) -> Result<EncodingParams> {
        self.request(|reply| Command::SetPreset { preset, reply }).await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.request(|reply| Command::Shutdown { reply }).await
    }

    /// True once the session loop has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
