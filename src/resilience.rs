//! Transport health watching and ICE-restart scheduling.
//!
//! Each peer record owns at most one [`RestartTimer`]. Dropping the timer
//! (record removed, leave, self-heal) aborts the pending task, so no timer
//! can outlive its connection. A fired timer does not touch the record; it
//! posts a [`RestartDue`] message back into the session loop, which checks
//! that the record and the timer are still the ones that scheduled it.

use crate::peer::types::{IceConnectionState, PeerConnectionState, PeerId};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestartDue {
    pub remote_id: PeerId,
    pub generation: u64,
    pub timer_id: u64,
}

/// Pending recovery for one peer. Aborts on drop.
#[derive(Debug)]
pub struct RestartTimer {
    id: u64,
    handle: JoinHandle<()>,
}

impl RestartTimer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RestartTimer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    None,
    /// A delayed ICE restart was armed.
    Scheduled,
    /// Connectivity recovered; the pending restart was dropped.
    Cancelled,
    /// The connection is gone for good; remove the peer.
    Teardown,
}

pub struct ResilienceController {
    delay: Duration,
    next_timer: u64,
    tx: mpsc::UnboundedSender<RestartDue>,
}

impl ResilienceController {
    pub fn new(delay: Duration) -> (Self, mpsc::UnboundedReceiver<RestartDue>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                delay,
                next_timer: 0,
                tx,
            },
            rx,
        )
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Reacts to a connectivity-check transition. `slot` is the record's
    /// single timer slot.
    pub fn on_ice_state(
        &mut self,
        remote_id: &str,
        generation: u64,
        slot: &mut Option<RestartTimer>,
        state: IceConnectionState,
    ) -> RecoveryAction {
        match state {
            IceConnectionState::Disconnected | IceConnectionState::Failed => {
                if let Some(timer) = slot {
                    trace!(peer = remote_id, timer = timer.id, "restart already pending");
                    return RecoveryAction::None;
                }
                *slot = Some(self.arm(remote_id, generation));
                info!(peer = remote_id, ?state, delay_ms = self.delay.as_millis() as u64, "connectivity degraded, ICE restart scheduled");
                RecoveryAction::Scheduled
            }
            IceConnectionState::Connected | IceConnectionState::Completed => match slot.take() {
                Some(timer) => {
                    debug!(peer = remote_id, timer = timer.id, "connectivity recovered, restart cancelled");
                    RecoveryAction::Cancelled
                }
                None => RecoveryAction::None,
            },
            _ => RecoveryAction::None,
        }
    }

    /// Failed or closed aggregate state is terminal.
    pub fn on_connection_state(&self, state: PeerConnectionState) -> RecoveryAction {
        match state {
            PeerConnectionState::Failed | PeerConnectionState::Closed => RecoveryAction::Teardown,
            _ => RecoveryAction::None,
        }
    }

    /// Whether a fired timer still belongs to the slot it was armed for.
    pub fn is_current(slot: &Option<RestartTimer>, due: &RestartDue) -> bool {
        slot.as_ref().map(RestartTimer::id) == Some(due.timer_id)
    }

    fn arm(&mut self, remote_id: &str, generation: u64) -> RestartTimer {
        self.next_timer += 1;
        let due = RestartDue {
            remote_id: remote_id.to_string(),
            generation,
            timer_id: self.next_timer,
        };
        let tx = self.tx.clone();
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(due);
        });
        RestartTimer {
            id: self.next_timer,
            handle,
        }
    }
}
