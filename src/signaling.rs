//! Relay message contract and the link the session talks through.
//!
//! The session owns its [`SignalingLink`]; there is no ambient socket.
//! Inbound relay traffic reaches the session as a typed stream of
//! [`InboundSignal`] values.

use crate::error::{Result, RtcError};
use crate::peer::types::{IceCandidate, PeerId, SessionDescription};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Client -> relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum OutboundSignal {
    #[serde(rename = "rtc:join")]
    Join { room: String },
    #[serde(rename = "rtc:leave")]
    Leave { room: String },
    #[serde(rename = "rtc:offer")]
    Offer {
        room: String,
        to: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "rtc:answer")]
    Answer {
        room: String,
        to: PeerId,
        answer: SessionDescription,
    },
    #[serde(rename = "rtc:ice")]
    Ice {
        room: String,
        to: PeerId,
        candidate: IceCandidate,
    },
}

impl OutboundSignal {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Join { .. } => "rtc:join",
            Self::Leave { .. } => "rtc:leave",
            Self::Offer { .. } => "rtc:offer",
            Self::Answer { .. } => "rtc:answer",
            Self::Ice { .. } => "rtc:ice",
        }
    }

    /// Addressed participant, for messages routed to one peer.
    pub fn to(&self) -> Option<&str> {
        match self {
            Self::Offer { to, .. } | Self::Answer { to, .. } | Self::Ice { to, .. } => Some(to),
            Self::Join { .. } | Self::Leave { .. } => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Relay -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum InboundSignal {
    #[serde(rename = "rtc:joined")]
    Joined { from: PeerId },
    #[serde(rename = "rtc:left")]
    Left { from: PeerId },
    #[serde(rename = "rtc:offer")]
    Offer {
        from: PeerId,
        offer: SessionDescription,
    },
    #[serde(rename = "rtc:answer")]
    Answer {
        from: PeerId,
        answer: SessionDescription,
    },
    #[serde(rename = "rtc:ice")]
    Ice {
        from: PeerId,
        candidate: IceCandidate,
    },
}

impl InboundSignal {
    pub fn from(&self) -> &str {
        match self {
            Self::Joined { from }
            | Self::Left { from }
            | Self::Offer { from, .. }
            | Self::Answer { from, .. }
            | Self::Ice { from, .. } => from,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Joined { .. } => "rtc:joined",
            Self::Left { .. } => "rtc:left",
            Self::Offer { .. } => "rtc:offer",
            Self::Answer { .. } => "rtc:answer",
            Self::Ice { .. } => "rtc:ice",
        }
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Outbound half of the relay connection.
///
/// `emit` is fire-and-forget; delivery is never acknowledged.
pub trait SignalingLink: Send + Sync {
    /// Identity the relay assigned to this client, once known.
    fn local_id(&self) -> Option<PeerId>;

    fn emit(&self, msg: OutboundSignal) -> Result<()>;
}

/// Link backed by an unbounded channel; the host transport drains the
/// receiver and writes to the relay.
pub struct ChannelSignaling {
    local_id: Mutex<Option<PeerId>>,
    tx: mpsc::UnboundedSender<OutboundSignal>,
}

impl ChannelSignaling {
    pub fn new(local_id: Option<PeerId>) -> (Self, mpsc::UnboundedReceiver<OutboundSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                local_id: Mutex::new(local_id),
                tx,
            },
            rx,
        )
    }

    /// Records the id assigned by the relay after the transport connected.
    pub fn set_local_id(&self, id: impl Into<PeerId>) {
        if let Ok(mut guard) = self.local_id.lock() {
            *guard = Some(id.into());
        }
    }
}

impl SignalingLink for ChannelSignaling {
    fn local_id(&self) -> Option<PeerId> {
        self.local_id.lock().ok().and_then(|g| g.clone())
    }

    fn emit(&self, msg: OutboundSignal) -> Result<()> {
        self.tx
            .send(msg)
            .map_err(|_| RtcError::SignalingUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_uses_relay_event_names() {
        let msg = OutboundSignal::Offer {
            room: "r1".into(),
            to: "B".into(),
            offer: SessionDescription::offer("v=0"),
        };
        let v: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(v["event"], "rtc:offer");
        assert_eq!(v["data"]["to"], "B");
        assert_eq!(v["data"]["offer"]["type"], "offer");
        assert_eq!(msg.to(), Some("B"));
    }

    #[test]
    fn inbound_parses_relay_payloads() {
        let raw = r#"{"event":"rtc:joined","data":{"from":"B"}}"#;
        let msg = InboundSignal::from_json(raw).unwrap();
        assert_eq!(msg, InboundSignal::Joined { from: "B".into() });
        assert_eq!(msg.from(), "B");

        let raw = r#"{"event":"rtc:ice","data":{"from":"B","candidate":{"candidate":"candidate:1","sdpMid":"0","sdpMLineIndex":0}}}"#;
        assert_eq!(InboundSignal::from_json(raw).unwrap().name(), "rtc:ice");
        assert!(InboundSignal::from_json(r#"{"event":"rtc:bogus","data":{}}"#).is_err());
    }

    #[test]
    fn closed_channel_reports_unavailable() {
        let (link, rx) = ChannelSignaling::new(Some("A".into()));
        drop(rx);
        let err = link.emit(OutboundSignal::Join { room: "r".into() }).unwrap_err();
        assert!(matches!(err, RtcError::SignalingUnavailable));
    }

    #[test]
    fn local_id_can_be_assigned_later() {
        let (link, _rx) = ChannelSignaling::new(None);
        assert_eq!(link.local_id(), None);
        link.set_local_id("A");
        assert_eq!(link.local_id().as_deref(), Some("A"));
    }
}
