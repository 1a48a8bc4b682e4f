//! Real-time session negotiation core for the Interactify meeting client.
//!
//! A [`SessionRegistry`] keeps one direct media connection per remote
//! participant of a room, coordinating through a signaling relay. Offers
//! and answers follow the perfect-negotiation pattern, degraded
//! connectivity is recovered with delayed ICE restarts, and outgoing video
//! quality is adjusted in place through encoding parameters.
//!
//! The relay, capture devices and connection stack are ports
//! ([`SignalingLink`], [`MediaDevices`], [`PeerConnectionFactory`]). The
//! [`peer::rtc`] module backs the connection port with the `webrtc` crate,
//! and [`mock`] provides in-memory doubles.

pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod media;
pub mod mock;
pub mod peer;
pub mod quality;
pub mod resilience;
pub mod session;
pub mod signaling;
pub mod utils;

pub use commands::SessionHandle;
pub use config::RtcConfig;
pub use error::{Result, RtcError};
pub use events::{ConnectionStatus, SessionEvent, SessionEvents};
pub use media::{LocalStream, LocalTrack, MediaDevices, MediaSource, TrackKind};
pub use peer::{PeerConnectionFactory, PolitenessPolicy, WebRtcConnectionFactory};
pub use quality::{EncodingParams, QualityController, QualityPreset};
pub use resilience::ResilienceController;
pub use session::{JoinOutcome, SessionRegistry, SessionSnapshot};
pub use signaling::{ChannelSignaling, InboundSignal, OutboundSignal, SignalingLink};
