pub mod connection;
pub mod ice;
pub mod negotiator;
pub mod rtc;
pub mod sdp;
pub mod state;
pub mod types;

pub use connection::{
    MediaSender, PeerConnection, PeerConnectionFactory, PeerEvent, PeerEventEnvelope,
    PeerEventSink,
};
pub use negotiator::{OfferOutcome, PeerNegotiator};
pub use rtc::{SampleWriter, WebRtcConnectionFactory};
pub use state::{NegotiationPhase, PolitenessPolicy};
pub use types::{
    IceCandidate, IceConnectionState, PeerConnectionState, PeerId, RemoteStream, RemoteTrack,
    SdpType, ServerConfig, SessionDescription, SignalingState,
};
