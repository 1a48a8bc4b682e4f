use thiserror::Error;

/// Errors produced by the session core.
///
/// Most of these never reach the UI: the session absorbs media fallbacks,
/// negotiation collisions and transport trouble, and only reports them
/// through status changes and participant events.
#[derive(Debug, Error)]
pub enum RtcError {
    /// Capture device refused or absent.
    #[error("media unavailable: {0}")]
    MediaUnavailable(String),

    /// The relay channel is down; outbound signaling cannot be delivered.
    #[error("signaling relay unavailable")]
    SignalingUnavailable,

    #[error("negotiation error: {0}")]
    Negotiation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("session is not joined")]
    NotJoined,

    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RtcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_errors_convert() {
        let err: RtcError = serde_json::from_str::<u32>("x").unwrap_err().into();
        assert!(matches!(err, RtcError::Serde(_)));
        assert!(err.to_string().starts_with("serialization error"));
    }

    #[test]
    fn messages_name_the_failure() {
        assert_eq!(RtcError::NotJoined.to_string(), "session is not joined");
        assert_eq!(
            RtcError::Config("bad".into()).to_string(),
            "configuration error: bad"
        );
    }
}
