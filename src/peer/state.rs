use serde::Serialize;
use std::time::Duration;

/// Delay between a degraded connectivity check and the ICE restart.
pub const ICE_RESTART_DELAY: Duration = Duration::from_millis(2500);

/// Negotiation role of one peer record.
///
/// A record is in exactly one phase, so "making an offer" and "applying an
/// answer" can never be true at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum NegotiationPhase {
    #[default]
    Stable,
    /// A local offer is being created and applied.
    MakingOffer,
    /// A local answer is being applied.
    AwaitingAnswerApplication,
}

/// How the local side decides its role relative to each peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolitenessPolicy {
    /// The side whose participant id sorts lower is polite.
    #[default]
    ByIdentity,
    /// Always defer to the remote offer.
    AlwaysPolite,
}

impl PolitenessPolicy {
    pub fn is_polite(&self, local_id: &str, remote_id: &str) -> bool {
        match self {
            Self::ByIdentity => local_id < remote_id,
            Self::AlwaysPolite => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_policy_gives_opposite_roles() {
        let p = PolitenessPolicy::ByIdentity;
        assert_ne!(p.is_polite("alice", "bob"), p.is_polite("bob", "alice"));
        assert!(PolitenessPolicy::AlwaysPolite.is_polite("bob", "alice"));
    }
}
