//! Startup configuration. Values are read once when the session is built
//! and never re-read at runtime.

use crate::error::{Result, RtcError};
use crate::peer::state::{PolitenessPolicy, ICE_RESTART_DELAY};
use crate::peer::types::ServerConfig;
use crate::quality::QualityPreset;
use std::time::Duration;
use tracing::debug;

// Default log filter when RUST_LOG is not set
#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "debug";

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Video bitrate ceiling in bits per second.
pub const DEFAULT_MAX_VIDEO_BITRATE: u32 = 1_500_000;

pub const ENV_ICE_SERVERS: &str = "INTERACTIFY_ICE_SERVERS";
pub const ENV_TURN_USERNAME: &str = "INTERACTIFY_TURN_USERNAME";
pub const ENV_TURN_CREDENTIAL: &str = "INTERACTIFY_TURN_CREDENTIAL";
pub const ENV_ICE_RESTART_DELAY_MS: &str = "INTERACTIFY_ICE_RESTART_DELAY_MS";
pub const ENV_MAX_VIDEO_BITRATE: &str = "INTERACTIFY_MAX_VIDEO_BITRATE";
pub const ENV_QUALITY: &str = "INTERACTIFY_QUALITY";

#[derive(Debug, Clone, PartialEq)]
pub struct RtcConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub ice_restart_delay: Duration,
    pub max_video_bitrate: u32,
    pub quality: QualityPreset,
    pub politeness: PolitenessPolicy,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
            ice_restart_delay: ICE_RESTART_DELAY,
            max_video_bitrate: DEFAULT_MAX_VIDEO_BITRATE,
            quality: QualityPreset::Medium,
            politeness: PolitenessPolicy::default(),
        }
    }
}

/// Google public STUN.
pub fn default_ice_servers() -> Vec<ServerConfig> {
    vec![ServerConfig {
        id: "default-stun".into(),
        r#type: "stun".into(),
        url: "stun:stun.l.google.com:19302".into(),
        username: None,
        credential: None,
    }]
}

impl RtcConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup; unset keys
    /// keep their defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(raw) = get(ENV_ICE_SERVERS) {
            let username = get(ENV_TURN_USERNAME);
            let credential = get(ENV_TURN_CREDENTIAL);
            config.ice_servers = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .enumerate()
                .map(|(i, url)| {
                    let turn = url.starts_with("turn:") || url.starts_with("turns:");
                    ServerConfig {
                        id: format!("env-{i}"),
                        r#type: if turn { "turn" } else { "stun" }.into(),
                        url: url.to_string(),
                        username: if turn { username.clone() } else { None },
                        credential: if turn { credential.clone() } else { None },
                    }
                })
                .collect();
        }

        if let Some(raw) = get(ENV_ICE_RESTART_DELAY_MS) {
            let ms: u64 = raw
                .trim()
                .parse()
                .map_err(|_| RtcError::Config(format!("{ENV_ICE_RESTART_DELAY_MS}: '{raw}' is not a number")))?;
            config.ice_restart_delay = Duration::from_millis(ms);
        }

        if let Some(raw) = get(ENV_MAX_VIDEO_BITRATE) {
            config.max_video_bitrate = raw
                .trim()
                .parse()
                .map_err(|_| RtcError::Config(format!("{ENV_MAX_VIDEO_BITRATE}: '{raw}' is not a number")))?;
        }

        if let Some(raw) = get(ENV_QUALITY) {
            config.quality = raw.parse()?;
        }

        config.validate()?;
        debug!(
            ice_servers = config.ice_servers.len(),
            restart_delay_ms = config.ice_restart_delay.as_millis() as u64,
            max_video_bitrate = config.max_video_bitrate,
            quality = ?config.quality,
            "configuration loaded"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ice_servers.is_empty() {
            return Err(RtcError::Config("at least one ICE server is required".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(RtcError::Config(format!("ICE server '{}' has an empty url", server.id)));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none()) {
                return Err(RtcError::Config(format!(
                    "TURN server '{}' requires username and credential",
                    server.id
                )));
            }
        }
        if self.ice_restart_delay.is_zero() {
            return Err(RtcError::Config("ICE restart delay must be positive".into()));
        }
        if self.max_video_bitrate == 0 {
            return Err(RtcError::Config("video bitrate ceiling must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_use_public_stun() {
        let config = RtcConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, RtcConfig::default());
        assert_eq!(config.ice_restart_delay, Duration::from_millis(2500));
        assert!(config.ice_servers[0].url.contains("stun.l.google.com"));
    }

    #[test]
    fn env_overrides_are_applied() {
        let config = RtcConfig::from_lookup(lookup(&[
            (ENV_ICE_SERVERS, "stun:stun.example.org:3478, turn:turn.example.org:3478"),
            (ENV_TURN_USERNAME, "u"),
            (ENV_TURN_CREDENTIAL, "p"),
            (ENV_ICE_RESTART_DELAY_MS, "4000"),
            (ENV_MAX_VIDEO_BITRATE, "900000"),
            (ENV_QUALITY, "low"),
        ]))
        .unwrap();

        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.ice_servers[1].r#type, "turn");
        assert_eq!(config.ice_servers[1].username.as_deref(), Some("u"));
        assert_eq!(config.ice_servers[0].username, None);
        assert_eq!(config.ice_restart_delay, Duration::from_secs(4));
        assert_eq!(config.max_video_bitrate, 900_000);
        assert_eq!(config.quality, QualityPreset::Low);
    }

    #[test]
    fn turn_without_credentials_is_rejected() {
        let err = RtcConfig::from_lookup(lookup(&[(ENV_ICE_SERVERS, "turn:turn.example.org:3478")]))
            .unwrap_err();
        assert!(matches!(err, RtcError::Config(_)));
    }

    #[test]
    fn garbage_numbers_are_rejected() {
        assert!(RtcConfig::from_lookup(lookup(&[(ENV_ICE_RESTART_DELAY_MS, "soon")])).is_err());
        assert!(RtcConfig::from_lookup(lookup(&[(ENV_QUALITY, "ultra")])).is_err());
    }
}
