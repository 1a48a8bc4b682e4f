//! Outgoing video quality policy.
//!
//! Presets translate to a max bitrate and a max framerate that are pushed
//! straight into each video sender's encoding parameters. No renegotiation
//! is involved.

use crate::error::{Result, RtcError};
use crate::media::TrackKind;
use crate::peer::connection::MediaSender;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{debug, info};

/// Lowest bitrate a preset can be clamped to (bits/sec).
const MIN_VIDEO_BITRATE: u32 = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityPreset {
    Low,
    Medium,
    High,
}

impl QualityPreset {
    pub fn target(&self) -> EncodingParams {
        match self {
            Self::Low => EncodingParams {
                max_bitrate: 250_000,
                max_framerate: 15,
            },
            Self::Medium => EncodingParams {
                max_bitrate: 600_000,
                max_framerate: 24,
            },
            Self::High => EncodingParams {
                max_bitrate: 1_500_000,
                max_framerate: 30,
            },
        }
    }
}

impl FromStr for QualityPreset {
    type Err = RtcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(RtcError::Config(format!("unknown quality preset '{other}'"))),
        }
    }
}

/// Send-side encoding limits for one video sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodingParams {
    /// Bits per second.
    pub max_bitrate: u32,
    pub max_framerate: u32,
}

pub struct QualityController {
    preset: QualityPreset,
    ceiling: u32,
}

impl QualityController {
    pub fn new(preset: QualityPreset, ceiling: u32) -> Self {
        Self {
            preset,
            ceiling: ceiling.max(MIN_VIDEO_BITRATE),
        }
    }

    pub fn preset(&self) -> QualityPreset {
        self.preset
    }

    /// Parameters for the current preset, capped by the configured ceiling.
    pub fn params(&self) -> EncodingParams {
        let target = self.preset.target();
        EncodingParams {
            max_bitrate: target.max_bitrate.min(self.ceiling),
            max_framerate: target.max_framerate,
        }
    }

    pub fn set_preset(&mut self, preset: QualityPreset) -> EncodingParams {
        self.preset = preset;
        let params = self.params();
        info!(
            ?preset,
            max_bitrate = params.max_bitrate,
            max_framerate = params.max_framerate,
            "quality preset changed"
        );
        params
    }

    /// Writes the current parameters into a sender. Audio senders are left
    /// alone.
    pub async fn apply(&self, sender: &dyn MediaSender) -> Result<()> {
        if sender.kind() != TrackKind::Video {
            return Ok(());
        }
        let params = self.params();
        if sender.encoding() == Some(params) {
            return Ok(());
        }
        sender.set_encoding(params).await?;
        debug!(
            track = ?sender.track_id(),
            max_bitrate = params.max_bitrate,
            max_framerate = params.max_framerate,
            "encoding parameters applied"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use crate::mock::MockSender;

    #[test]
    fn presets_are_ordered() {
        let low = QualityPreset::Low.target();
        let high = QualityPreset::High.target();
        assert!(low.max_bitrate < QualityPreset::Medium.target().max_bitrate);
        assert!(high.max_framerate > low.max_framerate);
    }

    #[test]
    fn ceiling_caps_bitrate() {
        let quality = QualityController::new(QualityPreset::High, 800_000);
        assert_eq!(quality.params().max_bitrate, 800_000);
        assert_eq!(quality.params().max_framerate, 30);
    }

    #[test]
    fn preset_parses_case_insensitively() {
        assert_eq!("HIGH".parse::<QualityPreset>().unwrap(), QualityPreset::High);
        assert!("ultra".parse::<QualityPreset>().is_err());
    }

    #[tokio::test]
    async fn last_preset_wins_on_sender() {
        let mut quality = QualityController::new(QualityPreset::Medium, 2_000_000);
        let sender = MockSender::new(&LocalTrack::new(TrackKind::Video, "cam"));

        quality.set_preset(QualityPreset::Low);
        quality.apply(&sender).await.unwrap();
        quality.set_preset(QualityPreset::High);
        quality.apply(&sender).await.unwrap();

        assert_eq!(sender.encoding(), Some(QualityPreset::High.target()));
    }

    #[tokio::test]
    async fn audio_senders_are_untouched() {
        let quality = QualityController::new(QualityPreset::Low, 2_000_000);
        let sender = MockSender::new(&LocalTrack::new(TrackKind::Audio, "mic"));
        quality.apply(&sender).await.unwrap();
        assert_eq!(sender.encoding(), None);
    }
}
