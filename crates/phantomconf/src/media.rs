//! Default media parameters for capture and stream pipelines.
//!
//! These are defaults, not limits: individual commands may override any of
//! them, and the daemon's validation gate is the authority on acceptable
//! ranges. Load-time validation here only rejects values that could never
//! be valid.

use crate::ConfigError;
use serde::{Deserialize, Serialize};

/// Default parameters handed to the external media engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Capture resolution as "WIDTHxHEIGHT".
    /// Default: 1280x720
    #[serde(default = "MediaConfig::default_resolution")]
    pub resolution: String,

    /// Capture frame rate in frames per second.
    /// Default: 30
    #[serde(default = "MediaConfig::default_framerate")]
    pub framerate: u32,

    /// Video bitrate in kbit/s for encoded outputs.
    /// Default: 4096
    #[serde(default = "MediaConfig::default_video_bitrate")]
    pub video_bitrate_kbps: u32,

    /// Audio sample rate in Hz for the virtual microphone.
    /// Default: 48000
    #[serde(default = "MediaConfig::default_sample_rate")]
    pub sample_rate: u32,

    /// Audio channel count for the virtual microphone.
    /// Default: 2
    #[serde(default = "MediaConfig::default_channels")]
    pub channels: u32,
}

impl MediaConfig {
    fn default_resolution() -> String {
        "1280x720".to_string()
    }

    fn default_framerate() -> u32 {
        30
    }

    fn default_video_bitrate() -> u32 {
        4096
    }

    fn default_sample_rate() -> u32 {
        48000
    }

    fn default_channels() -> u32 {
        2
    }

    /// Split the configured resolution into (width, height).
    ///
    /// Returns `None` if the string is not `<int>x<int>` with both
    /// components positive.
    pub fn resolution_parts(&self) -> Option<(u32, u32)> {
        parse_resolution(&self.resolution)
    }

    /// Reject values that could never pass the daemon's validation gate.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if parse_resolution(&self.resolution).is_none() {
            return Err(ConfigError::Parse {
                path: std::path::PathBuf::from("<media>"),
                message: format!(
                    "resolution must be WIDTHxHEIGHT with positive components, got '{}'",
                    self.resolution
                ),
            });
        }
        if self.framerate == 0 {
            return Err(ConfigError::Parse {
                path: std::path::PathBuf::from("<media>"),
                message: "framerate must be positive".to_string(),
            });
        }
        Ok(())
    }
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            resolution: Self::default_resolution(),
            framerate: Self::default_framerate(),
            video_bitrate_kbps: Self::default_video_bitrate(),
            sample_rate: Self::default_sample_rate(),
            channels: Self::default_channels(),
        }
    }
}

/// Parse "WIDTHxHEIGHT" into positive components.
pub fn parse_resolution(s: &str) -> Option<(u32, u32)> {
    let (w, h) = s.split_once('x')?;
    let w: u32 = w.parse().ok()?;
    let h: u32 = h.parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_resolution_accepts() {
        assert_eq!(parse_resolution("1280x720"), Some((1280, 720)));
        assert_eq!(parse_resolution("1x1"), Some((1, 1)));
    }

    #[test]
    fn test_parse_resolution_rejects() {
        assert_eq!(parse_resolution("1280"), None);
        assert_eq!(parse_resolution("0x720"), None);
        assert_eq!(parse_resolution("1280x0"), None);
        assert_eq!(parse_resolution("-1x720"), None);
        assert_eq!(parse_resolution("axb"), None);
        assert_eq!(parse_resolution("1280x720x3"), None);
    }

    #[test]
    fn test_default_validates() {
        MediaConfig::default().validate().unwrap();
    }
}
