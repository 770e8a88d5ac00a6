//! Minimal configuration loading for Phantomcam.
//!
//! This crate provides configuration loading with minimal dependencies,
//! designed to be imported by every Phantomcam crate without dragging in
//! the daemon's process-management stack.
//!
//! # Configuration Philosophy
//!
//! Configuration is loaded once at startup and validated all-or-nothing:
//! a single malformed phone profile or unusable path aborts the load, so
//! every later component can trust config values without re-validating
//! them at use time.
//!
//! # Usage
//!
//! ```rust,no_run
//! use phantomconf::PhantomConfig;
//!
//! let config = PhantomConfig::load().expect("Failed to load config");
//!
//! println!("Default resolution: {}", config.media.resolution);
//! for (name, profile) in &config.phones.profiles {
//!     println!("Phone {}: display :{}", name, profile.display_number);
//! }
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/phantomcam/config.toml` (system)
//! 2. `~/.config/phantomcam/config.toml` (user)
//! 3. `./phantomcam.toml` (local override)
//! 4. Environment variables (`PHANTOMCAM_*`)
//!
//! # Example Config
//!
//! ```toml
//! [media]
//! resolution = "1280x720"
//! framerate = 30
//!
//! [paths]
//! pipe_path = "/tmp/phantommic.pipe"
//! sdk_root = "~/Android/Sdk"
//!
//! [phones]
//! phone1 = "webcam1:2:video2"
//! phone2 = "webcam2:3:video3"
//! ```

pub mod loader;
pub mod media;
pub mod paths;
pub mod phones;

pub use loader::{discover_config_files_with_override, ConfigSources};
pub use media::MediaConfig;
pub use paths::PathsConfig;
pub use phones::{PhoneProfile, PhonesConfig};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid phone profile '{name}': {reason}")]
    InvalidProfile { name: String, reason: String },

    #[error("Config path {path} is not usable: {reason}")]
    BadPath { path: PathBuf, reason: String },
}

/// Complete Phantomcam configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhantomConfig {
    /// Default media parameters for capture and stream pipelines.
    #[serde(default)]
    pub media: MediaConfig,

    /// Filesystem paths the daemon depends on.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Named phone-environment profiles.
    #[serde(default)]
    pub phones: PhonesConfig,
}

impl PhantomConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/phantomcam/config.toml`
    /// 3. `~/.config/phantomcam/config.toml`
    /// 4. `./phantomcam.toml`
    /// 5. Environment variables
    ///
    /// Every phone profile is validated before the config is returned;
    /// one bad profile fails the whole load.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration from a specific file path, then apply env overrides.
    ///
    /// If `config_path` is provided, it takes precedence over the local
    /// `./phantomcam.toml` override. System and user configs still load first.
    pub fn load_from(config_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&std::path::Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut config = PhantomConfig::default();

        // Load config files in order
        for path in loader::discover_config_files_with_override(config_path) {
            let file_config = loader::load_from_file(&path)?;
            config = loader::merge_configs(config, file_config);
            sources.files.push(path);
        }

        // Apply environment variable overrides
        loader::apply_env_overrides(&mut config, &mut sources);

        // All-or-nothing: a malformed profile aborts startup here, not at
        // the use site.
        config.phones.validate()?;
        config.media.validate()?;
        config.paths.validate()?;

        Ok((config, sources))
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> String {
        // Build TOML manually for nicer formatting
        let mut output = String::new();

        output.push_str("# Phantomcam Configuration\n\n");

        output.push_str("[media]\n");
        output.push_str(&format!("resolution = \"{}\"\n", self.media.resolution));
        output.push_str(&format!("framerate = {}\n", self.media.framerate));
        output.push_str(&format!(
            "video_bitrate_kbps = {}\n",
            self.media.video_bitrate_kbps
        ));
        output.push_str(&format!("sample_rate = {}\n", self.media.sample_rate));
        output.push_str(&format!("channels = {}\n", self.media.channels));

        output.push_str("\n[paths]\n");
        output.push_str(&format!(
            "pipe_path = \"{}\"\n",
            self.paths.pipe_path.display()
        ));
        output.push_str(&format!(
            "sdk_root = \"{}\"\n",
            self.paths.sdk_root.display()
        ));
        output.push_str(&format!("log_dir = \"{}\"\n", self.paths.log_dir.display()));
        output.push_str(&format!(
            "avd_home = \"{}\"\n",
            self.paths.avd_home.display()
        ));

        output.push_str("\n[phones]\n");
        let mut phones: Vec<_> = self.phones.profiles.iter().collect();
        phones.sort_by_key(|(k, _)| *k);
        for (name, profile) in phones {
            output.push_str(&format!("{} = \"{}\"\n", name, profile.to_triple()));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PhantomConfig::default();
        assert_eq!(config.media.resolution, "1280x720");
        assert_eq!(config.media.framerate, 30);
        assert!(config.phones.profiles.is_empty());
    }

    #[test]
    fn test_to_toml() {
        let mut config = PhantomConfig::default();
        config.phones.profiles.insert(
            "phone1".to_string(),
            PhoneProfile {
                camera_id: "webcam1".to_string(),
                display_number: 2,
                device_path: "video2".to_string(),
            },
        );
        let toml = config.to_toml();
        assert!(toml.contains("[media]"));
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("phone1 = \"webcam1:2:video2\""));
    }
}
