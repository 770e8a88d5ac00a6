//! Filesystem paths the daemon depends on.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem paths for Phantomcam runtime artifacts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Named pipe backing the virtual microphone.
    /// Default: /tmp/phantommic.pipe
    #[serde(default = "PathsConfig::default_pipe_path")]
    pub pipe_path: PathBuf,

    /// Android SDK root, used to locate the emulator binary and AVD homes.
    /// Default: ~/Android/Sdk
    #[serde(default = "PathsConfig::default_sdk_root")]
    pub sdk_root: PathBuf,

    /// Directory for the daemon's log file.
    /// Default: ~/.local/share/phantomcam/logs
    #[serde(default = "PathsConfig::default_log_dir")]
    pub log_dir: PathBuf,

    /// Directory holding AVD definitions.
    /// Default: ~/.android/avd
    #[serde(default = "PathsConfig::default_avd_home")]
    pub avd_home: PathBuf,
}

impl PathsConfig {
    fn default_pipe_path() -> PathBuf {
        PathBuf::from("/tmp/phantommic.pipe")
    }

    fn default_sdk_root() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join("Android/Sdk"))
            .unwrap_or_else(|| PathBuf::from("Android/Sdk"))
    }

    fn default_log_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/phantomcam/logs"))
            .unwrap_or_else(|| PathBuf::from(".local/share/phantomcam/logs"))
    }

    fn default_avd_home() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".android/avd"))
            .unwrap_or_else(|| PathBuf::from(".android/avd"))
    }

    /// Directory for one named AVD under the AVD home.
    pub fn avd_dir(&self, name: &str) -> PathBuf {
        self.avd_home.join(format!("{}.avd", name))
    }

    /// Path to the emulator binary under the SDK root.
    pub fn emulator_bin(&self) -> PathBuf {
        self.sdk_root.join("emulator/emulator")
    }

    /// Check that the configured paths are usable: the pipe location must
    /// not be a directory and the log directory must exist (it is created
    /// here if absent).
    pub fn validate(&self) -> Result<(), crate::ConfigError> {
        if self.pipe_path.is_dir() {
            return Err(crate::ConfigError::BadPath {
                path: self.pipe_path.clone(),
                reason: "pipe path is a directory".to_string(),
            });
        }
        std::fs::create_dir_all(&self.log_dir).map_err(|e| crate::ConfigError::BadPath {
            path: self.log_dir.clone(),
            reason: format!("cannot create log directory: {}", e),
        })?;
        Ok(())
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            pipe_path: Self::default_pipe_path(),
            sdk_root: Self::default_sdk_root(),
            log_dir: Self::default_log_dir(),
            avd_home: Self::default_avd_home(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_absolute_or_home_relative() {
        let paths = PathsConfig::default();
        assert_eq!(paths.pipe_path, PathBuf::from("/tmp/phantommic.pipe"));
        assert!(paths.emulator_bin().ends_with("emulator/emulator"));
    }

    #[test]
    fn test_validate_rejects_directory_pipe_path() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = PathsConfig::default();
        paths.pipe_path = dir.path().to_path_buf();
        paths.log_dir = dir.path().join("logs");
        assert!(paths.validate().is_err());
    }

    #[test]
    fn test_validate_creates_log_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = PathsConfig::default();
        paths.pipe_path = dir.path().join("mic.pipe");
        paths.log_dir = dir.path().join("logs/nested");
        paths.validate().unwrap();
        assert!(paths.log_dir.is_dir());
    }
}
