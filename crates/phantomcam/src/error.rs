//! Error taxonomy for the provisioning and supervision layer.
//!
//! Validation and allocation failures are returned to the immediate
//! caller; only an unhandled bubbling failure or an explicit termination
//! request reaches the process-wide cleanup path.

use std::path::PathBuf;
use thiserror::Error;

/// All failure kinds the core components can produce.
#[derive(Debug, Error)]
pub enum PhantomError {
    #[error("Invalid {what}: '{value}'")]
    InvalidParameter { what: &'static str, value: String },

    #[error("Device not found: {0}")]
    DeviceNotFound(PathBuf),

    #[error("No free loopback device number in the scan range")]
    NoDeviceAvailable,

    #[error("Device allocation failed: {0}")]
    Allocation(String),

    #[error("Missing required tools: {}", tools.join(", "))]
    MissingDependency { tools: Vec<String> },

    #[error("System resources exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Process '{name}' failed to start: {detail}")]
    FailedToStart { name: String, detail: String },

    #[error("Process '{name}' runtime error: {detail}")]
    Runtime { name: String, detail: String },

    #[error("Setup of '{profile}' failed at step '{step}': {source}")]
    Setup {
        profile: String,
        step: &'static str,
        #[source]
        source: Box<PhantomError>,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] phantomconf::ConfigError),

    #[error("I/O error during {action}: {source}")]
    Io {
        action: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl PhantomError {
    /// Wrap a failure with the orchestration step it happened in.
    pub fn at_step(self, profile: &str, step: &'static str) -> Self {
        PhantomError::Setup {
            profile: profile.to_string(),
            step,
            source: Box::new(self),
        }
    }

    /// Process exit code for a top-level failure of this kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            PhantomError::InvalidParameter { .. } => 2,
            PhantomError::DeviceNotFound(_) | PhantomError::NoDeviceAvailable => 3,
            PhantomError::Allocation(_) => 4,
            PhantomError::MissingDependency { .. } => 5,
            PhantomError::ResourceExhausted(_) => 6,
            PhantomError::FailedToStart { .. } => 7,
            PhantomError::Runtime { .. } => 8,
            PhantomError::Setup { source, .. } => source.exit_code(),
            PhantomError::Config(_) => 9,
            PhantomError::Io { .. } => 10,
        }
    }
}

pub type Result<T> = std::result::Result<T, PhantomError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_wraps_and_keeps_inner_exit_code() {
        let inner = PhantomError::FailedToStart {
            name: "Xephyr".to_string(),
            detail: "exited immediately".to_string(),
        };
        let wrapped = inner.at_step("phone1", "display");
        assert_eq!(wrapped.exit_code(), 7);
        let msg = wrapped.to_string();
        assert!(msg.contains("phone1"));
        assert!(msg.contains("display"));
    }

    #[test]
    fn test_missing_dependency_lists_all_tools() {
        let err = PhantomError::MissingDependency {
            tools: vec!["ffmpeg".to_string(), "Xephyr".to_string()],
        };
        assert!(err.to_string().contains("ffmpeg, Xephyr"));
    }
}
