//! Named phone-environment profiles.
//!
//! Profiles are written in config files as compact `camera:display:device`
//! triples and parsed into a typed record exactly once, at load time. The
//! rest of the system only ever sees the validated struct.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One phone-emulation environment binding.
///
/// Wire form is `"webcam1:2:video2"`: the virtual camera identifier, the
/// nested display number, and the loopback device name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhoneProfile {
    /// Virtual camera identifier presented to the emulator.
    pub camera_id: String,
    /// Nested X display number (`:2` for `2`). Must be positive.
    pub display_number: u32,
    /// Loopback device name, strictly `video<N>`.
    pub device_path: String,
}

impl PhoneProfile {
    /// Parse the `camera:display:device` wire form.
    pub fn parse(name: &str, triple: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::InvalidProfile {
            name: name.to_string(),
            reason,
        };

        let parts: Vec<&str> = triple.split(':').collect();
        if parts.len() != 3 {
            return Err(invalid(format!(
                "expected camera:display:device, got '{}'",
                triple
            )));
        }

        let camera_id = parts[0].trim();
        if camera_id.is_empty() {
            return Err(invalid("camera id is empty".to_string()));
        }

        let display_number: u32 = parts[1]
            .trim()
            .parse()
            .map_err(|_| invalid(format!("display number '{}' is not an integer", parts[1])))?;
        if display_number == 0 {
            return Err(invalid("display number must be positive".to_string()));
        }

        let device_path = parts[2].trim();
        device_number(device_path)
            .ok_or_else(|| invalid(format!("device '{}' does not match video<N>", parts[2])))?;

        Ok(Self {
            camera_id: camera_id.to_string(),
            display_number,
            device_path: device_path.to_string(),
        })
    }

    /// The numeric suffix of the loopback device name.
    pub fn device_number(&self) -> u32 {
        // Safe: enforced by parse().
        device_number(&self.device_path).unwrap_or(0)
    }

    /// Absolute device node path, e.g. `/dev/video2`.
    pub fn device_node(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(format!("/dev/{}", self.device_path))
    }

    /// Back to the compact wire form.
    pub fn to_triple(&self) -> String {
        format!(
            "{}:{}:{}",
            self.camera_id, self.display_number, self.device_path
        )
    }
}

/// Strict `video<N>` check; returns the number.
fn device_number(device: &str) -> Option<u32> {
    let digits = device.strip_prefix("video")?;
    if digits.is_empty() {
        return None;
    }
    digits.parse().ok()
}

/// All configured phone profiles, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PhonesConfig {
    /// Raw triples as written in the config file. Kept so `load` can
    /// report the offending text on failure.
    #[serde(flatten)]
    pub raw: HashMap<String, String>,

    /// Parsed profiles, populated by [`PhonesConfig::validate`].
    #[serde(skip)]
    pub profiles: HashMap<String, PhoneProfile>,
}

impl PhonesConfig {
    /// Parse and validate every raw triple. All-or-nothing: the first bad
    /// profile fails the load.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for (name, triple) in &self.raw {
            let profile = PhoneProfile::parse(name, triple)?;
            self.profiles.insert(name.clone(), profile);
        }
        Ok(())
    }

    /// Look up a profile by name.
    pub fn get(&self, name: &str) -> Option<&PhoneProfile> {
        self.profiles.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_valid_triple() {
        let p = PhoneProfile::parse("phone1", "webcam1:2:video2").unwrap();
        assert_eq!(p.camera_id, "webcam1");
        assert_eq!(p.display_number, 2);
        assert_eq!(p.device_path, "video2");
        assert_eq!(p.device_number(), 2);
        assert_eq!(p.device_node(), std::path::PathBuf::from("/dev/video2"));
    }

    #[test]
    fn test_parse_rejects_wrong_arity() {
        assert!(PhoneProfile::parse("p", "webcam1:2").is_err());
        assert!(PhoneProfile::parse("p", "a:b:c:d").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_display() {
        assert!(PhoneProfile::parse("p", "webcam1:zero:video2").is_err());
        assert!(PhoneProfile::parse("p", "webcam1:0:video2").is_err());
    }

    #[test]
    fn test_parse_rejects_bad_device() {
        assert!(PhoneProfile::parse("p", "webcam1:2:vid2").is_err());
        assert!(PhoneProfile::parse("p", "webcam1:2:video").is_err());
        assert!(PhoneProfile::parse("p", "webcam1:2:videoX").is_err());
    }

    #[test]
    fn test_parse_rejects_empty_camera() {
        assert!(PhoneProfile::parse("p", ":2:video2").is_err());
    }

    #[test]
    fn test_validate_all_or_nothing() {
        let mut phones = PhonesConfig::default();
        phones
            .raw
            .insert("good".to_string(), "webcam1:2:video2".to_string());
        phones.raw.insert("bad".to_string(), "nope".to_string());
        assert!(phones.validate().is_err());
    }

    #[test]
    fn test_round_trip() {
        let p = PhoneProfile::parse("p", "webcam3:11:video11").unwrap();
        assert_eq!(p.to_triple(), "webcam3:11:video11");
    }
}
