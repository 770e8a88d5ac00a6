//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, MediaConfig, PathsConfig, PhantomConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// Candidates in load order are the system config, the per-user config,
/// and either the `--config` path or the working-directory
/// `phantomcam.toml` (an explicit `--config` replaces the latter). Only
/// candidates that exist are returned.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from("/etc/phantomcam/config.toml")];

    if let Some(dirs) = directories::BaseDirs::new() {
        candidates.push(dirs.config_dir().join("phantomcam/config.toml"));
    }

    match cli_path {
        Some(path) => candidates.push(path.to_path_buf()),
        None => candidates.push(PathBuf::from("phantomcam.toml")),
    }

    candidates.into_iter().filter(|p| p.exists()).collect()
}

/// Load config from a TOML file.
pub fn load_from_file(path: &Path) -> Result<PhantomConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_toml(&contents, path)
}

/// Parse config from TOML string. Profiles stay raw here; validation
/// happens once at the end of the load in `PhantomConfig::load*`.
pub fn parse_toml(contents: &str, path: &Path) -> Result<PhantomConfig, ConfigError> {
    let mut config: PhantomConfig =
        toml::from_str(contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    // Expand ~ in configured paths.
    config.paths.pipe_path = expand_path(&config.paths.pipe_path.to_string_lossy());
    config.paths.sdk_root = expand_path(&config.paths.sdk_root.to_string_lossy());
    config.paths.log_dir = expand_path(&config.paths.log_dir.to_string_lossy());
    config.paths.avd_home = expand_path(&config.paths.avd_home.to_string_lossy());

    Ok(config)
}

/// Merge two configs, with `overlay` taking precedence for any field that
/// differs from the compiled default. Phone profiles merge by name.
pub fn merge_configs(base: PhantomConfig, overlay: PhantomConfig) -> PhantomConfig {
    let media_default = MediaConfig::default();
    let paths_default = PathsConfig::default();

    let mut phones = base.phones;
    for (name, triple) in overlay.phones.raw {
        phones.raw.insert(name, triple);
    }

    PhantomConfig {
        media: MediaConfig {
            resolution: pick(
                overlay.media.resolution,
                base.media.resolution,
                &media_default.resolution,
            ),
            framerate: pick(
                overlay.media.framerate,
                base.media.framerate,
                &media_default.framerate,
            ),
            video_bitrate_kbps: pick(
                overlay.media.video_bitrate_kbps,
                base.media.video_bitrate_kbps,
                &media_default.video_bitrate_kbps,
            ),
            sample_rate: pick(
                overlay.media.sample_rate,
                base.media.sample_rate,
                &media_default.sample_rate,
            ),
            channels: pick(
                overlay.media.channels,
                base.media.channels,
                &media_default.channels,
            ),
        },
        paths: PathsConfig {
            pipe_path: pick(
                overlay.paths.pipe_path,
                base.paths.pipe_path,
                &paths_default.pipe_path,
            ),
            sdk_root: pick(
                overlay.paths.sdk_root,
                base.paths.sdk_root,
                &paths_default.sdk_root,
            ),
            log_dir: pick(
                overlay.paths.log_dir,
                base.paths.log_dir,
                &paths_default.log_dir,
            ),
            avd_home: pick(
                overlay.paths.avd_home,
                base.paths.avd_home,
                &paths_default.avd_home,
            ),
        },
        phones,
    }
}

/// Overlay wins when it moved off the default.
fn pick<T: PartialEq + Clone>(overlay: T, base: T, default: &T) -> T {
    if &overlay != default {
        overlay
    } else {
        base
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut PhantomConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("PHANTOMCAM_RESOLUTION") {
        config.media.resolution = v;
        sources.env_overrides.push("PHANTOMCAM_RESOLUTION".to_string());
    }
    if let Ok(v) = env::var("PHANTOMCAM_FRAMERATE") {
        if let Ok(fps) = v.parse() {
            config.media.framerate = fps;
            sources.env_overrides.push("PHANTOMCAM_FRAMERATE".to_string());
        }
    }
    if let Ok(v) = env::var("PHANTOMCAM_PIPE_PATH") {
        config.paths.pipe_path = expand_path(&v);
        sources.env_overrides.push("PHANTOMCAM_PIPE_PATH".to_string());
    }
    if let Ok(v) = env::var("PHANTOMCAM_SDK_ROOT") {
        config.paths.sdk_root = expand_path(&v);
        sources.env_overrides.push("PHANTOMCAM_SDK_ROOT".to_string());
    }
    // ANDROID_HOME is the conventional SDK location variable
    if config.paths.sdk_root == PathsConfig::default().sdk_root {
        if let Ok(v) = env::var("ANDROID_HOME") {
            config.paths.sdk_root = expand_path(&v);
            sources.env_overrides.push("ANDROID_HOME".to_string());
        }
    }
    if let Ok(v) = env::var("PHANTOMCAM_LOG_DIR") {
        config.paths.log_dir = expand_path(&v);
        sources.env_overrides.push("PHANTOMCAM_LOG_DIR".to_string());
    }

    // Phone profiles (PHANTOMCAM_PHONE_<NAME>="camera:display:device")
    for (key, value) in env::vars() {
        if let Some(phone_name) = key.strip_prefix("PHANTOMCAM_PHONE_") {
            let phone_key = phone_name.to_lowercase();
            config.phones.raw.insert(phone_key, value);
            sources.env_overrides.push(key);
        }
    }
}

/// Expand a leading `~/` or `$VAR` in a configured path. Unresolvable
/// prefixes (no home directory, unset variable) pass the input through
/// unchanged.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(dirs) = directories::BaseDirs::new() {
            return dirs.home_dir().join(rest);
        }
    } else if let Some(rest) = path.strip_prefix('$') {
        let (var, tail) = match rest.split_once('/') {
            Some((var, tail)) => (var, Some(tail)),
            None => (rest, None),
        };
        if let Ok(value) = env::var(var) {
            let base = PathBuf::from(value);
            return match tail {
                Some(tail) => base.join(tail),
                None => base,
            };
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_path_tilde_avd_home() {
        let expanded = expand_path("~/.android/avd");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.ends_with(".android/avd"));
    }

    #[test]
    fn test_expand_path_env_var_sdk_root() {
        std::env::set_var("PHANTOMCAM_TEST_SDK", "/opt/android-sdk");
        assert_eq!(
            expand_path("$PHANTOMCAM_TEST_SDK/emulator"),
            PathBuf::from("/opt/android-sdk/emulator")
        );
        std::env::remove_var("PHANTOMCAM_TEST_SDK");
    }

    #[test]
    fn test_expand_path_passes_through_unresolvable() {
        assert_eq!(expand_path("/dev/video2"), PathBuf::from("/dev/video2"));
        assert_eq!(
            expand_path("$PHANTOMCAM_UNSET_VAR/mic.pipe"),
            PathBuf::from("$PHANTOMCAM_UNSET_VAR/mic.pipe")
        );
    }

    #[test]
    fn test_discover_includes_cli_override() {
        let dir = tempfile::tempdir().unwrap();
        let cli = dir.path().join("override.toml");
        std::fs::write(&cli, "[media]\nframerate = 15\n").unwrap();

        let files = discover_config_files_with_override(Some(&cli));
        assert_eq!(files.last().unwrap(), &cli);
    }

    #[test]
    fn test_discover_skips_missing_cli_override() {
        let files =
            discover_config_files_with_override(Some(Path::new("/no/such/phantomcam.toml")));
        assert!(!files.iter().any(|p| p.ends_with("phantomcam.toml")));
    }

    #[test]
    fn test_parse_minimal_toml() {
        let toml = r#"
[media]
framerate = 60
"#;
        let config = parse_toml(toml, Path::new("test.toml")).unwrap();
        assert_eq!(config.media.framerate, 60);
        // Other values should be defaults
        assert_eq!(config.media.resolution, "1280x720");
    }

    #[test]
    fn test_parse_full_toml() {
        let toml = r#"
[media]
resolution = "1920x1080"
framerate = 25
sample_rate = 44100

[paths]
pipe_path = "/run/phantom/mic.pipe"

[phones]
phone1 = "webcam1:2:video2"
phone2 = "webcam2:3:video3"
"#;
        let mut config = parse_toml(toml, Path::new("test.toml")).unwrap();
        config.phones.validate().unwrap();

        assert_eq!(config.media.resolution, "1920x1080");
        assert_eq!(config.media.framerate, 25);
        assert_eq!(config.media.sample_rate, 44100);
        assert_eq!(
            config.paths.pipe_path,
            PathBuf::from("/run/phantom/mic.pipe")
        );
        assert_eq!(config.phones.profiles.len(), 2);
        assert_eq!(config.phones.get("phone1").unwrap().display_number, 2);
        assert_eq!(config.phones.get("phone2").unwrap().device_path, "video3");
    }

    #[test]
    fn test_merge_overlay_wins() {
        let base = parse_toml("[media]\nframerate = 25\n", Path::new("base.toml")).unwrap();
        let overlay = parse_toml("[media]\nframerate = 60\n", Path::new("over.toml")).unwrap();
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.media.framerate, 60);
    }

    #[test]
    fn test_merge_base_survives_default_overlay() {
        let base = parse_toml("[media]\nframerate = 25\n", Path::new("base.toml")).unwrap();
        let overlay = parse_toml("", Path::new("over.toml")).unwrap();
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.media.framerate, 25);
    }

    #[test]
    fn test_merge_phones_by_name() {
        let base = parse_toml("[phones]\nphone1 = \"a:1:video1\"\n", Path::new("b.toml")).unwrap();
        let overlay = parse_toml(
            "[phones]\nphone1 = \"b:2:video2\"\nphone2 = \"c:3:video3\"\n",
            Path::new("o.toml"),
        )
        .unwrap();
        let merged = merge_configs(base, overlay);
        assert_eq!(merged.phones.raw.get("phone1").unwrap(), "b:2:video2");
        assert_eq!(merged.phones.raw.len(), 2);
    }
}
