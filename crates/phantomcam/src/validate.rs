//! Pre-flight validation gate.
//!
//! Pure predicates over proposed parameters and observed system state.
//! Nothing here reserves anything: `check_system_resources` refuses to
//! start new work under pressure at call time, it does not guarantee the
//! pressure stays away afterwards.

use crate::error::{PhantomError, Result};
use std::path::{Path, PathBuf};

pub use phantomconf::media::parse_resolution;

/// Frame rate bounds accepted by the capture pipelines.
pub const MIN_FRAMERATE: u32 = 1;
pub const MAX_FRAMERATE: u32 = 120;

/// Validate a "WIDTHxHEIGHT" resolution string.
pub fn validate_resolution(resolution: &str) -> Result<(u32, u32)> {
    parse_resolution(resolution).ok_or_else(|| PhantomError::InvalidParameter {
        what: "resolution",
        value: resolution.to_string(),
    })
}

/// Validate a frame rate against [MIN_FRAMERATE, MAX_FRAMERATE].
pub fn validate_framerate(framerate: u32) -> Result<u32> {
    if (MIN_FRAMERATE..=MAX_FRAMERATE).contains(&framerate) {
        Ok(framerate)
    } else {
        Err(PhantomError::InvalidParameter {
            what: "framerate",
            value: framerate.to_string(),
        })
    }
}

/// Validate that a device node exists right now; returns the path back.
pub fn validate_device(path: &Path) -> Result<PathBuf> {
    if path.exists() {
        Ok(path.to_path_buf())
    } else {
        Err(PhantomError::DeviceNotFound(path.to_path_buf()))
    }
}

/// Refuse to start new work if free memory or load average look too tight.
///
/// `max_load_pct` is the 1-minute load average expressed as a percentage
/// of the online CPU count.
pub fn check_system_resources(min_memory_mb: u64, max_load_pct: u32) -> Result<()> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").map_err(|e| PhantomError::Io {
        action: "reading /proc/meminfo",
        source: e,
    })?;
    let loadavg = std::fs::read_to_string("/proc/loadavg").map_err(|e| PhantomError::Io {
        action: "reading /proc/loadavg",
        source: e,
    })?;
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    check_resource_thresholds(&meminfo, &loadavg, cpus, min_memory_mb, max_load_pct)
}

/// Threshold logic split out so it is testable on captured /proc content.
pub(crate) fn check_resource_thresholds(
    meminfo: &str,
    loadavg: &str,
    cpus: usize,
    min_memory_mb: u64,
    max_load_pct: u32,
) -> Result<()> {
    let available_mb = parse_mem_available_mb(meminfo).ok_or_else(|| PhantomError::Io {
        action: "parsing /proc/meminfo",
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no MemAvailable line"),
    })?;

    if available_mb < min_memory_mb {
        return Err(PhantomError::ResourceExhausted(format!(
            "{}MB available, {}MB required",
            available_mb, min_memory_mb
        )));
    }

    let load_1m = parse_load_1m(loadavg).ok_or_else(|| PhantomError::Io {
        action: "parsing /proc/loadavg",
        source: std::io::Error::new(std::io::ErrorKind::InvalidData, "no load figure"),
    })?;

    let load_pct = (load_1m / cpus as f64) * 100.0;
    if load_pct > max_load_pct as f64 {
        return Err(PhantomError::ResourceExhausted(format!(
            "load {:.0}% of {} cpus, limit {}%",
            load_pct, cpus, max_load_pct
        )));
    }

    Ok(())
}

fn parse_mem_available_mb(meminfo: &str) -> Option<u64> {
    meminfo
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb / 1024)
}

fn parse_load_1m(loadavg: &str) -> Option<f64> {
    loadavg.split_whitespace().next()?.parse().ok()
}

/// Verify every named external tool resolves on PATH.
///
/// Reports all missing tools at once so the operator fixes them in one
/// round, not one failure at a time.
pub fn check_required_tools<S: AsRef<str>>(tools: &[S]) -> Result<()> {
    let missing: Vec<String> = tools
        .iter()
        .map(|t| t.as_ref())
        .filter(|t| which(t).is_none())
        .map(String::from)
        .collect();

    if missing.is_empty() {
        Ok(())
    } else {
        Err(PhantomError::MissingDependency { tools: missing })
    }
}

/// Resolve a tool name on PATH, like the shell would. Names containing a
/// path separator are checked directly instead of searched.
pub fn which(tool: &str) -> Option<PathBuf> {
    if tool.contains('/') {
        let path = PathBuf::from(tool);
        return is_executable(&path).then_some(path);
    }
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(tool);
        if is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
