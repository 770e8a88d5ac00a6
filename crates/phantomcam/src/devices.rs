//! Loopback video device allocation.
//!
//! The kernel side is the v4l2loopback module: loaded with a device count
//! and a card label, producing numbered /dev/videoN nodes, unloaded as a
//! whole pool. This module owns the number space on our side of that
//! contract.
//!
//! The bare filesystem scan (`next_free_device`) is deliberately
//! stateless: two callers racing it can see the same answer. Concurrent
//! orchestration paths go through `reserve_free_device`, which closes the
//! check-then-use gap with an in-process reservation set.

use crate::error::{PhantomError, Result};
use phantomconf::PhantomConfig;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Highest device number probed by the free-number scan.
const DEVICE_SCAN_RANGE: u32 = 64;

/// Allocator for loopback video device numbers.
pub struct DeviceAllocator {
    config: Arc<PhantomConfig>,
    /// Directory holding the device nodes. /dev outside of tests.
    dev_dir: PathBuf,
    /// Numbers handed out by `reserve_free_device` and not yet released.
    reserved: Mutex<HashSet<u32>>,
}

impl DeviceAllocator {
    pub fn new(config: Arc<PhantomConfig>) -> Self {
        Self::with_dev_dir(config, PathBuf::from("/dev"))
    }

    /// Test seam: scan an arbitrary directory instead of /dev.
    pub fn with_dev_dir(config: Arc<PhantomConfig>, dev_dir: PathBuf) -> Self {
        Self {
            config,
            dev_dir,
            reserved: Mutex::new(HashSet::new()),
        }
    }

    /// Load the v4l2loopback module with `count` devices tagged `label`.
    ///
    /// Existing incompatible pools are not unloaded first; the modprobe
    /// failure surfaces with its stderr attached.
    pub async fn create_pool(&self, count: u32, label: &str) -> Result<()> {
        info!(pool.count = count, pool.label = %label, "Loading v4l2loopback module");

        let output = Command::new("modprobe")
            .arg("v4l2loopback")
            .arg(format!("devices={}", count))
            .arg(format!("card_label={}", label))
            .arg("exclusive_caps=1")
            .output()
            .await
            .map_err(|e| PhantomError::Io {
                action: "running modprobe",
                source: e,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PhantomError::Allocation(format!(
                "modprobe v4l2loopback exited {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        info!(pool.count = count, "Loopback pool ready");
        Ok(())
    }

    /// Unload the whole loopback pool. Best-effort: failures are logged,
    /// not propagated, because this runs on cleanup paths.
    pub async fn unload_pool(&self) {
        debug!("Unloading v4l2loopback module");
        match Command::new("modprobe")
            .arg("-r")
            .arg("v4l2loopback")
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                info!("v4l2loopback module unloaded");
            }
            Ok(output) => {
                let stderr = String::from_utf8_lossy(&output.stderr);
                warn!(modprobe.status = %output.status, "Module unload failed: {}", stderr.trim());
            }
            Err(e) => {
                warn!("Could not run modprobe -r: {}", e);
            }
        }
    }

    /// First-fit scan for a device number whose node does not exist.
    ///
    /// Stateless: no reservation happens, and calling this twice without
    /// creating a device in between returns the same answer.
    pub fn next_free_device(&self) -> Result<PathBuf> {
        for n in 0..DEVICE_SCAN_RANGE {
            let path = self.dev_dir.join(format!("video{}", n));
            if !path.exists() {
                return Ok(path);
            }
        }
        Err(PhantomError::NoDeviceAvailable)
    }

    /// Locked scan-and-reserve: concurrent callers get distinct numbers.
    ///
    /// This guards dynamic allocation only, where the device number is
    /// picked at call time. Profile-bound setups use the fixed node named
    /// in configuration and never reserve. The reservation is in-process
    /// bookkeeping only; pair with [`DeviceAllocator::release`] when the
    /// owning session ends.
    pub fn reserve_free_device(&self) -> Result<PathBuf> {
        let mut reserved = self.reserved.lock().unwrap();
        for n in 0..DEVICE_SCAN_RANGE {
            if reserved.contains(&n) {
                continue;
            }
            let path = self.dev_dir.join(format!("video{}", n));
            if !path.exists() {
                reserved.insert(n);
                debug!(device.number = n, "Reserved loopback device number");
                return Ok(path);
            }
        }
        Err(PhantomError::NoDeviceAvailable)
    }

    /// Return a reserved number to the pool. Paths that were never
    /// reserved (profile-bound fixed nodes) are a no-op.
    pub fn release(&self, path: &Path) {
        if let Some(n) = device_number_of(path) {
            let mut reserved = self.reserved.lock().unwrap();
            if reserved.remove(&n) {
                debug!(device.number = n, "Released loopback device number");
            }
        }
    }

    /// Resolve a profile name or literal path to a device node path.
    ///
    /// A leading `/` or an existing-file check marks the input as a
    /// literal path; anything else is looked up as a profile name.
    pub fn resolve(&self, name_or_path: &str) -> Result<PathBuf> {
        if name_or_path.starts_with('/') {
            let path = PathBuf::from(name_or_path);
            return if path.exists() {
                Ok(path)
            } else {
                Err(PhantomError::DeviceNotFound(path))
            };
        }

        if let Some(profile) = self.config.phones.get(name_or_path) {
            return Ok(self.dev_dir.join(&profile.device_path));
        }

        // Bare device name like "video2"
        let path = self.dev_dir.join(name_or_path);
        if path.exists() {
            Ok(path)
        } else {
            Err(PhantomError::DeviceNotFound(path))
        }
    }
}

fn device_number_of(path: &Path) -> Option<u32> {
    path.file_name()?
        .to_str()?
        .strip_prefix("video")?
        .parse()
        .ok()
}
