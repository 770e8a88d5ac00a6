//! Process-wide teardown.
//!
//! `cleanup()` is the terminal consumer of every allocated resource:
//! live sessions, active phone environments, a mic FIFO this process
//! created and still owns, and the loopback module. It runs at most once
//! per process lifetime no matter
//! how many paths reach it - normal exit, a bubbled error, or a signal
//! arriving mid-shutdown. The one-shot gate is a compare-and-swap; every
//! release it performs is itself idempotent, so a racing second caller
//! that slips past observation sees only no-ops.

use crate::audio;
use crate::devices::DeviceAllocator;
use crate::orchestrator::Orchestrator;
use crate::supervisor::Supervisor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Coordinates the single process-wide teardown pass.
pub struct CleanupCoordinator {
    supervisor: Supervisor,
    orchestrator: Arc<Orchestrator>,
    allocator: Arc<DeviceAllocator>,
    pipe_path: PathBuf,
    /// Raised by the mic path while a FIFO it created has not yet been
    /// handed to the audio subsystem. Only that orphan is reaped here;
    /// a FIFO delivered by an earlier process is left alone.
    pipe_created: Arc<AtomicBool>,
    cancel: CancellationToken,
    /// Whether the loopback module should be unloaded on the way out.
    unload_module: bool,
    ran: AtomicBool,
}

impl CleanupCoordinator {
    pub fn new(
        supervisor: Supervisor,
        orchestrator: Arc<Orchestrator>,
        allocator: Arc<DeviceAllocator>,
        pipe_path: PathBuf,
        pipe_created: Arc<AtomicBool>,
        cancel: CancellationToken,
        unload_module: bool,
    ) -> Self {
        Self {
            supervisor,
            orchestrator,
            allocator,
            pipe_path,
            pipe_created,
            cancel,
            unload_module,
            ran: AtomicBool::new(false),
        }
    }

    /// Run the teardown pass. Reentrant-safe: only the first caller does
    /// the work, later (or concurrent) callers return immediately.
    pub async fn cleanup(&self) {
        if self.ran.swap(true, Ordering::SeqCst) {
            debug!("Cleanup already ran, skipping");
            return;
        }

        info!("Running process-wide cleanup");

        // Stop starting new work first, then stop existing work.
        self.cancel.cancel();

        // Environments first so their sessions come down in the
        // documented reverse order; terminate_all sweeps the rest.
        self.orchestrator.teardown_all().await;
        self.supervisor.terminate_all().await;

        if self.pipe_created.load(Ordering::SeqCst) {
            audio::remove_fifo(&self.pipe_path);
        }

        if self.unload_module {
            self.allocator.unload_pool().await;
        }

        info!("Cleanup complete");
    }
}
