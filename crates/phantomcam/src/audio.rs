//! Virtual microphone.
//!
//! The mic is a named pipe plus a PulseAudio `module-pipe-source` reading
//! from it. Feeding audio is just another supervised session: the media
//! engine decodes a file into the FIFO as raw PCM.

use crate::error::{PhantomError, Result};
use crate::pipeline::{PipelineRequest, Sink, Source};
use crate::supervisor::{SessionId, Supervisor};
use nix::sys::stat::Mode;
use nix::unistd;
use phantomconf::PhantomConfig;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

const SOURCE_NAME: &str = "phantommic";

/// Virtual microphone backed by a FIFO and a pipe-source module.
///
/// The FIFO outlives the process on purpose: `up` leaves it behind as the
/// mic's backing store until an explicit `down`. The shared `pipe_created`
/// flag is raised only between creating the FIFO and handing it to the
/// audio subsystem, so the cleanup path reaps it on a failed `up` but
/// never deletes a pipe some earlier process delivered.
pub struct VirtualMic {
    config: Arc<PhantomConfig>,
    supervisor: Supervisor,
    pipe_created: Arc<AtomicBool>,
}

impl VirtualMic {
    pub fn new(
        config: Arc<PhantomConfig>,
        supervisor: Supervisor,
        pipe_created: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            supervisor,
            pipe_created,
        }
    }

    pub fn pipe_path(&self) -> &Path {
        &self.config.paths.pipe_path
    }

    /// Create the FIFO (if absent), load the pipe-source module, and make
    /// it the default source. Each part is idempotent.
    pub async fn up(&self) -> Result<()> {
        if ensure_fifo(self.pipe_path())? {
            self.pipe_created.store(true, Ordering::SeqCst);
        }

        let rate = self.config.media.sample_rate;
        let channels = self.config.media.channels;
        info!(mic.pipe = %self.pipe_path().display(), mic.rate = rate,
              "Bringing up virtual microphone");

        run_pactl(&[
            "load-module".to_string(),
            "module-pipe-source".to_string(),
            format!("source_name={}", SOURCE_NAME),
            format!("file={}", self.pipe_path().display()),
            "format=s16le".to_string(),
            format!("rate={}", rate),
            format!("channels={}", channels),
        ])
        .await?;

        // Single idempotent call per the audio subsystem contract.
        run_pactl(&[
            "set-default-source".to_string(),
            SOURCE_NAME.to_string(),
        ])
        .await?;

        // The audio subsystem owns the pipe from here; only `down` reaps it.
        self.pipe_created.store(false, Ordering::SeqCst);
        info!("Virtual microphone ready");
        Ok(())
    }

    /// Decode a media file into the FIFO as a supervised session.
    pub fn feed(&self, file: &Path) -> Result<SessionId> {
        if !file.exists() {
            return Err(PhantomError::InvalidParameter {
                what: "audio file",
                value: file.display().to_string(),
            });
        }

        let request = PipelineRequest::new(
            Source::File {
                path: file.to_path_buf(),
                loop_input: false,
            },
            Sink::Pipe {
                path: self.pipe_path().to_path_buf(),
                sample_rate: self.config.media.sample_rate,
                channels: self.config.media.channels,
            },
        );
        self.supervisor.spawn(
            "mic-feed",
            "ffmpeg",
            &request.to_args(),
            vec![self.pipe_path().to_path_buf()],
        )
    }

    /// Unload the pipe-source module and remove the FIFO. Best-effort:
    /// runs on cleanup paths, so failures are logged, not propagated.
    pub async fn down(&self) {
        debug!("Unloading virtual microphone");
        if let Err(e) = run_pactl(&[
            "unload-module".to_string(),
            "module-pipe-source".to_string(),
        ])
        .await
        {
            warn!("Could not unload pipe-source module: {}", e);
        }
        remove_fifo(self.pipe_path());
        self.pipe_created.store(false, Ordering::SeqCst);
    }
}

/// mkfifo with 0644, tolerating an already-present pipe. Returns whether
/// this call created it.
pub fn ensure_fifo(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PhantomError::Io {
            action: "creating pipe directory",
            source: e,
        })?;
    }
    match unistd::mkfifo(path, Mode::from_bits_truncate(0o644)) {
        Ok(()) => {
            debug!(pipe = %path.display(), "Created named pipe");
            Ok(true)
        }
        // Lost a race with another creator; the pipe is there either way.
        Err(nix::errno::Errno::EEXIST) => Ok(false),
        Err(e) => Err(PhantomError::Io {
            action: "creating named pipe",
            source: std::io::Error::from_raw_os_error(e as i32),
        }),
    }
}

/// Remove the FIFO if present. Missing pipe is the idempotent success case.
pub fn remove_fifo(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(pipe = %path.display(), "Removed named pipe"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(pipe = %path.display(), "Could not remove pipe: {}", e),
    }
}

async fn run_pactl(args: &[String]) -> Result<()> {
    let output = Command::new("pactl")
        .args(args)
        .output()
        .await
        .map_err(|e| PhantomError::Io {
            action: "running pactl",
            source: e,
        })?;

    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(PhantomError::Runtime {
            name: "pactl".to_string(),
            detail: format!("{} ({})", stderr.trim(), output.status),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mic_fixture(pipe: PathBuf) -> VirtualMic {
        let mut config = PhantomConfig::default();
        config.paths.pipe_path = pipe;
        VirtualMic::new(
            Arc::new(config),
            Supervisor::new(),
            Arc::new(AtomicBool::new(false)),
        )
    }

    #[test]
    fn test_ensure_fifo_creates_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let pipe = dir.path().join("mic.pipe");
        assert!(ensure_fifo(&pipe).unwrap());
        assert!(pipe.exists());
        // Second call finds the pipe and reports it did not create it.
        assert!(!ensure_fifo(&pipe).unwrap());
    }

    #[test]
    fn test_remove_fifo_missing_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        remove_fifo(&dir.path().join("never-created.pipe"));
    }

    #[test]
    fn test_feed_rejects_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let mic = mic_fixture(dir.path().join("mic.pipe"));
        let err = mic.feed(Path::new("/no/such/voice.wav")).unwrap_err();
        assert!(matches!(err, PhantomError::InvalidParameter { .. }));
    }
}
