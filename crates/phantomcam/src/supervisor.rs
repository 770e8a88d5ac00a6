//! Process supervision.
//!
//! Every external process (media engine, nested display, window shell,
//! emulator) runs as a Session: spawned detached in its own process
//! group, registered in a shared store, probed for liveness, and
//! terminated by group signal. The store is the single source of truth
//! the cleanup path enumerates.
//!
//! No session state survives a process restart: a restarted daemon starts
//! from an empty store and does not reattach to prior children.

use crate::error::{PhantomError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lines of stderr retained per session for health checks and diagnostics.
const STDERR_TAIL_LINES: usize = 200;

/// Grace period between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Opaque session identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one supervised process.
///
/// `Starting -> FailedToStart` is terminal; retry policy belongs to the
/// caller, not the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum SessionState {
    Created,
    Starting,
    Healthy,
    Degraded,
    FailedToStart,
    Terminating,
    Terminated,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::FailedToStart | SessionState::Terminated)
    }
}

/// Outcome of a bounded-time health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    FailedToStart { detail: String },
    RuntimeError { detail: String },
}

/// One supervised external process and its tracked lifecycle state.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub name: String,
    pub pid: u32,
    pub devices: Vec<PathBuf>,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub last_health: Option<HealthStatus>,
    /// Exit status recorded by the monitor task once the child exits.
    pub exit_code: Option<i32>,
    /// Rolling tail of the child's error stream.
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl Session {
    /// Snapshot of the retained stderr lines.
    pub fn stderr_lines(&self) -> Vec<String> {
        self.stderr_tail.lock().unwrap().iter().cloned().collect()
    }
}

/// Aggregate counts for periodic statistics logging.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub total: usize,
    pub live: usize,
    pub failed: usize,
    pub terminated: usize,
}

/// Shared registry of sessions.
///
/// DashMap so orchestration tasks and the signal-driven cleanup path can
/// read and write concurrently without a global lock.
#[derive(Clone, Default)]
pub struct SessionStore {
    sessions: Arc<DashMap<SessionId, Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, session: Session) {
        self.sessions.insert(session.id, session);
    }

    pub fn get(&self, id: SessionId) -> Option<Session> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn set_state(&self, id: SessionId, state: SessionState) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            debug!(session.id = %id, session.name = %session.name,
                   from = ?session.state, to = ?state, "Session state change");
            session.state = state;
        }
    }

    fn set_health(&self, id: SessionId, health: HealthStatus) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.last_health = Some(health);
        }
    }

    fn record_exit(&self, id: SessionId, code: Option<i32>) {
        if let Some(mut session) = self.sessions.get_mut(&id) {
            session.exit_code = Some(code.unwrap_or(-1));
            // Exit while Terminating is the requested outcome; any other
            // exit leaves the state for health_check/terminate to classify.
            if session.state == SessionState::Terminating {
                session.state = SessionState::Terminated;
            }
        }
    }

    /// Sessions not yet in a terminal state.
    pub fn live_sessions(&self) -> Vec<Session> {
        self.sessions
            .iter()
            .filter(|s| !s.state.is_terminal())
            .map(|s| s.clone())
            .collect()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = SessionStats::default();
        for s in self.sessions.iter() {
            stats.total += 1;
            match s.state {
                SessionState::FailedToStart => stats.failed += 1,
                SessionState::Terminated => stats.terminated += 1,
                _ => stats.live += 1,
            }
        }
        stats
    }
}

/// Launches and tracks external processes.
#[derive(Clone)]
pub struct Supervisor {
    store: SessionStore,
}

impl Supervisor {
    pub fn new() -> Self {
        Self {
            store: SessionStore::new(),
        }
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    /// Spawn an external process as a new session.
    ///
    /// The child gets its own process group so `terminate` can signal it
    /// and everything it forks in one call. Stderr is piped and tailed by
    /// a monitor task; the same task records the exit status.
    pub fn spawn<S: AsRef<str>>(
        &self,
        name: &str,
        program: &str,
        args: &[S],
        devices: Vec<PathBuf>,
    ) -> Result<SessionId> {
        self.spawn_with_env(name, program, args, &[], devices)
    }

    /// Spawn with extra environment variables (e.g. `DISPLAY` for a
    /// window shell bound to a nested display).
    pub fn spawn_with_env<S: AsRef<str>>(
        &self,
        name: &str,
        program: &str,
        args: &[S],
        envs: &[(&str, String)],
        devices: Vec<PathBuf>,
    ) -> Result<SessionId> {
        let mut command = Command::new(program);
        command
            .args(args.iter().map(|a| a.as_ref()))
            .envs(envs.iter().map(|(k, v)| (*k, v.as_str())))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|e| PhantomError::FailedToStart {
            name: name.to_string(),
            detail: format!("spawn of '{}' failed: {}", program, e),
        })?;

        let pid = child.id().ok_or_else(|| PhantomError::FailedToStart {
            name: name.to_string(),
            detail: "child exited before pid could be read".to_string(),
        })?;

        let id = SessionId::new();
        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));

        let session = Session {
            id,
            name: name.to_string(),
            pid,
            devices,
            started_at: Utc::now(),
            state: SessionState::Starting,
            last_health: None,
            exit_code: None,
            stderr_tail: stderr_tail.clone(),
        };
        self.store.insert(session);

        info!(session.id = %id, session.name = %name, session.pid = pid,
              "Session spawned");

        // Monitor task: owns the child, tails stderr, records the exit.
        let stderr = child.stderr.take();
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Some(stderr) = stderr {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut tail = stderr_tail.lock().unwrap();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
            match child.wait().await {
                Ok(status) => {
                    debug!(session.id = %id, status = %status, "Session process exited");
                    store.record_exit(id, status.code());
                }
                Err(e) => {
                    warn!(session.id = %id, "Wait on session process failed: {}", e);
                    store.record_exit(id, None);
                }
            }
        });

        Ok(id)
    }

    /// Bounded-time liveness and error-stream probe.
    ///
    /// Polls once per second for up to `timeout_secs`. A dead process
    /// inside the window is a launch failure; a live process whose error
    /// stream carries an error marker is a runtime failure. Surviving the
    /// window clean is healthy.
    pub async fn health_check(&self, id: SessionId, timeout_secs: u64) -> Result<HealthStatus> {
        let session = self
            .store
            .get(id)
            .ok_or_else(|| PhantomError::Runtime {
                name: "unknown".to_string(),
                detail: format!("no session {}", id),
            })?;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(timeout_secs);
        loop {
            let current = self.store.get(id).unwrap_or_else(|| session.clone());

            if current.exit_code.is_some() || !process_alive(current.pid) {
                let detail = last_error_line(&current)
                    .unwrap_or_else(|| format!("process {} exited during startup", current.pid));
                let status = HealthStatus::FailedToStart { detail };
                self.store.set_state(id, SessionState::FailedToStart);
                self.store.set_health(id, status.clone());
                warn!(session.id = %id, session.name = %current.name,
                      "Health check: failed to start");
                return Ok(status);
            }

            if let Some(line) = first_marked_error(&current) {
                let status = HealthStatus::RuntimeError { detail: line };
                self.store.set_state(id, SessionState::Degraded);
                self.store.set_health(id, status.clone());
                warn!(session.id = %id, session.name = %current.name,
                      "Health check: runtime error on stderr");
                return Ok(status);
            }

            if tokio::time::Instant::now() >= deadline {
                self.store.set_state(id, SessionState::Healthy);
                self.store.set_health(id, HealthStatus::Healthy);
                debug!(session.id = %id, session.name = %current.name,
                       "Health check: healthy");
                return Ok(HealthStatus::Healthy);
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Terminate a session and everything in its process group.
    ///
    /// Idempotent: unknown ids and already-terminal sessions are a no-op.
    /// SIGTERM first, SIGKILL after a bounded grace period.
    pub async fn terminate(&self, id: SessionId) {
        let session = match self.store.get(id) {
            Some(s) if !s.state.is_terminal() => s,
            _ => return,
        };

        info!(session.id = %id, session.name = %session.name, session.pid = session.pid,
              "Terminating session");
        self.store.set_state(id, SessionState::Terminating);

        let pgid = Pid::from_raw(session.pid as i32);
        // Already-dead group: ESRCH is the idempotent success case.
        let _ = signal::killpg(pgid, Signal::SIGTERM);

        let deadline = tokio::time::Instant::now() + TERM_GRACE;
        while tokio::time::Instant::now() < deadline {
            if self.store.get(id).map(|s| s.exit_code.is_some()).unwrap_or(true)
                || !process_alive(session.pid)
            {
                self.store.set_state(id, SessionState::Terminated);
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        warn!(session.id = %id, session.name = %session.name,
              "Session ignored SIGTERM, sending SIGKILL");
        let _ = signal::killpg(pgid, Signal::SIGKILL);
        self.store.set_state(id, SessionState::Terminated);
    }

    /// Terminate every live session the store still tracks.
    pub async fn terminate_all(&self) {
        let live = self.store.live_sessions();
        if live.is_empty() {
            return;
        }
        info!(sessions.live = live.len(), "Terminating all live sessions");
        for session in live {
            self.terminate(session.id).await;
        }
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

/// kill(pid, 0) liveness probe.
fn process_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// First retained stderr line carrying an error marker.
fn first_marked_error(session: &Session) -> Option<String> {
    session
        .stderr_lines()
        .into_iter()
        .find(|l| has_error_marker(l))
}

/// Most recent stderr line, for failure diagnostics.
fn last_error_line(session: &Session) -> Option<String> {
    session.stderr_lines().into_iter().next_back()
}

/// The external engines write human-readable errors to stderr; these are
/// the observable shapes (ffmpeg, Xephyr, pactl).
fn has_error_marker(line: &str) -> bool {
    let trimmed = line.trim_start();
    trimmed.starts_with("Error")
        || trimmed.starts_with("error:")
        || trimmed.contains("Operation not permitted")
        || trimmed.contains("Device or resource busy")
        || trimmed.contains("No such file or directory")
}
