//! Phone-environment orchestration.
//!
//! A phone environment composes three sessions against one profile:
//! nested display -> window shell -> capture pipeline into the profile's
//! loopback device. Creation is strictly in that order, teardown strictly
//! in reverse, and setup is always teardown-then-create so a profile name
//! never has two live environments.

use crate::devices::DeviceAllocator;
use crate::error::{PhantomError, Result};
use crate::pipeline::{PipelineRequest, Sink, Source};
use crate::supervisor::{HealthStatus, SessionId, Supervisor};
use crate::validate;
use futures::future::join_all;
use phantomconf::{PhantomConfig, PhoneProfile};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// External binaries the orchestrator drives. Overridable for tests.
#[derive(Debug, Clone)]
pub struct Toolchain {
    pub display_server: String,
    pub window_shell: String,
    pub media_engine: String,
}

impl Default for Toolchain {
    fn default() -> Self {
        Self {
            display_server: "Xephyr".to_string(),
            window_shell: "openbox".to_string(),
            media_engine: "ffmpeg".to_string(),
        }
    }
}

/// The composite of nested display + shell + capture bound to one profile.
#[derive(Debug, Clone)]
pub struct PhoneEnvironment {
    pub profile_name: String,
    pub profile: PhoneProfile,
    pub device: PathBuf,
    pub display: SessionId,
    pub shell: Option<SessionId>,
    pub capture: Option<SessionId>,
}

impl PhoneEnvironment {
    /// Session ids in teardown order: capture, shell, display.
    fn sessions_reverse(&self) -> Vec<SessionId> {
        let mut ids = Vec::new();
        if let Some(id) = self.capture {
            ids.push(id);
        }
        if let Some(id) = self.shell {
            ids.push(id);
        }
        ids.push(self.display);
        ids
    }
}

/// Composes the device allocator and the supervisor into whole
/// environments, and tracks which ones are active.
pub struct Orchestrator {
    config: Arc<PhantomConfig>,
    supervisor: Supervisor,
    allocator: Arc<DeviceAllocator>,
    toolchain: Toolchain,
    cancel: CancellationToken,
    environments: Mutex<HashMap<String, PhoneEnvironment>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<PhantomConfig>,
        supervisor: Supervisor,
        allocator: Arc<DeviceAllocator>,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_toolchain(config, supervisor, allocator, cancel, Toolchain::default())
    }

    pub fn with_toolchain(
        config: Arc<PhantomConfig>,
        supervisor: Supervisor,
        allocator: Arc<DeviceAllocator>,
        cancel: CancellationToken,
        toolchain: Toolchain,
    ) -> Self {
        Self {
            config,
            supervisor,
            allocator,
            toolchain,
            cancel,
            environments: Mutex::new(HashMap::new()),
        }
    }

    /// Stand up the environment for a named profile.
    ///
    /// Any existing environment under the same name is torn down first.
    /// A failure at any step tears down whatever subset already started
    /// and surfaces as a Setup error naming the step; nothing
    /// partially-initialized stays active.
    pub async fn setup(&self, profile_name: &str) -> Result<PhoneEnvironment> {
        let profile = self.validate_profile(profile_name)?;

        // Idempotent re-creation, never setup on top of setup.
        self.teardown(profile_name).await;

        self.step_gate(profile_name, "device")?;
        let device = validate::validate_device(&self.allocator.resolve(&profile.device_path)?)
            .map_err(|e| e.at_step(profile_name, "device"))?;

        info!(phone.profile = %profile_name, phone.display = profile.display_number,
              phone.device = %device.display(), "Setting up phone environment");

        // Display -> shell -> capture, health-checked at each step.
        self.step_gate(profile_name, "display")?;
        let display = match self.start_display(profile_name, &profile).await {
            Ok(id) => id,
            Err(e) => return Err(e.at_step(profile_name, "display")),
        };

        let mut env = PhoneEnvironment {
            profile_name: profile_name.to_string(),
            profile: profile.clone(),
            device: device.clone(),
            display,
            shell: None,
            capture: None,
        };

        if let Err(e) = self.step_gate(profile_name, "shell") {
            self.teardown_partial(&env).await;
            return Err(e);
        }
        match self.start_shell(profile_name, &profile).await {
            Ok(id) => env.shell = Some(id),
            Err(e) => {
                self.teardown_partial(&env).await;
                return Err(e.at_step(profile_name, "shell"));
            }
        }

        if let Err(e) = self.step_gate(profile_name, "capture") {
            self.teardown_partial(&env).await;
            return Err(e);
        }
        match self.start_capture(profile_name, &profile, &device).await {
            Ok(id) => env.capture = Some(id),
            Err(e) => {
                self.teardown_partial(&env).await;
                return Err(e.at_step(profile_name, "capture"));
            }
        }

        let previous = {
            let mut environments = self.environments.lock().unwrap();
            environments.insert(profile_name.to_string(), env.clone())
        };
        // A racing setup for the same name slipped in between our
        // teardown and insert; its sessions must not leak.
        if let Some(previous) = previous {
            warn!(phone.profile = %profile_name,
                  "Replacing concurrently-created environment");
            self.teardown_partial(&previous).await;
        }

        info!(phone.profile = %profile_name, "Phone environment up");
        Ok(env)
    }

    /// Tear down a named environment: capture, then shell, then display.
    ///
    /// Safe to call when the environment (or any of its sessions) never
    /// existed.
    pub async fn teardown(&self, profile_name: &str) {
        let env = {
            let mut environments = self.environments.lock().unwrap();
            environments.remove(profile_name)
        };

        let Some(env) = env else {
            return;
        };

        info!(phone.profile = %profile_name, "Tearing down phone environment");
        self.teardown_partial(&env).await;
    }

    /// Fan out `setup` across profiles concurrently.
    ///
    /// Every profile reaches a terminal start state before this returns;
    /// one profile's failure does not cancel the others.
    pub async fn launch_many(
        &self,
        profile_names: &[String],
    ) -> Vec<(String, Result<PhoneEnvironment>)> {
        let setups = profile_names.iter().map(|name| async move {
            let outcome = self.setup(name).await;
            (name.clone(), outcome)
        });
        join_all(setups).await
    }

    /// Names of environments currently considered active.
    pub fn active_environments(&self) -> Vec<String> {
        self.environments.lock().unwrap().keys().cloned().collect()
    }

    /// Tear down every active environment. Used by the cleanup path.
    pub async fn teardown_all(&self) {
        for name in self.active_environments() {
            self.teardown(&name).await;
        }
    }

    fn validate_profile(&self, profile_name: &str) -> Result<PhoneProfile> {
        let profile = self
            .config
            .phones
            .get(profile_name)
            .cloned()
            .ok_or_else(|| {
                PhantomError::InvalidParameter {
                    what: "profile",
                    value: profile_name.to_string(),
                }
                .at_step(profile_name, "validate")
            })?;

        validate::check_required_tools(&[
            self.toolchain.display_server.as_str(),
            self.toolchain.window_shell.as_str(),
            self.toolchain.media_engine.as_str(),
        ])
        .map_err(|e| e.at_step(profile_name, "validate"))?;

        let emulator = self.config.paths.emulator_bin();
        if !emulator.is_file() {
            return Err(PhantomError::MissingDependency {
                tools: vec![emulator.display().to_string()],
            }
            .at_step(profile_name, "validate"));
        }

        let avd_dir = self.config.paths.avd_dir(profile_name);
        if !avd_dir.is_dir() {
            return Err(PhantomError::InvalidParameter {
                what: "AVD directory",
                value: avd_dir.display().to_string(),
            }
            .at_step(profile_name, "validate"));
        }

        Ok(profile)
    }

    /// No new step starts once cancellation has been observed.
    fn step_gate(&self, profile_name: &str, step: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            Err(PhantomError::Runtime {
                name: "orchestrator".to_string(),
                detail: "shutdown requested".to_string(),
            }
            .at_step(profile_name, step))
        } else {
            Ok(())
        }
    }

    async fn start_display(&self, profile_name: &str, profile: &PhoneProfile) -> Result<SessionId> {
        let resolution = &self.config.media.resolution;
        let args = vec![
            format!(":{}", profile.display_number),
            "-screen".to_string(),
            resolution.clone(),
            "-nolisten".to_string(),
            "tcp".to_string(),
        ];
        let id = self.supervisor.spawn(
            &format!("{}-display", profile_name),
            &self.toolchain.display_server,
            &args,
            vec![],
        )?;
        self.expect_healthy(id, 2).await?;
        Ok(id)
    }

    async fn start_shell(&self, profile_name: &str, profile: &PhoneProfile) -> Result<SessionId> {
        let id = self.supervisor.spawn_with_env(
            &format!("{}-shell", profile_name),
            &self.toolchain.window_shell,
            &[] as &[&str],
            &[("DISPLAY", format!(":{}", profile.display_number))],
            vec![],
        )?;
        self.expect_healthy(id, 1).await?;
        Ok(id)
    }

    async fn start_capture(
        &self,
        profile_name: &str,
        profile: &PhoneProfile,
        device: &Path,
    ) -> Result<SessionId> {
        let (width, height) = self
            .config
            .media
            .resolution_parts()
            .unwrap_or((1280, 720));
        let request = PipelineRequest::new(
            Source::Display {
                display: profile.display_number,
                width,
                height,
                framerate: self.config.media.framerate,
            },
            Sink::V4l2(device.to_path_buf()),
        );
        let id = self.supervisor.spawn(
            &format!("{}-capture", profile_name),
            &self.toolchain.media_engine,
            &request.to_args(),
            vec![device.to_path_buf()],
        )?;
        self.expect_healthy(id, 2).await?;
        Ok(id)
    }

    async fn expect_healthy(&self, id: SessionId, timeout_secs: u64) -> Result<()> {
        match self.supervisor.health_check(id, timeout_secs).await? {
            HealthStatus::Healthy => Ok(()),
            HealthStatus::FailedToStart { detail } => {
                let name = self
                    .supervisor
                    .store()
                    .get(id)
                    .map(|s| s.name)
                    .unwrap_or_default();
                Err(PhantomError::FailedToStart { name, detail })
            }
            HealthStatus::RuntimeError { detail } => {
                let name = self
                    .supervisor
                    .store()
                    .get(id)
                    .map(|s| s.name)
                    .unwrap_or_default();
                Err(PhantomError::Runtime { name, detail })
            }
        }
    }

    /// Terminate whatever subset of an environment exists, in reverse
    /// creation order, and release its device number.
    async fn teardown_partial(&self, env: &PhoneEnvironment) {
        for id in env.sessions_reverse() {
            self.supervisor.terminate(id).await;
        }
        self.allocator.release(&env.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::SessionState;
    use std::path::Path;

    /// Build an orchestrator whose toolchain is plain `sleep`-style
    /// binaries and whose device/AVD trees live in a tempdir.
    fn test_fixture(dir: &Path) -> Orchestrator {
        let mut config = PhantomConfig::default();
        config.paths.avd_home = dir.join("avd");
        config.paths.sdk_root = dir.join("sdk");
        std::fs::create_dir_all(dir.join("sdk/emulator")).unwrap();
        std::fs::write(dir.join("sdk/emulator/emulator"), b"").unwrap();
        config.phones.profiles.insert(
            "phone1".to_string(),
            PhoneProfile {
                camera_id: "webcam1".to_string(),
                display_number: 2,
                device_path: "video2".to_string(),
            },
        );
        config.phones.profiles.insert(
            "phone2".to_string(),
            PhoneProfile {
                camera_id: "webcam2".to_string(),
                display_number: 3,
                device_path: "video3".to_string(),
            },
        );
        let config = Arc::new(config);

        // Loopback nodes for both profiles, AVD dir only for phone1.
        let dev_dir = dir.join("dev");
        std::fs::create_dir_all(&dev_dir).unwrap();
        std::fs::write(dev_dir.join("video2"), b"").unwrap();
        std::fs::write(dev_dir.join("video3"), b"").unwrap();
        std::fs::create_dir_all(dir.join("avd/phone1.avd")).unwrap();

        let allocator = Arc::new(DeviceAllocator::with_dev_dir(config.clone(), dev_dir));

        // Fake toolchain: one script that ignores its arguments and stays
        // alive long enough to pass health checks.
        let fake_tool = dir.join("fake-tool");
        std::fs::write(&fake_tool, "#!/bin/sh\nsleep 30\n").unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&fake_tool, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        let fake = fake_tool.to_string_lossy().into_owned();
        let toolchain = Toolchain {
            display_server: fake.clone(),
            window_shell: fake.clone(),
            media_engine: fake,
        };
        Orchestrator::with_toolchain(
            config,
            Supervisor::new(),
            allocator,
            CancellationToken::new(),
            toolchain,
        )
    }

    #[tokio::test]
    async fn test_teardown_of_never_setup_profile_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());
        orch.teardown("phone1").await;
        orch.teardown("no-such-profile").await;
        assert!(orch.active_environments().is_empty());
    }

    #[tokio::test]
    async fn test_setup_unknown_profile_is_setup_error() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());
        let err = orch.setup("ghost").await.unwrap_err();
        match err {
            PhantomError::Setup { profile, step, .. } => {
                assert_eq!(profile, "ghost");
                assert_eq!(step, "validate");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_setup_missing_avd_dir_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());
        // phone2 has no AVD directory in the fixture
        let err = orch.setup("phone2").await.unwrap_err();
        match err {
            PhantomError::Setup { step, .. } => assert_eq!(step, "validate"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_setup_then_teardown_leaves_nothing_live() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());

        let env = orch.setup("phone1").await.unwrap();
        assert_eq!(env.device, dir.path().join("dev/video2"));
        assert!(env.shell.is_some());
        assert!(env.capture.is_some());
        assert_eq!(orch.active_environments(), vec!["phone1".to_string()]);

        orch.teardown("phone1").await;
        assert!(orch.active_environments().is_empty());
        let stats = orch.supervisor.store().stats();
        assert_eq!(stats.live, 0);
    }

    #[tokio::test]
    async fn test_double_setup_replaces_not_stacks() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());

        let first = orch.setup("phone1").await.unwrap();
        let second = orch.setup("phone1").await.unwrap();
        assert_ne!(first.display, second.display);

        // The first environment's display session must be gone.
        let first_display = orch.supervisor.store().get(first.display).unwrap();
        assert_eq!(first_display.state, SessionState::Terminated);

        // Exactly one environment active, and only its sessions live.
        assert_eq!(orch.active_environments().len(), 1);
        let live = orch.supervisor.store().live_sessions();
        assert_eq!(live.len(), 3);
        orch.teardown_all().await;
    }

    #[tokio::test]
    async fn test_launch_many_isolates_failures() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());

        let outcomes = orch
            .launch_many(&["phone1".to_string(), "phone2".to_string()])
            .await;
        assert_eq!(outcomes.len(), 2);

        let by_name: HashMap<_, _> = outcomes
            .into_iter()
            .map(|(name, outcome)| (name, outcome))
            .collect();
        assert!(by_name["phone1"].is_ok());
        assert!(by_name["phone2"].is_err());

        // phone1 stays active despite phone2's failure.
        assert_eq!(orch.active_environments(), vec!["phone1".to_string()]);
        orch.teardown_all().await;
    }

    #[tokio::test]
    async fn test_cancelled_setup_starts_no_step() {
        let dir = tempfile::tempdir().unwrap();
        let orch = test_fixture(dir.path());
        orch.cancel.cancel();

        let err = orch.setup("phone1").await.unwrap_err();
        assert!(matches!(err, PhantomError::Setup { .. }));
        assert_eq!(orch.supervisor.store().stats().total, 0);
    }
}
