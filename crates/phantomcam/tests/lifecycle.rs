//! End-to-end lifecycle tests through the public API: allocate a device,
//! stand up a phone environment against a fake toolchain, and verify the
//! whole thing comes down cleanly through the cleanup coordinator.

use phantomcam::{
    CleanupCoordinator, DeviceAllocator, Orchestrator, SessionState, Supervisor, Toolchain,
};
use phantomconf::{PhantomConfig, PhoneProfile};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct Fixture {
    _dir: tempfile::TempDir,
    supervisor: Supervisor,
    allocator: Arc<DeviceAllocator>,
    orchestrator: Arc<Orchestrator>,
    coordinator: Arc<CleanupCoordinator>,
    cancel: CancellationToken,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let mut config = PhantomConfig::default();
    config.paths.avd_home = dir.path().join("avd");
    config.paths.pipe_path = dir.path().join("mic.pipe");
    config.paths.sdk_root = dir.path().join("sdk");
    std::fs::create_dir_all(dir.path().join("sdk/emulator")).unwrap();
    std::fs::write(dir.path().join("sdk/emulator/emulator"), b"").unwrap();
    config.phones.profiles.insert(
        "phone1".to_string(),
        PhoneProfile {
            camera_id: "webcam1".to_string(),
            display_number: 2,
            device_path: "video2".to_string(),
        },
    );
    let config = Arc::new(config);

    let dev_dir = dir.path().join("dev");
    std::fs::create_dir_all(&dev_dir).unwrap();
    std::fs::write(dev_dir.join("video2"), b"").unwrap();
    std::fs::create_dir_all(dir.path().join("avd/phone1.avd")).unwrap();

    let fake_tool = dir.path().join("fake-tool");
    std::fs::write(&fake_tool, "#!/bin/sh\nsleep 30\n").unwrap();
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&fake_tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let fake = fake_tool.to_string_lossy().into_owned();

    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new();
    let allocator = Arc::new(DeviceAllocator::with_dev_dir(config.clone(), dev_dir));
    let orchestrator = Arc::new(Orchestrator::with_toolchain(
        config.clone(),
        supervisor.clone(),
        allocator.clone(),
        cancel.clone(),
        Toolchain {
            display_server: fake.clone(),
            window_shell: fake.clone(),
            media_engine: fake,
        },
    ));
    let coordinator = Arc::new(CleanupCoordinator::new(
        supervisor.clone(),
        orchestrator.clone(),
        allocator.clone(),
        config.paths.pipe_path.clone(),
        Arc::new(AtomicBool::new(false)),
        cancel.clone(),
        false,
    ));

    Fixture {
        _dir: dir,
        supervisor,
        allocator,
        orchestrator,
        coordinator,
        cancel,
    }
}

fn assert_no_live_sessions(supervisor: &Supervisor) {
    let live = supervisor.store().live_sessions();
    assert!(
        live.is_empty(),
        "sessions still live: {:?}",
        live.iter().map(|s| s.name.clone()).collect::<Vec<_>>()
    );
}

#[tokio::test]
async fn phone_environment_full_lifecycle() {
    let fx = fixture();

    let env = fx.orchestrator.setup("phone1").await.unwrap();
    assert_eq!(env.profile.display_number, 2);
    assert!(env.device.ends_with("video2"));

    // All three sessions are live and healthy-or-starting.
    assert_eq!(fx.supervisor.store().live_sessions().len(), 3);
    let display = fx.supervisor.store().get(env.display).unwrap();
    assert_eq!(display.state, SessionState::Healthy);

    fx.orchestrator.teardown("phone1").await;
    assert!(fx.orchestrator.active_environments().is_empty());
    assert_no_live_sessions(&fx.supervisor);

    // The device number is reusable after teardown.
    fx.allocator.release(&env.device);
}

#[tokio::test]
async fn cleanup_tears_down_environments_and_sessions() {
    let fx = fixture();

    fx.orchestrator.setup("phone1").await.unwrap();
    fx.supervisor
        .spawn("stray", "sleep", &["30"], vec![])
        .unwrap();

    fx.coordinator.cleanup().await;

    assert!(fx.cancel.is_cancelled());
    assert!(fx.orchestrator.active_environments().is_empty());
    assert_no_live_sessions(&fx.supervisor);
}

#[tokio::test]
async fn cleanup_blocks_further_setups() {
    let fx = fixture();

    fx.coordinator.cleanup().await;

    // The cancellation observed by the step gate stops new work.
    let err = fx.orchestrator.setup("phone1").await.unwrap_err();
    assert!(matches!(err, phantomcam::PhantomError::Setup { .. }));
    assert_no_live_sessions(&fx.supervisor);
}

#[tokio::test]
async fn reserve_and_teardown_cycle_reuses_numbers() {
    let fx = fixture();

    let a = fx.allocator.reserve_free_device().unwrap();
    let b = fx.allocator.reserve_free_device().unwrap();
    assert_ne!(a, b);

    fx.allocator.release(&a);
    assert_eq!(fx.allocator.reserve_free_device().unwrap(), a);
}
