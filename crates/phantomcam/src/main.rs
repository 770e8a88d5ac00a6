use anyhow::Context;
use clap::{Parser, Subcommand};
use phantomcam::{
    audio::VirtualMic, CleanupCoordinator, DeviceAllocator, Filter, HealthStatus, Orchestrator,
    PhantomError, PipelineRequest, Sink, Source, Supervisor,
};
use phantomconf::PhantomConfig;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Phantomcam - virtual cameras, virtual microphone, phone environments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path (overrides ./phantomcam.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Minimum free memory (MB) required before starting pipelines
    #[arg(long, default_value = "500", global = true)]
    min_memory_mb: u64,

    /// Maximum load average (% of cpus) tolerated before starting pipelines
    #[arg(long, default_value = "90", global = true)]
    max_load_pct: u32,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the loopback device pool
    Devices {
        #[command(subcommand)]
        command: DeviceCommands,
    },

    /// Stream a media file into a loopback device
    Stream {
        /// Input media file
        input: PathBuf,

        /// Target device: profile name, "videoN", or /dev path
        #[arg(short, long)]
        device: String,

        /// Loop the input forever
        #[arg(long)]
        repeat: bool,
    },

    /// Capture from a device into a file
    Capture {
        /// Source device: profile name, "videoN", or /dev path
        #[arg(short, long)]
        device: String,

        /// Output file
        output: PathBuf,
    },

    /// Manage one phone environment
    Phone {
        #[command(subcommand)]
        command: PhoneCommands,
    },

    /// Bring up several phone environments concurrently
    Phones {
        /// Profile names from the [phones] config section
        names: Vec<String>,
    },

    /// Manage the virtual microphone
    Mic {
        #[command(subcommand)]
        command: MicCommands,
    },

    /// Show the effective configuration
    Config,
}

#[derive(Subcommand, Debug)]
enum DeviceCommands {
    /// Load the loopback module with a device pool
    Create {
        /// Number of devices
        #[arg(short, long, default_value = "4")]
        count: u32,

        /// Card label
        #[arg(short, long, default_value = "Phantomcam")]
        label: String,
    },

    /// Print the next free device number
    Free,

    /// Unload the loopback module
    Destroy,
}

#[derive(Subcommand, Debug)]
enum PhoneCommands {
    /// Set up the environment for a profile
    Up { name: String },

    /// Tear down the environment for a profile
    Down { name: String },
}

#[derive(Subcommand, Debug)]
enum MicCommands {
    /// Create the pipe and load the pipe-source module
    Up,

    /// Play a file into the virtual microphone
    Feed { file: PathBuf },

    /// Unload the module and remove the pipe
    Down,
}

/// Everything a command needs, built once in main.
struct App {
    config: Arc<PhantomConfig>,
    supervisor: Supervisor,
    allocator: Arc<DeviceAllocator>,
    orchestrator: Arc<Orchestrator>,
    mic: VirtualMic,
    cancel: CancellationToken,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = Arc::new(
        PhantomConfig::load_from(cli.config.as_deref()).context("Failed to load configuration")?,
    );

    let cancel = CancellationToken::new();
    let supervisor = Supervisor::new();
    let allocator = Arc::new(DeviceAllocator::new(config.clone()));
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        supervisor.clone(),
        allocator.clone(),
        cancel.clone(),
    ));
    // Raised by the mic path while it owns a FIFO it has not yet handed
    // to the audio subsystem; the coordinator reaps only that orphan.
    let pipe_created = Arc::new(AtomicBool::new(false));
    let mic = VirtualMic::new(config.clone(), supervisor.clone(), pipe_created.clone());

    // The coordinator unloads the module only for commands that loaded it.
    let unload_module = matches!(
        cli.command,
        Commands::Devices {
            command: DeviceCommands::Destroy
        }
    );
    let coordinator = Arc::new(CleanupCoordinator::new(
        supervisor.clone(),
        orchestrator.clone(),
        allocator.clone(),
        config.paths.pipe_path.clone(),
        pipe_created,
        cancel.clone(),
        unload_module,
    ));

    let app = App {
        config,
        supervisor,
        allocator,
        orchestrator,
        mic,
        cancel,
    };

    // Handle both SIGINT (Ctrl+C) and SIGTERM (systemd, timeouts, etc.);
    // either one funnels into the same single-shot cleanup.
    let outcome = tokio::select! {
        outcome = run_command(&app, &cli) => outcome,
        code = wait_for_signal() => {
            coordinator.cleanup().await;
            std::process::exit(code);
        }
    };

    coordinator.cleanup().await;

    match outcome {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(e.exit_code());
        }
    }
}

/// SIGINT -> 130, SIGTERM -> 143, the conventional signal-derived codes.
async fn wait_for_signal() -> i32 {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received SIGINT, shutting down gracefully...");
            130
        }
        _ = async {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{signal, SignalKind};
                let mut sigterm = signal(SignalKind::terminate()).expect("Failed to setup SIGTERM handler");
                sigterm.recv().await;
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {
            tracing::info!("Received SIGTERM, shutting down gracefully...");
            143
        }
    }
}

async fn run_command(app: &App, cli: &Cli) -> Result<(), PhantomError> {
    match &cli.command {
        Commands::Devices { command } => match command {
            DeviceCommands::Create { count, label } => {
                app.allocator.create_pool(*count, label).await?;
                Ok(())
            }
            DeviceCommands::Free => {
                let path = app.allocator.next_free_device()?;
                println!("{}", path.display());
                Ok(())
            }
            DeviceCommands::Destroy => {
                // The coordinator does the unload on the way out.
                Ok(())
            }
        },

        Commands::Stream {
            input,
            device,
            repeat,
        } => {
            preflight(cli, &["ffmpeg"])?;
            let device = app.allocator.resolve(device)?;
            let (width, height) =
                phantomcam::validate::validate_resolution(&app.config.media.resolution)?;
            let framerate =
                phantomcam::validate::validate_framerate(app.config.media.framerate)?;

            let request = PipelineRequest::new(
                Source::File {
                    path: input.clone(),
                    loop_input: *repeat,
                },
                Sink::V4l2(device.clone()),
            )
            .with_filter(Filter::Scale { width, height })
            .with_filter(Filter::Fps(framerate));

            let id =
                app.supervisor
                    .spawn("stream", "ffmpeg", &request.to_args(), vec![device])?;
            expect_healthy(app, id, 3).await?;
            tracing::info!(session.id = %id, "Streaming; Ctrl+C to stop");
            wait_for_session_or_cancel(app, id).await;
            Ok(())
        }

        Commands::Capture { device, output } => {
            preflight(cli, &["ffmpeg"])?;
            let device = app.allocator.resolve(device)?;
            let request = PipelineRequest::new(
                Source::Device {
                    path: device.clone(),
                },
                Sink::File(output.clone()),
            );
            let id =
                app.supervisor
                    .spawn("capture", "ffmpeg", &request.to_args(), vec![device])?;
            expect_healthy(app, id, 3).await?;
            tracing::info!(session.id = %id, output = %output.display(), "Capturing; Ctrl+C to stop");
            wait_for_session_or_cancel(app, id).await;
            Ok(())
        }

        Commands::Phone { command } => match command {
            PhoneCommands::Up { name } => {
                preflight(cli, &[])?;
                let env = app.orchestrator.setup(name).await?;
                tracing::info!(
                    phone.profile = %name,
                    phone.display = env.profile.display_number,
                    phone.device = %env.device.display(),
                    "Phone environment running; Ctrl+C to stop"
                );
                app.cancel.cancelled().await;
                Ok(())
            }
            PhoneCommands::Down { name } => {
                app.orchestrator.teardown(name).await;
                Ok(())
            }
        },

        Commands::Phones { names } => {
            preflight(cli, &[])?;
            let outcomes = app.orchestrator.launch_many(names).await;
            let mut failures = 0;
            for (name, outcome) in &outcomes {
                match outcome {
                    Ok(env) => tracing::info!(
                        phone.profile = %name,
                        phone.device = %env.device.display(),
                        "Phone environment up"
                    ),
                    Err(e) => {
                        failures += 1;
                        tracing::error!(phone.profile = %name, "Setup failed: {}", e);
                    }
                }
            }
            if failures == outcomes.len() && !outcomes.is_empty() {
                // Nothing to keep alive
                return Err(PhantomError::Runtime {
                    name: "phones".to_string(),
                    detail: "every profile failed to start".to_string(),
                });
            }
            tracing::info!(
                phones.up = outcomes.len() - failures,
                phones.failed = failures,
                "Phone environments running; Ctrl+C to stop"
            );
            app.cancel.cancelled().await;
            Ok(())
        }

        Commands::Mic { command } => match command {
            MicCommands::Up => {
                phantomcam::validate::check_required_tools(&["pactl"])?;
                app.mic.up().await
            }
            MicCommands::Feed { file } => {
                phantomcam::validate::check_required_tools(&["ffmpeg"])?;
                let id = app.mic.feed(file)?;
                expect_healthy(app, id, 2).await?;
                tracing::info!(session.id = %id, "Feeding microphone");
                wait_for_session_or_cancel(app, id).await;
                Ok(())
            }
            MicCommands::Down => {
                app.mic.down().await;
                Ok(())
            }
        },

        Commands::Config => {
            print!("{}", app.config.to_toml());
            Ok(())
        }
    }
}

/// Shared pre-flight gate: resource headroom plus required tools.
fn preflight(cli: &Cli, tools: &[&str]) -> Result<(), PhantomError> {
    phantomcam::validate::check_system_resources(cli.min_memory_mb, cli.max_load_pct)?;
    if !tools.is_empty() {
        phantomcam::validate::check_required_tools(tools)?;
    }
    Ok(())
}

async fn expect_healthy(app: &App, id: phantomcam::SessionId, timeout: u64) -> Result<(), PhantomError> {
    match app.supervisor.health_check(id, timeout).await? {
        HealthStatus::Healthy => Ok(()),
        HealthStatus::FailedToStart { detail } => Err(PhantomError::FailedToStart {
            name: session_name(app, id),
            detail,
        }),
        HealthStatus::RuntimeError { detail } => Err(PhantomError::Runtime {
            name: session_name(app, id),
            detail,
        }),
    }
}

fn session_name(app: &App, id: phantomcam::SessionId) -> String {
    app.supervisor
        .store()
        .get(id)
        .map(|s| s.name)
        .unwrap_or_default()
}

/// Stay resident until the session finishes on its own or shutdown is
/// requested. The coordinator handles termination in the latter case.
async fn wait_for_session_or_cancel(app: &App, id: phantomcam::SessionId) {
    loop {
        tokio::select! {
            _ = app.cancel.cancelled() => return,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                match app.supervisor.store().get(id) {
                    Some(s) if s.exit_code.is_none() => continue,
                    _ => return,
                }
            }
        }
    }
}
