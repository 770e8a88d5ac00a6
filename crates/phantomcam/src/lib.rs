//! Phantomcam - virtual multimedia endpoint provisioner and supervisor.
//!
//! Provisions loopback video devices, a virtual microphone, and nested
//! phone-emulation environments, and supervises the external processes
//! (media engine, nested display server, window shell) driving them. The
//! media work itself is delegated to those processes; this crate owns the
//! resource lifecycle: allocation without collision, pre-flight
//! validation, liveness probing, and deterministic teardown on every exit
//! path.

pub mod audio;
pub mod cleanup;
pub mod devices;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod supervisor;
pub mod validate;

pub use cleanup::CleanupCoordinator;
pub use devices::DeviceAllocator;
pub use error::{PhantomError, Result};
pub use orchestrator::{Orchestrator, PhoneEnvironment, Toolchain};
pub use pipeline::{Filter, PipelineRequest, Sink, Source};
pub use supervisor::{HealthStatus, Session, SessionId, SessionState, SessionStore, Supervisor};
