//! Per-service lifecycle orchestration (spec §4): the state machine, the
//! launcher extension point, wiring assembly, the `observe` graph
//! transform, ready-probing, and the progress watchdog.

pub mod graph;
pub mod launcher;
pub mod lifecycle;
pub mod phase;
pub mod ready;
pub mod runtime;
pub mod transform;
pub mod watchdog;
pub mod wiring;

pub use launcher::{LaunchParams, Launcher, LauncherRegistry, ProxyLauncher, Runner, TestRootLauncher};
pub use lifecycle::{run_service, ServiceEnv};
pub use phase::Phase;
pub use ready::{checker_for, poll_until_ready, Checker, DEFAULT_READY_TIMEOUT};
pub use runtime::EnvironmentRuntime;
