//! One running environment instance: spawns every service's lifecycle
//! task, runs the progress watchdog alongside them, and tears the whole
//! thing down on request or on first unrecoverable failure (spec §4, §5).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use rig_artifacts::Engine as ArtifactEngine;
use rig_common::error::Result;
use rig_domain::{Environment, EnvironmentId};
use rig_eventlog::event::EventType;
use rig_eventlog::{Event, EventLog};
use rig_ports::PortAllocator;

use crate::graph;
use crate::launcher::LauncherRegistry;
use crate::lifecycle::{run_service, ServiceEnv};
use crate::watchdog;

/// Everything a running environment owns. Dropping this without calling
/// [`EnvironmentRuntime::teardown`] leaks its tasks; the server always
/// drives teardown explicitly.
pub struct EnvironmentRuntime {
    pub id: EnvironmentId,
    pub log: Arc<EventLog>,
    environment: Arc<Environment>,
    cancel: CancellationToken,
    tasks: JoinSet<Result<()>>,
    watchdog_cancel: CancellationToken,
    shutdown_grace: Duration,
}

impl EnvironmentRuntime {
    /// Prepares the graph (`observe` transform + `~test` root), resolves
    /// every service's artifacts as a single environment-wide barrier, then
    /// spawns one lifecycle task per service plus the progress watchdog.
    ///
    /// The artifact phase runs to completion before any lifecycle task
    /// starts (spec §4.4): one service can no longer begin running while a
    /// sibling is still mid-resolution. A failure here fails the whole
    /// environment before any service starts, with peers' in-flight
    /// resolutions already cancelled by `resolve_all` itself.
    pub async fn start(
        id: EnvironmentId,
        environment: Environment,
        launchers: Arc<LauncherRegistry>,
        ports: Arc<PortAllocator>,
        artifacts: Arc<ArtifactEngine>,
        environment_scratch_dir: PathBuf,
        shutdown_grace: Duration,
        watchdog_tick: Duration,
    ) -> Result<Self> {
        let environment = Arc::new(graph::prepare(environment));
        let log = Arc::new(EventLog::new());
        let cancel = CancellationToken::new();

        let service_env = Arc::new(ServiceEnv {
            log: log.clone(),
            ports,
            artifacts,
            launchers,
            environment: environment.clone(),
            environment_scratch_dir,
            shutdown_grace,
        });

        let mut all_artifacts = Vec::new();
        for service in environment.services.values() {
            let launcher = service_env.launchers.get(&service.service_type)?;
            all_artifacts.extend(launcher.artifacts(service));
        }
        if !all_artifacts.is_empty() {
            service_env.artifacts.resolve_all(all_artifacts, &cancel).await?;
        }

        let mut tasks = JoinSet::new();
        for service_name in environment.services.keys() {
            let service_env = service_env.clone();
            let service_name = service_name.clone();
            let cancel = cancel.child_token();
            tasks.spawn(run_service(service_env, service_name, cancel));
        }

        let watchdog_cancel = CancellationToken::new();
        tokio::spawn(watchdog::run(
            log.clone(),
            environment.clone(),
            watchdog_tick,
            watchdog_cancel.clone(),
        ));

        Ok(Self {
            id,
            log,
            environment,
            cancel,
            tasks,
            watchdog_cancel,
            shutdown_grace,
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    /// Cancels every service, waits up to `shutdown_grace` for a clean
    /// exit, then abandons stragglers. Always emits `environment.down`
    /// (or `environment.failing` if any lifecycle task itself errored).
    pub async fn teardown(mut self) {
        self.cancel.cancel();
        self.watchdog_cancel.cancel();

        let mut any_failed = false;
        let deadline = tokio::time::sleep(self.shutdown_grace);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = self.tasks.join_next() => {
                    match joined {
                        Some(Ok(Err(_))) => any_failed = true,
                        Some(Err(join_err)) => {
                            warn!(error = %join_err, "lifecycle task panicked during teardown");
                            any_failed = true;
                        }
                        Some(Ok(Ok(()))) => {}
                        None => break,
                    }
                }
                _ = &mut deadline => {
                    warn!(remaining = self.tasks.len(), "shutdown grace period elapsed, abandoning stragglers");
                    self.tasks.abort_all();
                    break;
                }
            }
        }

        let event_type = if any_failed {
            EventType::EnvironmentFailing
        } else {
            EventType::EnvironmentDown
        };
        let event = Event::builder(&self.environment.name, event_type).build();
        self.log.publish(event).await;
    }
}
