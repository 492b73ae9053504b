//! Shared application state (spec §6.2 boundary + §5 concurrency model).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use rig_artifacts::Engine as ArtifactEngine;
use rig_domain::EnvironmentId;
use rig_orchestrator::{EnvironmentRuntime, LauncherRegistry, ProxyLauncher, TestRootLauncher};
use rig_ports::PortAllocator;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub ports: Arc<PortAllocator>,
    pub artifacts: Arc<ArtifactEngine>,
    pub launchers: Arc<LauncherRegistry>,
    pub environments: Arc<Mutex<HashMap<EnvironmentId, EnvironmentRuntime>>>,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let ports = Arc::new(PortAllocator::new(config.port_range_min, config.port_range_max));
        let artifacts = Arc::new(ArtifactEngine::new(config.rig_dir.join("cache")));

        let mut registry = LauncherRegistry::new();
        registry.register("test", Arc::new(TestRootLauncher));
        registry.register("proxy", Arc::new(ProxyLauncher));

        Self {
            config: Arc::new(config),
            ports,
            artifacts,
            launchers: Arc::new(registry),
            environments: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}
