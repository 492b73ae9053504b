//! The service-type launcher interface (spec §4.7) and its registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use rig_artifacts::Artifact;
use rig_common::error::{Error, Result};
use rig_domain::{Endpoint, IngressSpec, Service, StrictMap};
use rig_eventlog::event::{ConnectionObserved, EventType, GrpcCallObserved, RequestObserved};
use rig_eventlog::{Event, EventLog};
use rig_proxy::ProxyEvent;

use crate::ready::Checker;
use crate::wiring::RigWiring;

/// Parameters a launcher's `Runner` needs to actually start the service.
pub struct LaunchParams {
    pub service_name: String,
    pub service: Service,
    pub env: HashMap<String, String>,
    pub log: Arc<EventLog>,
    pub environment_name: String,
}

#[async_trait]
pub trait Runner: Send {
    /// Blocks until the underlying process/container exits (or `cancel`
    /// fires, in which case it tears the child down and returns).
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()>;
}

/// The narrow capability set the lifecycle drives each service through
/// (spec §4.7). Concrete per-type implementations (container, process,
/// script, go-build, client-callback, postgres, temporal, redis, custom)
/// are out of scope; only the trait, the registry, `TestRootLauncher`
/// (the synthetic `~test` root) and `ProxyLauncher` (§4.8, structural) are
/// provided here.
#[async_trait]
pub trait Launcher: Send + Sync {
    fn artifacts(&self, service: &Service) -> Vec<Artifact>;

    async fn publish(
        &self,
        ingresses: &StrictMap<IngressSpec>,
        ports_by_name: &HashMap<String, u16>,
    ) -> Result<HashMap<String, Endpoint>>;

    fn runner(&self, params: LaunchParams) -> Box<dyn Runner>;

    async fn init(&self, _params: &LaunchParams) -> Result<()> {
        Ok(())
    }

    fn ready_check(&self, _ingress_name: &str, _ingress: &IngressSpec) -> Option<Box<dyn Checker>> {
        None
    }
}

/// Resolves a service's `type` tag to its `Launcher`. Unregistered tags
/// surface as a validation-style error rather than a panic, per spec
/// §4.7's "deliberately out of scope" extension point.
#[derive(Default, Clone)]
pub struct LauncherRegistry {
    launchers: HashMap<String, Arc<dyn Launcher>>,
}

impl LauncherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, service_type: impl Into<String>, launcher: Arc<dyn Launcher>) {
        self.launchers.insert(service_type.into(), launcher);
    }

    pub fn get(&self, service_type: &str) -> Result<Arc<dyn Launcher>> {
        self.launchers
            .get(service_type)
            .cloned()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!(
                "no launcher registered for service type {service_type:?} (extension point not implemented)"
            )))
    }
}

/// No-op launcher for the synthetic `~test` root node: it has no
/// ingresses, no artifacts, and its runner just parks until cancelled.
pub struct TestRootLauncher;

#[async_trait]
impl Launcher for TestRootLauncher {
    fn artifacts(&self, _service: &Service) -> Vec<Artifact> {
        Vec::new()
    }

    async fn publish(
        &self,
        _ingresses: &StrictMap<IngressSpec>,
        _ports_by_name: &HashMap<String, u16>,
    ) -> Result<HashMap<String, Endpoint>> {
        Ok(HashMap::new())
    }

    fn runner(&self, _params: LaunchParams) -> Box<dyn Runner> {
        Box::new(ParkingRunner)
    }
}

struct ParkingRunner;

#[async_trait]
impl Runner for ParkingRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        cancel.cancelled().await;
        Ok(())
    }
}

/// Launcher for the synthetic per-edge proxy service (spec §4.8): its
/// single `default` ingress rebinds the port the lifecycle already
/// allocated and forwards to the `target` egress, using whichever
/// forwarder `rig-proxy` picks for the ingress's protocol.
pub struct ProxyLauncher;

#[async_trait]
impl Launcher for ProxyLauncher {
    fn artifacts(&self, _service: &Service) -> Vec<Artifact> {
        Vec::new()
    }

    async fn publish(
        &self,
        ingresses: &StrictMap<IngressSpec>,
        ports_by_name: &HashMap<String, u16>,
    ) -> Result<HashMap<String, Endpoint>> {
        let mut endpoints = HashMap::new();
        for (name, spec) in ingresses.iter() {
            let port = *ports_by_name.get(name).ok_or_else(|| {
                Error::Internal(anyhow::anyhow!("missing allocated port for ingress {name:?}"))
            })?;
            endpoints.insert(name.clone(), Endpoint::new("127.0.0.1", port, spec.protocol));
        }
        Ok(endpoints)
    }

    fn runner(&self, params: LaunchParams) -> Box<dyn Runner> {
        Box::new(ProxyRunner { params })
    }
}

struct ProxyRunner {
    params: LaunchParams,
}

#[async_trait]
impl Runner for ProxyRunner {
    async fn run(self: Box<Self>, cancel: CancellationToken) -> Result<()> {
        let wiring_json = self.params.env.get("RIG_WIRING").ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("proxy runner missing RIG_WIRING"))
        })?;
        let wiring: RigWiring = serde_json::from_str(wiring_json)?;

        let own = wiring.ingresses.get("default").ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("proxy service has no default ingress"))
        })?;
        let target = wiring.egresses.get("target").ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("proxy service has no target egress"))
        })?;

        let listener = TcpListener::bind(("127.0.0.1", own.port))
            .await
            .map_err(Error::Io)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<ProxyEvent>();
        let log = self.params.log.clone();
        let environment_name = self.params.environment_name.clone();
        let service_name = self.params.service_name.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(?event, "proxy event");
                log.publish(to_event(&environment_name, &service_name, event)).await;
            }
        });

        rig_proxy::run_forwarder(
            own.protocol,
            listener,
            target.host.clone(),
            target.port,
            "127.0.0.1".to_string(),
            own.port,
            cancel,
            tx,
        )
        .await
    }
}

/// Converts one forwarder-observed record into its event-log entry
/// (spec §4.8's "unified emission": every forwarder reports through the
/// same channel, regardless of protocol).
fn to_event(environment_name: &str, service_name: &str, event: ProxyEvent) -> Event {
    let builder = Event::builder(environment_name, event_type_of(&event)).service(service_name);
    match event {
        ProxyEvent::ConnectionOpened => builder.build(),
        ProxyEvent::ConnectionClosed {
            bytes_in,
            bytes_out,
            duration_ms,
        } => builder
            .connection(ConnectionObserved {
                bytes_in,
                bytes_out,
                duration_ms,
            })
            .build(),
        ProxyEvent::RequestCompleted {
            method,
            path,
            status,
            latency_ms,
            request_headers,
            response_headers,
            request_body,
            response_body,
            request_body_truncated,
            response_body_truncated,
            request_size,
            response_size,
        } => builder
            .request(RequestObserved {
                method,
                path,
                status,
                latency_ms,
                request_headers,
                response_headers,
                request_body,
                response_body,
                request_body_truncated,
                response_body_truncated,
                request_size,
                response_size,
            })
            .build(),
        ProxyEvent::GrpcCallCompleted {
            service,
            method,
            grpc_status,
            grpc_message,
            request_body_decoded,
            response_body_decoded,
            latency_ms,
        } => builder
            .grpc_call(GrpcCallObserved {
                service,
                method,
                grpc_status,
                grpc_message,
                request_body_decoded,
                response_body_decoded,
                latency_ms,
            })
            .build(),
    }
}

fn event_type_of(event: &ProxyEvent) -> EventType {
    match event {
        ProxyEvent::ConnectionOpened => EventType::ConnectionOpened,
        ProxyEvent::ConnectionClosed { .. } => EventType::ConnectionClosed,
        ProxyEvent::RequestCompleted { .. } => EventType::RequestCompleted,
        ProxyEvent::GrpcCallCompleted { .. } => EventType::GrpcCallCompleted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_type_is_a_clear_error_not_a_panic() {
        let registry = LauncherRegistry::new();
        let err = registry.get("postgres").unwrap_err();
        assert!(err.to_string().contains("postgres"));
    }

    #[tokio::test]
    async fn test_root_launcher_publishes_nothing() {
        let launcher = TestRootLauncher;
        let endpoints = launcher
            .publish(&StrictMap::default(), &HashMap::new())
            .await
            .unwrap();
        assert!(endpoints.is_empty());
    }
}
