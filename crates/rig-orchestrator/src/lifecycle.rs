//! Per-service lifecycle: the state machine and structured-concurrency
//! scope described in spec §4.5.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rig_artifacts::Engine as ArtifactEngine;
use rig_common::error::{Error, Result};
use rig_domain::{Endpoint, Environment, HookType, Service};
use rig_eventlog::event::{CallbackRequest, EventType};
use rig_eventlog::{Event, EventLog};
use rig_ports::PortAllocator;

use crate::launcher::{LaunchParams, LauncherRegistry};
use crate::ready::{checker_for, poll_until_ready, DEFAULT_READY_TIMEOUT};
use crate::wiring;

/// Strips the orchestration framework's own wrapping prefixes
/// (`sequence [i:n]:`, `group[name]:`) from error strings emitted to
/// clients (spec §4.5).
static WRAPPING_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(sequence \[\d+:\d+\]:\s*|group\[[^\]]*\]:\s*)+").unwrap());

pub fn strip_wrapping_prefixes(message: &str) -> String {
    WRAPPING_PREFIX.replace(message, "").into_owned()
}

/// Shared services one service's lifecycle task needs.
pub struct ServiceEnv {
    pub log: Arc<EventLog>,
    pub ports: Arc<PortAllocator>,
    pub artifacts: Arc<ArtifactEngine>,
    pub launchers: Arc<LauncherRegistry>,
    pub environment: Arc<Environment>,
    pub environment_scratch_dir: PathBuf,
    pub shutdown_grace: Duration,
}

/// Runs one service's full lifecycle to completion (or cancellation).
/// Returns `Ok(())` on a clean stop, `Err` if the sequence itself failed.
pub async fn run_service(
    env: Arc<ServiceEnv>,
    service_name: String,
    cancel: CancellationToken,
) -> Result<()> {
    let result = run_sequence(&env, &service_name, &cancel).await;
    env.ports.release(&service_name).await;

    match &result {
        Err(Error::Cancelled) => {
            emit(&env, &service_name, EventType::ServiceStopping, None).await;
        }
        Err(err) => {
            let message = strip_wrapping_prefixes(&err.to_string());
            emit(&env, &service_name, EventType::ServiceFailed, Some(message)).await;
        }
        Ok(()) => {}
    }
    emit(&env, &service_name, EventType::ServiceStopped, None).await;
    result
}

async fn run_sequence(
    env: &Arc<ServiceEnv>,
    service_name: &str,
    cancel: &CancellationToken,
) -> Result<()> {
    let service = env
        .environment
        .services
        .get(service_name)
        .cloned()
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("unknown service {service_name:?}")))?;

    let launcher = env.launchers.get(&service.service_type)?;

    let scratch_dir = env.environment_scratch_dir.join(service_name);
    tokio::fs::create_dir_all(&scratch_dir)
        .await
        .map_err(Error::Io)?;

    // Artifacts were already resolved for every service, as a single
    // environment-wide barrier, in `EnvironmentRuntime::start`.

    // Step 1: wait for egresses.
    let mut egress_endpoints: HashMap<String, Endpoint> = HashMap::new();
    for (egress_name, egress) in service.egresses.iter() {
        let target = egress.service.clone();
        let target_ingress = egress.ingress.clone().unwrap_or_else(|| "default".to_string());

        wait_for_event(env, cancel, move |e| {
            e.event_type == EventType::ServiceReady && e.service.as_deref() == Some(target.as_str())
        })
        .await?;

        let target = egress.service.clone();
        let target_ingress_for_match = target_ingress.clone();
        let published = wait_for_event(env, cancel, move |e| {
            e.event_type == EventType::IngressPublished
                && e.service.as_deref() == Some(target.as_str())
                && e.ingress.as_deref() == Some(target_ingress_for_match.as_str())
        })
        .await?;

        let endpoint = published
            .endpoint
            .clone()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("ingress.published event missing endpoint")))?;
        egress_endpoints.insert(egress_name.clone(), endpoint);
    }
    emit(env, service_name, EventType::WiringResolved, None).await;

    // Step 2: publish. Allocate n = |ingresses| listeners, ports assigned
    // deterministically by lexicographic ingress name, then handed to the
    // launcher's publish callback.
    let ingress_names: Vec<String> = service.ingresses.keys().cloned().collect();
    let listeners = if ingress_names.is_empty() {
        Vec::new()
    } else {
        env.ports.allocate(service_name, ingress_names.len()).await?
    };

    let mut ports_by_name = HashMap::new();
    for (name, listener) in ingress_names.iter().zip(listeners.into_iter()) {
        let port = listener
            .local_addr()
            .map_err(Error::Io)?
            .port();
        drop(listener); // closed: the launcher rebinds the real service to it
        ports_by_name.insert(name.clone(), port);
    }

    let ingress_endpoints = launcher.publish(&service.ingresses, &ports_by_name).await?;
    for (ingress_name, endpoint) in &ingress_endpoints {
        emit_with_endpoint(env, service_name, ingress_name, endpoint.clone()).await;
    }

    // Step 3: prestart hooks. Only client-callback hooks are legal: the
    // service isn't running yet.
    for hook in &service.hooks.prestart {
        if hook.hook_type != HookType::ClientFunc {
            return Err(Error::Internal(anyhow::anyhow!(
                "prestart hooks must be client-callback, found {:?}",
                hook.hook_type
            )));
        }
        run_client_func_hook(env, service_name, hook, cancel).await?;
    }

    let env_vars = wiring::build_env(
        service_name,
        &ingress_endpoints,
        &egress_endpoints,
        &scratch_dir,
        &env.environment_scratch_dir,
    )?;
    let argv = wiring::expand_argv(&service.argv, &env_vars)?;

    let mut service_for_runner = service.clone();
    service_for_runner.argv = argv;

    let params = LaunchParams {
        service_name: service_name.to_string(),
        service: service_for_runner,
        env: env_vars,
        log: env.log.clone(),
        environment_name: env.environment.name.clone(),
    };
    let runner = launcher.runner(params);

    // Step 4: parallel scope. Runner lifetime races the lifecycle
    // continuation; whichever finishes/fails first cancels its sibling.
    let scope_cancel = cancel.child_token();
    let mut tasks = tokio::task::JoinSet::new();

    tasks.spawn({
        let scope_cancel = scope_cancel.clone();
        async move { runner.run(scope_cancel).await }
    });

    tasks.spawn({
        let env = env.clone();
        let service_name = service_name.to_string();
        let ingress_endpoints = ingress_endpoints.clone();
        let service = service.clone();
        let scope_cancel = scope_cancel.clone();
        async move {
            continuation(&env, &service_name, &service, &ingress_endpoints, &scope_cancel).await
        }
    });

    let mut first_result = None;
    while let Some(joined) = tasks.join_next().await {
        let result = joined.map_err(|e| Error::Internal(e.into()))?;
        if first_result.is_none() {
            first_result = Some(result);
            scope_cancel.cancel();
        }
    }

    first_result.unwrap_or(Ok(()))
}

async fn continuation(
    env: &Arc<ServiceEnv>,
    service_name: &str,
    service: &Service,
    ingress_endpoints: &HashMap<String, Endpoint>,
    cancel: &CancellationToken,
) -> Result<()> {
    emit(env, service_name, EventType::ServiceStarting, None).await;

    for (ingress_name, endpoint) in ingress_endpoints {
        let ingress_spec = &service.ingresses[ingress_name];
        let timeout = ingress_spec
            .ready
            .as_ref()
            .and_then(|r| r.timeout.as_deref())
            .map(rig_common::duration::parse_duration)
            .transpose()?
            .filter(|d| !d.is_zero())
            .unwrap_or(DEFAULT_READY_TIMEOUT);

        let http_path = ingress_spec
            .ready
            .as_ref()
            .and_then(|r| r.path.as_deref());
        let checker = checker_for(endpoint.protocol, http_path);

        let log = env.log.clone();
        let env_name = env.environment.name.clone();
        let service_name_owned = service_name.to_string();
        let ingress_name_owned = ingress_name.clone();
        poll_until_ready(checker.as_ref(), &endpoint.host, endpoint.port, timeout, move |err| {
            let log = log.clone();
            let event = Event::builder(&env_name, EventType::HealthCheckFailed)
                .service(&service_name_owned)
                .ingress(&ingress_name_owned)
                .message(err.to_string())
                .build();
            tokio::spawn(async move {
                log.publish(event).await;
            });
        })
        .await?;
    }

    emit(env, service_name, EventType::ServiceHealthy, None).await;

    let launcher = env.launchers.get(&service.service_type)?;
    for hook in &service.hooks.init {
        match hook.hook_type {
            HookType::ClientFunc => run_client_func_hook(env, service_name, hook, cancel).await?,
            HookType::Exec | HookType::Sql => {
                let params = LaunchParams {
                    service_name: service_name.to_string(),
                    service: service.clone(),
                    env: HashMap::new(),
                    log: env.log.clone(),
                    environment_name: env.environment.name.clone(),
                };
                launcher.init(&params).await?;
            }
        }
    }

    emit(env, service_name, EventType::ServiceReady, None).await;

    if is_test_root(service) {
        emit(env, service_name, EventType::EnvironmentUp, None).await;
    }

    cancel.cancelled().await;
    Ok(())
}

fn is_test_root(service: &Service) -> bool {
    service.injected && service.service_type == "test"
}

async fn run_client_func_hook(
    env: &Arc<ServiceEnv>,
    service_name: &str,
    hook: &rig_domain::Hook,
    cancel: &CancellationToken,
) -> Result<()> {
    let handler = hook
        .client_func
        .as_ref()
        .ok_or_else(|| Error::Internal(anyhow::anyhow!("client-func hook missing its function name")))?
        .name
        .clone();

    let request_event = Event::builder(&env.environment.name, EventType::CallbackRequest)
        .service(service_name)
        .callback_request(CallbackRequest {
            handler: handler.clone(),
            payload: hook.config.clone(),
        })
        .build();
    env.log.publish(request_event).await;

    let handler_for_match = handler.clone();
    wait_for_event(env, cancel, move |e| {
        e.event_type == EventType::CallbackResponse
            && e.callback_response
                .as_ref()
                .map(|r| r.handler == handler_for_match)
                .unwrap_or(false)
    })
    .await?;
    Ok(())
}

async fn wait_for_event(
    env: &Arc<ServiceEnv>,
    cancel: &CancellationToken,
    predicate: impl Fn(&rig_eventlog::Event) -> bool,
) -> Result<rig_eventlog::Event> {
    env.log
        .wait_for(cancel, predicate)
        .await
        .ok_or(Error::Cancelled)
}

async fn emit(env: &Arc<ServiceEnv>, service_name: &str, event_type: EventType, message: Option<String>) {
    let mut builder = Event::builder(&env.environment.name, event_type).service(service_name);
    if let Some(message) = message {
        builder = builder.message(message);
    }
    env.log.publish(builder.build()).await;
}

async fn emit_with_endpoint(env: &Arc<ServiceEnv>, service_name: &str, ingress_name: &str, endpoint: Endpoint) {
    let event = Event::builder(&env.environment.name, EventType::IngressPublished)
        .service(service_name)
        .ingress(ingress_name)
        .endpoint(endpoint)
        .build();
    env.log.publish(event).await;
}
