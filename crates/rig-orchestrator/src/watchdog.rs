//! Progress watchdog: detects stalled environments by watching whether the
//! lifecycle-event sequence advances between ticks (spec §4.10).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rig_domain::{Environment, EgressSpec};
use rig_eventlog::event::{DiagnosticSnapshot, Event, EventType, ServiceDiagnostic};
use rig_eventlog::EventLog;

use crate::phase::Phase;

/// Runs until `cancel` fires. Every `tick` interval, compares the maximum
/// lifecycle-event `seq` against the previous tick; if it hasn't advanced
/// and some service is still non-terminal, publishes `progress.stall`.
/// Never cancels anything itself — it only observes.
pub async fn run(
    log: Arc<EventLog>,
    environment: Arc<Environment>,
    tick: Duration,
    cancel: CancellationToken,
) {
    let mut last_max_seq: Option<u64> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(tick) => {}
        }

        let events = log.lifecycle_events().await;
        let current_max = events.iter().map(|e| e.seq).max();

        let snapshot = diagnose(&environment, &events);
        let any_non_terminal = !snapshot.services.is_empty();

        if any_non_terminal && current_max == last_max_seq {
            let event = Event::builder(&environment.name, EventType::ProgressStall)
                .diagnostic(snapshot)
                .build();
            log.publish(event).await;
        }

        last_max_seq = current_max;
    }
}

/// Scans lifecycle events for each service's most recent phase-changing
/// event; reports the non-terminal ones, and for those still `pending` or
/// `published`, which egress targets haven't reached `ready` yet.
fn diagnose(environment: &Environment, events: &[Event]) -> DiagnosticSnapshot {
    let mut current_phase: HashMap<String, Phase> = HashMap::new();
    let ready_services: std::collections::HashSet<String> = events
        .iter()
        .filter(|e| e.event_type == EventType::ServiceReady)
        .filter_map(|e| e.service.clone())
        .collect();

    for event in events {
        let Some(service) = &event.service else {
            continue;
        };
        if let Some(phase) = phase_for_event(event.event_type) {
            current_phase.insert(service.clone(), phase);
        }
    }

    let mut services = Vec::new();
    for (name, service) in environment.services.iter() {
        let phase = current_phase.get(name).copied().unwrap_or(Phase::Pending);
        if phase.is_terminal() {
            continue;
        }

        let waiting_on = if matches!(phase, Phase::Pending | Phase::Published) {
            service
                .egresses
                .values()
                .filter(|egress: &&EgressSpec| !ready_services.contains(&egress.service))
                .map(|egress| egress.service.clone())
                .collect()
        } else {
            Vec::new()
        };

        services.push(ServiceDiagnostic {
            service: name.clone(),
            phase: phase.as_str().to_string(),
            waiting_on,
        });
    }
    services.sort_by(|a, b| a.service.cmp(&b.service));

    DiagnosticSnapshot { services }
}

fn phase_for_event(event_type: EventType) -> Option<Phase> {
    match event_type {
        EventType::IngressPublished => Some(Phase::Published),
        EventType::WiringResolved => Some(Phase::WiringResolved),
        EventType::ServiceStarting => Some(Phase::Starting),
        EventType::ServiceHealthy => Some(Phase::Healthy),
        EventType::ServiceReady => Some(Phase::Ready),
        EventType::ServiceStopping => Some(Phase::Stopping),
        EventType::ServiceFailed => Some(Phase::Failed),
        EventType::ServiceStopped => Some(Phase::Stopped),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_domain::{Service, StrictMap};

    fn env_with_two_services() -> Environment {
        let mut services = StrictMap::default();
        services.insert(
            "app".to_string(),
            Service {
                service_type: "go".into(),
                config: serde_json::Value::Null,
                argv: vec![],
                ingresses: StrictMap::default(),
                egresses: {
                    let mut m = StrictMap::default();
                    m.insert(
                        "database".to_string(),
                        EgressSpec {
                            service: "db".to_string(),
                            ingress: None,
                        },
                    );
                    m
                },
                hooks: Default::default(),
                injected: false,
            },
        );
        services.insert(
            "db".to_string(),
            Service {
                service_type: "postgres".into(),
                config: serde_json::Value::Null,
                argv: vec![],
                ingresses: StrictMap::default(),
                egresses: StrictMap::default(),
                hooks: Default::default(),
                injected: false,
            },
        );
        Environment {
            name: "t".to_string(),
            observe: false,
            services,
        }
    }

    #[test]
    fn non_ready_service_reports_its_waiting_egress() {
        let env = env_with_two_services();
        let snapshot = diagnose(&env, &[]);
        let app = snapshot.services.iter().find(|s| s.service == "app").unwrap();
        assert_eq!(app.phase, "pending");
        assert_eq!(app.waiting_on, vec!["db".to_string()]);
    }

    #[test]
    fn ready_services_are_excluded_from_the_snapshot() {
        let env = env_with_two_services();
        let events = vec![
            Event::builder("t", EventType::ServiceReady)
                .service("app")
                .build(),
            Event::builder("t", EventType::ServiceReady)
                .service("db")
                .build(),
        ];
        let snapshot = diagnose(&env, &events);
        assert!(snapshot.services.is_empty());
    }
}
