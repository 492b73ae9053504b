//! Graph preparation: the two synthetic-node insertions that run before a
//! submitted environment starts (spec §4.8, §GLOSSARY "~test node").

use rig_domain::{EgressSpec, Environment, Hooks, Service, StrictMap};

use crate::transform;

/// Name of the synthetic node that depends on every service exposing at
/// least one ingress, and is the sole origin of `environment.up`.
pub const TEST_ROOT_NAME: &str = "~test";

/// Applies the `observe` transform, then inserts the `~test` root. Order
/// matters: the root must depend on the *post-transform* ingress owners,
/// so its egresses point at real services directly (proxies sit strictly
/// between `source` and `target`, never downstream of the root).
pub fn prepare(environment: Environment) -> Environment {
    let mut environment = transform::apply(environment);

    let mut egresses = StrictMap::default();
    for (service_name, service) in environment.services.iter() {
        for ingress_name in service.ingresses.keys() {
            let egress_name = format!("{service_name}__{ingress_name}");
            egresses.insert(
                egress_name,
                EgressSpec {
                    service: service_name.clone(),
                    ingress: Some(ingress_name.clone()),
                },
            );
        }
    }

    environment.services.insert(
        TEST_ROOT_NAME.to_string(),
        Service {
            service_type: "test".to_string(),
            config: serde_json::Value::Null,
            argv: Vec::new(),
            ingresses: StrictMap::default(),
            egresses,
            hooks: Hooks::default(),
            injected: true,
        },
    );

    environment
}
