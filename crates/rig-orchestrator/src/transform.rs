//! The `observe` graph transform: injects a synthetic proxy service on
//! every edge so all traffic crosses exactly one observation point
//! (spec §4.8).

use rig_domain::{EgressSpec, Environment, IngressSpec, Service, StrictMap};

/// Name of the synthetic proxy service inserted between `source` and
/// `target.ingress`.
pub fn proxy_name(target: &str, source: &str) -> String {
    format!("{target}~proxy~{source}")
}

/// Rewrites the environment's graph: for every edge `source -> target`,
/// inserts `<target>~proxy~<source>` whose ingress adopts the target
/// ingress's protocol, whose egress points at the real target, and
/// retargets `source`'s egress through the proxy. A no-op when `observe`
/// is false.
pub fn apply(mut environment: Environment) -> Environment {
    if !environment.observe {
        return environment;
    }

    let edges: Vec<(String, String, EgressSpec)> = environment
        .services
        .iter()
        .flat_map(|(source_name, service)| {
            service
                .egresses
                .iter()
                .map(|(egress_name, egress)| {
                    (source_name.clone(), egress_name.clone(), egress.clone())
                })
                .collect::<Vec<_>>()
        })
        .collect();

    for (source_name, egress_name, egress) in edges {
        let target_name = egress.service.clone();
        let target_ingress_name = egress
            .ingress
            .clone()
            .unwrap_or_else(|| default_ingress_name(&environment, &target_name));

        let target_ingress = environment.services[&target_name].ingresses[&target_ingress_name]
            .clone();

        let proxy_name = proxy_name(&target_name, &source_name);

        let mut proxy_ingresses = StrictMap::default();
        proxy_ingresses.insert(
            "default".to_string(),
            IngressSpec {
                protocol: target_ingress.protocol,
                container_port: None,
                ready: None,
                attributes: serde_json::Map::new(),
            },
        );
        let mut proxy_egresses = StrictMap::default();
        proxy_egresses.insert(
            "target".to_string(),
            EgressSpec {
                service: target_name.clone(),
                ingress: Some(target_ingress_name.clone()),
            },
        );

        environment.services.insert(
            proxy_name.clone(),
            Service {
                service_type: "proxy".to_string(),
                config: serde_json::Value::Null,
                argv: Vec::new(),
                ingresses: proxy_ingresses,
                egresses: proxy_egresses,
                hooks: Default::default(),
                injected: true,
            },
        );

        environment
            .services
            .get_mut(&source_name)
            .expect("source service exists, it owns this egress")
            .egresses
            .insert(
                egress_name,
                EgressSpec {
                    service: proxy_name,
                    ingress: Some("default".to_string()),
                },
            );
    }

    environment
}

fn default_ingress_name(environment: &Environment, target: &str) -> String {
    let ingresses = &environment.services[target].ingresses;
    if ingresses.contains_key("default") {
        "default".to_string()
    } else {
        ingresses
            .keys()
            .next()
            .cloned()
            .unwrap_or_else(|| "default".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_domain::Protocol;

    fn sample_environment(observe: bool) -> Environment {
        let mut services = StrictMap::default();

        let mut db_ingresses = StrictMap::default();
        db_ingresses.insert(
            "default".to_string(),
            IngressSpec {
                protocol: Protocol::Tcp,
                container_port: Some(5432),
                ready: None,
                attributes: serde_json::Map::new(),
            },
        );
        services.insert(
            "db".to_string(),
            Service {
                service_type: "postgres".into(),
                config: serde_json::Value::Null,
                argv: vec![],
                ingresses: db_ingresses,
                egresses: StrictMap::default(),
                hooks: Default::default(),
                injected: false,
            },
        );

        let mut app_egresses = StrictMap::default();
        app_egresses.insert(
            "database".to_string(),
            EgressSpec {
                service: "db".to_string(),
                ingress: None,
            },
        );
        services.insert(
            "app".to_string(),
            Service {
                service_type: "go".into(),
                config: serde_json::Value::Null,
                argv: vec![],
                ingresses: StrictMap::default(),
                egresses: app_egresses,
                hooks: Default::default(),
                injected: false,
            },
        );

        Environment {
            name: "t".to_string(),
            observe,
            services,
        }
    }

    #[test]
    fn no_op_when_observe_is_false() {
        let env = sample_environment(false);
        let transformed = apply(env);
        assert_eq!(transformed.services.len(), 2);
    }

    #[test]
    fn inserts_a_proxy_and_retargets_the_source_egress() {
        let env = sample_environment(true);
        let transformed = apply(env);

        assert_eq!(transformed.services.len(), 3);
        let proxy = &transformed.services["db~proxy~app"];
        assert!(proxy.injected);
        assert_eq!(proxy.egresses["target"].service, "db");

        let app_egress = &transformed.services["app"].egresses["database"];
        assert_eq!(app_egress.service, "db~proxy~app");
        assert_eq!(app_egress.ingress.as_deref(), Some("default"));
    }
}
