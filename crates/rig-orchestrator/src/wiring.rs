//! Per-service environment variable assembly: `RIG_WIRING` JSON, the
//! well-known scratch-dir/name variables, attribute prefixing, and argv
//! template expansion (spec §4.9).

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use rig_common::error::Result;
use rig_domain::{template::Template, Endpoint};

/// One resolved endpoint as it appears in the `RIG_WIRING` blob: templates
/// already expanded against the endpoint's own address (output boundary).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedEndpoint {
    pub host: String,
    pub port: u16,
    pub protocol: rig_domain::Protocol,
    pub attributes: HashMap<String, String>,
}

impl ResolvedEndpoint {
    pub fn from_endpoint(endpoint: &Endpoint) -> Result<Self> {
        Ok(Self {
            host: endpoint.host.clone(),
            port: endpoint.port,
            protocol: endpoint.protocol,
            attributes: endpoint.resolve_attributes()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigWiring {
    pub ingresses: HashMap<String, ResolvedEndpoint>,
    pub egresses: HashMap<String, ResolvedEndpoint>,
    pub service_scratch_dir: PathBuf,
    pub environment_scratch_dir: PathBuf,
}

/// Builds the full environment-variable map one service receives at start
/// (spec §4.9, numbered per its list there):
/// 1. `RIG_WIRING` — the structured JSON blob above.
/// 2. `RIG_SERVICE`, `RIG_TEMP_DIR`, `RIG_ENV_DIR`.
/// 3. Ingress attributes: `default` unprefixed, others prefixed by the
///    uppercased, hyphen-to-underscore ingress name.
/// 4. Egress attributes: always prefixed by the uppercased egress name.
pub fn build_env(
    service_name: &str,
    ingresses: &HashMap<String, Endpoint>,
    egresses: &HashMap<String, Endpoint>,
    service_scratch_dir: &PathBuf,
    environment_scratch_dir: &PathBuf,
) -> Result<HashMap<String, String>> {
    let mut resolved_ingresses = HashMap::new();
    for (name, endpoint) in ingresses {
        resolved_ingresses.insert(name.clone(), ResolvedEndpoint::from_endpoint(endpoint)?);
    }
    let mut resolved_egresses = HashMap::new();
    for (name, endpoint) in egresses {
        resolved_egresses.insert(name.clone(), ResolvedEndpoint::from_endpoint(endpoint)?);
    }

    let wiring = RigWiring {
        ingresses: resolved_ingresses.clone(),
        egresses: resolved_egresses.clone(),
        service_scratch_dir: service_scratch_dir.clone(),
        environment_scratch_dir: environment_scratch_dir.clone(),
    };

    let mut env = HashMap::new();
    env.insert("RIG_WIRING".to_string(), serde_json::to_string(&wiring)?);
    env.insert("RIG_SERVICE".to_string(), service_name.to_string());
    env.insert(
        "RIG_TEMP_DIR".to_string(),
        service_scratch_dir.to_string_lossy().into_owned(),
    );
    env.insert(
        "RIG_ENV_DIR".to_string(),
        environment_scratch_dir.to_string_lossy().into_owned(),
    );

    for (name, endpoint) in &resolved_ingresses {
        for (attr, value) in &endpoint.attributes {
            let key = if name == "default" {
                attr.clone()
            } else {
                prefixed(name, attr)
            };
            env.insert(key, value.clone());
        }
    }

    for (name, endpoint) in &resolved_egresses {
        for (attr, value) in &endpoint.attributes {
            env.insert(prefixed(name, attr), value.clone());
        }
    }

    Ok(env)
}

fn prefixed(name: &str, attr: &str) -> String {
    format!("{}_{attr}", name.to_uppercase().replace('-', "_"))
}

/// Expands `$VAR`/`${VAR}` references in an argv list against the same
/// variable map `build_env` produced.
pub fn expand_argv(argv: &[String], env: &HashMap<String, String>) -> Result<Vec<String>> {
    argv.iter()
        .map(|arg| Template::parse(arg).resolve("argv", env))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rig_domain::Protocol;

    #[test]
    fn default_ingress_attributes_are_unprefixed() {
        let mut endpoint = Endpoint::new("127.0.0.1", 5432, Protocol::Tcp);
        endpoint.attributes.insert("PGHOST".into(), "${HOST}".into());
        let mut ingresses = HashMap::new();
        ingresses.insert("default".to_string(), endpoint);

        let env = build_env(
            "db",
            &ingresses,
            &HashMap::new(),
            &PathBuf::from("/scratch/db"),
            &PathBuf::from("/scratch/env"),
        )
        .unwrap();

        assert_eq!(env["PGHOST"], "127.0.0.1");
        assert_eq!(env["RIG_SERVICE"], "db");
    }

    #[test]
    fn non_default_ingress_attributes_are_prefixed() {
        let mut endpoint = Endpoint::new("127.0.0.1", 9000, Protocol::Http);
        endpoint.attributes.insert("PATH".into(), "/admin".into());
        let mut ingresses = HashMap::new();
        ingresses.insert("admin-ui".to_string(), endpoint);

        let env = build_env(
            "svc",
            &ingresses,
            &HashMap::new(),
            &PathBuf::from("/s"),
            &PathBuf::from("/e"),
        )
        .unwrap();
        assert_eq!(env["ADMIN_UI_PATH"], "/admin");
    }

    #[test]
    fn egress_attributes_are_always_prefixed() {
        let mut endpoint = Endpoint::new("127.0.0.1", 5432, Protocol::Tcp);
        endpoint.attributes.insert("PGHOST".into(), "${HOST}".into());
        let mut egresses = HashMap::new();
        egresses.insert("default".to_string(), endpoint);

        let env = build_env(
            "app",
            &HashMap::new(),
            &egresses,
            &PathBuf::from("/s"),
            &PathBuf::from("/e"),
        )
        .unwrap();
        assert_eq!(env["DEFAULT_PGHOST"], "127.0.0.1");
    }

    #[test]
    fn argv_expands_against_the_same_env_map() {
        let mut env = HashMap::new();
        env.insert("PORT".to_string(), "8080".to_string());
        let expanded = expand_argv(&["--port=$PORT".to_string()], &env).unwrap();
        assert_eq!(expanded, vec!["--port=8080".to_string()]);
    }
}
