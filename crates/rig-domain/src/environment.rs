//! The environment spec data model (spec §3, wire format §6.1).

use serde::{Deserialize, Serialize};

use crate::strict_map::StrictMap;

/// Top-level unit: a named graph of services.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Environment {
    pub name: String,
    #[serde(default)]
    pub observe: bool,
    pub services: StrictMap<Service>,
}

/// The full set of recognised `type` tags. A service whose `type` is not in
/// this list decodes fine (it's an opaque string here) but fails spec
/// validation with a "did you mean" suggestion (rule 2, §4.2).
pub const KNOWN_SERVICE_TYPES: &[&str] = &[
    "container",
    "process",
    "script",
    "go",
    "client",
    "postgres",
    "temporal",
    "redis",
    "custom",
    "proxy",
    "test",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Service {
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, rename = "args")]
    pub argv: Vec<String>,
    #[serde(default)]
    pub ingresses: StrictMap<IngressSpec>,
    #[serde(default)]
    pub egresses: StrictMap<EgressSpec>,
    #[serde(default)]
    pub hooks: Hooks,
    /// True for synthesised nodes (the `~test` root, per-edge proxies).
    /// Never set by a client-submitted spec; only by the transform layer.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub injected: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Http,
    Grpc,
    Kafka,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadyOverride {
    #[serde(rename = "type", default)]
    pub check_type: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressSpec {
    pub protocol: Protocol,
    #[serde(default, rename = "container_port")]
    pub container_port: Option<u16>,
    #[serde(default)]
    pub ready: Option<ReadyOverride>,
    #[serde(default)]
    pub attributes: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EgressSpec {
    pub service: String,
    #[serde(default)]
    pub ingress: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HookType {
    ClientFunc,
    Exec,
    Sql,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientFuncConfig {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hook {
    #[serde(rename = "type")]
    pub hook_type: HookType,
    #[serde(default)]
    pub client_func: Option<ClientFuncConfig>,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Hooks {
    #[serde(default)]
    pub prestart: Vec<Hook>,
    #[serde(default)]
    pub init: Vec<Hook>,
}

impl Environment {
    /// Parses the wire JSON format, rejecting duplicate keys anywhere in the
    /// `services`/`ingresses`/`egresses` maps (§6.1).
    pub fn from_json(input: &str) -> rig_common::error::Result<Self> {
        Ok(serde_json::from_str(input)?)
    }

    pub fn to_json(&self) -> rig_common::error::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> &'static str {
        r#"{
            "name": "t",
            "services": {
                "db": {"type": "postgres"},
                "app": {
                    "type": "go",
                    "config": {"module": "./cmd/app"},
                    "egresses": {"database": {"service": "db"}}
                }
            }
        }"#
    }

    #[test]
    fn decodes_happy_path_spec() {
        let env = Environment::from_json(sample_json()).unwrap();
        assert_eq!(env.name, "t");
        assert_eq!(env.services.len(), 2);
        assert_eq!(env.services["app"].service_type, "go");
    }

    #[test]
    fn rejects_duplicate_service_names() {
        let raw = r#"{"name":"t","services":{"a":{"type":"process"},"a":{"type":"process"}}}"#;
        assert!(Environment::from_json(raw).is_err());
    }

    #[test]
    fn round_trip_decode_encode_decode() {
        let env = Environment::from_json(sample_json()).unwrap();
        let encoded = env.to_json().unwrap();
        let reparsed = Environment::from_json(&encoded).unwrap();
        assert_eq!(env.name, reparsed.name);
        assert_eq!(env.services.len(), reparsed.services.len());
    }

    #[test]
    fn unknown_service_type_decodes_as_opaque_string() {
        // Recognising the type tag is a validation concern (rule 2, §4.2),
        // not a decode-time one: unrecognised types decode fine here.
        let raw = r#"{"name":"t","services":{"a":{"type":"spaceship"}}}"#;
        let env = Environment::from_json(raw).unwrap();
        assert_eq!(env.services["a"].service_type, "spaceship");
    }
}
