//! `Endpoint` — produced at runtime when a service publishes an ingress or
//! resolves an egress. Never mutated after publication (P4); templates in
//! its attribute map are resolved only at output boundaries (§4.9).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use rig_common::error::Result;

use crate::environment::Protocol;
use crate::template::{endpoint_vars, Template};

/// A resolved endpoint. Attribute *values* may still contain unresolved
/// `${HOST}`/`${PORT}`/`${HOSTPORT}` templates until `resolve_attributes`
/// is called at an output boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.into(),
            port,
            protocol,
            attributes: HashMap::new(),
        }
    }

    /// Resolves every `${HOST}`/`${PORT}`/`${HOSTPORT}` template in this
    /// endpoint's attribute values against its own address. Pure function
    /// of the endpoint (R3: a no-`$` attribute map round-trips unchanged).
    pub fn resolve_attributes(&self) -> Result<HashMap<String, String>> {
        let vars = endpoint_vars(&self.host, self.port);
        let mut out = HashMap::with_capacity(self.attributes.len());
        for (key, value) in &self.attributes {
            let resolved = Template::parse(value).resolve(key, &vars)?;
            out.insert(key.clone(), resolved);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_templates_against_own_address() {
        let mut ep = Endpoint::new("127.0.0.1", 5432, Protocol::Tcp);
        ep.attributes
            .insert("PGHOST".into(), "${HOST}".into());
        ep.attributes
            .insert("DSN".into(), "postgres://${HOSTPORT}/db".into());

        let resolved = ep.resolve_attributes().unwrap();
        assert_eq!(resolved["PGHOST"], "127.0.0.1");
        assert_eq!(resolved["DSN"], "postgres://127.0.0.1:5432/db");
    }

    #[test]
    fn no_dollar_attributes_round_trip_unchanged() {
        let mut ep = Endpoint::new("h", 1, Protocol::Http);
        ep.attributes.insert("PATH".into(), "/healthz".into());
        let resolved = ep.resolve_attributes().unwrap();
        assert_eq!(resolved["PATH"], "/healthz");
    }
}
