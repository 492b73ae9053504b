//! Wire-format spec types and the runtime data model: `Environment`,
//! `Service`, ingresses/egresses, `Endpoint`, and the `$VAR` template
//! grammar used to resolve attribute values at output boundaries.

pub mod endpoint;
pub mod environment;
pub mod id;
pub mod strict_map;
pub mod template;

pub use endpoint::Endpoint;
pub use environment::{
    EgressSpec, Environment, Hook, HookType, Hooks, IngressSpec, Protocol, ReadyOverride, Service,
    KNOWN_SERVICE_TYPES,
};
pub use id::EnvironmentId;
pub use strict_map::StrictMap;
