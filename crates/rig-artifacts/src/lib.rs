//! Artifact resolution: pulling Docker images, building local sources, and
//! downloading tarballs into a shared, content-addressed, lock-protected
//! cache (spec §4.4).

pub mod engine;
pub mod filelock;
pub mod resolver;
pub mod resolvers;

mod refresher;

pub use engine::{ArtifactEvent, Engine, EventSink};
pub use refresher::Refresher;
pub use resolver::{Artifact, Output, ResolveCtx, Resolver};

pub(crate) fn sanitize_cache_key(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
