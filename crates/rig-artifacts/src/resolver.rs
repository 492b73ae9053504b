//! The `Resolver` capability trait and the artifacts engine's output type
//! (spec §4.4, design note on "dynamic dispatch" in §9).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use rig_common::error::Result;

/// One resolved artifact's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub path: PathBuf,
}

/// Context passed to a resolver's `resolve` call.
#[derive(Clone)]
pub struct ResolveCtx {
    pub cancel: CancellationToken,
}

/// A pre-resolved dependency a service consumes at start: a Docker image,
/// a compiled binary, a downloaded tarball.
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Stable identity used for in-process deduplication (e.g.
    /// `"docker:postgres:16"`, `"gobuild:/abs/path"`).
    fn key(&self) -> &str;

    /// Content cache key, distinct from `key()` in general (two resolver
    /// instances with the same logical key always share a cache key).
    fn cache_key(&self) -> String {
        self.key().to_string()
    }

    /// True if `output_dir` already contains resolver-specific evidence
    /// that this artifact has been resolved.
    async fn cached(&self, output_dir: &Path) -> bool;

    /// Performs the resolution, writing into `output_dir`.
    async fn resolve(&self, ctx: ResolveCtx, output_dir: &Path) -> Result<Output>;

    /// Network-class resolvers may be retried a bounded number of times;
    /// local resolvers should not be.
    fn retryable(&self) -> bool {
        false
    }

    /// Extra liveness check for artifacts that can disappear externally
    /// (e.g. a Docker image GC'd from the daemon's store).
    async fn valid(&self, _output: &Output) -> bool {
        true
    }
}

/// One artifact a service declares ahead of time.
pub struct Artifact {
    pub key: String,
    pub resolver: std::sync::Arc<dyn Resolver>,
}
