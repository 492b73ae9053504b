//! Background refresher: during idle periods, revalidates mutable Docker
//! tags so a stale image doesn't linger in the cache indefinitely
//! (spec §4.4).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::filelock::FileLock;
use crate::resolvers::docker::DockerResolver;

const STALENESS_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

/// Periodically re-pulls mutable Docker tags whose cached entry hasn't been
/// checked in over `STALENESS_WINDOW`. Runs for the lifetime of the server;
/// cancel the token to stop it.
pub struct Refresher {
    cache_dir: PathBuf,
    check_interval: Duration,
    concurrency: Arc<Semaphore>,
}

impl Refresher {
    pub fn new(cache_dir: PathBuf, check_interval: Duration) -> Self {
        Self {
            cache_dir,
            check_interval,
            concurrency: Arc::new(Semaphore::new(2)),
        }
    }

    /// Scans the cache directory itself for Docker entries each tick: every
    /// subdirectory holding an `.image-ref` file is a previously-resolved
    /// image, read back into a fresh `DockerResolver` (spec §4.4). There is
    /// no caller-maintained resolver list to keep in sync with the cache.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.check_interval) => {}
            }

            for (output_dir, resolver) in self.scan_docker_entries().await {
                if !resolver.is_mutable() {
                    continue;
                }
                if !is_stale(&output_dir).await {
                    continue;
                }

                let permit = match self.concurrency.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let resolver = Arc::new(resolver);
                let cache_dir = self.cache_dir.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    if let Err(err) = refresh_one(&resolver, &cache_dir, &output_dir, &cancel).await {
                        warn!(image = resolver.image_ref(), error = %err, "background refresh failed");
                    }
                });
            }
        }
    }

    /// Reads every `<cache_dir>/*/. image-ref` marker back into a resolver,
    /// paired with the cache entry's own directory. Entries without the
    /// marker (non-Docker resolvers, or a Docker pull that never completed)
    /// are skipped.
    async fn scan_docker_entries(&self) -> Vec<(PathBuf, DockerResolver)> {
        let mut out = Vec::new();
        let Ok(mut dirs) = tokio::fs::read_dir(&self.cache_dir).await else {
            return out;
        };
        while let Ok(Some(entry)) = dirs.next_entry().await {
            let output_dir = entry.path();
            if !output_dir.is_dir() {
                continue;
            }
            let Ok(image_ref) = tokio::fs::read_to_string(output_dir.join(".image-ref")).await else {
                continue;
            };
            out.push((output_dir, DockerResolver::new(image_ref)));
        }
        out
    }
}

async fn is_stale(output_dir: &Path) -> bool {
    let marker = output_dir.join(".last-checked");
    let Ok(meta) = tokio::fs::metadata(&marker).await else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= STALENESS_WINDOW)
        .unwrap_or(true)
}

async fn refresh_one(
    resolver: &DockerResolver,
    cache_dir: &Path,
    output_dir: &Path,
    cancel: &CancellationToken,
) -> rig_common::error::Result<()> {
    let lock_path = cache_dir.join(format!("{}.lock", sanitize(&resolver.cache_key())));
    let _lock = tokio::select! {
        _ = cancel.cancelled() => return Err(rig_common::error::Error::Cancelled),
        lock = FileLock::acquire(&lock_path) => lock?,
    };

    let previous_id = tokio::fs::read_to_string(output_dir.join(".image-id")).await.ok();

    use crate::resolver::{ResolveCtx, Resolver};
    let ctx = ResolveCtx {
        cancel: cancel.clone(),
    };
    resolver.resolve(ctx, output_dir).await?;

    let new_id = tokio::fs::read_to_string(output_dir.join(".image-id")).await.ok();
    if previous_id != new_id {
        info!(image = resolver.image_ref(), "image tag moved, cache refreshed");
    }

    // Touch the staleness marker only on success, matching the cache-hit
    // path's own touch-on-use semantics.
    tokio::fs::write(output_dir.join(".last-checked"), b"").await?;
    Ok(())
}

use crate::sanitize_cache_key as sanitize;
