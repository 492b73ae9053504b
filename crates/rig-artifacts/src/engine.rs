//! The artifact engine: parallel, deduplicated, content-addressed artifact
//! resolution with cross-process locks (spec §4.4).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use rig_common::error::{Error, Result};

use crate::filelock::FileLock;
use crate::resolver::{Artifact, Output, ResolveCtx, Resolver};

/// Lifecycle events the engine reports via an optional callback.
#[derive(Debug, Clone)]
pub enum ArtifactEvent {
    Started { key: String },
    Completed { key: String },
    Cached { key: String },
    Failed { key: String, error: String },
}

pub type EventSink = Arc<dyn Fn(ArtifactEvent) + Send + Sync>;

pub struct Engine {
    cache_dir: PathBuf,
    on_event: Option<EventSink>,
}

impl Engine {
    pub fn new(cache_dir: PathBuf) -> Self {
        Self {
            cache_dir,
            on_event: None,
        }
    }

    pub fn with_event_sink(mut self, sink: EventSink) -> Self {
        self.on_event = Some(sink);
        self
    }

    fn emit(&self, event: ArtifactEvent) {
        if let Some(sink) = &self.on_event {
            sink(event);
        }
    }

    /// Resolves every unique artifact key in `artifacts` to completion
    /// before returning. Duplicate keys collapse to a single resolution
    /// and every caller receives the same `Output`. On any resolver error,
    /// peers are cancelled and the first real error (not a cancellation)
    /// is returned.
    pub async fn resolve_all(
        &self,
        artifacts: Vec<Artifact>,
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, Output>> {
        let mut unique: HashMap<String, Arc<dyn Resolver>> = HashMap::new();
        for artifact in artifacts {
            unique.entry(artifact.key.clone()).or_insert(artifact.resolver);
        }

        let peer_cancel = cancel.child_token();
        let mut tasks = tokio::task::JoinSet::new();

        for (key, resolver) in unique {
            let cache_dir = self.cache_dir.clone();
            let cancel = peer_cancel.clone();
            let on_event = self.on_event.clone();
            tasks.spawn(async move {
                let result = resolve_one(&key, resolver, &cache_dir, cancel, on_event).await;
                (key, result)
            });
        }

        let mut outputs = HashMap::new();
        let mut first_error: Option<Error> = None;

        while let Some(joined) = tasks.join_next().await {
            let (key, result) = joined.map_err(|e| Error::Internal(e.into()))?;
            match result {
                Ok(output) => {
                    outputs.insert(key, output);
                }
                Err(Error::Cancelled) => {
                    // Suppressed: this peer was cancelled because another
                    // one failed first.
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                        peer_cancel.cancel();
                    }
                }
            }
        }

        if let Some(err) = first_error {
            return Err(err);
        }
        Ok(outputs)
    }
}

async fn resolve_one(
    key: &str,
    resolver: Arc<dyn Resolver>,
    cache_dir: &Path,
    cancel: CancellationToken,
    on_event: Option<EventSink>,
) -> Result<Output> {
    let emit = |event: ArtifactEvent| {
        if let Some(sink) = &on_event {
            sink(event);
        }
    };

    let output_dir = cache_dir.join(sanitize(&resolver.cache_key()));
    tokio::fs::create_dir_all(&output_dir).await?;
    let output = Output {
        path: output_dir.clone(),
    };

    if resolver.cached(&output_dir).await && resolver.valid(&output).await {
        touch(&output_dir.join(".last-used")).await;
        emit(ArtifactEvent::Cached { key: key.to_string() });
        return Ok(output);
    }

    emit(ArtifactEvent::Started { key: key.to_string() });

    let lock_path = cache_dir.join(format!("{}.lock", sanitize(&resolver.cache_key())));
    let lock = tokio::select! {
        _ = cancel.cancelled() => return Err(Error::Cancelled),
        lock = FileLock::acquire(&lock_path) => lock?,
    };

    // Re-check under the lock: another process may have populated the
    // cache while we were waiting for it.
    if resolver.cached(&output_dir).await && resolver.valid(&output).await {
        drop(lock);
        touch(&output_dir.join(".last-used")).await;
        emit(ArtifactEvent::Cached { key: key.to_string() });
        return Ok(output);
    }

    let result = resolve_with_retry(&*resolver, &cancel, &output_dir).await;
    drop(lock);

    match &result {
        Ok(_) => emit(ArtifactEvent::Completed { key: key.to_string() }),
        Err(Error::Cancelled) => {}
        Err(err) => emit(ArtifactEvent::Failed {
            key: key.to_string(),
            error: err.to_string(),
        }),
    }
    result
}

async fn resolve_with_retry(
    resolver: &dyn Resolver,
    cancel: &CancellationToken,
    output_dir: &Path,
) -> Result<Output> {
    const BACKOFFS: [Duration; 2] = [Duration::from_secs(1), Duration::from_secs(2)];
    let max_attempts = if resolver.retryable() { BACKOFFS.len() + 1 } else { 1 };

    let mut last_err = None;
    for attempt in 0..max_attempts {
        let ctx = ResolveCtx {
            cancel: cancel.clone(),
        };
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = resolver.resolve(ctx, output_dir) => {
                match result {
                    Ok(output) => return Ok(output),
                    Err(err) => last_err = Some(err),
                }
            }
        }
        if attempt < BACKOFFS.len() && resolver.retryable() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(BACKOFFS[attempt]) => {}
            }
        }
    }
    Err(last_err.unwrap_or(Error::ArtifactFailed("resolver failed with no error".into())))
}

async fn touch(path: &Path) {
    let _ = tokio::fs::write(path, b"").await;
}

use crate::sanitize_cache_key as sanitize;

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingResolver {
        key: String,
        calls: Arc<AtomicUsize>,
        fail: bool,
        retryable: bool,
    }

    #[async_trait]
    impl Resolver for CountingResolver {
        fn key(&self) -> &str {
            &self.key
        }

        async fn cached(&self, output_dir: &Path) -> bool {
            output_dir.join(".marker").exists()
        }

        async fn resolve(&self, _ctx: ResolveCtx, output_dir: &Path) -> Result<Output> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(Error::ArtifactFailed("boom".into()));
            }
            tokio::fs::write(output_dir.join(".marker"), b"ok").await?;
            Ok(Output {
                path: output_dir.to_path_buf(),
            })
        }

        fn retryable(&self) -> bool {
            self.retryable
        }
    }

    #[tokio::test]
    async fn dedups_identical_keys_to_one_resolution() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().to_path_buf());
        let calls = Arc::new(AtomicUsize::new(0));

        let resolver: Arc<dyn Resolver> = Arc::new(CountingResolver {
            key: "shared".into(),
            calls: calls.clone(),
            fail: false,
            retryable: false,
        });

        let artifacts = vec![
            Artifact {
                key: "shared".into(),
                resolver: resolver.clone(),
            },
            Artifact {
                key: "shared".into(),
                resolver: resolver.clone(),
            },
        ];

        let cancel = CancellationToken::new();
        let outputs = engine.resolve_all(artifacts, &cancel).await.unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_hit_skips_resolver_invocation() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().to_path_buf());
        let calls = Arc::new(AtomicUsize::new(0));
        let resolver: Arc<dyn Resolver> = Arc::new(CountingResolver {
            key: "k".into(),
            calls: calls.clone(),
            fail: false,
            retryable: false,
        });

        let cancel = CancellationToken::new();
        engine
            .resolve_all(
                vec![Artifact {
                    key: "k".into(),
                    resolver: resolver.clone(),
                }],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        engine
            .resolve_all(
                vec![Artifact {
                    key: "k".into(),
                    resolver: resolver.clone(),
                }],
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1, "second call should hit cache");
    }

    #[tokio::test]
    async fn one_failure_cancels_peers_and_surfaces_first_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path().to_path_buf());
        let calls = Arc::new(AtomicUsize::new(0));

        let failing: Arc<dyn Resolver> = Arc::new(CountingResolver {
            key: "fail".into(),
            calls: calls.clone(),
            fail: true,
            retryable: false,
        });
        let slow: Arc<dyn Resolver> = Arc::new(SlowResolver {
            key: "slow".into(),
        });

        let cancel = CancellationToken::new();
        let start = std::time::Instant::now();
        let result = engine
            .resolve_all(
                vec![
                    Artifact {
                        key: "fail".into(),
                        resolver: failing,
                    },
                    Artifact {
                        key: "slow".into(),
                        resolver: slow,
                    },
                ],
                &cancel,
            )
            .await;

        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("boom"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    struct SlowResolver {
        key: String,
    }

    #[async_trait]
    impl Resolver for SlowResolver {
        fn key(&self) -> &str {
            &self.key
        }

        async fn cached(&self, _output_dir: &Path) -> bool {
            false
        }

        async fn resolve(&self, ctx: ResolveCtx, _output_dir: &Path) -> Result<Output> {
            ctx.cancel.cancelled().await;
            Err(Error::Cancelled)
        }
    }
}
