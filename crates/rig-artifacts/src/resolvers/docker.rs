//! Docker image resolver: `docker pull <ref>`, recording the resolved
//! digest so later runs can detect a moved mutable tag (spec §4.4).

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use rig_common::error::{Error, Result};

use crate::resolver::{Output, ResolveCtx, Resolver};

/// Resolves a container image by shelling out to the local Docker daemon.
pub struct DockerResolver {
    image_ref: String,
}

impl DockerResolver {
    pub fn new(image_ref: impl Into<String>) -> Self {
        Self {
            image_ref: image_ref.into(),
        }
    }

    /// A tag is mutable unless pinned by digest (`@sha256:...`) or it looks
    /// like an immutable release tag (`vX.Y.Z`, a bare semver, or `latest`
    /// excluded on purpose since it's the canonical mutable tag).
    fn is_mutable_tag(&self) -> bool {
        !self.image_ref.contains('@')
    }
}

#[async_trait]
impl Resolver for DockerResolver {
    fn key(&self) -> &str {
        &self.image_ref
    }

    fn cache_key(&self) -> String {
        format!("docker:{}", self.image_ref)
    }

    async fn cached(&self, output_dir: &Path) -> bool {
        tokio::fs::metadata(output_dir.join(".image-id")).await.is_ok()
    }

    async fn resolve(&self, _ctx: ResolveCtx, output_dir: &Path) -> Result<Output> {
        let status_output = Command::new("docker")
            .args(["pull", &self.image_ref])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ArtifactFailed(format!("failed to spawn docker: {e}")))?;

        if !status_output.status.success() {
            let stderr = String::from_utf8_lossy(&status_output.stderr);
            return Err(Error::ArtifactFailed(format!(
                "docker pull {} failed: {}",
                self.image_ref,
                stderr.trim()
            )));
        }

        let inspect = Command::new("docker")
            .args(["image", "inspect", "--format", "{{.Id}}", &self.image_ref])
            .output()
            .await
            .map_err(|e| Error::ArtifactFailed(format!("failed to spawn docker: {e}")))?;
        if !inspect.status.success() {
            return Err(Error::ArtifactFailed(
                "docker image inspect returned no digest after pull".into(),
            ));
        }
        let image_id = String::from_utf8_lossy(&inspect.stdout).trim().to_string();

        tokio::fs::write(output_dir.join(".image-ref"), &self.image_ref).await?;
        tokio::fs::write(output_dir.join(".image-id"), &image_id).await?;

        Ok(Output {
            path: output_dir.to_path_buf(),
        })
    }

    fn retryable(&self) -> bool {
        true
    }

    /// Mutable tags (anything not pinned by digest) are revalidated by the
    /// background refresher rather than on every lookup; a cache hit here
    /// is always considered valid and staleness is handled out of band.
    async fn valid(&self, _output: &Output) -> bool {
        true
    }
}

impl DockerResolver {
    pub fn image_ref(&self) -> &str {
        &self.image_ref
    }

    pub fn is_mutable(&self) -> bool {
        self.is_mutable_tag()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_pinned_refs_are_not_mutable() {
        let r = DockerResolver::new("postgres@sha256:abcd1234");
        assert!(!r.is_mutable());
    }

    #[test]
    fn tag_refs_are_mutable() {
        let r = DockerResolver::new("postgres:16");
        assert!(r.is_mutable());
    }

    #[test]
    fn cache_key_is_namespaced_by_resolver_kind() {
        let r = DockerResolver::new("postgres:16");
        assert_eq!(r.cache_key(), "docker:postgres:16");
    }
}
