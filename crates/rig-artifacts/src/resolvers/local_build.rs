//! Local build resolver: builds a source tree with a configured command and
//! content-addresses the result by hashing the tree (spec §4.4).

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use rig_common::error::{Error, Result};

use crate::resolver::{Output, ResolveCtx, Resolver};

/// Builds a binary from a local source tree, e.g. `go build ./...`.
pub struct LocalBuildResolver {
    source_dir: PathBuf,
    build_cmd: Vec<String>,
    binary_name: String,
    target_triple: String,
}

impl LocalBuildResolver {
    pub fn new(
        source_dir: PathBuf,
        build_cmd: Vec<String>,
        binary_name: impl Into<String>,
        target_triple: impl Into<String>,
    ) -> Self {
        Self {
            source_dir,
            build_cmd,
            binary_name: binary_name.into(),
            target_triple: target_triple.into(),
        }
    }

    /// Hashes the tracked source tree. Prefers `git ls-files` (so untracked
    /// scratch files don't bust the cache); falls back to a full walk if
    /// the tree isn't a git checkout.
    async fn hash_source_tree(&self) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(self.target_triple.as_bytes());
        for arg in &self.build_cmd {
            hasher.update(arg.as_bytes());
        }

        let tracked = Command::new("git")
            .args(["ls-files"])
            .current_dir(&self.source_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .output()
            .await;

        let files = match tracked {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
                .lines()
                .map(|s| s.to_string())
                .collect::<Vec<_>>(),
            _ => walk_files(&self.source_dir).await?,
        };
        let mut files = files;
        files.sort();

        for rel in &files {
            let full = self.source_dir.join(rel);
            if let Ok(bytes) = tokio::fs::read(&full).await {
                hasher.update(rel.as_bytes());
                hasher.update(&bytes);
            }
        }

        Ok(hex::encode(hasher.finalize()))
    }
}

async fn walk_files(dir: &Path) -> Result<Vec<String>> {
    let mut stack = vec![dir.to_path_buf()];
    let mut files = Vec::new();
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
                    continue;
                }
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(dir) {
                files.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    Ok(files)
}

#[async_trait]
impl Resolver for LocalBuildResolver {
    fn key(&self) -> &str {
        self.source_dir.to_str().unwrap_or("local-build")
    }

    fn cache_key(&self) -> String {
        format!("localbuild:{}:{}", self.source_dir.display(), self.target_triple)
    }

    /// A cached binary only counts if the source tree that produced it
    /// hasn't changed since: `cache_key` alone can't see past a git checkout
    /// mutating in place at the same path, so the stored `.source-hash` is
    /// compared against a fresh `hash_source_tree()` on every check.
    async fn cached(&self, output_dir: &Path) -> bool {
        if tokio::fs::metadata(output_dir.join(&self.binary_name)).await.is_err() {
            return false;
        }
        let Ok(stored) = tokio::fs::read_to_string(output_dir.join(".source-hash")).await else {
            return false;
        };
        let Ok(current) = self.hash_source_tree().await else {
            return false;
        };
        stored == current
    }

    async fn resolve(&self, _ctx: ResolveCtx, output_dir: &Path) -> Result<Output> {
        let [program, args @ ..] = self.build_cmd.as_slice() else {
            return Err(Error::ArtifactFailed("empty build command".into()));
        };

        let status = Command::new(program)
            .args(args)
            .current_dir(&self.source_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::ArtifactFailed(format!("failed to spawn build command: {e}")))?;

        if !status.status.success() {
            let stderr = String::from_utf8_lossy(&status.stderr);
            return Err(Error::ArtifactFailed(format!(
                "build command failed: {}",
                stderr.trim()
            )));
        }

        let built_binary = self.source_dir.join(&self.binary_name);
        let dest = output_dir.join(&self.binary_name);
        tokio::fs::copy(&built_binary, &dest).await.map_err(|e| {
            Error::ArtifactFailed(format!(
                "build succeeded but binary {} was not produced: {e}",
                built_binary.display()
            ))
        })?;

        let digest = self.hash_source_tree().await?;
        tokio::fs::write(output_dir.join(".source-hash"), &digest).await?;

        Ok(Output { path: dest })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_are_stable_for_unchanged_tree() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("main.go"), b"package main").await.unwrap();

        let resolver = LocalBuildResolver::new(
            dir.path().to_path_buf(),
            vec!["true".into()],
            "app".into(),
            "x86_64-unknown-linux-gnu".into(),
        );

        let first = resolver.hash_source_tree().await.unwrap();
        let second = resolver.hash_source_tree().await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn hash_changes_when_source_changes() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("main.go"), b"package main").await.unwrap();
        let resolver = LocalBuildResolver::new(
            dir.path().to_path_buf(),
            vec!["true".into()],
            "app".into(),
            "x86_64-unknown-linux-gnu".into(),
        );
        let before = resolver.hash_source_tree().await.unwrap();

        tokio::fs::write(dir.path().join("main.go"), b"package main // changed").await.unwrap();
        let after = resolver.hash_source_tree().await.unwrap();
        assert_ne!(before, after);
    }
}
