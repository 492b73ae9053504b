//! Tarball download resolver: fetches a `.tar.gz` over HTTP, extracts one
//! named binary, and installs it atomically (spec §4.4).

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Client;

use rig_common::error::{Error, Result};

use crate::resolver::{Output, ResolveCtx, Resolver};

pub struct TarballResolver {
    url: String,
    binary_path_in_archive: String,
    binary_name: String,
    client: Client,
}

impl TarballResolver {
    pub fn new(
        url: impl Into<String>,
        binary_path_in_archive: impl Into<String>,
        binary_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            binary_path_in_archive: binary_path_in_archive.into(),
            binary_name: binary_name.into(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Resolver for TarballResolver {
    fn key(&self) -> &str {
        &self.url
    }

    fn cache_key(&self) -> String {
        format!("tarball:{}", self.url)
    }

    async fn cached(&self, output_dir: &Path) -> bool {
        tokio::fs::metadata(output_dir.join(&self.binary_name)).await.is_ok()
    }

    async fn resolve(&self, _ctx: ResolveCtx, output_dir: &Path) -> Result<Output> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::ArtifactFailed(format!("download of {} failed: {e}", self.url)))?;

        if !response.status().is_success() {
            return Err(Error::ArtifactFailed(format!(
                "download of {} returned status {}",
                self.url,
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| Error::ArtifactFailed(format!("failed to read response body: {e}")))?;

        let output_dir = output_dir.to_path_buf();
        let binary_path_in_archive = self.binary_path_in_archive.clone();
        let binary_name = self.binary_name.clone();

        let dest = tokio::task::spawn_blocking(move || -> Result<PathBuf> {
            extract_binary(&bytes, &binary_path_in_archive, &output_dir, &binary_name)
        })
        .await
        .map_err(|e| Error::Internal(e.into()))??;

        Ok(Output { path: dest })
    }

    fn retryable(&self) -> bool {
        true
    }
}

fn extract_binary(
    gzip_bytes: &[u8],
    path_in_archive: &str,
    output_dir: &Path,
    binary_name: &str,
) -> Result<PathBuf> {
    use flate2::read::GzDecoder;
    use std::io::Read;
    use tar::Archive;

    let decoder = GzDecoder::new(gzip_bytes);
    let mut archive = Archive::new(decoder);

    let mut found = None;
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();
        if path.to_string_lossy() == path_in_archive {
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            found = Some(buf);
            break;
        }
    }

    let contents = found.ok_or_else(|| {
        Error::ArtifactFailed(format!("archive did not contain {path_in_archive}"))
    })?;

    let final_path = output_dir.join(binary_name);
    let tmp_path = output_dir.join(format!(".{binary_name}.tmp"));
    std::fs::write(&tmp_path, &contents)?;

    let mut perms = std::fs::metadata(&tmp_path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&tmp_path, perms)?;

    std::fs::rename(&tmp_path, &final_path)?;
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn build_test_archive(entry_name: &str, contents: &[u8]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, entry_name, contents).unwrap();
        let tar_bytes = builder.into_inner().unwrap();

        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes).unwrap();
        encoder.finish().unwrap()
    }

    #[test]
    fn extracts_named_binary_and_sets_executable_bit() {
        let archive = build_test_archive("bin/app", b"#!/bin/sh\necho hi\n");
        let dir = tempfile::tempdir().unwrap();

        let dest = extract_binary(&archive, "bin/app", dir.path(), "app").unwrap();
        let meta = std::fs::metadata(&dest).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }

    #[test]
    fn missing_entry_is_an_error() {
        let archive = build_test_archive("bin/app", b"data");
        let dir = tempfile::tempdir().unwrap();
        let result = extract_binary(&archive, "bin/other", dir.path(), "app");
        assert!(result.is_err());
    }
}
