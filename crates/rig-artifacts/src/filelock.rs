//! Cross-process advisory exclusive locks over `<cacheDir>/<key>.lock`
//! (spec §4.4, §9).

use std::path::Path;

use fs4::tokio::AsyncFileExt;
use tokio::fs::{File, OpenOptions};

use rig_common::error::Result;

/// Holds an exclusive lock for as long as it's alive; released on drop (via
/// `unlock`, which — unlike acquiring — never blocks) or explicitly.
pub struct FileLock {
    file: File,
}

impl FileLock {
    /// Acquires an exclusive lock on `path`, creating it if necessary.
    /// Blocks (asynchronously) until the lock is available.
    pub async fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)
            .await?;
        file.lock_exclusive().await?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = AsyncFileExt::unlock(&self.file);
    }
}
