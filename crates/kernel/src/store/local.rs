//! Local filesystem content store.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

use super::{Blob, ContentStore, Namespace, entry_name};
use crate::fingerprint::Fingerprint;

/// Content store backed by one namespace directory under the cache root.
///
/// Writes go to a uniquely named temp file in the same directory and are
/// renamed into place, so a concurrent reader sees either no entry or the
/// complete one.
#[derive(Clone)]
pub struct LocalContentStore {
    dir: PathBuf,
    namespace: Namespace,
}

impl LocalContentStore {
    /// Open the store for `namespace` under `root`, creating its directory.
    pub async fn open(root: &Path, namespace: Namespace) -> Result<Self> {
        let dir = root.join(namespace.relative_dir());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache namespace {}", dir.display()))?;
        Ok(Self { dir, namespace })
    }

    /// Directory holding this namespace's entries.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, fingerprint: &Fingerprint, extension: &str) -> Result<PathBuf> {
        Ok(self.dir.join(entry_name(fingerprint, extension)?))
    }
}

#[async_trait]
impl ContentStore for LocalContentStore {
    async fn exists(&self, fingerprint: &Fingerprint, extension: &str) -> Result<bool> {
        let path = self.entry_path(fingerprint, extension)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to stat cache entry {}", path.display()))
    }

    async fn open_for_read(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
    ) -> Result<Option<Blob>> {
        let path = self.entry_path(fingerprint, extension)?;
        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to open cache entry {}", path.display()));
            }
        };
        let len = file
            .metadata()
            .await
            .context("failed to read cache entry metadata")?
            .len();

        debug!(namespace = %self.namespace, %fingerprint, size = len, "cache entry opened");
        Ok(Some(Blob {
            reader: Box::pin(file),
            len,
        }))
    }

    async fn write_atomic(
        &self,
        fingerprint: &Fingerprint,
        extension: &str,
        data: &[u8],
    ) -> Result<()> {
        let path = self.entry_path(fingerprint, extension)?;
        let dir = self.dir.clone();
        let data = data.to_vec();
        let size = data.len();

        let target = path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            // The namespace may have been cleared externally since open().
            std::fs::create_dir_all(&dir).context("failed to create cache namespace")?;

            // Same directory as the target, so the rename never crosses filesystems.
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)
                .context("failed to create temp file for cache entry")?;
            tmp.write_all(&data)
                .context("failed to write cache entry")?;
            tmp.as_file()
                .sync_all()
                .context("failed to sync cache entry")?;
            tmp.persist(&target)
                .map_err(|e| e.error)
                .context("failed to publish cache entry")?;
            Ok(())
        })
        .await
        .context("cache write task panicked")??;

        debug!(namespace = %self.namespace, path = %path.display(), size, "cache entry written");
        Ok(())
    }

    fn namespace(&self) -> Namespace {
        self.namespace
    }
}

impl std::fmt::Debug for LocalContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalContentStore")
            .field("dir", &self.dir)
            .field("namespace", &self.namespace)
            .finish()
    }
}
