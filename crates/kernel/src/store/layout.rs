//! On-disk cache layout.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs;
use tracing::{info, warn};

use super::{LocalContentStore, Namespace};

/// The cache root and its four namespace directories.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// Prepare the cache root, optionally wiping it first.
    ///
    /// Clearing is the only eviction the cache supports; entries are otherwise
    /// permanent.
    pub async fn prepare(root: &Path, clear: bool) -> Result<Self> {
        if clear {
            match fs::remove_dir_all(root).await {
                Ok(()) => info!(root = %root.display(), "cache cleared"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to clear cache at {}", root.display()));
                }
            }
        }

        for namespace in Namespace::ALL {
            let dir = root.join(namespace.relative_dir());
            fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Open the store for one namespace.
    pub async fn store(&self, namespace: Namespace) -> Result<LocalContentStore> {
        LocalContentStore::open(&self.root, namespace).await
    }

    /// Probe whether the cache root accepts writes.
    pub async fn is_writable(&self) -> bool {
        let root = self.root.clone();
        let probe = tokio::task::spawn_blocking(move || tempfile::tempfile_in(root)).await;
        match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                warn!(error = %e, "cache root is not writable");
                false
            }
            Err(e) => {
                warn!(error = %e, "cache write probe panicked");
                false
            }
        }
    }
}
