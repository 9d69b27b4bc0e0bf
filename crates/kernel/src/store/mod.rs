//! Content-addressed cache storage.
//!
//! Entries are addressed by fingerprint plus extension and are immutable once
//! published. The cache root holds four namespaces: input and output, each
//! split into images and videos.

mod layout;
mod local;

use std::fmt;
use std::pin::Pin;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use layout::CacheLayout;
pub use local::LocalContentStore;

use crate::fingerprint::Fingerprint;

/// Which side of the pipeline an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Input,
    Output,
}

/// Media family of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Image,
    Video,
}

/// One of the four cache namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub stage: Stage,
    pub kind: MediaKind,
}

impl Namespace {
    pub const INPUT_IMAGES: Self = Self::new(Stage::Input, MediaKind::Image);
    pub const INPUT_VIDEOS: Self = Self::new(Stage::Input, MediaKind::Video);
    pub const OUTPUT_IMAGES: Self = Self::new(Stage::Output, MediaKind::Image);
    pub const OUTPUT_VIDEOS: Self = Self::new(Stage::Output, MediaKind::Video);

    /// All namespaces, in creation order.
    pub const ALL: [Self; 4] = [
        Self::INPUT_IMAGES,
        Self::INPUT_VIDEOS,
        Self::OUTPUT_IMAGES,
        Self::OUTPUT_VIDEOS,
    ];

    pub const fn new(stage: Stage, kind: MediaKind) -> Self {
        Self { stage, kind }
    }

    /// Relative directory of this namespace under the cache root.
    pub fn relative_dir(self) -> &'static str {
        match (self.stage, self.kind) {
            (Stage::Input, MediaKind::Image) => "input/images",
            (Stage::Input, MediaKind::Video) => "input/videos",
            (Stage::Output, MediaKind::Image) => "output/images",
            (Stage::Output, MediaKind::Video) => "output/videos",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relative_dir())
    }
}

/// A readable cache entry.
pub struct Blob {
    /// Entry contents.
    pub reader: Pin<Box<dyn AsyncRead + Send>>,
    /// Size in bytes, known at open time.
    pub len: u64,
}

impl Blob {
    /// Read the whole entry into memory.
    pub async fn into_bytes(mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(usize::try_from(self.len).unwrap_or(0));
        self.reader
            .read_to_end(&mut buf)
            .await
            .context("failed to read cache entry")?;
        Ok(buf)
    }
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob").field("len", &self.len).finish()
    }
}

/// Content-addressed store bound to a single namespace.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Check whether an entry has been published.
    async fn exists(&self, fingerprint: &Fingerprint, extension: &str) -> Result<bool>;

    /// Open a published entry. `Ok(None)` when it does not exist.
    async fn open_for_read(&self, fingerprint: &Fingerprint, extension: &str)
    -> Result<Option<Blob>>;

    /// Publish an entry so that readers see either nothing or all of `data`.
    async fn write_atomic(&self, fingerprint: &Fingerprint, extension: &str, data: &[u8])
    -> Result<()>;

    /// Namespace this store serves.
    fn namespace(&self) -> Namespace;

    /// Read a whole entry into memory.
    async fn read_all(&self, fingerprint: &Fingerprint, extension: &str) -> Result<Option<Vec<u8>>> {
        match self.open_for_read(fingerprint, extension).await? {
            Some(blob) => Ok(Some(blob.into_bytes().await?)),
            None => Ok(None),
        }
    }
}

/// Reject extensions that could smuggle path syntax into an entry name.
fn validate_extension(extension: &str) -> Result<()> {
    if extension.is_empty()
        || extension.len() > 16
        || !extension.chars().all(|c| c.is_ascii_alphanumeric())
    {
        anyhow::bail!("invalid cache entry extension: {extension:?}");
    }
    Ok(())
}

/// File name of an entry.
fn entry_name(fingerprint: &Fingerprint, extension: &str) -> Result<String> {
    validate_extension(extension)?;
    Ok(format!("{fingerprint}.{extension}"))
}
