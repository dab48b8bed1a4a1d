//! Dataset fetching with an optional on-disk cache
//!
//! A [`DatasetSource`] is the upstream (in-memory or filesystem here; HTTP
//! lives outside this crate). [`DatasetCache`] stores fetched bytes on disk
//! and rejects entries that are absent or older than the caller's `since`.
//! [`Fetcher`] treats both rejections as a miss and refetches.

use super::UnpackTarget;
use crate::error::{LayoutError, Result};
use anyhow::Context;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

/// Upstream provider of raw dataset bytes
pub trait DatasetSource: Send + Sync {
    /// Fetch the bytes behind `url`
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<Bytes>>;
}

/// In-memory source keyed by url
#[derive(Debug, Default)]
pub struct MemorySource {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemorySource {
    /// Empty source
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `bytes` at `url`
    pub fn insert(&self, url: impl Into<String>, bytes: impl Into<Bytes>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.into(), bytes.into());
    }
}

impl DatasetSource for MemorySource {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<Bytes>> {
        let found = self
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url)
            .cloned();
        async move { found.with_context(|| format!("no dataset at `{url}`")) }.boxed()
    }
}

/// Filesystem source: urls are paths relative to `root` (`file://` allowed)
///
/// Urls that would leave `root` (`..`, drive prefixes) are rejected.
#[derive(Debug, Clone)]
pub struct FsSource {
    root: PathBuf,
}

impl FsSource {
    /// Source rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, url: &str) -> anyhow::Result<PathBuf> {
        let relative = Path::new(url.strip_prefix("file://").unwrap_or(url).trim_start_matches('/'));
        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    anyhow::bail!("`{url}` escapes {}", self.root.display());
                }
            }
        }
        Ok(path)
    }
}

impl DatasetSource for FsSource {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, anyhow::Result<Bytes>> {
        async move {
            let path = self.resolve(url)?;
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            Ok(Bytes::from(bytes))
        }
        .boxed()
    }
}

/// Why a cache lookup produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMiss {
    /// No entry for the url
    Absent,
    /// Entry older than the requested `since`
    Stale,
}

/// On-disk dataset cache, one file per url
#[derive(Debug, Clone)]
pub struct DatasetCache {
    dir: PathBuf,
}

impl DatasetCache {
    /// Cache stored under `dir` (created on first write)
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Cache directory
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the entry for `url`
    ///
    /// Names are stable across builds: a SHA-256 prefix of the url plus a
    /// readable tail.
    #[must_use]
    pub fn entry_path(&self, url: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(url.as_bytes()));
        let stem: String = url
            .chars()
            .rev()
            .take(48)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}-{stem}", &digest[..16]))
    }

    /// Cached bytes for `url`, rejected when absent or modified before `since`
    ///
    /// # Errors
    ///
    /// Returns the kind of miss
    pub async fn get(&self, url: &str, since: Option<SystemTime>) -> Result<Bytes, CacheMiss> {
        let path = self.entry_path(url);
        let metadata = tokio::fs::metadata(&path).await.map_err(|_| CacheMiss::Absent)?;
        if let Some(since) = since {
            let modified = metadata.modified().map_err(|_| CacheMiss::Stale)?;
            if modified < since {
                return Err(CacheMiss::Stale);
            }
        }
        let bytes = tokio::fs::read(&path).await.map_err(|_| CacheMiss::Absent)?;
        Ok(Bytes::from(bytes))
    }

    /// Store `bytes` for `url`, returning the entry's path
    ///
    /// # Errors
    ///
    /// Returns error if the directory or file cannot be written
    pub async fn put(&self, url: &str, bytes: &[u8]) -> anyhow::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create cache dir {}", self.dir.display()))?;
        let path = self.entry_path(url);
        tokio::fs::write(&path, bytes)
            .await
            .with_context(|| format!("Failed to write cache entry {}", path.display()))?;
        Ok(path)
    }
}

/// Source plus optional cache
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn DatasetSource>,
    cache: Option<DatasetCache>,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher").field("cache", &self.cache).finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Fetcher without a cache
    pub fn new(source: Arc<dyn DatasetSource>) -> Self {
        Self { source, cache: None }
    }

    /// Add an on-disk cache
    #[must_use]
    pub fn with_cache(mut self, cache: DatasetCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Bytes for `target`, from cache when fresh, else from the source
    ///
    /// A failed cache write is logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `DatasetResolution` if the source cannot provide the bytes
    pub async fn fetch(&self, target: &UnpackTarget) -> Result<Bytes> {
        let url = target.dataset.url.as_str();
        if let Some(cache) = &self.cache {
            match cache.get(url, target.since).await {
                Ok(bytes) => {
                    tracing::debug!(url, "dataset cache hit");
                    return Ok(bytes);
                }
                Err(miss) => tracing::debug!(url, ?miss, "dataset cache miss"),
            }
        }

        let bytes = self
            .source
            .fetch(url)
            .await
            .map_err(|e| LayoutError::dataset(url, format!("{e:#}")))?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put(url, &bytes).await {
                tracing::warn!(url, error = %format!("{e:#}"), "dataset cache write failed");
            }
        }
        Ok(bytes)
    }
}
