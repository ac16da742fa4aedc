use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;

use crate::error::{AppError, Result};

/// Hex digest used to name cache files and derive schedule ids from URLs.
pub fn url_digest(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub url: String,
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
}

impl CacheStore {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.cache_dir
    }

    fn blob_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!("sched.{}", url_digest(url)))
    }

    fn staging_path(&self, url: &str) -> PathBuf {
        self.cache_dir.join(format!("tmp.{}", url_digest(url)))
    }

    /// Metadata for the live entry, without reading it.
    pub async fn entry(&self, url: &str) -> Result<Option<CacheEntry>> {
        let path = self.blob_path(url);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Io(e)),
        };

        // The blob's mtime doubles as the server's Last-Modified; the epoch means "unknown".
        let last_modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .filter(|d| d.as_secs() > 0)
            .and_then(|d| DateTime::from_timestamp(d.as_secs() as i64, 0));

        Ok(Some(CacheEntry {
            url: url.to_string(),
            path,
            size: meta.len(),
            last_modified,
        }))
    }

    /// Read the whole live entry.
    pub async fn get(&self, url: &str) -> Result<Option<(Vec<u8>, Option<DateTime<Utc>>)>> {
        let Some((mut file, entry)) = self.open(url).await? else {
            return Ok(None);
        };
        let mut bytes = Vec::with_capacity(entry.size as usize);
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut bytes).await?;
        Ok(Some((bytes, entry.last_modified)))
    }

    /// Open the live entry for streaming. The handle keeps reading the same
    /// contents even if a replacement is committed meanwhile.
    pub async fn open(&self, url: &str) -> Result<Option<(tokio::fs::File, CacheEntry)>> {
        let Some(entry) = self.entry(url).await? else {
            return Ok(None);
        };
        match tokio::fs::File::open(&entry.path).await {
            Ok(file) => Ok(Some((file, entry))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Start writing a replacement for `url`. Only one staging handle per URL may
    /// exist at a time; callers serialize their own writers.
    pub async fn begin_replace(&self, url: &str) -> Result<Staging> {
        let tmp_path = self.staging_path(url);
        let file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(AppError::CacheWrite)?;

        Ok(Staging {
            url: url.to_string(),
            tmp_path,
            final_path: self.blob_path(url),
            file: Some(file),
            written: 0,
            done: false,
        })
    }

    /// Make the staged bytes the live entry for their URL. Timestamps keep
    /// second precision.
    pub async fn commit(
        &self,
        mut staging: Staging,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<CacheEntry> {
        let file = staging
            .file
            .take()
            .ok_or_else(|| AppError::CacheWrite(std::io::Error::other("staging file already closed")))?;

        let mtime = match last_modified {
            Some(t) if t.timestamp() > 0 => UNIX_EPOCH + Duration::from_secs(t.timestamp() as u64),
            _ => UNIX_EPOCH,
        };
        seal(file, mtime).await.map_err(AppError::CacheWrite)?;

        tokio::fs::rename(&staging.tmp_path, &staging.final_path)
            .await
            .map_err(AppError::CacheWrite)?;
        staging.done = true;

        tracing::debug!(
            "Cached {} bytes for {} at {:?}",
            staging.written,
            staging.url,
            staging.final_path
        );

        Ok(CacheEntry {
            url: staging.url.clone(),
            path: staging.final_path.clone(),
            size: staging.written,
            last_modified: last_modified
                .filter(|t| t.timestamp() > 0)
                .and_then(|t| DateTime::from_timestamp(t.timestamp(), 0)),
        })
    }

    /// Throw away staged bytes. The live entry, if any, is untouched.
    pub async fn abort(&self, mut staging: Staging) -> Result<()> {
        drop(staging.file.take());
        staging.done = true;
        match tokio::fs::remove_file(&staging.tmp_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Io(e)),
        }
    }

    /// Remove the live entry. Returns whether there was one.
    pub async fn invalidate(&self, url: &str) -> Result<bool> {
        match tokio::fs::remove_file(self.blob_path(url)).await {
            Ok(()) => {
                tracing::debug!("Flushed cached copy of {}", url);
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(AppError::Io(e)),
        }
    }
}

async fn seal(mut file: tokio::fs::File, mtime: SystemTime) -> std::io::Result<()> {
    file.flush().await?;
    let file = file.into_std().await;
    tokio::task::spawn_blocking(move || {
        file.set_modified(mtime)?;
        file.sync_all()
    })
    .await
    .map_err(std::io::Error::other)?
}

/// A replacement being written. Dropping it without `commit`/`abort` removes
/// the temporary file.
#[derive(Debug)]
pub struct Staging {
    url: String,
    tmp_path: PathBuf,
    final_path: PathBuf,
    file: Option<tokio::fs::File>,
    written: u64,
    done: bool,
}

impl Staging {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| AppError::CacheWrite(std::io::Error::other("staging file already closed")))?;
        file.write_all(bytes).await.map_err(AppError::CacheWrite)?;
        self.written += bytes.len() as u64;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if !self.done {
            drop(self.file.take());
            // Must finish before drop returns: the next begin_replace for this
            // URL reuses the same staging path.
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
