//! Content-addressed blob cache shared by all builds on the host.
//!
//! Every blob lives at `<parent>/<kind>/<sha256 hex>`. Writers stream into a
//! uniquely named temporary file inside the same kind directory and only
//! rename it onto the final name once the full stream hashed to the expected
//! digest. The rename is the only coordination between concurrent builds:
//! a reader that finds a file under its final name always sees a complete,
//! verified blob.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use chrono::{DateTime, Utc};
use sha2::{Digest as _, Sha256};
use stratum_core::config::CacheConfig;
use stratum_core::error::{BuildError, Result};
use stratum_core::Digest;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Prefix of in-flight temporary files; never a valid entry name.
const TMP_PREFIX: &str = ".tmp-";

/// Read buffer size used by [`ImageCache::store`].
const COPY_BUF_SIZE: usize = 64 * 1024;

/// Kind tag of a cache entry. Each kind owns one subdirectory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKind {
    /// OCI layer and config blobs
    Blob,
    /// Manifest blobs backing OCI layout roots
    OciLayout,
    /// Whole images fetched from hub registries
    Hub,
    /// JSON metadata records
    Metadata,
}

impl CacheKind {
    /// All kinds, in directory creation order.
    pub const ALL: [CacheKind; 4] = [
        CacheKind::Blob,
        CacheKind::OciLayout,
        CacheKind::Hub,
        CacheKind::Metadata,
    ];

    /// Subdirectory name for this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CacheKind::Blob => "blob",
            CacheKind::OciLayout => "oci-layout",
            CacheKind::Hub => "hub",
            CacheKind::Metadata => "metadata",
        }
    }

    /// Parse a kind from its directory name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.dir_name() == name)
    }
}

impl std::fmt::Display for CacheKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// A committed cache entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub kind: CacheKind,
    pub digest: Digest,
    pub path: PathBuf,
    pub size_bytes: u64,
    /// When the entry was committed (file mtime)
    pub modified: DateTime<Utc>,
}

/// Retention policy for [`ImageCache::clean_with_policy`].
#[derive(Debug, Clone, Default)]
pub struct CleanPolicy {
    /// Kinds to consider; empty means every kind
    pub kinds: Vec<CacheKind>,
    /// Only remove entries committed longer ago than this
    pub older_than: Option<chrono::Duration>,
}

impl CleanPolicy {
    /// Whether `entry` should be removed at time `now`.
    pub fn matches(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        let kind_ok = self.kinds.is_empty() || self.kinds.contains(&entry.kind);
        let age_ok = match self.older_than {
            Some(age) => now.signed_duration_since(entry.modified) > age,
            None => true,
        };
        kind_ok && age_ok
    }
}

/// Summary of a clean operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub entries_removed: usize,
    pub bytes_freed: u64,
    pub temp_files_removed: usize,
}

/// Content-addressed blob cache.
///
/// Construct once and share (`Arc<ImageCache>`) across builds; all methods
/// take `&self` and no lock is held across operations.
#[derive(Debug)]
pub struct ImageCache {
    root: PathBuf,
    /// Owns the backing directory when the cache is disabled
    scratch: Option<tempfile::TempDir>,
}

impl ImageCache {
    /// Open (creating if needed) the cache described by `config`.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let (root, scratch) = if config.disabled {
            let dir = tempfile::Builder::new()
                .prefix("stratum-cache-")
                .tempdir()
                .map_err(|e| {
                    BuildError::Config(format!("Failed to create temporary cache: {}", e))
                })?;
            (dir.path().to_path_buf(), Some(dir))
        } else {
            (config.resolve_dir()?, None)
        };

        for kind in CacheKind::ALL {
            let dir = root.join(kind.dir_name());
            std::fs::create_dir_all(&dir).map_err(|e| {
                BuildError::Config(format!(
                    "Failed to create cache directory {}: {}",
                    dir.display(),
                    e
                ))
            })?;
            Self::probe_writable(&dir)?;
        }

        tracing::debug!(
            root = %root.display(),
            disabled = config.disabled,
            "Opened image cache"
        );

        Ok(Self { root, scratch })
    }

    fn probe_writable(dir: &Path) -> Result<()> {
        let probe = dir.join(format!("{}probe-{}", TMP_PREFIX, uuid::Uuid::new_v4()));
        std::fs::write(&probe, b"").map_err(|e| {
            BuildError::Config(format!(
                "Cache directory {} is not writable: {}",
                dir.display(),
                e
            ))
        })?;
        let _ = std::fs::remove_file(&probe);
        Ok(())
    }

    /// Cache parent directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Whether this is a throwaway cache.
    pub fn is_disabled(&self) -> bool {
        self.scratch.is_some()
    }

    /// Directory holding entries of `kind`.
    pub fn kind_dir(&self, kind: CacheKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Final path of an entry. Does not imply the entry exists.
    pub fn entry_path(&self, kind: CacheKind, digest: &Digest) -> PathBuf {
        self.kind_dir(kind).join(digest.hex())
    }

    /// Whether a committed entry exists.
    pub fn exists(&self, kind: CacheKind, digest: &Digest) -> bool {
        std::fs::symlink_metadata(self.entry_path(kind, digest))
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    /// Start a streaming write of `digest` into the cache.
    ///
    /// Nothing is visible under the final name until [`PendingBlob::commit`]
    /// succeeds. Dropping the returned writer discards the partial data.
    pub async fn begin(&self, kind: CacheKind, digest: &Digest) -> Result<PendingBlob> {
        let tmp_path = self.kind_dir(kind).join(format!(
            "{}{}-{}",
            TMP_PREFIX,
            digest.short(),
            uuid::Uuid::new_v4()
        ));
        let file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| BuildError::from_io(&tmp_path, e))?;

        Ok(PendingBlob {
            file,
            hasher: Sha256::new(),
            written: 0,
            tmp_path,
            final_path: self.entry_path(kind, digest),
            kind,
            expected: digest.clone(),
            committed: false,
        })
    }

    /// Stream `reader` into the cache under `digest`.
    ///
    /// Fails with `DigestMismatch` (leaving the cache unchanged) if the bytes
    /// do not hash to `digest`, and with `Cancelled` if `cancel` fires first.
    /// Storing a digest that already exists rewrites an identical file.
    pub async fn store<R>(
        &self,
        kind: CacheKind,
        digest: &Digest,
        mut reader: R,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>
    where
        R: AsyncRead + Unpin,
    {
        let mut pending = self.begin(kind, digest).await?;
        let mut buf = vec![0u8; COPY_BUF_SIZE];

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => return Err(BuildError::Cancelled),
                read = reader.read(&mut buf) => read?,
            };
            if n == 0 {
                break;
            }
            pending.write_all(&buf[..n]).await?;
        }

        pending.commit().await
    }

    /// Read a committed entry fully into memory.
    pub async fn read(&self, kind: CacheKind, digest: &Digest) -> Result<Vec<u8>> {
        let path = self.entry_path(kind, digest);
        tokio::fs::read(&path)
            .await
            .map_err(|e| BuildError::from_io(&path, e))
    }

    /// List committed entries, optionally restricted to one kind.
    pub fn list(&self, kind: Option<CacheKind>) -> Result<Vec<CacheEntry>> {
        let kinds: Vec<CacheKind> = match kind {
            Some(k) => vec![k],
            None => CacheKind::ALL.to_vec(),
        };

        let mut entries = Vec::new();
        for kind in kinds {
            let dir = self.kind_dir(kind);
            let read_dir = match std::fs::read_dir(&dir) {
                Ok(rd) => rd,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(BuildError::from_io(&dir, e)),
            };

            for entry in read_dir {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Ok(digest) = Digest::from_hex(name) else {
                    continue;
                };
                let metadata = match entry.metadata() {
                    Ok(m) if m.is_file() => m,
                    _ => continue,
                };
                let modified = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                entries.push(CacheEntry {
                    kind,
                    digest,
                    path: entry.path(),
                    size_bytes: metadata.len(),
                    modified,
                });
            }
        }

        entries.sort_by(|a, b| a.modified.cmp(&b.modified));
        Ok(entries)
    }

    /// Total size of committed entries in bytes.
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list(None)?.iter().map(|e| e.size_bytes).sum())
    }

    /// Remove every entry for which `predicate` returns true.
    ///
    /// Out-of-band maintenance only; builds never call this.
    pub fn clean<F>(&self, predicate: F) -> Result<CleanReport>
    where
        F: Fn(&CacheEntry) -> bool,
    {
        let mut report = CleanReport::default();

        for entry in self.list(None)? {
            if !predicate(&entry) {
                continue;
            }
            match std::fs::remove_file(&entry.path) {
                Ok(()) => {
                    report.entries_removed += 1;
                    report.bytes_freed += entry.size_bytes;
                    tracing::debug!(
                        kind = %entry.kind,
                        digest = %entry.digest,
                        size_bytes = entry.size_bytes,
                        "Removed cache entry"
                    );
                }
                // Raced with another cleaner
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(BuildError::from_io(&entry.path, e)),
            }
        }

        Ok(report)
    }

    /// Apply a [`CleanPolicy`], also sweeping temp files abandoned by
    /// crashed writers that are older than the policy age.
    pub fn clean_with_policy(&self, policy: &CleanPolicy) -> Result<CleanReport> {
        let now = Utc::now();
        let mut report = self.clean(|entry| policy.matches(entry, now))?;
        let temp_age = policy.older_than.unwrap_or_else(|| chrono::Duration::hours(24));
        report.temp_files_removed = self.remove_stale_temps(temp_age)?;
        Ok(report)
    }

    /// Remove temp files older than `max_age`. Returns how many were removed.
    ///
    /// Young temp files may belong to a live writer and are left alone.
    pub fn remove_stale_temps(&self, max_age: chrono::Duration) -> Result<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for kind in CacheKind::ALL {
            let dir = self.kind_dir(kind);
            let Ok(read_dir) = std::fs::read_dir(&dir) else {
                continue;
            };
            for entry in read_dir.flatten() {
                let is_temp = entry
                    .file_name()
                    .to_str()
                    .map(|n| n.starts_with(TMP_PREFIX))
                    .unwrap_or(false);
                if !is_temp {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(DateTime::<Utc>::from)
                    .unwrap_or(now);
                if now.signed_duration_since(modified) > max_age
                    && std::fs::remove_file(entry.path()).is_ok()
                {
                    removed += 1;
                }
            }
        }

        Ok(removed)
    }
}

/// An in-flight cache write.
///
/// Implements [`AsyncWrite`]; bytes are hashed as they are written. Call
/// [`commit`](Self::commit) to verify and publish the entry.
pub struct PendingBlob {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
    tmp_path: PathBuf,
    final_path: PathBuf,
    kind: CacheKind,
    expected: Digest,
    committed: bool,
}

impl PendingBlob {
    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Verify the digest and atomically publish the entry.
    pub async fn commit(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let actual = Digest::from_hasher(std::mem::take(&mut self.hasher));
        if actual != self.expected {
            return Err(BuildError::DigestMismatch {
                kind: self.kind.to_string(),
                expected: self.expected.to_string(),
                actual: actual.to_string(),
            });
        }

        tokio::fs::rename(&self.tmp_path, &self.final_path)
            .await
            .map_err(|e| BuildError::from_io(&self.final_path, e))?;
        self.committed = true;

        tracing::debug!(
            kind = %self.kind,
            digest = %self.expected,
            size_bytes = self.written,
            "Committed cache entry"
        );

        Ok(self.final_path.clone())
    }
}

impl AsyncWrite for PendingBlob {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let this = self.get_mut();
        match Pin::new(&mut this.file).poll_write(cx, buf) {
            Poll::Ready(Ok(n)) => {
                this.hasher.update(&buf[..n]);
                this.written += n as u64;
                Poll::Ready(Ok(n))
            }
            other => other,
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().file).poll_shutdown(cx)
    }
}

impl Drop for PendingBlob {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}
