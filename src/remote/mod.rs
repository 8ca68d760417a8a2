//! Remote cache contract: a digest-addressed blob store.
//!
//! The engine only depends on the [`RemoteCache`] trait. [`InMemoryCache`]
//! implements it in memory, with per-digest failure injection for tests of
//! error paths. [`DownloadBlobFunction`] exposes downloads as graph nodes so
//! blob fetches are memoized and coalesced like any other computation.

mod digest;
mod function;
mod memory;
mod retry;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

pub use digest::{Digest, DigestParseError};
pub use function::{blob_key, DownloadBlobFunction, BLOB};
pub use memory::{FaultTable, InMemoryCache};
pub use retry::Retrier;

#[derive(Debug, Clone, thiserror::Error)]
pub enum CacheError {
    #[error("blob {0} not found")]
    NotFound(Digest),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("remote cache i/o error: {0}")]
    Io(Arc<std::io::Error>),

    /// Retry backoff was configured, but no tokio runtime is current to
    /// sleep on.
    #[error("retry backoff requires a tokio runtime")]
    NoRuntime,
}

impl CacheError {
    #[must_use]
    pub fn io(kind: std::io::ErrorKind, message: impl Into<String>) -> Self {
        CacheError::Io(Arc::new(std::io::Error::new(kind, message.into())))
    }

    /// Transport failures may succeed on retry; a missing blob or corrupt
    /// content will not.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, CacheError::Io(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

/// A content-addressed blob store.
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Store `data` under `digest`. Uploading an existing blob is a no-op.
    async fn upload_blob(&self, digest: Digest, data: Bytes) -> Result<(), CacheError>;

    async fn download_blob(&self, digest: Digest) -> Result<Bytes, CacheError>;

    /// The subset of `digests` the store does not hold.
    async fn find_missing_digests(
        &self,
        digests: BTreeSet<Digest>,
    ) -> Result<BTreeSet<Digest>, CacheError>;
}

/// Upload whichever of `blobs` the cache is missing. Returns the digest of
/// every blob, in input order.
pub async fn upload_missing<C: RemoteCache + ?Sized>(
    cache: &C,
    blobs: Vec<Bytes>,
) -> Result<Vec<Digest>, CacheError> {
    let digests: Vec<Digest> = blobs.iter().map(|b| Digest::compute(b)).collect();
    let mut missing = cache
        .find_missing_digests(digests.iter().copied().collect())
        .await?;
    debug!(blobs = blobs.len(), missing = missing.len(), "uploading missing blobs");
    for (digest, data) in digests.iter().zip(blobs) {
        if missing.remove(digest) {
            cache.upload_blob(*digest, data).await?;
        }
    }
    Ok(digests)
}
