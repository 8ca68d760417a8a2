//! In-memory [`RemoteCache`] with failure injection and request counters.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::{CacheError, Digest, RemoteCache};

struct Fault {
    error: CacheError,
    /// `None` fails every download.
    remaining: Option<u32>,
}

/// Per-digest download failures.
#[derive(Default)]
pub struct FaultTable {
    faults: Mutex<HashMap<Digest, Fault>>,
}

impl FaultTable {
    /// Fail every download of `digest` with `error` until cleared.
    pub fn fail_always(&self, digest: Digest, error: CacheError) {
        self.faults.lock().insert(
            digest,
            Fault {
                error,
                remaining: None,
            },
        );
    }

    /// Fail the next `times` downloads of `digest`.
    pub fn fail_times(&self, digest: Digest, error: CacheError, times: u32) {
        if times == 0 {
            return;
        }
        self.faults.lock().insert(
            digest,
            Fault {
                error,
                remaining: Some(times),
            },
        );
    }

    pub fn clear(&self, digest: &Digest) -> bool {
        self.faults.lock().remove(digest).is_some()
    }

    pub fn clear_all(&self) {
        self.faults.lock().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.faults.lock().is_empty()
    }

    /// Consume one injected failure for `digest`, if any.
    fn take(&self, digest: &Digest) -> Option<CacheError> {
        let mut faults = self.faults.lock();
        let fault = faults.get_mut(digest)?;
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            None => false,
            Some(n) => {
                *n -= 1;
                *n == 0
            }
        };
        if exhausted {
            faults.remove(digest);
        }
        Some(error)
    }
}

/// Blob store held in memory.
#[derive(Default)]
pub struct InMemoryCache {
    blobs: RwLock<HashMap<Digest, Bytes>>,
    faults: FaultTable,
    successful_downloads: AtomicUsize,
    failed_downloads: AtomicUsize,
    find_missing_calls: Mutex<HashMap<Digest, usize>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-populated with `blobs`.
    pub fn with_blobs(blobs: impl IntoIterator<Item = Bytes>) -> Self {
        let cache = Self::new();
        for blob in blobs {
            cache.add_contents(blob);
        }
        cache
    }

    /// Store `data` and return its digest.
    pub fn add_contents(&self, data: impl Into<Bytes>) -> Digest {
        let data = data.into();
        let digest = Digest::compute(&data);
        self.blobs.write().insert(digest, data);
        digest
    }

    /// Register a download failure for the blob `data` would have, without
    /// storing it. Returns that digest.
    pub fn add_download_failure(&self, data: &[u8], error: CacheError) -> Digest {
        let digest = Digest::compute(data);
        self.faults.fail_always(digest, error);
        digest
    }

    pub fn faults(&self) -> &FaultTable {
        &self.faults
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.blobs.read().contains_key(digest)
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    pub fn successful_downloads(&self) -> usize {
        self.successful_downloads.load(Ordering::SeqCst)
    }

    pub fn failed_downloads(&self) -> usize {
        self.failed_downloads.load(Ordering::SeqCst)
    }

    /// How many times each digest was asked about by `find_missing_digests`.
    pub fn find_missing_calls(&self) -> HashMap<Digest, usize> {
        self.find_missing_calls.lock().clone()
    }
}

#[async_trait]
impl RemoteCache for InMemoryCache {
    async fn upload_blob(&self, digest: Digest, data: Bytes) -> Result<(), CacheError> {
        let actual = Digest::compute(&data);
        if actual != digest {
            return Err(CacheError::DigestMismatch {
                expected: digest,
                actual,
            });
        }
        trace!(%digest, "upload");
        self.blobs.write().entry(digest).or_insert(data);
        Ok(())
    }

    async fn download_blob(&self, digest: Digest) -> Result<Bytes, CacheError> {
        if let Some(error) = self.faults.take(&digest) {
            self.failed_downloads.fetch_add(1, Ordering::SeqCst);
            trace!(%digest, %error, "injected download failure");
            return Err(error);
        }
        let found = self.blobs.read().get(&digest).cloned();
        match found {
            Some(data) => {
                self.successful_downloads.fetch_add(1, Ordering::SeqCst);
                Ok(data)
            }
            None => {
                self.failed_downloads.fetch_add(1, Ordering::SeqCst);
                Err(CacheError::NotFound(digest))
            }
        }
    }

    async fn find_missing_digests(
        &self,
        digests: BTreeSet<Digest>,
    ) -> Result<BTreeSet<Digest>, CacheError> {
        {
            let mut calls = self.find_missing_calls.lock();
            for digest in &digests {
                *calls.entry(*digest).or_default() += 1;
            }
        }
        let blobs = self.blobs.read();
        Ok(digests
            .into_iter()
            .filter(|d| !blobs.contains_key(d))
            .collect())
    }
}
