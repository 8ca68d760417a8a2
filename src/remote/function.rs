//! Blob downloads as graph nodes.

use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tracing::debug;

use super::{CacheError, Digest, RemoteCache, Retrier};
use crate::environment::Environment;
use crate::error::ComputeError;
use crate::function::ComputeFunction;
use crate::key::{FunctionTag, Key};
use crate::value::Value;

/// Tag for blob download nodes.
pub const BLOB: FunctionTag = FunctionTag::new("remote.blob");

/// Key whose value is the blob named by `digest`, as [`Bytes`].
pub fn blob_key(digest: Digest) -> Key {
    Key::new(BLOB, digest)
}

/// Downloads blobs from a [`RemoteCache`], retrying transient failures and
/// verifying the content against its digest. A failure becomes the node's
/// error; equal downloads prune like any other value.
pub struct DownloadBlobFunction {
    cache: Arc<dyn RemoteCache>,
    retrier: Retrier,
}

impl DownloadBlobFunction {
    pub fn new(cache: Arc<dyn RemoteCache>) -> Self {
        Self {
            cache,
            retrier: Retrier::default(),
        }
    }

    pub fn with_retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = retrier;
        self
    }
}

impl ComputeFunction for DownloadBlobFunction {
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let digest = *key
            .argument::<Digest>()
            .ok_or_else(|| anyhow!("{} is not keyed by a digest", key))?;
        let cache = Arc::clone(&self.cache);
        let data: Bytes = env.block_on(self.retrier.execute(move |attempt| {
            let cache = Arc::clone(&cache);
            async move {
                if attempt > 1 {
                    debug!(%digest, attempt, "retrying blob download");
                }
                cache.download_blob(digest).await
            }
        }))??;

        let actual = Digest::compute(&data);
        if actual != digest {
            return Err(CacheError::DigestMismatch {
                expected: digest,
                actual,
            }
            .into());
        }
        Ok(Value::new(data))
    }
}
