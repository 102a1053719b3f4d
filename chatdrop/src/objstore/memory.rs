//! In-process implementation of [`ObjectStorage`].
//!
//! Objects are kept in memory and vanish with the process.  Useful for tests and local
//! experiments; it also supports injecting failures into individual operations, and can be told
//! to split copies into several continued calls so the chunked copy protocol gets exercised
//! without multi-gigabyte objects.
use super::{Bucket, ObjectMetadata, ObjectStorage, ObjectSummary, RewriteProgress, RewriteToken};
use crate::Result;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use snafu::prelude::*;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tracing::debug;

/// Size of the chunks [`MemoryBucket::read_object`] delivers
const READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug, Default)]
pub struct MemoryObjectStorage {
    buckets: Arc<Mutex<HashMap<String, MemoryBucket>>>,
}

impl MemoryObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the named bucket, creating it if it doesn't exist yet.
    ///
    /// Unlike [`ObjectStorage::bucket`] this returns the concrete type, for setting up test data
    /// and inspecting results.
    pub fn memory_bucket(&self, name: &str) -> MemoryBucket {
        let mut buckets = self
            .buckets
            .lock()
            .expect("BUG: memory object storage lock poisoned");

        buckets
            .entry(name.to_string())
            .or_insert_with(|| MemoryBucket::new(name))
            .clone()
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryObjectStorage {
    async fn bucket(&self, name: &str) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(self.memory_bucket(name)))
    }
}

/// An object as held by [`MemoryBucket`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Bytes,
    pub metadata: ObjectMetadata,
    pub last_modified: DateTime<Utc>,
}

#[derive(Clone)]
pub struct MemoryBucket {
    inner: Arc<MemoryBucketInner>,
}

struct MemoryBucketInner {
    name: String,
    state: Mutex<BucketState>,
}

#[derive(Default)]
struct BucketState {
    objects: BTreeMap<String, StoredObject>,
    pending_rewrites: HashMap<String, PendingRewrite>,
    next_rewrite_id: u64,
    rewrite_chunk_size: Option<u64>,
    rewrite_calls: usize,
    faults: Faults,
}

#[derive(Default)]
struct Faults {
    uploads: HashSet<String>,
    reads: HashSet<String>,
    copies: HashSet<String>,
    exists_checks: bool,
    listings: bool,
}

/// A copy which was started but needs more calls to finish
struct PendingRewrite {
    source_key: String,
    target_key: String,
    /// Snapshot of the source taken when the rewrite started
    source: StoredObject,
    bytes_rewritten: u64,
}

impl MemoryBucket {
    fn new(name: &str) -> Self {
        Self {
            inner: Arc::new(MemoryBucketInner {
                name: name.to_string(),
                state: Mutex::new(BucketState::default()),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, BucketState> {
        self.inner
            .state
            .lock()
            .expect("BUG: memory bucket lock poisoned")
    }

    fn fault(&self, key: &str, operation: &'static str) -> crate::ChatDropError {
        crate::error::InjectedFaultSnafu {
            bucket: self.inner.name.clone(),
            key: key.to_string(),
            operation,
        }
        .build()
    }

    fn not_found(&self, key: &str) -> crate::ChatDropError {
        crate::error::ObjectNotFoundSnafu {
            bucket: self.inner.name.clone(),
            key: key.to_string(),
        }
        .build()
    }

    pub fn insert_object(&self, key: impl Into<String>, data: impl Into<Bytes>) {
        self.insert_object_with_metadata(key, data, ObjectMetadata::default())
    }

    /// Store an object with the given metadata.  The `size` in `metadata` is ignored and set from
    /// `data`.
    pub fn insert_object_with_metadata(
        &self,
        key: impl Into<String>,
        data: impl Into<Bytes>,
        metadata: ObjectMetadata,
    ) {
        let data = data.into();
        let metadata = ObjectMetadata {
            size: data.len() as u64,
            ..metadata
        };

        self.state().objects.insert(
            key.into(),
            StoredObject {
                data,
                metadata,
                last_modified: Utc::now(),
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.state().objects.get(key).cloned()
    }

    /// All object keys in the bucket, in order
    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.state()
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Make every upload to `key` fail
    pub fn fail_uploads_to(&self, key: impl Into<String>) {
        self.state().faults.uploads.insert(key.into());
    }

    /// Make every read of `key` fail
    pub fn fail_reads_of(&self, key: impl Into<String>) {
        self.state().faults.reads.insert(key.into());
    }

    /// Make every copy whose source is `key` fail
    pub fn fail_copies_from(&self, key: impl Into<String>) {
        self.state().faults.copies.insert(key.into());
    }

    pub fn fail_exists_checks(&self, fail: bool) {
        self.state().faults.exists_checks = fail;
    }

    pub fn fail_listings(&self, fail: bool) {
        self.state().faults.listings = fail;
    }

    /// Copy at most `chunk_size` bytes per [`Bucket::rewrite_object`] call, so copying larger
    /// objects needs continuation calls.  By default every copy completes in one call.
    pub fn set_rewrite_chunk_size(&self, chunk_size: u64) {
        self.state().rewrite_chunk_size = Some(chunk_size.max(1));
    }

    /// Total number of [`Bucket::rewrite_object`] calls made so far, continuations included
    pub fn rewrite_calls(&self) -> usize {
        self.state().rewrite_calls
    }

    /// Number of rewrites which were started but not finished
    pub fn pending_rewrites(&self) -> usize {
        self.state().pending_rewrites.len()
    }
}

#[async_trait::async_trait]
impl Bucket for MemoryBucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    async fn read_object(&self, key: &str) -> Result<mpsc::Receiver<Result<Bytes>>> {
        let data = {
            let state = self.state();

            if state.faults.reads.contains(key) {
                return Err(self.fault(key, "read"));
            }

            state
                .objects
                .get(key)
                .map(|object| object.data.clone())
                .ok_or_else(|| self.not_found(key))?
        };

        let (sender, receiver) = mpsc::channel(4);

        tokio::spawn(async move {
            let mut offset = 0;

            while offset < data.len() {
                let end = (offset + READ_CHUNK_SIZE).min(data.len());

                if sender.send(Ok(data.slice(offset..end))).await.is_err() {
                    // Reader lost interest
                    break;
                }

                offset = end;
            }
        });

        Ok(receiver)
    }

    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<String>,
    ) -> Result<u64> {
        if self.state().faults.uploads.contains(key) {
            return Err(self.fault(key, "upload"));
        }

        let data = tokio::fs::read(path)
            .await
            .with_context(|_| crate::error::ScratchIoSnafu { path })?;
        let len = data.len() as u64;

        debug!(bucket = %self.inner.name, key, len, ?content_type, "Storing uploaded file");

        self.insert_object_with_metadata(
            key,
            data,
            ObjectMetadata {
                content_type,
                ..Default::default()
            },
        );

        Ok(len)
    }

    async fn put_object(&self, key: &str, data: Bytes, content_type: Option<String>) -> Result<()> {
        if self.state().faults.uploads.contains(key) {
            return Err(self.fault(key, "upload"));
        }

        self.insert_object_with_metadata(
            key,
            data,
            ObjectMetadata {
                content_type,
                ..Default::default()
            },
        );

        Ok(())
    }

    async fn object_exists(&self, key: &str) -> Result<bool> {
        let state = self.state();

        if state.faults.exists_checks {
            return Err(self.fault(key, "exists"));
        }

        Ok(state.objects.contains_key(key))
    }

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        self.state()
            .objects
            .get(key)
            .map(|object| object.metadata.clone())
            .ok_or_else(|| self.not_found(key))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        let state = self.state();

        if state.faults.listings {
            return Err(self.fault(prefix, "list"));
        }

        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, object)| ObjectSummary {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: Some(object.last_modified),
            })
            .collect())
    }

    async fn rewrite_object(
        &self,
        source_key: &str,
        target_key: &str,
        token: Option<RewriteToken>,
    ) -> Result<RewriteProgress> {
        let mut state = self.state();
        state.rewrite_calls += 1;

        if state.faults.copies.contains(source_key) {
            if let Some(token) = &token {
                state.pending_rewrites.remove(token.as_str());
            }
            return Err(self.fault(source_key, "copy"));
        }

        let chunk_size = state.rewrite_chunk_size.unwrap_or(u64::MAX);

        let (token, mut pending) = match token {
            None => {
                let source = state
                    .objects
                    .get(source_key)
                    .cloned()
                    .ok_or_else(|| self.not_found(source_key))?;

                state.next_rewrite_id += 1;
                let token = format!("rewrite-{}", state.next_rewrite_id);

                (
                    token,
                    PendingRewrite {
                        source_key: source_key.to_string(),
                        target_key: target_key.to_string(),
                        source,
                        bytes_rewritten: 0,
                    },
                )
            }
            Some(token) => {
                let pending = state
                    .pending_rewrites
                    .remove(token.as_str())
                    .filter(|pending| {
                        pending.source_key == source_key && pending.target_key == target_key
                    })
                    .ok_or_else(|| {
                        crate::error::InvalidRewriteTokenSnafu {
                            bucket: self.inner.name.clone(),
                            target_key,
                            token: token.to_string(),
                        }
                        .build()
                    })?;

                (token.to_string(), pending)
            }
        };

        let total_bytes = pending.source.data.len() as u64;
        pending.bytes_rewritten = pending
            .bytes_rewritten
            .saturating_add(chunk_size)
            .min(total_bytes);
        let bytes_rewritten = pending.bytes_rewritten;

        if bytes_rewritten < total_bytes {
            debug!(bucket = %self.inner.name, source_key, target_key, bytes_rewritten, total_bytes, "Rewrite continues");

            state.pending_rewrites.insert(token.clone(), pending);

            return Ok(RewriteProgress {
                token: Some(RewriteToken::new(token)),
                bytes_rewritten,
                total_bytes,
            });
        }

        let mut object = pending.source;
        object.last_modified = Utc::now();
        state.objects.insert(target_key.to_string(), object);

        Ok(RewriteProgress {
            token: None,
            bytes_rewritten,
            total_bytes,
        })
    }
}

impl std::fmt::Debug for MemoryBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBucket")
            .field("name", &self.inner.name)
            .finish()
    }
}
