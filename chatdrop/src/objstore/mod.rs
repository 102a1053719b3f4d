use crate::{Config, Result};
use chrono::{DateTime, Utc};
use dyn_clone::DynClone;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

mod memory;
mod s3;

pub use memory::{MemoryBucket, MemoryObjectStorage, StoredObject};

/// An object storage system like S3.
///
/// The pipeline is written against this trait and [`Bucket`] rather than against any one SDK, so
/// that other object storage systems (and the in-memory implementation used in tests) can be
/// plugged in.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Get a handle to the named bucket.
    ///
    /// Implementations may validate that the bucket exists and is accessible, and fail if not.
    async fn bucket(&self, name: &str) -> Result<Box<dyn Bucket>>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// Summary of an object returned when listing a prefix
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Metadata about a single object.
///
/// Everything here except `size` is carried over when an object is copied.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub size: u64,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    pub content_disposition: Option<String>,
    pub content_encoding: Option<String>,
    pub content_language: Option<String>,
    /// User-defined metadata key/value pairs
    pub metadata: HashMap<String, String>,
}

/// Opaque handle identifying an unfinished [`Bucket::rewrite_object`] operation.
///
/// Only meaningful to the bucket that produced it, and only for the same source and target keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RewriteToken(String);

impl RewriteToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RewriteToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of a single [`Bucket::rewrite_object`] call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RewriteProgress {
    /// If present, the rewrite isn't finished and must be continued by calling `rewrite_object`
    /// again with this token.  `None` means the target object is complete.
    pub token: Option<RewriteToken>,
    pub bytes_rewritten: u64,
    pub total_bytes: u64,
}

/// A bucket which is like a namespace in which object storage systems store named objects.
///
/// Each implementation of this trait is specific to the corresponding implementation of
/// [`ObjectStorage`].
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait Bucket: DynClone + std::fmt::Debug + Sync + Send + 'static {
    fn name(&self) -> &str;

    /// Read an entire object as a stream of chunks.
    ///
    /// Fails right away if the object can't be read at all.  Errors that happen after the read
    /// started, such as a dropped connection, are delivered through the receiver, after which no
    /// more chunks are sent.  The receiver yields `None` once the whole object was read.
    async fn read_object(&self, key: &str) -> Result<mpsc::Receiver<Result<bytes::Bytes>>>;

    /// Upload the local file at `path` to the object `key`, replacing it if it exists.
    ///
    /// Implementations are free to split large files into parts.  Returns the number of bytes
    /// uploaded.
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<String>,
    ) -> Result<u64>;

    /// Upload a small object from memory in a single request
    async fn put_object(
        &self,
        key: &str,
        data: bytes::Bytes,
        content_type: Option<String>,
    ) -> Result<()>;

    /// Check whether the object `key` exists.
    ///
    /// A missing object is `Ok(false)`; errors are reserved for failures of the check itself.
    async fn object_exists(&self, key: &str) -> Result<bool>;

    async fn head_object(&self, key: &str) -> Result<ObjectMetadata>;

    /// List every object whose key starts with `prefix`, in key order
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>>;

    /// Copy `source_key` to `target_key` within this bucket, preserving the object metadata.
    ///
    /// Large objects may not be copied in a single call.  When the returned
    /// [`RewriteProgress::token`] is set, the caller must call this again with that token to
    /// continue, until a call returns no token.
    async fn rewrite_object(
        &self,
        source_key: &str,
        target_key: &str,
        token: Option<RewriteToken>,
    ) -> Result<RewriteProgress>;
}

dyn_clone::clone_trait_object!(Bucket);

/// Singleton type which constructs [`ObjectStorage`] implementations on demand.
#[derive(Debug)]
pub struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    /// Get the ObjectStorageFactory instance, creating it if it doesn't already exist.
    ///
    /// Note that the `config` argument is ignored if a factory instance was previously created
    /// with a prior call to this method.  It's not possible to have multiple configurations in use
    /// in a single process.
    pub fn instance(config: Config) -> Arc<Self> {
        static INSTANCE: OnceCell<Arc<ObjectStorageFactory>> = OnceCell::new();

        INSTANCE
            .get_or_init(move || Arc::new(Self { config }))
            .clone()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Given the URL to an object storage bucket, prefix, or object, determine which
    /// implementation handles that particular object storage technology and return an instance of
    /// it.
    #[allow(clippy::wrong_self_convention)] // For a factory object I think it's obvious what this means
    pub async fn from_url(&self, url: &Url) -> Result<Box<dyn ObjectStorage>> {
        if url.scheme() == "s3" {
            Ok(self.s3().await)
        } else {
            crate::error::UnsupportedObjectStorageSnafu { url: url.clone() }.fail()
        }
    }

    /// Return a [`ObjectStorage`] implementation for S3 or an S3-compatible API
    pub async fn s3(&self) -> Box<dyn ObjectStorage> {
        // Every call makes a new client rather than caching one for the whole process.  Clients
        // hold on to `hyper` resources tied to the tokio runtime they were created on, so sharing
        // one across runtimes (as happens in tests) can panic once the original runtime is gone.
        Box::new(s3::S3::new(self.config.clone()).await)
    }
}

/// Split an `s3://bucket/key` URL into its bucket and object key
pub fn parse_object_url(url: &Url) -> Result<(String, String)> {
    let bucket = url
        .host_str()
        .ok_or_else(|| crate::error::MissingBucketSnafu { url: url.clone() }.build())?;

    // The URL path starts with `/`, but that's the separator between bucket and key, not part of
    // the key
    let key = url.path().strip_prefix('/').unwrap_or(url.path());
    if key.is_empty() {
        return crate::error::MissingObjectKeySnafu { url: url.clone() }.fail();
    }

    let key = percent_encoding::percent_decode_str(key)
        .decode_utf8_lossy()
        .into_owned();

    Ok((bucket.to_string(), key))
}
