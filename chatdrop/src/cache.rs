//! Recording of completed chat exports in a small document store.
//!
//! The document store is an external key-value system addressed by collection path and document
//! id.  [`DocumentStore`] abstracts over it; [`ObjectDocumentStore`] keeps documents as JSON objects
//! in a bucket and [`MemoryDocumentStore`] keeps them in process.
use crate::objstore::Bucket;
use crate::route::ArchiveUpload;
use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use snafu::prelude::*;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, instrument};

/// Name of the field holding the time a completion was recorded
pub const UPDATED_AT_FIELD: &str = "updated_at";

/// The value of a single document field
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    Timestamp(DateTime<Utc>),
    /// Replaced with the store's own clock at the time the document is written
    ServerTimestamp,
}

impl FieldValue {
    /// Resolve a [`FieldValue::ServerTimestamp`] to `now`; other values are unchanged
    pub fn resolve(self, now: DateTime<Utc>) -> Self {
        match self {
            Self::ServerTimestamp => Self::Timestamp(now),
            other => other,
        }
    }

    fn to_json(&self, now: DateTime<Utc>) -> serde_json::Value {
        match self {
            Self::String(value) => value.clone().into(),
            Self::Integer(value) => (*value).into(),
            Self::Boolean(value) => (*value).into(),
            Self::Timestamp(value) => value.to_rfc3339_opts(SecondsFormat::Micros, true).into(),
            Self::ServerTimestamp => now.to_rfc3339_opts(SecondsFormat::Micros, true).into(),
        }
    }
}

/// Named fields of a document
pub type Document = BTreeMap<String, FieldValue>;

/// A key-value document store
#[async_trait::async_trait]
pub trait DocumentStore: std::fmt::Debug + Sync + Send + 'static {
    /// Write `fields` as the document `document_id` in `collection_path`, replacing the document
    /// if it exists.
    async fn upsert_document(
        &self,
        collection_path: &str,
        document_id: &str,
        fields: Document,
    ) -> Result<()>;
}

/// Document store which keeps each document as a JSON object at `{collection_path}/{document_id}`
/// in a bucket
#[derive(Clone, Debug)]
pub struct ObjectDocumentStore {
    bucket: Box<dyn Bucket>,
}

impl ObjectDocumentStore {
    pub fn new(bucket: Box<dyn Bucket>) -> Self {
        Self { bucket }
    }

    pub fn document_key(collection_path: &str, document_id: &str) -> String {
        format!(
            "{}/{}",
            collection_path.trim_end_matches('/'),
            document_id
        )
    }
}

#[async_trait::async_trait]
impl DocumentStore for ObjectDocumentStore {
    #[instrument(skip(self, fields), fields(bucket = self.bucket.name()))]
    async fn upsert_document(
        &self,
        collection_path: &str,
        document_id: &str,
        fields: Document,
    ) -> Result<()> {
        let now = Utc::now();
        let json = fields
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json(now)))
            .collect::<serde_json::Map<_, _>>();

        let data = serde_json::to_vec(&json).with_context(|_| {
            crate::error::SerializeDocumentSnafu {
                collection_path,
                document_id,
            }
        })?;

        let key = Self::document_key(collection_path, document_id);
        debug!(%key, "Writing document");

        self.bucket
            .put_object(&key, data.into(), Some("application/json".to_string()))
            .await
    }
}

/// In-process document store
#[derive(Clone, Debug, Default)]
pub struct MemoryDocumentStore {
    inner: Arc<Mutex<MemoryDocuments>>,
}

#[derive(Debug, Default)]
struct MemoryDocuments {
    documents: BTreeMap<(String, String), Document>,
    writes: usize,
    fail_writes: bool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn documents(&self) -> MutexGuard<'_, MemoryDocuments> {
        self.inner
            .lock()
            .expect("BUG: memory document store lock poisoned")
    }

    /// Get a document as stored, with server timestamps resolved
    pub fn document(&self, collection_path: &str, document_id: &str) -> Option<Document> {
        self.documents()
            .documents
            .get(&(collection_path.to_string(), document_id.to_string()))
            .cloned()
    }

    /// Number of documents in the store
    pub fn len(&self) -> usize {
        self.documents().documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes made so far, including overwrites
    pub fn writes(&self) -> usize {
        self.documents().writes
    }

    pub fn fail_writes(&self, fail: bool) {
        self.documents().fail_writes = fail;
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn upsert_document(
        &self,
        collection_path: &str,
        document_id: &str,
        fields: Document,
    ) -> Result<()> {
        let mut documents = self.documents();

        if documents.fail_writes {
            return crate::error::InjectedFaultSnafu {
                bucket: "documents",
                key: format!("{collection_path}/{document_id}"),
                operation: "upsert",
            }
            .fail();
        }

        let now = Utc::now();
        let fields = fields
            .into_iter()
            .map(|(name, value)| (name, value.resolve(now)))
            .collect();

        documents.documents.insert(
            (collection_path.to_string(), document_id.to_string()),
            fields,
        );
        documents.writes += 1;

        Ok(())
    }
}

/// Records which archives have been mirrored as chats, one document per user and archive
#[derive(Clone, Debug)]
pub struct CompletionCache {
    store: Arc<dyn DocumentStore>,
}

impl CompletionCache {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Upsert the completion record for `upload`, stamped with the store's current time.
    ///
    /// Recording the same upload again only refreshes the timestamp.
    #[instrument(skip(self, upload), fields(user_id = %upload.user_id, archive = %upload.archive_base_name))]
    pub async fn record_completion(&self, upload: &ArchiveUpload) -> Result<()> {
        let collection_path = upload.cache_collection();

        let mut fields = Document::new();
        fields.insert(UPDATED_AT_FIELD.to_string(), FieldValue::ServerTimestamp);

        self.store
            .upsert_document(&collection_path, &upload.archive_base_name, fields)
            .await
            .with_context(|_| crate::error::CompletionRecordSnafu {
                user_id: &upload.user_id,
                archive: &upload.archive_base_name,
            })?;

        debug!(%collection_path, "Recorded completion");

        Ok(())
    }
}
