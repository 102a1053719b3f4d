#![doc = include_str!("../README.md")]

mod cache;
mod config;
mod error;
mod event;
mod extract;
mod marker;
mod mirror;
mod objstore;
mod pipeline;
mod publish;
mod route;

pub use cache::{
    CompletionCache, Document, DocumentStore, FieldValue, MemoryDocumentStore,
    ObjectDocumentStore, UPDATED_AT_FIELD,
};
pub use config::Config;
pub use error::{ChatDropError, Result};
pub use event::TriggerEvent;
pub use extract::{ArchiveExtractor, DownloadedArchive, ExtractedEntry};
pub use marker::MarkerDetector;
pub use mirror::{CopySummary, TreeCopier};
pub use objstore::{
    parse_object_url, Bucket, MemoryBucket, MemoryObjectStorage, ObjectMetadata, ObjectStorage,
    ObjectStorageFactory, ObjectSummary, RewriteProgress, RewriteToken, StoredObject,
};
pub use pipeline::{Pipeline, PipelineOutcome, PipelineProgressCallback, Stage};
pub use publish::{PublishSummary, TreePublisher};
pub use route::{route, ArchiveUpload, Route, SkipReason, MARKER_FILE_NAME};
