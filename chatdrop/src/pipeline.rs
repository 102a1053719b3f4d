//! The end-to-end pipeline run for one trigger event.
//!
//! A run moves through its stages strictly in order:
//!
//! ```text
//! Routing -> Downloading -> Extracting -> Publishing -> CheckingMarker
//!     [-> Copying -> CachingCompletion] -> Done
//! ```
//!
//! A failure in any stage except publishing ends the run with an error naming the stage.  Nothing
//! already written is rolled back.  Scratch storage for the run is deleted however the run ends.
use crate::cache::{CompletionCache, DocumentStore, ObjectDocumentStore};
use crate::event::TriggerEvent;
use crate::extract::ArchiveExtractor;
use crate::marker::MarkerDetector;
use crate::mirror::{CopySummary, TreeCopier};
use crate::objstore::{Bucket, ObjectStorage, ObjectStorageFactory};
use crate::publish::{PublishSummary, TreePublisher};
use crate::route::{route, ArchiveUpload, Route, SkipReason};
use crate::{ChatDropError, Config, Result};
use snafu::prelude::*;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// The stages of a pipeline run
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Stage {
    Routing,
    Downloading,
    Extracting,
    Publishing,
    CheckingMarker,
    Copying,
    CachingCompletion,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Routing => "routing",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Publishing => "publishing",
            Self::CheckingMarker => "checking marker",
            Self::Copying => "copying",
            Self::CachingCompletion => "caching completion",
        };

        f.write_str(name)
    }
}

/// How a pipeline run which didn't fail ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The object isn't an archive upload; nothing was done
    Skipped(SkipReason),

    /// The archive was published but isn't a chat export
    Extracted {
        upload: ArchiveUpload,
        published: PublishSummary,
    },

    /// The archive was published, mirrored as a chat export, and its completion recorded.
    ///
    /// If the marker was present but nothing was found to copy, `copied` is empty and no
    /// completion was recorded.
    Mirrored {
        upload: ArchiveUpload,
        published: PublishSummary,
        copied: CopySummary,
    },
}

/// A trait which callers can implement to get detailed progress updates as a pipeline run is
/// progressing.
#[allow(unused_variables)]
pub trait PipelineProgressCallback: Sync + Send {
    /// The run has moved on to `stage`
    fn stage_entered(&self, stage: Stage) {}

    /// The archive has been downloaded into scratch storage
    fn archive_downloaded(&self, key: &str, size: u64) {}

    /// The archive has been expanded.  `entries` counts the files in it.
    fn archive_extracted(&self, entries: usize, bytes: u64) {}

    /// An extracted file has been uploaded to object storage
    fn object_published(&self, key: &str, size: u64) {}

    /// The upload of an extracted file failed.  The run carries on with the other files.
    fn object_publish_failed(&self, key: &str, error: &ChatDropError) {}

    /// All extracted files have been dealt with
    fn publish_finished(&self, summary: &PublishSummary) {}

    fn marker_checked(&self, key: &str, present: bool) {}

    /// An object has been completely copied, including any continuation calls it needed
    fn object_copied(&self, source_key: &str, target_key: &str, size: u64) {}

    fn copy_finished(&self, summary: &CopySummary) {}

    /// The completion record has been written
    fn completion_recorded(&self, collection_path: &str, document_id: &str) {}
}

/// A dummy impl of [`PipelineProgressCallback`] that doesn't do anything with any of the progress
/// updates
pub(crate) struct NoProgress;

impl PipelineProgressCallback for NoProgress {}

/// Runs the pipeline for trigger events against one object storage system.
///
/// Holds no state between runs, so concurrent runs for different events on the same `Pipeline`
/// are fine.
#[derive(Clone, Debug)]
pub struct Pipeline {
    config: Config,
    storage: Box<dyn ObjectStorage>,
    document_store: Option<Arc<dyn DocumentStore>>,
}

impl Pipeline {
    pub fn new(config: Config, storage: Box<dyn ObjectStorage>) -> Self {
        Self {
            config,
            storage,
            document_store: None,
        }
    }

    /// Run against S3, using the process-wide [`ObjectStorageFactory`].
    ///
    /// The factory is initialized once per process, so if it already exists `config` is ignored
    /// in favor of the configuration it was created with.
    pub async fn from_config(config: Config) -> Self {
        let factory = ObjectStorageFactory::instance(config);
        let storage = factory.s3().await;

        Self::new(factory.config().clone(), storage)
    }

    /// Record completions in `store`.
    ///
    /// Without this completions are written with [`ObjectDocumentStore`] to the configured cache
    /// bucket, or if none is configured then to the bucket of the trigger event.
    pub fn with_document_store(mut self, store: Arc<dyn DocumentStore>) -> Self {
        self.document_store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run the pipeline for `event` without reporting progress
    pub async fn run_without_progress(&self, event: &TriggerEvent) -> Result<PipelineOutcome> {
        self.run(event, NoProgress).await
    }

    /// Run the pipeline for one trigger event, returning when the run is finished.
    ///
    /// Objects which aren't archive uploads are skipped without touching object storage.
    pub async fn run<Progress>(
        &self,
        event: &TriggerEvent,
        progress: Progress,
    ) -> Result<PipelineOutcome>
    where
        Progress: PipelineProgressCallback + 'static,
    {
        let span = info_span!("run", bucket = %event.bucket, key = %event.key);

        async move {
            progress.stage_entered(Stage::Routing);

            let upload = match route(&event.key) {
                Route::Skip(reason) => {
                    debug!(%reason, content_type = ?event.content_type, "Skipping object");
                    return Ok(PipelineOutcome::Skipped(reason));
                }
                Route::Eligible(upload) => upload,
            };

            info!(user_id = %upload.user_id, archive = %upload.archive_file_name, "Processing archive upload");

            let scratch = self
                .config
                .scratch_dir()
                .context(crate::error::CreateScratchDirSnafu)?;
            debug!(scratch = %scratch.path().display(), "Created scratch directory");

            let mut stage = Stage::Downloading;
            let result = self
                .process(event, &upload, scratch.path(), &progress, &mut stage)
                .await;

            let scratch_path = scratch.path().to_path_buf();
            if let Err(e) = scratch.close() {
                warn!(scratch = %scratch_path.display(), err = ?e, "Failed to remove scratch directory");
            }

            match &result {
                Ok(outcome) => info!(?outcome, "Pipeline run finished"),
                Err(e) => error!(%stage, err = ?e, "Pipeline run aborted"),
            }

            result
        }
        .instrument(span)
        .await
    }

    async fn process(
        &self,
        event: &TriggerEvent,
        upload: &ArchiveUpload,
        root: &Path,
        progress: &dyn PipelineProgressCallback,
        stage: &mut Stage,
    ) -> Result<PipelineOutcome> {
        let mut enter = |next: Stage| {
            *stage = next;
            debug!(stage = %next, "Entering stage");
            progress.stage_entered(next);
        };

        enter(Stage::Downloading);
        let bucket = self.storage.bucket(&event.bucket).await.with_context(|_| {
            crate::error::DownloadSnafu {
                bucket: &event.bucket,
                key: &event.key,
            }
        })?;

        let extractor = ArchiveExtractor::new(bucket.clone());
        let archive = extractor
            .download(&upload.key, &upload.archive_file_name, root)
            .await?;
        progress.archive_downloaded(&upload.key, archive.size);

        enter(Stage::Extracting);
        let entries = extractor.extract(&upload.key, &archive.path, root).await?;
        progress.archive_extracted(
            entries.len(),
            entries.iter().map(|entry| entry.size).sum(),
        );

        enter(Stage::Publishing);
        let extracted_prefix = upload.extracted_prefix();
        let published = TreePublisher::new(bucket.clone(), &self.config)
            .publish(
                root,
                &extracted_prefix,
                &upload.archive_file_name,
                progress,
            )
            .await?;
        progress.publish_finished(&published);

        enter(Stage::CheckingMarker);
        let marker_present = MarkerDetector::new(bucket.clone())
            .detect(&extracted_prefix)
            .await?;
        progress.marker_checked(&upload.marker_key(), marker_present);

        if !marker_present {
            info!("No marker found; not a chat export");

            return Ok(PipelineOutcome::Extracted {
                upload: upload.clone(),
                published,
            });
        }

        enter(Stage::Copying);
        let copied = TreeCopier::new(bucket.clone())
            .copy_tree(&extracted_prefix, &upload.chats_prefix(), progress)
            .await?;
        progress.copy_finished(&copied);

        if copied.objects > 0 {
            enter(Stage::CachingCompletion);
            let store = self.document_store(event, upload).await?;

            CompletionCache::new(store).record_completion(upload).await?;
            progress.completion_recorded(&upload.cache_collection(), &upload.archive_base_name);
        }

        Ok(PipelineOutcome::Mirrored {
            upload: upload.clone(),
            published,
            copied,
        })
    }

    /// The document store completions are recorded in
    async fn document_store(
        &self,
        event: &TriggerEvent,
        upload: &ArchiveUpload,
    ) -> Result<Arc<dyn DocumentStore>> {
        if let Some(store) = &self.document_store {
            return Ok(store.clone());
        }

        let bucket_name = self
            .config
            .cache_bucket
            .as_deref()
            .unwrap_or(&event.bucket);
        let bucket: Box<dyn Bucket> = self.storage.bucket(bucket_name).await.with_context(|_| {
            crate::error::CompletionRecordSnafu {
                user_id: &upload.user_id,
                archive: &upload.archive_base_name,
            }
        })?;

        Ok(Arc::new(ObjectDocumentStore::new(bucket)))
    }
}
