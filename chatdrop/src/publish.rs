//! Publishing of an extracted archive back into object storage.
//!
//! Every file under the scratch root is uploaded under the extracted prefix, keeping its path
//! relative to the root.  The archive itself was downloaded into the same root, so any file with
//! the archive's file name is left out.
//!
//! Each file is stored with a content type guessed from its name, which mirroring later carries
//! over to the copies.
//!
//! Failure to upload one file doesn't stop the others.  Each failure is logged and counted, and
//! publishing always finishes with a summary rather than an error.
use crate::objstore::Bucket;
use crate::pipeline::PipelineProgressCallback;
use crate::{Config, Result};
use futures::StreamExt;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, instrument};

/// Totals for one publish pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishSummary {
    /// Files uploaded successfully
    pub uploaded: usize,
    /// Files whose upload failed
    pub failed: usize,
    /// Files left out because they are the archive itself
    pub skipped: usize,
    /// Total size of the uploaded files
    pub bytes: u64,
}

/// A file in scratch storage waiting to be published
#[derive(Clone, Debug)]
struct LocalFile {
    path: PathBuf,
    relative_path: String,
    size: u64,
}

#[derive(Debug)]
pub struct TreePublisher {
    bucket: Box<dyn Bucket>,
    max_concurrent_requests: usize,
}

impl TreePublisher {
    pub fn new(bucket: Box<dyn Bucket>, config: &Config) -> Self {
        Self {
            bucket,
            max_concurrent_requests: config.max_concurrent_requests.max(1),
        }
    }

    /// Upload every file under `root` to `prefix` followed by its `/` separated path relative to
    /// `root`.
    ///
    /// Only a failure to enumerate the scratch tree is an error.  Upload failures are reported
    /// through `progress` and counted in the returned summary.
    #[instrument(skip(self, root, progress), fields(bucket = self.bucket.name()))]
    pub async fn publish(
        &self,
        root: &Path,
        prefix: &str,
        archive_file_name: &str,
        progress: &dyn PipelineProgressCallback,
    ) -> Result<PublishSummary> {
        let (files, skipped) = list_local_files(root, archive_file_name).await?;

        info!(files = files.len(), skipped, "Publishing extracted files");

        let mut summary = PublishSummary {
            skipped,
            ..Default::default()
        };

        let uploads = files.into_iter().map(|file| {
            let key = format!("{prefix}{}", file.relative_path);
            let content_type = content_type_for(&file.relative_path);

            async move {
                let result = self
                    .bucket
                    .upload_file(&key, &file.path, content_type)
                    .await;

                (key, file.size, result)
            }
        });
        let mut results =
            futures::stream::iter(uploads).buffer_unordered(self.max_concurrent_requests);

        while let Some((key, size, result)) = results.next().await {
            match result {
                Ok(_) => {
                    debug!(%key, size, "Published file");

                    progress.object_published(&key, size);
                    summary.uploaded += 1;
                    summary.bytes += size;
                }
                Err(e) => {
                    error!(%key, err = ?e, "Failed to publish extracted file; continuing with the rest");

                    progress.object_publish_failed(&key, &e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            uploaded = summary.uploaded,
            failed = summary.failed,
            bytes = summary.bytes,
            "Finished publishing extracted files"
        );

        Ok(summary)
    }
}

/// The MIME type for a file named `relative_path`, if its extension is a known one
fn content_type_for(relative_path: &str) -> Option<String> {
    mime_guess::from_path(relative_path)
        .first_raw()
        .map(str::to_string)
}

/// Walk `root` and list every file in it, except for those named `archive_file_name`.
///
/// Returns the files to publish, in path order, along with how many were left out.
async fn list_local_files(root: &Path, archive_file_name: &str) -> Result<(Vec<LocalFile>, usize)> {
    let root = root.to_path_buf();
    let archive_file_name = archive_file_name.to_string();

    tokio::task::spawn_blocking(move || -> Result<(Vec<LocalFile>, usize)> {
        let mut files = Vec::new();
        let mut skipped = 0;

        for entry in walkdir::WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.with_context(|_| crate::error::WalkScratchSnafu { root: &root })?;

            if !entry.file_type().is_file() {
                continue;
            }

            if entry.file_name() == archive_file_name.as_str() {
                debug!(path = %entry.path().display(), "Leaving out the archive itself");
                skipped += 1;
                continue;
            }

            let relative = entry.path().strip_prefix(&root).unwrap_or(entry.path());
            let size = entry
                .metadata()
                .with_context(|_| crate::error::WalkScratchSnafu { root: &root })?
                .len();

            files.push(LocalFile {
                path: entry.path().to_path_buf(),
                relative_path: crate::extract::relative_key(relative),
                size,
            });
        }

        Ok((files, skipped))
    })
    .await
    .context(crate::error::SpawnBlockingSnafu)?
}
