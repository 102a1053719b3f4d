//! Copying of a published tree of objects to another prefix in the same bucket.
//!
//! Objects are copied one at a time, in key order.  Each copy may need several calls to the
//! bucket, each continuing where the previous one left off, until the bucket reports the copy
//! complete.  The first failure ends the whole copy; objects already copied stay where they are.
use crate::objstore::{Bucket, RewriteToken};
use crate::pipeline::PipelineProgressCallback;
use crate::Result;
use snafu::prelude::*;
use tracing::{debug, info, instrument, warn};

/// Totals for one tree copy
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub objects: usize,
    pub bytes: u64,
}

#[derive(Debug)]
pub struct TreeCopier {
    bucket: Box<dyn Bucket>,
}

impl TreeCopier {
    pub fn new(bucket: Box<dyn Bucket>) -> Self {
        Self { bucket }
    }

    /// Copy every object under `source_prefix` to the same relative path under `target_prefix`.
    ///
    /// An empty source is logged as suspicious and copies nothing.
    #[instrument(skip(self, progress), fields(bucket = self.bucket.name()))]
    pub async fn copy_tree(
        &self,
        source_prefix: &str,
        target_prefix: &str,
        progress: &dyn PipelineProgressCallback,
    ) -> Result<CopySummary> {
        let objects = self.bucket.list_objects(source_prefix).await.with_context(|_| {
            crate::error::ListCopySourceSnafu {
                bucket: self.bucket.name(),
                prefix: source_prefix,
            }
        })?;

        let mut summary = CopySummary::default();

        if objects.is_empty() {
            warn!("Marker is present but there is nothing under the source prefix to copy");
            return Ok(summary);
        }

        info!(objects = objects.len(), "Copying objects");

        for object in objects {
            let relative_path = object
                .key
                .strip_prefix(source_prefix)
                .unwrap_or(&object.key);
            let target_key = format!("{target_prefix}{relative_path}");

            let bytes = self
                .copy_object(&object.key, &target_key)
                .await
                .with_context(|_| crate::error::CopySnafu {
                    bucket: self.bucket.name(),
                    source_key: &object.key,
                    target_key: &target_key,
                })?;

            progress.object_copied(&object.key, &target_key, bytes);
            summary.objects += 1;
            summary.bytes += bytes;
        }

        info!(
            objects = summary.objects,
            bytes = summary.bytes,
            "Finished copying objects"
        );

        Ok(summary)
    }

    /// Copy a single object, continuing the copy until the bucket reports it complete
    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<u64> {
        let mut token: Option<RewriteToken> = None;

        loop {
            let rewrite = self
                .bucket
                .rewrite_object(source_key, target_key, token.take())
                .await?;

            match rewrite.token {
                Some(next) => {
                    debug!(
                        source_key,
                        target_key,
                        bytes_rewritten = rewrite.bytes_rewritten,
                        total_bytes = rewrite.total_bytes,
                        "Copy continues"
                    );

                    token = Some(next);
                }
                None => {
                    debug!(source_key, target_key, bytes = rewrite.total_bytes, "Copied object");

                    return Ok(rewrite.total_bytes);
                }
            }
        }
    }
}
