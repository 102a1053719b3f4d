use crate::objstore::Bucket;
use crate::route::MARKER_FILE_NAME;
use crate::Result;
use snafu::prelude::*;
use tracing::{debug, instrument};

/// Checks whether a published archive contains the marker file that identifies a chat export
#[derive(Debug)]
pub struct MarkerDetector {
    bucket: Box<dyn Bucket>,
}

impl MarkerDetector {
    pub fn new(bucket: Box<dyn Bucket>) -> Self {
        Self { bucket }
    }

    /// Check for the marker object directly under `extracted_prefix`.
    ///
    /// A marker in a subdirectory doesn't count.  If the existence check itself fails the error
    /// is [`crate::ChatDropError::BackendUnavailable`].
    #[instrument(skip(self), fields(bucket = self.bucket.name()))]
    pub async fn detect(&self, extracted_prefix: &str) -> Result<bool> {
        let key = format!("{extracted_prefix}{MARKER_FILE_NAME}");

        let present = self.bucket.object_exists(&key).await.with_context(|_| {
            crate::error::BackendUnavailableSnafu {
                bucket: self.bucket.name(),
                key: &key,
            }
        })?;

        debug!(%key, present, "Checked for marker");

        Ok(present)
    }
}
