//! Events which trigger a pipeline run.
//!
//! The hosting platform delivers one event per finalized object, at least once.  Events can be
//! built directly or parsed from an S3 event notification document.
use crate::Result;
use serde::Deserialize;
use snafu::prelude::*;

/// A finalized object in a watched bucket
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TriggerEvent {
    pub bucket: String,
    pub key: String,
    pub content_type: Option<String>,
}

impl TriggerEvent {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Parse an S3 event notification into the trigger events it describes.
    ///
    /// Only `ObjectCreated:*` records produce events; removals and other notifications are
    /// dropped.  Object keys in notifications are URL-encoded (with `+` for spaces) and are
    /// decoded here.
    pub fn from_s3_notification(json: &str) -> Result<Vec<Self>> {
        let notification: S3Notification =
            serde_json::from_str(json).context(crate::error::ParseEventSnafu)?;

        notification
            .records
            .into_iter()
            .filter(|record| record.event_name.starts_with("ObjectCreated:"))
            .map(|record| {
                Ok(Self {
                    bucket: record.s3.bucket.name,
                    key: decode_notification_key(&record.s3.object.key)?,
                    content_type: record.s3.object.content_type,
                })
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct S3Notification {
    #[serde(rename = "Records", default)]
    records: Vec<S3Record>,
}

#[derive(Debug, Deserialize)]
struct S3Record {
    #[serde(rename = "eventName")]
    event_name: String,
    s3: S3Entity,
}

#[derive(Debug, Deserialize)]
struct S3Entity {
    bucket: S3BucketEntity,
    object: S3ObjectEntity,
}

#[derive(Debug, Deserialize)]
struct S3BucketEntity {
    name: String,
}

#[derive(Debug, Deserialize)]
struct S3ObjectEntity {
    key: String,
    #[serde(rename = "contentType", default)]
    content_type: Option<String>,
}

fn decode_notification_key(key: &str) -> Result<String> {
    let key = key.replace('+', " ");

    percent_encoding::percent_decode_str(&key)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .with_context(|_| crate::error::InvalidEventKeySnafu { key: key.clone() })
}
