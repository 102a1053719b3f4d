use super::{Bucket, ObjectMetadata, ObjectStorage, ObjectSummary, RewriteProgress, RewriteToken};
use crate::config::part_size_for;
use crate::{Config, Result};
use aws_config::meta::region::RegionProviderChain;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_types::region::Region;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use snafu::{prelude::*, IntoError};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, debug_span, error, info, instrument, warn, Instrument};

/// Characters escaped in the `x-amz-copy-source` header.  The `/` separators of the key stay as
/// they are.
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'/')
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Implementation of [`ObjectStorage`] for S3 and S3-compatible APIs
#[derive(Clone)]
pub(super) struct S3 {
    inner: Arc<S3Inner>,
}
struct S3Inner {
    config: Config,
    client: aws_sdk_s3::Client,
}

impl S3 {
    pub(super) async fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(S3Inner {
                client: make_s3_client(&config, None).await,
                config,
            }),
        }
    }
}

#[async_trait::async_trait]
impl ObjectStorage for S3 {
    async fn bucket(&self, name: &str) -> Result<Box<dyn Bucket>> {
        Ok(Box::new(S3Bucket::new(self, name).await?))
    }
}

impl std::fmt::Debug for S3 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "S3")
    }
}

#[derive(Clone)]
struct S3Bucket {
    inner: Arc<S3BucketInner>,
}
struct S3BucketInner {
    name: String,

    objstore: S3,

    /// The region this bucket is located in, if it's different from the region specified in the
    /// AWS SDK config.
    ///
    /// If a bucket is in a different region, then we need to use a different
    /// [`aws_sdk_s3::Client`] instance to talk to the S3 APIs when dealing with that bucket.
    region: Option<String>,

    /// The client to use to operate on this bucket.
    client: aws_sdk_s3::Client,
}

impl S3Bucket {
    /// Construct a new instance and validate that the current client has access to the bucket.
    ///
    /// If there is no access to the bucket then fail with an error
    async fn new(objstore: &S3, name: &str) -> Result<Self> {
        debug!(bucket = name, "Validating access to bucket");

        let mut client = objstore.inner.client.clone();

        // If the bucket is in a different region, `head_bucket` will fail and the error will
        // include a header telling us the correct region.  Look for that and handle it properly.
        let region = if let Some(region) = Self::validate_access_and_region(&client, name).await? {
            debug!(bucket = name, %region, "Bucket is in another region; repeating access validation in the correct region");

            client = make_s3_client(&objstore.inner.config, region.clone()).await;

            // S3 shouldn't redirect twice.  If it does, stay with the first region and let the
            // requests that follow report whatever is actually wrong
            if let Some(other) = Self::validate_access_and_region(&client, name).await? {
                warn!(bucket = name, %region, %other, "S3 redirected the bucket to another region a second time");
            }

            Some(region)
        } else {
            None
        };

        debug!(bucket = name, ?region, "Access to bucket is confirmed");

        Ok(Self {
            inner: Arc::new(S3BucketInner {
                name: name.to_string(),
                objstore: objstore.clone(),
                region,
                client,
            }),
        })
    }

    fn config(&self) -> &Config {
        &self.inner.objstore.inner.config
    }

    /// Perform a HEAD on the bucket to check access.
    ///
    /// If the HEAD check passes, it means the client's configured region is correct, the
    /// configured credentials have access to the bucket, and all is well.  In that case this
    /// function returns `Ok(None)`
    ///
    /// If the HEAD check fails with an error that indicates the bucket is in a different region,
    /// then this will return `Ok(Some($region))`, and the check should be repeated again in that
    /// region.
    ///
    /// If the HEAD check fails for any other error, most likely because the bucket doesn't exist
    /// or the credentials don't have access to it, then this returns the corresponding error.
    async fn validate_access_and_region(
        client: &aws_sdk_s3::Client,
        name: &str,
    ) -> Result<Option<String>> {
        match client.head_bucket().bucket(name).send().await {
            Ok(_) => Ok(None),
            Err(e) => {
                if let SdkError::ServiceError(service_error) = &e {
                    let response = service_error.raw();
                    if response.status().as_u16() == 301 {
                        if let Some(region) = response.headers().get("x-amz-bucket-region") {
                            // This is AWS's way of telling us we have the right bucket, but it is
                            // in another region so we should use the appropriate region endpoint
                            return Ok(Some(region.to_string()));
                        }
                    }
                }

                Err(crate::error::BucketInvalidOrNotAccessibleSnafu {
                    bucket: name.to_string(),
                }
                .into_error(e))
            }
        }
    }

    fn copy_source(&self, key: &str) -> String {
        format!("{}/{}", self.inner.name, utf8_percent_encode(key, COPY_SOURCE))
    }

    /// Upload a file too large for a single PUT using the S3 multipart upload APIs.
    ///
    /// Parts are read straight from the file at their offsets, and uploaded in parallel up to the
    /// configured maximum concurrency.
    async fn multipart_upload_file(
        &self,
        key: &str,
        path: &Path,
        len: u64,
        content_type: Option<String>,
    ) -> Result<u64> {
        let configured_chunk_size = self.config().multipart_chunk_size.get_bytes() as u64;
        let chunk_size = part_size_for(len, configured_chunk_size);
        if chunk_size != configured_chunk_size {
            warn!(%key, len, configured_chunk_size, chunk_size,
                "File is so large that the requested chunk size will be overridden to keep the total chunk count under 10K");
        }

        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .set_content_type(content_type)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;
        let upload_id = response
            .upload_id()
            .map(str::to_string)
            .context(crate::error::MissingResponseFieldSnafu {
                bucket: self.inner.name.clone(),
                key,
                field: "upload_id",
            })?;

        let result = self
            .upload_file_parts(key, path, len, chunk_size, &upload_id)
            .await;

        if let Err(e) = &result {
            // Before reporting this error, clean up the remains of the multi-part upload
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Multi-part upload failed; aborting multi-part upload on server side");
            self.abort_multipart_upload(key, &upload_id).await;
        }

        result
    }

    async fn upload_file_parts(
        &self,
        key: &str,
        path: &Path,
        len: u64,
        chunk_size: u64,
        upload_id: &str,
    ) -> Result<u64> {
        let part_count = (len + chunk_size - 1) / chunk_size;

        let part_futs = (0..part_count).map(|index| {
            // S3 numbers parts from 1
            let part_number = (index + 1) as i32;
            let offset = index * chunk_size;
            let part_len = chunk_size.min(len - offset);

            let me = self.clone();
            let key = key.to_string();
            let upload_id = upload_id.to_string();
            let path = path.to_path_buf();

            async move {
                let body = ByteStream::read_from()
                    .path(&path)
                    .offset(offset)
                    .length(Length::Exact(part_len))
                    .build()
                    .await
                    .with_context(|_| crate::error::OpenUploadFileSnafu { path: path.clone() })?;

                let response = me
                    .inner
                    .client
                    .upload_part()
                    .bucket(&me.inner.name)
                    .key(&key)
                    .upload_id(&upload_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartSnafu {
                        bucket: me.inner.name.clone(),
                        key: key.clone(),
                        part_number,
                    })?;

                let e_tag = response.e_tag().map(str::to_string).context(
                    crate::error::MissingResponseFieldSnafu {
                        bucket: me.inner.name.clone(),
                        key: key.clone(),
                        field: "e_tag",
                    },
                )?;

                debug!(%e_tag, "Uploaded multi-part chunk");

                Ok(CompletedPart::builder()
                    .e_tag(e_tag)
                    .part_number(part_number)
                    .build())
            }
            .instrument(debug_span!("upload chunk", part_number, part_len))
        });

        debug!(part_count, chunk_size, "Commencing multi-part upload");

        let mut completed_parts: Vec<CompletedPart> = futures::stream::iter(part_futs)
            .buffer_unordered(self.config().max_concurrent_requests.max(1))
            .try_collect()
            .await?;

        // The parts must be listed in order of part number when completing the upload
        completed_parts.sort_unstable_by_key(|part| part.part_number());

        self.complete_multipart_upload(key, upload_id, completed_parts)
            .await?;

        Ok(len)
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: Vec<CompletedPart>,
    ) -> Result<()> {
        self.inner
            .client
            .complete_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .with_context(|_| crate::error::CompleteMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) {
        if let Err(e) = self
            .inner
            .client
            .abort_multipart_upload()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            error!(?e, bucket = %self.inner.name, %key, %upload_id,
                "Error aborting multi-part upload.  This will remain on the server forever unless there's a lifecycle policy configured");
        }
    }

    /// Single-call server side copy, for objects under the copy threshold.
    ///
    /// S3 copies the content type and user metadata along with the data.
    async fn copy_object(&self, source_key: &str, target_key: &str) -> Result<()> {
        self.inner
            .client
            .copy_object()
            .bucket(&self.inner.name)
            .key(target_key)
            .copy_source(self.copy_source(source_key))
            .send()
            .await
            .with_context(|_| crate::error::CopyObjectSnafu {
                bucket: self.inner.name.clone(),
                source_key,
                target_key,
            })?;

        Ok(())
    }

    /// Start a chunked copy into `target_key`.  Returns the multipart upload ID, which doubles as
    /// the rewrite continuation token.
    ///
    /// Unlike `CopyObject`, a multipart upload doesn't inherit anything from the source, so the
    /// source's metadata is set on the upload explicitly.
    async fn start_multipart_copy(
        &self,
        target_key: &str,
        source: &ObjectMetadata,
    ) -> Result<String> {
        let metadata = Some(source.metadata.clone()).filter(|metadata| !metadata.is_empty());

        let response = self
            .inner
            .client
            .create_multipart_upload()
            .bucket(&self.inner.name)
            .key(target_key)
            .set_content_type(source.content_type.clone())
            .set_cache_control(source.cache_control.clone())
            .set_content_disposition(source.content_disposition.clone())
            .set_content_encoding(source.content_encoding.clone())
            .set_content_language(source.content_language.clone())
            .set_metadata(metadata)
            .send()
            .await
            .with_context(|_| crate::error::CreateMultipartUploadSnafu {
                bucket: self.inner.name.clone(),
                key: target_key,
            })?;

        let upload_id = response
            .upload_id()
            .map(str::to_string)
            .context(crate::error::MissingResponseFieldSnafu {
                bucket: self.inner.name.clone(),
                key: target_key,
                field: "upload_id",
            })?;

        info!(bucket = %self.inner.name, target_key, %upload_id, size = source.size, "Started chunked copy");

        Ok(upload_id)
    }

    /// Parts already uploaded to a multipart upload
    async fn list_uploaded_parts(&self, key: &str, upload_id: &str) -> Result<Vec<CompletedPart>> {
        let mut pages = self
            .inner
            .client
            .list_parts()
            .bucket(&self.inner.name)
            .key(key)
            .upload_id(upload_id)
            .into_paginator()
            .send();

        let mut parts = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|_| crate::error::ListPartsSnafu {
                bucket: self.inner.name.clone(),
                key,
                upload_id,
            })?;

            parts.extend(page.parts().iter().filter_map(|part| {
                Some(
                    CompletedPart::builder()
                        .part_number(part.part_number()?)
                        .e_tag(part.e_tag()?)
                        .build(),
                )
            }));
        }

        Ok(parts)
    }

    /// Copy the next batch of parts of a chunked copy, completing the upload if that was the
    /// last of them.
    ///
    /// The parts still missing are worked out from what S3 reports as already uploaded, so a
    /// rewrite can be continued from nothing but its upload ID.
    async fn continue_multipart_copy(
        &self,
        source_key: &str,
        target_key: &str,
        source: &ObjectMetadata,
        upload_id: &str,
    ) -> Result<RewriteProgress> {
        let total_bytes = source.size;
        let part_size = part_size_for(total_bytes, self.config().copy_part_size.get_bytes() as u64);
        let part_count = ((total_bytes + part_size - 1) / part_size).max(1) as i32;
        let max_concurrent_requests = self.config().max_concurrent_requests.max(1);

        let mut parts = self.list_uploaded_parts(target_key, upload_id).await?;
        let uploaded = parts
            .iter()
            .filter_map(|part| part.part_number())
            .collect::<BTreeSet<_>>();

        let batch = (1..=part_count)
            .filter(|part_number| !uploaded.contains(part_number))
            .take(max_concurrent_requests)
            .collect::<Vec<_>>();

        let copy_source = self.copy_source(source_key);
        let part_futs = batch.into_iter().map(|part_number| {
            let first_byte = (part_number as u64 - 1) * part_size;
            let last_byte = (first_byte + part_size).min(total_bytes) - 1;
            let me = self.clone();
            let copy_source = copy_source.clone();

            async move {
                debug!("Copying part");

                let response = me
                    .inner
                    .client
                    .upload_part_copy()
                    .bucket(&me.inner.name)
                    .key(target_key)
                    .upload_id(upload_id)
                    .part_number(part_number)
                    .copy_source(copy_source)
                    .copy_source_range(format!("bytes={}-{}", first_byte, last_byte))
                    .send()
                    .await
                    .with_context(|_| crate::error::UploadPartCopySnafu {
                        bucket: me.inner.name.clone(),
                        source_key,
                        target_key,
                        part_number,
                    })?;

                let e_tag = response
                    .copy_part_result()
                    .and_then(|result| result.e_tag())
                    .map(str::to_string)
                    .context(crate::error::MissingResponseFieldSnafu {
                        bucket: me.inner.name.clone(),
                        key: target_key,
                        field: "copy_part_result.e_tag",
                    })?;

                Ok(CompletedPart::builder()
                    .e_tag(e_tag)
                    .part_number(part_number)
                    .build())
            }
            .instrument(debug_span!("copy part", part_number, first_byte, last_byte))
        });

        let copied: Vec<CompletedPart> = futures::stream::iter(part_futs)
            .buffer_unordered(max_concurrent_requests)
            .try_collect()
            .await?;
        parts.extend(copied);

        let bytes_rewritten = (parts.len() as u64 * part_size).min(total_bytes);

        if (parts.len() as i32) < part_count {
            debug!(
                parts = parts.len(),
                part_count, bytes_rewritten, "Chunked copy continues"
            );

            return Ok(RewriteProgress {
                token: Some(RewriteToken::new(upload_id)),
                bytes_rewritten,
                total_bytes,
            });
        }

        parts.sort_unstable_by_key(|part| part.part_number());
        self.complete_multipart_upload(target_key, upload_id, parts)
            .await?;

        debug!(part_count, total_bytes, "Chunked copy completed");

        Ok(RewriteProgress {
            token: None,
            bytes_rewritten: total_bytes,
            total_bytes,
        })
    }
}

#[async_trait::async_trait]
impl Bucket for S3Bucket {
    fn name(&self) -> &str {
        &self.inner.name
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn read_object(&self, key: &str) -> Result<mpsc::Receiver<Result<Bytes>>> {
        let response = self
            .inner
            .client
            .get_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::GetObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        debug!(
            content_length = response.content_length(),
            "Reading object"
        );

        let (sender, receiver) = mpsc::channel(self.config().max_concurrent_requests.max(1));
        let mut body = response.body;
        let bucket = self.inner.name.clone();
        let key = key.to_string();

        tokio::spawn(
            async move {
                while let Some(result) = body.next().await {
                    let result = result.with_context(|_| crate::error::ReadByteStreamSnafu {
                        bucket: bucket.clone(),
                        key: key.clone(),
                    });
                    let failed = result.is_err();

                    if sender.send(result).await.is_err() || failed {
                        // Either the receiver was dropped, or there's nothing more to send after
                        // an error
                        break;
                    }
                }
            }
            .in_current_span(),
        );

        Ok(receiver)
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn upload_file(
        &self,
        key: &str,
        path: &Path,
        content_type: Option<String>,
    ) -> Result<u64> {
        let len = tokio::fs::metadata(path)
            .await
            .with_context(|_| crate::error::ScratchIoSnafu { path })?
            .len();

        if len >= self.config().multipart_threshold.get_bytes() as u64 {
            return self
                .multipart_upload_file(key, path, len, content_type)
                .await;
        }

        debug!(len, "Uploading unipart object");

        let body = ByteStream::from_path(path)
            .await
            .with_context(|_| crate::error::OpenUploadFileSnafu { path })?;

        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .set_content_type(content_type)
            .body(body)
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(len)
    }

    #[instrument(skip(self, data), fields(bucket = %self.inner.name, len = data.len()))]
    async fn put_object(&self, key: &str, data: Bytes, content_type: Option<String>) -> Result<()> {
        self.inner
            .client
            .put_object()
            .bucket(&self.inner.name)
            .key(key)
            .set_content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .with_context(|_| crate::error::PutObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn object_exists(&self, key: &str) -> Result<bool> {
        match self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(SdkError::ServiceError(e)) if e.err().is_not_found() => Ok(false),
            Err(e) => Err(crate::error::HeadObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            }
            .into_error(e)),
        }
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn head_object(&self, key: &str) -> Result<ObjectMetadata> {
        let metadata = self
            .inner
            .client
            .head_object()
            .bucket(&self.inner.name)
            .key(key)
            .send()
            .await
            .with_context(|_| crate::error::HeadObjectSnafu {
                bucket: self.inner.name.clone(),
                key,
            })?;

        Ok(ObjectMetadata {
            size: metadata.content_length().unwrap_or_default().max(0) as u64,
            content_type: metadata.content_type().map(str::to_string),
            cache_control: metadata.cache_control().map(str::to_string),
            content_disposition: metadata.content_disposition().map(str::to_string),
            content_encoding: metadata.content_encoding().map(str::to_string),
            content_language: metadata.content_language().map(str::to_string),
            metadata: metadata.metadata().cloned().unwrap_or_default(),
        })
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectSummary>> {
        // Helpfully, the AWS Rust SDK provides conversions from their own internal DateTime type
        // to Chrono.
        use aws_smithy_types_convert::date_time::DateTimeExt;

        // Use the paginated API to automatically handle dealing with continuation tokens
        let mut pages = self
            .inner
            .client
            .list_objects_v2()
            .bucket(&self.inner.name)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();

        while let Some(page) = pages.next().await {
            let page = page.with_context(|_| crate::error::ListObjectsInPrefixSnafu {
                bucket: self.inner.name.clone(),
                prefix,
            })?;

            for object in page.contents() {
                // Listed objects always have keys; the `Option` is an artifact of the generated
                // bindings
                let Some(key) = object.key() else {
                    continue;
                };

                objects.push(ObjectSummary {
                    key: key.to_string(),
                    size: object.size().unwrap_or_default().max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|timestamp| timestamp.to_chrono_utc().ok()),
                });
            }
        }

        debug!(objects = objects.len(), "Listed objects with prefix");

        Ok(objects)
    }

    #[instrument(skip(self), fields(bucket = %self.inner.name))]
    async fn rewrite_object(
        &self,
        source_key: &str,
        target_key: &str,
        token: Option<RewriteToken>,
    ) -> Result<RewriteProgress> {
        let source = self.head_object(source_key).await?;
        let copy_threshold = single_copy_limit(self.config());

        let upload_id = match token {
            None if source.size <= copy_threshold => {
                self.copy_object(source_key, target_key).await?;

                return Ok(RewriteProgress {
                    token: None,
                    bytes_rewritten: source.size,
                    total_bytes: source.size,
                });
            }
            None => self.start_multipart_copy(target_key, &source).await?,
            Some(token) => token.to_string(),
        };

        let result = self
            .continue_multipart_copy(source_key, target_key, &source, &upload_id)
            .await;

        if let Err(e) = &result {
            error!(?e, bucket = %self.inner.name, %target_key, %upload_id,
                "Chunked copy failed; aborting multi-part upload on server side");
            self.abort_multipart_upload(target_key, &upload_id).await;
        }

        result
    }
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("name", &self.inner.name)
            .field("region", &self.inner.region)
            .field("client", &"<...>")
            .finish()
    }
}

/// Largest object S3 accepts in a single `CopyObject` call
const MAX_SINGLE_COPY_SIZE: u64 = 5 * 1024 * 1024 * 1024;

/// Objects up to this size are copied with one `CopyObject` call, larger ones part by part
fn single_copy_limit(config: &Config) -> u64 {
    (config.copy_threshold.get_bytes() as u64).min(MAX_SINGLE_COPY_SIZE)
}

/// Create a new AWS SDK S3 client, using either an explicit region or the default configuration
/// deduced from the environment
async fn make_s3_client(config: &Config, region: impl Into<Option<String>>) -> aws_sdk_s3::Client {
    let region = region.into().or_else(|| config.aws_region.clone());

    let region_provider = if let Some(region) = region {
        RegionProviderChain::first_try(Region::new(region))
    } else {
        // No explicit region; use the environment
        RegionProviderChain::default_provider().or_else("us-east-1")
    };

    let mut loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region_provider);
    if let (Some(access_key_id), Some(secret_access_key)) =
        (&config.aws_access_key_id, &config.aws_secret_access_key)
    {
        loader = loader.credentials_provider(aws_credential_types::Credentials::from_keys(
            access_key_id,
            secret_access_key,
            None,
        ));
    }
    let aws_config = loader.load().await;

    let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
    if let Some(s3_endpoint) = &config.s3_endpoint {
        // S3-compatible services generally don't do virtual-hosted bucket addressing
        s3_config_builder = s3_config_builder
            .endpoint_url(s3_endpoint.as_str())
            .force_path_style(true);
    }

    aws_sdk_s3::Client::from_conf(s3_config_builder.build())
}
