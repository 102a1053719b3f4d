use aws_sdk_s3::error::SdkError;
use snafu::prelude::*;
use std::path::PathBuf;
use url::Url;

pub type Result<T, E = ChatDropError> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ChatDropError {
    // Terminal pipeline stage failures.  Each one ends the current run; nothing is retried
    // internally since redelivery of the triggering event is the only retry mechanism.
    #[snafu(display("Failed to download archive '{key}' from bucket '{bucket}'"))]
    Download {
        bucket: String,
        key: String,
        #[snafu(source(from(ChatDropError, Box::new)))]
        source: Box<ChatDropError>,
    },

    #[snafu(display("Archive '{key}' is not a valid zip file or is corrupted"))]
    CorruptArchive {
        key: String,
        source: zip::result::ZipError,
    },

    #[snafu(display("Failed to extract archive '{key}'"))]
    Extraction {
        key: String,
        source: zip::result::ZipError,
    },

    #[snafu(display("Object storage is unavailable while checking for '{key}' in bucket '{bucket}'"))]
    BackendUnavailable {
        bucket: String,
        key: String,
        #[snafu(source(from(ChatDropError, Box::new)))]
        source: Box<ChatDropError>,
    },

    #[snafu(display("Failed to list objects with prefix '{prefix}' in bucket '{bucket}' for copying"))]
    ListCopySource {
        bucket: String,
        prefix: String,
        #[snafu(source(from(ChatDropError, Box::new)))]
        source: Box<ChatDropError>,
    },

    #[snafu(display("Failed to copy '{source_key}' to '{target_key}' in bucket '{bucket}'"))]
    Copy {
        bucket: String,
        source_key: String,
        target_key: String,
        #[snafu(source(from(ChatDropError, Box::new)))]
        source: Box<ChatDropError>,
    },

    #[snafu(display("Failed to record completion of archive '{archive}' for user '{user_id}'"))]
    CompletionRecord {
        user_id: String,
        archive: String,
        #[snafu(source(from(ChatDropError, Box::new)))]
        source: Box<ChatDropError>,
    },

    // Object storage and document store failures
    #[snafu(display("The URL '{url}' doesn't correspond to any supported object storage technology.  Supported URL schemes are: s3"))]
    UnsupportedObjectStorage { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the bucket name"))]
    MissingBucket { url: Url },

    #[snafu(display("The S3 URL '{url}' is missing the object key"))]
    MissingObjectKey { url: Url },

    #[snafu(display(
        "The S3 bucket '{bucket}' either doesn't exist, or your IAM identity is not granted access"
    ))]
    BucketInvalidOrNotAccessible {
        bucket: String,
        source: SdkError<aws_sdk_s3::operation::head_bucket::HeadBucketError>,
    },

    #[snafu(display("Error getting object '{key}' from S3 bucket '{bucket}'"))]
    GetObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::get_object::GetObjectError>,
    },

    #[snafu(display("Error reading the body of object '{key}' in S3 bucket '{bucket}'"))]
    ReadByteStream {
        bucket: String,
        key: String,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("Error getting metadata about object '{key}' on S3 bucket '{bucket}'"))]
    HeadObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::head_object::HeadObjectError>,
    },

    #[snafu(display("Error uploading object '{key}' to S3 bucket '{bucket}'"))]
    PutObject {
        bucket: String,
        key: String,
        source: SdkError<aws_sdk_s3::operation::put_object::PutObjectError>,
    },

    #[snafu(display("Error listing objects in S3 bucket '{bucket}' with prefix '{prefix}'"))]
    ListObjectsInPrefix {
        bucket: String,
        prefix: String,
        source: SdkError<aws_sdk_s3::operation::list_objects_v2::ListObjectsV2Error>,
    },

    #[snafu(display("Error copying object '{source_key}' to '{target_key}' in S3 bucket '{bucket}'"))]
    CopyObject {
        bucket: String,
        source_key: String,
        target_key: String,
        source: SdkError<aws_sdk_s3::operation::copy_object::CopyObjectError>,
    },

    #[snafu(display("Error starting multipart upload of '{key}' to S3 bucket '{bucket}'"))]
    CreateMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<
            aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError,
        >,
    },

    #[snafu(display("Error uploading part {part_number} of '{key}' to S3 bucket '{bucket}'"))]
    UploadPart {
        bucket: String,
        key: String,
        part_number: i32,
        source: SdkError<aws_sdk_s3::operation::upload_part::UploadPartError>,
    },

    #[snafu(display("Error copying part {part_number} of '{source_key}' into '{target_key}' in S3 bucket '{bucket}'"))]
    UploadPartCopy {
        bucket: String,
        source_key: String,
        target_key: String,
        part_number: i32,
        source: SdkError<aws_sdk_s3::operation::upload_part_copy::UploadPartCopyError>,
    },

    #[snafu(display("Error listing the parts of multipart upload '{upload_id}' for '{key}' in S3 bucket '{bucket}'"))]
    ListParts {
        bucket: String,
        key: String,
        upload_id: String,
        source: SdkError<aws_sdk_s3::operation::list_parts::ListPartsError>,
    },

    #[snafu(display("Error completing multipart upload of '{key}' to S3 bucket '{bucket}'"))]
    CompleteMultipartUpload {
        bucket: String,
        key: String,
        source: SdkError<
            aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError,
        >,
    },

    #[snafu(display("S3 response for '{key}' in bucket '{bucket}' is missing '{field}'"))]
    MissingResponseField {
        bucket: String,
        key: String,
        field: &'static str,
    },

    #[snafu(display("Error opening '{}' for upload", path.display()))]
    OpenUploadFile {
        path: PathBuf,
        source: aws_sdk_s3::primitives::ByteStreamError,
    },

    #[snafu(display("The rewrite token '{token}' for '{target_key}' is not recognized by bucket '{bucket}'"))]
    InvalidRewriteToken {
        bucket: String,
        target_key: String,
        token: String,
    },

    #[snafu(display("Object '{key}' does not exist in bucket '{bucket}'"))]
    ObjectNotFound { bucket: String, key: String },

    #[snafu(display("Simulated failure of '{operation}' on '{key}' in bucket '{bucket}'"))]
    InjectedFault {
        bucket: String,
        key: String,
        operation: &'static str,
    },

    #[snafu(display("Error serializing document '{document_id}' in '{collection_path}'"))]
    SerializeDocument {
        collection_path: String,
        document_id: String,
        source: serde_json::Error,
    },

    // Local scratch storage and runtime failures
    #[snafu(display("Error creating scratch directory"))]
    CreateScratchDir { source: std::io::Error },

    #[snafu(display("I/O error on scratch file '{}'", path.display()))]
    ScratchIo {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Error walking the extracted tree under '{}'", root.display()))]
    WalkScratch {
        root: PathBuf,
        source: walkdir::Error,
    },

    #[snafu(display("Error parsing object storage event notification"))]
    ParseEvent { source: serde_json::Error },

    #[snafu(display("Object key '{key}' in an event notification is not valid UTF-8 once decoded"))]
    InvalidEventKey {
        key: String,
        source: std::str::Utf8Error,
    },

    #[snafu(display("A blocking task panicked or was canceled"))]
    SpawnBlocking { source: tokio::task::JoinError },

    #[snafu(display("An async task panicked or was canceled"))]
    Spawn { source: tokio::task::JoinError },
}
