use std::path::PathBuf;
use url::Url;

/// The configuration settings that control how archives are fetched, unpacked, published and
/// mirrored.
///
/// A single process uses a single configuration; see
/// [`crate::ObjectStorageFactory::instance`].
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::Parser))]
pub struct Config {
    /// Use a custom S3 endpoint instead of AWS.
    ///
    /// Use this to operate on a non-Amazon S3-compatible service.  If this is set, the AWS region
    /// is still used for request signing.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "URL"))]
    pub s3_endpoint: Option<Url>,

    /// The AWS region to use.  If not set, the region is taken from the environment.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "REGION"))]
    pub aws_region: Option<String>,

    /// Explicit access key ID.  If not set, credentials are taken from the environment.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_secret_access_key"))]
    pub aws_access_key_id: Option<String>,

    /// Explicit secret access key.  Only used together with `aws_access_key_id`.
    #[cfg_attr(feature = "clap", clap(long, global = true, requires = "aws_access_key_id"))]
    pub aws_secret_access_key: Option<String>,

    /// The chunk size used for multipart uploads of extracted files.
    ///
    /// Multipart uploads will be used for files of `multipart_threshold` bytes or larger.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB".
    ///
    /// Note that the maximum number of chunks in an upload is 10,000, so for very large files
    /// this chunk size may be overridden if it's smaller than 1/10,000th of the size of the
    /// file.
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_chunk_size: byte_unit::Byte,

    /// The size threshold at which extracted files are uploaded in chunks of
    /// `multipart_chunk_size` bytes each.
    ///
    /// Can be specified as an integer, ie "1000000", or with a suffix ie "10MB"
    #[cfg_attr(feature = "clap", clap(long, default_value = "8MiB", global = true))]
    pub multipart_threshold: byte_unit::Byte,

    /// Objects larger than this are mirrored with a chunked copy which may take several calls
    /// to complete, each continuing where the last one left off.
    ///
    /// Smaller objects are copied with a single server-side copy call.  S3 refuses single copies of
    /// objects over 5GiB, so larger values act as 5GiB against S3.
    #[cfg_attr(feature = "clap", clap(long, default_value = "1GiB", global = true))]
    pub copy_threshold: byte_unit::Byte,

    /// The size of each part of a chunked copy.
    ///
    /// Like `multipart_chunk_size`, this is enlarged when needed to keep the number of parts
    /// under 10,000.
    #[cfg_attr(feature = "clap", clap(long, default_value = "256MiB", global = true))]
    pub copy_part_size: byte_unit::Byte,

    /// The maximum number of concurrent requests to the bucket when performing transfers.
    ///
    /// This bounds both the number of extracted files uploaded at once and the number of parts
    /// copied at once during a single chunked copy call.
    #[cfg_attr(feature = "clap", clap(long, default_value = "10", global = true))]
    pub max_concurrent_requests: usize,

    /// Directory in which per-run scratch directories are created.  Defaults to the system temp
    /// directory.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "DIR"))]
    pub scratch_dir: Option<PathBuf>,

    /// Bucket holding the completion cache documents.  Defaults to the bucket the archive was
    /// uploaded to.
    #[cfg_attr(feature = "clap", clap(long, global = true, value_name = "BUCKET"))]
    pub cache_bucket: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        // XXX: Unfortunately this is duplicated here and in the `clap` attributes, unfortunately I
        // can't find a better way unless we unconditionally take a clap dependency in the lib
        // crate which I'm not willing to do
        Self {
            s3_endpoint: None,
            aws_region: None,
            aws_access_key_id: None,
            aws_secret_access_key: None,
            multipart_chunk_size: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            multipart_threshold: byte_unit::Byte::from_bytes(8 * 1024 * 1024),
            copy_threshold: byte_unit::Byte::from_bytes(1024 * 1024 * 1024),
            copy_part_size: byte_unit::Byte::from_bytes(256 * 1024 * 1024),
            max_concurrent_requests: 10,
            scratch_dir: None,
            cache_bucket: None,
        }
    }
}

impl Config {
    /// Create a scratch directory for a single pipeline run.
    ///
    /// The directory and everything in it is deleted when the returned handle is dropped.
    pub(crate) fn scratch_dir(&self) -> std::io::Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("chatdrop-");

        match &self.scratch_dir {
            Some(dir) => builder.tempdir_in(dir),
            None => builder.tempdir(),
        }
    }
}

/// Size of each part when `len` bytes are transferred in parts of `part_size` bytes, enlarged
/// if needed so the transfer doesn't exceed the S3 limit of 10,000 parts.
pub(crate) fn part_size_for(len: u64, part_size: u64) -> u64 {
    const MAX_PARTS: u64 = 10_000;

    let part_size = part_size.max(1);
    if (len + part_size - 1) / part_size <= MAX_PARTS {
        part_size
    } else {
        (len + MAX_PARTS - 1) / MAX_PARTS
    }
}
