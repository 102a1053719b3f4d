//! Download of an uploaded archive into scratch storage, and expansion of its entries next to it.
//!
//! The `zip` crate does blocking I/O and needs to seek within the archive, so the archive is first
//! streamed from object storage to a local file, then decoded in a blocking worker.  Extraction
//! finishes completely before anything is published.
//!
//! The archive is downloaded into the scratch root itself and its entries are expanded into that
//! same root, so the archive file sits among its own contents.  [`crate::TreePublisher`] knows to
//! leave it out.
use crate::objstore::Bucket;
use crate::Result;
use snafu::{prelude::*, IntoError};
use std::io::{BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};
use zip::result::ZipError;

/// An archive downloaded into scratch storage
#[derive(Clone, Debug)]
pub struct DownloadedArchive {
    pub path: PathBuf,
    pub size: u64,
}

/// A file expanded from an archive into scratch storage
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExtractedEntry {
    /// Path of the entry within the archive, `/` separated
    pub relative_path: String,
    pub size: u64,
}

impl ExtractedEntry {
    /// Where the entry's contents are on the local filesystem
    pub fn local_path(&self, root: &Path) -> PathBuf {
        root.join(&self.relative_path)
    }
}

#[derive(Debug)]
pub struct ArchiveExtractor {
    bucket: Box<dyn Bucket>,
}

impl ArchiveExtractor {
    pub fn new(bucket: Box<dyn Bucket>) -> Self {
        Self { bucket }
    }

    /// Stream the archive `key` into the file `archive_file_name` in the directory `root`.
    ///
    /// Any failure, whether reading from object storage or writing the local file, is reported as
    /// [`crate::ChatDropError::Download`].
    #[instrument(skip(self, root), fields(bucket = self.bucket.name()))]
    pub async fn download(
        &self,
        key: &str,
        archive_file_name: &str,
        root: &Path,
    ) -> Result<DownloadedArchive> {
        let path = root.join(archive_file_name);

        info!(path = %path.display(), "Downloading archive");

        let size = self
            .download_to(key, &path)
            .await
            .with_context(|_| crate::error::DownloadSnafu {
                bucket: self.bucket.name(),
                key,
            })?;

        info!(size, "Downloaded archive");

        Ok(DownloadedArchive { path, size })
    }

    async fn download_to(&self, key: &str, path: &Path) -> Result<u64> {
        let mut chunks = self.bucket.read_object(key).await?;

        let mut file = tokio::fs::File::create(path)
            .await
            .with_context(|_| crate::error::ScratchIoSnafu { path })?;
        let mut size = 0u64;

        while let Some(chunk) = chunks.recv().await {
            let chunk = chunk?;

            file.write_all(&chunk)
                .await
                .with_context(|_| crate::error::ScratchIoSnafu { path })?;
            size += chunk.len() as u64;
        }

        file.flush()
            .await
            .with_context(|_| crate::error::ScratchIoSnafu { path })?;

        Ok(size)
    }

    /// Expand every entry of the zip archive at `archive_path` under `root`, keeping the directory
    /// structure inside the archive.
    ///
    /// Archives that aren't zip files at all, or are truncated or fail their checksums, fail with
    /// [`crate::ChatDropError::CorruptArchive`].  Anything else that goes wrong fails with
    /// [`crate::ChatDropError::Extraction`].  `key` is only used to identify the archive in errors.
    #[instrument(skip(self, archive_path, root))]
    pub async fn extract(
        &self,
        key: &str,
        archive_path: &Path,
        root: &Path,
    ) -> Result<Vec<ExtractedEntry>> {
        let key = key.to_string();
        let archive_path = archive_path.to_path_buf();
        let root = root.to_path_buf();
        let span = tracing::Span::current();

        let entries = tokio::task::spawn_blocking(move || {
            let _guard = span.enter();

            extract_blocking(&key, &archive_path, &root)
        })
        .await
        .context(crate::error::SpawnBlockingSnafu)??;

        info!(entries = entries.len(), "Extracted archive");

        Ok(entries)
    }
}

fn extract_blocking(key: &str, archive_path: &Path, root: &Path) -> Result<Vec<ExtractedEntry>> {
    let file = std::fs::File::open(archive_path).map_err(|e| zip_error(key, e.into()))?;
    let mut archive =
        zip::ZipArchive::new(BufReader::new(file)).map_err(|e| zip_error(key, e))?;

    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(|e| zip_error(key, e))?;

        // Entries with absolute paths or `..` components would land outside the scratch root
        let Some(relative) = entry.enclosed_name().map(|path| path.to_path_buf()) else {
            warn!(name = entry.name(), "Skipping archive entry with an unsafe path");
            continue;
        };
        let target = root.join(&relative);

        if target == archive_path {
            warn!(name = entry.name(), "Skipping archive entry which would overwrite the archive itself");
            continue;
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&target).map_err(|e| zip_error(key, e.into()))?;
            continue;
        }

        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| zip_error(key, e.into()))?;
        }

        let mut output = std::fs::File::create(&target).map_err(|e| zip_error(key, e.into()))?;
        let size = std::io::copy(&mut entry, &mut output).map_err(|e| zip_error(key, e.into()))?;

        let relative_path = relative_key(&relative);
        debug!(%relative_path, size, "Extracted entry");

        entries.push(ExtractedEntry {
            relative_path,
            size,
        });
    }

    Ok(entries)
}

/// Classify a failure reading the archive as corruption or some other extraction failure
fn zip_error(key: &str, error: ZipError) -> crate::ChatDropError {
    let corrupt = match &error {
        ZipError::InvalidArchive(_) => true,
        // Truncated entries, undecodable compressed data and checksum mismatches surface as I/O
        // errors from the entry reader
        ZipError::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof | ErrorKind::InvalidData | ErrorKind::InvalidInput
        ),
        _ => false,
    };

    if corrupt {
        crate::error::CorruptArchiveSnafu { key }.into_error(error)
    } else {
        crate::error::ExtractionSnafu { key }.into_error(error)
    }
}

/// Render a relative filesystem path as the `/` separated suffix of an object key
pub(crate) fn relative_key(path: &Path) -> String {
    path.components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objstore::MemoryObjectStorage;
    use crate::ChatDropError;
    use assert_matches::assert_matches;
    use chatdrop_testing::archive::{
        make_zip, make_zip_with, set_compression_method, ArchiveEntry, LZMA_CHAT_EXPORT,
        LZMA_CHAT_EXPORT_ENTRIES,
    };

    async fn extractor_with(key: &str, data: Vec<u8>) -> ArchiveExtractor {
        let storage = MemoryObjectStorage::new();
        storage.memory_bucket("test").insert_object(key, data);

        ArchiveExtractor::new(Box::new(storage.memory_bucket("test")))
    }

    #[tokio::test]
    async fn downloads_and_extracts_nested_entries() {
        let zip = make_zip(&[
            ArchiveEntry::file("a.txt", "hello"),
            ArchiveEntry::dir("sub/"),
            ArchiveEntry::file("sub/b.txt", "nested"),
            ArchiveEntry::file("sub/deeper/c.bin", vec![0u8, 1, 2, 3]),
        ])
        .unwrap();
        let extractor = extractor_with("user/u1/uploads/backup.zip", zip.clone()).await;
        let scratch = tempfile::tempdir().unwrap();

        let downloaded = extractor
            .download("user/u1/uploads/backup.zip", "backup.zip", scratch.path())
            .await
            .unwrap();
        assert_eq!(zip.len() as u64, downloaded.size);
        assert_eq!(scratch.path().join("backup.zip"), downloaded.path);

        let entries = extractor
            .extract("user/u1/uploads/backup.zip", &downloaded.path, scratch.path())
            .await
            .unwrap();

        let paths = entries
            .iter()
            .map(|entry| entry.relative_path.as_str())
            .collect::<Vec<_>>();
        assert_eq!(vec!["a.txt", "sub/b.txt", "sub/deeper/c.bin"], paths);
        assert_eq!(4, entries[2].size);

        assert_eq!(
            "nested",
            std::fs::read_to_string(entries[1].local_path(scratch.path())).unwrap()
        );
        assert!(scratch.path().join("sub").is_dir());
    }

    #[tokio::test]
    async fn missing_archive_is_download_error() {
        let storage = MemoryObjectStorage::new();
        let extractor = ArchiveExtractor::new(Box::new(storage.memory_bucket("test")));
        let scratch = tempfile::tempdir().unwrap();

        let result = extractor
            .download("user/u1/uploads/gone.zip", "gone.zip", scratch.path())
            .await;

        assert_matches!(result, Err(ChatDropError::Download { key, .. }) if key == "user/u1/uploads/gone.zip");
    }

    #[tokio::test]
    async fn garbage_is_corrupt_archive() {
        let extractor = extractor_with("bad.zip", b"this is not a zip file".to_vec()).await;
        let scratch = tempfile::tempdir().unwrap();

        let downloaded = extractor
            .download("bad.zip", "bad.zip", scratch.path())
            .await
            .unwrap();
        let result = extractor
            .extract("bad.zip", &downloaded.path, scratch.path())
            .await;

        assert_matches!(result, Err(ChatDropError::CorruptArchive { .. }));
    }

    #[tokio::test]
    async fn truncated_archive_is_corrupt() {
        let zip = make_zip(&[ArchiveEntry::random("big.bin", "64KiB")]).unwrap();
        let truncated = zip[..zip.len() / 2].to_vec();
        let extractor = extractor_with("cut.zip", truncated).await;
        let scratch = tempfile::tempdir().unwrap();

        let downloaded = extractor
            .download("cut.zip", "cut.zip", scratch.path())
            .await
            .unwrap();
        let result = extractor
            .extract("cut.zip", &downloaded.path, scratch.path())
            .await;

        assert_matches!(result, Err(ChatDropError::CorruptArchive { .. }));
    }

    /// Download and extract `data` stored as `key`, returning the scratch dir with the result
    async fn download_and_extract(
        key: &str,
        data: Vec<u8>,
    ) -> (tempfile::TempDir, Result<Vec<ExtractedEntry>>) {
        let extractor = extractor_with(key, data).await;
        let scratch = tempfile::tempdir().unwrap();

        let downloaded = extractor
            .download(key, "archive.zip", scratch.path())
            .await
            .unwrap();
        let result = extractor
            .extract(key, &downloaded.path, scratch.path())
            .await;

        (scratch, result)
    }

    #[tokio::test]
    async fn extracts_bzip2_entries() {
        let zip = make_zip_with(
            &[
                ArchiveEntry::file("_chat.txt", "[01/02/2024, 10:00:00] Ann: hi\n"),
                ArchiveEntry::random("media/IMG-0001.jpg", "8KiB"),
            ],
            zip::CompressionMethod::Bzip2,
        )
        .unwrap();

        let (scratch, result) = download_and_extract("bzip2.zip", zip).await;
        let entries = result.unwrap();

        assert_eq!(2, entries.len());
        assert_eq!(8 * 1024, entries[1].size);
        assert_eq!(
            "[01/02/2024, 10:00:00] Ann: hi\n",
            std::fs::read_to_string(entries[0].local_path(scratch.path())).unwrap()
        );
    }

    #[tokio::test]
    async fn extracts_lzma_entries() {
        let (scratch, result) =
            download_and_extract("lzma.zip", LZMA_CHAT_EXPORT.to_vec()).await;
        let entries = result.unwrap();

        assert_eq!(LZMA_CHAT_EXPORT_ENTRIES.len(), entries.len());
        for (path, contents) in LZMA_CHAT_EXPORT_ENTRIES {
            assert_eq!(
                *contents,
                std::fs::read_to_string(scratch.path().join(path)).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn unknown_compression_method_is_extraction_error() {
        let zip = make_zip(&[ArchiveEntry::file("a.txt", "hello")]).unwrap();

        let (_scratch, result) =
            download_and_extract("terse.zip", set_compression_method(zip, 18)).await;

        assert_matches!(result, Err(ChatDropError::Extraction { key, .. }) if key == "terse.zip");
    }

    #[test]
    fn relative_key_uses_forward_slashes() {
        assert_eq!("a/b/c.txt", relative_key(&Path::new("a").join("b").join("c.txt")));
    }
}
