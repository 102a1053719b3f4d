//! Builders for zip archives used as test input
use crate::Result;
use rand::prelude::*;
use std::io::{Cursor, Write};
use zip::write::SimpleFileOptions;

/// One entry in a test archive
#[derive(Clone, Debug)]
pub enum ArchiveEntry {
    File { path: String, data: Vec<u8> },
    Dir { path: String },
}

impl ArchiveEntry {
    pub fn file(path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        Self::File {
            path: path.into(),
            data: data.into(),
        }
    }

    /// A file of random data, with the size given in human-friendly units like "10 KB" or
    /// "2 MiB"
    pub fn random(path: impl Into<String>, size: impl AsRef<str>) -> Self {
        let size = byte_unit::Byte::from_str(size).unwrap().get_bytes() as usize;
        let mut data = vec![0u8; size];
        rand::thread_rng().fill_bytes(&mut data);

        Self::file(path, data)
    }

    /// An explicit directory entry.  Its path should end in `/`.
    pub fn dir(path: impl Into<String>) -> Self {
        Self::Dir { path: path.into() }
    }

    pub fn path(&self) -> &str {
        match self {
            Self::File { path, .. } | Self::Dir { path } => path,
        }
    }

    /// The contents of a file entry; directories have none
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Self::File { data, .. } => Some(data),
            Self::Dir { .. } => None,
        }
    }
}

/// Contents of [`LZMA_CHAT_EXPORT`], as (path, contents)
pub const LZMA_CHAT_EXPORT_ENTRIES: &[(&str, &str)] = &[
    (
        "_chat.txt",
        "[01/02/2024, 10:00:00] Ann: hi\n[01/02/2024, 10:01:00] Bob: hello\n",
    ),
    ("media/note.txt", "voice note transcript\n"),
];

/// A chat export whose entries are LZMA compressed (method 14), as written by common archivers.
///
/// The `zip` crate can read LZMA entries but not write them, so this one is checked in.
pub const LZMA_CHAT_EXPORT: &[u8] = include_bytes!("../data/chat-export-lzma.zip");

/// Build a deflate-compressed zip archive containing `entries`, in order
pub fn make_zip(entries: &[ArchiveEntry]) -> Result<Vec<u8>> {
    make_zip_with(entries, zip::CompressionMethod::Deflated)
}

/// Build a zip archive containing `entries`, in order, with every entry compressed by `method`
pub fn make_zip_with(
    entries: &[ArchiveEntry],
    method: zip::CompressionMethod,
) -> Result<Vec<u8>> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(method);

    for entry in entries {
        match entry {
            ArchiveEntry::File { path, data } => {
                writer.start_file(path.as_str(), options)?;
                writer.write_all(data)?;
            }
            ArchiveEntry::Dir { path } => {
                writer.add_directory(path.as_str(), options)?;
            }
        }
    }

    Ok(writer.finish()?.into_inner())
}

/// Flip bytes in the middle of `archive` so the compressed data of its entries no longer matches
/// their checksums.  The archive structure at the end is left intact.
pub fn corrupt_entries(mut archive: Vec<u8>) -> Vec<u8> {
    let end = archive.len() / 2;
    for byte in archive.iter_mut().take(end).skip(64) {
        *byte = !*byte;
    }

    archive
}

/// Rewrite the compression method of every entry in `archive` to the raw method number `method`,
/// in both the central directory and the local headers.  The compressed data is left alone.
///
/// With a method no decoder knows, such as 18 (IBM TERSE), the result is a well-formed archive
/// whose entries can't be decompressed.
pub fn set_compression_method(mut archive: Vec<u8>, method: u16) -> Vec<u8> {
    const END_OF_CENTRAL_DIRECTORY: &[u8] = b"PK\x05\x06";
    const CENTRAL_HEADER_LEN: usize = 46;

    let read_u16 = |archive: &[u8], at: usize| u16::from_le_bytes([archive[at], archive[at + 1]]);
    let read_u32 = |archive: &[u8], at: usize| {
        u32::from_le_bytes([archive[at], archive[at + 1], archive[at + 2], archive[at + 3]])
    };

    let eocd = archive
        .windows(END_OF_CENTRAL_DIRECTORY.len())
        .rposition(|window| window == END_OF_CENTRAL_DIRECTORY)
        .expect("archive has no end of central directory record");
    let entries = read_u16(&archive, eocd + 10) as usize;
    let mut header = read_u32(&archive, eocd + 16) as usize;

    for _ in 0..entries {
        let local_header = read_u32(&archive, header + 42) as usize;
        let header_len = CENTRAL_HEADER_LEN
            + read_u16(&archive, header + 28) as usize
            + read_u16(&archive, header + 30) as usize
            + read_u16(&archive, header + 32) as usize;

        archive[header + 10..header + 12].copy_from_slice(&method.to_le_bytes());
        archive[local_header + 8..local_header + 10].copy_from_slice(&method.to_le_bytes());

        header += header_len;
    }

    archive
}

/// A user id unique to this test run, so tests against a shared bucket don't see each other's
/// objects
pub fn unique_user_id() -> String {
    format!("test-{:08x}", rand::thread_rng().next_u32())
}
