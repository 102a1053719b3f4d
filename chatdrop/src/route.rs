//! Classification of object keys into archive uploads the pipeline should process and
//! everything else.
//!
//! Uploaded archives live at `user/{uid}/uploads/{name}.zip`.  Everything the pipeline writes
//! back into the same bucket lives under `user/{uid}/extracted/` and `user/{uid}/chats/`, and
//! must never be mistaken for a new upload or the pipeline would trigger itself forever.
use std::fmt;
use std::path::Path;

/// Well-known file whose presence in an extracted archive marks it as a chat export.
pub const MARKER_FILE_NAME: &str = "_chat.txt";

/// Why a key was not routed to the pipeline.
///
/// Skips are expected and are not errors; most objects in the bucket are not archive uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// The key is not under `user/`
    NotUserObject,
    /// The key has fewer than 4 path segments
    TooFewSegments,
    /// The third segment isn't `uploads`
    NotInUploads,
    /// The key doesn't have a `.zip` extension
    NotZipArchive,
    /// The key is output of a previous run
    DerivedObject,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::NotUserObject => "not under user/",
            Self::TooFewSegments => "too few path segments",
            Self::NotInUploads => "not in user/[uid]/uploads/",
            Self::NotZipArchive => "not a zip file",
            Self::DerivedObject => "in an intermediate or final directory",
        };

        f.write_str(reason)
    }
}

/// A zip archive uploaded by a user, identified from its object key.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ArchiveUpload {
    /// The complete object key of the archive
    pub key: String,
    pub user_id: String,
    /// Final segment of the key, ie `backup.zip`
    pub archive_file_name: String,
    /// The file name without its extension, ie `backup`
    pub archive_base_name: String,
}

impl ArchiveUpload {
    /// Prefix under which the archive contents are published, ending in `/`
    pub fn extracted_prefix(&self) -> String {
        format!(
            "user/{}/extracted/{}/",
            self.user_id, self.archive_base_name
        )
    }

    /// Prefix into which a chat export is mirrored, ending in `/`
    pub fn chats_prefix(&self) -> String {
        format!("user/{}/chats/{}/", self.user_id, self.archive_base_name)
    }

    /// Key of the marker object within the published archive contents
    pub fn marker_key(&self) -> String {
        format!("{}{}", self.extracted_prefix(), MARKER_FILE_NAME)
    }

    /// Collection holding this user's completion cache documents
    pub fn cache_collection(&self) -> String {
        format!("users/{}/chatFoldersCache", self.user_id)
    }
}

/// Routing decision for an object key
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Route {
    Eligible(ArchiveUpload),
    Skip(SkipReason),
}

/// Decide whether `key` is an archive upload the pipeline should process.
///
/// Pure function of the key; the content type of the object plays no part.
pub fn route(key: &str) -> Route {
    let segments = key.split('/').collect::<Vec<_>>();

    if !key.starts_with("user/") {
        return Route::Skip(SkipReason::NotUserObject);
    }
    if segments.len() < 4 {
        return Route::Skip(SkipReason::TooFewSegments);
    }
    if segments[2] != "uploads" {
        return Route::Skip(SkipReason::NotInUploads);
    }
    if !key.to_lowercase().ends_with(".zip") {
        return Route::Skip(SkipReason::NotZipArchive);
    }

    // Unreachable while eligibility requires `uploads`, but if that check is ever relaxed this
    // keeps the pipeline from consuming its own output
    if segments[2] == "extracted" || segments[2] == "chats" {
        return Route::Skip(SkipReason::DerivedObject);
    }

    let archive_file_name = segments[segments.len() - 1].to_string();
    let archive_base_name = Path::new(&archive_file_name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(&archive_file_name)
        .to_string();

    Route::Eligible(ArchiveUpload {
        key: key.to_string(),
        user_id: segments[1].to_string(),
        archive_file_name,
        archive_base_name,
    })
}
