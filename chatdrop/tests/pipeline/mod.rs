//! End-to-end pipeline runs against in-memory object storage and an in-memory document store.
//!
//! Each test uploads a zip archive built on the fly, runs the pipeline for it the way a trigger
//! would, and then inspects the buckets and the document store.
use crate::progress::{PipelineProgressEventDiscriminants, TestPipelineProgressCallback};
use crate::Result;
use assert_matches::assert_matches;
use chatdrop::{
    ChatDropError, Config, FieldValue, MemoryBucket, MemoryDocumentStore, MemoryObjectStorage,
    Pipeline, PipelineOutcome, SkipReason, Stage, TriggerEvent, UPDATED_AT_FIELD,
};
use chatdrop_testing::archive::{
    corrupt_entries, make_zip, set_compression_method, unique_user_id, ArchiveEntry,
    LZMA_CHAT_EXPORT, LZMA_CHAT_EXPORT_ENTRIES,
};
use chatdrop_testing::logging::{test_with_captured_logs, test_with_logging};
use chrono::Utc;
use more_asserts::*;
use std::sync::Arc;

const BUCKET: &str = "chat-uploads";

struct Fixture {
    bucket: MemoryBucket,
    documents: MemoryDocumentStore,
    pipeline: Pipeline,
    /// Parent of the per-run scratch directories, so tests can check they're cleaned up
    scratch: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Result<Self> {
        let storage = MemoryObjectStorage::new();
        let bucket = storage.memory_bucket(BUCKET);
        let documents = MemoryDocumentStore::new();
        let scratch = tempfile::tempdir()?;

        let config = Config {
            scratch_dir: Some(scratch.path().to_path_buf()),
            ..Default::default()
        };

        let pipeline = Pipeline::new(config, Box::new(storage))
            .with_document_store(Arc::new(documents.clone()));

        Ok(Self {
            bucket,
            documents,
            pipeline,
            scratch,
        })
    }

    /// Put an archive with `entries` at `key`, returning the trigger event for it
    fn upload(&self, key: &str, entries: &[ArchiveEntry]) -> Result<TriggerEvent> {
        self.bucket.insert_object(key, make_zip(entries)?);

        Ok(TriggerEvent::new(BUCKET, key).with_content_type("application/zip"))
    }

    fn data(&self, key: &str) -> Option<Vec<u8>> {
        self.bucket.object(key).map(|object| object.data.to_vec())
    }

    fn assert_scratch_removed(&self) -> Result<()> {
        assert_eq!(0, std::fs::read_dir(self.scratch.path())?.count());

        Ok(())
    }
}

fn chat_export() -> Vec<ArchiveEntry> {
    vec![
        ArchiveEntry::file("_chat.txt", "[01/02/2024, 10:00:00] Ann: hi\n"),
        ArchiveEntry::random("IMG-0001.jpg", "20KiB"),
        ArchiveEntry::dir("media/"),
        ArchiveEntry::file("media/voice.opus", vec![9u8; 512]),
    ]
}

#[test]
fn ineligible_keys_are_skipped() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;

        for (key, reason) in [
            ("user/u1/extracted/backup/a.txt", SkipReason::NotInUploads),
            ("user/u1/chats/backup/_chat.txt", SkipReason::NotInUploads),
            ("uploads/backup.zip", SkipReason::NotUserObject),
            ("user/u1/backup.zip", SkipReason::TooFewSegments),
            ("user/u1/uploads/notes.txt", SkipReason::NotZipArchive),
        ] {
            fixture.bucket.insert_object(key, "whatever");

            let outcome = fixture
                .pipeline
                .run_without_progress(&TriggerEvent::new(BUCKET, key))
                .await?;

            assert_eq!(PipelineOutcome::Skipped(reason), outcome, "{key}");
        }

        // Nothing was written besides the objects the test put there itself
        assert_eq!(5, fixture.bucket.keys().len());
        assert!(fixture.documents.is_empty());

        Ok(())
    })
}

#[test]
fn archive_without_marker_is_only_published() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload(
            "user/u1/uploads/backup.zip",
            &[
                ArchiveEntry::file("a.txt", "alpha"),
                ArchiveEntry::file("sub/b.txt", "bravo"),
            ],
        )?;

        let outcome = fixture.pipeline.run_without_progress(&event).await?;

        let published = assert_matches!(outcome, PipelineOutcome::Extracted { published, .. } => published);
        assert_eq!(2, published.uploaded);
        assert_eq!(0, published.failed);

        assert_eq!(
            vec![
                "user/u1/extracted/backup/a.txt",
                "user/u1/extracted/backup/sub/b.txt",
                "user/u1/uploads/backup.zip",
            ],
            fixture.bucket.keys()
        );
        assert_eq!(
            Some(b"alpha".to_vec()),
            fixture.data("user/u1/extracted/backup/a.txt")
        );
        assert_eq!(
            Some(b"bravo".to_vec()),
            fixture.data("user/u1/extracted/backup/sub/b.txt")
        );
        assert!(fixture.bucket.keys_with_prefix("user/u1/chats/").is_empty());
        assert!(fixture.documents.is_empty());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn chat_export_is_mirrored_and_recorded() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let entries = chat_export();
        let event = fixture.upload("user/u1/uploads/backup.zip", &entries)?;
        let started = Utc::now();

        let progress = TestPipelineProgressCallback::new();
        let outcome = fixture.pipeline.run(&event, progress.clone()).await?;

        let (published, copied) = assert_matches!(
            outcome,
            PipelineOutcome::Mirrored { published, copied, .. } => (published, copied)
        );
        assert_eq!(3, published.uploaded);
        assert_eq!(3, copied.objects);

        // Every archive entry is published and mirrored byte for byte
        for entry in &entries {
            let Some(data) = entry.data() else {
                continue;
            };

            let extracted = format!("user/u1/extracted/backup/{}", entry.path());
            let mirrored = format!("user/u1/chats/backup/{}", entry.path());
            assert_eq!(Some(data.to_vec()), fixture.data(&extracted), "{extracted}");
            assert_eq!(Some(data.to_vec()), fixture.data(&mirrored), "{mirrored}");
        }

        let document = fixture
            .documents
            .document("users/u1/chatFoldersCache", "backup")
            .expect("completion record is written");
        let updated_at = assert_matches!(
            document.get(UPDATED_AT_FIELD),
            Some(FieldValue::Timestamp(at)) => *at
        );
        assert_ge!(updated_at, started);
        assert_eq!(1, fixture.documents.len());

        assert_eq!(
            vec![
                Stage::Routing,
                Stage::Downloading,
                Stage::Extracting,
                Stage::Publishing,
                Stage::CheckingMarker,
                Stage::Copying,
                Stage::CachingCompletion,
            ],
            progress.stages()
        );
        assert_eq!(
            1,
            progress.count(PipelineProgressEventDiscriminants::CompletionRecorded)
        );
        progress.sanity_check_updates();
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn mirrored_copies_keep_metadata() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload("user/u1/uploads/backup.zip", &chat_export())?;

        fixture.pipeline.run_without_progress(&event).await?;

        for key in fixture.bucket.keys_with_prefix("user/u1/extracted/backup/") {
            let mirrored = key.replace("/extracted/", "/chats/");

            let source = fixture.bucket.object(&key).unwrap();
            let target = fixture.bucket.object(&mirrored).unwrap();
            assert_eq!(source.metadata, target.metadata, "{mirrored}");
        }

        let chat = fixture.bucket.object("user/u1/chats/backup/_chat.txt").unwrap();
        assert_eq!(Some("text/plain"), chat.metadata.content_type.as_deref());
        let image = fixture.bucket.object("user/u1/chats/backup/IMG-0001.jpg").unwrap();
        assert_eq!(Some("image/jpeg"), image.metadata.content_type.as_deref());

        Ok(())
    })
}

#[test]
fn corrupt_archive_publishes_nothing() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        fixture
            .bucket
            .insert_object("user/u1/uploads/backup.zip", "PK\x03\x04 but not really a zip");

        let result = fixture
            .pipeline
            .run_without_progress(&TriggerEvent::new(BUCKET, "user/u1/uploads/backup.zip"))
            .await;

        assert_matches!(result, Err(ChatDropError::CorruptArchive { .. }));
        assert_eq!(vec!["user/u1/uploads/backup.zip"], fixture.bucket.keys());
        assert!(fixture.documents.is_empty());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn damaged_entries_fail_extraction() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let archive = make_zip(&[ArchiveEntry::random("big.bin", "256KiB")])?;
        fixture
            .bucket
            .insert_object("user/u1/uploads/backup.zip", corrupt_entries(archive));

        let result = fixture
            .pipeline
            .run_without_progress(&TriggerEvent::new(BUCKET, "user/u1/uploads/backup.zip"))
            .await;

        assert_matches!(result, Err(ChatDropError::CorruptArchive { .. }));
        assert!(fixture
            .bucket
            .keys_with_prefix("user/u1/extracted/")
            .is_empty());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn undecodable_entries_are_extraction_error() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let archive = make_zip(&chat_export())?;
        fixture.bucket.insert_object(
            "user/u1/uploads/backup.zip",
            set_compression_method(archive, 18),
        );

        let result = fixture
            .pipeline
            .run_without_progress(&TriggerEvent::new(BUCKET, "user/u1/uploads/backup.zip"))
            .await;

        assert_matches!(result, Err(ChatDropError::Extraction { key, .. }) if key == "user/u1/uploads/backup.zip");
        assert!(fixture
            .bucket
            .keys_with_prefix("user/u1/extracted/")
            .is_empty());
        assert!(fixture.bucket.keys_with_prefix("user/u1/chats/").is_empty());
        assert!(fixture.documents.is_empty());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn lzma_chat_export_is_mirrored() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        fixture
            .bucket
            .insert_object("user/u1/uploads/lzma.zip", LZMA_CHAT_EXPORT);

        let outcome = fixture
            .pipeline
            .run_without_progress(&TriggerEvent::new(BUCKET, "user/u1/uploads/lzma.zip"))
            .await?;

        assert_matches!(outcome, PipelineOutcome::Mirrored { copied, .. } if copied.objects == LZMA_CHAT_EXPORT_ENTRIES.len());
        for (path, contents) in LZMA_CHAT_EXPORT_ENTRIES {
            assert_eq!(
                Some(contents.as_bytes().to_vec()),
                fixture.data(&format!("user/u1/chats/lzma/{path}"))
            );
        }
        assert!(fixture
            .documents
            .document("users/u1/chatFoldersCache", "lzma")
            .is_some());

        Ok(())
    })
}

#[test]
fn missing_archive_is_download_error() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;

        let result = fixture
            .pipeline
            .run_without_progress(&TriggerEvent::new(BUCKET, "user/u1/uploads/gone.zip"))
            .await;

        assert_matches!(result, Err(ChatDropError::Download { .. }));
        assert!(fixture.bucket.keys().is_empty());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn failed_upload_does_not_stop_the_others() -> Result<()> {
    let logs = test_with_captured_logs(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload("user/u1/uploads/backup.zip", &chat_export())?;
        fixture
            .bucket
            .fail_uploads_to("user/u1/extracted/backup/IMG-0001.jpg");

        let progress = TestPipelineProgressCallback::new();
        let outcome = fixture.pipeline.run(&event, progress.clone()).await?;

        // The marker made it, so the run still mirrors whatever was published
        let (published, copied) = assert_matches!(
            outcome,
            PipelineOutcome::Mirrored { published, copied, .. } => (published, copied)
        );
        assert_eq!(2, published.uploaded);
        assert_eq!(1, published.failed);
        assert_eq!(2, copied.objects);

        assert_eq!(
            vec![
                "user/u1/extracted/backup/_chat.txt",
                "user/u1/extracted/backup/media/voice.opus",
            ],
            fixture.bucket.keys_with_prefix("user/u1/extracted/")
        );
        assert_eq!(
            1,
            progress.count(PipelineProgressEventDiscriminants::ObjectPublishFailed)
        );
        progress.sanity_check_updates();

        Ok(())
    })?;

    assert!(logs.contains("Failed to publish extracted file"));

    Ok(())
}

#[test]
fn archive_named_entries_are_not_republished() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload(
            "user/u1/uploads/backup.zip",
            &[
                ArchiveEntry::file("a.txt", "a"),
                ArchiveEntry::file("backup.zip", "an archive inside the archive"),
                ArchiveEntry::file("old/backup.zip", "and another one"),
                ArchiveEntry::file("old/other.zip", "this one is fine"),
            ],
        )?;

        let outcome = fixture.pipeline.run_without_progress(&event).await?;

        let published = assert_matches!(outcome, PipelineOutcome::Extracted { published, .. } => published);
        assert_eq!(2, published.uploaded);
        // The downloaded archive itself, plus the nested entry with the same name
        assert_eq!(2, published.skipped);
        assert_eq!(
            vec![
                "user/u1/extracted/backup/a.txt",
                "user/u1/extracted/backup/old/other.zip",
            ],
            fixture.bucket.keys_with_prefix("user/u1/extracted/")
        );

        Ok(())
    })
}

#[test]
fn rerun_is_idempotent() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let user_id = unique_user_id();
        let event = fixture.upload(&format!("user/{user_id}/uploads/backup.zip"), &chat_export())?;
        let collection = format!("users/{user_id}/chatFoldersCache");

        fixture.pipeline.run_without_progress(&event).await?;
        let keys = fixture.bucket.keys();
        let first = fixture.documents.document(&collection, "backup").unwrap();

        fixture.pipeline.run_without_progress(&event).await?;
        let second = fixture.documents.document(&collection, "backup").unwrap();

        assert_eq!(keys, fixture.bucket.keys());
        assert_eq!(1, fixture.documents.len());
        assert_eq!(2, fixture.documents.writes());

        let first = assert_matches!(first.get(UPDATED_AT_FIELD), Some(FieldValue::Timestamp(at)) => *at);
        let second = assert_matches!(second.get(UPDATED_AT_FIELD), Some(FieldValue::Timestamp(at)) => *at);
        assert_ge!(second, first);

        Ok(())
    })
}

#[test]
fn copy_failure_aborts_without_completion_record() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload("user/u1/uploads/backup.zip", &chat_export())?;
        fixture
            .bucket
            .fail_copies_from("user/u1/extracted/backup/media/voice.opus");

        let result = fixture.pipeline.run_without_progress(&event).await;

        assert_matches!(result, Err(ChatDropError::Copy { source_key, .. }) if source_key == "user/u1/extracted/backup/media/voice.opus");
        assert!(fixture.documents.is_empty());

        // Published files stay, and copies made before the failure aren't rolled back
        assert_eq!(
            3,
            fixture
                .bucket
                .keys_with_prefix("user/u1/extracted/backup/")
                .len()
        );
        assert_eq!(
            vec![
                "user/u1/chats/backup/IMG-0001.jpg",
                "user/u1/chats/backup/_chat.txt",
            ],
            fixture.bucket.keys_with_prefix("user/u1/chats/")
        );
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}

#[test]
fn large_objects_are_copied_in_chunks() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        fixture.bucket.set_rewrite_chunk_size(4 * 1024);
        let event = fixture.upload(
            "user/u1/uploads/backup.zip",
            &[
                ArchiveEntry::file("_chat.txt", "chat"),
                ArchiveEntry::random("video.mp4", "100KiB"),
            ],
        )?;

        let outcome = fixture.pipeline.run_without_progress(&event).await?;

        assert_matches!(outcome, PipelineOutcome::Mirrored { copied, .. } if copied.objects == 2);
        // One call for the marker, 25 for the video
        assert_eq!(26, fixture.bucket.rewrite_calls());
        assert_eq!(0, fixture.bucket.pending_rewrites());
        assert_eq!(
            fixture.data("user/u1/extracted/backup/video.mp4"),
            fixture.data("user/u1/chats/backup/video.mp4")
        );
        assert_eq!(1, fixture.documents.len());

        Ok(())
    })
}

#[test]
fn marker_check_failure_aborts_before_copy() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload("user/u1/uploads/backup.zip", &chat_export())?;
        fixture.bucket.fail_exists_checks(true);

        let result = fixture.pipeline.run_without_progress(&event).await;

        assert_matches!(result, Err(ChatDropError::BackendUnavailable { .. }));
        assert_eq!(
            3,
            fixture
                .bucket
                .keys_with_prefix("user/u1/extracted/backup/")
                .len()
        );
        assert!(fixture.bucket.keys_with_prefix("user/u1/chats/").is_empty());
        assert!(fixture.documents.is_empty());

        Ok(())
    })
}

#[test]
fn failed_completion_record_fails_the_run() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let event = fixture.upload("user/u1/uploads/backup.zip", &chat_export())?;
        fixture.documents.fail_writes(true);

        let result = fixture.pipeline.run_without_progress(&event).await;

        assert_matches!(result, Err(ChatDropError::CompletionRecord { .. }));
        // The mirror itself completed
        assert_eq!(3, fixture.bucket.keys_with_prefix("user/u1/chats/").len());

        Ok(())
    })
}

#[test]
fn concurrent_runs_for_different_archives() -> Result<()> {
    test_with_logging(async move {
        let fixture = Fixture::new()?;
        let first = fixture.upload("user/u1/uploads/one.zip", &chat_export())?;
        let second = fixture.upload("user/u2/uploads/two.zip", &chat_export())?;

        let (one, two) = tokio::join!(
            fixture.pipeline.run_without_progress(&first),
            fixture.pipeline.run_without_progress(&second)
        );

        assert_matches!(one?, PipelineOutcome::Mirrored { .. });
        assert_matches!(two?, PipelineOutcome::Mirrored { .. });
        assert_eq!(3, fixture.bucket.keys_with_prefix("user/u1/chats/one/").len());
        assert_eq!(3, fixture.bucket.keys_with_prefix("user/u2/chats/two/").len());
        assert_eq!(2, fixture.documents.len());
        fixture.assert_scratch_removed()?;

        Ok(())
    })
}
