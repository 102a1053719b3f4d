//! Test helper that implements [`chatdrop::PipelineProgressCallback`] which keeps a record of
//! every progress update in order, so tests can verify what a run reported.
use chatdrop::{ChatDropError, CopySummary, PipelineProgressCallback, PublishSummary, Stage};
use more_asserts::*;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, strum::EnumDiscriminants)]
#[allow(dead_code)] // Not all fields are used in tests but we want to capture all of them
pub(crate) enum PipelineProgressEvent {
    StageEntered {
        stage: Stage,
    },

    ArchiveDownloaded {
        key: String,
        size: u64,
    },

    ArchiveExtracted {
        entries: usize,
        bytes: u64,
    },

    ObjectPublished {
        key: String,
        size: u64,
    },

    ObjectPublishFailed {
        key: String,
        error: String,
    },

    PublishFinished {
        summary: PublishSummary,
    },

    MarkerChecked {
        key: String,
        present: bool,
    },

    ObjectCopied {
        source_key: String,
        target_key: String,
        size: u64,
    },

    CopyFinished {
        summary: CopySummary,
    },

    CompletionRecorded {
        collection_path: String,
        document_id: String,
    },
}

#[derive(Clone)]
pub(crate) struct TestPipelineProgressCallback {
    events: Arc<Mutex<Vec<PipelineProgressEvent>>>,
}

impl TestPipelineProgressCallback {
    pub fn new() -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn events(&self) -> Vec<PipelineProgressEvent> {
        self.events.lock().unwrap().clone()
    }

    /// The stages entered, in order
    pub fn stages(&self) -> Vec<Stage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                PipelineProgressEvent::StageEntered { stage } => Some(stage),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, kind: PipelineProgressEventDiscriminants) -> usize {
        self.events()
            .iter()
            .filter(|event| PipelineProgressEventDiscriminants::from(*event) == kind)
            .count()
    }

    /// Review all updates after a run that got at least as far as publishing, validating that
    /// they agree with each other.
    pub fn sanity_check_updates(&self) {
        let events = self.events();

        let published = events
            .iter()
            .filter_map(|event| match event {
                PipelineProgressEvent::ObjectPublished { size, .. } => Some(*size),
                _ => None,
            })
            .collect::<Vec<_>>();
        let failed = self.count(PipelineProgressEventDiscriminants::ObjectPublishFailed);

        let summary = events
            .iter()
            .find_map(|event| match event {
                PipelineProgressEvent::PublishFinished { summary } => Some(*summary),
                _ => None,
            })
            .expect("a run that published must report a publish summary");

        assert_eq!(summary.uploaded, published.len());
        assert_eq!(summary.failed, failed);
        assert_eq!(summary.bytes, published.iter().sum::<u64>());

        // Every file that was extracted was either published or failed
        if let Some(entries) = events.iter().find_map(|event| match event {
            PipelineProgressEvent::ArchiveExtracted { entries, .. } => Some(*entries),
            _ => None,
        }) {
            assert_le!(summary.uploaded + summary.failed, entries);
        }

        let copied = self.count(PipelineProgressEventDiscriminants::ObjectCopied);
        if let Some(copy_summary) = events.iter().find_map(|event| match event {
            PipelineProgressEvent::CopyFinished { summary } => Some(*summary),
            _ => None,
        }) {
            assert_eq!(copy_summary.objects, copied);
            assert_ge!(copy_summary.objects, summary.uploaded);
        }

        // Stages only ever move forward
        let stages = self.stages();
        let mut sorted = stages.clone();
        sorted.sort_by_key(|stage| *stage as usize);
        assert_eq!(stages, sorted);
    }

    fn record(&self, event: PipelineProgressEvent) {
        self.events.lock().unwrap().push(event);
    }
}

impl PipelineProgressCallback for TestPipelineProgressCallback {
    fn stage_entered(&self, stage: Stage) {
        self.record(PipelineProgressEvent::StageEntered { stage });
    }

    fn archive_downloaded(&self, key: &str, size: u64) {
        self.record(PipelineProgressEvent::ArchiveDownloaded {
            key: key.to_string(),
            size,
        });
    }

    fn archive_extracted(&self, entries: usize, bytes: u64) {
        self.record(PipelineProgressEvent::ArchiveExtracted { entries, bytes });
    }

    fn object_published(&self, key: &str, size: u64) {
        self.record(PipelineProgressEvent::ObjectPublished {
            key: key.to_string(),
            size,
        });
    }

    fn object_publish_failed(&self, key: &str, error: &ChatDropError) {
        self.record(PipelineProgressEvent::ObjectPublishFailed {
            key: key.to_string(),
            error: error.to_string(),
        });
    }

    fn publish_finished(&self, summary: &PublishSummary) {
        self.record(PipelineProgressEvent::PublishFinished { summary: *summary });
    }

    fn marker_checked(&self, key: &str, present: bool) {
        self.record(PipelineProgressEvent::MarkerChecked {
            key: key.to_string(),
            present,
        });
    }

    fn object_copied(&self, source_key: &str, target_key: &str, size: u64) {
        self.record(PipelineProgressEvent::ObjectCopied {
            source_key: source_key.to_string(),
            target_key: target_key.to_string(),
            size,
        });
    }

    fn copy_finished(&self, summary: &CopySummary) {
        self.record(PipelineProgressEvent::CopyFinished { summary: *summary });
    }

    fn completion_recorded(&self, collection_path: &str, document_id: &str) {
        self.record(PipelineProgressEvent::CompletionRecorded {
            collection_path: collection_path.to_string(),
            document_id: document_id.to_string(),
        });
    }
}
