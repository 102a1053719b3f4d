//! Progress bar rendering for pipeline runs
use chatdrop::{ChatDropError, CopySummary, PipelineOutcome, PublishSummary, Stage, TriggerEvent};
use std::time::{Duration, Instant};

/// Run the pipeline for one event, with progress bars for extra pretty-ness
pub(crate) async fn run_pipeline(
    globals: &super::Globals,
    pipeline: &chatdrop::Pipeline,
    event: &TriggerEvent,
) -> chatdrop::Result<PipelineOutcome> {
    let progress = PipelineProgressReport::new(hide_progress(globals), event);

    pipeline.run(event, progress).await
}

/// Progress should be hidden for either of verbose mode (because there will be a flurry of log
/// messages and the progress bar rendering will be all messed up), or quiet mode (because
/// progress bars are not quiet).
fn hide_progress(globals: &super::Globals) -> bool {
    globals.verbose || globals.quiet
}

/// Receives progress updates from the pipeline and renders them as a stage spinner plus one bar
/// each for publishing and copying
struct PipelineProgressReport {
    multi: indicatif::MultiProgress,

    /// The stage the run is in
    stage: indicatif::ProgressBar,

    /// Extracted files uploaded so far, failed or not, out of the files in the archive
    published: indicatif::ProgressBar,

    /// Objects mirrored to the chats prefix so far
    copied: indicatif::ProgressBar,

    started: Instant,
}

impl PipelineProgressReport {
    fn new(hide_progress: bool, event: &TriggerEvent) -> Self {
        fn bar_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix:>8}: {msg:<55!} [{bar:20.cyan/blue}] {pos}/{len}",
            )
            .unwrap()
            .progress_chars("#>-")
        }

        fn counter_style() -> indicatif::ProgressStyle {
            indicatif::ProgressStyle::with_template(
                "{spinner:.green} {prefix:>8}: {msg:<55!} {pos} objects",
            )
            .unwrap()
        }

        let multi = if !hide_progress {
            indicatif::MultiProgress::new()
        } else {
            indicatif::MultiProgress::with_draw_target(indicatif::ProgressDrawTarget::hidden())
        };

        let stage = multi.add(indicatif::ProgressBar::new_spinner());
        stage.set_style(
            indicatif::ProgressStyle::with_template("{spinner:.blue} {prefix}: {msg}").unwrap(),
        );
        stage.set_prefix(format!("s3://{}/{}", event.bucket, event.key));
        stage.enable_steady_tick(Duration::from_millis(120));

        let published = multi.add(indicatif::ProgressBar::new(0));
        published.set_style(bar_style());
        published.set_prefix("Publish");

        let copied = multi.add(indicatif::ProgressBar::new_spinner());
        copied.set_style(counter_style());
        copied.set_prefix("Copy");

        Self {
            multi,
            stage,
            published,
            copied,
            started: Instant::now(),
        }
    }

    fn println(&self, message: String) {
        // Only fails when the terminal is gone, at which point nobody would see the message
        let _ = self.multi.println(message);
    }
}

impl Drop for PipelineProgressReport {
    fn drop(&mut self) {
        self.stage.finish_and_clear();
        self.published.finish_and_clear();
        self.copied.finish_and_clear();
    }
}

impl chatdrop::PipelineProgressCallback for PipelineProgressReport {
    fn stage_entered(&self, stage: Stage) {
        self.stage.set_message(stage.to_string());
    }

    fn archive_downloaded(&self, key: &str, size: u64) {
        let size = indicatif::BinaryBytes(size);

        self.println(format!("Downloaded '{key}' ({size})"));
    }

    fn archive_extracted(&self, entries: usize, bytes: u64) {
        self.published.set_length(entries as u64);

        let entries = indicatif::HumanCount(entries as u64);
        let bytes = indicatif::BinaryBytes(bytes);
        self.println(format!("Extracted {entries} files ({bytes})"));
    }

    fn object_published(&self, key: &str, _size: u64) {
        self.published.inc(1);
        self.published.set_message(key.to_string());
    }

    fn object_publish_failed(&self, key: &str, error: &ChatDropError) {
        self.published.inc(1);
        self.println(format!("Failed to publish '{key}': {error}"));
    }

    fn publish_finished(&self, summary: &PublishSummary) {
        self.published.finish_and_clear();

        let uploaded = indicatif::HumanCount(summary.uploaded as u64);
        let failed = indicatif::HumanCount(summary.failed as u64);
        let bytes = indicatif::BinaryBytes(summary.bytes);
        self.println(format!(
            "Published {uploaded} files ({bytes}); {failed} failed"
        ));
    }

    fn marker_checked(&self, key: &str, present: bool) {
        if present {
            self.println(format!("Found chat marker '{key}'"));
        }
    }

    fn object_copied(&self, _source_key: &str, target_key: &str, _size: u64) {
        self.copied.inc(1);
        self.copied.set_message(target_key.to_string());
    }

    fn copy_finished(&self, summary: &CopySummary) {
        self.copied.finish_and_clear();

        let objects = indicatif::HumanCount(summary.objects as u64);
        let bytes = indicatif::BinaryBytes(summary.bytes);
        self.println(format!("Copied {objects} objects ({bytes})"));
    }

    fn completion_recorded(&self, collection_path: &str, document_id: &str) {
        let elapsed = indicatif::HumanDuration(self.started.elapsed());

        self.println(format!(
            "Recorded completion in '{collection_path}/{document_id}' after {elapsed}"
        ));
    }
}
