//! Reconciliation engine for applying local gallery edits to the remote
//! content store.
//!
//! A run takes a category's local working set and the remote set it was
//! loaded from, computes the difference, and applies it in three phases:
//! removals, uploads for new images, then metadata patches. Item failures
//! are collected instead of aborting the batch, binary uploads are retried
//! with exponential backoff, and cancellation is honoured at item
//! boundaries so an in-flight transfer is never torn down halfway.

pub mod changeset;

pub use changeset::{compute_change_set, ChangeSet};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::progress::{format_duration, ProgressSink, SyncPhase};
use crate::retry::{self, RetryAction, RetryConfig};
use crate::store::{AssetReference, ContentStore, ImagePatch, ImageRecord, StoreError};

/// Returned when [`SyncEngine::reconcile`] is called while another run on
/// the same engine is still in flight.
#[derive(Debug, Error)]
#[error("a sync run is already in progress")]
pub struct SyncInProgress;

/// One item the engine could not reconcile.
#[derive(Debug)]
pub struct FailedImage {
    pub image: ImageRecord,
    pub phase: SyncPhase,
    pub error: StoreError,
}

/// Outcome of one reconciliation run.
#[derive(Debug, Default)]
pub struct SyncReport {
    /// True when the run finished uncanceled with zero failures.
    pub success: bool,
    /// True when the run stopped at a cancellation point.
    pub canceled: bool,
    /// The records this run created or updated, in the order they were
    /// applied. Failed and skipped items are absent; `failed` carries
    /// them with their errors.
    pub new_images: Vec<ImageRecord>,
    /// The local working set with the run's outcomes folded in: created
    /// records carry their new ids and re-uploaded records their new
    /// assets, while failed items stay pending exactly as they were.
    /// This is what the manifest should now say.
    pub working_set: Vec<ImageRecord>,
    pub failed: Vec<FailedImage>,
}

fn percent(step: usize, total: usize) -> u8 {
    if total == 0 {
        100
    } else {
        ((step * 100 / total).min(99)) as u8
    }
}

/// Byte counters for a run's binary transfers. The batch is sized up
/// front so `on_file_progress` can report cumulative bytes against the
/// whole run rather than one file at a time.
struct TransferTotals {
    sent: u64,
    total: u64,
}

impl TransferTotals {
    /// Sum the pending file sizes before any transfer starts. A file
    /// that cannot be read is left out; its own upload step surfaces
    /// the error.
    async fn for_changes(changes: &ChangeSet) -> Self {
        let mut total = 0u64;
        for image in changes.to_add.iter().chain(&changes.to_update) {
            let Some(file) = &image.file else { continue };
            if let Ok(meta) = tokio::fs::metadata(file).await {
                total += meta.len();
            }
        }
        Self { sent: 0, total }
    }
}

/// The records a run actually created or updated, in applied order.
fn applied_records(
    created: &[(PathBuf, ImageRecord)],
    updated: &[ImageRecord],
) -> Vec<ImageRecord> {
    created
        .iter()
        .map(|(_, record)| record.clone())
        .chain(updated.iter().cloned())
        .collect()
}

/// Fold per-item successes back into the local working set, preserving its
/// order. Created records replace the pending entries that produced them
/// (matched by file path), updated records replace their prior versions
/// (matched by id), everything else passes through unchanged.
fn apply_outcomes(
    local: &[ImageRecord],
    mut created: Vec<(PathBuf, ImageRecord)>,
    updated: &[ImageRecord],
) -> Vec<ImageRecord> {
    let mut out = Vec::with_capacity(local.len());
    for image in local {
        if let Some(pos) = image
            .file
            .as_ref()
            .and_then(|f| created.iter().position(|(p, _)| p == f))
        {
            out.push(created.remove(pos).1);
            continue;
        }
        if let Some(id) = image.id.as_deref() {
            if let Some(refreshed) = updated.iter().find(|u| u.id.as_deref() == Some(id)) {
                out.push(refreshed.clone());
                continue;
            }
        }
        out.push(image.clone());
    }
    out
}

/// Applies a local working set to the remote store.
///
/// One engine instance runs one reconciliation at a time; a second call
/// while a run is in flight fails fast with [`SyncInProgress`]. The engine
/// is otherwise reusable: sequential runs (one per category, say) can share
/// one instance, its store connection, and its cancellation token.
pub struct SyncEngine {
    store: Arc<dyn ContentStore>,
    progress: Arc<dyn ProgressSink>,
    retry: RetryConfig,
    cancel: CancellationToken,
    in_flight: AtomicBool,
}

/// Clears the in-flight flag when a run ends, on every exit path.
struct FlightGuard<'a>(&'a AtomicBool);

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        progress: Arc<dyn ProgressSink>,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            progress,
            retry,
            cancel,
            in_flight: AtomicBool::new(false),
        }
    }

    /// Diff `local` against `original` and apply the difference remotely.
    ///
    /// Never fails on individual items: per-item errors land in the
    /// report's `failed` list and the batch keeps going. The report's
    /// terminal state is mirrored to the progress sink as exactly one of
    /// `on_complete` or `on_cancel`.
    pub async fn reconcile(
        &self,
        local: &[ImageRecord],
        original: &[ImageRecord],
    ) -> Result<SyncReport, SyncInProgress> {
        if self.in_flight.swap(true, Ordering::SeqCst) {
            return Err(SyncInProgress);
        }
        let _guard = FlightGuard(&self.in_flight);

        let run_started = Instant::now();
        let changes = compute_change_set(local, original);
        let total = changes.len();

        let mut step = 0usize;
        let mut failed: Vec<FailedImage> = Vec::new();
        let mut created: Vec<(PathBuf, ImageRecord)> = Vec::new();
        let mut updated: Vec<ImageRecord> = Vec::new();

        if total == 0 {
            self.progress
                .on_progress(0, 0, 100, "No changes to apply", SyncPhase::Complete);
            self.progress.on_complete(true, &[]);
            tracing::info!("No changes to apply");
            return Ok(SyncReport {
                success: true,
                canceled: false,
                new_images: Vec::new(),
                working_set: local.to_vec(),
                failed,
            });
        }

        let mut transfer = TransferTotals::for_changes(&changes).await;

        // Phase 1: removals.
        let mut deleted = 0usize;
        let failed_before = failed.len();
        for image in &changes.to_remove {
            if self.cancel.is_cancelled() {
                return Ok(self.finish_canceled(step, total, local, created, updated, failed));
            }
            let Some(id) = image.id.as_deref() else {
                // compute_change_set never emits an id-less removal
                step += 1;
                continue;
            };
            step += 1;
            match self.store.delete_image(id).await {
                Ok(()) => {
                    deleted += 1;
                    self.report_step(step, total, &format!("Deleted {}", image.label()), SyncPhase::Deleting);
                }
                Err(e) => {
                    tracing::error!("Failed to delete {}: {}", image.label(), e);
                    self.report_step(
                        step,
                        total,
                        &format!("Failed to delete {}", image.label()),
                        SyncPhase::Deleting,
                    );
                    failed.push(FailedImage {
                        image: image.clone(),
                        phase: SyncPhase::Deleting,
                        error: e,
                    });
                }
            }
        }
        if !changes.to_remove.is_empty() {
            self.report_phase(step, total, "Deleted", deleted, failed.len() - failed_before, SyncPhase::Deleting);
        }

        // Phase 2: uploads for new images.
        let mut uploaded = 0usize;
        let failed_before = failed.len();
        for image in &changes.to_add {
            if self.cancel.is_cancelled() {
                return Ok(self.finish_canceled(step, total, local, created, updated, failed));
            }
            step += 1;

            let Some(path) = image.file.clone() else {
                // Nothing to send; the item stays pending in the manifest.
                self.report_step(
                    step,
                    total,
                    &format!("Skipped {} (no file)", image.label()),
                    SyncPhase::Uploading,
                );
                continue;
            };

            match self.upload_and_create(image, &path, &mut transfer).await {
                Ok(record) => {
                    uploaded += 1;
                    self.report_step(step, total, &format!("Uploaded {}", image.label()), SyncPhase::Uploading);
                    created.push((path, record));
                }
                Err(e) => {
                    tracing::error!("Failed to upload {}: {}", image.label(), e);
                    self.report_step(
                        step,
                        total,
                        &format!("Failed to upload {}", image.label()),
                        SyncPhase::Uploading,
                    );
                    failed.push(FailedImage {
                        image: image.clone(),
                        phase: SyncPhase::Uploading,
                        error: e,
                    });
                }
            }
        }
        if !changes.to_add.is_empty() {
            self.report_phase(step, total, "Uploaded", uploaded, failed.len() - failed_before, SyncPhase::Uploading);
        }

        // Phase 3: metadata patches, with a fresh binary first when the
        // local record still points at a file.
        let mut patched = 0usize;
        let failed_before = failed.len();
        for image in &changes.to_update {
            if self.cancel.is_cancelled() {
                return Ok(self.finish_canceled(step, total, local, created, updated, failed));
            }
            step += 1;

            match self.patch_image(image, &mut transfer).await {
                Ok(asset) => {
                    patched += 1;
                    self.report_step(step, total, &format!("Updated {}", image.label()), SyncPhase::Updating);
                    let mut refreshed = image.clone();
                    refreshed.file = None;
                    if let Some(asset) = &asset {
                        refreshed.asset_id = Some(asset.id.clone());
                        refreshed.full_url = asset.url.clone();
                    }
                    updated.push(refreshed);
                }
                Err(e) => {
                    tracing::error!("Failed to update {}: {}", image.label(), e);
                    self.report_step(
                        step,
                        total,
                        &format!("Failed to update {}", image.label()),
                        SyncPhase::Updating,
                    );
                    failed.push(FailedImage {
                        image: image.clone(),
                        phase: SyncPhase::Updating,
                        error: e,
                    });
                }
            }
        }
        if !changes.to_update.is_empty() {
            self.report_phase(step, total, "Updated", patched, failed.len() - failed_before, SyncPhase::Updating);
        }

        let applied = total - failed.len();
        let message = if failed.is_empty() {
            format!("{} change(s) applied", total)
        } else {
            format!("{} of {} change(s) applied, {} failed", applied, total, failed.len())
        };
        self.progress
            .on_progress(total, total, 100, &message, SyncPhase::Complete);

        let new_images = applied_records(&created, &updated);
        let working_set = apply_outcomes(local, created, &updated);
        let success = failed.is_empty();
        self.progress.on_complete(success, &new_images);

        tracing::info!("── Sync summary ──");
        tracing::info!("  {} applied, {} failed, {} total", applied, failed.len(), total);
        tracing::info!("  elapsed: {}", format_duration(run_started.elapsed()));

        Ok(SyncReport {
            success,
            canceled: false,
            new_images,
            working_set,
            failed,
        })
    }

    fn report_step(&self, step: usize, total: usize, message: &str, phase: SyncPhase) {
        self.progress
            .on_progress(step, total, percent(step, total), message, phase);
    }

    /// One summary event per non-empty phase, emitted after the phase's
    /// last item and before the next phase begins.
    fn report_phase(
        &self,
        step: usize,
        total: usize,
        verb: &str,
        ok: usize,
        failures: usize,
        phase: SyncPhase,
    ) {
        let message = if failures == 0 {
            format!("{} {} image(s)", verb, ok)
        } else {
            format!("{} {} image(s), {} failed", verb, ok, failures)
        };
        self.report_step(step, total, &message, phase);
    }

    fn finish_canceled(
        &self,
        step: usize,
        total: usize,
        local: &[ImageRecord],
        created: Vec<(PathBuf, ImageRecord)>,
        updated: Vec<ImageRecord>,
        failed: Vec<FailedImage>,
    ) -> SyncReport {
        self.progress
            .on_progress(step, total, percent(step, total), "Canceled", SyncPhase::Canceled);
        self.progress.on_cancel();
        tracing::warn!("Sync canceled after {} of {} step(s)", step, total);
        SyncReport {
            success: false,
            canceled: true,
            new_images: applied_records(&created, &updated),
            working_set: apply_outcomes(local, created, &updated),
            failed,
        }
    }

    /// Send one binary through the retry policy.
    ///
    /// Only this transfer is retried. Document mutations are single shot:
    /// they are cheap, and replaying a create after an ambiguous failure
    /// could leave duplicate documents behind.
    async fn upload_with_retry(
        &self,
        data: &[u8],
        filename: &str,
    ) -> Result<AssetReference, StoreError> {
        let config = &self.retry;
        retry::retry_with_backoff(
            config,
            |e: &StoreError| {
                if retry::should_retry(config, e) {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            || {
                let data = data.to_vec();
                async move { self.store.upload_asset(data, filename).await }
            },
        )
        .await
    }

    /// Upload a pending image's file, then create its document.
    async fn upload_and_create(
        &self,
        image: &ImageRecord,
        path: &std::path::Path,
        transfer: &mut TransferTotals,
    ) -> Result<ImageRecord, StoreError> {
        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("image.jpg");

        let transfer_started = Instant::now();
        let asset = self.upload_with_retry(&data, filename).await?;
        let elapsed = transfer_started.elapsed().as_secs_f64().max(1e-6);
        transfer.sent += size;
        self.progress
            .on_file_progress(transfer.sent, transfer.total, size as f64 / elapsed);

        self.store.create_image(image, &asset).await
    }

    /// Patch an existing document, replacing its binary first when the
    /// local record carries a file. Returns the new asset, if any, so the
    /// working set can be refreshed.
    async fn patch_image(
        &self,
        image: &ImageRecord,
        transfer: &mut TransferTotals,
    ) -> Result<Option<AssetReference>, StoreError> {
        let Some(id) = image.id.as_deref() else {
            return Err(StoreError::Validation(
                "cannot update an image that was never persisted".to_string(),
            ));
        };

        let mut asset = None;
        if let Some(path) = &image.file {
            let data = tokio::fs::read(path).await?;
            let size = data.len() as u64;
            let filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("image.jpg");

            let transfer_started = Instant::now();
            let uploaded = self.upload_with_retry(&data, filename).await?;
            let elapsed = transfer_started.elapsed().as_secs_f64().max(1e-6);
            transfer.sent += size;
            self.progress
                .on_file_progress(transfer.sent, transfer.total, size as f64 / elapsed);
            asset = Some(uploaded);
        }

        let patch = ImagePatch::from_record(image, asset.as_ref());
        self.store.update_image(id, &patch).await?;
        Ok(asset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::path::Path;
    use std::sync::Mutex;

    use crate::store::Category;

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Progress {
            step: usize,
            total: usize,
            percent: u8,
            message: String,
            phase: SyncPhase,
        },
        FileProgress {
            uploaded: u64,
            total: u64,
        },
        Complete {
            success: bool,
            count: usize,
        },
        Cancel,
    }

    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<Event>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<Event> {
            self.events.lock().unwrap().clone()
        }
    }

    impl ProgressSink for RecordingSink {
        fn on_progress(&self, step: usize, total: usize, percent: u8, message: &str, phase: SyncPhase) {
            self.events.lock().unwrap().push(Event::Progress {
                step,
                total,
                percent,
                message: message.to_string(),
                phase,
            });
        }

        fn on_file_progress(&self, uploaded: u64, total: u64, _bytes_per_sec: f64) {
            self.events
                .lock()
                .unwrap()
                .push(Event::FileProgress { uploaded, total });
        }

        fn on_complete(&self, success: bool, new_images: &[ImageRecord]) {
            self.events.lock().unwrap().push(Event::Complete {
                success,
                count: new_images.len(),
            });
        }

        fn on_cancel(&self) {
            self.events.lock().unwrap().push(Event::Cancel);
        }
    }

    #[derive(Default)]
    struct MockStore {
        calls: Mutex<Vec<String>>,
        patches: Mutex<Vec<(String, ImagePatch)>>,
        /// Filenames that fail with a transient error this many times
        /// before succeeding.
        transient_upload_failures: Mutex<HashMap<String, u32>>,
        /// Filenames whose upload always fails with a validation error.
        rejected_uploads: HashSet<String>,
        /// Image ids whose deletion fails.
        failing_deletes: HashSet<String>,
        /// Image ids whose patch fails.
        failing_patches: HashSet<String>,
        /// Cancelled as a side effect of the first delete, simulating a
        /// Ctrl-C that lands while a request is in flight.
        cancel_on_delete: Option<CancellationToken>,
        /// When set, uploads block until the gate is notified.
        gate: Option<Arc<tokio::sync::Notify>>,
    }

    impl MockStore {
        fn log(&self, entry: String) {
            self.calls.lock().unwrap().push(entry);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ContentStore for MockStore {
        async fn list_categories(&self) -> Result<Vec<Category>, StoreError> {
            Ok(Vec::new())
        }

        async fn create_category(&self, title: &str, slug: &str) -> Result<Category, StoreError> {
            Ok(Category {
                id: format!("cat-{slug}"),
                title: title.to_string(),
                slug: slug.to_string(),
                updated_at: None,
            })
        }

        async fn delete_category(&self, _id: &str) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_images(&self, _category_id: &str) -> Result<Vec<ImageRecord>, StoreError> {
            Ok(Vec::new())
        }

        async fn create_image(
            &self,
            image: &ImageRecord,
            asset: &AssetReference,
        ) -> Result<ImageRecord, StoreError> {
            let label = image.label();
            self.log(format!("create {label}"));
            let mut record = image.clone();
            record.id = Some(format!("img-{label}"));
            record.file = None;
            record.asset_id = Some(asset.id.clone());
            record.full_url = asset.url.clone();
            Ok(record)
        }

        async fn update_image(&self, id: &str, patch: &ImagePatch) -> Result<(), StoreError> {
            self.log(format!("patch {id}"));
            if self.failing_patches.contains(id) {
                return Err(StoreError::Remote {
                    status: 409,
                    message: "document is locked".to_string(),
                });
            }
            self.patches
                .lock()
                .unwrap()
                .push((id.to_string(), patch.clone()));
            Ok(())
        }

        async fn delete_image(&self, id: &str) -> Result<(), StoreError> {
            self.log(format!("delete {id}"));
            if let Some(token) = &self.cancel_on_delete {
                token.cancel();
            }
            if self.failing_deletes.contains(id) {
                return Err(StoreError::Remote {
                    status: 500,
                    message: "internal error".to_string(),
                });
            }
            Ok(())
        }

        async fn upload_asset(
            &self,
            _data: Vec<u8>,
            filename: &str,
        ) -> Result<AssetReference, StoreError> {
            self.log(format!("upload {filename}"));
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            {
                let mut failures = self.transient_upload_failures.lock().unwrap();
                if let Some(remaining) = failures.get_mut(filename) {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(StoreError::Timeout { ms: 5 });
                    }
                }
            }
            if self.rejected_uploads.contains(filename) {
                return Err(StoreError::Validation(format!("{filename} is not an image")));
            }
            Ok(AssetReference {
                id: format!("asset-{filename}"),
                url: Some(format!("https://cdn.test/{filename}")),
            })
        }
    }

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("gallery-sync-tests").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_photo(dir: &Path, name: &str, bytes: usize) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, vec![0xAB; bytes]).unwrap();
        path
    }

    fn pending_image(file: &Path, order: i64) -> ImageRecord {
        ImageRecord {
            order,
            file: Some(file.to_path_buf()),
            category_id: "cat-1".to_string(),
            ..Default::default()
        }
    }

    fn remote_image(id: &str, order: i64) -> ImageRecord {
        ImageRecord {
            id: Some(id.to_string()),
            order,
            category_id: "cat-1".to_string(),
            ..Default::default()
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            ..RetryConfig::default()
        }
    }

    fn test_engine(
        store: Arc<MockStore>,
        sink: Arc<RecordingSink>,
        cancel: CancellationToken,
    ) -> SyncEngine {
        SyncEngine::new(store, sink, fast_retry(2), cancel)
    }

    #[tokio::test]
    async fn test_empty_changeset_completes_immediately() {
        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let images = vec![remote_image("a", 0), remote_image("b", 1)];
        let report = engine.reconcile(&images, &images).await.unwrap();

        assert!(report.success);
        assert!(!report.canceled);
        assert!(report.failed.is_empty());
        // Nothing was applied, so nothing is reported as new.
        assert!(report.new_images.is_empty());
        assert_eq!(report.working_set.len(), 2);
        assert!(store.calls().is_empty());

        let events = sink.events();
        assert_eq!(
            events[0],
            Event::Progress {
                step: 0,
                total: 0,
                percent: 100,
                message: "No changes to apply".to_string(),
                phase: SyncPhase::Complete,
            }
        );
        assert_eq!(events[1], Event::Complete { success: true, count: 0 });
    }

    #[tokio::test]
    async fn test_add_uploads_then_creates_document() {
        let dir = test_dir("add_flow");
        let file = write_photo(&dir, "dunes.jpg", 2048);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![pending_image(&file, 0)];
        let report = engine.reconcile(&local, &[]).await.unwrap();

        assert!(report.success);
        assert_eq!(store.calls(), vec!["upload dunes.jpg", "create dunes.jpg"]);

        let created = &report.new_images[0];
        assert_eq!(created.id.as_deref(), Some("img-dunes.jpg"));
        assert!(created.file.is_none());
        assert_eq!(created.asset_id.as_deref(), Some("asset-dunes.jpg"));

        let events = sink.events();
        assert!(events.contains(&Event::FileProgress {
            uploaded: 2048,
            total: 2048
        }));
        match events.last().unwrap() {
            Event::Complete { success: true, count: 1 } => {}
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_phases_apply_in_delete_add_update_order() {
        let dir = test_dir("phase_order");
        let file = write_photo(&dir, "new.jpg", 64);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut reordered = remote_image("keep", 1);
        reordered.order = 9;
        let local = vec![pending_image(&file, 0), reordered];
        let original = vec![remote_image("keep", 1), remote_image("gone", 2)];

        let report = engine.reconcile(&local, &original).await.unwrap();
        assert!(report.success);
        assert_eq!(
            store.calls(),
            vec!["delete gone", "upload new.jpg", "create new.jpg", "patch keep"]
        );
    }

    #[tokio::test]
    async fn test_transient_upload_failures_retried_to_success() {
        let dir = test_dir("transient");
        let file = write_photo(&dir, "flaky.jpg", 64);

        let store = Arc::new(MockStore {
            transient_upload_failures: Mutex::new(HashMap::from([("flaky.jpg".to_string(), 2)])),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let report = engine.reconcile(&[pending_image(&file, 0)], &[]).await.unwrap();

        assert!(report.success, "failures: {:?}", report.failed);
        let uploads = store
            .calls()
            .iter()
            .filter(|c| c.starts_with("upload"))
            .count();
        assert_eq!(uploads, 3);
    }

    #[tokio::test]
    async fn test_validation_failure_not_retried() {
        let dir = test_dir("rejected");
        let file = write_photo(&dir, "bad.jpg", 64);

        let store = Arc::new(MockStore {
            rejected_uploads: HashSet::from(["bad.jpg".to_string()]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let report = engine.reconcile(&[pending_image(&file, 0)], &[]).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].phase, SyncPhase::Uploading);
        assert!(matches!(report.failed[0].error, StoreError::Validation(_)));
        // Exactly one attempt: validation errors are permanent.
        assert_eq!(store.calls(), vec!["upload bad.jpg"]);
    }

    #[tokio::test]
    async fn test_retries_exhausted_records_failure() {
        let dir = test_dir("exhausted");
        let file = write_photo(&dir, "down.jpg", 64);

        let store = Arc::new(MockStore {
            transient_upload_failures: Mutex::new(HashMap::from([("down.jpg".to_string(), 99)])),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let report = engine.reconcile(&[pending_image(&file, 0)], &[]).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.failed[0].error, StoreError::Timeout { .. }));
        // 1 initial attempt + 2 retries, then give up. No document created.
        assert_eq!(
            store.calls(),
            vec!["upload down.jpg", "upload down.jpg", "upload down.jpg"]
        );
    }

    #[tokio::test]
    async fn test_item_failure_does_not_abort_batch() {
        let dir = test_dir("continue_on_failure");
        let bad = write_photo(&dir, "bad.jpg", 64);
        let good = write_photo(&dir, "good.jpg", 64);

        let store = Arc::new(MockStore {
            rejected_uploads: HashSet::from(["bad.jpg".to_string()]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![pending_image(&bad, 0), pending_image(&good, 1)];
        let report = engine.reconcile(&local, &[]).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.failed.len(), 1);
        // The second item was still processed and persisted.
        assert!(store.calls().contains(&"create good.jpg".to_string()));
        // Only the applied record is reported as new.
        assert_eq!(report.new_images.len(), 1);
        assert_eq!(report.new_images[0].id.as_deref(), Some("img-good.jpg"));
        // In the merged working set the failed item stays pending, in place.
        assert_eq!(report.working_set.len(), 2);
        assert!(report.working_set[0].file.is_some());
        assert_eq!(report.working_set[1].id.as_deref(), Some("img-good.jpg"));

        // The run still reached its terminal event.
        match sink.events().last().unwrap() {
            Event::Complete { success: false, count: 1 } => {}
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_delete_failure_recorded_and_batch_continues() {
        let dir = test_dir("delete_failure");
        let file = write_photo(&dir, "add.jpg", 64);

        let store = Arc::new(MockStore {
            failing_deletes: HashSet::from(["stuck".to_string()]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![pending_image(&file, 0)];
        let original = vec![remote_image("stuck", 0)];
        let report = engine.reconcile(&local, &original).await.unwrap();

        assert!(!report.success);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].phase, SyncPhase::Deleting);
        // The upload phase still ran.
        assert!(store.calls().contains(&"create add.jpg".to_string()));
        // The delete phase summary accounts for the failure.
        assert!(sink.events().iter().any(|e| matches!(
            e,
            Event::Progress { message, phase: SyncPhase::Deleting, .. }
                if message == "Deleted 0 image(s), 1 failed"
        )));
    }

    #[tokio::test]
    async fn test_fileless_add_skipped_but_counted() {
        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![ImageRecord {
            category_id: "cat-1".to_string(),
            ..Default::default()
        }];
        let report = engine.reconcile(&local, &[]).await.unwrap();

        // A skip is not a failure, and no remote call is made for it.
        assert!(report.success);
        assert!(store.calls().is_empty());
        // Skipped items are not applied records, but stay in the set.
        assert!(report.new_images.is_empty());
        assert!(report.working_set[0].id.is_none());

        let events = sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            Event::Progress { step: 1, total: 1, message, .. } if message.starts_with("Skipped")
        )));
    }

    #[tokio::test]
    async fn test_update_with_file_uploads_then_patches() {
        let dir = test_dir("update_reupload");
        let file = write_photo(&dir, "retake.jpg", 128);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut local_item = remote_image("img-1", 3);
        local_item.file = Some(file.clone());
        local_item.span_two_columns = Some(true);
        let original = vec![remote_image("img-1", 3)];

        let report = engine.reconcile(&[local_item], &original).await.unwrap();
        assert!(report.success);
        assert_eq!(store.calls(), vec!["upload retake.jpg", "patch img-1"]);

        let patches = store.patches.lock().unwrap();
        let (id, patch) = &patches[0];
        assert_eq!(id, "img-1");
        assert_eq!(patch.order, 3);
        assert_eq!(patch.span_two_columns, Some(true));
        assert_eq!(patch.asset_id.as_deref(), Some("asset-retake.jpg"));
        drop(patches);

        // The working set reflects the new binary and drops the file.
        assert!(report.working_set[0].file.is_none());
        assert_eq!(
            report.working_set[0].asset_id.as_deref(),
            Some("asset-retake.jpg")
        );
        // The refreshed record is also what the run reports as applied.
        assert_eq!(report.new_images.len(), 1);
        assert_eq!(report.new_images[0].id.as_deref(), Some("img-1"));
    }

    #[tokio::test]
    async fn test_update_upload_failure_skips_patch() {
        let dir = test_dir("update_upload_fails");
        let file = write_photo(&dir, "bad.jpg", 64);

        let store = Arc::new(MockStore {
            rejected_uploads: HashSet::from(["bad.jpg".to_string()]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut local_item = remote_image("img-1", 0);
        local_item.file = Some(file);
        let original = vec![remote_image("img-1", 9)];

        let report = engine.reconcile(&[local_item], &original).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.failed[0].phase, SyncPhase::Updating);
        // No patch with a stale or missing asset.
        assert_eq!(store.calls(), vec!["upload bad.jpg"]);
        // Nothing was applied; the item keeps its pending file for the
        // next run.
        assert!(report.new_images.is_empty());
        assert!(report.working_set[0].file.is_some());
    }

    #[tokio::test]
    async fn test_cancellation_respected_between_items() {
        let cancel = CancellationToken::new();
        let store = Arc::new(MockStore {
            cancel_on_delete: Some(cancel.clone()),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), cancel);

        let original = vec![remote_image("d1", 0), remote_image("d2", 1)];
        let report = engine.reconcile(&[], &original).await.unwrap();

        assert!(report.canceled);
        assert!(!report.success);
        // The in-flight delete finished; the next item never started.
        assert_eq!(store.calls(), vec!["delete d1"]);

        let events = sink.events();
        let n = events.len();
        assert!(matches!(
            &events[n - 2],
            Event::Progress { message, phase: SyncPhase::Canceled, .. } if message == "Canceled"
        ));
        assert_eq!(events[n - 1], Event::Cancel);
        assert!(!events
            .iter()
            .any(|e| matches!(e, Event::Complete { .. })));
    }

    #[tokio::test]
    async fn test_concurrent_reconcile_rejected() {
        let dir = test_dir("busy");
        let file = write_photo(&dir, "a.jpg", 64);

        let gate = Arc::new(tokio::sync::Notify::new());
        let store = Arc::new(MockStore {
            gate: Some(gate.clone()),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = Arc::new(test_engine(store.clone(), sink.clone(), CancellationToken::new()));

        let local = vec![pending_image(&file, 0)];
        let background = {
            let engine = engine.clone();
            let local = local.clone();
            tokio::spawn(async move { engine.reconcile(&local, &[]).await })
        };

        // Wait until the first run is inside the store call.
        while store.calls().is_empty() {
            tokio::task::yield_now().await;
        }

        assert!(engine.reconcile(&local, &[]).await.is_err());

        gate.notify_one();
        let report = background.await.unwrap().unwrap();
        assert!(report.success);

        // The guard releases once the run finishes.
        gate.notify_one();
        assert!(engine.reconcile(&local, &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_progress_is_monotonic_and_ends_at_100() {
        let dir = test_dir("progress_shape");
        let a = write_photo(&dir, "a.jpg", 16);
        let b = write_photo(&dir, "b.jpg", 16);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut reordered = remote_image("keep", 0);
        reordered.order = 5;
        let local = vec![pending_image(&a, 0), pending_image(&b, 1), reordered];
        let original = vec![remote_image("keep", 0), remote_image("gone", 1)];

        let report = engine.reconcile(&local, &original).await.unwrap();
        assert!(report.success);

        let progress: Vec<(usize, u8, SyncPhase)> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Progress { step, percent, phase, .. } => Some((*step, *percent, *phase)),
                _ => None,
            })
            .collect();

        // 4 item steps, 3 phase summaries, then the terminal event.
        assert_eq!(progress.len(), 8);
        for pair in progress.windows(2) {
            assert!(pair[1].0 >= pair[0].0, "steps regressed: {progress:?}");
            assert!(pair[1].1 >= pair[0].1, "percent regressed: {progress:?}");
        }
        let (last_step, last_percent, last_phase) = progress[progress.len() - 1];
        assert_eq!(last_step, 4);
        assert_eq!(last_percent, 100);
        assert_eq!(last_phase, SyncPhase::Complete);
        // Intermediate events never claim completion early.
        assert!(progress[..progress.len() - 1].iter().all(|p| p.1 < 100));
    }

    #[tokio::test]
    async fn test_phase_summaries_between_phases_and_before_terminal() {
        let dir = test_dir("phase_summaries");
        let file = write_photo(&dir, "new.jpg", 32);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut reordered = remote_image("keep", 0);
        reordered.order = 7;
        let local = vec![pending_image(&file, 0), reordered];
        let original = vec![remote_image("keep", 0), remote_image("gone", 1)];

        let report = engine.reconcile(&local, &original).await.unwrap();
        assert!(report.success);

        let progress: Vec<(String, SyncPhase)> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::Progress { message, phase, .. } => Some((message.clone(), *phase)),
                _ => None,
            })
            .collect();

        // Each item, then its phase summary, then the terminal event.
        assert_eq!(progress.len(), 7);
        assert_eq!(progress[0].0, "Deleted gone");
        assert_eq!(
            progress[1],
            ("Deleted 1 image(s)".to_string(), SyncPhase::Deleting)
        );
        assert_eq!(progress[2].0, "Uploaded new.jpg");
        assert_eq!(
            progress[3],
            ("Uploaded 1 image(s)".to_string(), SyncPhase::Uploading)
        );
        assert_eq!(progress[4].0, "Updated keep");
        assert_eq!(
            progress[5],
            ("Updated 1 image(s)".to_string(), SyncPhase::Updating)
        );
        assert_eq!(progress[6].1, SyncPhase::Complete);
    }

    #[tokio::test]
    async fn test_file_progress_counts_bytes_across_the_batch() {
        let dir = test_dir("batch_bytes");
        let one = write_photo(&dir, "one.jpg", 1000);
        let two = write_photo(&dir, "two.jpg", 2000);
        let retake = write_photo(&dir, "retake.jpg", 4000);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let mut reupload = remote_image("img-1", 2);
        reupload.file = Some(retake);
        let local = vec![pending_image(&one, 0), pending_image(&two, 1), reupload];
        let original = vec![remote_image("img-1", 2)];

        let report = engine.reconcile(&local, &original).await.unwrap();
        assert!(report.success);

        // Byte progress is cumulative against the whole batch, re-uploads
        // included, not per file.
        let transfers: Vec<(u64, u64)> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                Event::FileProgress { uploaded, total } => Some((*uploaded, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(transfers, vec![(1000, 7000), (3000, 7000), (7000, 7000)]);
    }

    #[tokio::test]
    async fn test_new_images_lists_only_applied_records() {
        let dir = test_dir("applied_only");
        let one = write_photo(&dir, "one.jpg", 64);
        let two = write_photo(&dir, "two.jpg", 64);
        let three = write_photo(&dir, "three.jpg", 64);

        let store = Arc::new(MockStore {
            rejected_uploads: HashSet::from(["two.jpg".to_string()]),
            ..Default::default()
        });
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![
            pending_image(&one, 0),
            pending_image(&two, 1),
            pending_image(&three, 2),
        ];
        let report = engine.reconcile(&local, &[]).await.unwrap();

        assert!(!report.success);
        // The permanently failed middle item is absent from the applied
        // list but keeps its place in the working set.
        let ids: Vec<Option<&str>> = report.new_images.iter().map(|i| i.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("img-one.jpg"), Some("img-three.jpg")]);
        assert_eq!(report.working_set.len(), 3);
        assert!(report.working_set[1].file.is_some());

        // The sink's terminal event sees the same membership.
        match sink.events().last().unwrap() {
            Event::Complete { success: false, count: 2 } => {}
            other => panic!("unexpected terminal event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_working_set_preserves_local_order() {
        let dir = test_dir("order_preserved");
        let file = write_photo(&dir, "mid.jpg", 16);

        let store = Arc::new(MockStore::default());
        let sink = Arc::new(RecordingSink::default());
        let engine = test_engine(store.clone(), sink.clone(), CancellationToken::new());

        let local = vec![
            remote_image("first", 0),
            pending_image(&file, 1),
            remote_image("last", 2),
        ];
        let original = vec![remote_image("first", 0), remote_image("last", 2)];

        let report = engine.reconcile(&local, &original).await.unwrap();
        assert!(report.success);
        let ids: Vec<Option<&str>> = report.working_set.iter().map(|i| i.id.as_deref()).collect();
        assert_eq!(ids, vec![Some("first"), Some("img-mid.jpg"), Some("last")]);
        // Untouched items are not reported as new.
        let new_ids: Vec<Option<&str>> = report.new_images.iter().map(|i| i.id.as_deref()).collect();
        assert_eq!(new_ids, vec![Some("img-mid.jpg")]);
    }

    #[test]
    fn test_percent_bounds() {
        assert_eq!(percent(0, 0), 100);
        assert_eq!(percent(0, 4), 0);
        assert_eq!(percent(1, 4), 25);
        assert_eq!(percent(4, 4), 99);
        assert_eq!(percent(3, 3), 99);
    }
}
