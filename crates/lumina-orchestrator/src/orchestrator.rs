//! Job orchestration: fetch, filter, generate, upload, report.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lumina_abstraction::{CatalogItem, CatalogReader, CatalogWriter, SafetyFilter};
use lumina_models::{HttpReferenceLoader, PatternSafetyFilter};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, LuminaConfig};
use crate::error::{OrchestratorError, Result};
use crate::jobs::{JobHandle, JobRegistry, JobStatus};
use crate::pool::WorkerPool;
use crate::progress::{JobPhase, ProgressEvent, ProgressReporter};
use crate::report::{ItemOutcome, ItemStatus, JobReport};
use crate::retry::RetryPolicy;
use crate::scheduler::{BatchScheduler, ProgressCallback, SchedulerSettings};
use crate::task::{Task, TaskGenerator, TaskResult};
use crate::uploader::{Artifact, ResultUploader, UploadItem, UploadResult, normalize_item_id};
use crate::worker::{GeminiFactory, WorkerStats};

/// Parameters of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    /// Stop fetching once this many candidate items are collected.
    pub max_items: Option<usize>,
    /// Overrides the configured variants per item.
    pub images_per_item: Option<usize>,
    /// Skip items already carrying the enhanced tag.
    pub skip_enhanced: bool,
    /// Catalog page size.
    pub page_size: usize,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self { max_items: None, images_per_item: None, skip_enhanced: true, page_size: 50 }
    }
}

impl JobRequest {
    /// Limits the number of items fetched.
    #[must_use]
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = Some(max_items);
        self
    }

    /// Overrides the variants per item.
    #[must_use]
    pub fn with_images_per_item(mut self, images_per_item: usize) -> Self {
        self.images_per_item = Some(images_per_item);
        self
    }
}

/// Orchestrator behaviour taken from configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    /// Variants per item.
    pub images_per_item: usize,
    /// Tag marking enhanced items.
    pub enhanced_tag: String,
    /// Delete previous images after a successful upload.
    pub delete_existing_images: bool,
    /// How often the stop flag is polled.
    pub stop_poll_interval: Duration,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&LuminaConfig::default())
    }
}

impl OrchestratorSettings {
    /// Settings from a loaded configuration.
    pub fn from_config(config: &LuminaConfig) -> Self {
        Self {
            images_per_item: config.generation.images_per_item,
            enhanced_tag: config.upload.enhanced_tag.clone(),
            delete_existing_images: config.upload.delete_existing_images,
            stop_poll_interval: Duration::from_millis(config.jobs.stop_poll_interval_ms),
        }
    }
}

/// Sequences the phases of a job and owns its lifecycle.
pub struct Orchestrator {
    reader: Arc<dyn CatalogReader>,
    writer: Arc<dyn CatalogWriter>,
    filter: Arc<dyn SafetyFilter>,
    scheduler: BatchScheduler,
    uploader: ResultUploader,
    reporter: ProgressReporter,
    settings: OrchestratorSettings,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("scheduler", &self.scheduler)
            .field("uploader", &self.uploader)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator from its collaborators.
    pub fn new(
        reader: Arc<dyn CatalogReader>,
        writer: Arc<dyn CatalogWriter>,
        filter: Arc<dyn SafetyFilter>,
        scheduler: BatchScheduler,
        uploader: ResultUploader,
        settings: OrchestratorSettings,
    ) -> Self {
        Self {
            reader,
            writer,
            filter,
            scheduler,
            uploader,
            reporter: ProgressReporter::default(),
            settings,
        }
    }

    /// Wires Gemini workers, the HTTP reference loader and the default safety
    /// filter from configuration.
    ///
    /// # Errors
    /// Returns `NoUsableCredentials` if no credential initialises, or
    /// `Config` if the reference loader cannot be built.
    pub fn from_config(
        config: &LuminaConfig,
        reader: Arc<dyn CatalogReader>,
        writer: Arc<dyn CatalogWriter>,
    ) -> Result<Self> {
        let factory = GeminiFactory::new(&config.generation);
        let pool = Arc::new(WorkerPool::from_config(&config.credentials, &config.limits, &factory)?);

        let loader = HttpReferenceLoader::new(config.generation.download_timeout())
            .map_err(|e| ConfigError::InvalidValue(e.to_string()))?;
        let generator =
            TaskGenerator::new(Arc::new(loader)).with_temperature(config.generation.temperature);
        let scheduler = BatchScheduler::new(
            pool,
            Arc::new(generator),
            SchedulerSettings {
                quota_backoff: config.generation.quota_backoff(),
                retry_policy: RetryPolicy::for_generation(&config.generation),
            },
        );
        let uploader = ResultUploader::new(
            Arc::clone(&writer),
            config.upload.max_concurrent,
            RetryPolicy::for_upload(&config.upload),
        );

        Ok(Self::new(
            reader,
            writer,
            Arc::new(PatternSafetyFilter::default()),
            scheduler,
            uploader,
            OrchestratorSettings::from_config(config),
        ))
    }

    /// Replaces the progress reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: ProgressReporter) -> Self {
        self.reporter = reporter;
        self
    }

    /// The progress reporter.
    pub fn reporter(&self) -> &ProgressReporter {
        &self.reporter
    }

    /// Per-credential counters.
    pub fn worker_stats(&self) -> Vec<WorkerStats> {
        self.scheduler.pool().stats()
    }

    /// Registers a job and runs it in the background.
    pub fn spawn(self: &Arc<Self>, registry: &JobRegistry, request: JobRequest) -> Arc<JobHandle> {
        let handle = registry.create();
        let orchestrator = Arc::clone(self);
        let job = Arc::clone(&handle);

        tokio::spawn(async move {
            let inner = {
                let job = Arc::clone(&job);
                tokio::spawn(async move { orchestrator.run(&job, request).await })
            };
            match inner.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => debug!(job_id = %job.id(), error = %e, "Background job ended with error"),
                Err(e) => job.fail(format!("job task aborted: {}", e)),
            }
        });
        handle
    }

    /// Runs a job to completion, updating `handle` as it goes.
    ///
    /// # Errors
    /// Returns the job-level error that marked the job failed.
    pub async fn run(&self, handle: &Arc<JobHandle>, request: JobRequest) -> Result<JobReport> {
        let job_id = handle.id().to_string();
        let started = Instant::now();
        let cancel = CancellationToken::new();

        if handle.status() == JobStatus::Stopping {
            cancel.cancel();
        } else {
            handle.transition(JobStatus::Running)?;
        }
        self.reporter.emit(ProgressEvent::JobStarted { job_id: job_id.clone() });
        info!(job_id = %job_id, max_items = ?request.max_items, "Job started");

        let watcher = self.watch_for_stop(Arc::clone(handle), cancel.clone());
        let outcome = self.execute(handle, &request, &cancel, started).await;
        watcher.abort();

        match outcome {
            Ok(report) => {
                handle.complete(report.clone())?;
                info!(
                    job_id = %job_id,
                    scheduled_items = report.scheduled_items,
                    succeeded_items = report.succeeded_items,
                    filtered_items = report.filtered_items,
                    generated_images = report.generated_images,
                    uploaded_images = report.uploaded_images,
                    images_per_minute = report.images_per_minute,
                    cancelled = report.cancelled,
                    "Job completed"
                );
                self.reporter.emit(ProgressEvent::JobFinished { job_id, status: JobStatus::Completed });
                Ok(report)
            }
            Err(e) => {
                handle.fail(e.to_string());
                self.reporter.emit(ProgressEvent::JobFinished { job_id, status: JobStatus::Failed });
                Err(e)
            }
        }
    }

    /// Polls the job status and fires `cancel` once a stop is requested.
    fn watch_for_stop(&self, handle: Arc<JobHandle>, cancel: CancellationToken) -> JoinHandle<()> {
        let interval = self.settings.stop_poll_interval;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(interval) => {
                        match handle.status() {
                            JobStatus::Stopping => {
                                info!(job_id = %handle.id(), "Stopping job after current units");
                                cancel.cancel();
                                break;
                            }
                            status if status.is_finished() => break,
                            _ => {}
                        }
                    }
                }
            }
        })
    }

    async fn execute(
        &self,
        handle: &Arc<JobHandle>,
        request: &JobRequest,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<JobReport> {
        let job_id = handle.id().to_string();

        // Fetch
        self.enter_phase(handle, JobPhase::Fetching, request.max_items.unwrap_or(0));
        let (total_items, items) = self.fetch_items(request, cancel).await?;

        // Filter
        self.enter_phase(handle, JobPhase::Filtering, items.len());
        let mut blocked: HashMap<String, String> = HashMap::new();
        let mut safe = Vec::with_capacity(items.len());
        for (done, item) in items.iter().enumerate() {
            let verdict = self.filter.check(item);
            if verdict.is_safe {
                safe.push(Arc::new(item.clone()));
            } else {
                warn!(job_id = %job_id, item_id = %item.id, reason = %verdict.reason, "Item filtered");
                blocked.insert(item.id.clone(), verdict.reason);
            }
            handle.record_progress(done + 1, &item.title);
        }
        handle.finish_phase(safe.len(), blocked.len());

        // Generate
        let variants = request.images_per_item.unwrap_or(self.settings.images_per_item).max(1);
        let mut task_results: HashMap<String, Vec<TaskResult>> = HashMap::new();
        let mut scheduled: HashMap<String, usize> = HashMap::new();
        if !cancel.is_cancelled() && !safe.is_empty() {
            let tasks: Vec<Task> =
                safe.iter().flat_map(|item| Task::expand(Arc::clone(item), variants)).collect();
            for task in &tasks {
                if task.variant_index == 0 {
                    debug!(item_id = %task.group_id, category = task.category.label(), "Item categorised");
                }
                *scheduled.entry(task.group_id.clone()).or_default() += 1;
            }

            let capacity = self.scheduler.pool().capacity();
            info!(
                job_id = %job_id,
                items = safe.len(),
                tasks = tasks.len(),
                total_per_window = capacity.total_per_window,
                estimated_secs = capacity.estimated_duration(tasks.len()).as_secs(),
                "Scheduling generation"
            );

            self.enter_phase(handle, JobPhase::Generating, tasks.len());
            let results = self.scheduler.run(tasks, cancel, Some(self.task_callback(handle))).await;
            let succeeded = results.iter().filter(|r| r.is_success()).count();
            handle.finish_phase(succeeded, results.len() - succeeded);

            for result in results {
                task_results.entry(result.group_id.clone()).or_default().push(result);
            }
        }

        // Upload
        let mut upload_results: HashMap<String, Vec<UploadResult>> = HashMap::new();
        let uploads: Vec<UploadItem> =
            safe.iter().flat_map(|item| upload_items(item, task_results.get(&item.id))).collect();
        if !cancel.is_cancelled() && !uploads.is_empty() {
            self.enter_phase(handle, JobPhase::Uploading, uploads.len());
            let results =
                self.uploader.upload_all(uploads, cancel, Some(self.upload_callback(handle))).await;
            let succeeded = results.iter().filter(|r| r.is_success()).count();
            handle.finish_phase(succeeded, results.len() - succeeded);

            for result in results {
                upload_results.entry(result.item_id.clone()).or_default().push(result);
            }
        }

        // Finalize
        let enhanced: Vec<&Arc<CatalogItem>> = safe
            .iter()
            .filter(|item| {
                upload_results.get(&item.id).is_some_and(|r| r.iter().any(UploadResult::is_success))
            })
            .collect();
        if !enhanced.is_empty() {
            self.enter_phase(handle, JobPhase::Finalizing, enhanced.len());
            for (done, item) in enhanced.iter().enumerate() {
                self.finalize_item(item).await;
                handle.record_progress(done + 1, &item.title);
            }
        }

        let cancelled = cancel.is_cancelled();
        let outcomes = items
            .iter()
            .map(|item| match blocked.remove(&item.id) {
                Some(reason) => ItemOutcome::filtered(&item.id, &item.title, reason),
                None => item_outcome(
                    item,
                    scheduled.get(&item.id).copied().unwrap_or(0),
                    task_results.remove(&item.id).unwrap_or_default(),
                    upload_results.remove(&item.id).unwrap_or_default(),
                    cancelled,
                ),
            })
            .collect();

        Ok(JobReport::from_outcomes(total_items, outcomes, started.elapsed(), cancelled))
    }

    /// Pages through the catalog until exhausted, cancelled, or `max_items`
    /// candidates are collected. Returns the number of items seen and the
    /// candidates.
    async fn fetch_items(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<(usize, Vec<CatalogItem>)> {
        let limit = request.max_items.unwrap_or(usize::MAX);
        let mut seen = 0;
        let mut items = Vec::new();
        let mut cursor: Option<String> = None;

        while items.len() < limit && !cancel.is_cancelled() {
            let page_size = request.page_size.clamp(1, limit - items.len());
            let page = self.reader.list_items(cursor.as_deref(), page_size).await.map_err(|e| {
                error!(error = %e, "Catalog fetch failed");
                OrchestratorError::from(e)
            })?;

            for item in page.items {
                if items.len() >= limit {
                    break;
                }
                seen += 1;
                if request.skip_enhanced && item.has_tag(&self.settings.enhanced_tag) {
                    debug!(item_id = %item.id, "Skipping already enhanced item");
                    continue;
                }
                items.push(item);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        info!(seen, candidates = items.len(), "Catalog fetch finished");
        Ok((seen, items))
    }

    /// Deletes previous images and tags the item. Both steps are best-effort.
    async fn finalize_item(&self, item: &CatalogItem) {
        let Ok(item_id) = normalize_item_id(&item.id) else {
            return;
        };

        if self.settings.delete_existing_images && !item.images.is_empty() {
            let ids: Vec<String> = item.images.iter().map(|img| img.id.clone()).collect();
            match self.writer.delete_images(&item_id, &ids).await {
                Ok(()) => debug!(item_id = %item_id, deleted = ids.len(), "Deleted previous images"),
                Err(e) => warn!(item_id = %item_id, error = %e, "Failed to delete previous images"),
            }
        }

        if let Err(e) = self.writer.add_tag(&item_id, &self.settings.enhanced_tag).await {
            warn!(item_id = %item_id, error = %e, "Failed to tag item");
        }
    }

    fn enter_phase(&self, handle: &JobHandle, phase: JobPhase, total: usize) {
        handle.begin_phase(total);
        self.reporter.emit(ProgressEvent::PhaseChanged {
            job_id: handle.id().to_string(),
            phase,
            total,
        });
    }

    fn task_callback(&self, handle: &Arc<JobHandle>) -> ProgressCallback {
        let reporter = self.reporter.clone();
        let job_id = handle.id().to_string();
        let handle = Arc::clone(handle);
        Arc::new(move |completed, total, label: &str| {
            handle.record_progress(completed, label);
            reporter.emit(ProgressEvent::TaskCompleted {
                job_id: job_id.clone(),
                completed,
                total,
                label: label.to_string(),
            });
        })
    }

    fn upload_callback(&self, handle: &Arc<JobHandle>) -> ProgressCallback {
        let reporter = self.reporter.clone();
        let job_id = handle.id().to_string();
        let handle = Arc::clone(handle);
        Arc::new(move |completed, total, item_id: &str| {
            handle.record_progress(completed, item_id);
            reporter.emit(ProgressEvent::UploadCompleted {
                job_id: job_id.clone(),
                completed,
                total,
                item_id: item_id.to_string(),
            });
        })
    }
}

fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/webp" => "webp",
        "image/gif" => "gif",
        _ => "png",
    }
}

/// One upload per successful variant of `item`.
fn upload_items(item: &CatalogItem, results: Option<&Vec<TaskResult>>) -> Vec<UploadItem> {
    let Some(results) = results else {
        return Vec::new();
    };
    results
        .iter()
        .filter_map(|result| {
            let image = result.image.as_ref()?;
            let variant = result.variant_index + 1;
            let artifact = Artifact {
                data: image.data.clone(),
                mime_type: image.mime_type.clone(),
                filename: format!(
                    "{}_ai_{}.{}",
                    item.short_id(),
                    variant,
                    extension_for(&image.mime_type)
                ),
            };
            Some(UploadItem::new(
                &item.id,
                artifact,
                format!("{} - AI enhanced product photo {}", item.title, variant),
            ))
        })
        .collect()
}

fn item_outcome(
    item: &CatalogItem,
    scheduled_images: usize,
    tasks: Vec<TaskResult>,
    uploads: Vec<UploadResult>,
    cancelled: bool,
) -> ItemOutcome {
    let finished_tasks = tasks.len();
    let generated_images = tasks.iter().filter(|r| r.is_success()).count();
    let unfinished = scheduled_images == 0
        || finished_tasks < scheduled_images
        || uploads.len() < generated_images;
    let resource_urls: Vec<String> =
        uploads.iter().filter_map(|u| u.resource_url.clone()).collect();
    let errors = tasks
        .into_iter()
        .filter_map(|r| r.failure)
        .chain(uploads.into_iter().filter_map(|u| u.failure))
        .collect();

    let status = if !resource_urls.is_empty() {
        ItemStatus::Enhanced
    } else if cancelled && unfinished {
        ItemStatus::Cancelled
    } else if generated_images == 0 {
        ItemStatus::GenerationFailed
    } else {
        ItemStatus::UploadFailed
    };

    ItemOutcome {
        item_id: item.id.clone(),
        title: item.title.clone(),
        status,
        scheduled_images,
        generated_images,
        uploaded_images: resource_urls.len(),
        resource_urls,
        errors,
    }
}
