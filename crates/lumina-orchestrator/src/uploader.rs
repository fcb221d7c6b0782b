//! Staged upload of generated artifacts to the catalog.
//!
//! Each upload runs the platform's three-call protocol: create a staging
//! target, transfer the bytes, commit the staged resource against the item.
//! The whole sequence is retried with exponential backoff, rotating through
//! the item's alternate artifacts on every retry. Nothing is rolled back; an
//! abandoned staged resource is left for the platform to collect.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use lumina_abstraction::{CatalogError, CatalogWriter};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::retry::RetryPolicy;
use crate::scheduler::ProgressCallback;
use crate::task::{FailureKind, TaskFailure};

const PRODUCT_GID_PREFIX: &str = "gid://shopify/Product/";

/// Converts a bare numeric id to the platform's global-id form.
///
/// # Errors
/// Returns `CatalogError::InvalidId` for anything that is neither a numeric
/// id nor an already-normalised global id.
pub fn normalize_item_id(raw: &str) -> Result<String, CatalogError> {
    let raw = raw.trim();
    let digits = raw.strip_prefix(PRODUCT_GID_PREFIX).unwrap_or(raw);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CatalogError::InvalidId(raw.to_string()));
    }
    Ok(format!("{}{}", PRODUCT_GID_PREFIX, digits))
}

/// Bytes to upload together with their metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Payload.
    pub data: Bytes,
    /// Media type.
    pub mime_type: String,
    /// Filename presented to the platform.
    pub filename: String,
}

/// One artifact destined for one catalog item.
#[derive(Debug, Clone)]
pub struct UploadItem {
    /// Target item identifier.
    pub item_id: String,
    /// Artifact tried first.
    pub artifact: Artifact,
    /// Artifacts rotated in on retries.
    pub alternates: Vec<Artifact>,
    /// Alt text attached on commit.
    pub alt_text: String,
}

impl UploadItem {
    /// Creates an upload with no alternates.
    pub fn new(item_id: impl Into<String>, artifact: Artifact, alt_text: impl Into<String>) -> Self {
        Self { item_id: item_id.into(), artifact, alternates: Vec::new(), alt_text: alt_text.into() }
    }

    /// Adds an artifact to rotate to on retry.
    #[must_use]
    pub fn with_alternate(mut self, artifact: Artifact) -> Self {
        self.alternates.push(artifact);
        self
    }

    /// Artifact used on `attempt` (zero-based).
    fn artifact_for(&self, attempt: u32) -> &Artifact {
        let pool = self.alternates.len() + 1;
        match attempt as usize % pool {
            0 => &self.artifact,
            n => &self.alternates[n - 1],
        }
    }
}

/// Outcome of one upload. Exactly one of `resource_url` and `failure` is set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadResult {
    /// Target item identifier, as given.
    pub item_id: String,
    /// Filename of the artifact used on the final attempt.
    pub filename: String,
    /// URL of the attached resource on success.
    pub resource_url: Option<String>,
    /// Failure of the final attempt.
    pub failure: Option<TaskFailure>,
    /// Attempts made.
    pub attempts: u32,
    /// Distinct artifacts tried.
    pub artifacts_tried: usize,
}

impl UploadResult {
    /// Whether the artifact was attached.
    pub fn is_success(&self) -> bool {
        self.resource_url.is_some()
    }
}

/// Bounded-concurrency runner for staged uploads.
#[derive(Clone)]
pub struct ResultUploader {
    writer: Arc<dyn CatalogWriter>,
    max_concurrent: usize,
    retry_policy: RetryPolicy,
}

impl std::fmt::Debug for ResultUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultUploader")
            .field("max_concurrent", &self.max_concurrent)
            .field("retry_policy", &self.retry_policy)
            .finish_non_exhaustive()
    }
}

impl ResultUploader {
    /// Create a new uploader.
    pub fn new(writer: Arc<dyn CatalogWriter>, max_concurrent: usize, retry_policy: RetryPolicy) -> Self {
        Self { writer, max_concurrent: max_concurrent.max(1), retry_policy }
    }

    /// Uploads every item and returns results in input order.
    ///
    /// Items not started when `cancel` fires produce no result.
    pub async fn upload_all(
        &self,
        items: Vec<UploadItem>,
        cancel: &CancellationToken,
        on_progress: Option<ProgressCallback>,
    ) -> Vec<UploadResult> {
        let total = items.len();
        if total == 0 {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let completed = Arc::new(AtomicUsize::new(0));
        info!(total_uploads = total, concurrency = self.max_concurrent, "Starting upload batch");

        let mut handles = Vec::with_capacity(total);
        for (index, item) in items.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let completed = Arc::clone(&completed);
            let on_progress = on_progress.clone();
            let cancel = cancel.clone();
            let uploader = self.clone();
            let fallback = UploadResult {
                item_id: item.item_id.clone(),
                filename: item.artifact.filename.clone(),
                resource_url: None,
                failure: Some(TaskFailure::new(FailureKind::Internal, "upload panicked")),
                attempts: 0,
                artifacts_tried: 0,
            };

            let handle = tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return None;
                };
                if cancel.is_cancelled() {
                    return None;
                }

                let result = uploader.upload_one(&item).await;
                let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &on_progress {
                    cb(done, total, &item.item_id);
                }
                Some(result)
            });
            handles.push((index, fallback, handle));
        }

        let mut results = Vec::with_capacity(total);
        for (index, fallback, handle) in handles {
            match handle.await {
                Ok(Some(result)) => results.push((index, result)),
                Ok(None) => {}
                Err(e) => {
                    error!(item_id = %fallback.item_id, "Upload join error: {}", e);
                    results.push((index, fallback));
                }
            }
        }
        results.sort_by_key(|(index, _)| *index);

        let succeeded = results.iter().filter(|(_, r)| r.is_success()).count();
        info!(
            total_uploads = total,
            succeeded,
            failed = results.len() - succeeded,
            "Upload batch completed"
        );
        results.into_iter().map(|(_, result)| result).collect()
    }

    /// Uploads one item, retrying the full sequence on failure.
    pub async fn upload_one(&self, item: &UploadItem) -> UploadResult {
        let mut result = UploadResult {
            item_id: item.item_id.clone(),
            filename: item.artifact.filename.clone(),
            resource_url: None,
            failure: None,
            attempts: 0,
            artifacts_tried: 0,
        };

        let target_id = match normalize_item_id(&item.item_id) {
            Ok(id) => id,
            Err(e) => {
                warn!(item_id = %item.item_id, error = %e, "Upload rejected");
                result.failure = Some(TaskFailure::new(FailureKind::Permanent, e.to_string()));
                return result;
            }
        };

        let mut tried: Vec<&str> = Vec::new();
        for attempt in 0..self.retry_policy.max_attempts() {
            if attempt > 0 {
                let delay = self.retry_policy.calculate_delay(attempt - 1);
                debug!(
                    item_id = %item.item_id,
                    retry_count = attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying upload after backoff"
                );
                tokio::time::sleep(delay).await;
            }

            let artifact = item.artifact_for(attempt);
            if !tried.contains(&artifact.filename.as_str()) {
                tried.push(&artifact.filename);
            }
            result.attempts = attempt + 1;
            result.artifacts_tried = tried.len();
            result.filename = artifact.filename.clone();

            match self.staged_upload(&target_id, artifact, &item.alt_text).await {
                Ok(url) => {
                    debug!(item_id = %item.item_id, attempt = attempt + 1, url = %url, "Upload committed");
                    result.resource_url = Some(url);
                    result.failure = None;
                    return result;
                }
                Err(failure) => {
                    warn!(
                        item_id = %item.item_id,
                        attempt = attempt + 1,
                        filename = %artifact.filename,
                        error = %failure,
                        "Upload attempt failed"
                    );
                    result.failure = Some(failure);
                }
            }
        }
        result
    }

    /// Stage, transfer, commit.
    async fn staged_upload(
        &self,
        item_id: &str,
        artifact: &Artifact,
        alt_text: &str,
    ) -> Result<String, TaskFailure> {
        let target = self
            .writer
            .create_staged_upload(&artifact.filename, &artifact.mime_type)
            .await
            .map_err(|e| TaskFailure::new(FailureKind::Stage, format!("stage failed: {}", e)))?;

        self.writer
            .transfer(&target, &artifact.data, &artifact.mime_type, &artifact.filename)
            .await
            .map_err(|e| TaskFailure::new(FailureKind::Transfer, format!("transfer failed: {}", e)))?;

        self.writer
            .commit(item_id, &target.resource_url, alt_text)
            .await
            .map_err(|e| TaskFailure::new(FailureKind::Commit, format!("commit failed: {}", e)))
    }
}
