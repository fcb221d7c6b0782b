//! Per-job and per-item outcome reporting.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::task::TaskFailure;

/// Final state of one catalog item within a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemStatus {
    /// Blocked by the safety filter before scheduling.
    Filtered {
        /// Filter reason.
        reason: String,
    },
    /// At least one image generated and uploaded.
    Enhanced,
    /// No variant produced an image.
    GenerationFailed,
    /// Images were generated but none could be uploaded.
    UploadFailed,
    /// The job was stopped before this item finished.
    Cancelled,
}

/// Outcome of one catalog item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Item identifier.
    pub item_id: String,
    /// Item title.
    pub title: String,
    /// Final status.
    #[serde(flatten)]
    pub status: ItemStatus,
    /// Variants scheduled.
    pub scheduled_images: usize,
    /// Variants that produced an image.
    pub generated_images: usize,
    /// Images attached to the item.
    pub uploaded_images: usize,
    /// URLs of the attached images.
    pub resource_urls: Vec<String>,
    /// Failures encountered along the way.
    pub errors: Vec<TaskFailure>,
}

impl ItemOutcome {
    /// Outcome for an item that never reached the scheduler.
    pub fn filtered(item_id: impl Into<String>, title: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            title: title.into(),
            status: ItemStatus::Filtered { reason: reason.into() },
            scheduled_images: 0,
            generated_images: 0,
            uploaded_images: 0,
            resource_urls: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// Whether the item ended up with at least one new image.
    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Enhanced
    }
}

/// Summary stored on the job once it completes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReport {
    /// Items returned by the catalog fetch, before skipping enhanced ones.
    pub total_items: usize,
    /// Items considered after skipping already-enhanced ones.
    pub fetched_items: usize,
    /// Items blocked by the safety filter.
    pub filtered_items: usize,
    /// Items expanded into tasks.
    pub scheduled_items: usize,
    /// Items with at least one uploaded image.
    pub succeeded_items: usize,
    /// Scheduled items that ended without a new image.
    pub failed_items: usize,
    /// Tasks scheduled.
    pub total_images: usize,
    /// Tasks that produced an image.
    pub generated_images: usize,
    /// Images attached to items.
    pub uploaded_images: usize,
    /// Wall-clock duration of the job.
    pub elapsed: Duration,
    /// Generated images per minute of wall-clock time.
    pub images_per_minute: f64,
    /// Whether the job was stopped early.
    pub cancelled: bool,
    /// Per-item outcomes in fetch order.
    pub items: Vec<ItemOutcome>,
}

impl JobReport {
    /// Builds the summary counters from per-item outcomes.
    pub fn from_outcomes(
        total_items: usize,
        items: Vec<ItemOutcome>,
        elapsed: Duration,
        cancelled: bool,
    ) -> Self {
        let filtered_items =
            items.iter().filter(|o| matches!(o.status, ItemStatus::Filtered { .. })).count();
        let scheduled_items = items.iter().filter(|o| o.scheduled_images > 0).count();
        let succeeded_items = items.iter().filter(|o| o.is_success()).count();
        let total_images = items.iter().map(|o| o.scheduled_images).sum();
        let generated_images: usize = items.iter().map(|o| o.generated_images).sum();
        let uploaded_images = items.iter().map(|o| o.uploaded_images).sum();
        let minutes = elapsed.as_secs_f64() / 60.0;

        Self {
            total_items,
            fetched_items: items.len(),
            filtered_items,
            scheduled_items,
            succeeded_items,
            failed_items: scheduled_items - succeeded_items,
            total_images,
            generated_images,
            uploaded_images,
            elapsed,
            images_per_minute: if minutes > 0.0 { generated_images as f64 / minutes } else { 0.0 },
            cancelled,
            items,
        }
    }
}
