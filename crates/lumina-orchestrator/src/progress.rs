//! Progress reporting for running jobs.
//!
//! Events are broadcast to any number of subscribers. Sending never blocks
//! and never fails the job; with no subscribers events are dropped.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::jobs::JobStatus;

/// Major phase of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPhase {
    /// Paging through the catalog.
    Fetching,
    /// Running the safety filter.
    Filtering,
    /// Generating images.
    Generating,
    /// Uploading images.
    Uploading,
    /// Deleting old images and tagging items.
    Finalizing,
}

/// Progress event types.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A job has started.
    JobStarted {
        /// Job ID.
        job_id: String,
    },
    /// A job entered a new phase.
    PhaseChanged {
        /// Job ID.
        job_id: String,
        /// New phase.
        phase: JobPhase,
        /// Units of work in the phase.
        total: usize,
    },
    /// A generation task finished.
    TaskCompleted {
        /// Job ID.
        job_id: String,
        /// Finished tasks so far.
        completed: usize,
        /// Tasks in the batch.
        total: usize,
        /// Task label.
        label: String,
    },
    /// An upload finished.
    UploadCompleted {
        /// Job ID.
        job_id: String,
        /// Finished uploads so far.
        completed: usize,
        /// Uploads in the batch.
        total: usize,
        /// Target item.
        item_id: String,
    },
    /// A job reached a terminal status.
    JobFinished {
        /// Job ID.
        job_id: String,
        /// Final status.
        status: JobStatus,
    },
}

/// Broadcasts [`ProgressEvent`]s.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    broadcast_tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressReporter {
    /// Creates a reporter buffering up to `capacity` events per subscriber.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));
        Self { broadcast_tx }
    }

    /// Subscribes to progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Broadcasts an event.
    pub fn emit(&self, event: ProgressEvent) {
        debug!("Progress event: {:?}", event);
        let _ = self.broadcast_tx.send(event);
    }
}
