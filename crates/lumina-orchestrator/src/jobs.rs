//! Job lifecycle and registry.
//!
//! A [`JobRegistry`] is owned by whoever runs jobs and is passed around
//! explicitly. Each job is a [`JobHandle`] that the orchestrator mutates and
//! external callers poll; [`JobHandle::request_stop`] is the only write
//! callers need.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{OrchestratorError, Result};
use crate::report::JobReport;

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet started.
    Pending,
    /// Fetching, generating or uploading.
    Running,
    /// Stop requested; in-flight units are draining.
    Stopping,
    /// Finished, possibly early after a stop.
    Completed,
    /// Aborted by a job-level error.
    Failed,
}

impl JobStatus {
    /// Checks if the job can transition to the given status.
    #[must_use]
    #[allow(clippy::match_same_arms)] // Each arm represents a distinct transition rule
    pub fn can_transition_to(&self, to: Self) -> bool {
        match (self, to) {
            // From Pending: start, or stop/fail before starting
            (Self::Pending, Self::Running | Self::Stopping | Self::Failed) => true,
            // From Running: stop, finish or fail
            (Self::Running, Self::Stopping | Self::Completed | Self::Failed) => true,
            // From Stopping: drain to a terminal status
            (Self::Stopping, Self::Completed | Self::Failed) => true,
            // Same status is always valid
            (a, b) if *a == b => true,
            // Terminal statuses are final
            _ => false,
        }
    }

    /// Whether the job has reached a terminal status.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Pollable state of one job.
#[derive(Debug, Clone, Serialize)]
pub struct JobState {
    /// Job identifier.
    pub id: String,
    /// Current status.
    pub status: JobStatus,
    /// Units of work in the current phase.
    pub total: usize,
    /// Units finished in the current phase.
    pub completed: usize,
    /// Finished units that succeeded.
    pub succeeded: usize,
    /// Finished units that failed.
    pub failed: usize,
    /// Label of the most recently finished unit.
    pub current_label: Option<String>,
    /// When the job was accepted.
    pub created_at: DateTime<Utc>,
    /// When the job started running.
    pub started_at: Option<DateTime<Utc>>,
    /// When the current phase began.
    pub phase_started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// Units per minute, computed at finish.
    pub throughput: Option<f64>,
    /// Raw job-level error message when failed.
    pub error: Option<String>,
    /// Final report when completed.
    pub report: Option<JobReport>,
}

impl JobState {
    fn new(id: String) -> Self {
        Self {
            id,
            status: JobStatus::Pending,
            total: 0,
            completed: 0,
            succeeded: 0,
            failed: 0,
            current_label: None,
            created_at: Utc::now(),
            started_at: None,
            phase_started_at: None,
            finished_at: None,
            throughput: None,
            error: None,
            report: None,
        }
    }

    /// Estimated time remaining in the current phase, from the time spent in
    /// it and its completed units.
    pub fn eta(&self) -> Option<Duration> {
        self.eta_at(Utc::now())
    }

    /// ETA relative to `now`.
    pub fn eta_at(&self, now: DateTime<Utc>) -> Option<Duration> {
        if self.status.is_finished() || self.completed == 0 || self.total < self.completed {
            return None;
        }
        let since = self.phase_started_at.or(self.started_at)?;
        let elapsed = (now - since).to_std().ok()?;
        let per_unit = elapsed.div_f64(self.completed as f64);
        Some(per_unit.mul_f64((self.total - self.completed) as f64))
    }

    /// Percentage of units completed in the current phase.
    pub fn progress_percent(&self) -> f64 {
        if self.total == 0 { 0.0 } else { self.completed as f64 * 100.0 / self.total as f64 }
    }
}

/// Shared handle to one job's state.
#[derive(Debug)]
pub struct JobHandle {
    id: String,
    state: RwLock<JobState>,
}

impl JobHandle {
    fn new(id: String) -> Self {
        Self { state: RwLock::new(JobState::new(id.clone())), id }
    }

    /// Job identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> JobState {
        self.state.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current status.
    pub fn status(&self) -> JobStatus {
        self.state.read().unwrap_or_else(PoisonError::into_inner).status
    }

    /// Moves the job to `to`, stamping start/finish times.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the lifecycle forbids the change.
    pub fn transition(&self, to: JobStatus) -> Result<JobStatus> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let from = state.status;
        if !from.can_transition_to(to) {
            error!(job_id = %self.id, from = %from, to = %to, "Invalid job transition");
            return Err(OrchestratorError::InvalidTransition { from, to });
        }

        let now = Utc::now();
        if to == JobStatus::Running && state.started_at.is_none() {
            state.started_at = Some(now);
        }
        if to.is_finished() && state.finished_at.is_none() {
            state.finished_at = Some(now);
            if let Some(started) = state.started_at {
                let minutes = (now - started).num_milliseconds() as f64 / 60_000.0;
                if minutes > 0.0 {
                    state.throughput = Some(state.completed as f64 / minutes);
                }
            }
        }
        state.status = to;
        debug!(job_id = %self.id, from = %from, to = %to, "Job transition");
        Ok(from)
    }

    /// Requests a cooperative stop. Returns `false` if the job already finished.
    pub fn request_stop(&self) -> bool {
        let status = self.status();
        if status.is_finished() {
            return false;
        }
        if self.transition(JobStatus::Stopping).is_ok() {
            info!(job_id = %self.id, "Stop requested");
        }
        true
    }

    /// Starts a new phase with `total` units.
    pub fn begin_phase(&self, total: usize) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.total = total;
        state.phase_started_at = Some(Utc::now());
        state.completed = 0;
        state.succeeded = 0;
        state.failed = 0;
        state.current_label = None;
    }

    /// Records progress reported by a batch runner.
    pub fn record_progress(&self, completed: usize, label: &str) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.completed = state.completed.max(completed);
        state.current_label = Some(label.to_string());
    }

    /// Records the success split once a phase's results are in.
    pub fn finish_phase(&self, succeeded: usize, failed: usize) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.succeeded = succeeded;
        state.failed = failed;
    }

    /// Marks the job completed with its report.
    ///
    /// # Errors
    /// Returns `InvalidTransition` if the job already finished.
    pub fn complete(&self, report: JobReport) -> Result<()> {
        self.transition(JobStatus::Completed)?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.throughput = Some(report.images_per_minute);
        state.report = Some(report);
        Ok(())
    }

    /// Marks the job failed with a raw error message.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        if self.transition(JobStatus::Failed).is_ok() {
            error!(job_id = %self.id, error = %message, "Job failed");
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.error = Some(message);
        }
    }
}

/// Owner of all known jobs with bounded retention.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: RwLock<HashMap<String, Arc<JobHandle>>>,
    ttl: Duration,
    max_retained: usize,
}

impl JobRegistry {
    /// Creates a registry retaining finished jobs for `ttl`, and at most
    /// `max_retained` of them.
    pub fn new(ttl: Duration, max_retained: usize) -> Self {
        Self { jobs: RwLock::new(HashMap::new()), ttl, max_retained }
    }

    /// Registry configured from the `[jobs]` section.
    pub fn from_config(config: &crate::config::JobsConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.max_retained)
    }

    /// Registers a new pending job.
    pub fn create(&self) -> Arc<JobHandle> {
        self.evict();
        let id = uuid::Uuid::new_v4().to_string();
        let handle = Arc::new(JobHandle::new(id.clone()));
        self.jobs.write().unwrap_or_else(PoisonError::into_inner).insert(id, Arc::clone(&handle));
        debug!(job_id = %handle.id(), "Job registered");
        handle
    }

    /// Looks up a job.
    ///
    /// # Errors
    /// Returns `JobNotFound` for unknown or evicted IDs.
    pub fn get(&self, id: &str) -> Result<Arc<JobHandle>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::JobNotFound(id.to_string()))
    }

    /// Polls a job's state.
    ///
    /// # Errors
    /// Returns `JobNotFound` for unknown or evicted IDs.
    pub fn status(&self, id: &str) -> Result<JobState> {
        Ok(self.get(id)?.snapshot())
    }

    /// Requests a cooperative stop.
    ///
    /// # Errors
    /// Returns `JobNotFound` for unknown or evicted IDs.
    pub fn request_stop(&self, id: &str) -> Result<bool> {
        Ok(self.get(id)?.request_stop())
    }

    /// Snapshots of every retained job.
    pub fn list(&self) -> Vec<JobState> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut states: Vec<JobState> = jobs.values().map(|h| h.snapshot()).collect();
        states.sort_by_key(|s| s.created_at);
        states
    }

    /// Discards a job regardless of status.
    pub fn remove(&self, id: &str) -> Option<Arc<JobHandle>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner).remove(id)
    }

    /// Number of retained jobs.
    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Whether no jobs are retained.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Evicts expired and excess finished jobs; returns how many were removed.
    pub fn evict(&self) -> usize {
        self.evict_at(Utc::now())
    }

    /// Eviction relative to `now`. Unfinished jobs are never evicted.
    pub fn evict_at(&self, now: DateTime<Utc>) -> usize {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        let ttl = chrono::Duration::from_std(self.ttl)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        jobs.retain(|_, handle| {
            let state = handle.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.finished_at {
                Some(finished) if state.status.is_finished() => now - finished < ttl,
                _ => true,
            }
        });

        let mut finished: Vec<(DateTime<Utc>, String)> = jobs
            .iter()
            .filter_map(|(id, handle)| {
                let state = handle.state.read().unwrap_or_else(PoisonError::into_inner);
                state.finished_at.filter(|_| state.status.is_finished()).map(|at| (at, id.clone()))
            })
            .collect();
        if finished.len() > self.max_retained {
            finished.sort();
            let excess = finished.len() - self.max_retained;
            for (_, id) in finished.into_iter().take(excess) {
                jobs.remove(&id);
            }
        }

        let evicted = before - jobs.len();
        if evicted > 0 {
            debug!(evicted, retained = jobs.len(), "Evicted finished jobs");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(Duration::from_secs(60), 2)
    }

    #[test]
    fn test_lifecycle_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Stopping));
        assert!(JobStatus::Stopping.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Stopping.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn test_transition_stamps_times() {
        let handle = registry().create();
        assert_eq!(handle.status(), JobStatus::Pending);

        handle.transition(JobStatus::Running).unwrap();
        assert!(handle.snapshot().started_at.is_some());

        handle.fail("catalog unreachable");
        let state = handle.snapshot();
        assert_eq!(state.status, JobStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("catalog unreachable"));
        assert!(state.finished_at.is_some());

        let err = handle.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::InvalidTransition { from: JobStatus::Failed, to: JobStatus::Running }
        ));
    }

    #[test]
    fn test_request_stop() {
        let registry = registry();
        let handle = registry.create();
        handle.transition(JobStatus::Running).unwrap();

        assert!(registry.request_stop(handle.id()).unwrap());
        assert_eq!(handle.status(), JobStatus::Stopping);

        handle.transition(JobStatus::Completed).unwrap();
        assert!(!handle.request_stop());
        assert!(matches!(registry.request_stop("missing"), Err(OrchestratorError::JobNotFound(_))));
    }

    #[test]
    fn test_progress_and_eta() {
        let handle = registry().create();
        handle.transition(JobStatus::Running).unwrap();
        handle.begin_phase(4);
        handle.record_progress(1, "Mug (variant 1)");
        handle.record_progress(0, "late callback");
        handle.finish_phase(1, 0);

        let mut state = handle.snapshot();
        assert_eq!(state.completed, 1);
        assert_eq!(state.succeeded, 1);
        assert_eq!(state.current_label.as_deref(), Some("late callback"));
        assert!((state.progress_percent() - 25.0).abs() < f64::EPSILON);

        let started = Utc::now() - chrono::Duration::seconds(10);
        state.started_at = Some(started);
        state.phase_started_at = Some(started);
        let eta = state.eta_at(started + chrono::Duration::seconds(10)).unwrap();
        assert_eq!(eta, Duration::from_secs(30));
    }

    #[test]
    fn test_eta_counts_only_the_current_phase() {
        let handle = registry().create();
        handle.transition(JobStatus::Running).unwrap();
        handle.begin_phase(8);
        handle.record_progress(8, "generation done");
        handle.begin_phase(8);
        assert!(handle.snapshot().phase_started_at.is_some());
        handle.record_progress(1, "gid://shopify/Product/1");

        // Ten minutes of generation, then one upload one second into the upload phase.
        let now = Utc::now();
        let mut state = handle.snapshot();
        state.started_at = Some(now - chrono::Duration::seconds(601));
        state.phase_started_at = Some(now - chrono::Duration::seconds(1));

        let eta = state.eta_at(now).unwrap();
        assert_eq!(eta, Duration::from_secs(7));
    }

    #[test]
    fn test_eviction_by_ttl_and_capacity() {
        let registry = registry();
        let running = registry.create();
        running.transition(JobStatus::Running).unwrap();

        let mut finished = Vec::new();
        for _ in 0..3 {
            let handle = registry.create();
            handle.transition(JobStatus::Running).unwrap();
            handle.transition(JobStatus::Completed).unwrap();
            finished.push(handle);
        }
        assert_eq!(registry.len(), 4);

        // Capacity: one finished job goes, the running job stays.
        assert_eq!(registry.evict_at(Utc::now()), 1);
        assert_eq!(finished.iter().filter(|h| registry.get(h.id()).is_ok()).count(), 2);
        assert!(registry.get(running.id()).is_ok());

        // TTL: everything finished expires, the running job stays.
        let later = Utc::now() + chrono::Duration::seconds(120);
        assert_eq!(registry.evict_at(later), 2);
        assert_eq!(registry.len(), 1);
        assert!(registry.get(running.id()).is_ok());
    }
}
