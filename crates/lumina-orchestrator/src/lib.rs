//! Lumina orchestration core.
//!
//! This crate drives bulk product-photo generation across several provider
//! credentials with different quotas, then pushes the results back to the
//! catalog.
//!
//! # Components
//!
//! - [`limiter::CredentialRateLimiter`]: minimum-interval gate per credential
//! - [`worker::Worker`]: credential + limiter + generation client
//! - [`pool::WorkerPool`]: round-robin exclusive checkout of workers
//! - [`task::TaskGenerator`]: turns a task into a self-contained request
//! - [`scheduler::BatchScheduler`]: bounded-concurrency generation runner
//! - [`uploader::ResultUploader`]: staged uploads with retry and rotation
//! - [`orchestrator::Orchestrator`]: fetch → filter → generate → upload → report
//! - [`jobs::JobRegistry`]: pollable job state with bounded retention

pub mod config;
pub mod error;
pub mod jobs;
pub mod limiter;
pub mod logging;
pub mod orchestrator;
pub mod pool;
pub mod progress;
pub mod report;
pub mod retry;
pub mod scheduler;
pub mod task;
pub mod uploader;
pub mod worker;

pub use config::{ConfigError, CredentialConfig, LuminaConfig, QuotaTier};
pub use error::{OrchestratorError, Result};
pub use jobs::{JobHandle, JobRegistry, JobState, JobStatus};
pub use limiter::CredentialRateLimiter;
pub use orchestrator::{JobRequest, Orchestrator, OrchestratorSettings};
pub use pool::{PoolCapacity, WorkerLease, WorkerPool};
pub use progress::{JobPhase, ProgressEvent, ProgressReporter};
pub use report::{ItemOutcome, ItemStatus, JobReport};
pub use retry::RetryPolicy;
pub use scheduler::{BatchScheduler, ProgressCallback, SchedulerSettings};
pub use task::{FailureKind, Task, TaskFailure, TaskGenerator, TaskResult};
pub use uploader::{Artifact, ResultUploader, UploadItem, UploadResult, normalize_item_id};
pub use worker::{Credential, GeminiFactory, GeneratorFactory, Worker, WorkerStats};
