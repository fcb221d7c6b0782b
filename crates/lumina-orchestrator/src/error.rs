// Error types for job orchestration

use lumina_abstraction::CatalogError;
use thiserror::Error;

use crate::config::ConfigError;
use crate::jobs::JobStatus;

/// Result type for orchestration operations
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestration errors
///
/// Per-task and per-upload failures never surface here; they are recorded on
/// the individual result values. These are job-level or startup failures.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Configuration could not be loaded or is invalid
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Every configured credential failed to initialise
    #[error("No usable credentials: {0}")]
    NoUsableCredentials(String),

    /// Catalog platform call failed at job level (e.g. the initial fetch)
    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Unknown job ID
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Job status change not permitted by the lifecycle
    #[error("Invalid job transition from {from} to {to}")]
    InvalidTransition {
        /// Current status
        from: JobStatus,
        /// Requested status
        to: JobStatus,
    },
}
