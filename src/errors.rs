//! Typed error hierarchy for the orc phase execution core.
//!
//! Three top-level enums cover the three subsystems:
//! - `ResolveError` — layered configuration resolution failures
//! - `PhaseError` — per-phase execution failures
//! - `DriverError` — task-level orchestration failures
//!
//! Retryability is a property of the error, not of the call site:
//! [`PhaseError::is_retryable`] tells the driver whether a back-jump is
//! worth attempting. Configuration and prompt-build failures are never
//! retried because re-running the same phase cannot fix them.

use thiserror::Error;

use crate::extract::SpecExtractionError;

/// Errors from the layered configuration resolver.
#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("Agent '{name}' not found in project settings")]
    AgentNotFound { name: String },

    #[error("Failed to read project settings at {path}: {source}")]
    SettingsUnreadable {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse project settings at {path}: {source}")]
    SettingsInvalid {
        path: std::path::PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Skill '{name}' not found at {path}")]
    SkillMissing {
        name: String,
        path: std::path::PathBuf,
    },

    #[error("Failed to read skill '{name}': {source}")]
    SkillUnreadable {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a single phase execution.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error("No prompt template for phase '{phase}' and no inline prompt on the plan")]
    PromptBuild { phase: String },

    #[error("Agent invocation failed: {message}")]
    AgentInvocation { message: String },

    #[error("Agent invocation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("phase blocked: needs clarification")]
    Blocked { detail: String },

    #[error("max iterations ({max}) reached without completion")]
    MaxIterations { max: u32 },

    #[error(transparent)]
    Extraction(#[from] SpecExtractionError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}

impl PhaseError {
    /// Whether the driver may attempt a retry back-jump for this failure.
    ///
    /// Agent failures, timeouts, blockage, iteration exhaustion and
    /// extraction failures can all be fixed by re-running earlier phases
    /// with more context. Resolution and prompt-build failures cannot.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PhaseError::AgentInvocation { .. }
                | PhaseError::Timeout { .. }
                | PhaseError::Blocked { .. }
                | PhaseError::MaxIterations { .. }
                | PhaseError::Extraction(_)
        )
    }
}

/// Errors from the task driver.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("Phase '{phase}' failed: {source}")]
    Phase {
        phase: String,
        #[source]
        source: PhaseError,
    },

    #[error("Retry budget exhausted for phase '{phase}' after {attempts} attempts")]
    RetryExhausted { phase: String, attempts: u32 },

    #[error("Task '{task_id}' interrupted")]
    Interrupted { task_id: String },

    #[error("Initiative backend missing for initiative '{initiative_id}'")]
    InitiativeNotFound { initiative_id: String },

    #[error(transparent)]
    Infra(#[from] anyhow::Error),
}
