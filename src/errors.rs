//! Typed error hierarchy for the pipeline engine.
//!
//! - `AgentError` (re-exported from `botarmy-common`): what an adapter
//!   attempt can fail with. Never escapes the stage executor; it is always
//!   classified into a stage result first.
//! - `PipelineError`: failures of the control surface (start, resume,
//!   cancel, resolve) that callers are expected to match on.

use botarmy_common::{ProjectId, ProjectStatus, RequestId, Stage};
use thiserror::Error;

pub use botarmy_common::AgentError;

/// Errors returned by orchestrator and intervention operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Project {id} not found")]
    ProjectNotFound { id: ProjectId },

    #[error("Intervention request {id} not found")]
    InterventionNotFound { id: RequestId },

    #[error("Cannot {action} project {id} while it is {status}")]
    InvalidTransition {
        id: ProjectId,
        status: ProjectStatus,
        action: &'static str,
    },

    #[error("Project {project_id} already has pending intervention {request_id}")]
    InterventionAlreadyPending {
        project_id: ProjectId,
        request_id: RequestId,
    },

    #[error("Intervention request {id} was already resolved")]
    InterventionAlreadyResolved { id: RequestId },

    #[error("Invalid choice '{choice}'; expected one of: {}", options.join(", "))]
    InvalidChoice {
        choice: String,
        options: Vec<String>,
    },

    #[error("No agent adapter registered for stage {stage}")]
    NoAdapter { stage: Stage },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    /// Errors caused by the caller's request rather than the engine.
    pub fn is_rejection(&self) -> bool {
        !matches!(self, PipelineError::Other(_) | PipelineError::NoAdapter { .. })
    }
}
