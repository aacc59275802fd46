use crate::analyzer::Violation;
use crate::job::JobState;
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SandboxError>;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Content blocked by validator ({})", .0.code())]
    ValidationRejected(Violation),

    #[error("Sandbox image build failed: {0}")]
    ImageBuildFailure(String),

    #[error("Job failed (exit code {exit_code:?})")]
    JobFailed { exit_code: Option<i64> },

    #[error("Job exceeded its wall-clock timeout")]
    JobTimedOut,

    #[error("Job produced no artifact (terminal state {terminal_state:?})")]
    NoArtifact { terminal_state: JobState },

    #[error("Workspace error: {0}")]
    Workspace(#[source] std::io::Error),

    #[error("Container engine not installed or not found in PATH")]
    EngineNotFound,

    #[error("Container engine error: {0}")]
    Engine(String),

    #[error("Invalid job state transition {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Caller-visible class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Rejected,
    Failed,
}

impl SandboxError {
    pub fn outcome(&self) -> Outcome {
        match self {
            SandboxError::ValidationRejected(_) => Outcome::Rejected,
            _ => Outcome::Failed,
        }
    }

    /// Short stable reason code for the front end.
    pub fn reason_code(&self) -> &'static str {
        match self {
            SandboxError::ValidationRejected(v) => v.code(),
            SandboxError::ImageBuildFailure(_) => "image_build_failure",
            SandboxError::JobFailed { .. } => "job_failed",
            SandboxError::JobTimedOut => "job_timed_out",
            SandboxError::NoArtifact { .. } => "no_artifact",
            SandboxError::Workspace(_) => "workspace_error",
            SandboxError::EngineNotFound | SandboxError::Engine(_) => "engine_unavailable",
            SandboxError::InvalidTransition { .. }
            | SandboxError::IoError(_)
            | SandboxError::JsonError(_)
            | SandboxError::InternalError(_) => "internal_error",
        }
    }

    /// Message safe to hand to an untrusted caller: no code, paths or stderr.
    pub fn public_message(&self) -> &'static str {
        match self {
            SandboxError::ValidationRejected(_) => {
                "The generated code was blocked by the safety validator."
            }
            SandboxError::ImageBuildFailure(_)
            | SandboxError::EngineNotFound
            | SandboxError::Engine(_) => "The plotting sandbox is currently unavailable.",
            SandboxError::JobTimedOut => "Plot generation took too long and was stopped.",
            SandboxError::JobFailed { .. } | SandboxError::NoArtifact { .. } => {
                "The generated code failed to produce a plot."
            }
            _ => "An internal error occurred while generating the plot.",
        }
    }

    /// Environment-configuration faults, as opposed to per-job failures.
    pub fn is_service_fault(&self) -> bool {
        matches!(
            self,
            SandboxError::ImageBuildFailure(_)
                | SandboxError::EngineNotFound
                | SandboxError::Engine(_)
        )
    }
}
