//! Typed error hierarchy for the Shipwright orchestrator.
//!
//! One enum per subsystem boundary:
//! - `SubmitError` — message router and approval resolution failures
//! - `QueueError` — durable queue failures
//! - `SandboxError` — sandbox lifecycle and exec failures
//! - `EngineError` — AI engine selection and invocation failures
//! - `GitError` — git collaborator failures
//! - `PipelineError` — aggregated per-stage pipeline failures

use thiserror::Error;

/// Errors surfaced to adapters when a message cannot become a job,
/// or when an approval decision cannot be applied.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Project not found: {id}")]
    ProjectNotFound { id: String },

    #[error("Bot not found: {id}")]
    BotNotFound { id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Job {id} is not awaiting approval (status: {status})")]
    NotAwaitingApproval { id: String, status: String },

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the durable job queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),
}

/// Errors from the sandbox manager.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox not found: {id}")]
    NotFound { id: String },

    #[error("Sandbox {id} command timed out after {timeout_secs}s")]
    Timeout { id: String, timeout_secs: u64 },

    #[error("Failed to spawn sandbox process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Sandbox I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors from engine selection and invocation.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Unknown engine type: {name}")]
    Unknown { name: String },

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Engine run failed: {0}")]
    Run(String),
}

/// Errors from the git collaborator.
#[derive(Debug, Error)]
pub enum GitError {
    #[error("git {op} failed: {detail}")]
    CommandFailed { op: String, detail: String },

    #[error("Failed to run git: {0}")]
    Io(#[from] std::io::Error),
}

/// A pipeline stage failure. Converted by the job processor into a
/// persisted `failed` status plus a `task:failed` event; never re-thrown
/// past the worker boundary.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_error_project_not_found_carries_id() {
        let err = SubmitError::ProjectNotFound { id: "demo".into() };
        assert!(err.to_string().contains("demo"));
        assert!(matches!(err, SubmitError::ProjectNotFound { .. }));
    }

    #[test]
    fn submit_error_converts_from_queue_error() {
        let err: SubmitError = QueueError::Unavailable("backing store gone".into()).into();
        match &err {
            SubmitError::Queue(QueueError::Unavailable(msg)) => {
                assert_eq!(msg, "backing store gone");
            }
            _ => panic!("Expected SubmitError::Queue(Unavailable)"),
        }
    }

    #[test]
    fn sandbox_timeout_carries_duration() {
        let err = SandboxError::Timeout {
            id: "sb-1".into(),
            timeout_secs: 1800,
        };
        assert!(err.to_string().contains("1800"));
    }

    #[test]
    fn pipeline_error_converts_from_stage_errors() {
        let git: PipelineError = GitError::CommandFailed {
            op: "clone".into(),
            detail: "remote not found".into(),
        }
        .into();
        assert!(matches!(git, PipelineError::Git(_)));

        let engine: PipelineError = EngineError::Unknown {
            name: "gpt-nonsense".into(),
        }
        .into();
        assert!(matches!(engine, PipelineError::Engine(_)));

        let sandbox: PipelineError = SandboxError::NotFound { id: "x".into() }.into();
        assert!(matches!(sandbox, PipelineError::Sandbox(_)));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&QueueError::Unavailable("x".into()));
        assert_std_error(&SandboxError::NotFound { id: "x".into() });
        assert_std_error(&EngineError::Unknown { name: "x".into() });
        assert_std_error(&GitError::CommandFailed {
            op: "push".into(),
            detail: "x".into(),
        });
    }
}
