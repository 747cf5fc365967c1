//! Resolution of jobs parked at the approval gate.
//!
//! Approving releases the job to `completed`; rejecting fails it. Either
//! way the terminal event fires here, since the pipeline already finished
//! its work before parking.

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::db::{DbHandle, JobArtifacts};
use crate::errors::SubmitError;
use crate::events::{EventDispatcher, TaskEvent};
use crate::models::{Job, JobStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

impl FromStr for ApprovalDecision {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ApprovalDecision::Approve),
            "reject" => Ok(ApprovalDecision::Reject),
            other => Err(format!("Unknown approval decision: {}", other)),
        }
    }
}

pub struct ApprovalService {
    db: DbHandle,
    dispatcher: Arc<EventDispatcher>,
}

impl ApprovalService {
    pub fn new(db: DbHandle, dispatcher: Arc<EventDispatcher>) -> Self {
        Self { db, dispatcher }
    }

    pub async fn resolve(
        &self,
        job_id: &str,
        decision: ApprovalDecision,
    ) -> Result<Job, SubmitError> {
        let id = job_id.to_string();
        let job = self
            .db
            .call(move |db| db.get_job(&id))
            .await?
            .ok_or_else(|| SubmitError::JobNotFound {
                id: job_id.to_string(),
            })?;

        if job.status != JobStatus::AwaitingApproval {
            return Err(SubmitError::NotAwaitingApproval {
                id: job.id,
                status: job.status.as_str().to_string(),
            });
        }

        let (status, artifacts) = match decision {
            ApprovalDecision::Approve => (JobStatus::Completed, JobArtifacts::default()),
            ApprovalDecision::Reject => (
                JobStatus::Failed,
                JobArtifacts {
                    error: Some("Rejected by approver".to_string()),
                    ..Default::default()
                },
            ),
        };

        let id = job_id.to_string();
        self.db
            .call(move |db| db.update_job(&id, status, &artifacts))
            .await?;

        let id = job_id.to_string();
        let updated = self
            .db
            .call(move |db| db.get_job(&id))
            .await?
            .ok_or_else(|| SubmitError::JobNotFound {
                id: job_id.to_string(),
            })?;

        match decision {
            ApprovalDecision::Approve => {
                tracing::info!(job_id = %updated.id, "Job approved");
                self.dispatcher.dispatch(&TaskEvent::TaskCompleted {
                    job: updated.clone(),
                });
            }
            ApprovalDecision::Reject => {
                tracing::info!(job_id = %updated.id, "Job rejected");
                self.dispatcher.dispatch(&TaskEvent::TaskFailed {
                    job: updated.clone(),
                    error: "Rejected by approver".to_string(),
                });
            }
        }
        Ok(updated)
    }
}
