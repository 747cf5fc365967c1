//! Message intake: turns an [`InboundMessage`] from any adapter into a
//! persisted job plus a queue delivery.
//!
//! The router snapshots project configuration into the queue payload at
//! submission time, so a config edit mid-flight never changes what a
//! running job does. Attachments are written to disk here; the processor
//! stages them into the sandbox later.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;

use crate::bots::BotManager;
use crate::config::AppConfig;
use crate::db::DbHandle;
use crate::errors::SubmitError;
use crate::events::{EventDispatcher, TaskEvent};
use crate::models::{InboundMessage, Job, JobPayload};
use crate::queue::JobQueue;
use crate::util::generate_id;

pub struct MessageRouter {
    db: DbHandle,
    config: Arc<AppConfig>,
    queue: Arc<JobQueue>,
    dispatcher: Arc<EventDispatcher>,
    bots: Arc<BotManager>,
    attachments_dir: PathBuf,
}

impl MessageRouter {
    pub fn new(
        db: DbHandle,
        config: Arc<AppConfig>,
        queue: Arc<JobQueue>,
        dispatcher: Arc<EventDispatcher>,
        bots: Arc<BotManager>,
    ) -> Self {
        let attachments_dir = PathBuf::from(&config.sandbox.workspace_dir).join("attachments");
        Self {
            db,
            config,
            queue,
            dispatcher,
            bots,
            attachments_dir,
        }
    }

    /// Accept a message: validate it, persist a `queued` job, and hand a
    /// payload snapshot to the queue. Returns the created job.
    pub async fn submit(&self, message: InboundMessage) -> Result<Job, SubmitError> {
        let instruction = message.instruction.trim();
        if instruction.is_empty() {
            return Err(SubmitError::Validation(
                "Instruction must not be empty".to_string(),
            ));
        }

        let project = self
            .config
            .projects
            .get(&message.project_id)
            .ok_or_else(|| SubmitError::ProjectNotFound {
                id: message.project_id.clone(),
            })?
            .clone();

        let bot = match &message.bot_id {
            Some(bot_id) => Some(
                self.bots
                    .get(bot_id)
                    .await?
                    .ok_or_else(|| SubmitError::BotNotFound { id: bot_id.clone() })?,
            ),
            None => None,
        };

        let job_id = generate_id();
        let attachment_paths = self
            .write_attachments(&job_id, &message)
            .context("Failed to persist attachments")?;

        let job = {
            let job_id = job_id.clone();
            let message = message.clone();
            let instruction = instruction.to_string();
            self.db
                .call(move |db| {
                    db.create_job(
                        &job_id,
                        &message.project_id,
                        &message.user_id,
                        &message.channel,
                        message.channel_message_id.as_deref(),
                        &instruction,
                        message.story_id.as_deref(),
                    )
                })
                .await?
        };

        let payload = JobPayload {
            job_id,
            project_id: message.project_id.clone(),
            instruction: instruction.to_string(),
            user_id: message.user_id.clone(),
            channel: message.channel.clone(),
            channel_message_id: message.channel_message_id.clone(),
            repo_url: project.repo_url.clone(),
            default_branch: project.default_branch.clone(),
            branch_strategy: project.branch_strategy,
            auto_push: project.auto_push,
            auto_create_pr: project.auto_create_pr,
            require_approval: project.require_approval,
            engine_type: bot
                .as_ref()
                .map(|b| b.engine_type.clone())
                .unwrap_or_else(|| self.config.engine.default_type.clone()),
            bot_id: message.bot_id.clone(),
            verbosity: message
                .verbosity
                .unwrap_or(self.config.engine.default_verbosity),
            attachment_paths,
        };

        self.queue.enqueue(&payload).await?;
        self.dispatcher
            .dispatch(&TaskEvent::TaskQueued { job: job.clone() });
        tracing::info!(job_id = %job.id, project_id = %job.project_id, channel = %job.channel, "Job queued");
        Ok(job)
    }

    pub async fn get_job(&self, job_id: &str) -> Result<Option<Job>, SubmitError> {
        let id = job_id.to_string();
        Ok(self.db.call(move |db| db.get_job(&id)).await?)
    }

    fn write_attachments(
        &self,
        job_id: &str,
        message: &InboundMessage,
    ) -> anyhow::Result<Vec<String>> {
        if message.attachments.is_empty() {
            return Ok(Vec::new());
        }
        let dir = self.attachments_dir.join(job_id);
        std::fs::create_dir_all(&dir)?;

        let mut paths = Vec::with_capacity(message.attachments.len());
        for attachment in &message.attachments {
            // Strip any path components a hostile adapter might send
            let filename = std::path::Path::new(&attachment.filename)
                .file_name()
                .context("Attachment has no filename")?;
            let path = dir.join(filename);
            std::fs::write(&path, &attachment.content)?;
            paths.push(path.to_string_lossy().to_string());
        }
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::models::{Attachment, BranchStrategy, JobStatus};

    fn config(workspace: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.sandbox.workspace_dir = workspace.to_string_lossy().to_string();
        config.projects.insert(
            "demo".to_string(),
            ProjectConfig {
                repo_url: "https://example.com/demo.git".to_string(),
                default_branch: "main".to_string(),
                branch_strategy: BranchStrategy::FeaturePerJob,
                auto_push: true,
                auto_create_pr: true,
                require_approval: false,
            },
        );
        config
    }

    fn router(workspace: &std::path::Path) -> (MessageRouter, Arc<JobQueue>) {
        let db = DbHandle::open_in_memory().unwrap();
        let queue = Arc::new(JobQueue::new(db.clone()));
        let router = MessageRouter::new(
            db.clone(),
            Arc::new(config(workspace)),
            queue.clone(),
            Arc::new(EventDispatcher::new()),
            Arc::new(BotManager::new(db)),
        );
        (router, queue)
    }

    fn message(project_id: &str, instruction: &str) -> InboundMessage {
        InboundMessage {
            channel: "rest".to_string(),
            channel_message_id: Some("m-1".to_string()),
            user_id: "u-1".to_string(),
            project_id: project_id.to_string(),
            bot_id: None,
            story_id: None,
            instruction: instruction.to_string(),
            verbosity: None,
            attachments: Vec::new(),
        }
    }

    #[tokio::test]
    async fn submit_creates_queued_job_and_payload_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, queue) = router(tmp.path());

        let job = router.submit(message("demo", "Add a thing")).await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.project_id, "demo");

        let (job_id, payload) = queue.claim().await.unwrap().unwrap();
        assert_eq!(job_id, job.id);
        assert_eq!(payload.repo_url, "https://example.com/demo.git");
        assert_eq!(payload.engine_type, "claude-code");
        assert!(payload.auto_push);
    }

    #[tokio::test]
    async fn empty_instruction_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _) = router(tmp.path());
        let err = router.submit(message("demo", "   ")).await.unwrap_err();
        assert!(matches!(err, SubmitError::Validation(_)));
    }

    #[tokio::test]
    async fn unknown_project_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _) = router(tmp.path());
        let err = router
            .submit(message("nope", "do something"))
            .await
            .unwrap_err();
        assert!(matches!(err, SubmitError::ProjectNotFound { .. }));
    }

    #[tokio::test]
    async fn unknown_bot_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _) = router(tmp.path());
        let mut msg = message("demo", "do something");
        msg.bot_id = Some("ghost".to_string());
        let err = router.submit(msg).await.unwrap_err();
        assert!(matches!(err, SubmitError::BotNotFound { .. }));
    }

    #[tokio::test]
    async fn attachments_are_written_with_sanitized_names() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, queue) = router(tmp.path());

        let mut msg = message("demo", "use the attached spec");
        msg.attachments.push(Attachment {
            filename: "../../etc/spec.md".to_string(),
            content: b"# spec".to_vec(),
        });

        let job = router.submit(msg).await.unwrap();
        let (_, payload) = queue.claim().await.unwrap().unwrap();
        assert_eq!(payload.attachment_paths.len(), 1);

        let path = std::path::Path::new(&payload.attachment_paths[0]);
        assert!(path.ends_with(format!("attachments/{}/spec.md", job.id)));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# spec");
    }

    #[tokio::test]
    async fn instruction_is_trimmed() {
        let tmp = tempfile::tempdir().unwrap();
        let (router, _) = router(tmp.path());
        let job = router
            .submit(message("demo", "  fix the bug \n"))
            .await
            .unwrap();
        assert_eq!(job.instruction, "fix the bug");
    }
}
