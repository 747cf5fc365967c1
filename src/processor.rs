//! The job processor: one queue delivery in, one terminal job status out.
//!
//! Pipeline stages run in fixed order — clone, engine run, commit, push,
//! then either a PR/completion or an approval gate. Every stage
//! transition is persisted and announced on the event dispatcher before
//! the stage's work begins, so observers always see the stage the job is
//! actually in.
//!
//! The sandbox is created up front and destroyed at exactly one call
//! site, whatever the pipeline did: success, stage failure, or engine
//! timeout all converge on the same teardown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use async_trait::async_trait;

use crate::bots::{context as bot_context, BotManager, CONTEXT_JOURNAL_ENTRIES};
use crate::config::AppConfig;
use crate::db::{DbHandle, JobArtifacts};
use crate::engine::{EngineRegistry, EngineRequest};
use crate::errors::PipelineError;
use crate::events::{EventDispatcher, TaskEvent};
use crate::git::{branch_name_for_job, GitOps};
use crate::models::{
    is_valid_transition, Bot, BranchStrategy, Job, JobPayload, JobStatus, JournalEntryType,
    Verbosity,
};
use crate::queue::{JobQueue, JobRunner};
use crate::sandbox::SandboxManager;
use crate::util::truncate;

/// Progress values carried on stage events and mirrored to the queue.
const PROGRESS_CLONING: u8 = 10;
const PROGRESS_RUNNING: u8 = 20;
const PROGRESS_SANDBOX: u8 = 30;
const PROGRESS_COMMITTING: u8 = 70;
const PROGRESS_PUSHING: u8 = 85;
const PROGRESS_DONE: u8 = 100;

/// Commit subject and PR title length cap.
const TITLE_LEN: usize = 72;
/// Output excerpt length for PR bodies and journal details.
const EXCERPT_LEN: usize = 2000;
/// Summary length for journal entries.
const SUMMARY_LEN: usize = 100;

struct PipelineOutcome {
    branch: Option<String>,
    commit_sha: Option<String>,
    pr_url: Option<String>,
    output: String,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cost_usd: Option<f64>,
    awaiting_approval: bool,
}

pub struct JobProcessor {
    db: DbHandle,
    config: Arc<AppConfig>,
    sandbox: Arc<SandboxManager>,
    git: Arc<dyn GitOps>,
    engines: Arc<EngineRegistry>,
    dispatcher: Arc<EventDispatcher>,
    queue: Arc<JobQueue>,
    bots: Arc<BotManager>,
}

impl JobProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DbHandle,
        config: Arc<AppConfig>,
        sandbox: Arc<SandboxManager>,
        git: Arc<dyn GitOps>,
        engines: Arc<EngineRegistry>,
        dispatcher: Arc<EventDispatcher>,
        queue: Arc<JobQueue>,
        bots: Arc<BotManager>,
    ) -> Self {
        Self {
            db,
            config,
            sandbox,
            git,
            engines,
            dispatcher,
            queue,
            bots,
        }
    }

    async fn load_job(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let id = job_id.to_string();
        self.db.call(move |db| db.get_job(&id)).await
    }

    /// Persist a stage transition and announce it before stage work starts.
    /// Transitions outside the pipeline graph are refused.
    async fn advance(
        &self,
        payload: &JobPayload,
        status: JobStatus,
        progress: u8,
    ) -> anyhow::Result<()> {
        let current = self
            .load_job(&payload.job_id)
            .await?
            .context("Job row missing at stage transition")?;
        if !is_valid_transition(&current.status, &status) {
            anyhow::bail!(
                "Invalid status transition {} -> {}",
                current.status,
                status
            );
        }

        let job_id = payload.job_id.clone();
        self.db
            .call(move |db| db.update_job_status(&job_id, status))
            .await?;
        self.dispatcher.dispatch(&TaskEvent::TaskStageChanged {
            job_id: payload.job_id.clone(),
            channel: payload.channel.clone(),
            status: status.as_str().to_string(),
            progress,
        });
        if let Err(e) = self.queue.set_progress(&payload.job_id, progress).await {
            tracing::warn!(job_id = %payload.job_id, error = %e, "Progress update failed");
        }
        Ok(())
    }

    fn branch_for(&self, payload: &JobPayload) -> Option<String> {
        match payload.branch_strategy {
            BranchStrategy::FeaturePerJob => Some(branch_name_for_job(&payload.job_id)),
            BranchStrategy::Shared => Some(format!("shipwright/{}", payload.project_id)),
            BranchStrategy::MainOnly => None,
        }
    }

    async fn run_pipeline(
        &self,
        payload: &JobPayload,
        sandbox_id: &str,
        bot: Option<&Bot>,
    ) -> Result<PipelineOutcome, PipelineError> {
        let workspace = self.sandbox.workspace(sandbox_id)?;
        let engine = self.engines.get(&payload.engine_type)?;

        // ── Cloning ──────────────────────────────────────────────────
        self.advance(payload, JobStatus::Cloning, PROGRESS_CLONING)
            .await?;
        self.git
            .clone_or_pull(&payload.repo_url, &workspace, &payload.default_branch)
            .await?;

        let branch = self.branch_for(payload);
        if let Some(branch) = &branch {
            self.git.create_branch(&workspace, branch).await?;
            let job_id = payload.job_id.clone();
            let branch_name = branch.clone();
            self.db
                .call(move |db| {
                    db.update_job(
                        &job_id,
                        JobStatus::Cloning,
                        &JobArtifacts {
                            branch: Some(branch_name),
                            ..Default::default()
                        },
                    )
                })
                .await?;
            self.dispatcher.dispatch(&TaskEvent::TaskBranchCreated {
                job_id: payload.job_id.clone(),
                channel: payload.channel.clone(),
                branch: branch.clone(),
            });
        }
        // ── Running ──────────────────────────────────────────────────
        self.advance(payload, JobStatus::Running, PROGRESS_RUNNING)
            .await?;
        if let Err(e) = self.queue.set_progress(&payload.job_id, PROGRESS_SANDBOX).await {
            tracing::warn!(job_id = %payload.job_id, error = %e, "Progress update failed");
        }

        let instruction = self
            .stage_attachments(payload, &workspace)
            .map(|notes| format!("{}{}", payload.instruction, notes))
            .unwrap_or_else(|e| {
                tracing::warn!(job_id = %payload.job_id, error = %e, "Attachment staging failed");
                payload.instruction.clone()
            });

        let system_prompt = match bot {
            Some(bot) => {
                let journal = self
                    .bots
                    .recent_journal(&bot.id, CONTEXT_JOURNAL_ENTRIES)
                    .await
                    .unwrap_or_default();
                let prompt = bot_context::system_prompt(bot, &journal);
                (!prompt.is_empty()).then_some(prompt)
            }
            None => None,
        };

        let request = EngineRequest {
            instruction,
            system_prompt,
            model: bot
                .and_then(|b| b.model.clone())
                .or_else(|| self.config.engine.default_model.clone()),
            max_turns: self.config.engine.max_turns,
            verbosity: payload.verbosity,
            env: HashMap::new(),
        };

        // Quiet jobs record output on the job row but never stream it
        let quiet = payload.verbosity == Verbosity::Quiet;
        let dispatcher = self.dispatcher.clone();
        let log_job_id = payload.job_id.clone();
        let log_channel = payload.channel.clone();
        let run = engine
            .run(
                &self.sandbox,
                sandbox_id,
                &request,
                Arc::new(move |line: &str| {
                    if quiet {
                        return;
                    }
                    dispatcher.dispatch(&TaskEvent::TaskLog {
                        job_id: log_job_id.clone(),
                        channel: log_channel.clone(),
                        line: line.to_string(),
                    });
                }),
            )
            .await?;

        // ── Committing ───────────────────────────────────────────────
        self.advance(payload, JobStatus::Committing, PROGRESS_COMMITTING)
            .await?;
        let commit_message = format!("shipwright: {}", truncate(&payload.instruction, TITLE_LEN));
        let commit_sha = self.git.commit_all(&workspace, &commit_message).await?;

        // ── Pushing / PR ─────────────────────────────────────────────
        let mut pr_url = None;
        if payload.auto_push {
            self.advance(payload, JobStatus::Pushing, PROGRESS_PUSHING)
                .await?;
            let push_branch = branch.as_deref().unwrap_or(&payload.default_branch);
            self.git.push(&workspace, push_branch).await?;

            // PRs only make sense off the default branch; failure to open
            // one never fails the job
            if payload.auto_create_pr {
                if let Some(branch) = &branch {
                    let title = truncate(&payload.instruction, TITLE_LEN).to_string();
                    let body = format!(
                        "{}\n\n---\n\n```\n{}\n```",
                        payload.instruction,
                        truncate(&run.output, EXCERPT_LEN)
                    );
                    match self
                        .git
                        .create_pull_request(
                            &workspace,
                            branch,
                            &payload.default_branch,
                            &title,
                            &body,
                        )
                        .await
                    {
                        Ok(url) => {
                            self.dispatcher.dispatch(&TaskEvent::TaskPrCreated {
                                job_id: payload.job_id.clone(),
                                channel: payload.channel.clone(),
                                pr_url: url.clone(),
                            });
                            pr_url = Some(url);
                        }
                        Err(e) => {
                            tracing::warn!(job_id = %payload.job_id, error = %e, "PR creation failed, continuing");
                        }
                    }
                }
            }
        }

        Ok(PipelineOutcome {
            branch,
            commit_sha: Some(commit_sha),
            pr_url,
            output: run.output,
            input_tokens: run.input_tokens,
            output_tokens: run.output_tokens,
            cost_usd: run.cost_usd,
            awaiting_approval: payload.require_approval,
        })
    }

    /// Copy attachments into the workspace; returns a note to append to
    /// the instruction, or an empty string when there are none.
    fn stage_attachments(
        &self,
        payload: &JobPayload,
        workspace: &std::path::Path,
    ) -> anyhow::Result<String> {
        if payload.attachment_paths.is_empty() {
            return Ok(String::new());
        }
        let dest_dir = workspace.join(".attachments");
        std::fs::create_dir_all(&dest_dir).context("Failed to create attachments dir")?;

        let mut note = String::from("\n\nAttached files:");
        for path in &payload.attachment_paths {
            let source = std::path::Path::new(path);
            let Some(filename) = source.file_name() else {
                continue;
            };
            std::fs::copy(source, dest_dir.join(filename))
                .with_context(|| format!("Failed to stage attachment {}", path))?;
            note.push_str(&format!("\n- .attachments/{}", filename.to_string_lossy()));
        }
        Ok(note)
    }

    async fn finalize_success(
        &self,
        payload: &JobPayload,
        outcome: PipelineOutcome,
        duration_ms: i64,
        bot: Option<&Bot>,
    ) -> anyhow::Result<()> {
        let status = if outcome.awaiting_approval {
            JobStatus::AwaitingApproval
        } else {
            JobStatus::Completed
        };

        let job_id = payload.job_id.clone();
        let artifacts = JobArtifacts {
            branch: outcome.branch.clone(),
            commit_sha: outcome.commit_sha.clone(),
            pr_url: outcome.pr_url.clone(),
            output: Some(outcome.output.clone()),
            error: None,
            duration_ms: Some(duration_ms),
            input_tokens: outcome.input_tokens,
            output_tokens: outcome.output_tokens,
            cost_usd: outcome.cost_usd,
        };
        self.db
            .call(move |db| db.update_job(&job_id, status, &artifacts))
            .await?;
        if let Err(e) = self.queue.set_progress(&payload.job_id, PROGRESS_DONE).await {
            tracing::warn!(job_id = %payload.job_id, error = %e, "Progress update failed");
        }

        let job = self
            .load_job(&payload.job_id)
            .await?
            .context("Job row missing at finalize")?;

        if let Some(bot) = bot {
            let summary = format!(
                "Completed: {}",
                truncate(&payload.instruction, SUMMARY_LEN)
            );
            if let Err(e) = self
                .bots
                .journal(
                    &bot.id,
                    Some(&payload.job_id),
                    job.story_id.as_deref(),
                    JournalEntryType::TaskCompleted,
                    &summary,
                    Some(truncate(&outcome.output, EXCERPT_LEN)),
                )
                .await
            {
                tracing::warn!(bot_id = %bot.id, error = %e, "Journal write failed");
            }
        }

        if outcome.awaiting_approval {
            self.dispatcher
                .dispatch(&TaskEvent::TaskApprovalRequired { job });
        } else {
            self.dispatcher.dispatch(&TaskEvent::TaskCompleted { job });
        }
        Ok(())
    }

    async fn finalize_failure(
        &self,
        payload: &JobPayload,
        error: &PipelineError,
        duration_ms: i64,
        bot: Option<&Bot>,
    ) {
        let message = error.to_string();
        tracing::error!(job_id = %payload.job_id, error = %message, "Job failed");

        let job_id = payload.job_id.clone();
        let artifacts = JobArtifacts {
            error: Some(message.clone()),
            duration_ms: Some(duration_ms),
            ..Default::default()
        };
        if let Err(e) = self
            .db
            .call(move |db| db.update_job(&job_id, JobStatus::Failed, &artifacts))
            .await
        {
            tracing::error!(job_id = %payload.job_id, error = %e, "Failed to persist failure");
        }

        if let Some(bot) = bot {
            let summary = format!("Failed: {}", truncate(&payload.instruction, SUMMARY_LEN));
            if let Err(e) = self
                .bots
                .journal(
                    &bot.id,
                    Some(&payload.job_id),
                    None,
                    JournalEntryType::TaskFailed,
                    &summary,
                    Some(truncate(&message, EXCERPT_LEN)),
                )
                .await
            {
                tracing::warn!(bot_id = %bot.id, error = %e, "Journal write failed");
            }
        }

        match self.load_job(&payload.job_id).await {
            Ok(Some(job)) => {
                self.dispatcher.dispatch(&TaskEvent::TaskFailed {
                    job,
                    error: message,
                });
            }
            Ok(None) => {
                tracing::error!(job_id = %payload.job_id, "Job row missing after failure");
            }
            Err(e) => {
                tracing::error!(job_id = %payload.job_id, error = %e, "Failed to reload job after failure");
            }
        }
    }
}

#[async_trait]
impl JobRunner for JobProcessor {
    async fn process(&self, payload: JobPayload) -> bool {
        let started = Instant::now();

        let job = match self.load_job(&payload.job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                tracing::error!(job_id = %payload.job_id, "Queue message for unknown job, dropping");
                return false;
            }
            Err(e) => {
                tracing::error!(job_id = %payload.job_id, error = %e, "Job lookup failed");
                return false;
            }
        };

        // Terminal jobs are frozen; a duplicate delivery is dropped
        if job.status.is_terminal() {
            tracing::warn!(job_id = %job.id, status = %job.status, "Job already terminal, dropping queue message");
            return false;
        }

        let bot = match &payload.bot_id {
            Some(bot_id) => match self.bots.get(bot_id).await {
                Ok(bot) => bot,
                Err(e) => {
                    tracing::warn!(bot_id = %bot_id, error = %e, "Bot lookup failed, running without context");
                    None
                }
            },
            None => None,
        };

        self.dispatcher.dispatch(&TaskEvent::TaskStarted {
            job_id: payload.job_id.clone(),
            channel: payload.channel.clone(),
        });

        if let Some(bot) = &bot {
            let summary = format!("Started: {}", truncate(&payload.instruction, SUMMARY_LEN));
            if let Err(e) = self
                .bots
                .journal(
                    &bot.id,
                    Some(&payload.job_id),
                    job.story_id.as_deref(),
                    JournalEntryType::TaskStarted,
                    &summary,
                    None,
                )
                .await
            {
                tracing::warn!(bot_id = %bot.id, error = %e, "Journal write failed");
            }
        }

        let sandbox_id = match self.sandbox.create() {
            Ok(id) => id,
            Err(e) => {
                let err = PipelineError::Sandbox(e);
                self.finalize_failure(&payload, &err, elapsed_ms(started), bot.as_ref())
                    .await;
                return false;
            }
        };

        let result = self.run_pipeline(&payload, &sandbox_id, bot.as_ref()).await;

        // The single teardown point for every pipeline path
        if let Err(e) = self.sandbox.destroy(&sandbox_id).await {
            tracing::warn!(sandbox_id = %sandbox_id, error = %e, "Sandbox teardown failed");
        }

        match result {
            Ok(outcome) => {
                match self
                    .finalize_success(&payload, outcome, elapsed_ms(started), bot.as_ref())
                    .await
                {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(job_id = %payload.job_id, error = %e, "Finalize failed");
                        false
                    }
                }
            }
            Err(error) => {
                self.finalize_failure(&payload, &error, elapsed_ms(started), bot.as_ref())
                    .await;
                false
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    started.elapsed().as_millis() as i64
}
