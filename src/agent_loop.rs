//! Per-bot agent loops.
//!
//! Each started bot gets one polling task. On every tick the loop looks
//! at the bot's board column for assigned stories and, if the bot has a
//! free slot under `max_concurrent_stories`, submits a job for the best
//! one. Story jobs are ordinary jobs; when their terminal event comes
//! back the registry moves the story and releases the slot.
//!
//! Starting an already-running bot is a no-op, so adapters can call start
//! freely without spawning duplicate loops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::board::BoardManager;
use crate::bots::{context as bot_context, BotManager};
use crate::models::{
    Bot, BotStatus, IdleBehavior, InboundMessage, Job, JournalEntryType, Story,
};
use crate::router::MessageRouter;
use crate::util::truncate;

/// Channel recorded on jobs submitted by agent loops.
pub const AGENT_CHANNEL: &str = "agent";

struct LoopHandle {
    token: CancellationToken,
    active: Arc<AtomicUsize>,
    task: tokio::task::JoinHandle<()>,
}

pub struct AgentLoopRegistry {
    bots: Arc<BotManager>,
    board: Arc<BoardManager>,
    router: Arc<MessageRouter>,
    loops: DashMap<String, LoopHandle>,
}

impl AgentLoopRegistry {
    pub fn new(bots: Arc<BotManager>, board: Arc<BoardManager>, router: Arc<MessageRouter>) -> Self {
        Self {
            bots,
            board,
            router,
            loops: DashMap::new(),
        }
    }

    pub fn is_running(&self, bot_id: &str) -> bool {
        self.loops.contains_key(bot_id)
    }

    pub fn active_stories(&self, bot_id: &str) -> usize {
        self.loops
            .get(bot_id)
            .map(|h| h.active.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Start the polling loop for a bot. Returns `false` if it was
    /// already running.
    pub async fn start(self: &Arc<Self>, bot_id: &str) -> Result<bool> {
        if self.loops.contains_key(bot_id) {
            return Ok(false);
        }

        let bot = self
            .bots
            .get(bot_id)
            .await?
            .with_context(|| format!("Bot not found: {}", bot_id))?;

        let token = CancellationToken::new();
        let active = Arc::new(AtomicUsize::new(0));

        let registry = self.clone();
        let loop_token = token.clone();
        let loop_active = active.clone();
        let loop_bot_id = bot.id.clone();
        let poll = Duration::from_secs(bot.poll_interval_seconds.max(1));
        let task = tokio::spawn(async move {
            loop {
                if let Err(e) = registry.tick_inner(&loop_bot_id, &loop_active).await {
                    tracing::warn!(bot_id = %loop_bot_id, error = %e, "Agent tick failed");
                }
                tokio::select! {
                    _ = loop_token.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
            tracing::info!(bot_id = %loop_bot_id, "Agent loop stopped");
        });

        self.loops.insert(
            bot.id.clone(),
            LoopHandle {
                token,
                active,
                task,
            },
        );
        tracing::info!(bot_id = %bot.id, "Agent loop started");
        Ok(true)
    }

    /// Stop a bot's loop and mark it stopped. In-flight story jobs keep
    /// running to completion.
    pub async fn stop(&self, bot_id: &str) -> Result<()> {
        if let Some((_, handle)) = self.loops.remove(bot_id) {
            handle.token.cancel();
            let _ = handle.task.await;
            self.bots.set_status(bot_id, BotStatus::Stopped).await?;
        }
        Ok(())
    }

    pub async fn stop_all(&self) {
        let ids: Vec<String> = self.loops.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                tracing::warn!(bot_id = %id, error = %e, "Failed to stop agent loop");
            }
        }
    }

    /// Run one poll cycle for a bot immediately.
    pub async fn tick(self: &Arc<Self>, bot_id: &str) -> Result<()> {
        let active = self
            .loops
            .get(bot_id)
            .map(|h| h.active.clone())
            .unwrap_or_else(|| Arc::new(AtomicUsize::new(0)));
        self.tick_inner(bot_id, &active).await
    }

    async fn tick_inner(&self, bot_id: &str, active: &Arc<AtomicUsize>) -> Result<()> {
        let Some(bot) = self.bots.get(bot_id).await? else {
            // Bot deleted out from under the loop
            if let Some((_, handle)) = self.loops.remove(bot_id) {
                handle.token.cancel();
            }
            return Ok(());
        };

        if bot.status == BotStatus::Paused || bot.status == BotStatus::Stopped {
            // A paused or stopped bot keeps no polling task around
            if let Some((_, handle)) = self.loops.remove(bot_id) {
                handle.token.cancel();
            }
            return Ok(());
        }

        let in_flight = active.load(Ordering::SeqCst);
        let capacity = bot.max_concurrent_stories.saturating_sub(in_flight);
        if capacity == 0 {
            return Ok(());
        }

        let board = self.board.ensure_board(&bot.project_id).await?;
        let stories = self.board.eligible_stories(&board, &bot.id).await?;

        if stories.is_empty() {
            if in_flight == 0 && bot.status != BotStatus::Idle {
                self.bots.set_status(&bot.id, BotStatus::Idle).await?;
            }
            if bot.idle_behavior == IdleBehavior::Discovery {
                tracing::debug!(bot_id = %bot.id, "Idle with discovery behavior, no stories to propose");
            }
            return Ok(());
        }

        // One claim per tick; remaining capacity fills on later cycles
        if let Some(story) = stories.into_iter().next() {
            match self.submit_story(&bot, &story).await {
                Ok(job) => {
                    self.board.story_started(&board, &story.id, &job.id).await?;
                    active.fetch_add(1, Ordering::SeqCst);
                    if bot.status != BotStatus::Working {
                        self.bots.set_status(&bot.id, BotStatus::Working).await?;
                    }
                    tracing::info!(bot_id = %bot.id, story_id = %story.id, job_id = %job.id, "Story claimed");
                }
                Err(e) => {
                    tracing::warn!(bot_id = %bot.id, story_id = %story.id, error = %e, "Story submission failed");
                    let summary =
                        format!("Failed to start story: {}", truncate(&story.title, 100));
                    if let Err(journal_err) = self
                        .bots
                        .journal(
                            &bot.id,
                            None,
                            Some(&story.id),
                            JournalEntryType::TaskFailed,
                            &summary,
                            Some(&e.to_string()),
                        )
                        .await
                    {
                        tracing::warn!(bot_id = %bot.id, error = %journal_err, "Journal write failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn submit_story(&self, bot: &Bot, story: &Story) -> Result<Job> {
        let message = InboundMessage {
            channel: AGENT_CHANNEL.to_string(),
            channel_message_id: None,
            user_id: format!("bot:{}", bot.id),
            project_id: bot.project_id.clone(),
            bot_id: Some(bot.id.clone()),
            story_id: Some(story.id.clone()),
            instruction: bot_context::story_instruction(story),
            verbosity: None,
            attachments: Vec::new(),
        };
        Ok(self.router.submit(message).await?)
    }

    /// Called for every terminal job event. Story-linked jobs release
    /// their bot slot and move the story to its next column.
    pub async fn handle_job_finished(&self, job: &Job, success: bool) {
        let Some(story_id) = &job.story_id else {
            return;
        };
        if let Err(e) = self.finish_story(story_id, success).await {
            tracing::warn!(story_id = %story_id, error = %e, "Story completion handling failed");
        }
    }

    async fn finish_story(&self, story_id: &str, success: bool) -> Result<()> {
        let story = self
            .board
            .get_story(story_id)
            .await?
            .with_context(|| format!("Story not found: {}", story_id))?;
        let board = self
            .board
            .get_board(&story.board_id)
            .await?
            .with_context(|| format!("Board not found: {}", story.board_id))?;

        if success {
            self.board.story_succeeded(&board, story_id).await?;
        } else {
            self.board.story_failed(&board, story_id).await?;
        }

        if let Some(bot_id) = &story.assignee {
            if let Some(handle) = self.loops.get(bot_id) {
                let remaining = handle
                    .active
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        Some(n.saturating_sub(1))
                    })
                    .map(|n| n.saturating_sub(1))
                    .unwrap_or(0);
                if remaining == 0 {
                    self.bots.set_status(bot_id, BotStatus::Idle).await?;
                }
            }
        }
        Ok(())
    }
}
