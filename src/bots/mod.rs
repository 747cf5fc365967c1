//! Bot records and their journals.
//!
//! A bot is a persistent worker identity: engine settings, a system
//! prompt, polling cadence, and a journal of what it has done. The agent
//! loop reads bots from here; the processor writes journal entries as
//! story jobs start and finish.

pub mod context;

use anyhow::Result;

use crate::db::DbHandle;
use crate::models::{Bot, BotStatus, IdleBehavior, JournalEntry, JournalEntryType};

/// How many journal entries flow into a bot's working context.
pub const CONTEXT_JOURNAL_ENTRIES: usize = 10;

#[derive(Debug, Clone)]
pub struct CreateBot {
    pub name: String,
    pub project_id: String,
    pub engine_type: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub poll_interval_seconds: u64,
    pub max_concurrent_stories: usize,
    pub idle_behavior: IdleBehavior,
}

pub struct BotManager {
    db: DbHandle,
}

impl BotManager {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    pub async fn create(&self, params: CreateBot) -> Result<Bot> {
        self.db
            .call(move |db| {
                db.create_bot(
                    &params.name,
                    &params.project_id,
                    &params.engine_type,
                    params.model.as_deref(),
                    params.system_prompt.as_deref(),
                    params.poll_interval_seconds,
                    params.max_concurrent_stories,
                    params.idle_behavior,
                )
            })
            .await
    }

    pub async fn get(&self, bot_id: &str) -> Result<Option<Bot>> {
        let id = bot_id.to_string();
        self.db.call(move |db| db.get_bot(&id)).await
    }

    pub async fn list(&self) -> Result<Vec<Bot>> {
        self.db.call(|db| db.list_bots()).await
    }

    pub async fn set_status(&self, bot_id: &str, status: BotStatus) -> Result<()> {
        let id = bot_id.to_string();
        self.db
            .call(move |db| db.update_bot_status(&id, status))
            .await
    }

    pub async fn delete(&self, bot_id: &str) -> Result<()> {
        let id = bot_id.to_string();
        self.db.call(move |db| db.delete_bot(&id)).await
    }

    pub async fn journal(
        &self,
        bot_id: &str,
        job_id: Option<&str>,
        story_id: Option<&str>,
        entry_type: JournalEntryType,
        summary: &str,
        details: Option<&str>,
    ) -> Result<JournalEntry> {
        let bot_id = bot_id.to_string();
        let job_id = job_id.map(String::from);
        let story_id = story_id.map(String::from);
        let summary = summary.to_string();
        let details = details.map(String::from);
        self.db
            .call(move |db| {
                db.write_journal_entry(
                    &bot_id,
                    job_id.as_deref(),
                    story_id.as_deref(),
                    entry_type,
                    &summary,
                    details.as_deref(),
                )
            })
            .await
    }

    pub async fn recent_journal(&self, bot_id: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        let id = bot_id.to_string();
        self.db.call(move |db| db.recent_journal(&id, limit)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_params(name: &str) -> CreateBot {
        CreateBot {
            name: name.to_string(),
            project_id: "demo".to_string(),
            engine_type: "claude-code".to_string(),
            model: None,
            system_prompt: Some("You maintain the demo service.".to_string()),
            poll_interval_seconds: 30,
            max_concurrent_stories: 1,
            idle_behavior: IdleBehavior::Wait,
        }
    }

    #[tokio::test]
    async fn create_get_and_pause() {
        let mgr = BotManager::new(DbHandle::open_in_memory().unwrap());
        let bot = mgr.create(create_params("scribe")).await.unwrap();
        assert_eq!(bot.status, BotStatus::Idle);

        mgr.set_status(&bot.id, BotStatus::Paused).await.unwrap();
        let paused = mgr.get(&bot.id).await.unwrap().unwrap();
        assert_eq!(paused.status, BotStatus::Paused);

        assert_eq!(mgr.list().await.unwrap().len(), 1);
        mgr.delete(&bot.id).await.unwrap();
        assert!(mgr.get(&bot.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn journal_entries_accumulate() {
        let mgr = BotManager::new(DbHandle::open_in_memory().unwrap());
        let bot = mgr.create(create_params("scribe")).await.unwrap();

        mgr.journal(&bot.id, Some("job-1"), None, JournalEntryType::TaskStarted, "Started: fix login", None)
            .await
            .unwrap();
        mgr.journal(
            &bot.id,
            Some("job-1"),
            None,
            JournalEntryType::TaskCompleted,
            "Completed: fix login",
            Some("Patched the session check"),
        )
        .await
        .unwrap();

        let recent = mgr.recent_journal(&bot.id, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
