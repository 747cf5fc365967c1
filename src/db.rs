//! SQLite backing store: the single source of truth for job, bot, board,
//! and queue records.
//!
//! All access goes through [`DbHandle`], which wraps the connection behind
//! `Arc<Mutex>` and runs closures on tokio's blocking thread pool so
//! synchronous SQLite I/O never ties up async worker threads.
//!
//! Concurrent writers (a worker updating job status, a bot loop moving a
//! story) touch disjoint rows; row-level atomicity of SQLite is sufficient
//! and no cross-row transactions are required.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::*;
use crate::util::{generate_id, now_iso};

/// Async-safe handle to the database.
#[derive(Clone)]
pub struct DbHandle {
    inner: Arc<std::sync::Mutex<Db>>,
}

impl DbHandle {
    pub fn new(db: Db) -> Self {
        Self {
            inner: Arc::new(std::sync::Mutex::new(db)),
        }
    }

    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(Db::new(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Db::new_in_memory()?))
    }

    /// Run a closure with access to the database on a blocking thread.
    /// All data passed into `f` must be owned (`'static`).
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Db) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let db = self.inner.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")?
    }

    /// Acquire the database mutex synchronously. For startup initialization
    /// and tests; not for hot async paths.
    pub fn lock_sync(&self) -> Result<std::sync::MutexGuard<'_, Db>> {
        self.inner
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))
    }
}

/// Field updates applied to a job row alongside a status change. `None`
/// fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobArtifacts {
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

pub struct Db {
    conn: Connection,
}

impl Db {
    /// Open (or create) a SQLite database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        let conn = Connection::open(path).context("Failed to open SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    /// Create an in-memory SQLite database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn =
            Connection::open_in_memory().context("Failed to open in-memory SQLite database")?;
        let db = Self { conn };
        db.init()?;
        Ok(db)
    }

    fn init(&self) -> Result<()> {
        self.conn
            .execute_batch("PRAGMA foreign_keys = ON;")
            .context("Failed to enable foreign keys")?;
        self.run_migrations().context("Failed to run migrations")?;
        Ok(())
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS jobs (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    user_id TEXT NOT NULL,
                    channel TEXT NOT NULL,
                    channel_message_id TEXT,
                    instruction TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'queued',
                    branch TEXT,
                    commit_sha TEXT,
                    pr_url TEXT,
                    preview_url TEXT,
                    output TEXT,
                    error TEXT,
                    duration_ms INTEGER,
                    story_id TEXT,
                    input_tokens INTEGER,
                    output_tokens INTEGER,
                    cost_usd REAL,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS queue_messages (
                    job_id TEXT PRIMARY KEY,
                    payload TEXT NOT NULL,
                    state TEXT NOT NULL DEFAULT 'pending',
                    progress INTEGER NOT NULL DEFAULT 0,
                    enqueued_at TEXT NOT NULL,
                    claimed_at TEXT,
                    finished_at TEXT
                );

                CREATE TABLE IF NOT EXISTS bots (
                    id TEXT PRIMARY KEY,
                    name TEXT NOT NULL,
                    project_id TEXT NOT NULL,
                    engine_type TEXT NOT NULL DEFAULT 'claude-code',
                    model TEXT,
                    system_prompt TEXT,
                    status TEXT NOT NULL DEFAULT 'idle',
                    poll_interval_seconds INTEGER NOT NULL DEFAULT 30,
                    max_concurrent_stories INTEGER NOT NULL DEFAULT 1,
                    idle_behavior TEXT NOT NULL DEFAULT 'wait',
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS bot_journal (
                    id TEXT PRIMARY KEY,
                    bot_id TEXT NOT NULL REFERENCES bots(id) ON DELETE CASCADE,
                    job_id TEXT,
                    story_id TEXT,
                    entry_type TEXT NOT NULL,
                    summary TEXT NOT NULL,
                    details TEXT,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS boards (
                    id TEXT PRIMARY KEY,
                    project_id TEXT NOT NULL,
                    name TEXT NOT NULL,
                    created_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS board_columns (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    name TEXT NOT NULL,
                    position INTEGER NOT NULL,
                    is_terminal INTEGER NOT NULL DEFAULT 0
                );

                CREATE TABLE IF NOT EXISTS stories (
                    id TEXT PRIMARY KEY,
                    board_id TEXT NOT NULL REFERENCES boards(id) ON DELETE CASCADE,
                    column_id TEXT NOT NULL REFERENCES board_columns(id),
                    title TEXT NOT NULL,
                    description TEXT,
                    acceptance_criteria TEXT,
                    priority INTEGER NOT NULL DEFAULT 2,
                    position INTEGER NOT NULL DEFAULT 0,
                    assignee TEXT,
                    assignee_type TEXT,
                    job_id TEXT,
                    created_at TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_jobs_project ON jobs(project_id);
                CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
                CREATE INDEX IF NOT EXISTS idx_queue_state ON queue_messages(state, enqueued_at);
                CREATE INDEX IF NOT EXISTS idx_journal_bot ON bot_journal(bot_id, created_at);
                CREATE INDEX IF NOT EXISTS idx_columns_board ON board_columns(board_id);
                CREATE INDEX IF NOT EXISTS idx_stories_column ON stories(column_id);
                CREATE INDEX IF NOT EXISTS idx_stories_board ON stories(board_id);
                ",
            )
            .context("Failed to create tables")?;
        Ok(())
    }

    // ── Jobs ─────────────────────────────────────────────────────────

    pub fn create_job(
        &self,
        id: &str,
        project_id: &str,
        user_id: &str,
        channel: &str,
        channel_message_id: Option<&str>,
        instruction: &str,
        story_id: Option<&str>,
    ) -> Result<Job> {
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO jobs (id, project_id, user_id, channel, channel_message_id,
                                   instruction, status, story_id, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'queued', ?7, ?8, ?8)",
                params![id, project_id, user_id, channel, channel_message_id, instruction, story_id, now],
            )
            .context("Failed to insert job")?;
        self.get_job(id)?
            .ok_or_else(|| anyhow::anyhow!("Job {} vanished after insert", id))
    }

    pub fn get_job(&self, id: &str) -> Result<Option<Job>> {
        self.conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], job_from_row)
            .optional()
            .context("Failed to query job")
    }

    pub fn update_job_status(&self, id: &str, status: JobStatus) -> Result<()> {
        self.update_job(id, status, &JobArtifacts::default())
    }

    /// Persist a status transition plus any collected artifacts in one write.
    pub fn update_job(&self, id: &str, status: JobStatus, artifacts: &JobArtifacts) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE jobs SET
                    status = ?2,
                    branch = COALESCE(?3, branch),
                    commit_sha = COALESCE(?4, commit_sha),
                    pr_url = COALESCE(?5, pr_url),
                    output = COALESCE(?6, output),
                    error = COALESCE(?7, error),
                    duration_ms = COALESCE(?8, duration_ms),
                    input_tokens = COALESCE(?9, input_tokens),
                    output_tokens = COALESCE(?10, output_tokens),
                    cost_usd = COALESCE(?11, cost_usd),
                    updated_at = ?12
                 WHERE id = ?1",
                params![
                    id,
                    status.as_str(),
                    artifacts.branch,
                    artifacts.commit_sha,
                    artifacts.pr_url,
                    artifacts.output,
                    artifacts.error,
                    artifacts.duration_ms,
                    artifacts.input_tokens,
                    artifacts.output_tokens,
                    artifacts.cost_usd,
                    now_iso(),
                ],
            )
            .context("Failed to update job")?;
        if n == 0 {
            anyhow::bail!("Job {} not found", id);
        }
        Ok(())
    }

    pub fn list_jobs_by_project(&self, project_id: &str, limit: usize) -> Result<Vec<Job>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM jobs WHERE project_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![project_id, limit as i64], job_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list jobs")
    }

    // ── Queue messages ───────────────────────────────────────────────

    /// Store a queue message keyed by job id. If a message for the id is
    /// already pending, its payload is overwritten; if it is active or
    /// finished, the call is a no-op. Returns whether the message is
    /// pending afterwards.
    pub fn enqueue_message(&self, job_id: &str, payload: &str) -> Result<bool> {
        let existing: Option<String> = self
            .conn
            .query_row(
                "SELECT state FROM queue_messages WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query queue message")?;

        match existing.as_deref() {
            None => {
                self.conn
                    .execute(
                        "INSERT INTO queue_messages (job_id, payload, state, enqueued_at)
                         VALUES (?1, ?2, 'pending', ?3)",
                        params![job_id, payload, now_iso()],
                    )
                    .context("Failed to enqueue message")?;
                Ok(true)
            }
            Some("pending") => {
                self.conn
                    .execute(
                        "UPDATE queue_messages SET payload = ?2 WHERE job_id = ?1",
                        params![job_id, payload],
                    )
                    .context("Failed to overwrite pending message")?;
                Ok(true)
            }
            Some(_) => Ok(false),
        }
    }

    /// Claim the oldest pending message, marking it active. The mutex in
    /// `DbHandle` serializes claims, so two workers can never take the
    /// same message.
    pub fn claim_next_message(&self) -> Result<Option<(String, String)>> {
        let next: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT job_id, payload FROM queue_messages
                 WHERE state = 'pending' ORDER BY enqueued_at LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("Failed to query pending messages")?;

        if let Some((job_id, payload)) = next {
            self.conn
                .execute(
                    "UPDATE queue_messages SET state = 'active', claimed_at = ?2 WHERE job_id = ?1",
                    params![job_id, now_iso()],
                )
                .context("Failed to claim message")?;
            Ok(Some((job_id, payload)))
        } else {
            Ok(None)
        }
    }

    pub fn finish_message(&self, job_id: &str, success: bool) -> Result<()> {
        let state = if success { "done" } else { "failed" };
        self.conn
            .execute(
                "UPDATE queue_messages SET state = ?2, finished_at = ?3 WHERE job_id = ?1",
                params![job_id, state, now_iso()],
            )
            .context("Failed to finish message")?;
        Ok(())
    }

    pub fn update_message_progress(&self, job_id: &str, progress: u8) -> Result<()> {
        self.conn
            .execute(
                "UPDATE queue_messages SET progress = ?2 WHERE job_id = ?1",
                params![job_id, progress as i64],
            )
            .context("Failed to update message progress")?;
        Ok(())
    }

    pub fn message_progress(&self, job_id: &str) -> Result<Option<u8>> {
        self.conn
            .query_row(
                "SELECT progress FROM queue_messages WHERE job_id = ?1",
                params![job_id],
                |row| row.get::<_, i64>(0).map(|p| p as u8),
            )
            .optional()
            .context("Failed to query message progress")
    }

    /// Return messages left 'active' by a previous process to 'pending' so
    /// they are re-delivered after a restart.
    pub fn requeue_inflight_messages(&self) -> Result<usize> {
        let n = self
            .conn
            .execute(
                "UPDATE queue_messages SET state = 'pending', claimed_at = NULL
                 WHERE state = 'active'",
                [],
            )
            .context("Failed to requeue in-flight messages")?;
        Ok(n)
    }

    pub fn pending_message_count(&self) -> Result<usize> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM queue_messages WHERE state = 'pending'",
            [],
            |row| row.get(0),
        )?;
        Ok(n as usize)
    }

    // ── Bots ─────────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    pub fn create_bot(
        &self,
        name: &str,
        project_id: &str,
        engine_type: &str,
        model: Option<&str>,
        system_prompt: Option<&str>,
        poll_interval_seconds: u64,
        max_concurrent_stories: usize,
        idle_behavior: IdleBehavior,
    ) -> Result<Bot> {
        let id = generate_id();
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO bots (id, name, project_id, engine_type, model, system_prompt,
                                   status, poll_interval_seconds, max_concurrent_stories,
                                   idle_behavior, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 'idle', ?7, ?8, ?9, ?10, ?10)",
                params![
                    id,
                    name,
                    project_id,
                    engine_type,
                    model,
                    system_prompt,
                    poll_interval_seconds as i64,
                    max_concurrent_stories as i64,
                    idle_behavior.as_str(),
                    now,
                ],
            )
            .context("Failed to insert bot")?;
        self.get_bot(&id)?
            .ok_or_else(|| anyhow::anyhow!("Bot {} vanished after insert", id))
    }

    pub fn get_bot(&self, id: &str) -> Result<Option<Bot>> {
        self.conn
            .query_row("SELECT * FROM bots WHERE id = ?1", params![id], bot_from_row)
            .optional()
            .context("Failed to query bot")
    }

    pub fn list_bots(&self) -> Result<Vec<Bot>> {
        let mut stmt = self.conn.prepare("SELECT * FROM bots ORDER BY created_at")?;
        let rows = stmt.query_map([], bot_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to list bots")
    }

    pub fn update_bot_status(&self, id: &str, status: BotStatus) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE bots SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, status.as_str(), now_iso()],
            )
            .context("Failed to update bot status")?;
        if n == 0 {
            anyhow::bail!("Bot {} not found", id);
        }
        Ok(())
    }

    pub fn delete_bot(&self, id: &str) -> Result<()> {
        self.conn
            .execute("DELETE FROM bots WHERE id = ?1", params![id])
            .context("Failed to delete bot")?;
        Ok(())
    }

    // ── Bot journal ──────────────────────────────────────────────────

    pub fn write_journal_entry(
        &self,
        bot_id: &str,
        job_id: Option<&str>,
        story_id: Option<&str>,
        entry_type: JournalEntryType,
        summary: &str,
        details: Option<&str>,
    ) -> Result<JournalEntry> {
        let id = generate_id();
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO bot_journal (id, bot_id, job_id, story_id, entry_type, summary, details, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![id, bot_id, job_id, story_id, entry_type.as_str(), summary, details, now],
            )
            .context("Failed to insert journal entry")?;
        Ok(JournalEntry {
            id,
            bot_id: bot_id.to_string(),
            job_id: job_id.map(String::from),
            story_id: story_id.map(String::from),
            entry_type,
            summary: summary.to_string(),
            details: details.map(String::from),
            created_at: now,
        })
    }

    pub fn recent_journal(&self, bot_id: &str, limit: usize) -> Result<Vec<JournalEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM bot_journal WHERE bot_id = ?1 ORDER BY created_at DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![bot_id, limit as i64], journal_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to query journal")
    }

    // ── Boards, columns, stories ─────────────────────────────────────

    pub fn create_board(
        &self,
        project_id: &str,
        name: &str,
        columns: &[(&str, bool)],
    ) -> Result<Board> {
        let board_id = generate_id();
        self.conn
            .execute(
                "INSERT INTO boards (id, project_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![board_id, project_id, name, now_iso()],
            )
            .context("Failed to insert board")?;

        for (position, (col_name, is_terminal)) in columns.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO board_columns (id, board_id, name, position, is_terminal)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![generate_id(), board_id, col_name, position as i64, is_terminal],
                )
                .context("Failed to insert column")?;
        }

        self.get_board(&board_id)?
            .ok_or_else(|| anyhow::anyhow!("Board {} vanished after insert", board_id))
    }

    pub fn get_board(&self, id: &str) -> Result<Option<Board>> {
        let board: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT id, project_id, name FROM boards WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .context("Failed to query board")?;

        let Some((id, project_id, name)) = board else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(
            "SELECT id, board_id, name, position, is_terminal FROM board_columns
             WHERE board_id = ?1 ORDER BY position",
        )?;
        let columns = stmt
            .query_map(params![id], |row| {
                Ok(Column {
                    id: row.get(0)?,
                    board_id: row.get(1)?,
                    name: row.get(2)?,
                    position: row.get(3)?,
                    is_terminal: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(Board {
            id,
            project_id,
            name,
            columns,
        }))
    }

    pub fn get_board_by_project(&self, project_id: &str) -> Result<Option<Board>> {
        let id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM boards WHERE project_id = ?1 LIMIT 1",
                params![project_id],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query board by project")?;
        match id {
            Some(id) => self.get_board(&id),
            None => Ok(None),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn create_story(
        &self,
        board_id: &str,
        column_id: &str,
        title: &str,
        description: Option<&str>,
        acceptance_criteria: Option<&str>,
        priority: i64,
        position: i64,
        assignee: Option<&str>,
        assignee_type: Option<AssigneeType>,
    ) -> Result<Story> {
        let id = generate_id();
        let now = now_iso();
        self.conn
            .execute(
                "INSERT INTO stories (id, board_id, column_id, title, description,
                                      acceptance_criteria, priority, position, assignee,
                                      assignee_type, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                params![
                    id,
                    board_id,
                    column_id,
                    title,
                    description,
                    acceptance_criteria,
                    priority,
                    position,
                    assignee,
                    assignee_type.map(|t| t.as_str()),
                    now,
                ],
            )
            .context("Failed to insert story")?;
        self.get_story(&id)?
            .ok_or_else(|| anyhow::anyhow!("Story {} vanished after insert", id))
    }

    pub fn get_story(&self, id: &str) -> Result<Option<Story>> {
        self.conn
            .query_row("SELECT * FROM stories WHERE id = ?1", params![id], story_from_row)
            .optional()
            .context("Failed to query story")
    }

    /// Move a story to another column. The only way a story changes column.
    pub fn move_story(&self, story_id: &str, column_id: &str) -> Result<()> {
        let n = self
            .conn
            .execute(
                "UPDATE stories SET column_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![story_id, column_id, now_iso()],
            )
            .context("Failed to move story")?;
        if n == 0 {
            anyhow::bail!("Story {} not found", story_id);
        }
        Ok(())
    }

    pub fn link_story_job(&self, story_id: &str, job_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE stories SET job_id = ?2, updated_at = ?3 WHERE id = ?1",
                params![story_id, job_id, now_iso()],
            )
            .context("Failed to link story to job")?;
        Ok(())
    }

    /// Stories in a column assigned to the given bot, ordered by priority
    /// then position.
    pub fn stories_for_bot(&self, column_id: &str, bot_id: &str) -> Result<Vec<Story>> {
        let mut stmt = self.conn.prepare(
            "SELECT * FROM stories
             WHERE column_id = ?1 AND assignee_type = 'bot' AND assignee = ?2
             ORDER BY priority ASC, position ASC",
        )?;
        let rows = stmt.query_map(params![column_id, bot_id], story_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .context("Failed to query bot stories")
    }
}

// ── Row mappers ──────────────────────────────────────────────────────

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    let status: String = row.get("status")?;
    Ok(Job {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        user_id: row.get("user_id")?,
        channel: row.get("channel")?,
        channel_message_id: row.get("channel_message_id")?,
        instruction: row.get("instruction")?,
        status: JobStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        branch: row.get("branch")?,
        commit_sha: row.get("commit_sha")?,
        pr_url: row.get("pr_url")?,
        preview_url: row.get("preview_url")?,
        output: row.get("output")?,
        error: row.get("error")?,
        duration_ms: row.get("duration_ms")?,
        story_id: row.get("story_id")?,
        input_tokens: row.get("input_tokens")?,
        output_tokens: row.get("output_tokens")?,
        cost_usd: row.get("cost_usd")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn bot_from_row(row: &Row<'_>) -> rusqlite::Result<Bot> {
    let status: String = row.get("status")?;
    let idle_behavior: String = row.get("idle_behavior")?;
    Ok(Bot {
        id: row.get("id")?,
        name: row.get("name")?,
        project_id: row.get("project_id")?,
        engine_type: row.get("engine_type")?,
        model: row.get("model")?,
        system_prompt: row.get("system_prompt")?,
        status: BotStatus::from_str(&status).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        poll_interval_seconds: row.get::<_, i64>("poll_interval_seconds")? as u64,
        max_concurrent_stories: row.get::<_, i64>("max_concurrent_stories")? as usize,
        idle_behavior: IdleBehavior::from_str(&idle_behavior).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn journal_from_row(row: &Row<'_>) -> rusqlite::Result<JournalEntry> {
    let entry_type: String = row.get("entry_type")?;
    Ok(JournalEntry {
        id: row.get("id")?,
        bot_id: row.get("bot_id")?,
        job_id: row.get("job_id")?,
        story_id: row.get("story_id")?,
        entry_type: JournalEntryType::from_str(&entry_type).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, e.into())
        })?,
        summary: row.get("summary")?,
        details: row.get("details")?,
        created_at: row.get("created_at")?,
    })
}

fn story_from_row(row: &Row<'_>) -> rusqlite::Result<Story> {
    let assignee_type: Option<String> = row.get("assignee_type")?;
    Ok(Story {
        id: row.get("id")?,
        board_id: row.get("board_id")?,
        column_id: row.get("column_id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        acceptance_criteria: row.get("acceptance_criteria")?,
        priority: row.get("priority")?,
        position: row.get("position")?,
        assignee: row.get("assignee")?,
        assignee_type: assignee_type
            .map(|t| {
                AssigneeType::from_str(&t).map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        0,
                        rusqlite::types::Type::Text,
                        e.into(),
                    )
                })
            })
            .transpose()?,
        job_id: row.get("job_id")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
