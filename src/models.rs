use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle status of a job. Transitions are monotonic along the pipeline
/// graph; `Failed` is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Cloning,
    Running,
    Committing,
    Pushing,
    AwaitingApproval,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Cloning => "cloning",
            Self::Running => "running",
            Self::Committing => "committing",
            Self::Pushing => "pushing",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "cloning" => Ok(Self::Cloning),
            "running" => Ok(Self::Running),
            "committing" => Ok(Self::Committing),
            "pushing" => Ok(Self::Pushing),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job status: {}", s)),
        }
    }
}

/// Validate a status transition against the pipeline graph.
/// `Failed` is allowed from any non-terminal state; terminal states are frozen.
pub fn is_valid_transition(from: &JobStatus, to: &JobStatus) -> bool {
    if from.is_terminal() {
        return false;
    }
    if *to == JobStatus::Failed {
        return true;
    }
    matches!(
        (from, to),
        (JobStatus::Queued, JobStatus::Cloning)
            | (JobStatus::Cloning, JobStatus::Running)
            | (JobStatus::Running, JobStatus::Committing)
            | (JobStatus::Committing, JobStatus::Pushing)
            | (JobStatus::Committing, JobStatus::AwaitingApproval)
            | (JobStatus::Committing, JobStatus::Completed)
            | (JobStatus::Pushing, JobStatus::AwaitingApproval)
            | (JobStatus::Pushing, JobStatus::Completed)
            | (JobStatus::AwaitingApproval, JobStatus::Completed)
    )
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum BranchStrategy {
    FeaturePerJob,
    Shared,
    MainOnly,
}

impl BranchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeaturePerJob => "feature-per-job",
            Self::Shared => "shared",
            Self::MainOnly => "main-only",
        }
    }
}

impl FromStr for BranchStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "feature-per-job" => Ok(Self::FeaturePerJob),
            "shared" => Ok(Self::Shared),
            "main-only" => Ok(Self::MainOnly),
            _ => Err(format!("Invalid branch strategy: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    Quiet,
    Normal,
    Verbose,
}

impl Verbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Quiet => "quiet",
            Self::Normal => "normal",
            Self::Verbose => "verbose",
        }
    }
}

impl FromStr for Verbosity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiet" => Ok(Self::Quiet),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            _ => Err(format!("Invalid verbosity: {}", s)),
        }
    }
}

/// One end-to-end unit of orchestrated work against a repository.
/// Created by the router at submission, mutated exclusively by the job
/// processor, immutable once `completed` or `failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub project_id: String,
    pub user_id: String,
    pub channel: String,
    pub channel_message_id: Option<String>,
    pub instruction: String,
    pub status: JobStatus,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub preview_url: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub story_id: Option<String>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub created_at: String,
    pub updated_at: String,
}

/// The queue message: a denormalized snapshot of everything the processor
/// needs, so it never re-resolves project configuration mid-flight.
/// Constructed once by the router, consumed once by a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub job_id: String,
    pub project_id: String,
    pub instruction: String,
    pub user_id: String,
    pub channel: String,
    pub channel_message_id: Option<String>,
    pub repo_url: String,
    pub default_branch: String,
    pub branch_strategy: BranchStrategy,
    pub auto_push: bool,
    pub auto_create_pr: bool,
    pub require_approval: bool,
    pub engine_type: String,
    pub bot_id: Option<String>,
    pub verbosity: Verbosity,
    pub attachment_paths: Vec<String>,
}

/// Outcome of one pipeline run, reported back to the worker pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub status: JobStatus,
    pub output: String,
    pub branch: Option<String>,
    pub commit_sha: Option<String>,
    pub pr_url: Option<String>,
    pub error: Option<String>,
    pub duration_ms: i64,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Idle,
    Working,
    Paused,
    Stopped,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }
}

impl FromStr for BotStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            _ => Err(format!("Invalid bot status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdleBehavior {
    Wait,
    Discovery,
}

impl IdleBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Wait => "wait",
            Self::Discovery => "discovery",
        }
    }
}

impl FromStr for IdleBehavior {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "wait" => Ok(Self::Wait),
            "discovery" => Ok(Self::Discovery),
            _ => Err(format!("Invalid idle behavior: {}", s)),
        }
    }
}

/// A persistent autonomous worker configuration. At most one active polling
/// loop exists per bot id at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub id: String,
    pub name: String,
    pub project_id: String,
    pub engine_type: String,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
    pub status: BotStatus,
    pub poll_interval_seconds: u64,
    pub max_concurrent_stories: usize,
    pub idle_behavior: IdleBehavior,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssigneeType {
    Human,
    Bot,
}

impl AssigneeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Bot => "bot",
        }
    }
}

impl FromStr for AssigneeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "human" => Ok(Self::Human),
            "bot" => Ok(Self::Bot),
            _ => Err(format!("Invalid assignee type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Board {
    pub id: String,
    pub project_id: String,
    pub name: String,
    pub columns: Vec<Column>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Column {
    pub id: String,
    pub board_id: String,
    pub name: String,
    pub position: i64,
    pub is_terminal: bool,
}

/// A planned unit of work on a board, assignable to a human or a bot.
/// A story occupies exactly one column; `move_story` is the only way to
/// change it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    pub board_id: String,
    pub column_id: String,
    pub title: String,
    pub description: Option<String>,
    pub acceptance_criteria: Option<String>,
    pub priority: i64,
    pub position: i64,
    pub assignee: Option<String>,
    pub assignee_type: Option<AssigneeType>,
    pub job_id: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JournalEntryType {
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    Observation,
    Decision,
    Learning,
}

impl JournalEntryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TaskStarted => "task_started",
            Self::TaskCompleted => "task_completed",
            Self::TaskFailed => "task_failed",
            Self::Observation => "observation",
            Self::Decision => "decision",
            Self::Learning => "learning",
        }
    }
}

impl FromStr for JournalEntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task_started" => Ok(Self::TaskStarted),
            "task_completed" => Ok(Self::TaskCompleted),
            "task_failed" => Ok(Self::TaskFailed),
            "observation" => Ok(Self::Observation),
            "decision" => Ok(Self::Decision),
            "learning" => Ok(Self::Learning),
            _ => Err(format!("Invalid journal entry type: {}", s)),
        }
    }
}

/// One line of a bot's activity journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub id: String,
    pub bot_id: String,
    pub job_id: Option<String>,
    pub story_id: Option<String>,
    pub entry_type: JournalEntryType,
    pub summary: String,
    pub details: Option<String>,
    pub created_at: String,
}

/// An inbound instruction from any channel, before it becomes a job.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub channel: String,
    pub channel_message_id: Option<String>,
    pub user_id: String,
    pub project_id: String,
    pub bot_id: Option<String>,
    /// Set when the message was generated from a board story.
    pub story_id: Option<String>,
    pub instruction: String,
    pub verbosity: Option<Verbosity>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}
