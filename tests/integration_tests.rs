//! End-to-end tests over the full stack: HTTP submission through the
//! queue, worker pool, and pipeline to terminal job state, with scripted
//! git and engine implementations standing in for the real binaries.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use shipwright::agent_loop::AgentLoopRegistry;
use shipwright::approvals::ApprovalService;
use shipwright::board::{self, BoardManager};
use shipwright::bots::{BotManager, CreateBot};
use shipwright::config::{AppConfig, ProjectConfig};
use shipwright::db::DbHandle;
use shipwright::engine::{Engine, EngineRegistry, EngineRequest, EngineRun, OnLine};
use shipwright::errors::{EngineError, GitError};
use shipwright::events::{EventDispatcher, TaskEvent};
use shipwright::git::GitOps;
use shipwright::models::{
    AssigneeType, BotStatus, BranchStrategy, IdleBehavior, Job, JobStatus,
};
use shipwright::processor::JobProcessor;
use shipwright::queue::{JobQueue, WorkerPool};
use shipwright::router::MessageRouter;
use shipwright::sandbox::SandboxManager;
use shipwright::server::{build_router, AppState};

// ── Scripted collaborators ───────────────────────────────────────────

struct ScriptedGit;

#[async_trait]
impl GitOps for ScriptedGit {
    async fn clone_or_pull(
        &self,
        _repo_url: &str,
        dest: &Path,
        _default_branch: &str,
    ) -> Result<(), GitError> {
        std::fs::write(dest.join("README.md"), "seed\n")?;
        Ok(())
    }

    async fn create_branch(&self, _repo: &Path, _branch: &str) -> Result<(), GitError> {
        Ok(())
    }

    async fn commit_all(&self, _repo: &Path, _message: &str) -> Result<String, GitError> {
        Ok("abc123def456".to_string())
    }

    async fn push(&self, _repo: &Path, _branch: &str) -> Result<(), GitError> {
        Ok(())
    }

    async fn create_pull_request(
        &self,
        _repo: &Path,
        branch: &str,
        _base: &str,
        _title: &str,
        _body: &str,
    ) -> Result<String, GitError> {
        Ok(format!("https://example.com/pr/{}", branch))
    }
}

struct ScriptedEngine {
    fail: bool,
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(
        &self,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        request: &EngineRequest,
        on_line: OnLine,
    ) -> Result<EngineRun, EngineError> {
        if self.fail {
            return Err(EngineError::Run("scripted engine failure".to_string()));
        }
        let workspace = sandbox.workspace(sandbox_id)?;
        std::fs::write(workspace.join("notes.md"), &request.instruction)
            .map_err(|e| EngineError::Run(e.to_string()))?;
        on_line("working on it");
        Ok(EngineRun {
            exit_code: 0,
            output: "made the change".to_string(),
            input_tokens: Some(100),
            output_tokens: Some(400),
            cost_usd: Some(0.01),
        })
    }
}

// ── Harness ──────────────────────────────────────────────────────────

struct Harness {
    db: DbHandle,
    dispatcher: Arc<EventDispatcher>,
    sandbox: Arc<SandboxManager>,
    router: Arc<MessageRouter>,
    bots: Arc<BotManager>,
    board: Arc<BoardManager>,
    agents: Arc<AgentLoopRegistry>,
    app: axum::Router,
    pool: WorkerPool,
    _tmp: tempfile::TempDir,
}

fn project(require_approval: bool) -> ProjectConfig {
    ProjectConfig {
        repo_url: "https://example.com/demo.git".to_string(),
        default_branch: "main".to_string(),
        branch_strategy: BranchStrategy::FeaturePerJob,
        auto_push: true,
        auto_create_pr: true,
        require_approval,
    }
}

fn harness_with(project_config: ProjectConfig, engine_fails: bool) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let mut config = AppConfig::default();
    config.sandbox.workspace_dir = tmp.path().join("workspaces").to_string_lossy().to_string();
    config.engine.default_type = "scripted".to_string();
    config.projects.insert("demo".to_string(), project_config);
    let config = Arc::new(config);

    let db = DbHandle::open_in_memory().unwrap();
    let dispatcher = Arc::new(EventDispatcher::new());
    let sandbox = Arc::new(SandboxManager::new(&config.sandbox).unwrap());
    let mut engines = EngineRegistry::new();
    engines.register(Arc::new(ScriptedEngine { fail: engine_fails }));
    let engines = Arc::new(engines);

    let queue = Arc::new(JobQueue::new(db.clone()));
    let bots = Arc::new(BotManager::new(db.clone()));
    let board = Arc::new(BoardManager::new(db.clone()));

    let processor = Arc::new(JobProcessor::new(
        db.clone(),
        config.clone(),
        sandbox.clone(),
        Arc::new(ScriptedGit),
        engines,
        dispatcher.clone(),
        queue.clone(),
        bots.clone(),
    ));
    let pool = WorkerPool::start(2, queue.clone(), processor);

    let router = Arc::new(MessageRouter::new(
        db.clone(),
        config.clone(),
        queue.clone(),
        dispatcher.clone(),
        bots.clone(),
    ));
    let approvals = Arc::new(ApprovalService::new(db.clone(), dispatcher.clone()));
    let agents = Arc::new(AgentLoopRegistry::new(
        bots.clone(),
        board.clone(),
        router.clone(),
    ));

    // Terminal events feed story completion, as the orchestrator wires it
    let bridge = agents.clone();
    dispatcher.subscribe_global(move |event| {
        let (job, success) = match event {
            TaskEvent::TaskCompleted { job } => (job.clone(), true),
            TaskEvent::TaskFailed { job, .. } => (job.clone(), false),
            _ => return Ok(()),
        };
        let bridge = bridge.clone();
        tokio::spawn(async move {
            bridge.handle_job_finished(&job, success).await;
        });
        Ok(())
    });

    let app = build_router(Arc::new(AppState {
        config,
        router: router.clone(),
        approvals,
        dispatcher: dispatcher.clone(),
        agents: agents.clone(),
        bots: bots.clone(),
    }));

    Harness {
        db,
        dispatcher,
        sandbox,
        router,
        bots,
        board,
        agents,
        app,
        pool,
        _tmp: tmp,
    }
}

impl Harness {
    async fn submit_http(&self, instruction: &str) -> Job {
        let resp = self
            .app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/jobs")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({
                            "project_id": "demo",
                            "instruction": instruction,
                        })
                        .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn wait_for_job<F>(&self, job_id: &str, pred: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        for _ in 0..400 {
            let id = job_id.to_string();
            if let Some(job) = self.db.call(move |db| db.get_job(&id)).await.unwrap() {
                if pred(&job) {
                    return job;
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("Timed out waiting for job {}", job_id);
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[tokio::test]
async fn submitted_job_runs_through_pipeline_to_completed() {
    let h = harness_with(project(false), false);
    let mut events = h.dispatcher.stream();

    let job = h.submit_http("Add retry logic to the fetcher").await;
    let done = h.wait_for_job(&job.id, |j| j.status.is_terminal()).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert_eq!(done.branch.as_deref(), Some(&*format!("shipwright/{}", &job.id.to_lowercase()[..12])));
    assert_eq!(done.commit_sha.as_deref(), Some("abc123def456"));
    assert!(done.pr_url.as_deref().unwrap().starts_with("https://example.com/pr/"));
    assert_eq!(done.output.as_deref(), Some("made the change"));
    assert_eq!(done.input_tokens, Some(100));
    assert_eq!(done.cost_usd, Some(0.01));
    assert!(done.duration_ms.is_some());

    // Sandbox torn down after the run
    assert_eq!(h.sandbox.active_count(), 0);

    // Event stream saw the lifecycle in order, ending with the terminal event
    let mut kinds = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event stream stalled")
            .expect("event stream closed");
        let terminal = event.is_terminal();
        kinds.push(match event {
            TaskEvent::TaskQueued { .. } => "queued",
            TaskEvent::TaskStarted { .. } => "started",
            TaskEvent::TaskStageChanged { .. } => "stage",
            TaskEvent::TaskLog { .. } => "log",
            TaskEvent::TaskBranchCreated { .. } => "branch",
            TaskEvent::TaskPrCreated { .. } => "pr",
            TaskEvent::TaskApprovalRequired { .. } => "approval",
            TaskEvent::TaskCompleted { .. } => "completed",
            TaskEvent::TaskFailed { .. } => "failed",
        });
        if terminal {
            break;
        }
    }
    assert_eq!(kinds.first(), Some(&"queued"));
    assert_eq!(kinds.last(), Some(&"completed"));
    assert!(kinds.contains(&"branch"));
    assert!(kinds.contains(&"pr"));
    assert!(kinds.contains(&"log"));

    h.pool.shutdown().await;
}

#[tokio::test]
async fn approval_gate_parks_job_until_approved() {
    let h = harness_with(project(true), false);

    let job = h.submit_http("Refactor the config loader").await;
    let parked = h
        .wait_for_job(&job.id, |j| j.status == JobStatus::AwaitingApproval)
        .await;
    assert!(parked.commit_sha.is_some());

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/jobs/{}/approval", job.id))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"decision": "approve"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let done = h.wait_for_job(&job.id, |j| j.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Completed);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn rejected_job_fails_with_reason() {
    let h = harness_with(project(true), false);

    let job = h.submit_http("Delete the old migration path").await;
    h.wait_for_job(&job.id, |j| j.status == JobStatus::AwaitingApproval)
        .await;

    let resp = h
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!("/api/jobs/{}/approval", job.id))
                .header("content-type", "application/json")
                .body(Body::from(
                    serde_json::json!({"decision": "reject"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let done = h.wait_for_job(&job.id, |j| j.status.is_terminal()).await;
    assert_eq!(done.status, JobStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("Rejected by approver"));
    h.pool.shutdown().await;
}

#[tokio::test]
async fn engine_failure_fails_job_and_tears_down_sandbox() {
    let h = harness_with(project(false), true);

    let job = h.submit_http("This one is doomed").await;
    let done = h.wait_for_job(&job.id, |j| j.status.is_terminal()).await;

    assert_eq!(done.status, JobStatus::Failed);
    assert!(done.error.as_deref().unwrap().contains("scripted engine failure"));
    assert_eq!(h.sandbox.active_count(), 0);
    h.pool.shutdown().await;
}

#[tokio::test]
async fn main_only_strategy_skips_branch_and_pr() {
    let mut p = project(false);
    p.branch_strategy = BranchStrategy::MainOnly;
    let h = harness_with(p, false);

    let job = h.submit_http("Hotfix straight to main").await;
    let done = h.wait_for_job(&job.id, |j| j.status.is_terminal()).await;

    assert_eq!(done.status, JobStatus::Completed);
    assert!(done.branch.is_none());
    assert!(done.pr_url.is_none());
    assert!(done.commit_sha.is_some());
    h.pool.shutdown().await;
}

#[tokio::test]
async fn bot_story_flows_from_todo_to_review() {
    let h = harness_with(project(false), false);

    let bot = h
        .bots
        .create(CreateBot {
            name: "scribe".to_string(),
            project_id: "demo".to_string(),
            engine_type: "scripted".to_string(),
            model: None,
            system_prompt: Some("You maintain the demo repo.".to_string()),
            poll_interval_seconds: 3600,
            max_concurrent_stories: 1,
            idle_behavior: IdleBehavior::Wait,
        })
        .await
        .unwrap();

    let kanban = h.board.ensure_board("demo").await.unwrap();
    let story = h
        .board
        .create_story(
            &kanban,
            board::INTAKE_COLUMN,
            "Wire up the widget",
            Some("Make the widget spin"),
            None,
            1,
            Some(&bot.id),
            Some(AssigneeType::Bot),
        )
        .await
        .unwrap();

    h.agents.start(&bot.id).await.unwrap();

    // Loop claims the story, the pipeline runs it, the terminal event
    // moves it to Review and frees the bot
    for _ in 0..400 {
        let s = h.board.get_story(&story.id).await.unwrap().unwrap();
        let review = board::find_column(&kanban, "Review").unwrap();
        if s.column_id == review.id {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let moved = h.board.get_story(&story.id).await.unwrap().unwrap();
    let review = board::find_column(&kanban, "Review").unwrap();
    assert_eq!(moved.column_id, review.id);

    let job_id = moved.job_id.clone().unwrap();
    let job = h.router.get_job(&job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.story_id.as_deref(), Some(&*story.id));
    assert_eq!(job.channel, "agent");

    for _ in 0..200 {
        if h.agents.active_stories(&bot.id) == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(h.agents.active_stories(&bot.id), 0);
    assert_eq!(
        h.bots.get(&bot.id).await.unwrap().unwrap().status,
        BotStatus::Idle
    );

    h.agents.stop(&bot.id).await.unwrap();
    h.pool.shutdown().await;
}
