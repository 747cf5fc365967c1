//! Wires the subsystems together into a running service: database, event
//! dispatcher, sandbox manager, engines, queue with its worker pool, the
//! message router, and the agent loop registry.
//!
//! The dispatcher is the only coupling between the job pipeline and the
//! agent loops: a global subscription watches for terminal job events and
//! routes story-linked ones back to the registry.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};

use crate::agent_loop::AgentLoopRegistry;
use crate::approvals::ApprovalService;
use crate::board::BoardManager;
use crate::bots::BotManager;
use crate::config::AppConfig;
use crate::db::DbHandle;
use crate::engine::EngineRegistry;
use crate::events::{EventDispatcher, TaskEvent};
use crate::git::SystemGit;
use crate::models::BotStatus;
use crate::processor::JobProcessor;
use crate::queue::{JobQueue, WorkerPool};
use crate::router::MessageRouter;
use crate::sandbox::SandboxManager;
use crate::server::{self, AppState, SharedState};

pub struct Orchestrator {
    pub config: Arc<AppConfig>,
    pub db: DbHandle,
    pub dispatcher: Arc<EventDispatcher>,
    pub queue: Arc<JobQueue>,
    pub router: Arc<MessageRouter>,
    pub approvals: Arc<ApprovalService>,
    pub bots: Arc<BotManager>,
    pub board: Arc<BoardManager>,
    pub agents: Arc<AgentLoopRegistry>,
    pool: WorkerPool,
}

impl Orchestrator {
    /// Build every subsystem, recover queue state from a previous run,
    /// and start the worker pool and any bots that were left running.
    pub async fn start(config: AppConfig) -> Result<Self> {
        let config = Arc::new(config);
        let db = DbHandle::open(Path::new(&config.database.path))
            .with_context(|| format!("Failed to open database at {}", config.database.path))?;

        let dispatcher = Arc::new(EventDispatcher::new());
        let sandbox = Arc::new(SandboxManager::new(&config.sandbox)?);
        let engines = Arc::new(EngineRegistry::with_defaults());
        let git = Arc::new(SystemGit);

        let queue = Arc::new(JobQueue::new(db.clone()));
        queue.recover().await?;

        let bots = Arc::new(BotManager::new(db.clone()));
        let board = Arc::new(BoardManager::new(db.clone()));

        let processor = Arc::new(JobProcessor::new(
            db.clone(),
            config.clone(),
            sandbox,
            git,
            engines,
            dispatcher.clone(),
            queue.clone(),
            bots.clone(),
        ));
        let pool = WorkerPool::start(config.queue.concurrency, queue.clone(), processor);

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

        bridge_terminal_events(&dispatcher, &agents);

        let orchestrator = Self {
            config,
            db,
            dispatcher,
            queue,
            router,
            approvals,
            bots,
            board,
            agents,
            pool,
        };
        orchestrator.resume_bots().await?;
        Ok(orchestrator)
    }

    /// Restart agent loops for bots that were not explicitly stopped.
    async fn resume_bots(&self) -> Result<()> {
        for bot in self.bots.list().await? {
            if bot.status == BotStatus::Stopped {
                continue;
            }
            if let Err(e) = self.agents.start(&bot.id).await {
                tracing::warn!(bot_id = %bot.id, error = %e, "Failed to resume agent loop");
            }
        }
        Ok(())
    }

    pub fn app_state(&self) -> SharedState {
        Arc::new(AppState {
            config: self.config.clone(),
            router: self.router.clone(),
            approvals: self.approvals.clone(),
            dispatcher: self.dispatcher.clone(),
            agents: self.agents.clone(),
            bots: self.bots.clone(),
        })
    }

    /// Stop agent loops, then drain the worker pool. In-flight jobs run
    /// to completion.
    pub async fn shutdown(self) {
        tracing::info!("Shutting down");
        self.agents.stop_all().await;
        self.pool.shutdown().await;
    }
}

/// Forward terminal job events to the agent registry so story-linked
/// jobs move their stories and release bot slots.
fn bridge_terminal_events(dispatcher: &Arc<EventDispatcher>, agents: &Arc<AgentLoopRegistry>) {
    let agents = agents.clone();
    dispatcher.subscribe_global(move |event| {
        let (job, success) = match event {
            TaskEvent::TaskCompleted { job } => (job.clone(), true),
            TaskEvent::TaskFailed { job, .. } => (job.clone(), false),
            _ => return Ok(()),
        };
        let agents = agents.clone();
        tokio::spawn(async move {
            agents.handle_job_finished(&job, success).await;
        });
        Ok(())
    });
}

/// Run the service until interrupted.
pub async fn run(config: AppConfig) -> Result<()> {
    let orchestrator = Orchestrator::start(config).await?;
    let state = orchestrator.app_state();
    let host = orchestrator.config.server.host.clone();
    let port = orchestrator.config.server.port;

    server::serve(state, &host, port, shutdown_signal()).await?;
    orchestrator.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
}
