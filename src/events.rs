//! In-process event dispatch for the job lifecycle.
//!
//! Adapters and internal collaborators register handlers on the
//! [`EventDispatcher`], either globally or filtered by originating channel.
//! The job processor and queue publish [`TaskEvent`]s as jobs move through
//! the pipeline; a handler returning an error is logged and never stops
//! delivery to the remaining handlers.
//!
//! A `tokio::sync::broadcast` channel mirrors every dispatched event for
//! streaming consumers (the SSE endpoint subscribes there).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::Job;

/// Capacity of the broadcast mirror. Slow stream consumers lag rather than
/// block dispatch.
const BROADCAST_CAPACITY: usize = 256;

// ── Event types ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TaskEvent {
    TaskQueued {
        job: Job,
    },
    TaskStarted {
        job_id: String,
        channel: String,
    },
    /// Emitted on every pipeline stage transition, before work for the new
    /// stage begins.
    TaskStageChanged {
        job_id: String,
        channel: String,
        status: String,
        progress: u8,
    },
    /// A line of live engine output.
    TaskLog {
        job_id: String,
        channel: String,
        line: String,
    },
    TaskBranchCreated {
        job_id: String,
        channel: String,
        branch: String,
    },
    TaskPrCreated {
        job_id: String,
        channel: String,
        pr_url: String,
    },
    TaskApprovalRequired {
        job: Job,
    },
    TaskCompleted {
        job: Job,
    },
    TaskFailed {
        job: Job,
        error: String,
    },
}

impl TaskEvent {
    pub fn job_id(&self) -> &str {
        match self {
            TaskEvent::TaskQueued { job }
            | TaskEvent::TaskApprovalRequired { job }
            | TaskEvent::TaskCompleted { job }
            | TaskEvent::TaskFailed { job, .. } => &job.id,
            TaskEvent::TaskStarted { job_id, .. }
            | TaskEvent::TaskStageChanged { job_id, .. }
            | TaskEvent::TaskLog { job_id, .. }
            | TaskEvent::TaskBranchCreated { job_id, .. }
            | TaskEvent::TaskPrCreated { job_id, .. } => job_id,
        }
    }

    /// The originating channel of the job this event belongs to.
    pub fn channel(&self) -> &str {
        match self {
            TaskEvent::TaskQueued { job }
            | TaskEvent::TaskApprovalRequired { job }
            | TaskEvent::TaskCompleted { job }
            | TaskEvent::TaskFailed { job, .. } => &job.channel,
            TaskEvent::TaskStarted { channel, .. }
            | TaskEvent::TaskStageChanged { channel, .. }
            | TaskEvent::TaskLog { channel, .. }
            | TaskEvent::TaskBranchCreated { channel, .. }
            | TaskEvent::TaskPrCreated { channel, .. } => channel,
        }
    }

    /// Whether no further events will follow for this job.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskEvent::TaskCompleted { .. } | TaskEvent::TaskFailed { .. }
        )
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────

pub type EventHandler = Arc<dyn Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync>;

/// Opaque token returned by subscribe calls; pass to
/// [`EventDispatcher::unsubscribe`] to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
struct Registry {
    next_id: u64,
    global: Vec<(u64, EventHandler)>,
    by_channel: HashMap<String, Vec<(u64, EventHandler)>>,
}

pub struct EventDispatcher {
    registry: Mutex<Registry>,
    tx: broadcast::Sender<TaskEvent>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            registry: Mutex::new(Registry::default()),
            tx,
        }
    }

    /// Register a handler for every event.
    pub fn subscribe_global<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut reg = self.lock_registry();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.global.push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    /// Register a handler for events whose job originated on `channel`.
    pub fn subscribe_channel<F>(&self, channel: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&TaskEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let mut reg = self.lock_registry();
        let id = reg.next_id;
        reg.next_id += 1;
        reg.by_channel
            .entry(channel.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut reg = self.lock_registry();
        reg.global.retain(|(h, _)| *h != id.0);
        for handlers in reg.by_channel.values_mut() {
            handlers.retain(|(h, _)| *h != id.0);
        }
    }

    /// Subscribe to the broadcast mirror of all events.
    pub fn stream(&self) -> broadcast::Receiver<TaskEvent> {
        self.tx.subscribe()
    }

    /// Deliver an event to all global handlers, then to handlers registered
    /// for the event's channel, then to the broadcast mirror. Handler
    /// failures are logged and swallowed.
    pub fn dispatch(&self, event: &TaskEvent) {
        let handlers: Vec<EventHandler> = {
            let reg = self.lock_registry();
            reg.global
                .iter()
                .map(|(_, h)| h.clone())
                .chain(
                    reg.by_channel
                        .get(event.channel())
                        .into_iter()
                        .flatten()
                        .map(|(_, h)| h.clone()),
                )
                .collect()
        };

        for handler in handlers {
            if let Err(e) = handler(event) {
                tracing::warn!(job_id = event.job_id(), error = %e, "Event handler failed");
            }
        }

        // Ignore error if no stream subscribers
        let _ = self.tx.send(event.clone());
    }

    fn lock_registry(&self) -> std::sync::MutexGuard<'_, Registry> {
        match self.registry.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
