//! Per-credential rate-limited execution queue.
//!
//! Each credential owner gets an isolated queue: a pending list ordered by
//! priority then arrival, a set of executing requests, and (through the
//! budget tracker) a sliding usage window. Two owners never throttle each
//! other. A periodic tick is the only polling loop; everything else is
//! response-driven.

mod request;

pub use request::QueuedRequest;

use crate::budget::TokenBudgetTracker;
use crate::config::EngineConfig;
use crate::error::{backoff_delay, classify_failure, FailureKind};
use crate::notify::{notify_best_effort, Notifier};
use crate::store::{TaskStore, WorkflowStore};
use crate::workflow::WorkflowStatus;
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Executes one admitted request end to end. Injected so the queue is
/// testable without the orchestrator.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn run(&self, request: &QueuedRequest) -> Result<()>;
}

/// Admission answer for one enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    /// True when the request is waiting; false when it started immediately.
    pub queued: bool,
    pub position: Option<usize>,
    pub estimated_wait_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queue_length: usize,
    pub active_count: usize,
    pub tokens_used_in_window: u64,
    pub token_budget_remaining: u64,
    /// Seconds until a concurrency slot is expected to free up; zero when
    /// one is free now.
    pub next_available_slot_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskQueueStatus {
    pub queued: bool,
    pub position: Option<usize>,
    pub owner: String,
}

#[derive(Default)]
struct CredentialQueue {
    pending: Vec<QueuedRequest>,
    /// Executing request id -> task id.
    executing: HashMap<Uuid, String>,
}

impl CredentialQueue {
    /// Priority descending, then arrival order.
    fn insert_sorted(&mut self, request: QueuedRequest) {
        self.pending.push(request);
        self.pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.enqueued_at.cmp(&b.enqueued_at))
        });
    }
}

struct QueueInner {
    queues: Mutex<HashMap<String, CredentialQueue>>,
    tracker: Arc<TokenBudgetTracker>,
    runner: Arc<dyn WorkflowRunner>,
    tasks: Arc<dyn TaskStore>,
    store: Arc<dyn WorkflowStore>,
    notifier: Arc<dyn Notifier>,
    config: EngineConfig,
}

/// The admission API over all credential queues.
#[derive(Clone)]
pub struct ExecutionQueue {
    inner: Arc<QueueInner>,
}

impl ExecutionQueue {
    pub fn new(
        tracker: Arc<TokenBudgetTracker>,
        runner: Arc<dyn WorkflowRunner>,
        tasks: Arc<dyn TaskStore>,
        store: Arc<dyn WorkflowStore>,
        notifier: Arc<dyn Notifier>,
        config: EngineConfig,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                queues: Mutex::new(HashMap::new()),
                tracker,
                runner,
                tasks,
                store,
                notifier,
                config,
            }),
        }
    }

    /// Admits the request immediately when a concurrency slot and estimated
    /// budget are both available; otherwise holds it with a position and a
    /// wait estimate.
    pub fn enqueue(&self, request: QueuedRequest) -> EnqueueOutcome {
        let owner = request.credential_owner_id.clone();
        let admitted = {
            let mut queues = self.inner.queues.lock().unwrap();
            let queue = queues.entry(owner.clone()).or_default();
            let has_slot = queue.executing.len() < self.inner.config.max_concurrent_per_owner;
            let has_budget = self
                .inner
                .tracker
                .has_budget_for(&owner, request.estimated_tokens);
            if has_slot && has_budget {
                queue.executing.insert(request.id, request.task_id.clone());
                None
            } else {
                let id = request.id;
                queue.insert_sorted(request.clone());
                let position = queue
                    .pending
                    .iter()
                    .position(|r| r.id == id)
                    .unwrap_or(queue.pending.len() - 1);
                Some(position)
            }
        };

        match admitted {
            None => {
                tracing::debug!(owner = %owner, task_id = %request.task_id, "request admitted immediately");
                self.spawn_execution(request);
                EnqueueOutcome {
                    queued: false,
                    position: None,
                    estimated_wait_secs: None,
                }
            }
            Some(position) => {
                let wait = self.estimate_wait(position);
                tracing::debug!(
                    owner = %owner,
                    task_id = %request.task_id,
                    position,
                    wait,
                    "request queued"
                );
                EnqueueOutcome {
                    queued: true,
                    position: Some(position),
                    estimated_wait_secs: Some(wait),
                }
            }
        }
    }

    /// Wait estimate from queue position, the concurrency cap, and the
    /// average-duration constant.
    fn estimate_wait(&self, position: usize) -> u64 {
        let cap = self.inner.config.max_concurrent_per_owner.max(1) as u64;
        (position as u64 / cap + 1) * self.inner.config.average_workflow_secs
    }

    /// Starts the background tick that re-evaluates every owner's pending
    /// head, draining as many entries per tick as capacity allows.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        let queue = self.clone();
        let interval = self.inner.config.tick_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                queue.drain_ready();
            }
        })
    }

    /// Admits every pending request that capacity and budget allow, across
    /// all owners.
    pub fn drain_ready(&self) {
        let runnable = {
            let mut queues = self.inner.queues.lock().unwrap();
            let mut runnable = Vec::new();
            for (owner, queue) in queues.iter_mut() {
                while !queue.pending.is_empty()
                    && queue.executing.len() < self.inner.config.max_concurrent_per_owner
                    && self
                        .inner
                        .tracker
                        .has_budget_for(owner, queue.pending[0].estimated_tokens)
                {
                    let request = queue.pending.remove(0);
                    queue.executing.insert(request.id, request.task_id.clone());
                    runnable.push(request);
                }
            }
            runnable
        };

        for request in runnable {
            tracing::debug!(
                owner = %request.credential_owner_id,
                task_id = %request.task_id,
                "draining queued request"
            );
            self.spawn_execution(request);
        }
    }

    pub fn stats(&self, owner: Option<&str>) -> QueueStats {
        let queues = self.inner.queues.lock().unwrap();
        match owner {
            Some(owner) => {
                let (queue_length, active_count) = queues
                    .get(owner)
                    .map(|q| (q.pending.len(), q.executing.len()))
                    .unwrap_or((0, 0));
                QueueStats {
                    queue_length,
                    active_count,
                    tokens_used_in_window: self.inner.tracker.used_in_window(owner),
                    token_budget_remaining: self.inner.tracker.remaining(owner),
                    next_available_slot_secs: if active_count
                        < self.inner.config.max_concurrent_per_owner
                    {
                        0
                    } else {
                        self.inner.config.average_workflow_secs
                    },
                }
            }
            None => {
                let mut stats = QueueStats::default();
                for (owner, queue) in queues.iter() {
                    stats.queue_length += queue.pending.len();
                    stats.active_count += queue.executing.len();
                    stats.tokens_used_in_window += self.inner.tracker.used_in_window(owner);
                    stats.token_budget_remaining += self.inner.tracker.remaining(owner);
                }
                stats
            }
        }
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskQueueStatus> {
        let queues = self.inner.queues.lock().unwrap();
        for (owner, queue) in queues.iter() {
            if let Some(position) = queue.pending.iter().position(|r| r.task_id == task_id) {
                return Some(TaskQueueStatus {
                    queued: true,
                    position: Some(position),
                    owner: owner.clone(),
                });
            }
            if queue.executing.values().any(|t| t == task_id) {
                return Some(TaskQueueStatus {
                    queued: false,
                    position: None,
                    owner: owner.clone(),
                });
            }
        }
        None
    }

    fn spawn_execution(&self, request: QueuedRequest) {
        let queue = self.clone();
        tokio::spawn(async move {
            queue.execute(request).await;
        });
    }

    async fn execute(&self, request: QueuedRequest) {
        // Re-verify the task before spending anything: deleted or finished
        // tasks are discarded silently, with no retry.
        match self.inner.tasks.get(&request.task_id).await {
            Ok(Some(task)) if !task.completed && !task.cancelled => {}
            Ok(_) => {
                tracing::info!(
                    task_id = %request.task_id,
                    "task gone or finished before execution, discarding request"
                );
                self.finish(&request);
                return;
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %request.task_id,
                    error = %format!("{e:#}"),
                    "task liveness check failed, treating as transient"
                );
                self.finish(&request);
                self.handle_failure(request, e).await;
                return;
            }
        }

        let result = self.inner.runner.run(&request).await;
        self.finish(&request);

        match result {
            Ok(()) => {
                tracing::info!(task_id = %request.task_id, "workflow execution finished");
            }
            Err(e) => self.handle_failure(request, e).await,
        }

        // Capacity freed; pull queued work forward without waiting for the
        // next tick.
        self.drain_ready();
    }

    fn finish(&self, request: &QueuedRequest) {
        let mut queues = self.inner.queues.lock().unwrap();
        if let Some(queue) = queues.get_mut(&request.credential_owner_id) {
            queue.executing.remove(&request.id);
        }
    }

    async fn handle_failure(&self, request: QueuedRequest, err: anyhow::Error) {
        let attempt = request.retry_count + 1;
        match classify_failure(&err) {
            FailureKind::Lifecycle => {
                tracing::info!(
                    task_id = %request.task_id,
                    "workflow aborted by task lifecycle, not retrying"
                );
            }
            FailureKind::Validation => {
                // Already surfaced with guidance at the phase boundary;
                // retrying the same input cannot help.
                tracing::info!(
                    task_id = %request.task_id,
                    "validation failure, not retrying: {err:#}"
                );
            }
            FailureKind::RateLimit if request.retries_remaining() => {
                let delay = self.inner.config.rate_limit_retry_delay();
                tracing::warn!(
                    task_id = %request.task_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "rate limited, scheduling retry after the long delay"
                );
                self.post_retry_status(&request, "rate limited", delay.as_secs())
                    .await;
                self.schedule_retry(request, delay);
            }
            FailureKind::Transient if request.retries_remaining() => {
                let delay = backoff_delay(self.inner.config.backoff_base(), attempt);
                tracing::warn!(
                    task_id = %request.task_id,
                    attempt,
                    delay_secs = delay.as_secs(),
                    "transient failure, scheduling retry with backoff: {err:#}"
                );
                self.post_retry_status(&request, "transient failure", delay.as_secs())
                    .await;
                self.schedule_retry(request, delay);
            }
            _ => {
                tracing::error!(
                    task_id = %request.task_id,
                    attempts = attempt,
                    "retry ceiling reached, marking workflow permanently failed: {err:#}"
                );
                self.mark_permanently_failed(&request).await;
            }
        }
    }

    async fn post_retry_status(&self, request: &QueuedRequest, reason: &str, delay_secs: u64) {
        let stats = self.stats(Some(&request.credential_owner_id));
        notify_best_effort(
            self.inner.notifier.as_ref(),
            &request.task_id,
            &format!(
                "Workflow {reason}; retrying in {delay_secs}s (attempt {}/{}, queue depth {}, \
                 {} tokens remaining)",
                request.retry_count + 1,
                request.max_retries,
                stats.queue_length,
                stats.token_budget_remaining,
            ),
        )
        .await;
    }

    fn schedule_retry(&self, mut request: QueuedRequest, delay: std::time::Duration) {
        let queue = self.clone();
        request.retry_count += 1;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.enqueue(request);
        });
    }

    async fn mark_permanently_failed(&self, request: &QueuedRequest) {
        match self.inner.store.get_by_task(&request.task_id).await {
            Ok(Some(workflow)) if !workflow.status.is_terminal() => {
                if let Err(e) = self
                    .inner
                    .store
                    .set_status(workflow.id, WorkflowStatus::Failed)
                    .await
                {
                    tracing::error!(
                        task_id = %request.task_id,
                        error = %format!("{e:#}"),
                        "failed to persist permanent failure"
                    );
                }
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(
                    task_id = %request.task_id,
                    error = %format!("{e:#}"),
                    "failed to load workflow for permanent failure"
                );
            }
        }
        let stats = self.stats(Some(&request.credential_owner_id));
        notify_best_effort(
            self.inner.notifier.as_ref(),
            &request.task_id,
            &format!(
                "Workflow permanently failed after {} attempts ({} tokens remaining in window)",
                request.retry_count + 1,
                stats.token_budget_remaining,
            ),
        )
        .await;
    }
}

#[cfg(test)]
#[path = "tests/queue_tests.rs"]
mod tests;
