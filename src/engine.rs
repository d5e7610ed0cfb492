//! The engine registry: one explicit construction of tracker, queue and
//! orchestrator wiring, passed by reference to call sites. Tests build a
//! fresh engine per case; nothing here is process-global.

use crate::budget::TokenBudgetTracker;
use crate::config::EngineConfig;
use crate::deploy::PreviewDeployer;
use crate::github::VersionControl;
use crate::notify::Notifier;
use crate::queue::{
    EnqueueOutcome, ExecutionQueue, QueueStats, QueuedRequest, TaskQueueStatus, WorkflowRunner,
};
use crate::reasoning::{BackendRegistry, Provider};
use crate::store::{TaskStore, WorkflowStore};
use crate::workflow::{Orchestrator, OrchestratorDeps, Workflow, WorkflowStatus};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Everything the engine needs from the host application.
pub struct EngineCollaborators {
    pub store: Arc<dyn WorkflowStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub vcs: Arc<dyn VersionControl>,
    pub notifier: Arc<dyn Notifier>,
    pub deployer: Option<Arc<dyn PreviewDeployer>>,
    pub backends: Arc<BackendRegistry>,
}

pub struct Engine {
    config: EngineConfig,
    deps: OrchestratorDeps,
    queue: ExecutionQueue,
    tracker: Arc<TokenBudgetTracker>,
}

impl Engine {
    pub fn new(config: EngineConfig, collaborators: EngineCollaborators) -> Self {
        let tracker = Arc::new(TokenBudgetTracker::new(
            config.token_budget_per_window,
            config.rate_window(),
        ));
        let deps = OrchestratorDeps {
            store: collaborators.store,
            tasks: collaborators.tasks,
            vcs: collaborators.vcs,
            notifier: collaborators.notifier,
            deployer: collaborators.deployer,
            backends: collaborators.backends,
            tracker: tracker.clone(),
        };
        let runner = Arc::new(OrchestratorRunner {
            deps: deps.clone(),
            config: config.clone(),
        });
        let queue = ExecutionQueue::new(
            tracker.clone(),
            runner,
            deps.tasks.clone(),
            deps.store.clone(),
            deps.notifier.clone(),
            config.clone(),
        );
        Self {
            config,
            deps,
            queue,
            tracker,
        }
    }

    /// Starts the queue's background tick. The returned handle aborts it.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        self.queue.start()
    }

    pub fn tracker(&self) -> &Arc<TokenBudgetTracker> {
        &self.tracker
    }

    /// Admission API: creates the workflow record and submits it for
    /// execution under the owner's budget and concurrency limits.
    ///
    /// # Errors
    /// Fails when the task already has a live workflow.
    pub async fn enqueue(
        &self,
        task_id: &str,
        credential_owner_id: &str,
        repository: &str,
        provider: Provider,
        priority: u8,
    ) -> Result<EnqueueOutcome> {
        if let Some(existing) = self.deps.store.get_by_task(task_id).await? {
            if !existing.status.is_terminal() {
                anyhow::bail!(
                    "task {task_id} already has an active workflow ({})",
                    existing.status
                );
            }
        }

        let workflow = Workflow::new(task_id, credential_owner_id, repository, provider);
        self.deps.store.insert(workflow).await?;

        let request = QueuedRequest::new(
            task_id,
            credential_owner_id,
            repository,
            provider,
            priority,
            self.config.max_retries,
            self.config.default_token_estimate,
        );
        Ok(self.queue.enqueue(request))
    }

    pub fn stats(&self, credential_owner_id: Option<&str>) -> QueueStats {
        self.queue.stats(credential_owner_id)
    }

    pub fn task_status(&self, task_id: &str) -> Option<TaskQueueStatus> {
        self.queue.task_status(task_id)
    }

    /// External approval signal for a plan waiting at the gate.
    pub async fn approve_plan(&self, workflow_id: Uuid) -> Result<()> {
        self.orchestrator().resume_after_approval(workflow_id).await
    }

    /// Re-runs planning for a zero-file failure with the user's added text.
    pub async fn retry_with_clarification(
        &self,
        workflow_id: Uuid,
        clarification: &str,
    ) -> Result<()> {
        self.orchestrator()
            .retry_with_clarification(workflow_id, clarification)
            .await
    }

    /// Post-completion change request against the existing branch.
    pub async fn apply_change_request(&self, workflow_id: Uuid, feedback: &str) -> Result<()> {
        self.orchestrator()
            .apply_change_request(workflow_id, feedback)
            .await
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(self.deps.clone(), self.config.clone())
    }
}

/// Bridges the queue to the orchestrator: every admitted request gets a
/// fresh orchestrator instance.
struct OrchestratorRunner {
    deps: OrchestratorDeps,
    config: EngineConfig,
}

#[async_trait]
impl WorkflowRunner for OrchestratorRunner {
    async fn run(&self, request: &QueuedRequest) -> Result<()> {
        let workflow = self
            .deps
            .store
            .get_by_task(&request.task_id)
            .await?
            .with_context(|| format!("no workflow recorded for task {}", request.task_id))?;

        match workflow.status {
            WorkflowStatus::Pending => {}
            // A queue retry of a failed attempt: return to PENDING with a
            // fresh trace id before re-running.
            WorkflowStatus::Failed => {
                let mut revived = workflow.clone();
                revived.status = WorkflowStatus::Pending;
                revived.retry_count = request.retry_count;
                revived.trace_id = Uuid::new_v4().to_string();
                self.deps.store.update(revived).await?;
            }
            WorkflowStatus::Completed | WorkflowStatus::Cancelled => {
                tracing::info!(
                    task_id = %request.task_id,
                    status = %workflow.status,
                    "workflow already settled, nothing to run"
                );
                return Ok(());
            }
            other => {
                anyhow::bail!(
                    "workflow for task {} is {other}, refusing concurrent run",
                    request.task_id
                );
            }
        }

        Orchestrator::new(self.deps.clone(), self.config.clone())
            .run(workflow.id)
            .await
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
