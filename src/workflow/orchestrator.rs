//! The state machine driver for one workflow.
//!
//! One orchestrator instance carries the conversational context (system
//! blocks) for exactly one phase. The implementation phase always runs on a
//! fresh instance, so the only state crossing the planning/implementation
//! boundary is the serialized plan and explored-file cache in the store.

use super::plan::{ExploredFile, GeneratedCode, ImplementationPlan};
use super::{implementation, planning, publishing, PhasePayload, Workflow, WorkflowStatus};
use crate::budget::TokenBudgetTracker;
use crate::config::EngineConfig;
use crate::deploy::PreviewDeployer;
use crate::error::{classify_failure, FailureKind, LifecycleAbort, ValidationFailed};
use crate::github::VersionControl;
use crate::notify::{notify_best_effort, Notifier};
use crate::reasoning::{BackendRegistry, ReasoningClient, SystemBlock};
use crate::store::{TaskStore, WorkflowStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Collaborators injected into every orchestrator instance.
#[derive(Clone)]
pub struct OrchestratorDeps {
    pub store: Arc<dyn WorkflowStore>,
    pub tasks: Arc<dyn TaskStore>,
    pub vcs: Arc<dyn VersionControl>,
    pub notifier: Arc<dyn Notifier>,
    pub deployer: Option<Arc<dyn PreviewDeployer>>,
    pub backends: Arc<BackendRegistry>,
    pub tracker: Arc<TokenBudgetTracker>,
}

pub struct Orchestrator {
    pub(super) deps: OrchestratorDeps,
    pub(super) config: EngineConfig,
    /// Context fragments for this instance's phase. Accumulates
    /// monotonically; never copied into a fresh instance.
    pub(super) system_blocks: Vec<SystemBlock>,
}

impl Orchestrator {
    pub fn new(deps: OrchestratorDeps, config: EngineConfig) -> Self {
        Self {
            deps,
            config,
            system_blocks: Vec::new(),
        }
    }

    /// A fresh instance sharing collaborators but no conversational context.
    pub(super) fn fresh(&self) -> Self {
        Self::new(self.deps.clone(), self.config.clone())
    }

    pub(super) fn push_system_block(&mut self, block: SystemBlock) {
        self.system_blocks.push(block);
    }

    pub(super) fn client_for(&self, workflow: &Workflow) -> Result<ReasoningClient> {
        let backend = self.deps.backends.get(workflow.provider)?;
        Ok(ReasoningClient::new(
            backend,
            self.deps.tracker.clone(),
            workflow.credential_owner_id.clone(),
            self.config.clone(),
        ))
    }

    pub(super) async fn load(&self, workflow_id: Uuid) -> Result<Workflow> {
        self.deps
            .store
            .get(workflow_id)
            .await?
            .with_context(|| format!("workflow {workflow_id} not found"))
    }

    /// Lifecycle checkpoint: errors with a [`LifecycleAbort`] when the
    /// owning task is gone, finished, or cancelled.
    pub(super) async fn ensure_task_alive(&self, task_id: &str) -> Result<()> {
        match self.deps.tasks.get(task_id).await? {
            None => Err(LifecycleAbort::TaskDeleted.into()),
            Some(task) if task.cancelled => Err(LifecycleAbort::TaskCancelled.into()),
            Some(task) if task.completed => Err(LifecycleAbort::TaskCompleted.into()),
            Some(_) => Ok(()),
        }
    }

    pub(super) async fn task_description(&self, task_id: &str) -> Result<String> {
        self.deps
            .tasks
            .get(task_id)
            .await?
            .map(|task| task.description)
            .ok_or_else(|| anyhow::Error::from(LifecycleAbort::TaskDeleted))
    }

    /// Runs a pending workflow through planning and, unless the plan must
    /// wait for approval, on to implementation and publication.
    ///
    /// # Errors
    /// Phase failures are persisted (FAILED, with phase name, trace id and
    /// message), posted to the user, and rethrown for upstream logging.
    /// Lifecycle aborts resolve to CANCELLED and return `Ok`.
    pub async fn run(&mut self, workflow_id: Uuid) -> Result<()> {
        let mut workflow = self.load(workflow_id).await?;
        if workflow.status != WorkflowStatus::Pending {
            anyhow::bail!(
                "workflow {} is {}, expected pending",
                workflow.id,
                workflow.status
            );
        }

        workflow.transition(WorkflowStatus::Planning)?;
        self.deps.store.update(workflow.clone()).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            trace_id = %workflow.trace_id,
            task_id = %workflow.task_id,
            "entering planning phase"
        );

        let pings = self.spawn_still_working_pings(&workflow.task_id, "planning");
        let planning_result = self.run_planning_checked(&workflow, None).await;
        pings.abort();

        let (plan, explored) = match planning_result {
            Ok(outcome) => outcome,
            Err(e) => return self.handle_phase_error(&workflow, "planning", e).await,
        };

        self.deps
            .store
            .merge_payload(
                workflow.id,
                PhasePayload::Planned {
                    plan: plan.clone(),
                    explored_files: explored.clone(),
                },
            )
            .await?;

        if self.config.require_plan_approval {
            let mut workflow = self.load(workflow_id).await?;
            workflow.transition(WorkflowStatus::AwaitingApproval)?;
            self.deps.store.update(workflow.clone()).await?;
            notify_best_effort(
                self.deps.notifier.as_ref(),
                &workflow.task_id,
                &format!(
                    "Plan ready for review: {} ({} files)",
                    plan.summary,
                    plan.files.len()
                ),
            )
            .await;
            // The run suspends here; an external approval signal drives
            // resume_after_approval.
            return Ok(());
        }

        self.continue_to_implementation(workflow_id).await
    }

    /// Entry point for the external approval signal.
    pub async fn resume_after_approval(&self, workflow_id: Uuid) -> Result<()> {
        let workflow = self.load(workflow_id).await?;
        if workflow.status != WorkflowStatus::AwaitingApproval {
            anyhow::bail!(
                "workflow {} is {}, expected awaiting_approval",
                workflow.id,
                workflow.status
            );
        }
        self.continue_to_implementation(workflow_id).await
    }

    pub(super) async fn run_planning_checked(
        &mut self,
        workflow: &Workflow,
        clarification: Option<&str>,
    ) -> Result<(ImplementationPlan, Vec<ExploredFile>)> {
        self.ensure_task_alive(&workflow.task_id).await?;
        let outcome = planning::run_planning_phase(self, workflow, clarification).await?;
        self.ensure_task_alive(&workflow.task_id).await?;
        Ok(outcome)
    }

    /// IMPLEMENTING and GITHUB_OPERATIONS, starting from the persisted plan.
    ///
    /// Always re-reads the workflow first: approval may have been granted by
    /// another process, and in-process state is never trusted across the
    /// boundary.
    pub(super) async fn continue_to_implementation(&self, workflow_id: Uuid) -> Result<()> {
        let mut workflow = self.load(workflow_id).await?;
        workflow.transition(WorkflowStatus::Implementing)?;
        self.deps.store.update(workflow.clone()).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            trace_id = %workflow.trace_id,
            "entering implementation phase"
        );

        let (plan, explored) = match workflow.payload.clone() {
            Some(PhasePayload::Planned {
                plan,
                explored_files,
            }) => (plan, explored_files),
            Some(other) => {
                let err = ValidationFailed::new(format!(
                    "expected a planned payload, found {}",
                    payload_kind(&other)
                ));
                return self
                    .handle_phase_error(&workflow, "implementation", err.into())
                    .await;
            }
            None => {
                let err = ValidationFailed::new("workflow has no persisted plan");
                return self
                    .handle_phase_error(&workflow, "implementation", err.into())
                    .await;
            }
        };

        // Fresh instance: only the plan and explored files cross the
        // phase boundary.
        let mut implementer = self.fresh();
        let pings = self.spawn_still_working_pings(&workflow.task_id, "implementation");
        let impl_result = implementer
            .run_implementation_checked(&workflow, &plan, &explored)
            .await;
        pings.abort();

        let generated = match impl_result {
            Ok(generated) => generated,
            Err(e) => {
                return self
                    .handle_phase_error(&workflow, "implementation", e)
                    .await
            }
        };

        self.deps
            .store
            .merge_payload(
                workflow.id,
                PhasePayload::Implemented {
                    plan: plan.clone(),
                    explored_files: explored.clone(),
                    generated: generated.clone(),
                },
            )
            .await?;

        let mut workflow = self.load(workflow_id).await?;
        workflow.transition(WorkflowStatus::GithubOperations)?;
        self.deps.store.update(workflow.clone()).await?;

        if let Err(e) = publishing::publish(self, &mut workflow, &plan, &generated).await {
            return self
                .handle_phase_error(&workflow, "github_operations", e)
                .await;
        }

        workflow.transition(WorkflowStatus::Completed)?;
        self.deps.store.update(workflow.clone()).await?;
        notify_best_effort(
            self.deps.notifier.as_ref(),
            &workflow.task_id,
            &format!(
                "Implementation complete: branch {}, PR #{}",
                workflow.branch_name.as_deref().unwrap_or("?"),
                workflow.pr_number.unwrap_or(0)
            ),
        )
        .await;
        Ok(())
    }

    async fn run_implementation_checked(
        &mut self,
        workflow: &Workflow,
        plan: &ImplementationPlan,
        explored: &[ExploredFile],
    ) -> Result<GeneratedCode> {
        self.ensure_task_alive(&workflow.task_id).await?;
        let generated =
            implementation::run_implementation_phase(self, workflow, plan, explored).await?;
        self.ensure_task_alive(&workflow.task_id).await?;
        Ok(generated)
    }

    /// The phase boundary: classify, persist, notify, rethrow.
    ///
    /// Lifecycle aborts are not failures: the workflow ends CANCELLED with
    /// no failure notice and the error is swallowed.
    pub(super) async fn handle_phase_error(
        &self,
        workflow: &Workflow,
        phase: &str,
        err: anyhow::Error,
    ) -> Result<()> {
        match classify_failure(&err) {
            FailureKind::Lifecycle => {
                tracing::info!(
                    workflow_id = %workflow.id,
                    phase,
                    "workflow aborted cleanly: {err}"
                );
                self.deps
                    .store
                    .set_status(workflow.id, WorkflowStatus::Cancelled)
                    .await?;
                Ok(())
            }
            kind => {
                tracing::error!(
                    workflow_id = %workflow.id,
                    trace_id = %workflow.trace_id,
                    phase,
                    ?kind,
                    "phase failed: {err:#}"
                );
                self.deps
                    .store
                    .set_status(workflow.id, WorkflowStatus::Failed)
                    .await?;
                self.deps
                    .store
                    .merge_payload(
                        workflow.id,
                        PhasePayload::Failed {
                            phase: phase.to_string(),
                            trace_id: workflow.trace_id.clone(),
                            message: format!("{err:#}"),
                        },
                    )
                    .await?;

                let guidance = err
                    .downcast_ref::<ValidationFailed>()
                    .and_then(|v| v.guidance.clone());
                let summary = match guidance {
                    Some(guidance) => format!(
                        "Code generation failed during {phase}: {err:#}. {guidance}"
                    ),
                    None => format!(
                        "Code generation failed during {phase} (trace {})",
                        workflow.trace_id
                    ),
                };
                notify_best_effort(self.deps.notifier.as_ref(), &workflow.task_id, &summary)
                    .await;
                Err(err)
            }
        }
    }

    /// Soft liveness signals for long phases. There is no hard per-call
    /// timeout; these fire at the configured thresholds until aborted.
    pub(super) fn spawn_still_working_pings(
        &self,
        task_id: &str,
        phase: &'static str,
    ) -> tokio::task::JoinHandle<()> {
        let notifier = self.deps.notifier.clone();
        let task_id = task_id.to_string();
        let thresholds = self.config.still_working_thresholds_secs.clone();
        tokio::spawn(async move {
            let started = tokio::time::Instant::now();
            for secs in thresholds {
                tokio::time::sleep_until(started + Duration::from_secs(secs)).await;
                notify_best_effort(
                    notifier.as_ref(),
                    &task_id,
                    &format!("Still working: {phase} has been running for over {secs}s"),
                )
                .await;
            }
        })
    }
}

fn payload_kind(payload: &PhasePayload) -> &'static str {
    match payload {
        PhasePayload::Planned { .. } => "planned",
        PhasePayload::Implemented { .. } => "implemented",
        PhasePayload::Failed { .. } => "failed",
    }
}
