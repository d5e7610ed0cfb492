//! Workflow state machine and orchestration.

mod implementation;
mod orchestrator;
pub mod plan;
mod planning;
mod publishing;
mod revision;

pub use orchestrator::{Orchestrator, OrchestratorDeps};

use crate::reasoning::Provider;
use anyhow::Result;
use chrono::Utc;
use plan::{ExploredFile, GeneratedCode, ImplementationPlan};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Workflow lifecycle states.
///
/// Status only advances through [`WorkflowStatus::can_transition_to`] or to
/// the two terminal failure states, which are reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Pending,
    Planning,
    AwaitingApproval,
    Implementing,
    GithubOperations,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowStatus::Completed | WorkflowStatus::Failed | WorkflowStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: WorkflowStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        if matches!(to, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
            return true;
        }
        matches!(
            (self, to),
            (WorkflowStatus::Pending, WorkflowStatus::Planning)
                | (WorkflowStatus::Planning, WorkflowStatus::AwaitingApproval)
                | (WorkflowStatus::Planning, WorkflowStatus::Implementing)
                | (WorkflowStatus::AwaitingApproval, WorkflowStatus::Implementing)
                | (WorkflowStatus::Implementing, WorkflowStatus::GithubOperations)
                | (WorkflowStatus::GithubOperations, WorkflowStatus::Completed)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Pending => "pending",
            WorkflowStatus::Planning => "planning",
            WorkflowStatus::AwaitingApproval => "awaiting_approval",
            WorkflowStatus::Implementing => "implementing",
            WorkflowStatus::GithubOperations => "github_operations",
            WorkflowStatus::Completed => "completed",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-phase payload persisted with the workflow.
///
/// A tagged union instead of a loose metadata bag: each phase writes its own
/// shape, and readers decode against the expected variant explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PhasePayload {
    Planned {
        plan: ImplementationPlan,
        explored_files: Vec<ExploredFile>,
    },
    Implemented {
        plan: ImplementationPlan,
        explored_files: Vec<ExploredFile>,
        generated: GeneratedCode,
    },
    Failed {
        phase: String,
        trace_id: String,
        message: String,
    },
}

impl PhasePayload {
    /// The planning product, from whichever variant carries one.
    pub fn plan(&self) -> Option<&ImplementationPlan> {
        match self {
            PhasePayload::Planned { plan, .. } | PhasePayload::Implemented { plan, .. } => {
                Some(plan)
            }
            _ => None,
        }
    }

    pub fn explored_files(&self) -> &[ExploredFile] {
        match self {
            PhasePayload::Planned { explored_files, .. }
            | PhasePayload::Implemented { explored_files, .. } => explored_files,
            _ => &[],
        }
    }
}

/// One task-level code-generation attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub task_id: String,
    pub credential_owner_id: String,
    pub status: WorkflowStatus,
    pub provider: Provider,
    pub repository: String,
    #[serde(default)]
    pub branch_name: Option<String>,
    #[serde(default)]
    pub pr_number: Option<u64>,
    #[serde(default)]
    pub deployment_url: Option<String>,
    /// Correlates every log line and failure record for one attempt.
    pub trace_id: String,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub payload: Option<PhasePayload>,
    pub created_at: String,
    pub updated_at: String,
}

impl Workflow {
    pub fn new(
        task_id: impl Into<String>,
        credential_owner_id: impl Into<String>,
        repository: impl Into<String>,
        provider: Provider,
    ) -> Self {
        let now = Utc::now().to_rfc3339();
        Self {
            id: Uuid::new_v4(),
            task_id: task_id.into(),
            credential_owner_id: credential_owner_id.into(),
            status: WorkflowStatus::Pending,
            provider,
            repository: repository.into(),
            branch_name: None,
            pr_number: None,
            deployment_url: None,
            trace_id: Uuid::new_v4().to_string(),
            retry_count: 0,
            payload: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    /// Advances the status, enforcing the transition graph.
    ///
    /// # Errors
    /// Fails on any edge outside the graph; FAILED and CANCELLED are
    /// reachable from every non-terminal state.
    pub fn transition(&mut self, to: WorkflowStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            anyhow::bail!(
                "Invalid workflow transition from {:?} to {:?}",
                self.status,
                to
            );
        }
        self.status = to;
        self.updated_at = Utc::now().to_rfc3339();
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/status_tests.rs"]
mod status_tests;
