//! Recovery and revision entry points outside the main state machine.
//!
//! Clarification retry revives a workflow that failed with a zero-file plan;
//! change requests rework a completed workflow's branch in place.

use super::implementation::generate_code;
use super::orchestrator::Orchestrator;
use super::plan::{ExploredFile, ImplementationPlan};
use super::{PhasePayload, Workflow, WorkflowStatus};
use crate::error::ValidationFailed;
use crate::notify::notify_best_effort;
use crate::parsers::parse_plan;
use crate::reasoning::{CallSpec, SystemBlock};
use crate::util::truncate;
use anyhow::{Context, Result};
use uuid::Uuid;

const REVISION_INSTRUCTIONS: &str = "\
You are revising a previously planned code change based on user feedback. \
Answer with the same labeled sections as a fresh plan: Summary, Approach, \
Files (as `path — purpose` lines), Considerations, Complexity.";

impl Orchestrator {
    /// Re-runs planning for a failed workflow with the user's clarification
    /// appended, then resumes the normal flow (through approval when
    /// configured).
    ///
    /// This is the one sanctioned path that revives a FAILED workflow; the
    /// transition graph otherwise treats FAILED as terminal.
    pub async fn retry_with_clarification(
        &mut self,
        workflow_id: Uuid,
        clarification: &str,
    ) -> Result<()> {
        let mut workflow = self.load(workflow_id).await?;
        if workflow.status != WorkflowStatus::Failed {
            anyhow::bail!(
                "workflow {} is {}, clarification retry requires a failed workflow",
                workflow.id,
                workflow.status
            );
        }

        workflow.status = WorkflowStatus::Planning;
        workflow.retry_count += 1;
        workflow.trace_id = Uuid::new_v4().to_string();
        self.deps.store.update(workflow.clone()).await?;
        tracing::info!(
            workflow_id = %workflow.id,
            trace_id = %workflow.trace_id,
            "re-running planning with user clarification"
        );

        let pings = self.spawn_still_working_pings(&workflow.task_id, "planning");
        let planning_result = self
            .run_planning_checked(&workflow, Some(clarification))
            .await;
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
                    explored_files: explored,
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
                &format!("Revised plan ready for review: {}", plan.summary),
            )
            .await;
            return Ok(());
        }

        self.continue_to_implementation(workflow_id).await
    }

    /// Post-completion change request: derive a revised plan and code from
    /// feedback, recommit to the existing branch, and redeploy the preview
    /// when one exists. The full state machine is not re-run and the
    /// workflow stays COMPLETED.
    pub async fn apply_change_request(&mut self, workflow_id: Uuid, feedback: &str) -> Result<()> {
        let mut workflow = self.load(workflow_id).await?;
        if workflow.status != WorkflowStatus::Completed {
            anyhow::bail!(
                "workflow {} is {}, change requests require a completed workflow",
                workflow.id,
                workflow.status
            );
        }
        let branch = workflow
            .branch_name
            .clone()
            .context("completed workflow has no branch")?;

        let (plan, explored) = match workflow.payload.clone() {
            Some(PhasePayload::Implemented {
                plan,
                explored_files,
                ..
            }) => (plan, explored_files),
            _ => {
                return Err(
                    ValidationFailed::new("workflow has no implemented payload to revise").into(),
                )
            }
        };

        // Fresh context for the revision, as with any phase.
        let mut reviser = self.fresh();
        let result = reviser
            .revise_and_recommit(&mut workflow, &plan, &explored, &branch, feedback)
            .await;

        match result {
            Ok(()) => {
                self.deps.store.update(workflow.clone()).await?;
                notify_best_effort(
                    self.deps.notifier.as_ref(),
                    &workflow.task_id,
                    &format!("Change request applied to branch {branch}"),
                )
                .await;
                Ok(())
            }
            Err(e) => {
                // The workflow already completed once; a failed revision
                // leaves it COMPLETED and only reports the failure.
                notify_best_effort(
                    self.deps.notifier.as_ref(),
                    &workflow.task_id,
                    &format!("Change request failed: {}", truncate(&format!("{e:#}"), 300)),
                )
                .await;
                Err(e)
            }
        }
    }

    async fn revise_and_recommit(
        &mut self,
        workflow: &mut Workflow,
        plan: &ImplementationPlan,
        explored: &[ExploredFile],
        branch: &str,
        feedback: &str,
    ) -> Result<()> {
        let revised = self
            .derive_revised_plan(workflow, plan, explored, feedback)
            .await?;

        self.push_system_block(SystemBlock::cacheable(
            super::implementation::IMPLEMENTATION_INSTRUCTIONS,
        ));
        self.push_system_block(SystemBlock::new(format!(
            "Revised plan:\nSummary: {}\nApproach: {}",
            revised.summary, revised.approach
        )));

        let mut generated = generate_code(self, workflow, &revised, explored).await?;
        generated.filter_to_plan(&revised);

        self.deps
            .vcs
            .commit_files(
                &workflow.repository,
                branch,
                &generated.files,
                &generated.commit_message,
            )
            .await
            .context("Failed to recommit revised files")?;

        // Keep the PR description in step with the revision; failures here
        // are not fatal to the recommit.
        if let Some(number) = workflow.pr_number {
            if let Err(e) = self
                .deps
                .vcs
                .update_pull_request(
                    &workflow.repository,
                    number,
                    &generated.pr_title,
                    &generated.pr_description,
                )
                .await
            {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    error = %format!("{e:#}"),
                    "pull request update failed, continuing"
                );
            }
        }

        if workflow.deployment_url.is_some() {
            if let Some(deployer) = &self.deps.deployer {
                match deployer.deploy_branch(&workflow.repository, branch).await {
                    Ok(url) => workflow.deployment_url = Some(url),
                    Err(e) => tracing::warn!(
                        workflow_id = %workflow.id,
                        error = %format!("{e:#}"),
                        "preview redeploy failed, continuing"
                    ),
                }
            }
        }

        self.deps
            .store
            .merge_payload(
                workflow.id,
                PhasePayload::Implemented {
                    plan: revised,
                    explored_files: explored.to_vec(),
                    generated,
                },
            )
            .await?;
        Ok(())
    }

    async fn derive_revised_plan(
        &mut self,
        workflow: &Workflow,
        plan: &ImplementationPlan,
        explored: &[ExploredFile],
        feedback: &str,
    ) -> Result<ImplementationPlan> {
        self.push_system_block(SystemBlock::cacheable(REVISION_INSTRUCTIONS));

        let mut prompt = format!(
            "Previous plan:\nSummary: {}\nApproach: {}\nFiles:\n",
            plan.summary, plan.approach
        );
        for file in &plan.files {
            prompt.push_str(&format!("- {} — {}\n", file.path, file.purpose));
        }
        prompt.push_str(&format!("\nUser feedback:\n{feedback}\n\nRevise the plan."));

        let client = self.client_for(workflow)?;
        let outcome = client
            .execute(
                CallSpec::single_shot(prompt, self.system_blocks.clone()),
                &NoRevisionTools,
            )
            .await?;

        let revised = parse_plan(&outcome.text, explored);
        if revised.files.is_empty() {
            return Err(ValidationFailed::new(format!(
                "revision produced no target files; response began: {}",
                truncate(&outcome.text, 300)
            ))
            .into());
        }
        Ok(revised)
    }
}

struct NoRevisionTools;

#[async_trait::async_trait]
impl crate::reasoning::ToolHandler for NoRevisionTools {
    async fn execute(&self, name: &str, _input: &serde_json::Value) -> Result<String> {
        anyhow::bail!("tool use is not available during revision: {name}")
    }
}
