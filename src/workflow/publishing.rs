//! GITHUB_OPERATIONS: branch, commit, pull request, optional preview deploy.

use super::orchestrator::Orchestrator;
use super::plan::{GeneratedCode, ImplementationPlan};
use super::Workflow;
use crate::github::branch_name_for;
use anyhow::{Context, Result};

pub(super) async fn publish(
    orch: &Orchestrator,
    workflow: &mut Workflow,
    plan: &ImplementationPlan,
    generated: &GeneratedCode,
) -> Result<()> {
    let vcs = orch.deps.vcs.as_ref();
    let base = vcs
        .default_branch(&workflow.repository)
        .await
        .context("Failed to resolve default branch")?;

    let branch = workflow
        .branch_name
        .clone()
        .unwrap_or_else(|| branch_name_for(&workflow.task_id, &plan.summary));

    vcs.create_branch(&workflow.repository, &branch, &base)
        .await
        .with_context(|| format!("Failed to create branch {branch}"))?;

    vcs.commit_files(
        &workflow.repository,
        &branch,
        &generated.files,
        &generated.commit_message,
    )
    .await
    .context("Failed to commit generated files")?;

    let pr_number = vcs
        .open_pull_request(
            &workflow.repository,
            &branch,
            &base,
            &generated.pr_title,
            &generated.pr_description,
        )
        .await
        .context("Failed to open pull request")?;

    workflow.branch_name = Some(branch.clone());
    workflow.pr_number = Some(pr_number);

    // Preview deployment is opportunistic: absence or failure never blocks
    // completion.
    if let Some(deployer) = &orch.deps.deployer {
        match deployer.deploy_branch(&workflow.repository, &branch).await {
            Ok(url) => {
                tracing::info!(workflow_id = %workflow.id, url = %url, "preview deployed");
                workflow.deployment_url = Some(url);
            }
            Err(e) => {
                tracing::warn!(
                    workflow_id = %workflow.id,
                    error = %format!("{e:#}"),
                    "preview deployment failed, continuing"
                );
            }
        }
    }

    tracing::info!(
        workflow_id = %workflow.id,
        branch = %branch,
        pr_number,
        "publication complete"
    );
    Ok(())
}
