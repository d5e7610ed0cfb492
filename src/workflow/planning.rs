//! Planning phase: explore the repository, produce an implementation plan.

use super::orchestrator::Orchestrator;
use super::plan::{ExploredFile, ImplementationPlan};
use super::Workflow;
use crate::error::ValidationFailed;
use crate::parsers::parse_plan;
use crate::reasoning::{CallSpec, SystemBlock, ToolDefinition, ToolHandler};
use crate::util::truncate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::json;
use std::sync::{Arc, Mutex};

const PLANNING_INSTRUCTIONS: &str = "\
You are planning a code change. Explore the repository with the provided \
tools, then answer with these labeled sections:

Summary: one sentence describing the change.
Approach: how the change will be made.
Files: one line per file to create or modify, as `path — purpose`.
Considerations: bullet list of risks and caveats.
Complexity: low, medium, or high.

Only list files you have actually read or that clearly must be created.";

/// Guideline files checked in order; the first hit becomes a cacheable
/// system block.
const GUIDELINE_PATHS: &[&str] = &[".codeforge/guidelines.md", "CONTRIBUTING.md"];

pub(super) async fn run_planning_phase(
    orch: &mut Orchestrator,
    workflow: &Workflow,
    clarification: Option<&str>,
) -> Result<(ImplementationPlan, Vec<ExploredFile>)> {
    let description = orch.task_description(&workflow.task_id).await?;

    orch.push_system_block(SystemBlock::cacheable(PLANNING_INSTRUCTIONS));

    let default_branch = orch
        .deps
        .vcs
        .default_branch(&workflow.repository)
        .await
        .context("Failed to resolve default branch for planning")?;

    for path in GUIDELINE_PATHS {
        if let Some(text) = orch
            .deps
            .vcs
            .read_file(&workflow.repository, path, &default_branch)
            .await?
        {
            orch.push_system_block(SystemBlock::cacheable(format!(
                "Repository guidelines ({path}):\n{text}"
            )));
            break;
        }
    }

    let handler = ExplorationHandler::new(
        orch.deps.vcs.clone(),
        workflow.repository.clone(),
        default_branch,
    );
    let mut prompt = format!("Task:\n{description}\n");
    if let Some(clarification) = clarification {
        prompt.push_str(&format!("\nUser clarification:\n{clarification}\n"));
    }
    prompt.push_str("\nPlan the implementation.");

    let tool_capable = workflow.provider.supports_tool_use();
    let spec = CallSpec {
        prompt,
        system_blocks: orch.system_blocks.clone(),
        tools: if tool_capable {
            exploration_tools()
        } else {
            Vec::new()
        },
        max_iterations: if tool_capable {
            orch.config.max_tool_iterations
        } else {
            1
        },
    };

    let client = orch.client_for(workflow)?;
    let outcome = client.execute(spec, &handler).await?;
    if outcome.degraded {
        tracing::warn!(
            workflow_id = %workflow.id,
            "planning answer is a degraded partial result"
        );
    }

    let explored = handler.into_explored();
    let plan = parse_plan(&outcome.text, &explored);

    if plan.files.is_empty() {
        return Err(ValidationFailed::with_guidance(
            format!(
                "planning produced no target files; response began: {}",
                truncate(&outcome.text, 300)
            ),
            "Add detail to the task description, or retry with a clarification.",
        )
        .into());
    }

    tracing::info!(
        workflow_id = %workflow.id,
        files = plan.files.len(),
        explored = explored.len(),
        complexity = ?plan.complexity,
        "planning complete"
    );

    // Insights stay available to any further call made by this instance.
    orch.push_system_block(SystemBlock::new(format!(
        "Planning insights:\nSummary: {}\nApproach: {}",
        plan.summary, plan.approach
    )));

    Ok((plan, explored))
}

pub(super) fn exploration_tools() -> Vec<ToolDefinition> {
    vec![
        ToolDefinition {
            name: "read_file".to_string(),
            description: "Read one file from the repository at the working ref.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"path": {"type": "string"}},
                "required": ["path"],
            }),
        },
        ToolDefinition {
            name: "list_files".to_string(),
            description: "List repository file paths, optionally under a prefix.".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {"prefix": {"type": "string"}},
            }),
        },
    ]
}

/// Serves exploration tools against version control and records every file
/// the planner reads; the cache crosses the phase boundary with the plan.
pub(super) struct ExplorationHandler {
    vcs: Arc<dyn crate::github::VersionControl>,
    repository: String,
    git_ref: String,
    explored: Mutex<Vec<ExploredFile>>,
}

impl ExplorationHandler {
    pub(super) fn new(
        vcs: Arc<dyn crate::github::VersionControl>,
        repository: String,
        git_ref: String,
    ) -> Self {
        Self {
            vcs,
            repository,
            git_ref,
            explored: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn into_explored(self) -> Vec<ExploredFile> {
        self.explored.into_inner().unwrap_or_default()
    }
}

#[async_trait]
impl ToolHandler for ExplorationHandler {
    async fn execute(&self, name: &str, input: &serde_json::Value) -> Result<String> {
        match name {
            "read_file" => {
                let path = input
                    .get("path")
                    .and_then(|p| p.as_str())
                    .context("read_file requires a path")?;
                match self
                    .vcs
                    .read_file(&self.repository, path, &self.git_ref)
                    .await?
                {
                    Some(content) => {
                        let mut explored = self.explored.lock().unwrap();
                        if !explored.iter().any(|e| e.path == path) {
                            let relevance = explored.len() as u32;
                            explored.push(ExploredFile {
                                path: path.to_string(),
                                content: content.clone(),
                                relevance,
                            });
                        }
                        Ok(content)
                    }
                    None => Ok(format!("File not found: {path}")),
                }
            }
            "list_files" => {
                let prefix = input.get("prefix").and_then(|p| p.as_str()).unwrap_or("");
                let paths = self
                    .vcs
                    .list_paths(&self.repository, &self.git_ref, prefix)
                    .await?;
                Ok(paths.join("\n"))
            }
            other => anyhow::bail!("unknown tool: {other}"),
        }
    }
}
