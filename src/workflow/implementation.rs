//! Implementation phase: turn a plan plus explored files into generated code.
//!
//! Always runs on a fresh orchestrator instance with an empty history; the
//! generation call is single-shot.

use super::orchestrator::Orchestrator;
use super::plan::{ExploredFile, GeneratedCode, ImplementationPlan};
use super::Workflow;
use crate::parsers::{parse_generated_code, JSON_ONLY_INSTRUCTION};
use crate::reasoning::{CallSpec, SystemBlock, ToolHandler};
use anyhow::Result;
use async_trait::async_trait;

pub(super) const IMPLEMENTATION_INSTRUCTIONS: &str = "\
You are implementing a planned code change. Respond with a single JSON \
object of this shape:

{
  \"files\": [{\"path\": \"...\", \"content\": \"full file content\", \
\"action\": \"create\" | \"modify\" | \"delete\"}],
  \"commitMessage\": \"...\",
  \"prTitle\": \"...\",
  \"prDescription\": \"...\"
}

Every file must carry its complete final content. Only touch files named in \
the plan.";

pub(super) async fn run_implementation_phase(
    orch: &mut Orchestrator,
    workflow: &Workflow,
    plan: &ImplementationPlan,
    explored: &[ExploredFile],
) -> Result<GeneratedCode> {
    orch.push_system_block(SystemBlock::cacheable(IMPLEMENTATION_INSTRUCTIONS));
    orch.push_system_block(SystemBlock::new(planning_insights(plan)));

    let mut generated = generate_code(orch, workflow, plan, explored).await?;
    generated.filter_to_plan(plan);
    Ok(generated)
}

/// The generation call plus the single "JSON only" retry. Shared with the
/// change-request flow.
pub(super) async fn generate_code(
    orch: &Orchestrator,
    workflow: &Workflow,
    plan: &ImplementationPlan,
    explored: &[ExploredFile],
) -> Result<GeneratedCode> {
    let prompt = generation_prompt(plan, explored);
    let client = orch.client_for(workflow)?;
    let handler = NoTools;

    let outcome = client
        .execute(
            CallSpec::single_shot(&prompt, orch.system_blocks.clone()),
            &handler,
        )
        .await?;

    match parse_generated_code(&outcome.text) {
        Ok(code) => Ok(code),
        Err(first_err) => {
            tracing::warn!(
                workflow_id = %workflow.id,
                error = %first_err,
                "generated code did not parse, retrying with a JSON-only instruction"
            );
            let retry_prompt = format!("{prompt}\n\n{JSON_ONLY_INSTRUCTION}");
            let retry = client
                .execute(
                    CallSpec::single_shot(&retry_prompt, orch.system_blocks.clone()),
                    &handler,
                )
                .await?;

            parse_generated_code(&retry.text).map_err(|second_err| {
                let largest = explored
                    .iter()
                    .max_by_key(|f| f.content.len())
                    .map(|f| format!("{} ({} bytes)", f.path, f.content.len()))
                    .unwrap_or_else(|| "none".to_string());
                anyhow::Error::from(second_err).context(format!(
                    "code extraction failed twice; largest injected context file: {largest}"
                ))
            })
        }
    }
}

fn planning_insights(plan: &ImplementationPlan) -> String {
    let mut text = format!(
        "Planning insights:\nSummary: {}\nApproach: {}",
        plan.summary, plan.approach
    );
    if !plan.caveats.is_empty() {
        text.push_str("\nConsiderations:");
        for caveat in &plan.caveats {
            text.push_str("\n- ");
            text.push_str(caveat);
        }
    }
    text
}

fn generation_prompt(plan: &ImplementationPlan, explored: &[ExploredFile]) -> String {
    let mut prompt = String::from("Planned files:\n");
    for file in &plan.files {
        prompt.push_str(&format!("- {} — {}\n", file.path, file.purpose));
    }

    // Highest-relevance snapshots first.
    let mut snapshots: Vec<&ExploredFile> = explored.iter().collect();
    snapshots.sort_by(|a, b| b.relevance.cmp(&a.relevance).then(a.path.cmp(&b.path)));

    if !snapshots.is_empty() {
        prompt.push_str("\nCurrent file contents:\n");
        for file in snapshots {
            prompt.push_str(&format!("\n--- {} ---\n{}\n", file.path, file.content));
        }
    }

    prompt.push_str("\nGenerate the implementation now.");
    prompt
}

/// The generation call declares no tools; any tool request is a protocol
/// violation.
struct NoTools;

#[async_trait]
impl ToolHandler for NoTools {
    async fn execute(&self, name: &str, _input: &serde_json::Value) -> Result<String> {
        anyhow::bail!("tool use is not available during implementation: {name}")
    }
}
