//! One logical reasoning call: the iterative tool-use loop.

use super::history::prune_history;
use super::{
    CompletionRequest, ContentPart, Message, MessageRole, ReasoningBackend, SystemBlock,
    ToolDefinition, ToolHandler,
};
use crate::budget::TokenBudgetTracker;
use crate::config::EngineConfig;
use crate::error::{classify_failure, FailureKind};
use anyhow::Result;
use std::sync::Arc;

const DEFAULT_MAX_TOKENS: u32 = 8_192;

/// What to send and how far the loop may run.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub prompt: String,
    pub system_blocks: Vec<SystemBlock>,
    pub tools: Vec<ToolDefinition>,
    /// 1 when tool use is not allowed; up to the configured cap for
    /// exploration-heavy calls.
    pub max_iterations: u32,
}

impl CallSpec {
    /// A single-shot call with no tool use.
    pub fn single_shot(prompt: impl Into<String>, system_blocks: Vec<SystemBlock>) -> Self {
        Self {
            prompt: prompt.into(),
            system_blocks,
            tools: Vec::new(),
            max_iterations: 1,
        }
    }
}

/// The answer from one logical call.
#[derive(Debug, Clone)]
pub struct CallOutcome {
    pub text: String,
    /// True when the iteration cap was hit and even the final wrap-up call
    /// was rate-limited; `text` is then the partial content collected so far.
    pub degraded: bool,
    pub iterations: u32,
    /// Billed tokens actually recorded against the owner's window.
    pub tokens_used: u64,
}

/// Drives one logical call against a backend: send, execute requested tools,
/// loop, prune, and account for every token the backend reports.
pub struct ReasoningClient {
    backend: Arc<dyn ReasoningBackend>,
    tracker: Arc<TokenBudgetTracker>,
    owner_id: String,
    config: EngineConfig,
}

impl ReasoningClient {
    pub fn new(
        backend: Arc<dyn ReasoningBackend>,
        tracker: Arc<TokenBudgetTracker>,
        owner_id: impl Into<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            backend,
            tracker,
            owner_id: owner_id.into(),
            config,
        }
    }

    /// Runs the call to completion.
    ///
    /// Each round consults the budget tracker first; when usage nears the
    /// limit the client sleeps slightly over one rate window rather than
    /// failing. Usage counters from every response are recorded as actual
    /// (not estimated) consumption. Every third tool round is marked
    /// cacheable so the backend accumulates a growing cached prefix.
    ///
    /// # Errors
    /// Propagates backend errors. Hitting the iteration cap is not an error:
    /// one final call asks for an answer based on what has been explored so
    /// far, and if even that is rate-limited the outcome is a degraded
    /// partial answer.
    pub async fn execute(&self, spec: CallSpec, handler: &dyn ToolHandler) -> Result<CallOutcome> {
        let mut history = vec![Message::user_text(&spec.prompt)];
        let mut collected_text = String::new();
        let mut tokens_used = 0u64;
        let mut tool_rounds = 0u32;

        for iteration in 1..=spec.max_iterations.max(1) {
            self.wait_for_budget().await;

            let response = self
                .backend
                .complete(CompletionRequest {
                    system_blocks: spec.system_blocks.clone(),
                    messages: history.clone(),
                    tools: spec.tools.clone(),
                    max_tokens: DEFAULT_MAX_TOKENS,
                })
                .await?;

            if let Some(usage) = response.usage {
                let billed = usage.billed();
                self.tracker.record(&self.owner_id, billed);
                tokens_used += billed;
            }

            let text = response.text();
            if !text.is_empty() {
                if !collected_text.is_empty() {
                    collected_text.push('\n');
                }
                collected_text.push_str(&text);
            }

            if !response.requests_tool_use() {
                return Ok(CallOutcome {
                    text,
                    degraded: false,
                    iterations: iteration,
                    tokens_used,
                });
            }

            tool_rounds += 1;
            let cacheable = self.config.cacheable_round_interval > 0
                && tool_rounds % self.config.cacheable_round_interval == 0;

            let tool_uses = response.tool_uses();
            history.push(Message {
                role: MessageRole::Assistant,
                content: response.content,
                cacheable,
            });

            let mut results = Vec::with_capacity(tool_uses.len());
            for (id, name, input) in tool_uses {
                tracing::debug!(owner = %self.owner_id, tool = %name, "executing requested tool");
                match handler.execute(&name, &input).await {
                    Ok(output) => results.push(ContentPart::ToolResult {
                        tool_use_id: id,
                        content: output,
                        is_error: false,
                    }),
                    // Tool failures go back to the model as errored results
                    // so it can route around them.
                    Err(e) => results.push(ContentPart::ToolResult {
                        tool_use_id: id,
                        content: format!("tool error: {e:#}"),
                        is_error: true,
                    }),
                }
            }
            history.push(Message {
                role: MessageRole::User,
                content: results,
                cacheable,
            });

            prune_history(
                &mut history,
                self.config.history_prune_threshold,
                self.config.history_keep_recent,
            );
        }

        // Iteration cap reached: one last call asking for a direct answer.
        tracing::warn!(
            owner = %self.owner_id,
            iterations = spec.max_iterations,
            "tool-use iteration cap reached, requesting final answer"
        );
        history.push(Message::user_text(
            "Stop exploring. Provide your final answer now, based on what has \
             been explored so far.",
        ));

        self.wait_for_budget().await;
        let final_call = self
            .backend
            .complete(CompletionRequest {
                system_blocks: spec.system_blocks.clone(),
                messages: history,
                tools: Vec::new(),
                max_tokens: DEFAULT_MAX_TOKENS,
            })
            .await;

        match final_call {
            Ok(response) => {
                if let Some(usage) = response.usage {
                    let billed = usage.billed();
                    self.tracker.record(&self.owner_id, billed);
                    tokens_used += billed;
                }
                Ok(CallOutcome {
                    text: response.text(),
                    degraded: false,
                    iterations: spec.max_iterations + 1,
                    tokens_used,
                })
            }
            Err(e) if classify_failure(&e) == FailureKind::RateLimit => {
                tracing::warn!(
                    owner = %self.owner_id,
                    "final wrap-up call rate-limited, returning partial answer"
                );
                Ok(CallOutcome {
                    text: collected_text,
                    degraded: true,
                    iterations: spec.max_iterations,
                    tokens_used,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Sleeps out slightly more than one rate window when the owner's
    /// remaining budget is below the low watermark.
    async fn wait_for_budget(&self) {
        let remaining = self.tracker.remaining(&self.owner_id);
        if remaining < self.config.budget_low_watermark {
            let window = self.tracker.window();
            let nap = window + window / 10;
            tracing::info!(
                owner = %self.owner_id,
                remaining,
                nap_ms = nap.as_millis() as u64,
                "token budget nearly exhausted, sleeping out the window"
            );
            tokio::time::sleep(nap).await;
        }
    }
}

#[cfg(test)]
#[path = "tests/client_tests.rs"]
mod tests;
