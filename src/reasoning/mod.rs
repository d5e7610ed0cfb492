//! Reasoning-backend call types.
//!
//! One call shape covers every provider: ordered system blocks plus a message
//! history and optional tool declarations go in, text (optionally with tool
//! requests and usage counters) comes out. Only the tool-use-capable provider
//! participates in the iterative loop; the others receive single-shot calls.

mod client;
mod history;
mod providers;

pub use client::{CallOutcome, CallSpec, ReasoningClient};
pub use history::prune_history;
pub use providers::{ClaudeBackend, CodexBackend, GeminiBackend};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The closed set of reasoning-service providers.
///
/// Adding a variant forces exhaustive handling at every dispatch site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Claude,
    Codex,
    Gemini,
}

impl Provider {
    /// Only Claude drives the iterative tool-use loop; the other providers
    /// are called single-shot.
    pub fn supports_tool_use(&self) -> bool {
        matches!(self, Provider::Claude)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Claude => "claude",
            Provider::Codex => "codex",
            Provider::Gemini => "gemini",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An ordered context fragment sent with every call in a phase.
///
/// Blocks accumulate monotonically within a phase (instructions, then
/// repository guidelines, then planning insights). A new orchestrator
/// instance for the next phase restarts the list, which is what keeps
/// conversational context from leaking across phases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    pub text: String,
    /// Marked blocks are eligible for backend-side reuse of their processed
    /// form across calls.
    pub cacheable: bool,
}

impl SystemBlock {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: false,
        }
    }

    pub fn cacheable(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            cacheable: true,
        }
    }
}

/// Token usage counters reported by a backend for one call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cache_creation_tokens: u64,
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    /// Tokens charged against the rolling budget window. Cache reads are
    /// reprocessed cheaply by the backend and are not counted.
    pub fn billed(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_creation_tokens
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

/// One piece of message content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    /// The backend asks the caller to run a named tool and return its result.
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    /// The caller's answer to a prior tool request.
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// One entry in the conversation history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
    /// Marks this message as the tail of a cacheable prefix.
    pub cacheable: bool,
}

impl Message {
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentPart::Text { text: text.into() }],
            cacheable: false,
        }
    }

    pub fn assistant(content: Vec<ContentPart>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content,
            cacheable: false,
        }
    }

    pub fn has_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::ToolUse { .. }))
    }

    pub fn has_tool_result(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::ToolResult { .. }))
    }
}

/// A callable tool declared to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// One logical request to a reasoning backend.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub system_blocks: Vec<SystemBlock>,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: u32,
}

/// A backend's answer: content parts plus usage counters when the provider
/// reports them.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: Vec<ContentPart>,
    pub usage: Option<TokenUsage>,
    pub stop_reason: Option<String>,
}

impl CompletionResponse {
    /// Concatenated text content.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for part in &self.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
        out
    }

    /// Tool requests contained in this response, in order.
    pub fn tool_uses(&self) -> Vec<(String, String, serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::ToolUse { id, name, input } => {
                    Some((id.clone(), name.clone(), input.clone()))
                }
                _ => None,
            })
            .collect()
    }

    pub fn requests_tool_use(&self) -> bool {
        self.content
            .iter()
            .any(|p| matches!(p, ContentPart::ToolUse { .. }))
    }
}

/// Abstraction over one reasoning-service call.
///
/// Implementations translate the request into the provider's wire protocol
/// and decode the answer back; the engine never sees provider payloads.
#[async_trait]
pub trait ReasoningBackend: Send + Sync {
    fn provider(&self) -> Provider;

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse>;
}

/// Executes a named tool on behalf of the backend during the iterative loop.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, name: &str, input: &serde_json::Value) -> Result<String>;
}

/// The configured backends, keyed by provider.
#[derive(Default)]
pub struct BackendRegistry {
    backends: std::collections::HashMap<Provider, std::sync::Arc<dyn ReasoningBackend>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, backend: std::sync::Arc<dyn ReasoningBackend>) -> Self {
        self.backends.insert(backend.provider(), backend);
        self
    }

    /// # Errors
    /// Fails when no backend was registered for the provider.
    pub fn get(&self, provider: Provider) -> Result<std::sync::Arc<dyn ReasoningBackend>> {
        self.backends
            .get(&provider)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no backend registered for provider {provider}"))
    }
}
