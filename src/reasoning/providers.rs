//! Reasoning-backend providers.
//!
//! Each provider translates the engine's call shape into its own wire
//! protocol. Decoding is kept in pure functions over `serde_json::Value` so
//! the translation is testable without HTTP.

use super::{
    CompletionRequest, CompletionResponse, ContentPart, MessageRole, Provider, ReasoningBackend,
    TokenUsage,
};
use crate::error::RateLimited;
use crate::util::truncate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};

const CLAUDE_API_VERSION: &str = "2023-06-01";

/// The tool-use-capable provider; the only one driven iteratively.
pub struct ClaudeBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl ClaudeBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url("https://api.anthropic.com", api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ReasoningBackend for ClaudeBackend {
    fn provider(&self) -> Provider {
        Provider::Claude
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = encode_claude_request(&self.model, &request);
        let response = self
            .http
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", CLAUDE_API_VERSION)
            .json(&body)
            .send()
            .await
            .context("Failed to reach reasoning backend")?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .context("Failed to read backend response body")?;

        if status.as_u16() == 429 || status.as_u16() == 529 {
            return Err(RateLimited::new(format!("backend returned {status}")).into());
        }
        if !status.is_success() {
            anyhow::bail!(
                "backend call failed with {}: {}",
                status,
                truncate(&payload.to_string(), 500)
            );
        }

        decode_claude_response(&payload)
    }
}

fn encode_claude_request(model: &str, request: &CompletionRequest) -> Value {
    let system: Vec<Value> = request
        .system_blocks
        .iter()
        .map(|block| {
            let mut entry = json!({"type": "text", "text": block.text});
            if block.cacheable {
                entry["cache_control"] = json!({"type": "ephemeral"});
            }
            entry
        })
        .collect();

    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::User => "user",
                MessageRole::Assistant => "assistant",
            };
            let mut parts: Vec<Value> = message
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => json!({"type": "text", "text": text}),
                    ContentPart::ToolUse { id, name, input } => {
                        json!({"type": "tool_use", "id": id, "name": name, "input": input})
                    }
                    ContentPart::ToolResult {
                        tool_use_id,
                        content,
                        is_error,
                    } => json!({
                        "type": "tool_result",
                        "tool_use_id": tool_use_id,
                        "content": content,
                        "is_error": is_error,
                    }),
                })
                .collect();
            if message.cacheable {
                if let Some(last) = parts.last_mut() {
                    last["cache_control"] = json!({"type": "ephemeral"});
                }
            }
            json!({"role": role, "content": parts})
        })
        .collect();

    let mut body = json!({
        "model": model,
        "max_tokens": request.max_tokens,
        "system": system,
        "messages": messages,
    });
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.input_schema,
                })
            })
            .collect();
        body["tools"] = json!(tools);
    }
    body
}

/// Decodes a Claude messages-API payload into the engine's response shape.
pub(crate) fn decode_claude_response(payload: &Value) -> Result<CompletionResponse> {
    let mut content = Vec::new();
    let blocks = payload
        .get("content")
        .and_then(|c| c.as_array())
        .context("backend response missing content array")?;

    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    content.push(ContentPart::Text {
                        text: text.to_string(),
                    });
                }
            }
            Some("tool_use") => {
                let id = block
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let name = block
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let input = block.get("input").cloned().unwrap_or(Value::Null);
                content.push(ContentPart::ToolUse { id, name, input });
            }
            _ => {}
        }
    }

    let usage = payload.get("usage").map(decode_claude_usage);
    let stop_reason = payload
        .get("stop_reason")
        .and_then(|s| s.as_str())
        .map(String::from);

    Ok(CompletionResponse {
        content,
        usage,
        stop_reason,
    })
}

fn decode_claude_usage(usage: &Value) -> TokenUsage {
    TokenUsage {
        input_tokens: usage
            .get("input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: usage
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: usage
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_read_tokens: usage
            .get("cache_read_input_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    }
}

/// Single-shot chat-completions provider. Tool declarations are ignored;
/// callers route tool-use work to Claude.
pub struct CodexBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl CodexBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url("https://api.openai.com", api_key, model)
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ReasoningBackend for CodexBackend {
    fn provider(&self) -> Provider {
        Provider::Codex
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let system = flatten_system_blocks(&request);
        let mut messages = vec![json!({"role": "system", "content": system})];
        messages.push(json!({"role": "user", "content": flatten_messages(&request)}));

        let body = json!({
            "model": self.model,
            "messages": messages,
        });
        let response = self
            .http
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Failed to reach reasoning backend")?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .context("Failed to read backend response body")?;

        if status.as_u16() == 429 {
            return Err(RateLimited::new(format!("backend returned {status}")).into());
        }
        if !status.is_success() {
            anyhow::bail!(
                "backend call failed with {}: {}",
                status,
                truncate(&payload.to_string(), 500)
            );
        }

        decode_codex_response(&payload)
    }
}

/// Decodes a chat-completions payload.
pub(crate) fn decode_codex_response(payload: &Value) -> Result<CompletionResponse> {
    let text = payload
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|t| t.as_str())
        .context("backend response missing message content")?
        .to_string();

    let usage = payload.get("usage").map(|u| TokenUsage {
        input_tokens: u
            .get("prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: u
            .get("completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: 0,
    });

    Ok(CompletionResponse {
        content: vec![ContentPart::Text { text }],
        usage,
        stop_reason: payload
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("finish_reason"))
            .and_then(|r| r.as_str())
            .map(String::from),
    })
}

/// Single-shot generateContent provider.
pub struct GeminiBackend {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self::with_base_url(
            "https://generativelanguage.googleapis.com",
            api_key,
            model,
        )
    }

    pub fn with_base_url(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }
}

#[async_trait]
impl ReasoningBackend for GeminiBackend {
    fn provider(&self) -> Provider {
        Provider::Gemini
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse> {
        let body = json!({
            "system_instruction": {"parts": [{"text": flatten_system_blocks(&request)}]},
            "contents": [{"role": "user", "parts": [{"text": flatten_messages(&request)}]}],
        });
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .http
            .post(url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach reasoning backend")?;

        let status = response.status();
        let payload: Value = response
            .json()
            .await
            .context("Failed to read backend response body")?;

        if status.as_u16() == 429 {
            return Err(RateLimited::new(format!("backend returned {status}")).into());
        }
        if !status.is_success() {
            anyhow::bail!(
                "backend call failed with {}: {}",
                status,
                truncate(&payload.to_string(), 500)
            );
        }

        decode_gemini_response(&payload)
    }
}

/// Decodes a generateContent payload.
pub(crate) fn decode_gemini_response(payload: &Value) -> Result<CompletionResponse> {
    let parts = payload
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .context("backend response missing candidate parts")?;

    let text = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect::<Vec<_>>()
        .join("\n");

    let usage = payload.get("usageMetadata").map(|u| TokenUsage {
        input_tokens: u
            .get("promptTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        output_tokens: u
            .get("candidatesTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        cache_creation_tokens: 0,
        cache_read_tokens: u
            .get("cachedContentTokenCount")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
    });

    Ok(CompletionResponse {
        content: vec![ContentPart::Text { text }],
        usage,
        stop_reason: None,
    })
}

fn flatten_system_blocks(request: &CompletionRequest) -> String {
    request
        .system_blocks
        .iter()
        .map(|b| b.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Single-shot providers receive the history flattened to plain text.
fn flatten_messages(request: &CompletionRequest) -> String {
    let mut out = String::new();
    for message in &request.messages {
        for part in &message.content {
            if let ContentPart::Text { text } = part {
                if !out.is_empty() {
                    out.push_str("\n\n");
                }
                out.push_str(text);
            }
        }
    }
    out
}

#[cfg(test)]
#[path = "tests/providers_tests.rs"]
mod tests;
