use super::*;
use crate::reasoning::{Message, SystemBlock, ToolDefinition};
use serde_json::json;

fn request_with(messages: Vec<Message>, tools: Vec<ToolDefinition>) -> CompletionRequest {
    CompletionRequest {
        system_blocks: vec![
            SystemBlock::new("instructions"),
            SystemBlock::cacheable("repository guidelines"),
        ],
        messages,
        tools,
        max_tokens: 1024,
    }
}

#[test]
fn claude_request_carries_cache_control_on_cacheable_blocks() {
    let request = request_with(vec![Message::user_text("hello")], Vec::new());
    let body = encode_claude_request("claude-sonnet", &request);

    let system = body["system"].as_array().unwrap();
    assert!(system[0].get("cache_control").is_none());
    assert_eq!(system[1]["cache_control"]["type"], "ephemeral");
    assert!(body.get("tools").is_none());
}

#[test]
fn claude_request_declares_tools() {
    let tools = vec![ToolDefinition {
        name: "read_file".to_string(),
        description: "read one file".to_string(),
        input_schema: json!({"type": "object"}),
    }];
    let request = request_with(vec![Message::user_text("hello")], tools);
    let body = encode_claude_request("claude-sonnet", &request);
    assert_eq!(body["tools"][0]["name"], "read_file");
}

#[test]
fn claude_cacheable_message_marks_last_part() {
    let mut message = Message::user_text("hello");
    message.cacheable = true;
    let request = request_with(vec![message], Vec::new());
    let body = encode_claude_request("claude-sonnet", &request);
    let parts = body["messages"][0]["content"].as_array().unwrap();
    assert_eq!(
        parts.last().unwrap()["cache_control"]["type"],
        "ephemeral"
    );
}

#[test]
fn decode_claude_text_and_usage() {
    let payload = json!({
        "content": [{"type": "text", "text": "the plan"}],
        "stop_reason": "end_turn",
        "usage": {
            "input_tokens": 1200,
            "output_tokens": 300,
            "cache_creation_input_tokens": 400,
            "cache_read_input_tokens": 5000,
        }
    });
    let response = decode_claude_response(&payload).unwrap();
    assert_eq!(response.text(), "the plan");
    assert_eq!(response.stop_reason.as_deref(), Some("end_turn"));

    let usage = response.usage.unwrap();
    assert_eq!(usage.input_tokens, 1200);
    assert_eq!(usage.cache_read_tokens, 5000);
    // Cache reads are not billed against the window.
    assert_eq!(usage.billed(), 1900);
}

#[test]
fn decode_claude_tool_use() {
    let payload = json!({
        "content": [
            {"type": "text", "text": "let me look"},
            {"type": "tool_use", "id": "toolu_1", "name": "read_file",
             "input": {"path": "src/main.ts"}},
        ],
        "stop_reason": "tool_use",
    });
    let response = decode_claude_response(&payload).unwrap();
    assert!(response.requests_tool_use());
    let uses = response.tool_uses();
    assert_eq!(uses.len(), 1);
    assert_eq!(uses[0].1, "read_file");
    assert_eq!(uses[0].2["path"], "src/main.ts");
}

#[test]
fn decode_claude_rejects_missing_content() {
    let payload = json!({"error": {"message": "bad request"}});
    assert!(decode_claude_response(&payload).is_err());
}

#[test]
fn decode_codex_text_and_usage() {
    let payload = json!({
        "choices": [{
            "message": {"role": "assistant", "content": "generated code"},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 900, "completion_tokens": 150},
    });
    let response = decode_codex_response(&payload).unwrap();
    assert_eq!(response.text(), "generated code");
    assert_eq!(response.usage.unwrap().billed(), 1050);
}

#[test]
fn decode_gemini_joins_parts() {
    let payload = json!({
        "candidates": [{
            "content": {"parts": [{"text": "part one"}, {"text": "part two"}]},
        }],
        "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5},
    });
    let response = decode_gemini_response(&payload).unwrap();
    assert_eq!(response.text(), "part one\npart two");
    assert_eq!(response.usage.unwrap().input_tokens, 10);
}
