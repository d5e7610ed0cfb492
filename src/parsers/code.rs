//! Generated-code extraction.
//!
//! The implementation call is asked for exactly one JSON object (files,
//! commit message, PR title/description). Models wrap it in prose or fences
//! often enough that extraction tries, in order: direct parse, fenced-block
//! extraction, balanced-brace scan, first-to-last-brace slice. The single
//! "JSON only" retry on total failure is driven by the implementation phase,
//! not here.

use crate::workflow::plan::GeneratedCode;
use regex::Regex;
use std::fmt;
use std::sync::OnceLock;

/// All fallbacks failed. Carries enough diagnostics to explain truncated or
/// malformed output without re-reading the raw text.
#[derive(Debug, Clone)]
pub struct CodeParseError {
    pub response_length: usize,
    pub open_braces: usize,
    pub close_braces: usize,
    pub has_files_marker: bool,
    pub has_commit_marker: bool,
    pub detail: String,
}

impl CodeParseError {
    fn from_text(text: &str, detail: String) -> Self {
        Self {
            response_length: text.len(),
            open_braces: text.matches('{').count(),
            close_braces: text.matches('}').count(),
            has_files_marker: text.contains("\"files\""),
            has_commit_marker: text.contains("\"commitMessage\""),
            detail,
        }
    }

    pub fn brace_balance(&self) -> i64 {
        self.open_braces as i64 - self.close_braces as i64
    }
}

impl fmt::Display for CodeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not extract generated code: {} (response {} bytes, braces {}/{}, \
             files marker: {}, commit marker: {})",
            self.detail,
            self.response_length,
            self.open_braces,
            self.close_braces,
            self.has_files_marker,
            self.has_commit_marker,
        )
    }
}

impl std::error::Error for CodeParseError {}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json)?\s*\n(.*?)```").expect("fence regex is valid")
    })
}

/// Extracts a [`GeneratedCode`] object from implementation-call output.
pub fn parse_generated_code(text: &str) -> Result<GeneratedCode, CodeParseError> {
    // 1. The whole response is the object.
    if let Ok(code) = serde_json::from_str::<GeneratedCode>(text.trim()) {
        return Ok(code);
    }

    // 2. A fenced block holds the object.
    if let Some(captures) = fence_regex().captures(text) {
        if let Some(block) = captures.get(1) {
            if let Ok(code) = serde_json::from_str::<GeneratedCode>(block.as_str().trim()) {
                return Ok(code);
            }
        }
    }

    // 3. Scan for the first balanced top-level object.
    if let Some(candidate) = balanced_object(text) {
        if let Ok(code) = serde_json::from_str::<GeneratedCode>(candidate) {
            return Ok(code);
        }
    }

    // 4. Everything between the first and last brace.
    if let (Some(first), Some(last)) = (text.find('{'), text.rfind('}')) {
        if first < last {
            if let Some(slice) = text.get(first..=last) {
                match serde_json::from_str::<GeneratedCode>(slice) {
                    Ok(code) => return Ok(code),
                    Err(e) => {
                        return Err(CodeParseError::from_text(
                            text,
                            format!("all extraction strategies failed, last error: {e}"),
                        ))
                    }
                }
            }
        }
    }

    Err(CodeParseError::from_text(
        text,
        "no JSON object found in response".to_string(),
    ))
}

/// Returns the first balanced `{...}` region, honoring JSON string and
/// escape rules so braces inside file content do not end the scan early.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text.char_indices().skip_while(|(i, _)| *i < start) {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return text.get(start..=offset);
                }
            }
            _ => {}
        }
    }
    None
}

/// Appended to the implementation prompt for the one retry after a parse
/// failure.
pub const JSON_ONLY_INSTRUCTION: &str = "\
Respond with ONLY the JSON object. No prose, no markdown fences, no \
explanation before or after. Start your response with '{' and end it \
with '}'.";

#[cfg(test)]
#[path = "tests/code_tests.rs"]
mod tests;
