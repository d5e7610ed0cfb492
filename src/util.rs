//! Small shared helpers.

/// Truncates text for logs and diagnostics, respecting char boundaries.
pub(crate) fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let cut = text
        .char_indices()
        .take_while(|(i, _)| *i < max)
        .last()
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(0);
    format!("{}... [truncated]", text.get(..cut).unwrap_or(""))
}
