//! Conversation pruning for long tool-use loops.

use super::Message;

/// Prunes `messages` in place once it exceeds `threshold` entries.
///
/// Keeps the first message (the original task) plus the `keep_recent` most
/// recent entries. A tool-result message is never separated from the
/// tool-use message that requested it: if the cut would land on a result,
/// one extra earlier message is kept.
///
/// Idempotent: histories at or under the threshold are untouched.
pub fn prune_history(messages: &mut Vec<Message>, threshold: usize, keep_recent: usize) {
    if messages.len() <= threshold {
        return;
    }

    let mut cut = messages.len().saturating_sub(keep_recent);
    if cut <= 1 {
        return;
    }

    if messages[cut].has_tool_result() {
        cut -= 1;
    }
    if cut <= 1 {
        return;
    }

    let dropped = cut - 1;
    messages.drain(1..cut);
    tracing::debug!(
        dropped,
        kept = messages.len(),
        "pruned conversation history"
    );
}

#[cfg(test)]
#[path = "tests/history_tests.rs"]
mod tests;
