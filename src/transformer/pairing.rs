//! Tool call / tool result pairing.
//!
//! Backends reject transcripts where a tool result is not directly preceded
//! by the call it answers. Clients are less strict, so every request is
//! normalized before it is encoded for a backend.

use super::{Role, UnifiedContent, UnifiedMessage};
use crate::core::get_metrics;
use std::collections::{HashMap, HashSet};

/// Regroup tool results directly after the assistant turn that issued the calls.
///
/// - Results follow their calls in call order, in one `Role::Tool` message.
/// - Results with no preceding call, and repeated results, are dropped.
/// - Calls that never receive a result are dropped; a turn left empty is removed.
pub fn pair_tool_calls(messages: Vec<UnifiedMessage>) -> Vec<UnifiedMessage> {
    let results = collect_results(&messages);

    let mut output = Vec::with_capacity(messages.len());
    let mut emitted: HashSet<String> = HashSet::new();

    for message in messages {
        let UnifiedMessage { role, content } = message;

        if role == Role::Assistant {
            let mut kept = Vec::with_capacity(content.len());
            let mut paired = Vec::new();
            for block in content {
                match block {
                    UnifiedContent::ToolUse { ref id, ref name, .. } => {
                        if emitted.contains(id) {
                            drop_item("call", id, name);
                            continue;
                        }
                        match results.get(id) {
                            Some(result) => {
                                emitted.insert(id.clone());
                                paired.push(result.clone());
                                kept.push(block);
                            }
                            None => drop_item("call", id, name),
                        }
                    }
                    UnifiedContent::ToolResult { .. } => {}
                    other => kept.push(other),
                }
            }
            if !kept.is_empty() {
                output.push(UnifiedMessage::with_content(Role::Assistant, kept));
            }
            if !paired.is_empty() {
                output.push(UnifiedMessage::with_content(Role::Tool, paired));
            }
            continue;
        }

        let remaining: Vec<UnifiedContent> = content
            .into_iter()
            .filter(|c| !matches!(c, UnifiedContent::ToolResult { .. }))
            .collect();
        if !remaining.is_empty() {
            let role = if role == Role::Tool { Role::User } else { role };
            output.push(UnifiedMessage::with_content(role, remaining));
        }
    }

    output
}

/// First result for every call id that was issued before it.
fn collect_results(messages: &[UnifiedMessage]) -> HashMap<String, UnifiedContent> {
    let mut issued: HashSet<&str> = HashSet::new();
    let mut results = HashMap::new();

    for message in messages {
        for block in &message.content {
            match block {
                UnifiedContent::ToolUse { id, .. } if message.role == Role::Assistant => {
                    issued.insert(id);
                }
                UnifiedContent::ToolResult { tool_use_id, .. } => {
                    if !issued.contains(tool_use_id.as_str()) {
                        drop_item("result", tool_use_id, "orphan");
                    } else if results.contains_key(tool_use_id) {
                        drop_item("result", tool_use_id, "duplicate");
                    } else {
                        results.insert(tool_use_id.clone(), block.clone());
                    }
                }
                _ => {}
            }
        }
    }
    results
}

fn drop_item(kind: &str, id: &str, detail: &str) {
    tracing::warn!(kind, tool_call_id = %id, detail, "Dropping unpaired tool item");
    get_metrics()
        .dropped_tool_items
        .with_label_values(&[kind])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn call(id: &str) -> UnifiedContent {
        UnifiedContent::tool_use(id, "lookup", json!({}))
    }

    fn result(id: &str) -> UnifiedContent {
        UnifiedContent::tool_result(id, json!(format!("result {}", id)), false)
    }

    #[test]
    fn test_results_regrouped_in_call_order() {
        let messages = vec![
            UnifiedMessage::user("go"),
            UnifiedMessage::with_content(Role::Assistant, vec![call("a"), call("b")]),
            UnifiedMessage::with_content(Role::Tool, vec![result("b")]),
            UnifiedMessage::with_content(Role::Tool, vec![result("a")]),
        ];
        let paired = pair_tool_calls(messages);
        assert_eq!(paired.len(), 3);
        assert_eq!(paired[2].role, Role::Tool);
        assert_eq!(paired[2].content, vec![result("a"), result("b")]);
    }

    #[test]
    fn test_orphan_and_duplicate_results_dropped() {
        let messages = vec![
            UnifiedMessage::with_content(Role::User, vec![result("ghost")]),
            UnifiedMessage::with_content(Role::Assistant, vec![call("a")]),
            UnifiedMessage::with_content(Role::User, vec![result("a"), result("a")]),
        ];
        let paired = pair_tool_calls(messages);
        assert_eq!(paired.len(), 2);
        assert_eq!(paired[0].role, Role::Assistant);
        assert_eq!(paired[1].content, vec![result("a")]);
    }

    #[test]
    fn test_unanswered_call_dropped_and_empty_turn_removed() {
        let messages = vec![
            UnifiedMessage::user("go"),
            UnifiedMessage::with_content(Role::Assistant, vec![call("lost")]),
            UnifiedMessage::user("next"),
        ];
        let paired = pair_tool_calls(messages);
        assert_eq!(
            paired,
            vec![UnifiedMessage::user("go"), UnifiedMessage::user("next")]
        );
    }

    #[test]
    fn test_text_alongside_results_is_kept() {
        let messages = vec![
            UnifiedMessage::with_content(
                Role::Assistant,
                vec![UnifiedContent::text("checking"), call("a")],
            ),
            UnifiedMessage::with_content(
                Role::User,
                vec![result("a"), UnifiedContent::text("thanks")],
            ),
        ];
        let paired = pair_tool_calls(messages);
        assert_eq!(paired.len(), 3);
        assert_eq!(paired[2], UnifiedMessage::user("thanks"));
    }
}
