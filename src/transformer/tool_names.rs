//! Tool-name shortening for backends with a name-length ceiling.
//!
//! The map is a pure function of the request's tool names, so the response
//! path can rebuild it from the original request and restore every name
//! before the caller sees it.

use super::UnifiedRequest;
use std::collections::{HashMap, HashSet};

/// Maximum tool-name length accepted by Codex.
pub const TOOL_NAME_LIMIT: usize = 64;

const MCP_PREFIX: &str = "mcp__";

/// Bidirectional original <-> shortened tool-name mapping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolNameMap {
    to_short: HashMap<String, String>,
    to_original: HashMap<String, String>,
}

impl ToolNameMap {
    /// Build the mapping for `names` under `limit`.
    ///
    /// Names already within the limit are reserved first and never change.
    /// Longer names are shortened in first-seen order; collisions get `~1`,
    /// `~2`, ... with the base truncated so the result still fits.
    pub fn build<'a>(names: impl IntoIterator<Item = &'a str>, limit: usize) -> Self {
        let mut unique: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        for name in names {
            if seen.insert(name) {
                unique.push(name);
            }
        }

        let mut used: HashSet<String> = unique
            .iter()
            .filter(|n| n.chars().count() <= limit)
            .map(|n| n.to_string())
            .collect();

        let mut map = ToolNameMap::default();
        for name in unique.iter().filter(|n| n.chars().count() > limit) {
            let base = shorten_name(name, limit);
            let mut candidate = base.clone();
            let mut n = 1;
            while used.contains(&candidate) {
                let suffix = format!("~{}", n);
                candidate = format!(
                    "{}{}",
                    truncate_chars(&base, limit.saturating_sub(suffix.len())),
                    suffix
                );
                n += 1;
            }
            used.insert(candidate.clone());
            map.to_short.insert(name.to_string(), candidate.clone());
            map.to_original.insert(candidate, name.to_string());
        }
        map
    }

    /// Build from every tool name a request mentions: declarations and
    /// tool calls already present in the conversation history.
    pub fn for_request(request: &UnifiedRequest, limit: usize) -> Self {
        let declared = request.tools.iter().map(|t| t.name.as_str());
        let called = request
            .messages
            .iter()
            .flat_map(|m| m.tool_uses().map(|(_, name, _)| name));
        Self::build(declared.chain(called), limit)
    }

    pub fn is_empty(&self) -> bool {
        self.to_short.is_empty()
    }

    pub fn shorten<'a>(&'a self, name: &'a str) -> &'a str {
        self.to_short.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn restore<'a>(&'a self, name: &'a str) -> &'a str {
        self.to_original.get(name).map(String::as_str).unwrap_or(name)
    }

    /// Shortened name -> original, for names that changed.
    pub fn restore_map(&self) -> HashMap<String, String> {
        self.to_original.clone()
    }

    /// Rewrite every tool name in a request to its short form.
    pub fn apply(&self, request: &mut UnifiedRequest) {
        if self.is_empty() {
            return;
        }
        for tool in &mut request.tools {
            tool.name = self.shorten(&tool.name).to_string();
        }
        if let Some(super::ToolChoice::Tool(name)) = &mut request.tool_choice {
            *name = self.shorten(name).to_string();
        }
        for message in &mut request.messages {
            for content in &mut message.content {
                if let super::UnifiedContent::ToolUse { name, .. } = content {
                    *name = self.shorten(name).to_string();
                }
            }
        }
    }
}

/// Shorten a single name without collision handling.
pub fn shorten_name(name: &str, limit: usize) -> String {
    if name.chars().count() <= limit {
        return name.to_string();
    }
    if name.starts_with(MCP_PREFIX) {
        if let Some(idx) = name.rfind("__") {
            if idx >= MCP_PREFIX.len() {
                let candidate = format!("{}{}", MCP_PREFIX, &name[idx + 2..]);
                return truncate_chars(&candidate, limit);
            }
        }
    }
    truncate_chars(name, limit)
}

fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
