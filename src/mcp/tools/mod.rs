//! MCP `tools/list` handler — exposes the deep-research tools as MCP tool
//! definitions.
//!
//! Each tool definition follows the JSON Schema convention for `inputSchema`.
//! Agents call `tools/list` to discover available tools, then invoke them via
//! `tools/call` (dispatched by `mcp::dispatch`).

pub mod research;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::research::{INITIAL_WAIT_SECS, MIN_CHECK_INTERVAL_SECS};

// ─── Tool definition type ─────────────────────────────────────────────────────

/// A single MCP tool definition, as returned in `tools/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpToolDef {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

impl McpToolDef {
    fn new(name: &str, description: &str, input_schema: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

// ─── Tool catalogue ───────────────────────────────────────────────────────────

/// Returns all researchd tools available via MCP.
///
/// Defined as a function (not a static) because `serde_json::json!` produces
/// a non-`const` `Value`. The list is small and cheap to allocate.
pub fn researchd_tools() -> Vec<McpToolDef> {
    vec![
        // ── start_deep_research ───────────────────────────────────────────────
        McpToolDef::new(
            "start_deep_research",
            "Start a deep research task in the background. Research takes 5-15 minutes; \
             poll with check_deep_research after the indicated wait.",
            json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": {
                        "type": "string",
                        "description": "The research question or topic."
                    },
                    "previous_interaction_id": {
                        "type": "string",
                        "description": "Chain this research onto a prior interaction's context."
                    }
                },
                "additionalProperties": false
            }),
        ),
        // ── check_deep_research ───────────────────────────────────────────────
        McpToolDef::new(
            "check_deep_research",
            &format!(
                "Check the status of a research task. The first check is allowed {INITIAL_WAIT_SECS}s \
                 after start, later checks every {MIN_CHECK_INTERVAL_SECS}s; a premature check returns \
                 how long to wait."
            ),
            json!({
                "type": "object",
                "required": ["interaction_id"],
                "properties": {
                    "interaction_id": {
                        "type": "string",
                        "description": "Id returned by start_deep_research."
                    }
                },
                "additionalProperties": false
            }),
        ),
        // ── list_research_tasks ───────────────────────────────────────────────
        McpToolDef::new(
            "list_research_tasks",
            "List your research tasks, most recent first, with status and elapsed time.",
            json!({
                "type": "object",
                "properties": {},
                "additionalProperties": false
            }),
        ),
    ]
}

// ─── tools/list handler ───────────────────────────────────────────────────────

/// Handle an MCP `tools/list` request.
///
/// Returns `{"tools": [...]}` as a `serde_json::Value` ready to embed in the
/// JSON-RPC response frame.
pub fn handle_tools_list() -> Value {
    let tools = researchd_tools();
    json!({ "tools": tools })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_names_are_unique_and_expected() {
        let tools = researchd_tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "start_deep_research",
                "check_deep_research",
                "list_research_tasks"
            ]
        );
    }

    #[test]
    fn every_tool_has_an_object_schema() {
        for tool in researchd_tools() {
            assert_eq!(tool.input_schema["type"], "object", "tool {}", tool.name);
        }
    }
}
