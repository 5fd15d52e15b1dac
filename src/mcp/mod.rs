//! Model Context Protocol (MCP) surface for `researchd`.
//!
//! `researchd` is an MCP server: it exposes the deep-research tools to MCP
//! clients via `tools/list` and `tools/call` over the WebSocket JSON-RPC
//! session managed by `ipc`.
//!
//! ## Protocol version
//! MCP 2024-11-05.
//!
//! ## Submodules
//!
//! | Module | Role |
//! |--------|------|
//! | `transport` | lifecycle handlers (`initialize`, `ping`), error codes, tool-result shaping |
//! | `tools` | `tools/list` response — the 3 researchd tool definitions |
//! | `dispatch` | `tools/call` dispatcher — routes to `tools::research` |
//! | `tools::research` | start_deep_research, check_deep_research, list_research_tasks |

pub mod dispatch;
pub mod tools;
pub mod transport;

// ─── Flat re-exports ──────────────────────────────────────────────────────────

pub use transport::{
    handle_initialize, handle_ping, tool_result, McpError, MCP_INTERNAL_ERROR,
    MCP_INVALID_PARAMS, MCP_INVALID_REQUEST, MCP_METHOD_NOT_FOUND, MCP_PARSE_ERROR,
    MCP_PROTOCOL_VERSION, MCP_UNAUTHORIZED,
};

pub use tools::{handle_tools_list, researchd_tools, McpToolDef};

pub use dispatch::McpDispatcher;
