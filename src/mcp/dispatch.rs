//! MCP `tools/call` dispatcher — routes tool invocations to the handlers in
//! `mcp::tools::research`.
//!
//! Two failure channels, per the MCP convention:
//! - protocol-level problems (unknown tool, bad arguments, no credential on
//!   the session) surface as JSON-RPC errors via `classify_error`;
//! - tool-execution failures (backend errors) come back as a successful
//!   `tools/call` response whose result carries `isError: true`, so the
//!   calling agent sees the provider's own message as tool output.

use crate::identity::AuthedUser;
use crate::AppContext;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::tools as tool_list;
use super::transport::{
    tool_result, McpError, MCP_INTERNAL_ERROR, MCP_INVALID_PARAMS, MCP_UNAUTHORIZED,
};

pub struct McpDispatcher {
    ctx: Arc<AppContext>,
}

impl McpDispatcher {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self { ctx }
    }

    /// Dispatch a `tools/call` invocation.
    ///
    /// `tool_name`  — the `name` field from the `tools/call` params.
    /// `arguments`  — the `arguments` object from the `tools/call` params.
    /// `user`       — the session's registered credential, already resolved;
    ///                `None` means `research.authenticate` was never called.
    ///
    /// Returns `Ok(Value)` with the MCP tool result, or `Err(anyhow::Error)`
    /// whose message encodes an MCP error code (e.g. `"MCP_INVALID_PARAMS:
    /// ..."`) so the transport loop can map it.
    pub async fn dispatch(
        &self,
        tool_name: &str,
        arguments: Value,
        user: Option<&AuthedUser>,
    ) -> anyhow::Result<Value> {
        // Verify the tool is in our catalogue first.
        let known = tool_list::researchd_tools()
            .into_iter()
            .any(|t| t.name == tool_name);
        if !known {
            warn!(tool = tool_name, "MCP unknown tool");
            return Err(anyhow::anyhow!("MCP_INVALID_PARAMS: unknown tool: {tool_name}"));
        }

        // Every research tool needs a resolved identity and credential.
        let user = user.ok_or_else(|| {
            anyhow::anyhow!(
                "MCP_UNAUTHORIZED: no backend credential registered — call research.authenticate first"
            )
        })?;

        let outcome = match tool_name {
            "start_deep_research" => {
                super::tools::research::start_deep_research(&self.ctx, user, arguments).await
            }
            "check_deep_research" => {
                super::tools::research::check_deep_research(&self.ctx, user, arguments).await
            }
            "list_research_tasks" => {
                super::tools::research::list_research_tasks(&self.ctx, user, arguments).await
            }
            other => {
                // Should not reach here — already checked above.
                return Err(anyhow::anyhow!("MCP_INVALID_PARAMS: unknown tool: {other}"));
            }
        };

        match outcome {
            Ok(payload) => {
                info!(tool = tool_name, owner = %user.owner_id, "MCP tool executed");
                Ok(tool_result(&payload, false))
            }
            Err(e) if e.to_string().starts_with("MCP_") => Err(e),
            Err(e) => {
                // Backend or storage failure: caught at the operation
                // boundary and returned as a structured error result, with
                // the originating message intact.
                warn!(tool = tool_name, err = %format!("{e:#}"), "MCP tool failed");
                Ok(tool_result(
                    &json!({ "error": format!("{e:#}") }),
                    true,
                ))
            }
        }
    }

    /// Convert an `anyhow::Error` returned from `dispatch` into a `McpError`
    /// with the correct code. Helper for the message loop.
    pub fn classify_error(err: &anyhow::Error) -> McpError {
        let msg = err.to_string();
        if let Some(detail) = msg.strip_prefix("MCP_INVALID_PARAMS:") {
            McpError::new(MCP_INVALID_PARAMS, detail.trim())
        } else if let Some(detail) = msg.strip_prefix("MCP_UNAUTHORIZED:") {
            McpError::new(MCP_UNAUTHORIZED, detail.trim())
        } else {
            McpError::new(MCP_INTERNAL_ERROR, "internal error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_prefixes_to_codes() {
        let e = anyhow::anyhow!("MCP_INVALID_PARAMS: missing required field 'query'");
        assert_eq!(McpDispatcher::classify_error(&e).code, MCP_INVALID_PARAMS);

        let e = anyhow::anyhow!("MCP_UNAUTHORIZED: no backend credential registered");
        assert_eq!(McpDispatcher::classify_error(&e).code, MCP_UNAUTHORIZED);

        let e = anyhow::anyhow!("disk on fire");
        assert_eq!(McpDispatcher::classify_error(&e).code, MCP_INTERNAL_ERROR);
    }
}
