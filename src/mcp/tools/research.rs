//! MCP tool handlers for the deep-research lifecycle.
//!
//! Covers: start_deep_research, check_deep_research, list_research_tasks.
//! Every handler receives the caller's resolved identity explicitly — there
//! is no ambient current-user state to consult.

use crate::identity::AuthedUser;
use crate::research::{CheckResult, INITIAL_WAIT_SECS, MIN_CHECK_INTERVAL_SECS};
use crate::AppContext;
use anyhow::Result;
use serde_json::{json, Value};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn str_arg<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("MCP_INVALID_PARAMS: missing required field '{}'", key))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(|v| v.as_str())
}

// ─── start_deep_research ─────────────────────────────────────────────────────

/// MCP `start_deep_research` handler.
///
/// Required: `query`. Optional: `previous_interaction_id`.
///
/// Returns `{"interaction_id", "status", "wait_before_first_check_seconds"}`.
pub async fn start_deep_research(
    ctx: &AppContext,
    user: &AuthedUser,
    args: Value,
) -> Result<Value> {
    let query = str_arg(&args, "query")?;
    if query.trim().is_empty() {
        anyhow::bail!("MCP_INVALID_PARAMS: 'query' must not be empty");
    }
    let previous = opt_str(&args, "previous_interaction_id");

    let task = ctx
        .governor
        .create_task(&user.owner_id, &user.credential, query, previous)
        .await?;

    Ok(json!({
        "interaction_id": task.interaction_id,
        "status": task.status.as_str(),
        "wait_before_first_check_seconds": INITIAL_WAIT_SECS,
    }))
}

// ─── check_deep_research ─────────────────────────────────────────────────────

/// MCP `check_deep_research` handler.
///
/// Required: `interaction_id`.
///
/// Every [`CheckResult`] variant — including the deferred ones — is a normal
/// payload with a `status` discriminant; only backend failures become error
/// results.
pub async fn check_deep_research(
    ctx: &AppContext,
    user: &AuthedUser,
    args: Value,
) -> Result<Value> {
    let interaction_id = str_arg(&args, "interaction_id")?;

    let outcome = ctx
        .governor
        .check_task(&user.owner_id, &user.credential, interaction_id)
        .await?;

    Ok(check_result_payload(interaction_id, &outcome))
}

fn check_result_payload(interaction_id: &str, outcome: &CheckResult) -> Value {
    match outcome {
        CheckResult::NotFound => json!({
            "status": "not_found",
            "interaction_id": interaction_id,
            "message": "No research task with this id belongs to you.",
        }),
        CheckResult::TooEarly { wait_seconds } => json!({
            "status": "too_early",
            "interaction_id": interaction_id,
            "wait_seconds": wait_seconds,
            "message": format!(
                "Research just started — check again in {wait_seconds}s."
            ),
        }),
        CheckResult::RateLimited { wait_seconds } => json!({
            "status": "rate_limited",
            "interaction_id": interaction_id,
            "wait_seconds": wait_seconds,
            "message": format!("Checked recently — check again in {wait_seconds}s."),
        }),
        CheckResult::InProgress { elapsed_seconds } => json!({
            "status": "in_progress",
            "interaction_id": interaction_id,
            "elapsed_seconds": elapsed_seconds,
            "next_check_seconds": MIN_CHECK_INTERVAL_SECS,
        }),
        CheckResult::Completed {
            elapsed_seconds,
            result,
        } => json!({
            "status": "completed",
            "interaction_id": interaction_id,
            "elapsed_seconds": elapsed_seconds,
            "result": result,
        }),
        CheckResult::Failed {
            elapsed_seconds,
            error,
        } => json!({
            "status": "failed",
            "interaction_id": interaction_id,
            "elapsed_seconds": elapsed_seconds,
            "error": error,
        }),
    }
}

// ─── list_research_tasks ─────────────────────────────────────────────────────

/// MCP `list_research_tasks` handler. Takes no arguments.
///
/// Returns `{"task_count", "tasks": [...]}`, most recently started first.
pub async fn list_research_tasks(
    ctx: &AppContext,
    user: &AuthedUser,
    _args: Value,
) -> Result<Value> {
    let tasks = ctx.governor.list_tasks(&user.owner_id).await?;
    Ok(json!({
        "task_count": tasks.len(),
        "tasks": tasks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_payloads_carry_status_discriminant() {
        let p = check_result_payload("int-1", &CheckResult::TooEarly { wait_seconds: 42 });
        assert_eq!(p["status"], "too_early");
        assert_eq!(p["wait_seconds"], 42);

        let p = check_result_payload(
            "int-1",
            &CheckResult::Completed {
                elapsed_seconds: 300,
                result: "findings".into(),
            },
        );
        assert_eq!(p["status"], "completed");
        assert_eq!(p["result"], "findings");
    }

    #[test]
    fn missing_required_arg_is_invalid_params() {
        let err = str_arg(&json!({}), "query").unwrap_err();
        assert!(err.to_string().starts_with("MCP_INVALID_PARAMS:"));
    }
}
