//! Task poll governor — the rate-limited polling state machine.
//!
//! Remote research jobs take 5–15 minutes, and the typical caller is an
//! agent loop that will happily re-check every few seconds unless told not
//! to. The governor owns that decision: a status check is either answered
//! from the store, deferred with a machine-readable wait hint, or approved —
//! and an approved check advances the persisted gate *before* the backend is
//! contacted, so retries and racing duplicates see the gate already moved.
//!
//! Two timing windows apply, checked in priority order:
//! - first ever check: at least [`INITIAL_WAIT_SECS`] after the task started;
//! - every later check: at least [`MIN_CHECK_INTERVAL_SECS`] after the last
//!   approved one.
//!
//! The gate is advisory, not a mutex: two checks racing on the same task row
//! can both pass before either write lands. Single-key last-write-wins is
//! all the store guarantees, and all this needs.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::identity::OwnerId;
use crate::ipc::event::EventBroadcaster;
use crate::storage::{format_ts, parse_ts, ResearchTaskRow, Storage};

use super::client::ResearchBackend;

/// Seconds a task must age before its first status check is allowed.
/// The very first check is premature by a larger margin than later ones —
/// no deep-research job finishes inside 90 seconds.
pub const INITIAL_WAIT_SECS: i64 = 90;

/// Minimum seconds between approved status checks after the first.
pub const MIN_CHECK_INTERVAL_SECS: i64 = 60;

/// Substituted when the provider reports completion but returns no outputs.
pub const EMPTY_RESULT_PLACEHOLDER: &str = "Research completed but produced no output.";

/// Fallback when the provider reports failure without an error message.
pub const UNKNOWN_ERROR: &str = "Unknown error";

/// Query text is clipped to this many characters in listings.
const QUERY_PREVIEW_CHARS: usize = 100;

// ─── Domain types ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "in_progress" => Some(TaskStatus::InProgress),
            "completed" => Some(TaskStatus::Completed),
            "failed" => Some(TaskStatus::Failed),
            _ => None,
        }
    }
}

/// One tracked research task, as handed back from `create_task`.
#[derive(Debug, Clone)]
pub struct ResearchTask {
    pub interaction_id: String,
    pub query: String,
    pub status: TaskStatus,
    pub started_at: DateTime<Utc>,
}

/// Outcome of a status-check request. Deferred outcomes (`TooEarly`,
/// `RateLimited`) are normal results with a wait hint, not errors.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckResult {
    NotFound,
    TooEarly { wait_seconds: i64 },
    RateLimited { wait_seconds: i64 },
    InProgress { elapsed_seconds: i64 },
    Completed { elapsed_seconds: i64, result: String },
    Failed { elapsed_seconds: i64, error: String },
}

/// Read-only projection of a task for listings.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub interaction_id: String,
    pub query: String,
    pub status: &'static str,
    pub started_at: String,
    pub elapsed_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_preview: Option<String>,
}

// ─── Governor ────────────────────────────────────────────────────────────────

pub struct PollGovernor<B> {
    store: Arc<Storage>,
    backend: Arc<B>,
    broadcaster: Arc<EventBroadcaster>,
    ttl_days: u32,
}

impl<B: ResearchBackend> PollGovernor<B> {
    pub fn new(
        store: Arc<Storage>,
        backend: Arc<B>,
        broadcaster: Arc<EventBroadcaster>,
        ttl_days: u32,
    ) -> Self {
        Self {
            store,
            backend,
            broadcaster,
            ttl_days,
        }
    }

    /// Start a remote interaction and persist its tracking record.
    ///
    /// The backend call comes first: if it fails, the error is surfaced
    /// verbatim and nothing is persisted.
    pub async fn create_task(
        &self,
        owner: &OwnerId,
        credential: &str,
        query: &str,
        previous_interaction_id: Option<&str>,
    ) -> Result<ResearchTask> {
        let interaction = self
            .backend
            .start_interaction(credential, query, previous_interaction_id)
            .await?;

        let now = Utc::now();
        let expires_at = now + Duration::days(i64::from(self.ttl_days));
        self.store
            .insert_task(
                owner.as_str(),
                &interaction.id,
                query,
                &format_ts(now),
                &format_ts(expires_at),
            )
            .await?;

        info!(
            owner = %owner,
            interaction_id = %interaction.id,
            "research task started"
        );

        Ok(ResearchTask {
            interaction_id: interaction.id,
            query: query.to_string(),
            status: TaskStatus::InProgress,
            started_at: now,
        })
    }

    /// Decide whether a status check may run now, and run it if so.
    ///
    /// Terminal tasks are answered straight from the store — their status is
    /// monotonic, so there is nothing left to ask the backend.
    pub async fn check_task(
        &self,
        owner: &OwnerId,
        credential: &str,
        interaction_id: &str,
    ) -> Result<CheckResult> {
        let Some(row) = self.store.get_task(owner.as_str(), interaction_id).await? else {
            return Ok(CheckResult::NotFound);
        };

        let now = Utc::now();
        let started_at = parse_ts(&row.started_at)?;
        let elapsed_seconds = (now - started_at).num_seconds();

        match TaskStatus::parse(&row.status) {
            Some(TaskStatus::Completed) => {
                return Ok(CheckResult::Completed {
                    elapsed_seconds,
                    result: row.result.unwrap_or_else(|| EMPTY_RESULT_PLACEHOLDER.into()),
                });
            }
            Some(TaskStatus::Failed) => {
                return Ok(CheckResult::Failed {
                    elapsed_seconds,
                    error: row.error.unwrap_or_else(|| UNKNOWN_ERROR.into()),
                });
            }
            Some(TaskStatus::InProgress) | None => {}
        }

        // Gate, in priority order: initial wait, then steady-state interval.
        // `elapsed` is floored whole seconds, so `WINDOW - elapsed` equals
        // the ceiling of the real remaining wait.
        match &row.last_checked_at {
            None if elapsed_seconds < INITIAL_WAIT_SECS => {
                return Ok(CheckResult::TooEarly {
                    wait_seconds: INITIAL_WAIT_SECS - elapsed_seconds,
                });
            }
            Some(last) => {
                let since_last = (now - parse_ts(last)?).num_seconds();
                if since_last < MIN_CHECK_INTERVAL_SECS {
                    return Ok(CheckResult::RateLimited {
                        wait_seconds: MIN_CHECK_INTERVAL_SECS - since_last,
                    });
                }
            }
            None => {}
        }

        // Check approved. Advance the gate before contacting the backend so
        // a concurrent or retried check sees it moved; if the backend call
        // then fails, the advance is deliberately not rolled back — losing
        // one legitimate check beats unbounded call frequency under retries.
        self.store
            .touch_last_checked(owner.as_str(), interaction_id, &format_ts(now))
            .await?;

        let interaction = self
            .backend
            .get_interaction(credential, interaction_id)
            .await?;

        match interaction.status.as_deref() {
            Some("completed") => {
                let result = interaction
                    .final_output_text()
                    .unwrap_or(EMPTY_RESULT_PLACEHOLDER)
                    .to_string();
                self.store
                    .complete_task(owner.as_str(), interaction_id, &result)
                    .await?;
                info!(owner = %owner, interaction_id, elapsed_seconds, "research task completed");
                self.broadcaster.broadcast(
                    "research.completed",
                    serde_json::json!({
                        "owner_id": owner.as_str(),
                        "interaction_id": interaction_id,
                        "elapsed_seconds": elapsed_seconds,
                    }),
                );
                Ok(CheckResult::Completed {
                    elapsed_seconds,
                    result,
                })
            }
            Some("failed") => {
                let error = interaction.error.unwrap_or_else(|| UNKNOWN_ERROR.into());
                self.store
                    .fail_task(owner.as_str(), interaction_id, &error)
                    .await?;
                warn!(owner = %owner, interaction_id, elapsed_seconds, error = %error, "research task failed");
                self.broadcaster.broadcast(
                    "research.failed",
                    serde_json::json!({
                        "owner_id": owner.as_str(),
                        "interaction_id": interaction_id,
                        "elapsed_seconds": elapsed_seconds,
                        "error": error,
                    }),
                );
                Ok(CheckResult::Failed {
                    elapsed_seconds,
                    error,
                })
            }
            // Unrecognized or absent status: still running as far as we are
            // concerned. No mutation beyond the gate advance.
            _ => Ok(CheckResult::InProgress { elapsed_seconds }),
        }
    }

    /// Pure read: project every live task of this owner into a summary,
    /// most recently started first. A row that fails to parse is dropped
    /// from the listing, never fatal to it.
    pub async fn list_tasks(&self, owner: &OwnerId) -> Result<Vec<TaskSummary>> {
        let rows = self.store.list_tasks(owner.as_str()).await?;
        let now = Utc::now();

        let summaries = rows
            .into_iter()
            .filter_map(|row| match summarize(&row, now) {
                Some(s) => Some(s),
                None => {
                    warn!(
                        owner = %owner,
                        interaction_id = %row.interaction_id,
                        status = %row.status,
                        "dropping malformed task row from listing"
                    );
                    None
                }
            })
            .collect();

        Ok(summaries)
    }
}

fn summarize(row: &ResearchTaskRow, now: DateTime<Utc>) -> Option<TaskSummary> {
    let status = TaskStatus::parse(&row.status)?;
    let started_at = parse_ts(&row.started_at).ok()?;

    Some(TaskSummary {
        interaction_id: row.interaction_id.clone(),
        query: truncate_query(&row.query),
        status: status.as_str(),
        started_at: row.started_at.clone(),
        elapsed_seconds: (now - started_at).num_seconds(),
        result_preview: row.result.as_ref().map(|r| result_preview(r)),
    })
}

/// First 100 characters plus an ellipsis marker; shorter queries unchanged.
fn truncate_query(query: &str) -> String {
    if query.chars().count() <= QUERY_PREVIEW_CHARS {
        return query.to_string();
    }
    let mut clipped: String = query.chars().take(QUERY_PREVIEW_CHARS).collect();
    clipped.push_str("...");
    clipped
}

/// Length-only placeholder — listings never carry full report text.
fn result_preview(result: &str) -> String {
    format!("[{} chars]", result.chars().count())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_queries_pass_through_untruncated() {
        let q = "a".repeat(50);
        assert_eq!(truncate_query(&q), q);
        let exact = "b".repeat(100);
        assert_eq!(truncate_query(&exact), exact);
    }

    #[test]
    fn long_queries_clip_to_100_chars_plus_ellipsis() {
        let q = "c".repeat(150);
        let clipped = truncate_query(&q);
        assert_eq!(clipped.len(), 103);
        assert!(clipped.starts_with(&"c".repeat(100)));
        assert!(clipped.ends_with("..."));
    }

    #[test]
    fn result_preview_reports_length_only() {
        assert_eq!(result_preview("hello"), "[5 chars]");
    }

    #[test]
    fn unknown_status_strings_do_not_parse() {
        assert!(TaskStatus::parse("exploded").is_none());
        assert_eq!(TaskStatus::parse("completed"), Some(TaskStatus::Completed));
    }
}
