//! SQLite persistence for research tasks and sealed credentials.
//!
//! One database file (`{data_dir}/researchd.db`, WAL mode). Tasks are
//! partitioned by owner: the primary key is `(owner_id, interaction_id)` and
//! every read is scoped to a single owner — there is no cross-owner query.
//!
//! Retention is a store concern, not a governor concern: every task row
//! carries `expires_at`, reads filter expired rows out, and a periodic
//! purge sweep deletes them for good.

use anyhow::{Context as _, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::{path::Path, str::FromStr};

/// Default timeout for individual SQLite queries.
/// Prevents hung queries from blocking the daemon indefinitely.
const QUERY_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Execute a future with the standard query timeout.
async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

/// Format a timestamp the way every column in this store expects it:
/// RFC 3339 UTC with fixed millisecond precision, so lexicographic order on
/// the TEXT column equals chronological order (`ORDER BY started_at DESC`
/// relies on this).
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse a timestamp previously written by [`format_ts`].
pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid stored timestamp: {raw}"))?
        .with_timezone(&Utc))
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ResearchTaskRow {
    pub owner_id: String,
    pub interaction_id: String,
    pub query: String,
    /// `in_progress` | `completed` | `failed`. Kept as TEXT so an unknown
    /// value degrades to a dropped listing row instead of a failed query.
    pub status: String,
    pub started_at: String,
    pub last_checked_at: Option<String>,
    pub result: Option<String>,
    pub error: Option<String>,
    pub expires_at: String,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRow {
    pub owner_id: String,
    /// hex( nonce || ciphertext ) as produced by `secrets::Vault::seal`.
    pub sealed_credential: String,
    pub created_at: String,
}

#[derive(Clone)]
pub struct Storage {
    pool: SqlitePool,
}

impl Storage {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        Self::new_with_slow_query(data_dir, 0).await
    }

    /// Create storage with slow-query logging enabled.
    ///
    /// `slow_query_ms` is the threshold in milliseconds — queries exceeding
    /// it are logged at WARN level. Set to 0 to disable slow-query logging.
    pub async fn new_with_slow_query(data_dir: &Path, slow_query_ms: u64) -> Result<Self> {
        tokio::fs::create_dir_all(data_dir).await?;
        let db_path = data_dir.join("researchd.db");
        let mut opts =
            SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", db_path.display()))?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
                .create_if_missing(true);

        if slow_query_ms > 0 {
            use sqlx::ConnectOptions;
            opts = opts.log_slow_statements(
                log::LevelFilter::Warn,
                std::time::Duration::from_millis(slow_query_ms),
            );
        }

        let pool = SqlitePool::connect_with(opts).await?;
        Self::migrate(&pool).await?;
        Ok(Self { pool })
    }

    /// Return a clone of the connection pool (cheap — Arc-backed).
    pub fn pool(&self) -> SqlitePool {
        self.pool.clone()
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        // Idempotent DDL — straight CREATE IF NOT EXISTS, applied on every
        // startup. The schema is small enough that a migration table would
        // be more machinery than schema.
        let ddl = [
            "CREATE TABLE IF NOT EXISTS research_tasks (
                owner_id        TEXT NOT NULL,
                interaction_id  TEXT NOT NULL,
                query           TEXT NOT NULL,
                status          TEXT NOT NULL DEFAULT 'in_progress',
                started_at      TEXT NOT NULL,
                last_checked_at TEXT,
                result          TEXT,
                error           TEXT,
                expires_at      TEXT NOT NULL,
                PRIMARY KEY (owner_id, interaction_id)
            )",
            "CREATE INDEX IF NOT EXISTS idx_tasks_owner_started
                ON research_tasks (owner_id, started_at DESC)",
            "CREATE TABLE IF NOT EXISTS credentials (
                owner_id          TEXT PRIMARY KEY,
                sealed_credential TEXT NOT NULL,
                created_at        TEXT NOT NULL
            )",
            "CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )",
        ];
        for stmt in ddl {
            sqlx::query(stmt)
                .execute(pool)
                .await
                .context("failed to apply schema")?;
        }
        Ok(())
    }

    // ─── Research tasks ─────────────────────────────────────────────────────

    /// Insert a freshly created task. `started_at` and `expires_at` are
    /// provided by the caller so the governor controls the clock.
    pub async fn insert_task(
        &self,
        owner_id: &str,
        interaction_id: &str,
        query: &str,
        started_at: &str,
        expires_at: &str,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO research_tasks
                 (owner_id, interaction_id, query, status, started_at, expires_at)
             VALUES (?, ?, ?, 'in_progress', ?, ?)",
        )
        .bind(owner_id)
        .bind(interaction_id)
        .bind(query)
        .bind(started_at)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Fetch one task, scoped to its owner. Expired rows read as absent.
    pub async fn get_task(
        &self,
        owner_id: &str,
        interaction_id: &str,
    ) -> Result<Option<ResearchTaskRow>> {
        let now = format_ts(Utc::now());
        Ok(sqlx::query_as(
            "SELECT * FROM research_tasks
             WHERE owner_id = ? AND interaction_id = ? AND expires_at > ?",
        )
        .bind(owner_id)
        .bind(interaction_id)
        .bind(&now)
        .fetch_optional(&self.pool)
        .await?)
    }

    /// All live tasks for one owner, most recently started first.
    /// Ties broken by rowid — the store's native insertion order.
    pub async fn list_tasks(&self, owner_id: &str) -> Result<Vec<ResearchTaskRow>> {
        let now = format_ts(Utc::now());
        with_timeout(async {
            Ok(sqlx::query_as(
                "SELECT * FROM research_tasks
                 WHERE owner_id = ? AND expires_at > ?
                 ORDER BY started_at DESC, rowid DESC",
            )
            .bind(owner_id)
            .bind(&now)
            .fetch_all(&self.pool)
            .await?)
        })
        .await
    }

    /// Advance the poll gate. Written *before* the backend status call so a
    /// racing check sees the gate already moved.
    pub async fn touch_last_checked(
        &self,
        owner_id: &str,
        interaction_id: &str,
        checked_at: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE research_tasks SET last_checked_at = ?
             WHERE owner_id = ? AND interaction_id = ?",
        )
        .bind(checked_at)
        .bind(owner_id)
        .bind(interaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition: completed with a result. Clears any error.
    pub async fn complete_task(
        &self,
        owner_id: &str,
        interaction_id: &str,
        result: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE research_tasks SET status = 'completed', result = ?, error = NULL
             WHERE owner_id = ? AND interaction_id = ?",
        )
        .bind(result)
        .bind(owner_id)
        .bind(interaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Terminal transition: failed with an error message. Clears any result.
    pub async fn fail_task(
        &self,
        owner_id: &str,
        interaction_id: &str,
        error: &str,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE research_tasks SET status = 'failed', error = ?, result = NULL
             WHERE owner_id = ? AND interaction_id = ?",
        )
        .bind(error)
        .bind(owner_id)
        .bind(interaction_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Delete every expired task row. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let now = format_ts(Utc::now());
        let done = sqlx::query("DELETE FROM research_tasks WHERE expires_at <= ?")
            .bind(&now)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected())
    }

    /// Count every live task row for one owner.
    pub async fn count_tasks(&self, owner_id: &str) -> Result<u64> {
        let now = format_ts(Utc::now());
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM research_tasks WHERE owner_id = ? AND expires_at > ?",
        )
        .bind(owner_id)
        .bind(&now)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 as u64)
    }

    // ─── Credentials ────────────────────────────────────────────────────────

    /// Store (or replace) the sealed credential for an owner.
    pub async fn upsert_credential(&self, owner_id: &str, sealed: &str) -> Result<()> {
        let now = format_ts(Utc::now());
        sqlx::query(
            "INSERT INTO credentials (owner_id, sealed_credential, created_at)
             VALUES (?, ?, ?)
             ON CONFLICT(owner_id) DO UPDATE SET sealed_credential = excluded.sealed_credential",
        )
        .bind(owner_id)
        .bind(sealed)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_credential(&self, owner_id: &str) -> Result<Option<CredentialRow>> {
        Ok(
            sqlx::query_as("SELECT * FROM credentials WHERE owner_id = ?")
                .bind(owner_id)
                .fetch_optional(&self.pool)
                .await?,
        )
    }

    // ─── Settings ───────────────────────────────────────────────────────────

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|(v,)| v))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES (?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    async fn open() -> (TempDir, Storage) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path()).await.unwrap();
        (dir, storage)
    }

    fn future_ts(secs: i64) -> String {
        format_ts(Utc::now() + Duration::seconds(secs))
    }

    #[tokio::test]
    async fn insert_then_get_is_owner_scoped() {
        let (_dir, storage) = open().await;
        let started = format_ts(Utc::now());
        storage
            .insert_task("owner-a", "int-1", "what is rust", &started, &future_ts(3600))
            .await
            .unwrap();

        assert!(storage.get_task("owner-a", "int-1").await.unwrap().is_some());
        assert!(storage.get_task("owner-b", "int-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_rows_read_as_absent_and_purge_removes_them() {
        let (_dir, storage) = open().await;
        let started = format_ts(Utc::now() - Duration::days(8));
        storage
            .insert_task("owner-a", "int-old", "stale", &started, &future_ts(-60))
            .await
            .unwrap();

        assert!(storage.get_task("owner-a", "int-old").await.unwrap().is_none());
        assert_eq!(storage.purge_expired().await.unwrap(), 1);
        assert_eq!(storage.purge_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn list_orders_most_recent_first() {
        let (_dir, storage) = open().await;
        for (id, age_secs) in [("t0", 300), ("t1", 200), ("t2", 100)] {
            let started = format_ts(Utc::now() - Duration::seconds(age_secs));
            storage
                .insert_task("owner-a", id, "q", &started, &future_ts(3600))
                .await
                .unwrap();
        }
        let rows = storage.list_tasks("owner-a").await.unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.interaction_id.as_str()).collect();
        assert_eq!(ids, vec!["t2", "t1", "t0"]);
    }

    #[tokio::test]
    async fn terminal_transitions_keep_exactly_one_of_result_or_error() {
        let (_dir, storage) = open().await;
        let started = format_ts(Utc::now());
        storage
            .insert_task("owner-a", "int-1", "q", &started, &future_ts(3600))
            .await
            .unwrap();

        storage.complete_task("owner-a", "int-1", "findings").await.unwrap();
        let row = storage.get_task("owner-a", "int-1").await.unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.result.as_deref(), Some("findings"));
        assert!(row.error.is_none());

        storage.fail_task("owner-a", "int-1", "boom").await.unwrap();
        let row = storage.get_task("owner-a", "int-1").await.unwrap().unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.error.as_deref(), Some("boom"));
        assert!(row.result.is_none());
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (_dir, storage) = open().await;
        assert!(storage.get_setting("daemon_id").await.unwrap().is_none());
        storage.set_setting("daemon_id", "abc").await.unwrap();
        assert_eq!(storage.get_setting("daemon_id").await.unwrap().as_deref(), Some("abc"));
    }
}
