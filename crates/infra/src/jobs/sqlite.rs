//! SQLite-backed job store.
//!
//! One table, `jobs`, keyed by `id`. Several worker processes may share the
//! same database file: claims are a single `UPDATE … WHERE id = (SELECT …)
//! RETURNING` statement, so selection and transition commit together under
//! SQLite's write lock. No application-level locking is involved.
//!
//! ## Encoding
//!
//! | Column | Encoding |
//! |--------|----------|
//! | `state` | lowercase text (`pending`, `processing`, …) |
//! | `timeout` | INTEGER microseconds |
//! | `run_at`, `created_at`, `updated_at` | RFC 3339 UTC, fixed-width microseconds |
//!
//! Fixed-width timestamps make text comparison equal to time comparison, which
//! the eligibility filter and `ORDER BY created_at` rely on.
//!
//! ## Error Mapping
//!
//! | SQLx Error | QueueError |
//! |------------|------------|
//! | unique violation on insert | `DuplicateId` |
//! | column decode / row shape problems | `Corrupt` |
//! | everything else (I/O, busy, pool closed) | `StoreUnavailable` |

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use tracing::{info, instrument};

use queuectl_core::{Job, JobId, JobState, QueueError, QueueResult};

use super::store::{JobCounts, JobFilter, JobOrder, JobStore, JobUpdate};

const JOB_COLUMNS: &str = "id, command, state, attempts, max_retries, timeout, run_at, \
                           priority, created_at, updated_at, output, error";

/// Columns absent from databases created by earlier versions of the tool.
const ADDED_COLUMNS: [(&str, &str); 5] = [
    ("output", "TEXT NULL"),
    ("error", "TEXT NULL"),
    ("timeout", "INTEGER NULL"),
    ("run_at", "TEXT NULL"),
    ("priority", "INTEGER NOT NULL DEFAULT 0"),
];

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite job store.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Open (creating if missing) the database at `url` and ensure the schema.
    ///
    /// `url` is an sqlx SQLite URL such as `sqlite://queue.db`.
    pub async fn connect(url: &str) -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| map_sqlx_error("parse_url", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Private in-memory database (single connection kept alive by the pool).
    pub async fn in_memory() -> QueueResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| map_sqlx_error("parse_url", e))?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Wrap an existing pool. Call [`SqliteJobStore::migrate`] before use.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the `jobs` table and claim index if they do not exist, adding any
    /// columns an older table lacks.
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id          TEXT PRIMARY KEY,
                command     TEXT NOT NULL,
                state       TEXT NOT NULL,
                attempts    INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL,
                timeout     INTEGER NULL,
                run_at      TEXT NULL,
                priority    INTEGER NOT NULL DEFAULT 0,
                created_at  TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                output      TEXT NULL,
                error       TEXT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_table", e))?;

        self.add_missing_columns().await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS jobs_claim_idx
                ON jobs (state, priority DESC, created_at ASC)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create_index", e))?;

        Ok(())
    }

    /// Bring a `jobs` table from an older schema up to date.
    async fn add_missing_columns(&self) -> QueueResult<()> {
        let rows = sqlx::query("PRAGMA table_info(jobs)")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("table_info", e))?;
        let existing = rows
            .iter()
            .map(|row| row.try_get::<String, _>("name"))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| map_sqlx_error("table_info", e))?;

        for (column, definition) in ADDED_COLUMNS {
            if existing.iter().any(|name| name == column) {
                continue;
            }
            sqlx::query(&format!("ALTER TABLE jobs ADD COLUMN {column} {definition}"))
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error("add_column", e))?;
            info!(column, "added missing jobs column");
        }
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to be returned.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert(&self, job: Job) -> QueueResult<()> {
        let timeout_us = job
            .timeout
            .map(|t| i64::try_from(t.as_micros()).unwrap_or(i64::MAX));

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id,
                command,
                state,
                attempts,
                max_retries,
                timeout,
                run_at,
                priority,
                created_at,
                updated_at,
                output,
                error
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(job.id.as_str())
        .bind(&job.command)
        .bind(job.state.as_str())
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_retries))
        .bind(timeout_us)
        .bind(job.run_at.map(format_ts))
        .bind(i64::from(job.priority))
        .bind(format_ts(job.created_at))
        .bind(format_ts(job.updated_at))
        .bind(job.output.as_deref())
        .bind(job.error.as_deref())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                QueueError::DuplicateId(job.id.clone())
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(())
    }

    #[instrument(level = "debug", skip(self))]
    async fn claim_next(&self, now: DateTime<Utc>) -> QueueResult<Option<Job>> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = 'processing',
                updated_at = ?1
            WHERE state = 'pending'
              AND id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                  AND (run_at IS NULL OR run_at <= ?1)
                ORDER BY priority DESC, created_at ASC, rowid ASC
                LIMIT 1
              )
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(format_ts(now))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim_next", e))?;

        row.map(row_to_job).transpose()
    }

    #[instrument(level = "debug", skip(self, update), fields(job_id = %id))]
    async fn update(&self, id: &JobId, update: JobUpdate) -> QueueResult<Job> {
        let sql = format!(
            r#"
            UPDATE jobs
            SET state = COALESCE(?2, state),
                attempts = COALESCE(?3, attempts),
                output = COALESCE(?4, output),
                error = COALESCE(?5, error),
                updated_at = ?6
            WHERE id = ?1
              AND (?7 IS NULL OR state = ?7)
              AND (?8 IS NULL OR attempts = ?8)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .bind(update.state.map(|s| s.as_str()))
            .bind(update.attempts.map(i64::from))
            .bind(update.output.as_deref())
            .bind(update.error.as_deref())
            .bind(format_ts(update.updated_at))
            .bind(update.expect_state.map(|s| s.as_str()))
            .bind(update.expect_attempts.map(i64::from))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("update_job", e))?;

        match row {
            Some(row) => row_to_job(row),
            // Nothing matched: either the job is gone or a guard failed.
            None => match self.get(id).await? {
                Some(current) => Err(QueueError::InvalidTransition {
                    id: id.clone(),
                    state: current.state,
                }),
                None => Err(QueueError::NotFound(id.clone())),
            },
        }
    }

    async fn get(&self, id: &JobId) -> QueueResult<Option<Job>> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("get_job", e))?;

        row.map(row_to_job).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> QueueResult<Vec<Job>> {
        let order_by = match filter.order {
            JobOrder::Claim => "priority DESC, created_at ASC, rowid ASC",
            JobOrder::UpdatedAt => "updated_at ASC, rowid ASC",
        };
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobs
            WHERE (?1 IS NULL OR state = ?1)
            ORDER BY {order_by}
            LIMIT ?2
            "#
        );
        // SQLite treats a negative LIMIT as "no limit".
        let limit = filter
            .limit
            .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
            .unwrap_or(-1);

        let rows = sqlx::query(&sql)
            .bind(filter.state.map(|s| s.as_str()))
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_jobs", e))?;

        rows.into_iter().map(row_to_job).collect()
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS n FROM jobs GROUP BY state")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("count_jobs", e))?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state").map_err(|e| map_sqlx_error("count_jobs", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("count_jobs", e))?;
            counts.add(state.parse::<JobState>()?, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }

    #[instrument(skip(self), err)]
    async fn delete_all(&self) -> QueueResult<u64> {
        let result = sqlx::query("DELETE FROM jobs")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_all", e))?;
        Ok(result.rows_affected())
    }
}

/// Fixed-width RFC 3339 (`2025-11-10T16:30:00.000000Z`).
fn format_ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str, column: &str) -> QueueResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| QueueError::corrupt(format!("invalid {column} '{value}': {e}")))
}

fn int_column<T: TryFrom<i64>>(value: i64, column: &str) -> QueueResult<T> {
    T::try_from(value).map_err(|_| QueueError::corrupt(format!("{column} out of range: {value}")))
}

/// Map a database row into a `Job`.
fn row_to_job(row: SqliteRow) -> QueueResult<Job> {
    let get = |e: sqlx::Error| map_sqlx_error("decode_job", e);

    let id_str: String = row.try_get("id").map_err(get)?;
    let id = id_str.parse::<JobId>()?;

    let command: String = row.try_get("command").map_err(get)?;

    let state_str: String = row.try_get("state").map_err(get)?;
    let state = state_str.parse::<JobState>()?;

    let attempts: i64 = row.try_get("attempts").map_err(get)?;
    let max_retries: i64 = row.try_get("max_retries").map_err(get)?;

    let timeout_us: Option<i64> = row.try_get("timeout").map_err(get)?;
    let timeout = timeout_us
        .map(|us| int_column::<u64>(us, "timeout").map(Duration::from_micros))
        .transpose()?;

    let run_at_str: Option<String> = row.try_get("run_at").map_err(get)?;
    let run_at = run_at_str
        .as_deref()
        .map(|s| parse_ts(s, "run_at"))
        .transpose()?;

    let priority: i64 = row.try_get("priority").map_err(get)?;

    let created_at_str: String = row.try_get("created_at").map_err(get)?;
    let updated_at_str: String = row.try_get("updated_at").map_err(get)?;

    let output: Option<String> = row.try_get("output").map_err(get)?;
    let error: Option<String> = row.try_get("error").map_err(get)?;

    Ok(Job {
        id,
        command,
        state,
        attempts: int_column(attempts, "attempts")?,
        max_retries: int_column(max_retries, "max_retries")?,
        timeout,
        run_at,
        priority: int_column(priority, "priority")?,
        created_at: parse_ts(&created_at_str, "created_at")?,
        updated_at: parse_ts(&updated_at_str, "updated_at")?,
        output,
        error,
    })
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> QueueError {
    match err {
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::ColumnNotFound(_) | sqlx::Error::Decode(_) => {
            QueueError::corrupt(format!("{operation}: {err}"))
        }
        sqlx::Error::Database(db_err) => {
            QueueError::unavailable(format!("database error in {operation}: {}", db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            QueueError::unavailable(format!("connection pool closed in {operation}"))
        }
        _ => QueueError::unavailable(format!("sqlx error in {operation}: {err}")),
    }
}
