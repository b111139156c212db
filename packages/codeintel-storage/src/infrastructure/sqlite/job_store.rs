//! SQLite Job Queue Store
//!
//! One table per queue. Ownership of a `processing` row is the pair
//! `(state = 'processing', worker_token = <lease>)`; every mutation checks
//! both, so a worker whose job was reset cannot overwrite the new owner.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{from_millis, open_connection, open_in_memory, to_millis, validate_identifier};
use crate::domain::job::{
    Claim, Job, JobState, JobStateCounts, NewJob, ResetOutcome, RESET_LIMIT_MESSAGE,
};
use crate::domain::ports::JobStore;
use crate::error::{Result, StorageError};

const JOB_COLUMNS: &str = "id, repository_id, commit_hash, root, indexer, state, failure_message, \
     queued_at, process_after, started_at, finished_at, last_heartbeat_at, num_resets, num_failures";

/// SQLite-backed queue
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    table: Arc<str>,
}

impl SqliteJobStore {
    /// Open (or create) the queue table `table` in the database at `db_path`
    pub fn open(db_path: impl AsRef<Path>, table: &str) -> Result<Self> {
        Self::with_connection(open_connection(db_path)?, table)
    }

    /// In-memory queue (for testing)
    pub fn in_memory(table: &str) -> Result<Self> {
        Self::with_connection(open_in_memory()?, table)
    }

    fn with_connection(conn: Connection, table: &str) -> Result<Self> {
        validate_identifier(table)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            table: Arc::from(table),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();
        let t = &*self.table;

        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {t} (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                repository_id INTEGER NOT NULL,
                commit_hash TEXT NOT NULL,
                root TEXT NOT NULL DEFAULT '',
                indexer TEXT NOT NULL,
                state TEXT NOT NULL DEFAULT 'queued',
                failure_message TEXT,
                queued_at INTEGER NOT NULL,
                process_after INTEGER,
                started_at INTEGER,
                finished_at INTEGER,
                last_heartbeat_at INTEGER,
                num_resets INTEGER NOT NULL DEFAULT 0,
                num_failures INTEGER NOT NULL DEFAULT 0,
                worker_token TEXT
            );
            CREATE INDEX IF NOT EXISTS {t}_state_idx ON {t}(state, process_after);
            CREATE INDEX IF NOT EXISTS {t}_repository_idx ON {t}(repository_id, state);"
        ))?;

        Ok(())
    }

    /// Run `f` against the locked connection on the blocking pool
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection, &str) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        let table = Arc::clone(&self.table);

        tokio::task::spawn_blocking(move || {
            let conn = conn.lock();
            f(&conn, &table)
        })
        .await
        .map_err(|e| StorageError::database(format!("Queue task failed: {}", e)))?
    }

    fn row_to_job(row: &Row<'_>) -> rusqlite::Result<Job> {
        let state: String = row.get(5)?;
        let state = JobState::from_str(&state)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

        Ok(Job {
            id: row.get(0)?,
            repository_id: row.get(1)?,
            commit: row.get(2)?,
            root: row.get(3)?,
            indexer: row.get(4)?,
            state,
            failure_message: row.get(6)?,
            queued_at: from_millis(row.get(7)?),
            process_after: row.get::<_, Option<i64>>(8)?.map(from_millis),
            started_at: row.get::<_, Option<i64>>(9)?.map(from_millis),
            finished_at: row.get::<_, Option<i64>>(10)?.map(from_millis),
            last_heartbeat_at: row.get::<_, Option<i64>>(11)?.map(from_millis),
            num_resets: row.get(12)?,
            num_failures: row.get(13)?,
        })
    }

    fn collect_ids(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(sql)?;
        let ids = stmt
            .query_map(params, |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Dequeue with an explicit clock
    pub async fn dequeue_at(&self, now: DateTime<Utc>) -> Result<Option<Claim>> {
        let token = Uuid::new_v4();
        let now = to_millis(now);

        self.run(move |conn, t| {
            let job = conn
                .query_row(
                    &format!(
                        "UPDATE {t}
                         SET state = 'processing', started_at = ?1, last_heartbeat_at = ?1,
                             worker_token = ?2
                         WHERE id = (
                             SELECT id FROM {t}
                             WHERE state = 'queued' AND (process_after IS NULL OR process_after <= ?1)
                             ORDER BY COALESCE(process_after, queued_at), id
                             LIMIT 1
                         )
                         RETURNING {JOB_COLUMNS}"
                    ),
                    params![now, token.to_string()],
                    Self::row_to_job,
                )
                .optional()?;

            Ok(job.map(|job| Claim { job, token }))
        })
        .await
    }

    /// Apply an ownership-conditioned update; returns whether the caller still owned the job
    async fn update_owned(&self, id: i64, token: Uuid, set_clause: String, now: i64) -> Result<bool> {
        let changed = self
            .run(move |conn, t| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE {t} SET {set_clause}
                         WHERE id = ?1 AND state = 'processing' AND worker_token = ?2"
                    ),
                    params![id, token.to_string(), now],
                )?)
            })
            .await?;

        Ok(self.owned(id, changed))
    }

    fn owned(&self, id: i64, changed: usize) -> bool {
        if changed == 0 {
            debug!(queue = %self.table, job_id = id, "Ignoring update from a worker that no longer owns the job");
        }
        changed == 1
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    fn queue_name(&self) -> &str {
        &self.table
    }

    async fn enqueue(&self, job: &NewJob) -> Result<i64> {
        let job = job.clone();
        let now = to_millis(Utc::now());

        self.run(move |conn, t| {
            conn.execute(
                &format!(
                    "INSERT INTO {t} (repository_id, commit_hash, root, indexer, state, queued_at)
                     VALUES (?1, ?2, ?3, ?4, 'queued', ?5)"
                ),
                params![job.repository_id, job.commit, job.root, job.indexer, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn dequeue(&self) -> Result<Option<Claim>> {
        self.dequeue_at(Utc::now()).await
    }

    async fn heartbeat(&self, id: i64, token: Uuid) -> Result<bool> {
        self.update_owned(id, token, "last_heartbeat_at = ?3".to_string(), to_millis(Utc::now()))
            .await
    }

    async fn complete(&self, id: i64, token: Uuid) -> Result<bool> {
        self.update_owned(
            id,
            token,
            "state = 'completed', finished_at = ?3, worker_token = NULL, failure_message = NULL"
                .to_string(),
            to_millis(Utc::now()),
        )
        .await
    }

    async fn fail(&self, id: i64, token: Uuid, reason: &str) -> Result<bool> {
        let reason = reason.to_string();
        let now = to_millis(Utc::now());

        let changed = self
            .run(move |conn, t| {
                Ok(conn.execute(
                    &format!(
                        "UPDATE {t}
                         SET state = 'errored', failure_message = ?3, finished_at = ?4,
                             num_failures = num_failures + 1, worker_token = NULL
                         WHERE id = ?1 AND state = 'processing' AND worker_token = ?2"
                    ),
                    params![id, token.to_string(), reason, now],
                )?)
            })
            .await?;

        Ok(self.owned(id, changed))
    }

    async fn requeue(&self, id: i64, token: Uuid, after: DateTime<Utc>) -> Result<bool> {
        self.update_owned(
            id,
            token,
            "state = 'queued', process_after = ?3, started_at = NULL, last_heartbeat_at = NULL, \
             worker_token = NULL"
                .to_string(),
            to_millis(after),
        )
        .await
    }

    async fn reset_stalled(
        &self,
        now: DateTime<Utc>,
        stalled_after: chrono::Duration,
        max_resets: u32,
    ) -> Result<ResetOutcome> {
        let cutoff = to_millis(now - stalled_after);
        let now = to_millis(now);

        self.run(move |conn, t| {
            let tx = conn.unchecked_transaction()?;

            let errored = Self::collect_ids(
                &tx,
                &format!(
                    "UPDATE {t}
                     SET state = 'errored', failure_message = ?3, finished_at = ?4,
                         num_resets = num_resets + 1, worker_token = NULL
                     WHERE state = 'processing' AND last_heartbeat_at < ?1 AND num_resets >= ?2
                     RETURNING id"
                ),
                params![cutoff, max_resets, RESET_LIMIT_MESSAGE, now],
            )?;

            let reset = Self::collect_ids(
                &tx,
                &format!(
                    "UPDATE {t}
                     SET state = 'queued', num_resets = num_resets + 1, started_at = NULL,
                         last_heartbeat_at = NULL, process_after = NULL, worker_token = NULL
                     WHERE state = 'processing' AND last_heartbeat_at < ?1 AND num_resets < ?2
                     RETURNING id"
                ),
                params![cutoff, max_resets],
            )?;

            tx.commit()?;

            let mut outcome = ResetOutcome { reset, errored };
            outcome.reset.sort_unstable();
            outcome.errored.sort_unstable();
            Ok(outcome)
        })
        .await
    }

    async fn get(&self, id: i64) -> Result<Option<Job>> {
        self.run(move |conn, t| {
            Ok(conn
                .query_row(
                    &format!("SELECT {JOB_COLUMNS} FROM {t} WHERE id = ?1"),
                    params![id],
                    Self::row_to_job,
                )
                .optional()?)
        })
        .await
    }

    async fn state_counts(&self, repository_id: i64) -> Result<JobStateCounts> {
        self.run(move |conn, t| {
            let mut stmt = conn.prepare(&format!(
                "SELECT state, COUNT(*) FROM {t} WHERE repository_id = ?1 GROUP BY state"
            ))?;
            let rows = stmt
                .query_map(params![repository_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            let mut counts = JobStateCounts::default();
            for (state, count) in rows {
                counts.add(JobState::from_str(&state)?, count as u64);
            }
            Ok(counts)
        })
        .await
    }
}
