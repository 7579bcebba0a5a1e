//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 text so that lexical order matches time order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::router::session::WorkerId;
use crate::store::migrations;
use crate::store::traits::{AuthTokenRecord, Database, RecoveryReport, WorkerRegistration};
use crate::store::{StoredTask, StoredWorker};
use crate::task::{Task, TaskId, UserId};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.init_schema().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    // ── Fixtures ────────────────────────────────────────────────────
    //
    // Rows the management API would normally create. Used for seeding local
    // databases and by tests.

    pub async fn insert_auth_token(
        &self,
        token: &str,
        user_id: UserId,
        expires_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO auth_tokens (auth_token, user_id, expires_at) VALUES (?1, ?2, ?3)",
                params![token, user_id, fmt_ts(expires_at)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_auth_token: {e}")))?;
        Ok(())
    }

    pub async fn insert_function(
        &self,
        function_id: &str,
        user_id: UserId,
        name: &str,
        prevent_reuse: bool,
        allow_foreign_workers: bool,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO functions (function_id, user_id, name, prevent_reuse, allow_foreign_workers, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    function_id,
                    user_id,
                    name,
                    bool_to_int(prevent_reuse),
                    bool_to_int(allow_foreign_workers),
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_function: {e}")))?;
        Ok(())
    }

    /// Enlist a worker. Returns the new worker id.
    pub async fn register_worker(
        &self,
        user_id: UserId,
        threads: u32,
        accept_foreign_work: bool,
    ) -> Result<WorkerId, DatabaseError> {
        let conn = self.conn();
        conn.execute(
            "INSERT INTO workers (user_id, threads, accept_foreign_work) VALUES (?1, ?2, ?3)",
            params![user_id, i64::from(threads), bool_to_int(accept_foreign_work)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("register_worker: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    /// Submit a task for a function, snapshotting the function's policy.
    pub async fn submit_task(
        &self,
        function_id: &str,
        additional_data: &str,
    ) -> Result<TaskId, DatabaseError> {
        let conn = self.conn();
        let inserted = conn
            .execute(
                "INSERT INTO tasks (function_id, owner_user_id, additional_data, allow_foreign_workers, prevent_reuse, arrive_ts)
                 SELECT function_id, user_id, ?2, allow_foreign_workers, prevent_reuse, ?3
                 FROM functions WHERE function_id = ?1",
                params![function_id, additional_data, fmt_ts(Utc::now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("submit_task: {e}")))?;

        if inserted == 0 {
            return Err(DatabaseError::NotFound {
                entity: "function".to_string(),
                id: function_id.to_string(),
            });
        }
        Ok(conn.last_insert_rowid())
    }

    pub async fn get_task(&self, task_id: TaskId) -> Result<Option<StoredTask>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS}, worker_id FROM tasks WHERE task_id = ?1"),
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?
        {
            Some(row) => {
                let task = row_to_task(&row)
                    .map_err(|e| DatabaseError::Serialization(format!("task row: {e}")))?;
                let worker_id: Option<i64> = row.get::<i64>(10).ok();
                Ok(Some(StoredTask { task, worker_id }))
            }
            None => Ok(None),
        }
    }

    pub async fn get_worker(
        &self,
        worker_id: WorkerId,
    ) -> Result<Option<StoredWorker>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT worker_id, user_id, threads, accept_foreign_work, connect_ts, last_seen_ts
                 FROM workers WHERE worker_id = ?1",
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?;

        let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_worker: {e}")))?
        else {
            return Ok(None);
        };

        let registration = row_to_registration(&row)
            .map_err(|e| DatabaseError::Serialization(format!("worker row: {e}")))?;
        let connect_ts: Option<String> = row.get(4).ok();
        let last_seen_ts: Option<String> = row.get(5).ok();
        Ok(Some(StoredWorker {
            registration,
            connect_ts: parse_optional_datetime(&connect_ts),
            last_seen_ts: parse_optional_datetime(&last_seen_ts),
        }))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: fixed microsecond precision, `Z` suffix.
fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(ts: Option<DateTime<Utc>>) -> libsql::Value {
    match ts {
        Some(ts) => libsql::Value::Text(fmt_ts(ts)),
        None => libsql::Value::Null,
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn bool_to_int(b: bool) -> i64 {
    i64::from(b)
}

const TASK_COLUMNS: &str = "task_id, function_id, owner_user_id, additional_data, allow_foreign_workers, prevent_reuse, arrive_ts, start_ts, end_ts, failed";

/// Map a libsql Row to a Task. Column order matches `TASK_COLUMNS`.
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let arrive_str: String = row.get(6)?;
    let start_str: Option<String> = row.get(7).ok();
    let end_str: Option<String> = row.get(8).ok();

    Ok(Task {
        task_id: row.get(0)?,
        function_id: row.get(1)?,
        owner_user_id: row.get(2)?,
        additional_data: row.get::<String>(3).unwrap_or_default(),
        allow_foreign_workers: row.get::<i64>(4)? != 0,
        prevent_reuse: row.get::<i64>(5)? != 0,
        arrive_ts: parse_datetime(&arrive_str),
        start_ts: parse_optional_datetime(&start_str),
        end_ts: parse_optional_datetime(&end_str),
        failed: row.get::<i64>(9)? != 0,
    })
}

/// Columns: worker_id, user_id, threads, accept_foreign_work.
fn row_to_registration(row: &libsql::Row) -> Result<WorkerRegistration, libsql::Error> {
    let threads: i64 = row.get(2)?;
    Ok(WorkerRegistration {
        worker_id: row.get(0)?,
        user_id: row.get(1)?,
        threads: u32::try_from(threads).unwrap_or(0),
        accept_foreign_work: row.get::<i64>(3)? != 0,
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn init_schema(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn find_auth_token(
        &self,
        token: &str,
    ) -> Result<Option<AuthTokenRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, expires_at FROM auth_tokens WHERE auth_token = ?1",
                params![token],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_auth_token: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_auth_token: {e}")))?
        {
            Some(row) => {
                let user_id: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Serialization(format!("auth_tokens.user_id: {e}")))?;
                let expires_str: String = row.get(1).map_err(|e| {
                    DatabaseError::Serialization(format!("auth_tokens.expires_at: {e}"))
                })?;
                Ok(Some(AuthTokenRecord {
                    user_id,
                    expires_at: parse_datetime(&expires_str),
                }))
            }
            None => Ok(None),
        }
    }

    async fn claim_worker(
        &self,
        worker_id: WorkerId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<Option<WorkerRegistration>, DatabaseError> {
        let conn = self.conn();

        // Single conditional UPDATE so two sockets cannot both claim the row.
        let claimed = conn
            .execute(
                "UPDATE workers SET connect_ts = ?1
                 WHERE worker_id = ?2 AND user_id = ?3 AND connect_ts IS NULL",
                params![fmt_ts(now), worker_id, user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_worker: {e}")))?;

        if claimed == 0 {
            debug!(worker_id, user_id, "Worker registration missing or already claimed");
            return Ok(None);
        }

        let mut rows = conn
            .query(
                "SELECT worker_id, user_id, threads, accept_foreign_work FROM workers WHERE worker_id = ?1",
                params![worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_worker: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("claim_worker: {e}")))?
        {
            Some(row) => row_to_registration(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Serialization(format!("worker row: {e}"))),
            None => Ok(None),
        }
    }

    async fn release_worker(
        &self,
        worker_id: WorkerId,
        last_seen: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE workers SET last_seen_ts = ?1, connect_ts = NULL WHERE worker_id = ?2",
                params![fmt_ts(last_seen), worker_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_worker: {e}")))?;
        Ok(())
    }

    async fn fetch_pending_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE worker_id IS NULL AND failed = 0 AND end_ts IS NULL
                     ORDER BY arrive_ts ASC, task_id ASC"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_pending_tasks: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(task) => tasks.push(task),
                Err(e) => {
                    tracing::warn!("Skipping task row: {e}");
                }
            }
        }
        Ok(tasks)
    }

    async fn persist_task_assignment(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET worker_id = ?1 WHERE task_id = ?2",
                params![worker_id, task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_task_assignment: {e}")))?;
        Ok(())
    }

    async fn release_task_assignment(&self, task_id: TaskId) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET worker_id = NULL, start_ts = NULL WHERE task_id = ?1",
                params![task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("release_task_assignment: {e}")))?;
        Ok(())
    }

    async fn persist_task_done(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
        end_ts: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET start_ts = ?1, end_ts = ?2, failed = 0 WHERE task_id = ?3",
                params![opt_ts(start_ts), fmt_ts(end_ts), task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_task_done: {e}")))?;
        Ok(())
    }

    async fn persist_task_failed(
        &self,
        task_id: TaskId,
        start_ts: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "UPDATE tasks SET start_ts = ?1, failed = 1 WHERE task_id = ?2",
                params![opt_ts(start_ts), task_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("persist_task_failed: {e}")))?;
        Ok(())
    }

    async fn recover_stale_state(&self) -> Result<RecoveryReport, DatabaseError> {
        let conn = self.conn();

        let released_claims = conn
            .execute(
                "UPDATE workers SET connect_ts = NULL WHERE connect_ts IS NOT NULL",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_state: {e}")))?;

        let released_tasks = conn
            .execute(
                "UPDATE tasks SET worker_id = NULL, start_ts = NULL
                 WHERE worker_id IS NOT NULL AND end_ts IS NULL AND failed = 0",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recover_stale_state: {e}")))?;

        Ok(RecoveryReport {
            released_claims,
            released_tasks,
        })
    }
}
