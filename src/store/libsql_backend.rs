//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Every operation goes
//! through one connection guarded by an async mutex, so transactions from
//! concurrent tasks in this process never interleave. Claims and merges run
//! inside `BEGIN IMMEDIATE` transactions, which take SQLite's write lock up
//! front; other processes sharing the file wait on the busy timeout.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, Transaction, TransactionBehavior, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{Database, MessageAuthor, RecordedToolCall, SessionMessage};
use crate::tasks::model::{
    ExecutionMetadata, ProcessingContext, QueueItem, QueueStats, QueueStatus, StaleReset,
    TaskState, TaskStateUpdate, TaskStatus,
};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Mutex<Connection>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path, busy_timeout: Duration) -> Result<Self, DatabaseError> {
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

        pragma(&conn, &format!("PRAGMA busy_timeout = {}", busy_timeout.as_millis())).await?;
        pragma(&conn, "PRAGMA journal_mode = WAL").await?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
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
        pragma(
            &conn,
            &format!("PRAGMA busy_timeout = {}", DEFAULT_BUSY_TIMEOUT.as_millis()),
        )
        .await?;

        let backend = Self {
            db: Arc::new(db),
            conn: Mutex::new(conn),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// PRAGMAs return a row, so they go through `query` rather than `execute`.
async fn pragma(conn: &Connection, sql: &str) -> Result<(), DatabaseError> {
    conn.query(sql, ())
        .await
        .map_err(|e| DatabaseError::Pool(format!("{sql}: {e}")))?;
    Ok(())
}

async fn begin_immediate(conn: &Connection, op: &str) -> Result<Transaction, DatabaseError> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: Transaction,
    outcome: Result<T, DatabaseError>,
    op: &str,
) -> Result<T, DatabaseError> {
    match outcome {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(err) => {
            if let Err(e) = tx.rollback().await {
                warn!(op, error = %e, "Rollback failed");
            }
            Err(err)
        }
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
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn row_err(op: &str) -> impl Fn(libsql::Error) -> DatabaseError + '_ {
    move |e| DatabaseError::Query(format!("{op} row parse: {e}"))
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

const TASK_COLUMNS: &str = "id, session_id, status, current_loop_count, consecutive_mistake_count, \
     last_processed_message_id, processing_context, execution_metadata, created_at, updated_at";

fn row_to_task_state(row: &libsql::Row) -> Result<TaskState, DatabaseError> {
    let err = row_err("task_state");
    let status: String = row.get(2).map_err(&err)?;
    let loops: i64 = row.get(3).map_err(&err)?;
    let mistakes: i64 = row.get(4).map_err(&err)?;
    let context = match row.get::<String>(6).ok() {
        Some(raw) => Some(from_json::<ProcessingContext>(&raw, "processing_context")?),
        None => None,
    };
    let metadata = match row.get::<String>(7).ok() {
        Some(raw) => from_json::<ExecutionMetadata>(&raw, "execution_metadata")?,
        None => ExecutionMetadata::default(),
    };
    let created_at: String = row.get(8).map_err(&err)?;
    let updated_at: String = row.get(9).map_err(&err)?;

    Ok(TaskState {
        id: row.get(0).map_err(&err)?,
        session_id: row.get(1).map_err(&err)?,
        status: TaskStatus::parse(&status).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown task status '{status}'"))
        })?,
        current_loop_count: loops.max(0) as u32,
        consecutive_mistake_count: mistakes.max(0) as u32,
        last_processed_message_id: row.get::<String>(5).ok(),
        processing_context: context,
        execution_metadata: metadata,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const QUEUE_COLUMNS: &str = "id, seq, session_id, message_id, content, sender_id, status, \
     processing_attempts, processed_at, error_message, processing_result, created_at, updated_at";

fn row_to_queue_item(row: &libsql::Row) -> Result<QueueItem, DatabaseError> {
    let err = row_err("queue_item");
    let status: String = row.get(6).map_err(&err)?;
    let attempts: i64 = row.get(7).map_err(&err)?;
    let result = match row.get::<String>(10).ok() {
        Some(raw) => Some(from_json::<serde_json::Value>(&raw, "processing_result")?),
        None => None,
    };
    let created_at: String = row.get(11).map_err(&err)?;
    let updated_at: String = row.get(12).map_err(&err)?;

    Ok(QueueItem {
        id: row.get(0).map_err(&err)?,
        seq: row.get(1).map_err(&err)?,
        session_id: row.get(2).map_err(&err)?,
        message_id: row.get(3).map_err(&err)?,
        content: row.get(4).map_err(&err)?,
        sender_id: row.get(5).map_err(&err)?,
        status: QueueStatus::parse(&status).ok_or_else(|| {
            DatabaseError::Serialization(format!("unknown queue status '{status}'"))
        })?,
        processing_attempts: attempts.max(0) as u32,
        processed_at: parse_optional_datetime(&row.get::<String>(8).ok()),
        error_message: row.get::<String>(9).ok(),
        processing_result: result,
        created_at: parse_datetime(&created_at),
        updated_at: parse_datetime(&updated_at),
    })
}

const SESSION_MESSAGE_COLUMNS: &str =
    "id, seq, session_id, sender_id, author, content, tool_calls, created_at";

fn row_to_session_message(row: &libsql::Row) -> Result<SessionMessage, DatabaseError> {
    let err = row_err("session_message");
    let author: String = row.get(4).map_err(&err)?;
    let tool_calls = match row.get::<String>(6).ok() {
        Some(raw) => from_json::<Vec<RecordedToolCall>>(&raw, "tool_calls")?,
        None => Vec::new(),
    };
    let created_at: String = row.get(7).map_err(&err)?;

    Ok(SessionMessage {
        id: row.get(0).map_err(&err)?,
        seq: row.get(1).map_err(&err)?,
        session_id: row.get(2).map_err(&err)?,
        sender_id: row.get(3).map_err(&err)?,
        author: MessageAuthor::parse(&author),
        content: row.get(5).map_err(&err)?,
        tool_calls,
        created_at: parse_datetime(&created_at),
    })
}

async fn select_task_state(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<TaskState>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {TASK_COLUMNS} FROM task_states WHERE session_id = ?1"),
            params![session_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_task_state: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_task_state(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_task_state: {e}"))),
    }
}

async fn select_queue_item(
    conn: &Connection,
    item_id: &str,
) -> Result<Option<QueueItem>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!("SELECT {QUEUE_COLUMNS} FROM message_queue WHERE id = ?1"),
            params![item_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("get_queue_item: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(Some(row_to_queue_item(&row)?)),
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("get_queue_item: {e}"))),
    }
}

/// Read-merge-write of a task row. Callers hold a write transaction.
async fn merge_task_state(
    conn: &Connection,
    session_id: &str,
    update: &TaskStateUpdate,
) -> Result<TaskState, DatabaseError> {
    let mut state =
        select_task_state(conn, session_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task_state".to_string(),
                id: session_id.to_string(),
            })?;

    if let Some(target) = update.status
        && !state.status.can_transition_to(target)
    {
        return Err(DatabaseError::Constraint(format!(
            "session {session_id}: cannot transition from {} to {target}",
            state.status
        )));
    }

    update.apply(&mut state);
    state.updated_at = Utc::now();

    let context = match &state.processing_context {
        Some(ctx) => Some(to_json(ctx, "processing_context")?),
        None => None,
    };
    let metadata = to_json(&state.execution_metadata, "execution_metadata")?;

    conn.execute(
        "UPDATE task_states SET status = ?1, current_loop_count = ?2, \
         consecutive_mistake_count = ?3, last_processed_message_id = ?4, \
         processing_context = ?5, execution_metadata = ?6, updated_at = ?7 \
         WHERE session_id = ?8",
        params![
            state.status.as_str(),
            i64::from(state.current_loop_count),
            i64::from(state.consecutive_mistake_count),
            state.last_processed_message_id.clone(),
            context,
            metadata,
            state.updated_at.to_rfc3339(),
            session_id
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("update_task_state: {e}")))?;

    Ok(state)
}

async fn claim_oldest_queued(
    conn: &Connection,
    session_id: &str,
) -> Result<Option<QueueItem>, DatabaseError> {
    let mut rows = conn
        .query(
            &format!(
                "SELECT {QUEUE_COLUMNS} FROM message_queue \
                 WHERE session_id = ?1 AND status = 'queued' ORDER BY seq ASC LIMIT 1"
            ),
            params![session_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("claim_next_queue_item: {e}")))?;

    let mut item = match rows.next().await {
        Ok(Some(row)) => row_to_queue_item(&row)?,
        Ok(None) => return Ok(None),
        Err(e) => return Err(DatabaseError::Query(format!("claim_next_queue_item: {e}"))),
    };
    drop(rows);

    let now = Utc::now();
    conn.execute(
        "UPDATE message_queue SET status = 'processing', \
         processing_attempts = processing_attempts + 1, updated_at = ?1 WHERE id = ?2",
        params![now.to_rfc3339(), item.id.clone()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("claim_next_queue_item update: {e}")))?;

    item.status = QueueStatus::Processing;
    item.processing_attempts += 1;
    item.updated_at = now;
    Ok(Some(item))
}

async fn mark_processed(
    conn: &Connection,
    item_id: &str,
    result: Option<&serde_json::Value>,
    task_update: Option<&TaskStateUpdate>,
) -> Result<(), DatabaseError> {
    let item = select_queue_item(conn, item_id)
        .await?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "queue_item".to_string(),
            id: item_id.to_string(),
        })?;

    let result = match result {
        Some(value) => Some(to_json(value, "processing_result")?),
        None => None,
    };
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "UPDATE message_queue SET status = 'processed', processed_at = ?1, \
         processing_result = ?2, updated_at = ?1 WHERE id = ?3",
        params![now, result, item_id],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("complete_queue_item: {e}")))?;

    if let Some(update) = task_update {
        merge_task_state(conn, &item.session_id, update).await?;
    }
    Ok(())
}

async fn reset_stale(conn: &Connection) -> Result<StaleReset, DatabaseError> {
    let now = Utc::now().to_rfc3339();
    let queue_items = conn
        .execute(
            "UPDATE message_queue SET status = 'queued', updated_at = ?1 \
             WHERE status = 'processing'",
            params![now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("reset_stale_processing queue: {e}")))?;

    let task_states = conn
        .execute(
            "UPDATE task_states SET status = 'pending', updated_at = ?1 \
             WHERE status IN ('running', 'waiting_for_approval')",
            params![now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("reset_stale_processing tasks: {e}")))?;

    Ok(StaleReset {
        queue_items,
        task_states,
    })
}

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        migrations::run_migrations(&conn).await
    }

    // ── Task state ──────────────────────────────────────────────────

    async fn get_or_create_task_state(
        &self,
        session_id: &str,
    ) -> Result<TaskState, DatabaseError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO task_states \
                 (id, session_id, status, current_loop_count, consecutive_mistake_count, \
                  execution_metadata, created_at, updated_at) \
                 VALUES (?1, ?2, 'pending', 0, 0, '{}', ?3, ?3)",
                params![Uuid::new_v4().to_string(), session_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_or_create_task_state: {e}")))?;

        if inserted > 0 {
            debug!(session_id, "Task state created");
        }

        select_task_state(&conn, session_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task_state".to_string(),
                id: session_id.to_string(),
            })
    }

    async fn get_task_state(&self, session_id: &str) -> Result<Option<TaskState>, DatabaseError> {
        let conn = self.conn.lock().await;
        select_task_state(&conn, session_id).await
    }

    async fn update_task_state(
        &self,
        session_id: &str,
        update: &TaskStateUpdate,
    ) -> Result<TaskState, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin_immediate(&conn, "update_task_state").await?;
        let outcome = merge_task_state(&tx, session_id, update).await;
        let state = finish(tx, outcome, "update_task_state").await?;
        debug!(session_id, status = %state.status, "Task state updated");
        Ok(state)
    }

    async fn list_sessions_by_status(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<String>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT session_id FROM task_states WHERE status = ?1 ORDER BY updated_at ASC",
                params![status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions_by_status: {e}")))?;

        let mut sessions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_sessions_by_status: {e}")))?
        {
            sessions.push(
                row.get::<String>(0)
                    .map_err(row_err("list_sessions_by_status"))?,
            );
        }
        Ok(sessions)
    }

    // ── Message queue ───────────────────────────────────────────────

    async fn enqueue_message(
        &self,
        session_id: &str,
        message_id: &str,
        content: &str,
        sender_id: &str,
    ) -> Result<QueueItem, DatabaseError> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut rows = conn
            .query(
                "INSERT INTO message_queue \
                 (id, session_id, message_id, content, sender_id, status, \
                  processing_attempts, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, ?6, ?6) RETURNING seq",
                params![
                    id.clone(),
                    session_id,
                    message_id,
                    content,
                    sender_id,
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue_message: {e}")))?;

        let seq: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err("enqueue_message"))?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "enqueue_message: insert returned no sequence".to_string(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("enqueue_message: {e}"))),
        };

        debug!(session_id, queue_item_id = %id, seq, "Message enqueued");
        Ok(QueueItem {
            id,
            seq,
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            content: content.to_string(),
            sender_id: sender_id.to_string(),
            status: QueueStatus::Queued,
            processing_attempts: 0,
            processed_at: None,
            error_message: None,
            processing_result: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn claim_next_queue_item(
        &self,
        session_id: &str,
    ) -> Result<Option<QueueItem>, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin_immediate(&conn, "claim_next_queue_item").await?;
        let outcome = claim_oldest_queued(&tx, session_id).await;
        let claimed = finish(tx, outcome, "claim_next_queue_item").await?;
        if let Some(item) = &claimed {
            debug!(session_id, queue_item_id = %item.id, attempts = item.processing_attempts, "Queue item claimed");
        }
        Ok(claimed)
    }

    async fn complete_queue_item(
        &self,
        item_id: &str,
        result: Option<&serde_json::Value>,
        task_update: Option<&TaskStateUpdate>,
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin_immediate(&conn, "complete_queue_item").await?;
        let outcome = mark_processed(&tx, item_id, result, task_update).await;
        finish(tx, outcome, "complete_queue_item").await?;
        debug!(queue_item_id = item_id, "Queue item processed");
        Ok(())
    }

    async fn fail_queue_item(&self, item_id: &str, error: &str) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let changed = conn
            .execute(
                "UPDATE message_queue SET status = 'failed', error_message = ?1, \
                 updated_at = ?2 WHERE id = ?3",
                params![error, now, item_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fail_queue_item: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "queue_item".to_string(),
                id: item_id.to_string(),
            });
        }
        debug!(queue_item_id = item_id, "Queue item failed");
        Ok(())
    }

    async fn get_queue_item(&self, item_id: &str) -> Result<Option<QueueItem>, DatabaseError> {
        let conn = self.conn.lock().await;
        select_queue_item(&conn, item_id).await
    }

    async fn count_queue_items(
        &self,
        session_id: &str,
        status: QueueStatus,
    ) -> Result<u64, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM message_queue WHERE session_id = ?1 AND status = ?2",
                params![session_id, status.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("count_queue_items: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row.get(0).map_err(row_err("count_queue_items"))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("count_queue_items: {e}"))),
        }
    }

    async fn queue_stats(&self, session_id: &str) -> Result<QueueStats, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut stats = QueueStats::default();

        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM message_queue WHERE session_id = ?1 GROUP BY status",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?;

        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats: {e}")))?
        {
            let status: String = row.get(0).map_err(row_err("queue_stats"))?;
            let count: i64 = row.get(1).map_err(row_err("queue_stats"))?;
            let count = count.max(0) as u64;
            match QueueStatus::parse(&status) {
                Some(QueueStatus::Queued) => stats.queued = count,
                Some(QueueStatus::Processing) => stats.processing = count,
                Some(QueueStatus::Processed) => stats.processed = count,
                Some(QueueStatus::Failed) => stats.failed = count,
                None => warn!(session_id, status = %status, "Unknown queue status in stats"),
            }
        }
        drop(rows);

        let mut rows = conn
            .query(
                "SELECT \
                   (SELECT MIN(created_at) FROM message_queue \
                    WHERE session_id = ?1 AND status IN ('queued', 'processing')), \
                   (SELECT MAX(created_at) FROM message_queue WHERE session_id = ?1)",
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("queue_stats timestamps: {e}")))?;

        if let Ok(Some(row)) = rows.next().await {
            stats.oldest_unprocessed_at = parse_optional_datetime(&row.get::<String>(0).ok());
            stats.newest_message_at = parse_optional_datetime(&row.get::<String>(1).ok());
        }
        Ok(stats)
    }

    async fn reset_stale_processing(&self) -> Result<StaleReset, DatabaseError> {
        let conn = self.conn.lock().await;
        let tx = begin_immediate(&conn, "reset_stale_processing").await?;
        let outcome = reset_stale(&tx).await;
        let reset = finish(tx, outcome, "reset_stale_processing").await?;
        if reset.queue_items > 0 || reset.task_states > 0 {
            info!(
                queue_items = reset.queue_items,
                task_states = reset.task_states,
                "Reset stale processing state"
            );
        }
        Ok(reset)
    }

    // ── Conversation ────────────────────────────────────────────────

    async fn insert_session_message(
        &self,
        session_id: &str,
        sender_id: &str,
        author: MessageAuthor,
        content: &str,
        tool_calls: &[RecordedToolCall],
    ) -> Result<SessionMessage, DatabaseError> {
        let conn = self.conn.lock().await;
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let calls_json = if tool_calls.is_empty() {
            None
        } else {
            Some(to_json(&tool_calls, "tool_calls")?)
        };

        let mut rows = conn
            .query(
                "INSERT INTO session_messages \
                 (id, session_id, sender_id, author, content, tool_calls, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) RETURNING seq",
                params![
                    id.clone(),
                    session_id,
                    sender_id,
                    author.as_str(),
                    content,
                    calls_json,
                    now.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_session_message: {e}")))?;

        let seq: i64 = match rows.next().await {
            Ok(Some(row)) => row.get(0).map_err(row_err("insert_session_message"))?,
            Ok(None) => {
                return Err(DatabaseError::Query(
                    "insert_session_message: insert returned no sequence".to_string(),
                ));
            }
            Err(e) => return Err(DatabaseError::Query(format!("insert_session_message: {e}"))),
        };

        Ok(SessionMessage {
            id,
            seq,
            session_id: session_id.to_string(),
            sender_id: sender_id.to_string(),
            author,
            content: content.to_string(),
            tool_calls: tool_calls.to_vec(),
            created_at: now,
        })
    }

    async fn update_session_message_tool_calls(
        &self,
        message_id: &str,
        tool_calls: &[RecordedToolCall],
    ) -> Result<(), DatabaseError> {
        let conn = self.conn.lock().await;
        let calls_json = to_json(&tool_calls, "tool_calls")?;
        let changed = conn
            .execute(
                "UPDATE session_messages SET tool_calls = ?1 WHERE id = ?2",
                params![calls_json, message_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_session_message_tool_calls: {e}")))?;

        if changed == 0 {
            return Err(DatabaseError::NotFound {
                entity: "session_message".to_string(),
                id: message_id.to_string(),
            });
        }
        Ok(())
    }

    async fn list_session_messages(
        &self,
        session_id: &str,
    ) -> Result<Vec<SessionMessage>, DatabaseError> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {SESSION_MESSAGE_COLUMNS} FROM session_messages \
                     WHERE session_id = ?1 ORDER BY seq ASC"
                ),
                params![session_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_session_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_session_messages: {e}")))?
        {
            messages.push(row_to_session_message(&row)?);
        }
        Ok(messages)
    }
}
