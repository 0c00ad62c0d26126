//! SQLite sidecar database
//!
//! Durable bookkeeping that lives next to the versioned repository:
//!
//! - `sync_state`: one row per (branch, collection)
//! - `deletion_tracker`: deletions pending a versioned-store commit
//! - `document_sync_log`: per-document audit trail of applied actions
//! - `sync_operations`: one row per engine run
//!
//! All writes are single-statement UPSERTs or short transactions; the
//! connection is guarded by a mutex so the handle can be shared across
//! async tasks.

use crate::domain::{
    DeletionRecord, DocumentAction, OperationOutcome, SyncState, SyncStatus,
    DELETION_RETENTION_DAYS,
};
use crate::error::{Result, StorageError};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use uuid::Uuid;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sync_state (
    branch            TEXT NOT NULL,
    collection        TEXT NOT NULL,
    last_sync_commit  TEXT,
    last_sync_at      TEXT,
    doc_count         INTEGER NOT NULL DEFAULT 0,
    chunk_count       INTEGER NOT NULL DEFAULT 0,
    embedding_model   TEXT NOT NULL,
    status            TEXT NOT NULL,
    error_message     TEXT,
    PRIMARY KEY (branch, collection)
);

CREATE TABLE IF NOT EXISTS deletion_tracker (
    branch        TEXT NOT NULL,
    collection    TEXT NOT NULL,
    doc_id        TEXT NOT NULL,
    deleted_at    TEXT NOT NULL,
    committed_at  TEXT,
    PRIMARY KEY (branch, collection, doc_id)
);

CREATE TABLE IF NOT EXISTS document_sync_log (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    operation_id  TEXT,
    branch        TEXT NOT NULL,
    collection    TEXT NOT NULL,
    doc_id        TEXT NOT NULL,
    action        TEXT NOT NULL,
    content_hash  TEXT,
    applied_at    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_operations (
    id           TEXT PRIMARY KEY,
    kind         TEXT NOT NULL,
    branch       TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    outcome      TEXT,
    error        TEXT
);
"#;

/// Handle to the sidecar database.
pub struct SidecarDb {
    conn: Mutex<Connection>,
}

impl SidecarDb {
    /// Open (and migrate) the sidecar database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory sidecar for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StorageError::transaction("sidecar connection mutex poisoned"))
    }

    // ------------------------------------------------------------------
    // sync_state
    // ------------------------------------------------------------------

    /// Atomic per-record write: insert or replace the (branch, collection) row.
    pub fn upsert_sync_state(&self, state: &SyncState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO sync_state
                (branch, collection, last_sync_commit, last_sync_at, doc_count,
                 chunk_count, embedding_model, status, error_message)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(branch, collection) DO UPDATE SET
                last_sync_commit = excluded.last_sync_commit,
                last_sync_at     = excluded.last_sync_at,
                doc_count        = excluded.doc_count,
                chunk_count      = excluded.chunk_count,
                embedding_model  = excluded.embedding_model,
                status           = excluded.status,
                error_message    = excluded.error_message
            "#,
            params![
                state.branch,
                state.collection,
                state.last_sync_commit,
                state.last_sync_at,
                state.doc_count as i64,
                state.chunk_count as i64,
                state.embedding_model,
                state.status.as_str(),
                state.error_message,
            ],
        )?;
        Ok(())
    }

    pub fn get_sync_state(&self, branch: &str, collection: &str) -> Result<Option<SyncState>> {
        let conn = self.conn()?;
        let state = conn
            .query_row(
                r#"
                SELECT branch, collection, last_sync_commit, last_sync_at, doc_count,
                       chunk_count, embedding_model, status, error_message
                FROM sync_state WHERE branch = ?1 AND collection = ?2
                "#,
                params![branch, collection],
                row_to_sync_state,
            )
            .optional()?;
        Ok(state)
    }

    pub fn sync_states_for_branch(&self, branch: &str) -> Result<Vec<SyncState>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT branch, collection, last_sync_commit, last_sync_at, doc_count,
                   chunk_count, embedding_model, status, error_message
            FROM sync_state WHERE branch = ?1 ORDER BY collection
            "#,
        )?;
        let rows = stmt.query_map(params![branch], row_to_sync_state)?;
        let mut states = Vec::new();
        for row in rows {
            states.push(row?);
        }
        Ok(states)
    }

    /// Persist the `in_progress` transition. Must land before any embedding
    /// store mutation begins so an interrupted run is resumable.
    pub fn mark_in_progress(
        &self,
        branch: &str,
        collection: &str,
        embedding_model: &str,
    ) -> Result<()> {
        let mut state = self
            .get_sync_state(branch, collection)?
            .unwrap_or_else(|| SyncState::pending(branch, collection, embedding_model));
        state.status = SyncStatus::InProgress;
        state.error_message = None;
        self.upsert_sync_state(&state)
    }

    pub fn mark_error(&self, branch: &str, collection: &str, message: &str) -> Result<()> {
        if let Some(mut state) = self.get_sync_state(branch, collection)? {
            state.status = SyncStatus::Error;
            state.error_message = Some(message.to_string());
            self.upsert_sync_state(&state)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // deletion_tracker
    // ------------------------------------------------------------------

    /// Record a deletion as pending. Re-recording an existing pending
    /// deletion keeps the original `deleted_at`.
    pub fn record_deletion(&self, branch: &str, collection: &str, doc_id: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO deletion_tracker (branch, collection, doc_id, deleted_at, committed_at)
            VALUES (?1, ?2, ?3, ?4, NULL)
            ON CONFLICT(branch, collection, doc_id) DO NOTHING
            "#,
            params![branch, collection, doc_id, Utc::now()],
        )?;
        Ok(())
    }

    /// All pending deletions on a branch.
    pub fn pending_deletions(&self, branch: &str) -> Result<Vec<DeletionRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT branch, collection, doc_id, deleted_at, committed_at
            FROM deletion_tracker
            WHERE branch = ?1 AND committed_at IS NULL
            ORDER BY collection, doc_id
            "#,
        )?;
        let rows = stmt.query_map(params![branch], |row| {
            Ok(DeletionRecord {
                branch: row.get(0)?,
                collection: row.get(1)?,
                doc_id: row.get(2)?,
                deleted_at: row.get(3)?,
                committed_at: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Pending doc ids for one (branch, collection) pair, for delta union.
    pub fn pending_doc_ids(&self, branch: &str, collection: &str) -> Result<HashSet<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT doc_id FROM deletion_tracker
            WHERE branch = ?1 AND collection = ?2 AND committed_at IS NULL
            "#,
        )?;
        let rows = stmt.query_map(params![branch, collection], |row| row.get::<_, String>(0))?;
        let mut ids = HashSet::new();
        for row in rows {
            ids.insert(row?);
        }
        Ok(ids)
    }

    /// Mark one pending deletion as observed committed.
    pub fn mark_deletion_committed(
        &self,
        branch: &str,
        collection: &str,
        doc_id: &str,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE deletion_tracker SET committed_at = ?4
            WHERE branch = ?1 AND collection = ?2 AND doc_id = ?3 AND committed_at IS NULL
            "#,
            params![branch, collection, doc_id, Utc::now()],
        )?;
        Ok(changed > 0)
    }

    /// Mark every pending deletion on `branch` as observed committed.
    pub fn mark_deletions_committed(&self, branch: &str) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            r#"
            UPDATE deletion_tracker SET committed_at = ?2
            WHERE branch = ?1 AND committed_at IS NULL
            "#,
            params![branch, Utc::now()],
        )?;
        Ok(changed)
    }

    /// Drop all pending deletions for a branch (after a hard reset).
    pub fn discard_pending_for_branch(&self, branch: &str) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM deletion_tracker WHERE branch = ?1 AND committed_at IS NULL",
            params![branch],
        )?;
        Ok(changed)
    }

    /// GC records older than the retention window (default 30 days).
    pub fn cleanup_stale_deletions(&self, older_than: Option<Duration>) -> Result<usize> {
        let retention = older_than.unwrap_or_else(|| Duration::days(DELETION_RETENTION_DAYS));
        let cutoff: DateTime<Utc> = Utc::now() - retention;
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM deletion_tracker WHERE deleted_at < ?1",
            params![cutoff],
        )?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // audit tables (best-effort; callers log failures and move on)
    // ------------------------------------------------------------------

    pub fn log_document_action(
        &self,
        operation_id: Option<Uuid>,
        branch: &str,
        collection: &str,
        doc_id: &str,
        action: DocumentAction,
        content_hash: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO document_sync_log
                (operation_id, branch, collection, doc_id, action, content_hash, applied_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                operation_id.map(|id| id.to_string()),
                branch,
                collection,
                doc_id,
                action.as_str(),
                content_hash,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn begin_operation(&self, kind: &str, branch: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_operations (id, kind, branch, started_at) VALUES (?1, ?2, ?3, ?4)",
            params![id.to_string(), kind, branch, Utc::now()],
        )?;
        Ok(id)
    }

    pub fn finish_operation(
        &self,
        id: Uuid,
        outcome: OperationOutcome,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            r#"
            UPDATE sync_operations SET finished_at = ?2, outcome = ?3, error = ?4
            WHERE id = ?1
            "#,
            params![id.to_string(), Utc::now(), outcome.as_str(), error],
        )?;
        Ok(())
    }

    pub fn document_log_count(&self, branch: &str) -> Result<usize> {
        let conn = self.conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM document_sync_log WHERE branch = ?1",
            params![branch],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn row_to_sync_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncState> {
    let status_str: String = row.get(7)?;
    let status = SyncStatus::parse(&status_str).unwrap_or(SyncStatus::Error);
    Ok(SyncState {
        branch: row.get(0)?,
        collection: row.get(1)?,
        last_sync_commit: row.get(2)?,
        last_sync_at: row.get(3)?,
        doc_count: row.get::<_, i64>(4)? as usize,
        chunk_count: row.get::<_, i64>(5)? as usize,
        embedding_model: row.get(6)?,
        status,
        error_message: row.get(8)?,
    })
}
