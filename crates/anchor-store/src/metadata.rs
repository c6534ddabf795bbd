//! Durable relational store for pending memories, the identity-schema audit
//! trail, checklist items, and session archives.
//!
//! Concurrency discipline: WAL journal plus an in-process write mutex (the
//! `Arc<Mutex<Connection>>` serializes statements). Status transitions go
//! through [`MetadataStore::try_lock_pending`] /
//! [`MetadataStore::try_lock_change`] only: a single conditional UPDATE
//! whose affected-row count decides who holds the logical lock.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use anchor_types::checklist::{
    ChecklistItem, ChecklistPriority, ChecklistScope, ChecklistStatus,
};
use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::note::{MemoryLayer, NoteCategory};
use anchor_types::pending::{
    Approval, ChangeStatus, ChangeType, IdentityChange, PendingMemory, PendingStatus,
};
use anchor_types::session::SessionState;

use crate::migration::run_migrations;

/// Outcome of recording one approval on an identity change.
#[derive(Debug)]
pub enum ApprovalOutcome {
    /// Approval recorded; the updated row. A count at the threshold means
    /// the caller must now run the commit flow.
    Recorded(IdentityChange),
    /// The row left `pending` before we got there.
    LockMiss,
    /// This approver already approved the change.
    DuplicateApprover,
    /// The row is still pending but already carries enough approvals; a
    /// previous commit attempt was interrupted. The caller should finish
    /// the commit instead of recording another approval.
    Saturated(IdentityChange),
}

/// Relational metadata store over SQLite.
#[derive(Clone)]
pub struct MetadataStore {
    conn: Arc<Mutex<Connection>>,
}

impl MetadataStore {
    /// Open (or create) the store at the given path and run migrations.
    pub fn open(path: impl AsRef<Path>) -> AnchorResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.as_ref())
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory store. Used by tests.
    pub fn in_memory() -> AnchorResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AnchorResult<Self> {
        run_migrations(&conn).map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> AnchorResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AnchorError::Internal(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Pending memories
    // ------------------------------------------------------------------

    /// Insert a staged memory.
    pub fn insert_pending(&self, pending: &PendingMemory) -> AnchorResult<()> {
        let conn = self.lock()?;
        let approvals = serde_json::to_string(&pending.approvals)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO pending_memories
             (id, content, layer, category, confidence, change_type, proposer,
              reason, target_id, status, approvals, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                pending.id.to_string(),
                pending.content,
                pending.layer.as_str(),
                pending.category.map(|c| c.as_str()),
                pending.confidence,
                pending.change_type.as_str(),
                pending.proposer,
                pending.reason,
                pending.target_id.map(|t| t.to_string()),
                pending.status.as_str(),
                approvals,
                pending.created_at.to_rfc3339(),
                pending.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        debug!(id = %pending.id, layer = %pending.layer, "staged pending memory");
        Ok(())
    }

    /// Fetch one staged memory.
    pub fn get_pending(&self, id: Uuid) -> AnchorResult<Option<PendingMemory>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM pending_memories WHERE id = ?1",
            rusqlite::params![id.to_string()],
            row_to_pending,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// List staged memories, optionally filtered by status, newest first.
    pub fn list_pending(
        &self,
        status: Option<PendingStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<PendingMemory>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM pending_memories
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![status.map(|s| s.as_str()), limit as i64],
                row_to_pending,
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// The optimistic lock primitive for `pending_memories`: one conditional
    /// UPDATE on the status column. Returns the row iff exactly one row
    /// changed; None means another writer holds (or already released) the
    /// lock.
    pub fn try_lock_pending(
        &self,
        id: Uuid,
        expected: PendingStatus,
        new: PendingStatus,
    ) -> AnchorResult<Option<PendingMemory>> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE pending_memories SET status = ?3, updated_at = ?4
                 WHERE id = ?1 AND status = ?2",
                rusqlite::params![
                    id.to_string(),
                    expected.as_str(),
                    new.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        if affected != 1 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT * FROM pending_memories WHERE id = ?1",
            rusqlite::params![id.to_string()],
            row_to_pending,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// Append an approval to a staged memory without touching its status.
    pub fn record_pending_approval(&self, id: Uuid, approval: &Approval) -> AnchorResult<()> {
        let conn = self.lock()?;
        let approval_json = serde_json::to_string(approval)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "UPDATE pending_memories
             SET approvals = json_insert(approvals, '$[#]', json(?2)), updated_at = ?3
             WHERE id = ?1",
            rusqlite::params![id.to_string(), approval_json, Utc::now().to_rfc3339()],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Delete a staged memory (after a successful commit).
    pub fn delete_pending(&self, id: Uuid) -> AnchorResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_memories WHERE id = ?1",
            rusqlite::params![id.to_string()],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Expire staged memories created before the cutoff that are still
    /// pending. Returns how many rows moved.
    pub fn expire_pending_before(&self, cutoff: DateTime<Utc>) -> AnchorResult<usize> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE pending_memories SET status = 'expired', updated_at = ?2
                 WHERE status = 'pending' AND created_at < ?1",
                rusqlite::params![cutoff.to_rfc3339(), Utc::now().to_rfc3339()],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(affected)
    }

    // ------------------------------------------------------------------
    // Identity changes
    // ------------------------------------------------------------------

    /// Insert a change proposal.
    pub fn insert_change(&self, change: &IdentityChange) -> AnchorResult<()> {
        let conn = self.lock()?;
        let approvals = serde_json::to_string(&change.approvals)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO identity_changes
             (change_id, target_id, change_type, proposed_content, reason, category,
              status, approvals_count, approvals, proposer, created_at, updated_at, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            rusqlite::params![
                change.change_id.to_string(),
                change.target_id.map(|t| t.to_string()),
                change.change_type.as_str(),
                change.proposed_content,
                change.reason,
                change.category.map(|c| c.as_str()),
                change.status.as_str(),
                change.approvals_count,
                approvals,
                change.proposer,
                change.created_at.to_rfc3339(),
                change.updated_at.to_rfc3339(),
                change.applied_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Fetch one change proposal.
    pub fn get_change(&self, change_id: Uuid) -> AnchorResult<Option<IdentityChange>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM identity_changes WHERE change_id = ?1",
            rusqlite::params![change_id.to_string()],
            row_to_change,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// List change proposals, optionally by status, newest first.
    pub fn list_changes(
        &self,
        status: Option<ChangeStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<IdentityChange>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM identity_changes
                 WHERE (?1 IS NULL OR status = ?1)
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![status.map(|s| s.as_str()), limit as i64],
                row_to_change,
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// The optimistic lock primitive for `identity_changes`.
    pub fn try_lock_change(
        &self,
        change_id: Uuid,
        expected: ChangeStatus,
        new: ChangeStatus,
    ) -> AnchorResult<Option<IdentityChange>> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "UPDATE identity_changes SET status = ?3, updated_at = ?4
                 WHERE change_id = ?1 AND status = ?2",
                rusqlite::params![
                    change_id.to_string(),
                    expected.as_str(),
                    new.as_str(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        if affected != 1 {
            return Ok(None);
        }
        conn.query_row(
            "SELECT * FROM identity_changes WHERE change_id = ?1",
            rusqlite::params![change_id.to_string()],
            row_to_change,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// Record one approval atomically: append to the approvals array and bump
    /// the counter in a single conditional UPDATE. The duplicate-approver and
    /// saturation guards ride in the WHERE clause, so racing approvers can
    /// neither double-append one name nor push the count past the threshold.
    pub fn record_approval(
        &self,
        change_id: Uuid,
        approval: &Approval,
        needed: u32,
    ) -> AnchorResult<ApprovalOutcome> {
        let conn = self.lock()?;
        let approval_json = serde_json::to_string(approval)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        // serde_json emits {"approver":"<name>",...}; the LIKE pattern keys
        // on that exact shape.
        let duplicate_pattern = format!(
            "%\"approver\":{}%",
            serde_json::to_string(&approval.approver)
                .map_err(|e| AnchorError::Serialization(e.to_string()))?
        );
        let affected = conn
            .execute(
                "UPDATE identity_changes
                 SET approvals = json_insert(approvals, '$[#]', json(?2)),
                     approvals_count = approvals_count + 1,
                     updated_at = ?3
                 WHERE change_id = ?1 AND status = 'pending'
                   AND approvals_count < ?5 AND approvals NOT LIKE ?4",
                rusqlite::params![
                    change_id.to_string(),
                    approval_json,
                    Utc::now().to_rfc3339(),
                    duplicate_pattern,
                    needed,
                ],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;

        if affected == 1 {
            let row = conn
                .query_row(
                    "SELECT * FROM identity_changes WHERE change_id = ?1",
                    rusqlite::params![change_id.to_string()],
                    row_to_change,
                )
                .map_err(|e| AnchorError::Storage(e.to_string()))?;
            return Ok(ApprovalOutcome::Recorded(row));
        }

        // Zero rows: work out why for the caller's error taxonomy.
        let row = conn
            .query_row(
                "SELECT * FROM identity_changes WHERE change_id = ?1",
                rusqlite::params![change_id.to_string()],
                row_to_change,
            )
            .optional()
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        match row {
            None => Err(AnchorError::NotFound(format!("identity change {change_id}"))),
            Some(row)
                if row.status == ChangeStatus::Pending
                    && row.approvals.iter().any(|a| a.approver == approval.approver) =>
            {
                Ok(ApprovalOutcome::DuplicateApprover)
            }
            Some(row)
                if row.status == ChangeStatus::Pending && row.approvals_count >= needed =>
            {
                Ok(ApprovalOutcome::Saturated(row))
            }
            Some(_) => Ok(ApprovalOutcome::LockMiss),
        }
    }

    /// Stamp the applied time after a successful commit.
    pub fn set_applied_at(&self, change_id: Uuid, at: DateTime<Utc>) -> AnchorResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE identity_changes SET applied_at = ?2 WHERE change_id = ?1",
            rusqlite::params![change_id.to_string(), at.to_rfc3339()],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Checklist items
    // ------------------------------------------------------------------

    /// Insert a checklist item.
    pub fn insert_item(&self, item: &ChecklistItem) -> AnchorResult<()> {
        let conn = self.lock()?;
        let tags = serde_json::to_string(&item.tags)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO checklist_items
             (id, project_id, content, status, scope, priority, tags,
              created_at, updated_at, completed_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            rusqlite::params![
                item.id.to_string(),
                item.project_id,
                item.content,
                item.status.as_str(),
                item.scope.as_str(),
                item.priority.value(),
                tags,
                item.created_at.to_rfc3339(),
                item.updated_at.to_rfc3339(),
                item.completed_at.map(|t| t.to_rfc3339()),
                item.expires_at.map(|t| t.to_rfc3339()),
            ],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Replace a checklist item row.
    pub fn update_item(&self, item: &ChecklistItem) -> AnchorResult<()> {
        let conn = self.lock()?;
        let tags = serde_json::to_string(&item.tags)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        let affected = conn
            .execute(
                "UPDATE checklist_items
                 SET content = ?2, status = ?3, scope = ?4, priority = ?5, tags = ?6,
                     updated_at = ?7, completed_at = ?8, expires_at = ?9
                 WHERE id = ?1",
                rusqlite::params![
                    item.id.to_string(),
                    item.content,
                    item.status.as_str(),
                    item.scope.as_str(),
                    item.priority.value(),
                    tags,
                    item.updated_at.to_rfc3339(),
                    item.completed_at.map(|t| t.to_rfc3339()),
                    item.expires_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(AnchorError::NotFound(format!("checklist item {}", item.id)));
        }
        Ok(())
    }

    /// Fetch one checklist item.
    pub fn get_item(&self, id: Uuid) -> AnchorResult<Option<ChecklistItem>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT * FROM checklist_items WHERE id = ?1",
            rusqlite::params![id.to_string()],
            row_to_item,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// Find an item by the 8-char short id prefix within a project.
    pub fn get_item_by_short_id(
        &self,
        project_id: &str,
        prefix: &str,
    ) -> AnchorResult<Option<ChecklistItem>> {
        let conn = self.lock()?;
        // Ids are stored in hyphenated uuid form; the short id is the first
        // 8 hex chars, which precede the first hyphen.
        conn.query_row(
            "SELECT * FROM checklist_items WHERE project_id = ?1 AND id LIKE ?2 || '%'",
            rusqlite::params![project_id, prefix.to_lowercase()],
            row_to_item,
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// List items for a project, optionally by status and scope, ordered by
    /// `(priority asc, created_at asc)`.
    pub fn list_items(
        &self,
        project_id: &str,
        status: Option<ChecklistStatus>,
        scope: Option<ChecklistScope>,
        limit: usize,
    ) -> AnchorResult<Vec<ChecklistItem>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT * FROM checklist_items
                 WHERE project_id = ?1
                   AND (?2 IS NULL OR status = ?2)
                   AND (?3 IS NULL OR scope = ?3)
                 ORDER BY priority ASC, created_at ASC LIMIT ?4",
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map(
                rusqlite::params![
                    project_id,
                    status.map(|s| s.as_str()),
                    scope.map(|s| s.as_str()),
                    limit as i64
                ],
                row_to_item,
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        rows.collect::<Result<Vec<_>, _>>()
            .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    /// Delete a checklist item.
    pub fn delete_item(&self, id: Uuid) -> AnchorResult<()> {
        let conn = self.lock()?;
        let affected = conn
            .execute(
                "DELETE FROM checklist_items WHERE id = ?1",
                rusqlite::params![id.to_string()],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        if affected == 0 {
            return Err(AnchorError::NotFound(format!("checklist item {id}")));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Session archive
    // ------------------------------------------------------------------

    /// Archive a finished session. Upsert by session id.
    pub fn archive_session(
        &self,
        session: &SessionState,
        summary: Option<&str>,
    ) -> AnchorResult<()> {
        let conn = self.lock()?;
        let files = serde_json::to_string(&session.source_files)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO session_archive
             (session_id, started_at, ended_at, files_touched, memory_ops, file_mods, summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(session_id) DO UPDATE SET
                 ended_at = ?3, files_touched = ?4, memory_ops = ?5, file_mods = ?6, summary = ?7",
            rusqlite::params![
                session.session_id,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
                files,
                session.memory_ops_count,
                session.file_mods_count,
                summary,
            ],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Fetch an archived session.
    pub fn get_archived_session(&self, session_id: &str) -> AnchorResult<Option<SessionState>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT session_id, started_at, ended_at, files_touched, memory_ops, file_mods
             FROM session_archive WHERE session_id = ?1",
            rusqlite::params![session_id],
            |row| {
                let files: String = row.get(3)?;
                Ok(SessionState {
                    session_id: row.get(0)?,
                    started_at: parse_rfc3339(&row.get::<_, String>(1)?),
                    ended_at: row
                        .get::<_, Option<String>>(2)?
                        .map(|s| parse_rfc3339(&s)),
                    source_files: serde_json::from_str(&files).unwrap_or_default(),
                    memory_ops_count: row.get(4)?,
                    file_mods_count: row.get(5)?,
                })
            },
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
    }

    // ------------------------------------------------------------------
    // Crash recovery
    // ------------------------------------------------------------------

    /// Revert rows stuck in `processing` back to `pending`, annotating the
    /// reason column. Run on startup; returns (pending, identity) counts.
    pub fn recover_stuck_processing(&self) -> AnchorResult<(usize, usize)> {
        let conn = self.lock()?;
        let now = Utc::now().to_rfc3339();
        let pending = conn
            .execute(
                "UPDATE pending_memories
                 SET status = 'pending', updated_at = ?1,
                     reason = COALESCE(reason, '') || ' [expired lock]'
                 WHERE status = 'processing'",
                rusqlite::params![now],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let changes = conn
            .execute(
                "UPDATE identity_changes
                 SET status = 'pending', updated_at = ?1,
                     reason = reason || ' [expired lock]'
                 WHERE status = 'processing'",
                rusqlite::params![now],
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        if pending > 0 || changes > 0 {
            warn!(pending, changes, "reverted stuck processing rows on startup");
        }
        Ok((pending, changes))
    }

    /// Ids of staged memories that ended rejected or expired. The startup
    /// sweep soft-deletes any vector point still carrying one of these.
    pub fn rejected_or_expired_ids(&self) -> AnchorResult<Vec<Uuid>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare("SELECT id FROM pending_memories WHERE status IN ('rejected', 'expired')")
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let mut ids = Vec::new();
        for row in rows {
            let raw = row.map_err(|e| AnchorError::Storage(e.to_string()))?;
            if let Ok(id) = Uuid::parse_str(&raw) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

fn parse_rfc3339(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_pending(row: &Row<'_>) -> rusqlite::Result<PendingMemory> {
    let id: String = row.get("id")?;
    let layer: String = row.get("layer")?;
    let category: Option<String> = row.get("category")?;
    let change_type: String = row.get("change_type")?;
    let target_id: Option<String> = row.get("target_id")?;
    let status: String = row.get("status")?;
    let approvals: String = row.get("approvals")?;
    Ok(PendingMemory {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        content: row.get("content")?,
        layer: MemoryLayer::parse(&layer).unwrap_or(MemoryLayer::VerifiedFact),
        category: category.and_then(|c| NoteCategory::parse(&c).ok()),
        confidence: row.get("confidence")?,
        change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Create),
        proposer: row.get("proposer")?,
        reason: row.get("reason")?,
        target_id: target_id.and_then(|t| Uuid::parse_str(&t).ok()),
        status: PendingStatus::parse(&status).unwrap_or(PendingStatus::Pending),
        approvals: serde_json::from_str(&approvals).unwrap_or_default(),
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?),
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?),
    })
}

fn row_to_change(row: &Row<'_>) -> rusqlite::Result<IdentityChange> {
    let change_id: String = row.get("change_id")?;
    let target_id: Option<String> = row.get("target_id")?;
    let change_type: String = row.get("change_type")?;
    let category: Option<String> = row.get("category")?;
    let status: String = row.get("status")?;
    let approvals: String = row.get("approvals")?;
    let applied_at: Option<String> = row.get("applied_at")?;
    Ok(IdentityChange {
        change_id: Uuid::parse_str(&change_id).unwrap_or_default(),
        target_id: target_id.and_then(|t| Uuid::parse_str(&t).ok()),
        change_type: ChangeType::parse(&change_type).unwrap_or(ChangeType::Create),
        proposed_content: row.get("proposed_content")?,
        reason: row.get("reason")?,
        category: category.and_then(|c| NoteCategory::parse(&c).ok()),
        status: ChangeStatus::parse(&status).unwrap_or(ChangeStatus::Pending),
        approvals_count: row.get("approvals_count")?,
        approvals: serde_json::from_str(&approvals).unwrap_or_default(),
        proposer: row.get("proposer")?,
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?),
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?),
        applied_at: applied_at.map(|s| parse_rfc3339(&s)),
    })
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<ChecklistItem> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let scope: String = row.get("scope")?;
    let priority: u8 = row.get("priority")?;
    let tags: String = row.get("tags")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;
    Ok(ChecklistItem {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        project_id: row.get("project_id")?,
        content: row.get("content")?,
        status: ChecklistStatus::parse(&status).unwrap_or(ChecklistStatus::Open),
        scope: ChecklistScope::parse(&scope).unwrap_or(ChecklistScope::Project),
        priority: ChecklistPriority::try_from(priority).unwrap_or(ChecklistPriority::Normal),
        tags: serde_json::from_str(&tags).unwrap_or_default(),
        created_at: parse_rfc3339(&row.get::<_, String>("created_at")?),
        updated_at: parse_rfc3339(&row.get::<_, String>("updated_at")?),
        completed_at: completed_at.map(|s| parse_rfc3339(&s)),
        expires_at: expires_at.map(|s| parse_rfc3339(&s)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pending(status: PendingStatus) -> PendingMemory {
        PendingMemory {
            id: Uuid::new_v4(),
            content: "Possibly switch to Redis".to_string(),
            layer: MemoryLayer::VerifiedFact,
            category: None,
            confidence: 0.8,
            change_type: ChangeType::Create,
            proposer: "agent".to_string(),
            reason: Some("extraction".to_string()),
            target_id: None,
            status,
            approvals: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn sample_change() -> IdentityChange {
        IdentityChange {
            change_id: Uuid::new_v4(),
            target_id: None,
            change_type: ChangeType::Create,
            proposed_content: "Project is Memory Anchor".to_string(),
            reason: "bootstrap".to_string(),
            category: None,
            status: ChangeStatus::Pending,
            approvals_count: 0,
            approvals: Vec::new(),
            proposer: "human".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            applied_at: None,
        }
    }

    fn approval(name: &str) -> Approval {
        Approval {
            approver: name.to_string(),
            comment: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_pending_round_trip() {
        let store = MetadataStore::in_memory().unwrap();
        let pending = sample_pending(PendingStatus::Pending);
        store.insert_pending(&pending).unwrap();

        let loaded = store.get_pending(pending.id).unwrap().unwrap();
        assert_eq!(loaded.content, pending.content);
        assert_eq!(loaded.status, PendingStatus::Pending);
        assert_eq!(loaded.confidence, 0.8);

        let listed = store.list_pending(Some(PendingStatus::Pending), 10).unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn test_try_lock_single_winner() {
        let store = MetadataStore::in_memory().unwrap();
        let pending = sample_pending(PendingStatus::Pending);
        store.insert_pending(&pending).unwrap();

        let first = store
            .try_lock_pending(pending.id, PendingStatus::Pending, PendingStatus::Processing)
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().status, PendingStatus::Processing);

        // Second locker misses.
        let second = store
            .try_lock_pending(pending.id, PendingStatus::Pending, PendingStatus::Processing)
            .unwrap();
        assert!(second.is_none());

        // Release and relock.
        store
            .try_lock_pending(pending.id, PendingStatus::Processing, PendingStatus::Pending)
            .unwrap()
            .unwrap();
        assert!(store
            .try_lock_pending(pending.id, PendingStatus::Pending, PendingStatus::Processing)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_record_approval_counts_and_duplicates() {
        let store = MetadataStore::in_memory().unwrap();
        let change = sample_change();
        store.insert_change(&change).unwrap();

        let out = store.record_approval(change.change_id, &approval("a"), 3).unwrap();
        let row = match out {
            ApprovalOutcome::Recorded(r) => r,
            other => panic!("expected Recorded, got {other:?}"),
        };
        assert_eq!(row.approvals_count, 1);
        assert_eq!(row.approvals.len(), 1);

        // Same approver again is rejected without touching the row.
        let out = store.record_approval(change.change_id, &approval("a"), 3).unwrap();
        assert!(matches!(out, ApprovalOutcome::DuplicateApprover));
        let row = store.get_change(change.change_id).unwrap().unwrap();
        assert_eq!(row.approvals_count, 1);

        let out = store.record_approval(change.change_id, &approval("b"), 3).unwrap();
        assert!(matches!(out, ApprovalOutcome::Recorded(_)));
        let out = store.record_approval(change.change_id, &approval("c"), 3).unwrap();
        let row = match out {
            ApprovalOutcome::Recorded(r) => r,
            other => panic!("expected Recorded, got {other:?}"),
        };
        assert_eq!(row.approvals_count, 3);
        assert_eq!(row.approvals_count as usize, row.approvals.len());
    }

    #[test]
    fn test_record_approval_after_apply_misses_lock() {
        let store = MetadataStore::in_memory().unwrap();
        let change = sample_change();
        store.insert_change(&change).unwrap();
        store
            .try_lock_change(change.change_id, ChangeStatus::Pending, ChangeStatus::Applied)
            .unwrap()
            .unwrap();

        let out = store.record_approval(change.change_id, &approval("d"), 3).unwrap();
        assert!(matches!(out, ApprovalOutcome::LockMiss));
    }

    #[test]
    fn test_recover_stuck_processing() {
        let store = MetadataStore::in_memory().unwrap();
        let pending = sample_pending(PendingStatus::Processing);
        store.insert_pending(&pending).unwrap();
        let mut change = sample_change();
        change.status = ChangeStatus::Processing;
        store.insert_change(&change).unwrap();

        let (p, c) = store.recover_stuck_processing().unwrap();
        assert_eq!((p, c), (1, 1));

        let loaded = store.get_pending(pending.id).unwrap().unwrap();
        assert_eq!(loaded.status, PendingStatus::Pending);
        assert!(loaded.reason.unwrap().contains("expired lock"));
        let loaded = store.get_change(change.change_id).unwrap().unwrap();
        assert_eq!(loaded.status, ChangeStatus::Pending);
    }

    #[test]
    fn test_expire_pending_before() {
        let store = MetadataStore::in_memory().unwrap();
        let mut old = sample_pending(PendingStatus::Pending);
        old.created_at = Utc::now() - chrono::Duration::days(30);
        store.insert_pending(&old).unwrap();
        let fresh = sample_pending(PendingStatus::Pending);
        store.insert_pending(&fresh).unwrap();

        let moved = store
            .expire_pending_before(Utc::now() - chrono::Duration::days(7))
            .unwrap();
        assert_eq!(moved, 1);
        assert_eq!(
            store.get_pending(old.id).unwrap().unwrap().status,
            PendingStatus::Expired
        );
        assert_eq!(
            store.get_pending(fresh.id).unwrap().unwrap().status,
            PendingStatus::Pending
        );
        assert_eq!(store.rejected_or_expired_ids().unwrap(), vec![old.id]);
    }

    #[test]
    fn test_checklist_crud_and_ordering() {
        let store = MetadataStore::in_memory().unwrap();
        let mut first = ChecklistItem {
            id: Uuid::new_v4(),
            project_id: "demo".to_string(),
            content: "ship release".to_string(),
            status: ChecklistStatus::Open,
            scope: ChecklistScope::Project,
            priority: ChecklistPriority::Critical,
            tags: vec!["release".to_string()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            completed_at: None,
            expires_at: None,
        };
        let second = ChecklistItem {
            priority: ChecklistPriority::Low,
            id: Uuid::new_v4(),
            content: "tidy docs".to_string(),
            ..first.clone()
        };
        store.insert_item(&second).unwrap();
        store.insert_item(&first).unwrap();

        let items = store.list_items("demo", Some(ChecklistStatus::Open), None, 10).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].content, "ship release");

        first.status = ChecklistStatus::Done;
        first.completed_at = Some(Utc::now());
        store.update_item(&first).unwrap();
        let open = store.list_items("demo", Some(ChecklistStatus::Open), None, 10).unwrap();
        assert_eq!(open.len(), 1);

        let by_short = store
            .get_item_by_short_id("demo", &second.short_id())
            .unwrap()
            .unwrap();
        assert_eq!(by_short.id, second.id);

        store.delete_item(second.id).unwrap();
        assert!(store.get_item(second.id).unwrap().is_none());
    }

    #[test]
    fn test_session_archive_round_trip() {
        let store = MetadataStore::in_memory().unwrap();
        let mut session = SessionState::new("sess-42");
        session.record_file("src/lib.rs");
        session.record_memory_op();
        session.ended_at = Some(Utc::now());

        store.archive_session(&session, Some("touched lib")).unwrap();
        let loaded = store.get_archived_session("sess-42").unwrap().unwrap();
        assert_eq!(loaded.memory_ops_count, 1);
        assert_eq!(loaded.source_files.len(), 1);
        assert!(loaded.ended_at.is_some());
    }
}
