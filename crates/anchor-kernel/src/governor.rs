//! Identity-schema governance.
//!
//! L0 entries never reach either store except through the three-approval
//! state machine implemented here. Every status transition runs through the
//! metadata store's optimistic-lock primitive, so concurrent approvers
//! resolve to exactly one winner.
//!
//! The governor depends on the [`StateTransitioner`] trait rather than the
//! kernel, which keeps the kernel ↔ governor ↔ metadata-store dependency
//! acyclic: the kernel constructs both and holds the strong handles.

use chrono::Utc;
use serde_json::json;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;

use anchor_store::metadata::{ApprovalOutcome, MetadataStore};
use anchor_store::payload::{keys, NotePayload};
use anchor_store::filter::{Condition, PayloadFilter};
use anchor_store::vector::{Point, VectorIndex};
use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::event::KernelEvent;
use anchor_types::note::{MemoryLayer, Note, NoteCategory, NoteId};
use anchor_types::pending::{Approval, ChangeStatus, ChangeType, IdentityChange};

use crate::embedder::Embedder;
use crate::events::EventSink;

/// Required approvals for any identity-schema change.
pub const APPROVALS_NEEDED: u32 = 3;

/// Upper bound on the in-memory identity snapshot.
const SNAPSHOT_LIMIT: usize = 20;

/// Status-transition surface the governor needs from the metadata store.
pub trait StateTransitioner: Send + Sync {
    /// Insert a change proposal.
    fn insert_change(&self, change: &IdentityChange) -> AnchorResult<()>;
    /// Fetch one proposal.
    fn get_change(&self, change_id: Uuid) -> AnchorResult<Option<IdentityChange>>;
    /// List proposals by status.
    fn list_changes(
        &self,
        status: Option<ChangeStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<IdentityChange>>;
    /// Atomically record one approval, capped at `needed`.
    fn record_approval(
        &self,
        change_id: Uuid,
        approval: &Approval,
        needed: u32,
    ) -> AnchorResult<ApprovalOutcome>;
    /// The optimistic lock primitive.
    fn try_lock_change(
        &self,
        change_id: Uuid,
        expected: ChangeStatus,
        new: ChangeStatus,
    ) -> AnchorResult<Option<IdentityChange>>;
    /// Stamp the applied time.
    fn set_applied_at(&self, change_id: Uuid, at: chrono::DateTime<Utc>) -> AnchorResult<()>;
}

impl StateTransitioner for MetadataStore {
    fn insert_change(&self, change: &IdentityChange) -> AnchorResult<()> {
        MetadataStore::insert_change(self, change)
    }

    fn get_change(&self, change_id: Uuid) -> AnchorResult<Option<IdentityChange>> {
        MetadataStore::get_change(self, change_id)
    }

    fn list_changes(
        &self,
        status: Option<ChangeStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<IdentityChange>> {
        MetadataStore::list_changes(self, status, limit)
    }

    fn record_approval(
        &self,
        change_id: Uuid,
        approval: &Approval,
        needed: u32,
    ) -> AnchorResult<ApprovalOutcome> {
        MetadataStore::record_approval(self, change_id, approval, needed)
    }

    fn try_lock_change(
        &self,
        change_id: Uuid,
        expected: ChangeStatus,
        new: ChangeStatus,
    ) -> AnchorResult<Option<IdentityChange>> {
        MetadataStore::try_lock_change(self, change_id, expected, new)
    }

    fn set_applied_at(&self, change_id: Uuid, at: chrono::DateTime<Utc>) -> AnchorResult<()> {
        MetadataStore::set_applied_at(self, change_id, at)
    }
}

/// A change proposal as submitted by a caller.
#[derive(Debug, Clone)]
pub struct ProposeChange {
    /// Proposed entry content.
    pub content: String,
    /// Create, update, or delete.
    pub change_type: ChangeType,
    /// Existing entry, required for update/delete.
    pub target_id: Option<Uuid>,
    /// Optional category.
    pub category: Option<NoteCategory>,
    /// Why the change is needed.
    pub reason: String,
    /// Who proposed.
    pub proposer: String,
}

/// The identity-schema governor.
pub struct IdentityGovernor {
    store: Arc<dyn StateTransitioner>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn Embedder>,
    events: Arc<EventSink>,
    collection: String,
    /// Read-mostly snapshot of active L0 entries; writers swap in a fresh
    /// list built off-line.
    snapshot: RwLock<Vec<Note>>,
}

impl IdentityGovernor {
    /// Construct the governor and load the initial snapshot.
    pub fn new(
        store: Arc<dyn StateTransitioner>,
        index: Arc<dyn VectorIndex>,
        embedder: Arc<dyn Embedder>,
        events: Arc<EventSink>,
        collection: impl Into<String>,
    ) -> AnchorResult<Self> {
        let governor = Self {
            store,
            index,
            embedder,
            events,
            collection: collection.into(),
            snapshot: RwLock::new(Vec::new()),
        };
        governor.reload_snapshot()?;
        Ok(governor)
    }

    /// Propose an identity-schema change. Returns the pending proposal.
    pub fn propose(&self, request: ProposeChange) -> AnchorResult<IdentityChange> {
        if request.content.trim().is_empty() {
            return Err(AnchorError::InvalidArgument(
                "proposed content must not be empty".to_string(),
            ));
        }
        if matches!(request.change_type, ChangeType::Update | ChangeType::Delete)
            && request.target_id.is_none()
        {
            return Err(AnchorError::InvalidArgument(format!(
                "{} proposals require a target_id",
                request.change_type.as_str()
            )));
        }

        let now = Utc::now();
        let change = IdentityChange {
            change_id: Uuid::new_v4(),
            target_id: request.target_id,
            change_type: request.change_type,
            proposed_content: request.content,
            reason: request.reason,
            category: request.category,
            status: ChangeStatus::Pending,
            approvals_count: 0,
            approvals: Vec::new(),
            proposer: request.proposer,
            created_at: now,
            updated_at: now,
            applied_at: None,
        };
        self.store.insert_change(&change)?;
        info!(change_id = %change.change_id, change_type = change.change_type.as_str(), "identity change proposed");
        self.events.emit(&KernelEvent::IdentityProposed {
            change_id: change.change_id,
        });
        Ok(change)
    }

    /// Record one approval. On the third distinct approval the change is
    /// committed to both stores and the snapshot refreshed.
    ///
    /// Errors: `Governance` for a duplicate approver, `Conflict` when the
    /// proposal is not pending (applied, rejected, or mid-commit elsewhere).
    pub fn approve(
        &self,
        change_id: Uuid,
        approver: &str,
        comment: Option<String>,
    ) -> AnchorResult<IdentityChange> {
        let approval = Approval {
            approver: approver.to_string(),
            comment,
            timestamp: Utc::now(),
        };
        let row = match self
            .store
            .record_approval(change_id, &approval, APPROVALS_NEEDED)?
        {
            ApprovalOutcome::Recorded(row) => row,
            ApprovalOutcome::DuplicateApprover => {
                return Err(AnchorError::Governance(format!(
                    "approver '{approver}' already approved change {change_id}"
                )));
            }
            ApprovalOutcome::LockMiss => {
                return Err(AnchorError::Conflict(format!(
                    "change {change_id} is not pending"
                )));
            }
            // An earlier commit attempt was interrupted after the final
            // approval; finish it instead of recording a new one.
            ApprovalOutcome::Saturated(row) => return self.commit(row),
        };
        debug!(change_id = %change_id, approvals = row.approvals_count, "approval recorded");

        if row.approvals_count < APPROVALS_NEEDED {
            return Ok(row);
        }
        self.commit(row)
    }

    /// Reject a pending proposal.
    pub fn reject(&self, change_id: Uuid) -> AnchorResult<IdentityChange> {
        let row = self
            .store
            .try_lock_change(change_id, ChangeStatus::Pending, ChangeStatus::Rejected)?
            .ok_or_else(|| {
                AnchorError::Conflict(format!("change {change_id} is not pending"))
            })?;
        info!(change_id = %change_id, "identity change rejected");
        self.events
            .emit(&KernelEvent::IdentityRejected { change_id });
        Ok(row)
    }

    /// Expire a pending proposal that aged out without a decision.
    pub fn expire(&self, change_id: Uuid) -> AnchorResult<IdentityChange> {
        self.store
            .try_lock_change(change_id, ChangeStatus::Pending, ChangeStatus::Expired)?
            .ok_or_else(|| AnchorError::Conflict(format!("change {change_id} is not pending")))
    }

    /// List proposals by status.
    pub fn list(
        &self,
        status: Option<ChangeStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<IdentityChange>> {
        self.store.list_changes(status, limit)
    }

    /// Current in-memory identity snapshot, bounded and read-mostly.
    pub fn snapshot(&self) -> Vec<Note> {
        self.snapshot.read().map(|s| s.clone()).unwrap_or_default()
    }

    /// Rebuild the snapshot from the vector store mirror.
    pub fn reload_snapshot(&self) -> AnchorResult<()> {
        let filter = PayloadFilter::all()
            .and(Condition::eq(keys::LAYER, MemoryLayer::IdentitySchema.as_str()))
            .and(Condition::eq(keys::IS_ACTIVE, true));
        let page = self
            .index
            .scroll(&self.collection, &filter, None, SNAPSHOT_LIMIT)?;
        let mut entries = Vec::with_capacity(page.points.len());
        for point in page.points {
            match NotePayload::note_from_map(point.id, &point.payload) {
                Ok(note) => entries.push(note),
                Err(e) => warn!(id = %point.id, error = %e, "skipping unreadable identity entry"),
            }
        }
        if let Ok(mut snapshot) = self.snapshot.write() {
            *snapshot = entries;
        }
        Ok(())
    }

    /// Commit a fully-approved change: lock, apply to both stores with
    /// compensation, finalize. Exactly one caller wins the lock; the rest
    /// observe `Conflict`.
    fn commit(&self, row: IdentityChange) -> AnchorResult<IdentityChange> {
        let change_id = row.change_id;
        let locked = self
            .store
            .try_lock_change(change_id, ChangeStatus::Pending, ChangeStatus::Processing)?
            .ok_or_else(|| {
                AnchorError::Conflict(format!("change {change_id} is mid-commit elsewhere"))
            })?;

        let mirror_id = match self.apply_to_stores(&locked) {
            Ok(mirror_id) => mirror_id,
            Err(err) => {
                self.release_lock(change_id);
                return Err(err);
            }
        };

        let finalize = || -> AnchorResult<IdentityChange> {
            let applied = self
                .store
                .try_lock_change(change_id, ChangeStatus::Processing, ChangeStatus::Applied)?
                .ok_or_else(|| {
                    AnchorError::Internal(format!(
                        "change {change_id} left processing during commit"
                    ))
                })?;
            let now = Utc::now();
            self.store.set_applied_at(change_id, now)?;
            Ok(IdentityChange {
                applied_at: Some(now),
                ..applied
            })
        };
        match finalize() {
            Ok(row) => {
                // The change is committed; a stale snapshot self-heals on
                // the next reload.
                if let Err(err) = self.reload_snapshot() {
                    warn!(change_id = %change_id, error = %err, "snapshot reload failed after apply");
                }
                info!(change_id = %change_id, "identity change applied");
                self.events.emit(&KernelEvent::IdentityApplied { change_id });
                Ok(row)
            }
            Err(err) => {
                // The vector mirror landed but the metadata side did not:
                // soft-delete the mirror and release the lock for a retry.
                if let Some(id) = mirror_id {
                    let mut partial = serde_json::Map::new();
                    partial.insert(keys::IS_ACTIVE.into(), json!(false));
                    if let Err(comp_err) =
                        self.index.update_payload(&self.collection, id, partial)
                    {
                        warn!(change_id = %change_id, id = %id, error = %comp_err, "compensation failed");
                    }
                }
                self.release_lock(change_id);
                Err(err)
            }
        }
    }

    /// Best-effort release of the processing lock back to pending.
    fn release_lock(&self, change_id: Uuid) {
        if let Err(err) =
            self.store
                .try_lock_change(change_id, ChangeStatus::Processing, ChangeStatus::Pending)
        {
            warn!(change_id = %change_id, error = %err, "failed to release commit lock");
        }
    }

    /// The dual-store write: vector mirror first (hard to roll back), with
    /// soft-delete as the compensator if the rest of the commit fails.
    /// Returns the mirror point id so the caller can compensate.
    fn apply_to_stores(&self, change: &IdentityChange) -> AnchorResult<Option<Uuid>> {
        match change.change_type {
            ChangeType::Create => {
                let entry_id = NoteId::new();
                let note = Note {
                    id: entry_id,
                    content: change.proposed_content.clone(),
                    layer: MemoryLayer::IdentitySchema,
                    category: change.category,
                    confidence: 1.0,
                    created_at: Utc::now(),
                    valid_at: None,
                    expires_at: None,
                    created_by: change.proposer.clone(),
                    session_id: None,
                    related_files: Vec::new(),
                    is_active: true,
                };
                let vector = self.embedder.embed(&note.content)?;
                self.index.upsert(
                    &self.collection,
                    Point {
                        id: entry_id.0,
                        vector,
                        payload: NotePayload::from_note(&note).to_map(),
                    },
                )?;
                Ok(Some(entry_id.0))
            }
            ChangeType::Update => {
                let target = change.target_id.ok_or_else(|| {
                    AnchorError::InvalidArgument("update change lost its target_id".to_string())
                })?;
                let vector = self.embedder.embed(&change.proposed_content)?;
                let mut partial = serde_json::Map::new();
                partial.insert(keys::CONTENT.into(), json!(change.proposed_content));
                // Replace the embedding alongside the content.
                self.index.upsert(
                    &self.collection,
                    Point {
                        id: target,
                        vector,
                        payload: self.refreshed_payload(target, partial)?,
                    },
                )?;
                Ok(Some(target))
            }
            ChangeType::Delete => {
                let target = change.target_id.ok_or_else(|| {
                    AnchorError::InvalidArgument("delete change lost its target_id".to_string())
                })?;
                let mut partial = serde_json::Map::new();
                partial.insert(keys::IS_ACTIVE.into(), json!(false));
                self.index
                    .update_payload(&self.collection, target, partial)?;
                // A soft-delete is its own compensator; nothing to undo.
                Ok(None)
            }
        }
    }

    /// Fetch the current payload of a mirrored entry and merge a partial
    /// update into it.
    fn refreshed_payload(
        &self,
        id: Uuid,
        partial: serde_json::Map<String, serde_json::Value>,
    ) -> AnchorResult<serde_json::Map<String, serde_json::Value>> {
        let current = self
            .snapshot()
            .into_iter()
            .find(|n| n.id.0 == id)
            .ok_or_else(|| AnchorError::NotFound(format!("identity entry {id}")))?;
        let mut payload = NotePayload::from_note(&current).to_map();
        for (key, value) in partial {
            payload.insert(key, value);
        }
        Ok(payload)
    }
}
