//! The Memory Kernel: the single synchronous write and query surface over
//! both stores.
//!
//! Every write funnels through here. The dual-store discipline is fixed:
//! the vector side goes first because it cannot be rolled back, and any
//! later failure soft-deletes the point as compensation. Status transitions
//! on staged rows use the metadata store's optimistic lock, so concurrent
//! approvers resolve to one winner and the rest see `Conflict`.

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use anchor_store::filter::{Condition, PayloadFilter};
use anchor_store::metadata::MetadataStore;
use anchor_store::payload::{keys, NotePayload};
use anchor_store::vector::{Point, VectorIndex};
use anchor_types::config::AnchorConfig;
use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::event::KernelEvent;
use anchor_types::note::{MemoryLayer, Note, NoteCategory, NoteId, SearchHit};
use anchor_types::pending::{Approval, ChangeType, PendingMemory, PendingStatus};
use anchor_types::session::SessionState;

use crate::budget::{BudgetManager, BudgetReport};
use crate::checklist::ChecklistEngine;
use crate::conflict::{ConflictConfig, ConflictDetector, ConflictWarning};
use crate::embedder::Embedder;
use crate::events::EventSink;
use crate::export;
use crate::governor::{IdentityGovernor, ProposeChange};
use crate::safety::{Finding, SafetyFilter};
use crate::session::SessionTracker;
use crate::temporal::TemporalQuery;

/// Pending-memory transition surface the kernel needs from the metadata
/// store. A trait so tests can inject failures between the two halves of
/// the dual-store write.
pub trait PendingStore: Send + Sync {
    fn insert_pending(&self, pending: &PendingMemory) -> AnchorResult<()>;
    fn get_pending(&self, id: Uuid) -> AnchorResult<Option<PendingMemory>>;
    fn list_pending(
        &self,
        status: Option<PendingStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<PendingMemory>>;
    fn try_lock_pending(
        &self,
        id: Uuid,
        expected: PendingStatus,
        new: PendingStatus,
    ) -> AnchorResult<Option<PendingMemory>>;
    fn record_pending_approval(&self, id: Uuid, approval: &Approval) -> AnchorResult<()>;
    fn delete_pending(&self, id: Uuid) -> AnchorResult<()>;
}

impl PendingStore for MetadataStore {
    fn insert_pending(&self, pending: &PendingMemory) -> AnchorResult<()> {
        MetadataStore::insert_pending(self, pending)
    }

    fn get_pending(&self, id: Uuid) -> AnchorResult<Option<PendingMemory>> {
        MetadataStore::get_pending(self, id)
    }

    fn list_pending(
        &self,
        status: Option<PendingStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<PendingMemory>> {
        MetadataStore::list_pending(self, status, limit)
    }

    fn try_lock_pending(
        &self,
        id: Uuid,
        expected: PendingStatus,
        new: PendingStatus,
    ) -> AnchorResult<Option<PendingMemory>> {
        MetadataStore::try_lock_pending(self, id, expected, new)
    }

    fn record_pending_approval(&self, id: Uuid, approval: &Approval) -> AnchorResult<()> {
        MetadataStore::record_pending_approval(self, id, approval)
    }

    fn delete_pending(&self, id: Uuid) -> AnchorResult<()> {
        MetadataStore::delete_pending(self, id)
    }
}

/// A memory write request. Layer and category arrive as strings so legacy
/// aliases normalize in one place.
#[derive(Debug, Clone)]
pub struct AddMemoryRequest {
    pub content: String,
    pub layer: String,
    pub category: Option<String>,
    pub confidence: f64,
    pub created_by: String,
    pub session_id: Option<String>,
    pub related_files: Vec<String>,
    pub valid_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Optional operation deadline.
    pub deadline: Option<Instant>,
}

impl AddMemoryRequest {
    /// A verified-fact write with full confidence.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            layer: "verified_fact".to_string(),
            category: None,
            confidence: 1.0,
            created_by: "agent".to_string(),
            session_id: None,
            related_files: Vec::new(),
            valid_at: None,
            expires_at: None,
            deadline: None,
        }
    }
}

/// Where a write landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddStatus {
    /// Committed to the active stores.
    Saved,
    /// Staged in `pending_memories` awaiting approval.
    Pending,
    /// Routed to the governor as an identity-schema proposal.
    Proposed,
}

/// Result of `add_memory`.
#[derive(Debug, Clone)]
pub struct AddOutcome {
    /// Note id, pending id, or change proposal id, by status.
    pub id: Uuid,
    pub status: AddStatus,
    pub layer: MemoryLayer,
    pub confidence: f64,
    /// Advisory conflict result; present on the saved path.
    pub conflict_warning: Option<ConflictWarning>,
    /// What the safety filter flagged, if anything.
    pub safety_findings: Vec<Finding>,
}

/// A search request.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub layer: Option<String>,
    pub category: Option<String>,
    pub limit: usize,
    /// Overrides the configured score floor when set.
    pub min_score: Option<f32>,
    /// Point-in-time query.
    pub as_of: Option<DateTime<Utc>>,
    /// Validity-range query.
    pub range: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub include_expired: bool,
    /// Prepend the identity snapshot. On by default.
    pub include_identity_schema: bool,
    pub deadline: Option<Instant>,
}

impl SearchRequest {
    /// A plain query with defaults.
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            layer: None,
            category: None,
            limit: 5,
            min_score: None,
            as_of: None,
            range: None,
            include_expired: false,
            include_identity_schema: true,
            deadline: None,
        }
    }
}

/// An event-log append.
#[derive(Debug, Clone)]
pub struct LogEventRequest {
    pub content: String,
    /// When the event happened; defaults to now.
    pub occurred_at: Option<DateTime<Utc>>,
    /// Where, folded into the stored content.
    pub location: Option<String>,
    /// Who was involved, folded into the stored content.
    pub participants: Vec<String>,
    /// TTL in days; defaults to the configured session expiry.
    pub ttl_days: Option<i64>,
    pub created_by: String,
    pub session_id: Option<String>,
    pub deadline: Option<Instant>,
}

impl LogEventRequest {
    /// A plain event.
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            occurred_at: None,
            location: None,
            participants: Vec::new(),
            ttl_days: None,
            created_by: "agent".to_string(),
            session_id: None,
            deadline: None,
        }
    }
}

/// Store statistics.
#[derive(Debug, Clone)]
pub struct KernelStats {
    pub total: usize,
    pub active: usize,
    pub by_layer: BTreeMap<String, usize>,
    pub pending: usize,
    pub vector_dim: usize,
}

/// The memory kernel.
pub struct MemoryKernel {
    config: AnchorConfig,
    collection: String,
    index: Arc<dyn VectorIndex>,
    metadata: Arc<MetadataStore>,
    pending: Arc<dyn PendingStore>,
    embedder: Arc<dyn Embedder>,
    safety: SafetyFilter,
    budget: BudgetManager,
    conflict: ConflictDetector,
    governor: IdentityGovernor,
    events: Arc<EventSink>,
    sessions: SessionTracker,
    checklist: ChecklistEngine,
}

impl std::fmt::Debug for MemoryKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKernel")
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl MemoryKernel {
    /// Construct the kernel: validate config, check store readiness, ensure
    /// the collection, run crash recovery, and load the identity snapshot.
    pub fn new(
        config: AnchorConfig,
        index: Arc<dyn VectorIndex>,
        metadata: Arc<MetadataStore>,
        embedder: Arc<dyn Embedder>,
    ) -> AnchorResult<Self> {
        let pending: Arc<dyn PendingStore> = metadata.clone();
        Self::with_pending_store(config, index, metadata, pending, embedder)
    }

    /// Construction variant with an injectable pending store. Tests use this
    /// to exercise the compensation path.
    pub fn with_pending_store(
        config: AnchorConfig,
        index: Arc<dyn VectorIndex>,
        metadata: Arc<MetadataStore>,
        pending: Arc<dyn PendingStore>,
        embedder: Arc<dyn Embedder>,
    ) -> AnchorResult<Self> {
        config.validate()?;
        if embedder.dimensions() != config.vector.dim {
            return Err(AnchorError::DimensionMismatch {
                expected: config.vector.dim,
                actual: embedder.dimensions(),
            });
        }

        index.ping()?;
        let collection = config.collection_name();
        index.ensure_collection(&collection, config.vector.dim)?;

        // Crash recovery: release stuck locks, then sweep vector points
        // whose staged row ended rejected or expired.
        metadata.recover_stuck_processing()?;
        for id in metadata.rejected_or_expired_ids()? {
            if index.get(&collection, id)?.is_some() {
                let mut partial = serde_json::Map::new();
                partial.insert(keys::IS_ACTIVE.into(), json!(false));
                index.update_payload(&collection, id, partial)?;
                warn!(id = %id, "soft-deleted orphaned vector point during recovery");
            }
        }

        let events = Arc::new(EventSink::new());
        let governor = IdentityGovernor::new(
            metadata.clone(),
            index.clone(),
            embedder.clone(),
            events.clone(),
            collection.clone(),
        )?;
        let sessions = SessionTracker::new(metadata.clone(), events.clone());
        let checklist = ChecklistEngine::new(metadata.clone());

        info!(collection = %collection, dim = config.vector.dim, "memory kernel ready");
        Ok(Self {
            safety: SafetyFilter::new(config.safety.clone()),
            budget: BudgetManager::new(config.budget.clone()),
            conflict: ConflictDetector::new(ConflictConfig::default()),
            collection,
            config,
            index,
            metadata,
            pending,
            embedder,
            governor,
            events,
            sessions,
            checklist,
        })
    }

    /// The event sink, for hook subscription.
    pub fn events(&self) -> &Arc<EventSink> {
        &self.events
    }

    /// The identity governor.
    pub fn governor(&self) -> &IdentityGovernor {
        &self.governor
    }

    /// The checklist engine.
    pub fn checklist(&self) -> &ChecklistEngine {
        &self.checklist
    }

    /// The session tracker.
    pub fn sessions(&self) -> &SessionTracker {
        &self.sessions
    }

    /// Effective configuration snapshot.
    pub fn config(&self) -> &AnchorConfig {
        &self.config
    }

    /// Full identity-schema snapshot. Never queried by similarity.
    pub fn get_constitution(&self) -> Vec<Note> {
        self.governor.snapshot()
    }

    // ------------------------------------------------------------------
    // Write path
    // ------------------------------------------------------------------

    /// Add a memory: normalize, gate L0, filter, route by confidence,
    /// detect conflicts, and commit with compensation.
    pub fn add_memory(&self, request: AddMemoryRequest) -> AnchorResult<AddOutcome> {
        check_deadline(request.deadline)?;
        let now = Utc::now();

        // 1. Normalize enums; legacy aliases map here.
        let layer = MemoryLayer::parse(&request.layer)?;
        let category = request
            .category
            .as_deref()
            .map(NoteCategory::parse)
            .transpose()?;

        // 2. L0 writes go through governance, never directly.
        if layer == MemoryLayer::IdentitySchema {
            let change = self.governor.propose(ProposeChange {
                content: request.content,
                change_type: ChangeType::Create,
                target_id: None,
                category,
                reason: "proposed via add_memory".to_string(),
                proposer: request.created_by,
            })?;
            return Ok(AddOutcome {
                id: change.change_id,
                status: AddStatus::Proposed,
                layer,
                confidence: request.confidence,
                conflict_warning: None,
                safety_findings: Vec::new(),
            });
        }

        // 3. Safety filtering before anything persists.
        let filtered = self.safety.check(&request.content)?;
        if filtered.is_blocked() {
            let kinds: Vec<&str> = filtered.findings.iter().map(|f| f.kind.as_str()).collect();
            return Err(AnchorError::PolicyViolation(kinds.join(", ")));
        }
        let content = filtered.sanitized;
        let safety_findings = filtered.findings;

        // 4. Confidence routing.
        if !request.confidence.is_finite() || !(0.0..=1.0).contains(&request.confidence) {
            return Err(AnchorError::InvalidArgument(format!(
                "confidence {} outside [0, 1]",
                request.confidence
            )));
        }
        let auto_save = self.config.confidence.auto_save;
        let pending_min = self.config.confidence.pending_min;

        // 5. Bi-temporal defaults and validation.
        let valid_at = Some(request.valid_at.unwrap_or(now));
        if let (Some(v), Some(e)) = (valid_at, request.expires_at) {
            if v > e {
                return Err(AnchorError::InvalidArgument(format!(
                    "valid_at {v} is after expires_at {e}"
                )));
            }
        }

        if request.confidence < pending_min {
            return Err(AnchorError::LowConfidence(request.confidence));
        }
        if request.confidence < auto_save {
            // Stage without embedding; the vector is computed on approval.
            let pending = PendingMemory {
                id: Uuid::new_v4(),
                content,
                layer,
                category,
                confidence: request.confidence,
                change_type: ChangeType::Create,
                proposer: request.created_by,
                reason: None,
                target_id: None,
                status: PendingStatus::Pending,
                approvals: Vec::new(),
                created_at: now,
                updated_at: now,
            };
            self.pending.insert_pending(&pending)?;
            self.sessions.record_memory_op();
            return Ok(AddOutcome {
                id: pending.id,
                status: AddStatus::Pending,
                layer,
                confidence: request.confidence,
                conflict_warning: None,
                safety_findings,
            });
        }

        let note = Note {
            id: NoteId::new(),
            content,
            layer,
            category,
            confidence: request.confidence,
            created_at: now,
            valid_at,
            expires_at: request.expires_at,
            created_by: request.created_by,
            session_id: request
                .session_id
                .or_else(|| self.sessions.active_session_id()),
            related_files: request.related_files,
            is_active: true,
        };
        note.validate()?;

        // 6. Embed once; the same vector feeds detection and the write.
        check_deadline(request.deadline)?;
        let vector = self.embed_checked(&note.content)?;
        let warning = self
            .conflict
            .detect(&*self.index, &self.collection, &note, &vector);

        // 7. Commit under compensation.
        check_deadline(request.deadline)?;
        self.commit_note(&note, vector, || Ok(()))?;
        self.sessions.record_memory_op();

        debug!(id = %note.id, layer = %layer, "memory added");
        self.events.emit(&KernelEvent::MemoryAdded {
            id: note.id.0,
            layer,
            confidence: note.confidence,
            has_conflict: warning.has_conflict,
        });
        Ok(AddOutcome {
            id: note.id.0,
            status: AddStatus::Saved,
            layer,
            confidence: note.confidence,
            conflict_warning: Some(warning),
            safety_findings,
        })
    }

    /// The dual-store write. Vector first; `metadata_step` runs after and
    /// any failure there soft-deletes the point and releases reservations.
    fn commit_note(
        &self,
        note: &Note,
        vector: Vec<f32>,
        metadata_step: impl FnOnce() -> AnchorResult<()>,
    ) -> AnchorResult<()> {
        self.index.upsert(
            &self.collection,
            Point {
                id: note.id.0,
                vector,
                payload: NotePayload::from_note(note).to_map(),
            },
        )?;
        if let Err(err) = metadata_step() {
            let mut partial = serde_json::Map::new();
            partial.insert(keys::IS_ACTIVE.into(), json!(false));
            if let Err(comp_err) = self
                .index
                .update_payload(&self.collection, note.id.0, partial)
            {
                warn!(id = %note.id, error = %comp_err, "compensation failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Fetch one memory by id, soft-deleted ones included.
    pub fn get_memory(&self, id: Uuid) -> AnchorResult<Note> {
        let point = self
            .index
            .get(&self.collection, id)?
            .ok_or_else(|| AnchorError::NotFound(format!("memory {id}")))?;
        NotePayload::note_from_map(id, &point.payload)
    }

    /// Soft-delete a memory in both stores. The point stays fetchable by id
    /// but drops out of default search.
    pub fn delete_memory(&self, id: Uuid) -> AnchorResult<()> {
        // Existence check first so a bad id surfaces as NotFound.
        self.get_memory(id)?;
        let mut partial = serde_json::Map::new();
        partial.insert(keys::IS_ACTIVE.into(), json!(false));
        self.index.update_payload(&self.collection, id, partial)?;
        // A staged twin, if any, is closed out too.
        let _ = self
            .pending
            .try_lock_pending(id, PendingStatus::Pending, PendingStatus::Rejected)?;
        self.sessions.record_memory_op();
        self.events.emit(&KernelEvent::MemoryDeleted { id });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Pending approval flow
    // ------------------------------------------------------------------

    /// List staged memories.
    pub fn list_pending(&self, limit: usize) -> AnchorResult<Vec<PendingMemory>> {
        self.pending.list_pending(Some(PendingStatus::Pending), limit)
    }

    /// Approve and commit a staged memory.
    ///
    /// Exactly one concurrent approver wins the `pending -> processing`
    /// lock; the rest get `Conflict`. Failure after the vector write runs
    /// the compensation path and releases the lock for retry.
    pub fn approve_pending(
        &self,
        id: Uuid,
        approver: &str,
        deadline: Option<Instant>,
    ) -> AnchorResult<Note> {
        check_deadline(deadline)?;
        let locked = self
            .pending
            .try_lock_pending(id, PendingStatus::Pending, PendingStatus::Processing)?
            .ok_or_else(|| {
                AnchorError::Conflict(format!("pending memory {id} is not pending"))
            })?;

        let commit = || -> AnchorResult<Note> {
            self.pending.record_pending_approval(
                id,
                &Approval {
                    approver: approver.to_string(),
                    comment: None,
                    timestamp: Utc::now(),
                },
            )?;

            let note = Note {
                id: NoteId(locked.id),
                content: locked.content.clone(),
                layer: locked.layer,
                category: locked.category,
                confidence: locked.confidence,
                created_at: locked.created_at,
                valid_at: Some(locked.created_at),
                expires_at: None,
                created_by: locked.proposer.clone(),
                session_id: None,
                related_files: Vec::new(),
                is_active: true,
            };

            check_deadline(deadline)?;
            let vector = self.embed_checked(&note.content)?;
            self.commit_note(&note, vector, || {
                self.pending
                    .try_lock_pending(id, PendingStatus::Processing, PendingStatus::Approved)?
                    .ok_or_else(|| {
                        AnchorError::Internal(format!(
                            "pending memory {id} left processing during commit"
                        ))
                    })?;
                self.pending.delete_pending(id)?;
                Ok(())
            })?;
            Ok(note)
        };

        match commit() {
            Ok(note) => {
                info!(id = %id, approver, "pending memory approved");
                self.events.emit(&KernelEvent::MemoryAdded {
                    id: note.id.0,
                    layer: note.layer,
                    confidence: note.confidence,
                    has_conflict: false,
                });
                Ok(note)
            }
            Err(err) => {
                // Release the logical lock; a no-op if the row already moved.
                if let Err(unlock_err) = self.pending.try_lock_pending(
                    id,
                    PendingStatus::Processing,
                    PendingStatus::Pending,
                ) {
                    warn!(id = %id, error = %unlock_err, "failed to release approval lock");
                }
                Err(err)
            }
        }
    }

    /// Reject a staged memory.
    pub fn reject_pending(&self, id: Uuid) -> AnchorResult<PendingMemory> {
        self.pending
            .try_lock_pending(id, PendingStatus::Pending, PendingStatus::Rejected)?
            .ok_or_else(|| AnchorError::Conflict(format!("pending memory {id} is not pending")))
    }

    /// Expire staged memories older than the given age. Returns how many
    /// rows moved to `expired`.
    pub fn expire_stale_pending(&self, older_than: Duration) -> AnchorResult<usize> {
        self.metadata.expire_pending_before(Utc::now() - older_than)
    }

    // ------------------------------------------------------------------
    // Read path
    // ------------------------------------------------------------------

    /// Semantic search with bi-temporal filtering, identity prepending, and
    /// budget truncation.
    pub fn search_memory(&self, request: SearchRequest) -> AnchorResult<Vec<SearchHit>> {
        let (hits, _) = self.search_memory_with_report(request)?;
        Ok(hits)
    }

    /// Search variant that also returns the budget report.
    pub fn search_memory_with_report(
        &self,
        request: SearchRequest,
    ) -> AnchorResult<(Vec<SearchHit>, BudgetReport)> {
        check_deadline(request.deadline)?;

        let layer = request
            .layer
            .as_deref()
            .map(MemoryLayer::parse)
            .transpose()?;
        let category = request
            .category
            .as_deref()
            .map(NoteCategory::parse)
            .transpose()?;

        // Compose the payload filter: active, layer/category, temporal.
        let mut filter = PayloadFilter::all().and(Condition::eq(keys::IS_ACTIVE, true));
        if let Some(layer) = layer {
            filter = filter.and(Condition::eq(keys::LAYER, layer.as_str()));
        }
        if let Some(category) = category {
            filter = filter.and(Condition::eq(keys::CATEGORY, category.as_str()));
        }
        let temporal = match (request.as_of, request.range) {
            (Some(t), _) => TemporalQuery::as_of(t),
            (None, Some((start, end))) => TemporalQuery::in_range(start, end),
            (None, None) => TemporalQuery::only_valid(),
        }
        .include_expired(request.include_expired);
        filter = temporal.apply(filter);

        check_deadline(request.deadline)?;
        let query_vector = self.embed_checked(&request.query)?;

        // Overshoot so the score floor and layer skip leave enough results.
        let k = request.limit.saturating_mul(2).max(1);
        let min_score = request
            .min_score
            .unwrap_or(self.config.memory.min_search_score);
        let scored = self
            .index
            .search(&self.collection, &query_vector, k, &filter)?;

        let include_identity = request.include_identity_schema
            && matches!(layer, None | Some(MemoryLayer::IdentitySchema));

        let mut hits: Vec<SearchHit> = Vec::new();
        if include_identity {
            // Identity records are never subject to scoring.
            for note in self.governor.snapshot() {
                hits.push(SearchHit { note, score: 1.0 });
            }
        }

        let mut ranked: Vec<SearchHit> = Vec::new();
        for hit in scored {
            if hit.score < min_score {
                continue;
            }
            let note = match NotePayload::note_from_map(hit.id, &hit.payload) {
                Ok(note) => note,
                Err(e) => {
                    warn!(id = %hit.id, error = %e, "skipping unreadable search hit");
                    continue;
                }
            };
            // The snapshot already covers the identity layer.
            if note.layer == MemoryLayer::IdentitySchema {
                continue;
            }
            ranked.push(SearchHit {
                note,
                score: hit.score,
            });
        }
        ranked.truncate(request.limit);
        hits.extend(ranked);

        let (hits, report) = self.budget.truncate(hits);
        Ok((hits, report))
    }

    // ------------------------------------------------------------------
    // Event log
    // ------------------------------------------------------------------

    /// Append an event-log memory. TTL defaults to the configured session
    /// expiry.
    pub fn log_event(&self, request: LogEventRequest) -> AnchorResult<AddOutcome> {
        let occurred_at = request.occurred_at.unwrap_or_else(Utc::now);
        let expires_at = match request.ttl_days {
            Some(days) => occurred_at + Duration::days(days),
            None => occurred_at + Duration::hours(self.config.memory.session_expire_hours as i64),
        };

        // The payload schema is fixed, so location and participants fold
        // into the stored content.
        let mut content = request.content;
        if let Some(location) = &request.location {
            content.push_str(&format!(" (at {location})"));
        }
        if !request.participants.is_empty() {
            content.push_str(&format!(" (with {})", request.participants.join(", ")));
        }

        self.add_memory(AddMemoryRequest {
            content,
            layer: "event_log".to_string(),
            category: Some("event".to_string()),
            confidence: 1.0,
            created_by: request.created_by,
            session_id: request.session_id,
            related_files: Vec::new(),
            valid_at: Some(occurred_at),
            expires_at: Some(expires_at),
            deadline: request.deadline,
        })
    }

    /// Bi-temporal range search over the event log.
    pub fn search_events(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> AnchorResult<Vec<SearchHit>> {
        self.search_memory(SearchRequest {
            layer: Some("event_log".to_string()),
            range: Some((start, end)),
            include_expired: true,
            include_identity_schema: false,
            limit,
            ..SearchRequest::new(query)
        })
    }

    /// Promote an event to a verified fact. Idempotent: a second call for
    /// the same event returns the fact created by the first.
    pub fn promote_to_fact(&self, event_id: Uuid, reviewer: &str) -> AnchorResult<Note> {
        let point = self
            .index
            .get(&self.collection, event_id)?
            .ok_or_else(|| AnchorError::NotFound(format!("event {event_id}")))?;
        let event = NotePayload::note_from_map(event_id, &point.payload)?;
        if event.layer != MemoryLayer::EventLog {
            return Err(AnchorError::InvalidArgument(format!(
                "memory {event_id} is {}, not event_log",
                event.layer
            )));
        }

        // Already promoted: hand back the existing fact.
        if let Some(fact_id) = point
            .payload
            .get(keys::PROMOTED_TO)
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            return self.get_memory(fact_id);
        }

        let now = Utc::now();
        let fact = Note {
            id: NoteId::new(),
            content: event.content.clone(),
            layer: MemoryLayer::VerifiedFact,
            category: event.category,
            confidence: 1.0,
            created_at: now,
            valid_at: event.valid_at.or(Some(event.created_at)),
            expires_at: None,
            created_by: reviewer.to_string(),
            session_id: event.session_id.clone(),
            related_files: event.related_files.clone(),
            is_active: true,
        };
        let vector = self.embed_checked(&fact.content)?;
        self.commit_note(&fact, vector, || {
            // Tag the source event; the event itself remains.
            let mut partial = serde_json::Map::new();
            partial.insert(keys::PROMOTED_TO.into(), json!(fact.id.0.to_string()));
            self.index
                .update_payload(&self.collection, event_id, partial)
        })?;

        info!(event = %event_id, fact = %fact.id, "event promoted to fact");
        self.events.emit(&KernelEvent::MemoryAdded {
            id: fact.id.0,
            layer: fact.layer,
            confidence: fact.confidence,
            has_conflict: false,
        });
        Ok(fact)
    }

    // ------------------------------------------------------------------
    // Sessions, export, stats
    // ------------------------------------------------------------------

    /// Begin a working session.
    pub fn start_session(&self, session_id: &str) -> AnchorResult<SessionState> {
        self.sessions.start(session_id)
    }

    /// End the active session.
    pub fn end_session(&self, summary: Option<&str>) -> AnchorResult<SessionState> {
        self.sessions.end(summary)
    }

    /// Export the whole collection as JSON lines.
    pub fn export(&self, writer: &mut dyn Write) -> AnchorResult<usize> {
        export::export_collection(&*self.index, &self.collection, writer)
    }

    /// Import JSON lines; duplicates upsert by id.
    pub fn import(&self, reader: &mut dyn BufRead) -> AnchorResult<(usize, usize)> {
        export::import_collection(&*self.index, &self.collection, reader)
    }

    /// Collection statistics.
    pub fn stats(&self) -> AnchorResult<KernelStats> {
        let mut by_layer = BTreeMap::new();
        let mut total = 0usize;
        let mut active = 0usize;
        let mut cursor = None;
        loop {
            let page = self
                .index
                .scroll(&self.collection, &PayloadFilter::all(), cursor, 256)?;
            for point in &page.points {
                total += 1;
                if matches!(point.payload.get(keys::IS_ACTIVE), Some(v) if v == &json!(true)) {
                    active += 1;
                }
                if let Some(layer) = point.payload.get(keys::LAYER).and_then(|v| v.as_str()) {
                    *by_layer.entry(layer.to_string()).or_insert(0) += 1;
                }
            }
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        let pending = self
            .pending
            .list_pending(Some(PendingStatus::Pending), 1_000_000)?
            .len();
        Ok(KernelStats {
            total,
            active,
            by_layer,
            pending,
            vector_dim: self.config.vector.dim,
        })
    }

    /// Embed with a dimension check against the collection.
    fn embed_checked(&self, text: &str) -> AnchorResult<Vec<f32>> {
        let vector = self.embedder.embed(text)?;
        if vector.len() != self.config.vector.dim {
            return Err(AnchorError::DimensionMismatch {
                expected: self.config.vector.dim,
                actual: vector.len(),
            });
        }
        Ok(vector)
    }
}

/// Error out once the deadline has passed.
fn check_deadline(deadline: Option<Instant>) -> AnchorResult<()> {
    match deadline {
        Some(deadline) if Instant::now() >= deadline => Err(AnchorError::DeadlineExceeded),
        _ => Ok(()),
    }
}
