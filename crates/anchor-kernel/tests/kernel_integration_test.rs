//! End-to-end tests for the memory kernel.
//!
//! These wire a real kernel over the embedded vector index, an in-memory
//! metadata store, and the deterministic hash embedder, so no external
//! services. They cover the write/search round trip, confidence routing,
//! governance, bi-temporal queries, budget caps, concurrent approval, and
//! the compensation path.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

use anchor_kernel::budget::estimate_tokens;
use anchor_kernel::embedder::HashEmbedder;
use anchor_kernel::governor::ProposeChange;
use anchor_kernel::kernel::{
    AddMemoryRequest, AddStatus, LogEventRequest, MemoryKernel, PendingStore, SearchRequest,
};
use anchor_store::local::LocalIndex;
use anchor_store::metadata::MetadataStore;
use anchor_store::payload::keys;
use anchor_store::vector::VectorIndex;
use anchor_types::config::{AnchorConfig, VectorConfig};
use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::note::MemoryLayer;
use anchor_types::pending::{Approval, ChangeType, PendingMemory, PendingStatus};

const DIM: usize = 128;

struct Fixture {
    kernel: MemoryKernel,
    index: Arc<LocalIndex>,
    metadata: Arc<MetadataStore>,
}

fn config() -> AnchorConfig {
    AnchorConfig {
        project_id: "itest".to_string(),
        vector: VectorConfig {
            dim: DIM,
            ..VectorConfig::default()
        },
        ..AnchorConfig::default()
    }
}

fn fixture() -> Fixture {
    let index = Arc::new(LocalIndex::in_memory().unwrap());
    let metadata = Arc::new(MetadataStore::in_memory().unwrap());
    let kernel = MemoryKernel::new(
        config(),
        index.clone(),
        metadata.clone(),
        Arc::new(HashEmbedder::new(DIM)),
    )
    .unwrap();
    Fixture {
        kernel,
        index,
        metadata,
    }
}

fn collection() -> String {
    config().collection_name()
}

// ---------------------------------------------------------------------------
// Write path and round trips
// ---------------------------------------------------------------------------

#[test]
fn test_auto_save_and_search() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            valid_at: Some(Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()),
            ..AddMemoryRequest::new("Use Qdrant for vectors")
        })
        .unwrap();
    assert_eq!(outcome.status, AddStatus::Saved);
    assert_eq!(outcome.layer, MemoryLayer::VerifiedFact);
    assert_eq!(outcome.confidence, 0.95);
    let warning = outcome.conflict_warning.unwrap();
    assert!(!warning.has_conflict);

    let hits = f
        .kernel
        .search_memory(SearchRequest::new("qdrant vectors"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id.0, outcome.id);
    assert!(hits[0].score >= 0.30, "score was {}", hits[0].score);
    assert_eq!(hits[0].note.content, "Use Qdrant for vectors");
}

#[test]
fn test_round_trip_content_is_sanitized() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("Contact alice@example.com for the key")
        })
        .unwrap();
    assert_eq!(outcome.safety_findings.len(), 1);
    assert_eq!(outcome.safety_findings[0].kind, "email");

    let note = f.kernel.get_memory(outcome.id).unwrap();
    assert_eq!(note.content, "Contact [REDACTED] for the key");
}

#[test]
fn test_safety_block_fails_write() {
    let f = fixture();
    let err = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("card 4111 1111 1111 1111 on file")
        })
        .unwrap_err();
    assert!(matches!(err, AnchorError::PolicyViolation(_)));
    assert_eq!(f.kernel.stats().unwrap().total, 0);
}

#[test]
fn test_legacy_layer_aliases() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            layer: "fact".to_string(),
            confidence: 0.95,
            ..AddMemoryRequest::new("alias test")
        })
        .unwrap();
    assert_eq!(outcome.layer, MemoryLayer::VerifiedFact);

    let err = f
        .kernel
        .add_memory(AddMemoryRequest {
            layer: "episodic".to_string(),
            ..AddMemoryRequest::new("bad layer")
        })
        .unwrap_err();
    assert!(matches!(err, AnchorError::InvalidArgument(_)));
}

#[test]
fn test_soft_delete_stays_fetchable_by_id() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("the garage code is blue")
        })
        .unwrap();
    f.kernel.delete_memory(outcome.id).unwrap();

    // Gone from default search, still fetchable by id.
    let hits = f
        .kernel
        .search_memory(SearchRequest::new("garage code blue"))
        .unwrap();
    assert!(hits.is_empty());
    let note = f.kernel.get_memory(outcome.id).unwrap();
    assert!(!note.is_active);

    let err = f.kernel.delete_memory(Uuid::new_v4()).unwrap_err();
    assert!(matches!(err, AnchorError::NotFound(_)));
}

#[test]
fn test_deadline_checked_before_work() {
    let f = fixture();
    let err = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            deadline: Some(Instant::now() - Duration::from_millis(1)),
            ..AddMemoryRequest::new("too late")
        })
        .unwrap_err();
    assert!(matches!(err, AnchorError::DeadlineExceeded));
    assert!(err.is_retryable());
}

// ---------------------------------------------------------------------------
// Confidence routing
// ---------------------------------------------------------------------------

#[test]
fn test_pending_path_creates_no_vector_point() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.8,
            ..AddMemoryRequest::new("Possibly switch to Redis")
        })
        .unwrap();
    assert_eq!(outcome.status, AddStatus::Pending);

    let pending = f.kernel.list_pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].status, PendingStatus::Pending);
    assert_eq!(pending[0].content, "Possibly switch to Redis");

    // Nothing was embedded or written to the vector side.
    assert_eq!(f.kernel.stats().unwrap().total, 0);
}

#[test]
fn test_low_confidence_rejected() {
    let f = fixture();
    let err = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.5,
            ..AddMemoryRequest::new("barely a hunch")
        })
        .unwrap_err();
    assert!(matches!(err, AnchorError::LowConfidence(_)));
}

#[test]
fn test_approve_pending_commits_to_vector_store() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.8,
            ..AddMemoryRequest::new("Possibly switch to Redis")
        })
        .unwrap();

    let note = f.kernel.approve_pending(outcome.id, "reviewer", None).unwrap();
    assert_eq!(note.id.0, outcome.id);
    assert!(f.kernel.list_pending(10).unwrap().is_empty());

    let hits = f
        .kernel
        .search_memory(SearchRequest::new("redis switch"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id.0, outcome.id);
}

#[test]
fn test_concurrent_approval_single_winner() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.8,
            ..AddMemoryRequest::new("Possibly switch to Redis")
        })
        .unwrap();
    let id = outcome.id;

    let kernel = Arc::new(f.kernel);
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let kernel = kernel.clone();
            std::thread::spawn(move || kernel.approve_pending(id, &format!("approver-{i}"), None))
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(result.as_ref().unwrap_err(), AnchorError::Conflict(_)));
    }

    // Exactly one vector point carries the id.
    assert!(f.index.get(&collection(), id).unwrap().is_some());
    assert_eq!(kernel.stats().unwrap().total, 1);
}

#[test]
fn test_reject_pending() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.8,
            ..AddMemoryRequest::new("Possibly switch to Redis")
        })
        .unwrap();
    let rejected = f.kernel.reject_pending(outcome.id).unwrap();
    assert_eq!(rejected.status, PendingStatus::Rejected);

    let err = f.kernel.approve_pending(outcome.id, "late", None).unwrap_err();
    assert!(matches!(err, AnchorError::Conflict(_)));
}

// ---------------------------------------------------------------------------
// Compensation
// ---------------------------------------------------------------------------

/// Wraps the metadata store and fails the processing -> approved transition,
/// simulating a metadata outage after the vector write succeeded.
struct FailingFinalize {
    inner: Arc<MetadataStore>,
}

impl PendingStore for FailingFinalize {
    fn insert_pending(&self, pending: &PendingMemory) -> AnchorResult<()> {
        self.inner.insert_pending(pending)
    }

    fn get_pending(&self, id: Uuid) -> AnchorResult<Option<PendingMemory>> {
        self.inner.get_pending(id)
    }

    fn list_pending(
        &self,
        status: Option<PendingStatus>,
        limit: usize,
    ) -> AnchorResult<Vec<PendingMemory>> {
        self.inner.list_pending(status, limit)
    }

    fn try_lock_pending(
        &self,
        id: Uuid,
        expected: PendingStatus,
        new: PendingStatus,
    ) -> AnchorResult<Option<PendingMemory>> {
        if expected == PendingStatus::Processing && new == PendingStatus::Approved {
            return Err(AnchorError::Storage("metadata store lost".to_string()));
        }
        self.inner.try_lock_pending(id, expected, new)
    }

    fn record_pending_approval(&self, id: Uuid, approval: &Approval) -> AnchorResult<()> {
        self.inner.record_pending_approval(id, approval)
    }

    fn delete_pending(&self, id: Uuid) -> AnchorResult<()> {
        self.inner.delete_pending(id)
    }
}

#[test]
fn test_metadata_failure_compensates_vector_write() {
    let index = Arc::new(LocalIndex::in_memory().unwrap());
    let metadata = Arc::new(MetadataStore::in_memory().unwrap());
    let kernel = MemoryKernel::with_pending_store(
        config(),
        index.clone(),
        metadata.clone(),
        Arc::new(FailingFinalize {
            inner: metadata.clone(),
        }),
        Arc::new(HashEmbedder::new(DIM)),
    )
    .unwrap();

    let outcome = kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.8,
            ..AddMemoryRequest::new("Possibly switch to Redis")
        })
        .unwrap();

    let err = kernel.approve_pending(outcome.id, "reviewer", None).unwrap_err();
    assert!(matches!(err, AnchorError::Storage(_)));

    // The vector point landed but was soft-deleted by compensation.
    let point = index.get(&collection(), outcome.id).unwrap().unwrap();
    assert_eq!(point.payload.get(keys::IS_ACTIVE), Some(&serde_json::json!(false)));

    // The lock was released: the row is pending again, eligible for retry.
    let row = metadata.get_pending(outcome.id).unwrap().unwrap();
    assert_eq!(row.status, PendingStatus::Pending);
}

// ---------------------------------------------------------------------------
// Governance
// ---------------------------------------------------------------------------

#[test]
fn test_identity_write_routes_to_governor() {
    let f = fixture();
    let outcome = f
        .kernel
        .add_memory(AddMemoryRequest {
            layer: "identity_schema".to_string(),
            confidence: 1.0,
            ..AddMemoryRequest::new("Project is Memory Anchor")
        })
        .unwrap();
    assert_eq!(outcome.status, AddStatus::Proposed);

    // No entry until three distinct approvals.
    assert!(f.kernel.get_constitution().is_empty());
    f.kernel.governor().approve(outcome.id, "a", None).unwrap();
    f.kernel.governor().approve(outcome.id, "b", None).unwrap();
    assert!(f.kernel.get_constitution().is_empty());
    f.kernel.governor().approve(outcome.id, "c", None).unwrap();

    let constitution = f.kernel.get_constitution();
    assert_eq!(constitution.len(), 1);
    assert_eq!(constitution[0].content, "Project is Memory Anchor");
}

#[test]
fn test_concurrent_identity_approvals() {
    let f = fixture();
    let change = f
        .kernel
        .governor()
        .propose(ProposeChange {
            content: "Project is Memory Anchor".to_string(),
            change_type: ChangeType::Create,
            target_id: None,
            category: None,
            reason: "bootstrap".to_string(),
            proposer: "human".to_string(),
        })
        .unwrap();
    let change_id = change.change_id;

    let kernel = Arc::new(f.kernel);
    let handles: Vec<_> = (0..10)
        .map(|i| {
            let kernel = kernel.clone();
            std::thread::spawn(move || {
                kernel
                    .governor()
                    .approve(change_id, &format!("approver-{i}"), None)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    // Exactly three unique-approver calls succeed; the rest conflict.
    let successes = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 3);
    for result in results.iter().filter(|r| r.is_err()) {
        assert!(matches!(
            result.as_ref().unwrap_err(),
            AnchorError::Conflict(_) | AnchorError::Governance(_)
        ));
    }

    let row = kernel.governor().list(None, 10).unwrap().remove(0);
    assert_eq!(row.approvals_count, 3);
    assert_eq!(row.approvals.len(), 3);
    assert_eq!(kernel.get_constitution().len(), 1);
}

#[test]
fn test_identity_results_prepended_to_search() {
    let f = fixture();
    let change = f
        .kernel
        .add_memory(AddMemoryRequest {
            layer: "constitution".to_string(),
            ..AddMemoryRequest::new("Name is Ada, born 1990")
        })
        .unwrap();
    for approver in ["a", "b", "c"] {
        f.kernel.governor().approve(change.id, approver, None).unwrap();
    }
    f.kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("groceries arrive on tuesdays")
        })
        .unwrap();

    // Identity entries surface even for an unrelated query, score pinned.
    let hits = f
        .kernel
        .search_memory(SearchRequest::new("groceries tuesdays"))
        .unwrap();
    assert!(hits
        .iter()
        .any(|h| h.note.layer == MemoryLayer::IdentitySchema && h.score == 1.0));
    assert!(hits.iter().any(|h| h.note.layer == MemoryLayer::VerifiedFact));

    // Unless the caller opts out.
    let hits = f
        .kernel
        .search_memory(SearchRequest {
            include_identity_schema: false,
            ..SearchRequest::new("groceries tuesdays")
        })
        .unwrap();
    assert!(hits.iter().all(|h| h.note.layer != MemoryLayer::IdentitySchema));
}

// ---------------------------------------------------------------------------
// Bi-temporal queries
// ---------------------------------------------------------------------------

#[test]
fn test_as_of_window() {
    let f = fixture();
    f.kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            valid_at: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            expires_at: Some(Utc.with_ymd_and_hms(2024, 12, 31, 0, 0, 0).unwrap()),
            ..AddMemoryRequest::new("lease runs through december")
        })
        .unwrap();

    let inside = f
        .kernel
        .search_memory(SearchRequest {
            as_of: Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap()),
            ..SearchRequest::new("lease december")
        })
        .unwrap();
    assert_eq!(inside.len(), 1);

    let after = f
        .kernel
        .search_memory(SearchRequest {
            as_of: Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()),
            ..SearchRequest::new("lease december")
        })
        .unwrap();
    assert!(after.is_empty());

    let with_expired = f
        .kernel
        .search_memory(SearchRequest {
            as_of: Some(Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap()),
            include_expired: true,
            ..SearchRequest::new("lease december")
        })
        .unwrap();
    assert_eq!(with_expired.len(), 1);
}

#[test]
fn test_default_search_excludes_expired_and_inactive() {
    let f = fixture();
    f.kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            valid_at: Some(Utc.with_ymd_and_hms(2020, 1, 1, 0, 0, 0).unwrap()),
            expires_at: Some(Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap()),
            ..AddMemoryRequest::new("expired milk note")
        })
        .unwrap();
    let kept = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("fresh milk note")
        })
        .unwrap();
    let deleted = f
        .kernel
        .add_memory(AddMemoryRequest {
            confidence: 0.95,
            ..AddMemoryRequest::new("deleted milk note")
        })
        .unwrap();
    f.kernel.delete_memory(deleted.id).unwrap();

    let hits = f
        .kernel
        .search_memory(SearchRequest::new("milk note"))
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.id.0, kept.id);
    let now = Utc::now();
    for hit in &hits {
        assert!(hit.note.is_active);
        assert!(hit.note.expires_at.map(|e| e > now).unwrap_or(true));
    }
}

// ---------------------------------------------------------------------------
// Event log and promotion
// ---------------------------------------------------------------------------

#[test]
fn test_log_event_sets_ttl() {
    let f = fixture();
    let when = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    let outcome = f
        .kernel
        .log_event(LogEventRequest {
            occurred_at: Some(when),
            ttl_days: Some(14),
            location: Some("kitchen".to_string()),
            participants: vec!["nurse".to_string()],
            ..LogEventRequest::new("took morning medication")
        })
        .unwrap();
    assert_eq!(outcome.layer, MemoryLayer::EventLog);

    let note = f.kernel.get_memory(outcome.id).unwrap();
    assert_eq!(note.valid_at, Some(when));
    assert_eq!(note.expires_at, Some(when + chrono::Duration::days(14)));
    assert!(note.content.contains("(at kitchen)"));
    assert!(note.content.contains("(with nurse)"));
}

#[test]
fn test_search_events_in_range() {
    let f = fixture();
    let march = Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap();
    let june = Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap();
    f.kernel
        .log_event(LogEventRequest {
            occurred_at: Some(march),
            ..LogEventRequest::new("doctor visit in march")
        })
        .unwrap();
    f.kernel
        .log_event(LogEventRequest {
            occurred_at: Some(june),
            ..LogEventRequest::new("doctor visit in june")
        })
        .unwrap();

    let hits = f
        .kernel
        .search_events(
            "doctor visit",
            Utc.with_ymd_and_hms(2025, 2, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2025, 4, 1, 0, 0, 0).unwrap(),
            10,
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert!(hits[0].note.content.contains("march"));
}

#[test]
fn test_promote_to_fact_idempotent() {
    let f = fixture();
    let event = f
        .kernel
        .log_event(LogEventRequest::new("prefers tea over coffee"))
        .unwrap();

    let fact = f.kernel.promote_to_fact(event.id, "reviewer").unwrap();
    assert_eq!(fact.layer, MemoryLayer::VerifiedFact);
    assert_eq!(fact.content, "prefers tea over coffee");
    assert!(fact.expires_at.is_none());

    // Source event remains, tagged with the fact id.
    let point = f.index.get(&collection(), event.id).unwrap().unwrap();
    assert_eq!(
        point.payload.get(keys::PROMOTED_TO).and_then(|v| v.as_str()),
        Some(fact.id.0.to_string().as_str())
    );

    // A second promotion returns the same fact, creating nothing.
    let again = f.kernel.promote_to_fact(event.id, "reviewer").unwrap();
    assert_eq!(again.id, fact.id);
    assert_eq!(f.kernel.stats().unwrap().total, 2);
}

// ---------------------------------------------------------------------------
// Budget
// ---------------------------------------------------------------------------

#[test]
fn test_search_respects_total_budget() {
    let index = Arc::new(LocalIndex::in_memory().unwrap());
    let metadata = Arc::new(MetadataStore::in_memory().unwrap());
    let mut cfg = config();
    cfg.budget.total = 400;
    let kernel = MemoryKernel::new(cfg, index, metadata, Arc::new(HashEmbedder::new(DIM))).unwrap();

    for i in 0..20 {
        kernel
            .add_memory(AddMemoryRequest {
                confidence: 0.95,
                ..AddMemoryRequest::new(format!(
                    "medication schedule entry number {i} with a long tail of details about dosage and timing"
                ))
            })
            .unwrap();
    }

    let (hits, report) = kernel
        .search_memory_with_report(SearchRequest {
            limit: 20,
            ..SearchRequest::new("medication schedule dosage")
        })
        .unwrap();
    assert!(!hits.is_empty());
    assert!(report.dropped > 0);
    let tokens: usize = hits
        .iter()
        .map(|h| estimate_tokens(&h.note.content) + 20)
        .sum();
    assert!(tokens <= 400, "budget exceeded: {tokens}");
}

// ---------------------------------------------------------------------------
// Export / import
// ---------------------------------------------------------------------------

#[test]
fn test_export_import_idempotent() {
    let f = fixture();
    for content in ["first note about cats", "second note about dogs"] {
        f.kernel
            .add_memory(AddMemoryRequest {
                confidence: 0.95,
                ..AddMemoryRequest::new(content)
            })
            .unwrap();
    }

    let mut dump = Vec::new();
    let exported = f.kernel.export(&mut dump).unwrap();
    assert_eq!(exported, 2);

    // Import into a fresh kernel twice; no duplicates appear.
    let g = fixture();
    g.kernel
        .import(&mut std::io::BufReader::new(dump.as_slice()))
        .unwrap();
    g.kernel
        .import(&mut std::io::BufReader::new(dump.as_slice()))
        .unwrap();
    assert_eq!(g.kernel.stats().unwrap().total, 2);

    let hits = g.kernel.search_memory(SearchRequest::new("cats")).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].note.content, "first note about cats");
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[test]
fn test_startup_reverts_stuck_processing_rows() {
    let index = Arc::new(LocalIndex::in_memory().unwrap());
    let metadata = Arc::new(MetadataStore::in_memory().unwrap());

    // Simulate a crash mid-approval: a row stuck in processing.
    let stuck = PendingMemory {
        id: Uuid::new_v4(),
        content: "stuck row".to_string(),
        layer: MemoryLayer::VerifiedFact,
        category: None,
        confidence: 0.8,
        change_type: ChangeType::Create,
        proposer: "agent".to_string(),
        reason: None,
        target_id: None,
        status: PendingStatus::Processing,
        approvals: Vec::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    metadata.insert_pending(&stuck).unwrap();

    let kernel = MemoryKernel::new(
        config(),
        index,
        metadata.clone(),
        Arc::new(HashEmbedder::new(DIM)),
    )
    .unwrap();

    let row = metadata.get_pending(stuck.id).unwrap().unwrap();
    assert_eq!(row.status, PendingStatus::Pending);
    assert!(row.reason.unwrap().contains("expired lock"));

    // And the row is approvable again.
    kernel.approve_pending(stuck.id, "reviewer", None).unwrap();
}

#[test]
fn test_startup_sweeps_orphaned_vector_points() {
    let index = Arc::new(LocalIndex::in_memory().unwrap());
    let metadata = Arc::new(MetadataStore::in_memory().unwrap());

    // First boot: write a memory whose staged row later gets rejected while
    // its vector point (incorrectly) survives.
    {
        let kernel = MemoryKernel::new(
            config(),
            index.clone(),
            metadata.clone(),
            Arc::new(HashEmbedder::new(DIM)),
        )
        .unwrap();
        let outcome = kernel
            .add_memory(AddMemoryRequest {
                confidence: 0.95,
                ..AddMemoryRequest::new("note that will be orphaned")
            })
            .unwrap();
        // Fabricate the inconsistent state: a rejected staged row sharing
        // the live point's id.
        let twin = PendingMemory {
            id: outcome.id,
            content: "note that will be orphaned".to_string(),
            layer: MemoryLayer::VerifiedFact,
            category: None,
            confidence: 0.8,
            change_type: ChangeType::Create,
            proposer: "agent".to_string(),
            reason: None,
            target_id: None,
            status: PendingStatus::Rejected,
            approvals: Vec::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        metadata.insert_pending(&twin).unwrap();
    }

    // Second boot sweeps the point.
    let kernel = MemoryKernel::new(
        config(),
        index,
        metadata,
        Arc::new(HashEmbedder::new(DIM)),
    )
    .unwrap();
    let hits = kernel
        .search_memory(SearchRequest::new("orphaned note"))
        .unwrap();
    assert!(hits.is_empty());
}
