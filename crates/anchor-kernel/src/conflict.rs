//! Rule-based conflict detection on the write path.
//!
//! Detection is advisory: the write proceeds regardless and the warning is
//! returned to the caller, who owns resolution. No LLM involvement; the
//! rules are cosine similarity plus simple field comparisons.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use anchor_store::filter::{Condition, PayloadFilter};
use anchor_store::payload::{keys, NotePayload};
use anchor_store::vector::VectorIndex;
use anchor_types::error::AnchorResult;
use anchor_types::note::Note;

/// Kind of conflict detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    Temporal,
    Source,
    Confidence,
    None,
}

/// Advisory warning attached to a successful write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConflictWarning {
    /// Whether any rule fired.
    pub has_conflict: bool,
    /// The most significant kind that fired.
    pub kind: ConflictKind,
    /// Prior memories involved.
    pub related_ids: Vec<Uuid>,
    /// Human-readable resolution hint.
    pub hint: String,
}

impl ConflictWarning {
    /// The no-conflict result.
    pub fn none() -> Self {
        Self {
            has_conflict: false,
            kind: ConflictKind::None,
            related_ids: Vec::new(),
            hint: String::new(),
        }
    }
}

/// Detector thresholds. The similarity cutoffs carry over from observed
/// behavior; tuning is deferred.
#[derive(Debug, Clone)]
pub struct ConflictConfig {
    /// Similarity floor for the temporal rule.
    pub temporal_similarity: f32,
    /// Window for the temporal rule, in days.
    pub temporal_window_days: i64,
    /// Similarity floor for source and confidence rules.
    pub strong_similarity: f32,
    /// Confidence delta that triggers the confidence rule.
    pub confidence_delta: f64,
    /// Candidates fetched per check.
    pub candidate_limit: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            temporal_similarity: 0.85,
            temporal_window_days: 7,
            strong_similarity: 0.9,
            confidence_delta: 0.3,
            candidate_limit: 5,
        }
    }
}

/// Rule-based conflict detector.
pub struct ConflictDetector {
    config: ConflictConfig,
}

impl ConflictDetector {
    /// Build with default thresholds.
    pub fn new(config: ConflictConfig) -> Self {
        Self { config }
    }

    /// Check a new note (already embedded) against existing active memories
    /// in the collection. Search failures degrade to no-conflict; detection
    /// must never block a write.
    pub fn detect(
        &self,
        index: &dyn VectorIndex,
        collection: &str,
        note: &Note,
        vector: &[f32],
    ) -> ConflictWarning {
        let candidates = match self.find_candidates(index, collection, vector) {
            Ok(c) => c,
            Err(e) => {
                debug!(error = %e, "conflict candidate search failed, skipping detection");
                return ConflictWarning::none();
            }
        };
        if candidates.is_empty() {
            return ConflictWarning::none();
        }

        // Most significant first: source divergence, confidence delta, then
        // temporal overlap.
        if let Some(w) = self.check_source(&candidates, note) {
            return w;
        }
        if let Some(w) = self.check_confidence(&candidates, note) {
            return w;
        }
        if let Some(w) = self.check_temporal(&candidates, note) {
            return w;
        }
        ConflictWarning::none()
    }

    fn find_candidates(
        &self,
        index: &dyn VectorIndex,
        collection: &str,
        vector: &[f32],
    ) -> AnchorResult<Vec<Candidate>> {
        let filter = PayloadFilter::all().and(Condition::eq(keys::IS_ACTIVE, true));
        let hits = index.search(collection, vector, self.config.candidate_limit, &filter)?;
        Ok(hits
            .into_iter()
            .filter(|hit| hit.score >= self.config.temporal_similarity)
            .filter_map(|hit| {
                let note = NotePayload::note_from_map(hit.id, &hit.payload).ok()?;
                Some(Candidate {
                    id: hit.id,
                    score: hit.score,
                    note,
                })
            })
            .collect())
    }

    fn check_temporal(&self, candidates: &[Candidate], note: &Note) -> Option<ConflictWarning> {
        let new_valid_at = note.valid_at.unwrap_or(note.created_at);
        let ids: Vec<Uuid> = candidates
            .iter()
            .filter(|c| c.note.category == note.category)
            .filter(|c| {
                let other_valid_at = c.note.valid_at.unwrap_or(c.note.created_at);
                days_apart(other_valid_at, new_valid_at) <= self.config.temporal_window_days
            })
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some(ConflictWarning {
            has_conflict: true,
            kind: ConflictKind::Temporal,
            hint: format!(
                "{} similar memor{} within {} days; consider updating instead of adding",
                ids.len(),
                if ids.len() == 1 { "y" } else { "ies" },
                self.config.temporal_window_days
            ),
            related_ids: ids,
        })
    }

    fn check_source(&self, candidates: &[Candidate], note: &Note) -> Option<ConflictWarning> {
        let ids: Vec<Uuid> = candidates
            .iter()
            .filter(|c| c.score >= self.config.strong_similarity)
            .filter(|c| c.note.created_by != note.created_by)
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some(ConflictWarning {
            has_conflict: true,
            kind: ConflictKind::Source,
            hint: "a near-identical memory exists from a different source; verify which is authoritative"
                .to_string(),
            related_ids: ids,
        })
    }

    fn check_confidence(&self, candidates: &[Candidate], note: &Note) -> Option<ConflictWarning> {
        let ids: Vec<Uuid> = candidates
            .iter()
            .filter(|c| c.score >= self.config.strong_similarity)
            .filter(|c| (c.note.confidence - note.confidence).abs() > self.config.confidence_delta)
            .map(|c| c.id)
            .collect();
        if ids.is_empty() {
            return None;
        }
        Some(ConflictWarning {
            has_conflict: true,
            kind: ConflictKind::Confidence,
            hint: "a near-identical memory exists with very different confidence; review both"
                .to_string(),
            related_ids: ids,
        })
    }
}

struct Candidate {
    id: Uuid,
    score: f32,
    note: Note,
}

fn days_apart(a: DateTime<Utc>, b: DateTime<Utc>) -> i64 {
    (a - b).num_days().abs()
}
