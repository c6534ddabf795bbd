//! The vector index contract shared by the embedded and server backends.

use serde_json::{Map, Value};
use uuid::Uuid;

use anchor_types::error::AnchorResult;

use crate::filter::PayloadFilter;

/// One `(id, vector, payload)` record.
#[derive(Debug, Clone)]
pub struct Point {
    /// Primary key, unique within a collection.
    pub id: Uuid,
    /// Dense vector. Must match the collection dimension.
    pub vector: Vec<f32>,
    /// Flat payload map.
    pub payload: Map<String, Value>,
}

/// A search result: point plus similarity score.
#[derive(Debug, Clone)]
pub struct ScoredPoint {
    pub id: Uuid,
    /// Cosine similarity; higher is closer.
    pub score: f32,
    pub payload: Map<String, Value>,
}

/// Outcome of a batch upsert; partial success is reported per point.
#[derive(Debug, Default)]
pub struct BatchReport {
    /// Ids written successfully.
    pub succeeded: Vec<Uuid>,
    /// Ids that failed, with the failure detail.
    pub failed: Vec<(Uuid, String)>,
}

impl BatchReport {
    /// Whether every point landed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// A page of scroll results plus the cursor for the next page.
#[derive(Debug, Default)]
pub struct ScrollPage {
    /// Points in id order.
    pub points: Vec<Point>,
    /// Pass back as `cursor` to continue; None when exhausted.
    pub next_cursor: Option<Uuid>,
}

/// Namespaced vector storage with ANN search.
///
/// Guarantees: search results are deterministic for identical inputs, ordered
/// by score descending with ties broken by ascending id. Connection failures
/// surface as `StorageUnavailable`; the kernel never degrades silently.
pub trait VectorIndex: Send + Sync {
    /// Create the collection if absent, with cosine distance and the given
    /// dimension. Fails with `DimensionMismatch` if it exists with another
    /// dimension.
    fn ensure_collection(&self, name: &str, dim: usize) -> AnchorResult<()>;

    /// Write or replace a point. Upsert is by primary key, so retries are
    /// idempotent.
    fn upsert(&self, name: &str, point: Point) -> AnchorResult<()>;

    /// Write many points with at-least-once semantics, reporting per-point
    /// outcomes.
    fn batch_upsert(&self, name: &str, points: Vec<Point>) -> AnchorResult<BatchReport>;

    /// Fetch one point by id, regardless of payload state.
    fn get(&self, name: &str, id: Uuid) -> AnchorResult<Option<Point>>;

    /// Top-k by cosine similarity, filtered.
    fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> AnchorResult<Vec<ScoredPoint>>;

    /// Enumerate matching points in id order, a page at a time.
    fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> AnchorResult<ScrollPage>;

    /// Merge `partial` into an existing point's payload.
    fn update_payload(
        &self,
        name: &str,
        id: Uuid,
        partial: Map<String, Value>,
    ) -> AnchorResult<()>;

    /// Hard delete. Production paths soft-delete via `update_payload`.
    fn delete(&self, name: &str, id: Uuid) -> AnchorResult<()>;

    /// Readiness check. `StorageUnavailable` when the backend is unreachable.
    fn ping(&self) -> AnchorResult<()>;
}

/// Cosine similarity between two vectors of equal length.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..a.len() {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        0.0
    } else {
        dot / denom
    }
}
