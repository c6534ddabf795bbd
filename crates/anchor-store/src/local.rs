//! Embedded vector index backed by SQLite.
//!
//! Single-process mode: collections and points live in one database file,
//! embeddings stored as little-endian f32 BLOBs. Search is brute-force
//! cosine with filters evaluated in-process, which is exact and fast enough
//! at the collection sizes this substrate sees.

use rusqlite::{Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

use anchor_types::error::{AnchorError, AnchorResult};

use crate::filter::PayloadFilter;
use crate::vector::{cosine_similarity, BatchReport, Point, ScoredPoint, ScrollPage, VectorIndex};

/// Embedded vector index over a SQLite file.
#[derive(Clone)]
pub struct LocalIndex {
    conn: Arc<Mutex<Connection>>,
}

impl LocalIndex {
    /// Open (or create) the index at the given path.
    pub fn open(path: impl AsRef<Path>) -> AnchorResult<Self> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Self::init(conn)
    }

    /// Open an in-memory index. Used by tests.
    pub fn in_memory() -> AnchorResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> AnchorResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                dim INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS points (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                embedding BLOB NOT NULL,
                payload TEXT NOT NULL,
                PRIMARY KEY (collection, id)
            );
            CREATE INDEX IF NOT EXISTS idx_points_collection ON points(collection);
            ",
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> AnchorResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| AnchorError::Internal(e.to_string()))
    }

    fn collection_dim(conn: &Connection, name: &str) -> AnchorResult<Option<usize>> {
        conn.query_row(
            "SELECT dim FROM collections WHERE name = ?1",
            rusqlite::params![name],
            |row| row.get::<_, i64>(0),
        )
        .optional()
        .map_err(|e| AnchorError::Storage(e.to_string()))
        .map(|opt| opt.map(|d| d as usize))
    }

    fn require_collection(conn: &Connection, name: &str) -> AnchorResult<usize> {
        Self::collection_dim(conn, name)?
            .ok_or_else(|| AnchorError::NotFound(format!("collection '{name}'")))
    }

    fn insert_point(conn: &Connection, name: &str, dim: usize, point: &Point) -> AnchorResult<()> {
        if point.vector.len() != dim {
            return Err(AnchorError::DimensionMismatch {
                expected: dim,
                actual: point.vector.len(),
            });
        }
        let payload = serde_json::to_string(&point.payload)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "INSERT INTO points (collection, id, embedding, payload) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(collection, id) DO UPDATE SET embedding = ?3, payload = ?4",
            rusqlite::params![
                name,
                point.id.to_string(),
                embedding_to_bytes(&point.vector),
                payload
            ],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Load all points of a collection that pass the filter, in id order.
    fn load_matching(
        conn: &Connection,
        name: &str,
        filter: &PayloadFilter,
        after: Option<Uuid>,
    ) -> AnchorResult<Vec<Point>> {
        let mut stmt = conn
            .prepare(
                "SELECT id, embedding, payload FROM points
                 WHERE collection = ?1 AND id > ?2 ORDER BY id",
            )
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let floor = after.map(|id| id.to_string()).unwrap_or_default();
        let rows = stmt
            .query_map(rusqlite::params![name, floor], |row| {
                let id: String = row.get(0)?;
                let embedding: Vec<u8> = row.get(1)?;
                let payload: String = row.get(2)?;
                Ok((id, embedding, payload))
            })
            .map_err(|e| AnchorError::Storage(e.to_string()))?;

        let mut points = Vec::new();
        for row in rows {
            let (id, embedding, payload) = row.map_err(|e| AnchorError::Storage(e.to_string()))?;
            let id = Uuid::parse_str(&id)
                .map_err(|e| AnchorError::Serialization(format!("bad point id: {e}")))?;
            let payload: Map<String, Value> = serde_json::from_str(&payload)
                .map_err(|e| AnchorError::Serialization(e.to_string()))?;
            if filter.matches(&payload) {
                points.push(Point {
                    id,
                    vector: embedding_from_bytes(&embedding),
                    payload,
                });
            }
        }
        Ok(points)
    }
}

impl VectorIndex for LocalIndex {
    fn ensure_collection(&self, name: &str, dim: usize) -> AnchorResult<()> {
        let conn = self.lock()?;
        match Self::collection_dim(&conn, name)? {
            Some(existing) if existing != dim => Err(AnchorError::DimensionMismatch {
                expected: existing,
                actual: dim,
            }),
            Some(_) => Ok(()),
            None => {
                conn.execute(
                    "INSERT INTO collections (name, dim) VALUES (?1, ?2)",
                    rusqlite::params![name, dim as i64],
                )
                .map_err(|e| AnchorError::Storage(e.to_string()))?;
                debug!(collection = name, dim, "created collection");
                Ok(())
            }
        }
    }

    fn upsert(&self, name: &str, point: Point) -> AnchorResult<()> {
        let conn = self.lock()?;
        let dim = Self::require_collection(&conn, name)?;
        Self::insert_point(&conn, name, dim, &point)
    }

    fn batch_upsert(&self, name: &str, points: Vec<Point>) -> AnchorResult<BatchReport> {
        let conn = self.lock()?;
        let dim = Self::require_collection(&conn, name)?;
        let mut report = BatchReport::default();
        for point in points {
            let id = point.id;
            match Self::insert_point(&conn, name, dim, &point) {
                Ok(()) => report.succeeded.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        Ok(report)
    }

    fn get(&self, name: &str, id: Uuid) -> AnchorResult<Option<Point>> {
        let conn = self.lock()?;
        let row: Option<(Vec<u8>, String)> = conn
            .query_row(
                "SELECT embedding, payload FROM points WHERE collection = ?1 AND id = ?2",
                rusqlite::params![name, id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        match row {
            None => Ok(None),
            Some((embedding, payload)) => Ok(Some(Point {
                id,
                vector: embedding_from_bytes(&embedding),
                payload: serde_json::from_str(&payload)
                    .map_err(|e| AnchorError::Serialization(e.to_string()))?,
            })),
        }
    }

    fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> AnchorResult<Vec<ScoredPoint>> {
        let conn = self.lock()?;
        let dim = Self::require_collection(&conn, name)?;
        if query.len() != dim {
            return Err(AnchorError::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }
        let candidates = Self::load_matching(&conn, name, filter, None)?;
        let mut scored: Vec<ScoredPoint> = candidates
            .into_iter()
            .map(|p| ScoredPoint {
                id: p.id,
                score: cosine_similarity(query, &p.vector),
                payload: p.payload,
            })
            .collect();
        // Score descending, ties by ascending id for determinism.
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        scored.truncate(k);
        Ok(scored)
    }

    fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> AnchorResult<ScrollPage> {
        let conn = self.lock()?;
        Self::require_collection(&conn, name)?;
        let mut points = Self::load_matching(&conn, name, filter, cursor)?;
        let next_cursor = if points.len() > page_size {
            points.truncate(page_size);
            points.last().map(|p| p.id)
        } else {
            None
        };
        Ok(ScrollPage { points, next_cursor })
    }

    fn update_payload(
        &self,
        name: &str,
        id: Uuid,
        partial: Map<String, Value>,
    ) -> AnchorResult<()> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT payload FROM points WHERE collection = ?1 AND id = ?2",
                rusqlite::params![name, id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AnchorError::Storage(e.to_string()))?;
        let Some(existing) = existing else {
            return Err(AnchorError::NotFound(format!("point {id} in '{name}'")));
        };
        let mut payload: Map<String, Value> = serde_json::from_str(&existing)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        for (key, value) in partial {
            payload.insert(key, value);
        }
        let merged = serde_json::to_string(&payload)
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        conn.execute(
            "UPDATE points SET payload = ?3 WHERE collection = ?1 AND id = ?2",
            rusqlite::params![name, id.to_string(), merged],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    fn delete(&self, name: &str, id: Uuid) -> AnchorResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM points WHERE collection = ?1 AND id = ?2",
            rusqlite::params![name, id.to_string()],
        )
        .map_err(|e| AnchorError::Storage(e.to_string()))?;
        Ok(())
    }

    fn ping(&self) -> AnchorResult<()> {
        let conn = self.lock()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))
    }
}

/// Serialize an embedding to little-endian bytes for BLOB storage.
fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Deserialize an embedding from BLOB bytes.
fn embedding_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::Condition;
    use serde_json::json;

    fn payload(layer: &str, active: bool) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("layer".into(), json!(layer));
        map.insert("is_active".into(), json!(active));
        map.insert("valid_at".into(), Value::Null);
        map.insert("expires_at".into(), Value::Null);
        map
    }

    fn point(id_byte: u8, vector: Vec<f32>, layer: &str) -> Point {
        Point {
            id: Uuid::from_bytes([id_byte; 16]),
            vector,
            payload: payload(layer, true),
        }
    }

    fn setup() -> LocalIndex {
        let index = LocalIndex::in_memory().unwrap();
        index.ensure_collection("notes", 4).unwrap();
        index
    }

    #[test]
    fn test_dimension_enforced() {
        let index = setup();
        let err = index
            .upsert("notes", point(1, vec![0.1, 0.2], "verified_fact"))
            .unwrap_err();
        assert!(matches!(err, AnchorError::DimensionMismatch { expected: 4, actual: 2 }));

        let err = index.ensure_collection("notes", 8).unwrap_err();
        assert!(matches!(err, AnchorError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_search_ranks_by_similarity() {
        let index = setup();
        index
            .upsert("notes", point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index
            .upsert("notes", point(2, vec![0.0, 1.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index
            .upsert("notes", point(3, vec![0.7, 0.7, 0.0, 0.0], "verified_fact"))
            .unwrap();

        let hits = index
            .search("notes", &[1.0, 0.0, 0.0, 0.0], 2, &PayloadFilter::all())
            .unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, Uuid::from_bytes([1; 16]));
        assert_eq!(hits[1].id, Uuid::from_bytes([3; 16]));
        assert!(hits[0].score > hits[1].score);
    }

    #[test]
    fn test_search_tie_broken_by_id() {
        let index = setup();
        index
            .upsert("notes", point(9, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index
            .upsert("notes", point(2, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        let hits = index
            .search("notes", &[1.0, 0.0, 0.0, 0.0], 10, &PayloadFilter::all())
            .unwrap();
        assert!(hits[0].id.to_string() < hits[1].id.to_string());
    }

    #[test]
    fn test_filtered_search() {
        let index = setup();
        index
            .upsert("notes", point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index
            .upsert("notes", point(2, vec![1.0, 0.0, 0.0, 0.0], "event_log"))
            .unwrap();

        let filter = PayloadFilter::all().and(Condition::eq("layer", "event_log"));
        let hits = index
            .search("notes", &[1.0, 0.0, 0.0, 0.0], 10, &filter)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, Uuid::from_bytes([2; 16]));
    }

    #[test]
    fn test_upsert_replaces() {
        let index = setup();
        index
            .upsert("notes", point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index
            .upsert("notes", point(1, vec![0.0, 1.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        let hits = index
            .search("notes", &[0.0, 1.0, 0.0, 0.0], 10, &PayloadFilter::all())
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert!(hits[0].score > 0.99);
    }

    #[test]
    fn test_update_payload_merges() {
        let index = setup();
        index
            .upsert("notes", point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        let mut partial = Map::new();
        partial.insert("is_active".into(), json!(false));
        index
            .update_payload("notes", Uuid::from_bytes([1; 16]), partial)
            .unwrap();

        let filter = PayloadFilter::all().and(Condition::eq("is_active", false));
        let hits = index
            .search("notes", &[1.0, 0.0, 0.0, 0.0], 10, &filter)
            .unwrap();
        assert_eq!(hits.len(), 1);
        // Untouched keys survive the merge.
        assert_eq!(hits[0].payload.get("layer"), Some(&json!("verified_fact")));
    }

    #[test]
    fn test_scroll_pagination() {
        let index = setup();
        for i in 1..=5u8 {
            index
                .upsert("notes", point(i, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
                .unwrap();
        }
        let page1 = index
            .scroll("notes", &PayloadFilter::all(), None, 2)
            .unwrap();
        assert_eq!(page1.points.len(), 2);
        let cursor = page1.next_cursor.expect("more pages");

        let page2 = index
            .scroll("notes", &PayloadFilter::all(), Some(cursor), 2)
            .unwrap();
        assert_eq!(page2.points.len(), 2);

        let page3 = index
            .scroll("notes", &PayloadFilter::all(), page2.next_cursor, 2)
            .unwrap();
        assert_eq!(page3.points.len(), 1);
        assert!(page3.next_cursor.is_none());

        let mut seen: Vec<Uuid> = page1
            .points
            .iter()
            .chain(&page2.points)
            .chain(&page3.points)
            .map(|p| p.id)
            .collect();
        seen.dedup();
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_batch_upsert_partial_failure() {
        let index = setup();
        let report = index
            .batch_upsert(
                "notes",
                vec![
                    point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"),
                    point(2, vec![1.0, 0.0], "verified_fact"),
                ],
            )
            .unwrap();
        assert_eq!(report.succeeded, vec![Uuid::from_bytes([1; 16])]);
        assert_eq!(report.failed.len(), 1);
        assert!(!report.is_complete());
    }

    #[test]
    fn test_delete_is_hard() {
        let index = setup();
        index
            .upsert("notes", point(1, vec![1.0, 0.0, 0.0, 0.0], "verified_fact"))
            .unwrap();
        index.delete("notes", Uuid::from_bytes([1; 16])).unwrap();
        let hits = index
            .search("notes", &[1.0, 0.0, 0.0, 0.0], 10, &PayloadFilter::all())
            .unwrap();
        assert!(hits.is_empty());
    }
}
