//! Server-mode vector index speaking the Qdrant REST API.
//!
//! All I/O goes through a blocking HTTP client; the kernel stays
//! synchronous. Connection failures map to `StorageUnavailable`, API-level
//! failures to `Storage`.

use reqwest::blocking::Client;
use serde_json::{json, Map, Value};
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use anchor_types::error::{AnchorError, AnchorResult};

use crate::filter::PayloadFilter;
use crate::vector::{BatchReport, Point, ScoredPoint, ScrollPage, VectorIndex};

/// Vector index backed by a Qdrant server.
pub struct QdrantIndex {
    base_url: String,
    client: Client,
}

impl QdrantIndex {
    /// Connect to a Qdrant endpoint, e.g. `http://localhost:6333`.
    pub fn new(base_url: impl Into<String>) -> AnchorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| AnchorError::Internal(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn http_get(&self, path: &str) -> AnchorResult<reqwest::blocking::Response> {
        self.client
            .get(self.url(path))
            .send()
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))
    }

    fn send_json(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &Value,
    ) -> AnchorResult<Value> {
        let resp = self
            .client
            .request(method, self.url(path))
            .json(body)
            .send()
            .map_err(|e| AnchorError::StorageUnavailable(e.to_string()))?;
        let status = resp.status();
        let value: Value = resp
            .json()
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        if !status.is_success() {
            return Err(AnchorError::Storage(format!(
                "qdrant {path} returned {status}: {value}"
            )));
        }
        Ok(value)
    }

    fn point_to_json(point: &Point) -> Value {
        json!({
            "id": point.id.to_string(),
            "vector": point.vector,
            "payload": point.payload,
        })
    }

    fn parse_id(value: &Value) -> AnchorResult<Uuid> {
        value
            .as_str()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| AnchorError::Serialization(format!("bad point id in response: {value}")))
    }

    fn parse_payload(value: Option<&Value>) -> Map<String, Value> {
        match value {
            Some(Value::Object(map)) => map.clone(),
            _ => Map::new(),
        }
    }
}

impl VectorIndex for QdrantIndex {
    fn ensure_collection(&self, name: &str, dim: usize) -> AnchorResult<()> {
        let resp = self.http_get(&format!("/collections/{name}"))?;
        if resp.status().is_success() {
            let info: Value = resp
                .json()
                .map_err(|e| AnchorError::Serialization(e.to_string()))?;
            let existing = info["result"]["config"]["params"]["vectors"]["size"]
                .as_u64()
                .unwrap_or(0) as usize;
            if existing != dim {
                return Err(AnchorError::DimensionMismatch {
                    expected: existing,
                    actual: dim,
                });
            }
            return Ok(());
        }

        self.send_json(
            reqwest::Method::PUT,
            &format!("/collections/{name}"),
            &json!({ "vectors": { "size": dim, "distance": "Cosine" } }),
        )?;
        debug!(collection = name, dim, "created collection");
        Ok(())
    }

    fn upsert(&self, name: &str, point: Point) -> AnchorResult<()> {
        self.send_json(
            reqwest::Method::PUT,
            &format!("/collections/{name}/points?wait=true"),
            &json!({ "points": [Self::point_to_json(&point)] }),
        )?;
        Ok(())
    }

    fn batch_upsert(&self, name: &str, points: Vec<Point>) -> AnchorResult<BatchReport> {
        // One request per point keeps the per-point outcome report exact;
        // batches here are small (import and backfill paths).
        let mut report = BatchReport::default();
        for point in points {
            let id = point.id;
            match self.upsert(name, point) {
                Ok(()) => report.succeeded.push(id),
                Err(e) => report.failed.push((id, e.to_string())),
            }
        }
        Ok(report)
    }

    fn get(&self, name: &str, id: Uuid) -> AnchorResult<Option<Point>> {
        let resp = self.http_get(&format!("/collections/{name}/points/{id}"))?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let status = resp.status();
        let value: Value = resp
            .json()
            .map_err(|e| AnchorError::Serialization(e.to_string()))?;
        if !status.is_success() {
            return Err(AnchorError::Storage(format!(
                "qdrant point fetch returned {status}: {value}"
            )));
        }
        let row = &value["result"];
        if row.is_null() {
            return Ok(None);
        }
        let vector = row["vector"]
            .as_array()
            .map(|vals| {
                vals.iter()
                    .filter_map(|v| v.as_f64().map(|f| f as f32))
                    .collect()
            })
            .unwrap_or_default();
        Ok(Some(Point {
            id,
            vector,
            payload: Self::parse_payload(row.get("payload")),
        }))
    }

    fn search(
        &self,
        name: &str,
        query: &[f32],
        k: usize,
        filter: &PayloadFilter,
    ) -> AnchorResult<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": query,
            "limit": k,
            "with_payload": true,
        });
        if let Some(f) = filter.to_qdrant_json() {
            body["filter"] = f;
        }
        let resp = self.send_json(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/search"),
            &body,
        )?;
        let empty = Vec::new();
        let rows = resp["result"].as_array().unwrap_or(&empty);
        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            hits.push(ScoredPoint {
                id: Self::parse_id(&row["id"])?,
                score: row["score"].as_f64().unwrap_or(0.0) as f32,
                payload: Self::parse_payload(row.get("payload")),
            });
        }
        // Server ordering is score-descending already; re-sort to pin the
        // lexicographic tie-break the contract promises.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.to_string().cmp(&b.id.to_string()))
        });
        Ok(hits)
    }

    fn scroll(
        &self,
        name: &str,
        filter: &PayloadFilter,
        cursor: Option<Uuid>,
        page_size: usize,
    ) -> AnchorResult<ScrollPage> {
        // Scroll's default order is ascending point id, which is exactly the
        // cursor contract.
        let mut body = json!({
            "limit": page_size,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(f) = filter.to_qdrant_json() {
            body["filter"] = f;
        }
        if let Some(c) = cursor {
            body["offset"] = json!(c.to_string());
        }
        let resp = self.send_json(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/scroll"),
            &body,
        )?;
        let empty = Vec::new();
        let rows = resp["result"]["points"].as_array().unwrap_or(&empty);
        let mut points = Vec::with_capacity(rows.len());
        for row in rows {
            let vector = row["vector"]
                .as_array()
                .map(|vals| {
                    vals.iter()
                        .filter_map(|v| v.as_f64().map(|f| f as f32))
                        .collect()
                })
                .unwrap_or_default();
            points.push(Point {
                id: Self::parse_id(&row["id"])?,
                vector,
                payload: Self::parse_payload(row.get("payload")),
            });
        }
        let next_cursor = match &resp["result"]["next_page_offset"] {
            Value::Null => None,
            v => Some(Self::parse_id(v)?),
        };
        Ok(ScrollPage { points, next_cursor })
    }

    fn update_payload(
        &self,
        name: &str,
        id: Uuid,
        partial: Map<String, Value>,
    ) -> AnchorResult<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/payload?wait=true"),
            &json!({ "payload": partial, "points": [id.to_string()] }),
        )?;
        Ok(())
    }

    fn delete(&self, name: &str, id: Uuid) -> AnchorResult<()> {
        self.send_json(
            reqwest::Method::POST,
            &format!("/collections/{name}/points/delete?wait=true"),
            &json!({ "points": [id.to_string()] }),
        )?;
        Ok(())
    }

    fn ping(&self) -> AnchorResult<()> {
        let resp = self.http_get("/readyz")?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(AnchorError::StorageUnavailable(format!(
                "qdrant readiness returned {}",
                resp.status()
            )))
        }
    }
}
