//! The fixed payload schema for vector-store points.
//!
//! `valid_at` and `expires_at` are always materialized in the serialized
//! payload, as explicit nulls when unset. The temporal filters match on
//! is-null predicates, so a missing key would silently exclude the point
//! from every as-of query.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::note::{MemoryLayer, Note, NoteCategory, NoteId};

/// Payload key names, fixed across both vector-store modes.
pub mod keys {
    pub const CONTENT: &str = "content";
    pub const LAYER: &str = "layer";
    pub const CATEGORY: &str = "category";
    pub const CONFIDENCE: &str = "confidence";
    pub const CREATED_AT: &str = "created_at";
    pub const VALID_AT: &str = "valid_at";
    pub const EXPIRES_AT: &str = "expires_at";
    pub const IS_ACTIVE: &str = "is_active";
    pub const SESSION_ID: &str = "session_id";
    pub const RELATED_FILES: &str = "related_files";
    pub const CREATED_BY: &str = "created_by";
    pub const PROMOTED_TO: &str = "promoted_to";
}

/// Typed view of a note's vector-store payload.
#[derive(Debug, Clone)]
pub struct NotePayload {
    pub content: String,
    pub layer: MemoryLayer,
    pub category: Option<NoteCategory>,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub valid_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub session_id: Option<String>,
    pub related_files: Vec<String>,
    pub created_by: String,
}

impl NotePayload {
    /// Build the payload view of a note.
    pub fn from_note(note: &Note) -> Self {
        Self {
            content: note.content.clone(),
            layer: note.layer,
            category: note.category,
            confidence: note.confidence,
            created_at: note.created_at,
            valid_at: note.valid_at,
            expires_at: note.expires_at,
            is_active: note.is_active,
            session_id: note.session_id.clone(),
            related_files: note.related_files.clone(),
            created_by: note.created_by.clone(),
        }
    }

    /// Serialize into the flat payload map. Timestamps become epoch seconds
    /// so range filters compare numerically; `valid_at` / `expires_at` are
    /// written even when null.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert(keys::CONTENT.into(), json!(self.content));
        map.insert(keys::LAYER.into(), json!(self.layer.as_str()));
        map.insert(
            keys::CATEGORY.into(),
            match self.category {
                Some(c) => json!(c.as_str()),
                None => Value::Null,
            },
        );
        map.insert(keys::CONFIDENCE.into(), json!(self.confidence));
        map.insert(keys::CREATED_AT.into(), json!(self.created_at.timestamp()));
        map.insert(
            keys::VALID_AT.into(),
            match self.valid_at {
                Some(t) => json!(t.timestamp()),
                None => Value::Null,
            },
        );
        map.insert(
            keys::EXPIRES_AT.into(),
            match self.expires_at {
                Some(t) => json!(t.timestamp()),
                None => Value::Null,
            },
        );
        map.insert(keys::IS_ACTIVE.into(), json!(self.is_active));
        map.insert(
            keys::SESSION_ID.into(),
            match &self.session_id {
                Some(s) => json!(s),
                None => Value::Null,
            },
        );
        map.insert(keys::RELATED_FILES.into(), json!(self.related_files));
        map.insert(keys::CREATED_BY.into(), json!(self.created_by));
        map
    }

    /// Reconstruct a note from a point id and its payload map.
    pub fn note_from_map(id: Uuid, map: &Map<String, Value>) -> AnchorResult<Note> {
        let content = str_field(map, keys::CONTENT)?;
        let layer = MemoryLayer::parse(&str_field(map, keys::LAYER)?)?;
        let category = match map.get(keys::CATEGORY) {
            Some(Value::String(s)) => Some(NoteCategory::parse(s)?),
            _ => None,
        };
        let confidence = num_field(map, keys::CONFIDENCE).unwrap_or(1.0);
        let created_at = epoch_field(map, keys::CREATED_AT)
            .ok_or_else(|| AnchorError::Serialization("payload missing created_at".into()))?;
        let valid_at = epoch_field(map, keys::VALID_AT);
        let expires_at = epoch_field(map, keys::EXPIRES_AT);
        let is_active = matches!(map.get(keys::IS_ACTIVE), Some(Value::Bool(true)));
        let session_id = match map.get(keys::SESSION_ID) {
            Some(Value::String(s)) => Some(s.clone()),
            _ => None,
        };
        let related_files = match map.get(keys::RELATED_FILES) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect(),
            _ => Vec::new(),
        };
        let created_by = str_field(map, keys::CREATED_BY).unwrap_or_else(|_| "unknown".into());

        Ok(Note {
            id: NoteId(id),
            content,
            layer,
            category,
            confidence,
            created_at,
            valid_at,
            expires_at,
            created_by,
            session_id,
            related_files,
            is_active,
        })
    }
}

fn str_field(map: &Map<String, Value>, key: &str) -> AnchorResult<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| AnchorError::Serialization(format!("payload missing string '{key}'")))
}

fn num_field(map: &Map<String, Value>, key: &str) -> Option<f64> {
    map.get(key).and_then(Value::as_f64)
}

fn epoch_field(map: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    map.get(key)
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
