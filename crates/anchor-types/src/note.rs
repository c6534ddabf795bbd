//! The layered note model: memory layers, categories, and the note record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnchorError, AnchorResult};

/// Unique identifier for a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NoteId(pub Uuid);

impl NoteId {
    /// Create a new random NoteId.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a NoteId from its string form.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| AnchorError::InvalidArgument(format!("invalid note id '{s}': {e}")))
    }
}

impl Default for NoteId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for NoteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The five memory layers, L0 through L4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryLayer {
    /// L0: governed identity records. Writes require three approvals.
    IdentitySchema,
    /// L1: working context for the current session.
    ActiveContext,
    /// L2: timestamped observations, usually with a TTL.
    EventLog,
    /// L3: long-lived verified facts.
    VerifiedFact,
    /// L4: procedures and operational knowledge.
    OperationalKnowledge,
}

impl MemoryLayer {
    /// Parse a layer name. Legacy aliases (`constitution`, `fact`, `session`)
    /// are accepted and normalized.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "identity_schema" | "constitution" => Ok(Self::IdentitySchema),
            "active_context" => Ok(Self::ActiveContext),
            "event_log" | "session" => Ok(Self::EventLog),
            "verified_fact" | "fact" => Ok(Self::VerifiedFact),
            "operational_knowledge" => Ok(Self::OperationalKnowledge),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown memory layer '{other}'"
            ))),
        }
    }

    /// Canonical string name of the layer.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IdentitySchema => "identity_schema",
            Self::ActiveContext => "active_context",
            Self::EventLog => "event_log",
            Self::VerifiedFact => "verified_fact",
            Self::OperationalKnowledge => "operational_knowledge",
        }
    }

    /// All layers in L0..L4 order.
    pub fn all() -> [MemoryLayer; 5] {
        [
            Self::IdentitySchema,
            Self::ActiveContext,
            Self::EventLog,
            Self::VerifiedFact,
            Self::OperationalKnowledge,
        ]
    }
}

impl std::fmt::Display for MemoryLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional note category. A small closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoteCategory {
    Person,
    Place,
    Event,
    Item,
    Routine,
}

impl NoteCategory {
    /// Parse a category name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "person" => Ok(Self::Person),
            "place" => Ok(Self::Place),
            "event" => Ok(Self::Event),
            "item" => Ok(Self::Item),
            "routine" => Ok(Self::Routine),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown category '{other}'"
            ))),
        }
    }

    /// Canonical string name of the category.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Person => "person",
            Self::Place => "place",
            Self::Event => "event",
            Self::Item => "item",
            Self::Routine => "routine",
        }
    }
}

impl std::fmt::Display for NoteCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single memory record.
///
/// The dense vector is held by the vector store and only materialized here
/// during export.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Note {
    /// Unique ID across both stores.
    pub id: NoteId,
    /// Textual payload, post-safety-filter.
    pub content: String,
    /// Memory layer.
    pub layer: MemoryLayer,
    /// Optional category.
    pub category: Option<NoteCategory>,
    /// Confidence in [0, 1].
    pub confidence: f64,
    /// Wall time of record creation.
    pub created_at: DateTime<Utc>,
    /// Time from which the fact is effective. None means effective immediately.
    pub valid_at: Option<DateTime<Utc>>,
    /// Time after which the fact is no longer valid. None means permanent.
    pub expires_at: Option<DateTime<Utc>>,
    /// Opaque source tag ("agent", "human", ...).
    pub created_by: String,
    /// Correlation key grouping memories from one working session.
    pub session_id: Option<String>,
    /// Ordered list of related file paths.
    #[serde(default)]
    pub related_files: Vec<String>,
    /// Soft-delete tombstone.
    pub is_active: bool,
}

impl Note {
    /// Validate the cross-field invariants: confidence range, non-empty
    /// content, and valid_at <= expires_at when both are present.
    pub fn validate(&self) -> AnchorResult<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(AnchorError::InvalidArgument(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if self.content.is_empty() {
            return Err(AnchorError::InvalidArgument(
                "content must not be empty".to_string(),
            ));
        }
        if let (Some(valid_at), Some(expires_at)) = (self.valid_at, self.expires_at) {
            if valid_at > expires_at {
                return Err(AnchorError::InvalidArgument(format!(
                    "valid_at {valid_at} is after expires_at {expires_at}"
                )));
            }
        }
        Ok(())
    }
}

/// A note returned from search, annotated with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// The note.
    #[serde(flatten)]
    pub note: Note,
    /// Cosine similarity to the query. Identity-schema records carry 1.0.
    pub score: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(confidence: f64) -> Note {
        Note {
            id: NoteId::new(),
            content: "The door code is on the fridge".to_string(),
            layer: MemoryLayer::VerifiedFact,
            category: None,
            confidence,
            created_at: Utc::now(),
            valid_at: None,
            expires_at: None,
            created_by: "human".to_string(),
            session_id: None,
            related_files: Vec::new(),
            is_active: true,
        }
    }

    #[test]
    fn test_layer_aliases_normalize() {
        assert_eq!(
            MemoryLayer::parse("constitution").unwrap(),
            MemoryLayer::IdentitySchema
        );
        assert_eq!(MemoryLayer::parse("fact").unwrap(), MemoryLayer::VerifiedFact);
        assert_eq!(MemoryLayer::parse("session").unwrap(), MemoryLayer::EventLog);
        assert_eq!(
            MemoryLayer::parse("verified_fact").unwrap(),
            MemoryLayer::VerifiedFact
        );
        assert!(MemoryLayer::parse("episodic").is_err());
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(note(0.0).validate().is_ok());
        assert!(note(1.0).validate().is_ok());
        assert!(note(1.1).validate().is_err());
        assert!(note(-0.1).validate().is_err());
        assert!(note(f64::NAN).validate().is_err());
    }

    #[test]
    fn test_time_field_ordering() {
        let mut n = note(0.9);
        n.valid_at = Some(Utc::now());
        n.expires_at = Some(Utc::now() - chrono::Duration::days(1));
        assert!(n.validate().is_err());

        n.expires_at = Some(Utc::now() + chrono::Duration::days(1));
        assert!(n.validate().is_ok());
    }

    #[test]
    fn test_empty_content_rejected() {
        let mut n = note(0.9);
        n.content.clear();
        assert!(n.validate().is_err());
    }
}
