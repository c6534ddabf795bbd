//! Pending memories and identity-schema change proposals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnchorError, AnchorResult};
use crate::note::{MemoryLayer, NoteCategory};

/// Status of a staged record awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingStatus {
    /// Waiting for approval.
    Pending,
    /// Exactly one writer holds the logical lock and is committing.
    Processing,
    /// Approved and committed to the active stores.
    Approved,
    /// Rejected by a reviewer.
    Rejected,
    /// Expired by TTL without a decision.
    Expired,
}

impl PendingStatus {
    /// Parse a status name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown pending status '{other}'"
            ))),
        }
    }

    /// Canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for PendingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a change proposal does to its target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Create,
    Update,
    Delete,
}

impl ChangeType {
    /// Parse a change type name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "create" => Ok(Self::Create),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown change type '{other}'"
            ))),
        }
    }

    /// Canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

/// One recorded approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    /// Who approved.
    pub approver: String,
    /// Optional reviewer comment.
    #[serde(default)]
    pub comment: Option<String>,
    /// When the approval was recorded.
    pub timestamp: DateTime<Utc>,
}

/// A memory staged in `pending_memories` awaiting approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingMemory {
    /// Unique ID; becomes the note id on approval.
    pub id: Uuid,
    /// Proposed content.
    pub content: String,
    /// Target layer.
    pub layer: MemoryLayer,
    /// Optional category.
    pub category: Option<NoteCategory>,
    /// Confidence that routed this memory to the pending queue.
    pub confidence: f64,
    /// What the proposal does.
    pub change_type: ChangeType,
    /// Who proposed it.
    pub proposer: String,
    /// Why.
    #[serde(default)]
    pub reason: Option<String>,
    /// For update/delete, the existing note id.
    pub target_id: Option<Uuid>,
    /// Current status.
    pub status: PendingStatus,
    /// Recorded approvals.
    #[serde(default)]
    pub approvals: Vec<Approval>,
    /// When the proposal was created.
    pub created_at: DateTime<Utc>,
    /// Last status change.
    pub updated_at: DateTime<Utc>,
}

/// One row of the identity-schema audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityChange {
    /// Change proposal id.
    pub change_id: Uuid,
    /// Existing entry this change targets (update/delete).
    pub target_id: Option<Uuid>,
    /// What the proposal does.
    pub change_type: ChangeType,
    /// Proposed entry content.
    pub proposed_content: String,
    /// Why the change is needed.
    pub reason: String,
    /// Optional category for the entry.
    pub category: Option<NoteCategory>,
    /// Current status. Uses the pending vocabulary plus `applied`.
    pub status: ChangeStatus,
    /// Number of recorded approvals. Always equals `approvals.len()`.
    pub approvals_count: u32,
    /// Recorded approvals.
    #[serde(default)]
    pub approvals: Vec<Approval>,
    /// Who proposed.
    pub proposer: String,
    /// When proposed.
    pub created_at: DateTime<Utc>,
    /// Last transition.
    pub updated_at: DateTime<Utc>,
    /// When the change was applied to the stores, if it was.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Status of an identity-schema change proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    Pending,
    Processing,
    Applied,
    Rejected,
    Expired,
}

impl ChangeStatus {
    /// Parse a status name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "applied" => Ok(Self::Applied),
            "rejected" => Ok(Self::Rejected),
            "expired" => Ok(Self::Expired),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown change status '{other}'"
            ))),
        }
    }

    /// Canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Applied => "applied",
            Self::Rejected => "rejected",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
