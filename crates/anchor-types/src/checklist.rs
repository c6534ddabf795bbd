//! Checklist items: prioritized, scoped task records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{AnchorError, AnchorResult};

/// Lifecycle of a checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistStatus {
    Open,
    Done,
    Cancelled,
}

impl ChecklistStatus {
    /// Parse a status name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "open" => Ok(Self::Open),
            "done" => Ok(Self::Done),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown checklist status '{other}'"
            ))),
        }
    }

    /// Canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Done => "done",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Visibility scope of a checklist item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChecklistScope {
    Project,
    Session,
    Global,
}

impl ChecklistScope {
    /// Parse a scope name.
    pub fn parse(s: &str) -> AnchorResult<Self> {
        match s {
            "project" => Ok(Self::Project),
            "session" => Ok(Self::Session),
            "global" => Ok(Self::Global),
            other => Err(AnchorError::InvalidArgument(format!(
                "unknown checklist scope '{other}'"
            ))),
        }
    }

    /// Canonical string name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Session => "session",
            Self::Global => "global",
        }
    }
}

/// Priority, 1 (critical) through 5 (backlog). Lower sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ChecklistPriority {
    Critical,
    High,
    Normal,
    Low,
    Backlog,
}

impl ChecklistPriority {
    /// Numeric value, 1..=5.
    pub fn value(&self) -> u8 {
        match self {
            Self::Critical => 1,
            Self::High => 2,
            Self::Normal => 3,
            Self::Low => 4,
            Self::Backlog => 5,
        }
    }

    /// Human label used in briefings.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Critical => "Critical",
            Self::High => "High",
            Self::Normal => "Normal",
            Self::Low => "Low",
            Self::Backlog => "Backlog",
        }
    }
}

impl TryFrom<u8> for ChecklistPriority {
    type Error = AnchorError;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        match v {
            1 => Ok(Self::Critical),
            2 => Ok(Self::High),
            3 => Ok(Self::Normal),
            4 => Ok(Self::Low),
            5 => Ok(Self::Backlog),
            other => Err(AnchorError::InvalidArgument(format!(
                "priority {other} outside 1..=5"
            ))),
        }
    }
}

impl From<ChecklistPriority> for u8 {
    fn from(p: ChecklistPriority) -> u8 {
        p.value()
    }
}

/// A persistent task-list entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChecklistItem {
    /// Unique id.
    pub id: Uuid,
    /// Owning project.
    pub project_id: String,
    /// What needs doing.
    pub content: String,
    /// Lifecycle status.
    pub status: ChecklistStatus,
    /// Visibility scope.
    pub scope: ChecklistScope,
    /// Priority, 1..=5.
    pub priority: ChecklistPriority,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// When the item was created.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
    /// When the item was completed, if it was.
    pub completed_at: Option<DateTime<Utc>>,
    /// Optional TTL.
    pub expires_at: Option<DateTime<Utc>>,
}

impl ChecklistItem {
    /// Stable short id token: the first 8 hex chars of the uuid.
    pub fn short_id(&self) -> String {
        self.id.simple().to_string()[..8].to_string()
    }

    /// Back-reference token agents embed in plans: `(ma:<prefix>)`.
    pub fn ma_ref(&self) -> String {
        format!("(ma:{})", self.short_id())
    }
}
