//! Kernel events for external hook integration.
//!
//! Events are delivered synchronously before the originating call returns;
//! there is no async queue behind them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::note::MemoryLayer;

/// Summary statistics attached to `session.ended`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStats {
    /// Number of memory operations performed during the session.
    pub memory_ops: u64,
    /// Number of file modifications recorded.
    pub file_mods: u64,
    /// Distinct source files touched.
    pub files_touched: u64,
}

/// An event emitted by the kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum KernelEvent {
    /// A memory was committed to the active stores.
    MemoryAdded {
        /// The new note id.
        id: Uuid,
        /// Its layer.
        layer: MemoryLayer,
        /// Its confidence.
        confidence: f64,
        /// Whether the conflict detector flagged the write.
        has_conflict: bool,
    },
    /// A memory was soft-deleted.
    MemoryDeleted {
        /// The tombstoned note id.
        id: Uuid,
    },
    /// An identity-schema change was proposed.
    IdentityProposed {
        /// The change proposal id.
        change_id: Uuid,
    },
    /// An identity-schema change gathered three approvals and was applied.
    IdentityApplied {
        /// The change proposal id.
        change_id: Uuid,
    },
    /// An identity-schema change was rejected.
    IdentityRejected {
        /// The change proposal id.
        change_id: Uuid,
    },
    /// A working session started.
    SessionStarted {
        /// The session correlation key.
        session_id: String,
    },
    /// A working session ended.
    SessionEnded {
        /// The session correlation key.
        session_id: String,
        /// Counters accumulated over the session.
        stats: SessionStats,
        /// When the session ended.
        ended_at: DateTime<Utc>,
    },
}

impl KernelEvent {
    /// Dotted event name, for subscribers that dispatch on strings.
    pub fn name(&self) -> &'static str {
        match self {
            Self::MemoryAdded { .. } => "memory.added",
            Self::MemoryDeleted { .. } => "memory.deleted",
            Self::IdentityProposed { .. } => "identity.proposed",
            Self::IdentityApplied { .. } => "identity.applied",
            Self::IdentityRejected { .. } => "identity.rejected",
            Self::SessionStarted { .. } => "session.started",
            Self::SessionEnded { .. } => "session.ended",
        }
    }
}
