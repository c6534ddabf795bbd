//! Session state: one working session of an agent against the substrate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Mutable state of a working session, archived on end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Correlation key for memories written during the session.
    pub session_id: String,
    /// When the session began.
    pub started_at: DateTime<Utc>,
    /// Source files touched during the session.
    #[serde(default)]
    pub source_files: BTreeSet<String>,
    /// Number of memory operations performed.
    pub memory_ops_count: u64,
    /// Number of file modifications recorded.
    pub file_mods_count: u64,
    /// When the session ended, if it did.
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionState {
    /// Start a fresh session.
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            started_at: Utc::now(),
            source_files: BTreeSet::new(),
            memory_ops_count: 0,
            file_mods_count: 0,
            ended_at: None,
        }
    }

    /// Record a file touch. Duplicate paths count once in `source_files`
    /// but every call bumps the modification counter.
    pub fn record_file(&mut self, path: impl Into<String>) {
        self.source_files.insert(path.into());
        self.file_mods_count += 1;
    }

    /// Record one memory operation.
    pub fn record_memory_op(&mut self) {
        self.memory_ops_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let mut s = SessionState::new("sess-1");
        s.record_file("src/main.rs");
        s.record_file("src/main.rs");
        s.record_memory_op();
        assert_eq!(s.source_files.len(), 1);
        assert_eq!(s.file_mods_count, 2);
        assert_eq!(s.memory_ops_count, 1);
        assert!(s.ended_at.is_none());
    }
}
