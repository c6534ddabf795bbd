//! Working-session lifecycle.
//!
//! Tracks the current session's counters, archives it to the metadata store
//! on end, and emits the session events hooks listen for.

use chrono::Utc;
use std::sync::{Arc, Mutex};
use tracing::info;

use anchor_store::metadata::MetadataStore;
use anchor_types::error::{AnchorError, AnchorResult};
use anchor_types::event::{KernelEvent, SessionStats};
use anchor_types::session::SessionState;

use crate::events::EventSink;

/// Tracks the active session, if any.
pub struct SessionTracker {
    store: Arc<MetadataStore>,
    events: Arc<EventSink>,
    current: Mutex<Option<SessionState>>,
}

impl SessionTracker {
    /// Create a tracker with no active session.
    pub fn new(store: Arc<MetadataStore>, events: Arc<EventSink>) -> Self {
        Self {
            store,
            events,
            current: Mutex::new(None),
        }
    }

    /// Begin a session. An already-active session is archived first.
    pub fn start(&self, session_id: &str) -> AnchorResult<SessionState> {
        let mut current = self
            .current
            .lock()
            .map_err(|e| AnchorError::Internal(e.to_string()))?;
        if let Some(mut previous) = current.take() {
            previous.ended_at = Some(Utc::now());
            self.store.archive_session(&previous, None)?;
        }
        let session = SessionState::new(session_id);
        info!(session_id, "session started");
        self.events.emit(&KernelEvent::SessionStarted {
            session_id: session_id.to_string(),
        });
        *current = Some(session.clone());
        Ok(session)
    }

    /// End the active session, archive it, and emit `session.ended`.
    pub fn end(&self, summary: Option<&str>) -> AnchorResult<SessionState> {
        let mut current = self
            .current
            .lock()
            .map_err(|e| AnchorError::Internal(e.to_string()))?;
        let mut session = current
            .take()
            .ok_or_else(|| AnchorError::InvalidArgument("no active session".to_string()))?;
        let ended_at = Utc::now();
        session.ended_at = Some(ended_at);
        self.store.archive_session(&session, summary)?;
        info!(session_id = %session.session_id, ops = session.memory_ops_count, "session ended");
        self.events.emit(&KernelEvent::SessionEnded {
            session_id: session.session_id.clone(),
            stats: SessionStats {
                memory_ops: session.memory_ops_count,
                file_mods: session.file_mods_count,
                files_touched: session.source_files.len() as u64,
            },
            ended_at,
        });
        Ok(session)
    }

    /// Record one memory operation against the active session, if any.
    pub fn record_memory_op(&self) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(session) = current.as_mut() {
                session.record_memory_op();
            }
        }
    }

    /// Record a file touch against the active session, if any.
    pub fn record_file(&self, path: &str) {
        if let Ok(mut current) = self.current.lock() {
            if let Some(session) = current.as_mut() {
                session.record_file(path);
            }
        }
    }

    /// The active session id, if a session is running.
    pub fn active_session_id(&self) -> Option<String> {
        self.current
            .lock()
            .ok()
            .and_then(|c| c.as_ref().map(|s| s.session_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup() -> (SessionTracker, Arc<MetadataStore>) {
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        let tracker = SessionTracker::new(store.clone(), Arc::new(EventSink::new()));
        (tracker, store)
    }

    #[test]
    fn test_start_end_archives() {
        let (tracker, store) = setup();
        tracker.start("sess-1").unwrap();
        tracker.record_memory_op();
        tracker.record_file("src/lib.rs");
        tracker.record_file("src/lib.rs");

        let ended = tracker.end(Some("worked on lib")).unwrap();
        assert_eq!(ended.memory_ops_count, 1);
        assert_eq!(ended.file_mods_count, 2);

        let archived = store.get_archived_session("sess-1").unwrap().unwrap();
        assert_eq!(archived.source_files.len(), 1);
        assert!(archived.ended_at.is_some());
        assert!(tracker.active_session_id().is_none());
    }

    #[test]
    fn test_end_without_session_errors() {
        let (tracker, _) = setup();
        assert!(tracker.end(None).is_err());
    }

    #[test]
    fn test_restart_archives_previous() {
        let (tracker, store) = setup();
        tracker.start("sess-1").unwrap();
        tracker.record_memory_op();
        tracker.start("sess-2").unwrap();

        assert!(store.get_archived_session("sess-1").unwrap().is_some());
        assert_eq!(tracker.active_session_id().as_deref(), Some("sess-2"));
    }

    #[test]
    fn test_events_emitted() {
        let store = Arc::new(MetadataStore::in_memory().unwrap());
        let events = Arc::new(EventSink::new());
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        events.subscribe(Box::new(move |event| match event {
            KernelEvent::SessionStarted { .. } | KernelEvent::SessionEnded { .. } => {
                c.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }));
        let tracker = SessionTracker::new(store, events);
        tracker.start("sess-1").unwrap();
        tracker.end(None).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
