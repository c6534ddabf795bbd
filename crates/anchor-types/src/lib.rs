//! Shared types for the Memory Anchor substrate.
//!
//! Everything the storage and kernel crates agree on lives here: the layered
//! note model, pending/approval records, checklist items, session state,
//! configuration, kernel events, and the error taxonomy.

pub mod checklist;
pub mod config;
pub mod error;
pub mod event;
pub mod note;
pub mod pending;
pub mod session;

pub use error::{AnchorError, AnchorResult};
pub use note::{MemoryLayer, Note, NoteCategory, NoteId, SearchHit};
