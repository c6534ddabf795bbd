//! Storage layer for the Memory Anchor substrate.
//!
//! Two stores with different consistency properties:
//! - **Vector index**: namespaced collections of `(id, vector, payload)`
//!   points with cosine ANN search and payload filters. Embedded
//!   ([`local::LocalIndex`], SQLite-backed brute force) and server mode
//!   ([`qdrant::QdrantIndex`], REST) behind the same [`VectorIndex`] trait.
//! - **Metadata store**: durable relational storage ([`MetadataStore`],
//!   SQLite) for pending memories, the identity-schema audit trail,
//!   checklist items, and session archives. Hosts the optimistic-lock
//!   primitive every status transition goes through.

pub mod filter;
pub mod local;
pub mod metadata;
pub mod migration;
pub mod payload;
pub mod qdrant;
pub mod vector;

pub use filter::{Condition, PayloadFilter};
pub use metadata::MetadataStore;
pub use payload::NotePayload;
pub use vector::{BatchReport, Point, ScoredPoint, VectorIndex};
