//! The Memory Anchor kernel.
//!
//! A synchronous orchestration layer over the vector index and the metadata
//! store: layered memory writes with compensation, confidence routing,
//! three-approval identity governance, bi-temporal search, conflict
//! detection, context budgets, checklists, and session lifecycle.
//!
//! The kernel itself never spawns tasks and never awaits; network I/O is
//! confined to the embedder and the server-mode vector store, both blocking.
//! Callers running under a cooperative runtime wrap kernel calls in their
//! scheduler's blocking primitive.

pub mod budget;
pub mod checklist;
pub mod conflict;
pub mod embedder;
pub mod events;
pub mod export;
pub mod governor;
pub mod kernel;
pub mod resolver;
pub mod safety;
pub mod session;
pub mod singleton;
pub mod temporal;

pub use embedder::Embedder;
pub use kernel::{AddMemoryRequest, AddOutcome, AddStatus, MemoryKernel, SearchRequest};
pub use singleton::{kernel, try_kernel};
