//! Process-wide kernel handle with one-shot lazy initialization.
//!
//! Fast path is a read lock on the shared slot; on a miss the init mutex is
//! taken and the slot re-checked before construction, so concurrent first
//! callers run the constructor exactly once. A failed construction leaves
//! the slot empty; the error is never cached and the next call retries.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use tracing::info;

use anchor_store::local::LocalIndex;
use anchor_store::metadata::MetadataStore;
use anchor_store::qdrant::QdrantIndex;
use anchor_store::vector::VectorIndex;
use anchor_types::error::{AnchorError, AnchorResult};

use crate::embedder::{Embedder, HashEmbedder, OpenAiEmbedder};
use crate::kernel::MemoryKernel;
use crate::resolver::ProjectResolver;

fn slot() -> &'static RwLock<Option<Arc<MemoryKernel>>> {
    static SLOT: OnceLock<RwLock<Option<Arc<MemoryKernel>>>> = OnceLock::new();
    SLOT.get_or_init(|| RwLock::new(None))
}

fn init_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

/// The kernel instance, if one has been constructed.
pub fn try_kernel() -> Option<Arc<MemoryKernel>> {
    slot().read().ok().and_then(|guard| guard.clone())
}

/// The process-wide kernel, constructing it with default wiring on first
/// call.
pub fn kernel() -> AnchorResult<Arc<MemoryKernel>> {
    kernel_or_init(build_default)
}

/// The process-wide kernel, constructing it with `init` on first call.
///
/// All callers observe the same instance; `init` runs at most once per
/// successful construction. Construction failure does not poison the slot.
pub fn kernel_or_init<F>(init: F) -> AnchorResult<Arc<MemoryKernel>>
where
    F: FnOnce() -> AnchorResult<MemoryKernel>,
{
    if let Some(existing) = try_kernel() {
        return Ok(existing);
    }

    let _guard = init_lock()
        .lock()
        .map_err(|e| AnchorError::Internal(e.to_string()))?;
    // Re-check: another thread may have finished while we waited.
    if let Some(existing) = try_kernel() {
        return Ok(existing);
    }

    let kernel = Arc::new(init()?);
    let mut guard = slot()
        .write()
        .map_err(|e| AnchorError::Internal(e.to_string()))?;
    *guard = Some(kernel.clone());
    info!("kernel singleton initialized");
    Ok(kernel)
}

/// Drop the singleton so the next call re-initializes. Test builds only.
#[cfg(any(test, feature = "test-util"))]
pub fn reset_kernel() {
    if let Ok(mut guard) = slot().write() {
        *guard = None;
    }
}

/// Default wiring: resolve config, open stores in the configured mode, and
/// pick the embedding driver.
fn build_default() -> AnchorResult<MemoryKernel> {
    let config = ProjectResolver::from_cwd().resolve()?;

    let data_dir = match &config.vector.path {
        Some(path) => PathBuf::from(path)
            .parent()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(".")),
        None => {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home)
                .join(".memory-anchor")
                .join(&config.project_id)
        }
    };

    // URL wins over path when both are set.
    let index: Arc<dyn VectorIndex> = match &config.vector.url {
        Some(url) => Arc::new(QdrantIndex::new(url.clone())?),
        None => {
            let path = config
                .vector
                .path
                .as_ref()
                .map(PathBuf::from)
                .unwrap_or_else(|| data_dir.join("vectors.db"));
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            Arc::new(LocalIndex::open(path)?)
        }
    };

    let metadata = Arc::new(MetadataStore::open(data_dir.join("metadata.db"))?);

    let embedder: Arc<dyn Embedder> = match &config.embedder.url {
        Some(url) => Arc::new(OpenAiEmbedder::new(
            url.clone(),
            config.embedder.model.clone(),
            std::env::var("MA_EMBEDDER_API_KEY").ok(),
            config.vector.dim,
        )?),
        None => Arc::new(HashEmbedder::new(config.vector.dim)),
    };

    MemoryKernel::new(config, index, metadata, embedder)
}
