//! Context budget management.
//!
//! Enforces per-layer token budgets on search results so returned context
//! never exceeds the configured cap. Tokens are estimated at a fixed ratio
//! (4 chars per token), monotonic and deterministic. CPU-bound.

use tracing::debug;

use anchor_types::config::BudgetConfig;
use anchor_types::note::{MemoryLayer, SearchHit};

/// Chars-per-token estimate, tuned for mixed prose.
const CHARS_PER_TOKEN: usize = 4;

/// Flat per-record overhead for layer/category/timestamp metadata.
const METADATA_OVERHEAD_TOKENS: usize = 20;

/// Estimate tokens for a piece of content. Never returns 0 for non-empty
/// input.
pub fn estimate_tokens(content: &str) -> usize {
    if content.is_empty() {
        return 0;
    }
    (content.chars().count() / CHARS_PER_TOKEN).max(1)
}

fn hit_tokens(hit: &SearchHit) -> usize {
    estimate_tokens(&hit.note.content) + METADATA_OVERHEAD_TOKENS
}

/// Outcome of a truncation pass, for observability.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BudgetReport {
    /// Tokens allocated across all returned records.
    pub allocated: usize,
    /// Whole records dropped to stay under budget.
    pub dropped: usize,
}

/// Applies the layered truncation policy.
pub struct BudgetManager {
    config: BudgetConfig,
}

impl BudgetManager {
    /// Build from config.
    pub fn new(config: BudgetConfig) -> Self {
        Self { config }
    }

    fn layer_limit(&self, layer: MemoryLayer) -> usize {
        match layer {
            MemoryLayer::IdentitySchema => self.config.l0,
            MemoryLayer::ActiveContext => self.config.l1,
            MemoryLayer::EventLog => self.config.l2,
            MemoryLayer::VerifiedFact => self.config.l3,
            MemoryLayer::OperationalKnowledge => self.config.l4,
        }
    }

    /// Packing order across layers: identity first, then facts, events,
    /// operational knowledge, and working context last.
    fn packing_order() -> [MemoryLayer; 5] {
        [
            MemoryLayer::IdentitySchema,
            MemoryLayer::VerifiedFact,
            MemoryLayer::EventLog,
            MemoryLayer::OperationalKnowledge,
            MemoryLayer::ActiveContext,
        ]
    }

    /// Truncate a mixed result list to the per-layer and total budgets.
    ///
    /// Per layer: sort by `(score desc, created_at desc)` and accumulate
    /// whole records until the next one would overflow the layer budget.
    /// Layers pack in L0, L3, L2, L4, L1 order against the total cap.
    /// Records are never split.
    pub fn truncate(&self, hits: Vec<SearchHit>) -> (Vec<SearchHit>, BudgetReport) {
        let mut report = BudgetReport::default();
        let mut kept: Vec<SearchHit> = Vec::with_capacity(hits.len());

        let mut by_layer: Vec<(MemoryLayer, Vec<SearchHit>)> = Self::packing_order()
            .into_iter()
            .map(|layer| (layer, Vec::new()))
            .collect();
        for hit in hits {
            if let Some((_, bucket)) = by_layer.iter_mut().find(|(l, _)| *l == hit.note.layer) {
                bucket.push(hit);
            }
        }

        let mut total_used = 0usize;
        for (layer, mut bucket) in by_layer {
            bucket.sort_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.note.created_at.cmp(&a.note.created_at))
            });

            let layer_limit = self.layer_limit(layer);
            let mut layer_used = 0usize;
            for hit in bucket {
                let tokens = hit_tokens(&hit);
                if layer_used + tokens > layer_limit || total_used + tokens > self.config.total {
                    report.dropped += 1;
                    continue;
                }
                layer_used += tokens;
                total_used += tokens;
                kept.push(hit);
            }
        }

        report.allocated = total_used;
        if report.dropped > 0 {
            debug!(
                dropped = report.dropped,
                allocated = report.allocated,
                "budget truncation dropped records"
            );
        }
        (kept, report)
    }
}
