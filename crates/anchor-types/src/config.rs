//! Effective configuration for the substrate.
//!
//! Every key has explicit semantics; unknown keys in config files are
//! ignored. Budget limits honor `MA_BUDGET_*` environment overrides and the
//! safety filter honors `MA_SAFETY_ENABLED` / `MA_SAFETY_MAX_CHARS`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{AnchorError, AnchorResult};

/// Action a safety rule takes when its detector fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyAction {
    /// Fail the write.
    Block,
    /// Mask the finding in place and proceed.
    Redact,
    /// Proceed unchanged, reporting the finding.
    Warn,
}

/// Vector store selection. `url` wins over `path` when both are set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorConfig {
    /// Server-mode endpoint (Qdrant-compatible REST).
    pub url: Option<String>,
    /// Local-file mode database path.
    pub path: Option<String>,
    /// Expected vector dimension. Must match the embedder.
    pub dim: usize,
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            url: None,
            path: None,
            dim: 384,
        }
    }
}

/// Embedder selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Embedder model identifier.
    pub model: String,
    /// Endpoint for remote embedding drivers.
    pub url: Option<String>,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            model: "all-MiniLM-L6-v2".to_string(),
            url: None,
        }
    }
}

/// Search and retention tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Hard cutoff on similarity, in [0, 1].
    pub min_search_score: f32,
    /// Default TTL for event-log archiving, in hours.
    pub session_expire_hours: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            min_search_score: 0.3,
            session_expire_hours: 72,
        }
    }
}

/// Confidence routing thresholds for `add_memory`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceConfig {
    /// At or above: persist to the active store.
    pub auto_save: f64,
    /// At or above (but below `auto_save`): stage as pending.
    pub pending_min: f64,
}

impl Default for ConfidenceConfig {
    fn default() -> Self {
        Self {
            auto_save: 0.9,
            pending_min: 0.7,
        }
    }
}

/// Identity-schema governance. Approvals are fixed at three; the key exists
/// so config files carry it explicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Required approvals for any L0 change.
    pub approvals_needed: u32,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self { approvals_needed: 3 }
    }
}

/// Per-layer token budgets for query results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// L0 identity schema.
    pub l0: usize,
    /// L1 active context.
    pub l1: usize,
    /// L2 event log.
    pub l2: usize,
    /// L3 verified facts.
    pub l3: usize,
    /// L4 operational knowledge.
    pub l4: usize,
    /// Overall cap across layers.
    pub total: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            l0: 500,
            l1: 200,
            l2: 500,
            l3: 2000,
            l4: 300,
            total: 4000,
        }
    }
}

impl BudgetConfig {
    /// Apply `MA_BUDGET_L0..L4` / `MA_BUDGET_TOTAL` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        fn read(name: &str) -> Option<usize> {
            std::env::var(name).ok().and_then(|v| v.parse().ok())
        }
        if let Some(v) = read("MA_BUDGET_L0") {
            self.l0 = v;
        }
        if let Some(v) = read("MA_BUDGET_L1") {
            self.l1 = v;
        }
        if let Some(v) = read("MA_BUDGET_L2") {
            self.l2 = v;
        }
        if let Some(v) = read("MA_BUDGET_L3") {
            self.l3 = v;
        }
        if let Some(v) = read("MA_BUDGET_L4") {
            self.l4 = v;
        }
        if let Some(v) = read("MA_BUDGET_TOTAL") {
            self.total = v;
        }
        self
    }
}

/// Safety filter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Master toggle.
    pub enabled: bool,
    /// Absolute content length cap, in characters.
    pub max_chars: usize,
    /// Per-detector action map. Keys: `email`, `phone`, `national_id`,
    /// `credit_card`, `ip_address`, `api_key`, `sensitive_word`.
    /// Unrecognized keys are ignored.
    pub rules: BTreeMap<String, SafetyAction>,
    /// Literal sensitive words matched case-insensitively.
    pub sensitive_words: Vec<String>,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("email".to_string(), SafetyAction::Redact);
        rules.insert("phone".to_string(), SafetyAction::Redact);
        rules.insert("national_id".to_string(), SafetyAction::Block);
        rules.insert("credit_card".to_string(), SafetyAction::Block);
        rules.insert("ip_address".to_string(), SafetyAction::Warn);
        rules.insert("api_key".to_string(), SafetyAction::Redact);
        rules.insert("sensitive_word".to_string(), SafetyAction::Warn);
        Self {
            enabled: true,
            max_chars: 2000,
            rules,
            sensitive_words: Vec::new(),
        }
    }
}

impl SafetyConfig {
    /// Apply `MA_SAFETY_ENABLED` / `MA_SAFETY_MAX_CHARS` overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(v) = std::env::var("MA_SAFETY_ENABLED") {
            self.enabled = v.eq_ignore_ascii_case("true") || v == "1";
        }
        if let Some(v) = std::env::var("MA_SAFETY_MAX_CHARS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.max_chars = v;
        }
        self
    }
}

/// Project isolation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IsolationConfig {
    /// When true, search never leaves this project's collection.
    pub strict_mode: bool,
}

/// The full effective configuration snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorConfig {
    /// Active project id; drives the collection name.
    pub project_id: String,
    /// Vector store selection.
    pub vector: VectorConfig,
    /// Embedder selection.
    pub embedder: EmbedderConfig,
    /// Search tuning.
    pub memory: MemoryConfig,
    /// Confidence routing.
    pub confidence: ConfidenceConfig,
    /// L0 governance.
    pub constitution: GovernanceConfig,
    /// Per-layer token budgets.
    pub budget: BudgetConfig,
    /// Safety filter settings.
    pub safety: SafetyConfig,
    /// Project isolation.
    pub isolation: IsolationConfig,
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            project_id: "default".to_string(),
            vector: VectorConfig::default(),
            embedder: EmbedderConfig::default(),
            memory: MemoryConfig::default(),
            confidence: ConfidenceConfig::default(),
            constitution: GovernanceConfig::default(),
            budget: BudgetConfig::default(),
            safety: SafetyConfig::default(),
            isolation: IsolationConfig::default(),
        }
    }
}

impl AnchorConfig {
    /// Parse a TOML document into a config. Unknown keys are dropped.
    pub fn from_toml(contents: &str) -> AnchorResult<Self> {
        toml::from_str(contents)
            .map_err(|e| AnchorError::InvalidArgument(format!("config parse error: {e}")))
    }

    /// Collection name for this project. Stable mapping; existing collections
    /// are never renamed.
    pub fn collection_name(&self) -> String {
        format!("memory_anchor_notes_{}", self.project_id)
    }

    /// Validate the snapshot: score range, thresholds ordered, approvals
    /// pinned at three.
    pub fn validate(&self) -> AnchorResult<()> {
        if !(0.0..=1.0).contains(&self.memory.min_search_score) {
            return Err(AnchorError::InvalidArgument(format!(
                "min_search_score {} outside [0, 1]",
                self.memory.min_search_score
            )));
        }
        if self.confidence.pending_min > self.confidence.auto_save {
            return Err(AnchorError::InvalidArgument(
                "confidence.pending_min must not exceed confidence.auto_save".to_string(),
            ));
        }
        if self.constitution.approvals_needed != 3 {
            return Err(AnchorError::InvalidArgument(
                "constitution.approvals_needed is fixed at 3".to_string(),
            ));
        }
        if self.vector.dim == 0 {
            return Err(AnchorError::InvalidArgument(
                "vector.dim must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = AnchorConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.collection_name(), "memory_anchor_notes_default");
        assert_eq!(cfg.budget.total, 4000);
        assert_eq!(cfg.confidence.auto_save, 0.9);
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let cfg = AnchorConfig::from_toml(
            r#"
            project_id = "garden"
            some_future_key = true

            [memory]
            min_search_score = 0.5
            another_unknown = "x"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.project_id, "garden");
        assert_eq!(cfg.memory.min_search_score, 0.5);
        assert_eq!(cfg.collection_name(), "memory_anchor_notes_garden");
    }

    #[test]
    fn test_approvals_pinned() {
        let cfg = AnchorConfig::from_toml("[constitution]\napprovals_needed = 2\n").unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_threshold_ordering_checked() {
        let cfg = AnchorConfig::from_toml(
            "[confidence]\nauto_save = 0.6\npending_min = 0.8\n",
        )
        .unwrap();
        assert!(cfg.validate().is_err());
    }
}
