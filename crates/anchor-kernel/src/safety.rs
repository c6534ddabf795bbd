//! Content safety filter.
//!
//! Inspects content before persistence and applies per-detector actions:
//! block the write, redact the finding in place, or warn alongside a
//! successful write. CPU-bound; performs no I/O.

use regex::Regex;
use tracing::debug;

use anchor_types::config::{SafetyAction, SafetyConfig};
use anchor_types::error::{AnchorError, AnchorResult};

/// What a detector found, by kind and byte span in the original content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    /// Detector kind: `email`, `phone`, `national_id`, `credit_card`,
    /// `ip_address`, `api_key`, `sensitive_word`, `length`.
    pub kind: String,
    /// Byte span in the original content.
    pub span: (usize, usize),
}

/// Result of filtering one piece of content.
#[derive(Debug, Clone)]
pub struct FilterOutcome {
    /// The strongest action any detector requested.
    pub action: SafetyAction,
    /// Content with redactions applied. Unchanged when nothing redacted.
    pub sanitized: String,
    /// Everything the detectors flagged.
    pub findings: Vec<Finding>,
}

impl FilterOutcome {
    fn clean(content: &str) -> Self {
        Self {
            action: SafetyAction::Warn,
            sanitized: content.to_string(),
            findings: Vec::new(),
        }
    }

    /// Whether the write must fail.
    pub fn is_blocked(&self) -> bool {
        self.action == SafetyAction::Block && !self.findings.is_empty()
    }
}

const REDACT_PLACEHOLDER: &str = "[REDACTED]";

/// Rule-based safety filter with per-kind configurable actions.
pub struct SafetyFilter {
    config: SafetyConfig,
    detectors: Vec<(String, Regex)>,
}

impl SafetyFilter {
    /// Build the filter from config. Detector patterns compile once here.
    pub fn new(config: SafetyConfig) -> Self {
        let detectors = vec![
            (
                "email".to_string(),
                Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap(),
            ),
            (
                "phone".to_string(),
                Regex::new(r"\b(?:\(\d{3}\)\s?|\d{3}[-.])\d{3}[-.]?\d{4}\b|\b1[3-9]\d{9}\b")
                    .unwrap(),
            ),
            (
                "national_id".to_string(),
                Regex::new(r"\b[1-9]\d{5}(?:19|20)\d{2}(?:0[1-9]|1[0-2])(?:0[1-9]|[12]\d|3[01])\d{3}[\dXx]\b")
                    .unwrap(),
            ),
            (
                "credit_card".to_string(),
                Regex::new(r"\b(?:\d{4}[-\s]?){3}\d{4}\b").unwrap(),
            ),
            (
                "ip_address".to_string(),
                Regex::new(r"\b(?:(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\.){3}(?:25[0-5]|2[0-4]\d|[01]?\d?\d)\b")
                    .unwrap(),
            ),
            (
                "api_key".to_string(),
                Regex::new(r"(?i)\b(?:sk-|api[_-]|key[_-]|secret[_-]|token[_-]|auth[_-])[A-Za-z0-9_-]{20,}\b")
                    .unwrap(),
            ),
        ];
        Self { config, detectors }
    }

    /// Add a sensitive word at runtime.
    pub fn add_sensitive_word(&mut self, word: impl Into<String>) {
        self.config.sensitive_words.push(word.into());
    }

    /// Check content. Returns the outcome; callers enforce `is_blocked` by
    /// failing the write with `PolicyViolation`.
    pub fn check(&self, content: &str) -> AnchorResult<FilterOutcome> {
        if !self.config.enabled {
            return Ok(FilterOutcome::clean(content));
        }

        let mut findings = Vec::new();
        let mut strongest = SafetyAction::Warn;

        // Length cap always blocks; a redaction cannot shrink arbitrary text.
        if content.chars().count() > self.config.max_chars {
            findings.push(Finding {
                kind: "length".to_string(),
                span: (0, content.len()),
            });
            return Ok(FilterOutcome {
                action: SafetyAction::Block,
                sanitized: content.to_string(),
                findings,
            });
        }

        // Pattern detectors, in declaration order. Redactions are collected
        // as spans first and applied back-to-front so earlier spans stay
        // valid.
        let mut redact_spans: Vec<(usize, usize)> = Vec::new();
        for (kind, pattern) in &self.detectors {
            let Some(action) = self.config.rules.get(kind).copied() else {
                continue;
            };
            for m in pattern.find_iter(content) {
                findings.push(Finding {
                    kind: kind.clone(),
                    span: (m.start(), m.end()),
                });
                match action {
                    SafetyAction::Block => strongest = SafetyAction::Block,
                    SafetyAction::Redact => {
                        redact_spans.push((m.start(), m.end()));
                        if strongest != SafetyAction::Block {
                            strongest = SafetyAction::Redact;
                        }
                    }
                    SafetyAction::Warn => {}
                }
            }
        }

        // Literal sensitive words, case-insensitive. Matching runs on the
        // original string so spans stay valid for redaction.
        if let Some(action) = self.config.rules.get("sensitive_word").copied() {
            for word in &self.config.sensitive_words {
                if word.is_empty() {
                    continue;
                }
                let Ok(pattern) = Regex::new(&format!("(?i){}", regex::escape(word))) else {
                    continue;
                };
                for m in pattern.find_iter(content) {
                    findings.push(Finding {
                        kind: "sensitive_word".to_string(),
                        span: (m.start(), m.end()),
                    });
                    match action {
                        SafetyAction::Block => strongest = SafetyAction::Block,
                        SafetyAction::Redact => {
                            redact_spans.push((m.start(), m.end()));
                            if strongest != SafetyAction::Block {
                                strongest = SafetyAction::Redact;
                            }
                        }
                        SafetyAction::Warn => {}
                    }
                }
            }
        }

        if strongest == SafetyAction::Block {
            debug!(findings = findings.len(), "content blocked by safety filter");
            return Ok(FilterOutcome {
                action: SafetyAction::Block,
                sanitized: content.to_string(),
                findings,
            });
        }

        // Coalesce overlapping spans (detectors can match the same bytes)
        // and redact back-to-front so earlier offsets stay valid.
        let mut sanitized = content.to_string();
        redact_spans.sort();
        let mut merged: Vec<(usize, usize)> = Vec::new();
        for (start, end) in redact_spans {
            match merged.last_mut() {
                Some((_, last_end)) if start <= *last_end => *last_end = (*last_end).max(end),
                _ => merged.push((start, end)),
            }
        }
        for (start, end) in merged.into_iter().rev() {
            sanitized.replace_range(start..end, REDACT_PLACEHOLDER);
        }

        if sanitized.is_empty() {
            return Err(AnchorError::InvalidArgument(
                "content empty after filtering".to_string(),
            ));
        }

        Ok(FilterOutcome {
            action: strongest,
            sanitized,
            findings,
        })
    }
}
