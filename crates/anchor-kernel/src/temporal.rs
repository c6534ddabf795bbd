//! Bi-temporal query construction.
//!
//! Translates time-aware predicates into the payload filter DSL. The
//! rendered conditions use is-null predicates on `valid_at` / `expires_at`,
//! which the write path guarantees are always materialized in payloads.

use chrono::{DateTime, Utc};

use anchor_store::filter::{Condition, PayloadFilter};
use anchor_store::payload::keys;

/// A time window over the bi-temporal axes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TemporalQuery {
    /// Point-in-time query: effective at `t`.
    as_of: Option<DateTime<Utc>>,
    /// Range query bounds on validity.
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
    /// When true, the expiry half of the predicate is dropped.
    include_expired: bool,
}

impl TemporalQuery {
    /// Memories effective at time `t`: `valid_at <= t OR valid_at IS NULL`,
    /// and not yet expired at `t`.
    pub fn as_of(t: DateTime<Utc>) -> Self {
        Self {
            as_of: Some(t),
            ..Self::default()
        }
    }

    /// Memories whose validity intersects `[start, end)`:
    /// `valid_at <= end AND (expires_at IS NULL OR expires_at > start)`.
    pub fn in_range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
            ..Self::default()
        }
    }

    /// Shorthand for `as_of(now)`.
    pub fn only_valid() -> Self {
        Self::as_of(Utc::now())
    }

    /// Drop (or restore) the expiry predicate.
    pub fn include_expired(mut self, flag: bool) -> Self {
        self.include_expired = flag;
        self
    }

    /// Append this query's conditions onto a payload filter.
    pub fn apply(&self, mut filter: PayloadFilter) -> PayloadFilter {
        if let Some(t) = self.as_of {
            let ts = t.timestamp() as f64;
            // Effective: valid_at IS NULL (immediate) OR valid_at <= t.
            filter = filter.and(Condition::Or(vec![
                Condition::is_null(keys::VALID_AT),
                Condition::lte(keys::VALID_AT, ts),
            ]));
            if !self.include_expired {
                // Unexpired: expires_at IS NULL (permanent) OR expires_at > t.
                filter = filter.and(Condition::Or(vec![
                    Condition::is_null(keys::EXPIRES_AT),
                    Condition::gt(keys::EXPIRES_AT, ts),
                ]));
            }
        } else if self.start.is_some() || self.end.is_some() {
            if let Some(end) = self.end {
                filter = filter.and(Condition::Or(vec![
                    Condition::is_null(keys::VALID_AT),
                    Condition::lte(keys::VALID_AT, end.timestamp() as f64),
                ]));
            }
            if !self.include_expired {
                if let Some(start) = self.start {
                    filter = filter.and(Condition::Or(vec![
                        Condition::is_null(keys::EXPIRES_AT),
                        Condition::gt(keys::EXPIRES_AT, start.timestamp() as f64),
                    ]));
                }
            }
        } else if !self.include_expired {
            // No time point or range: still exclude already-expired records.
            let now = Utc::now().timestamp() as f64;
            filter = filter.and(Condition::Or(vec![
                Condition::is_null(keys::EXPIRES_AT),
                Condition::gt(keys::EXPIRES_AT, now),
            ]));
        }
        filter
    }
}
