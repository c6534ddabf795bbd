//! Payload filter DSL shared by both vector-store modes.
//!
//! A filter is a conjunction of conditions; disjunction is expressed with
//! [`Condition::Or`]. The embedded backend evaluates filters in-process;
//! the server backend renders them into Qdrant REST filter JSON.

use serde_json::{json, Map, Value};

/// One predicate over a payload key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Exact match on a payload value.
    Eq { key: String, value: Value },
    /// Numeric range. Bounds are optional; set the ones you need.
    Range {
        key: String,
        gt: Option<f64>,
        gte: Option<f64>,
        lt: Option<f64>,
        lte: Option<f64>,
    },
    /// Matches when the payload value is an explicit null. Key absence does
    /// not match; the write path always materializes temporal keys.
    IsNull { key: String },
    /// Disjunction of sub-conditions.
    Or(Vec<Condition>),
}

impl Condition {
    /// Equality shorthand.
    pub fn eq(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            key: key.into(),
            value: value.into(),
        }
    }

    /// `key <= bound`.
    pub fn lte(key: impl Into<String>, bound: f64) -> Self {
        Self::Range {
            key: key.into(),
            gt: None,
            gte: None,
            lt: None,
            lte: Some(bound),
        }
    }

    /// `key > bound`.
    pub fn gt(key: impl Into<String>, bound: f64) -> Self {
        Self::Range {
            key: key.into(),
            gt: Some(bound),
            gte: None,
            lt: None,
            lte: None,
        }
    }

    /// Is-null shorthand.
    pub fn is_null(key: impl Into<String>) -> Self {
        Self::IsNull { key: key.into() }
    }

    /// Evaluate against a payload map.
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        match self {
            Self::Eq { key, value } => payload.get(key) == Some(value),
            Self::Range { key, gt, gte, lt, lte } => {
                let Some(actual) = payload.get(key).and_then(Value::as_f64) else {
                    return false;
                };
                if let Some(b) = gt {
                    if actual <= *b {
                        return false;
                    }
                }
                if let Some(b) = gte {
                    if actual < *b {
                        return false;
                    }
                }
                if let Some(b) = lt {
                    if actual >= *b {
                        return false;
                    }
                }
                if let Some(b) = lte {
                    if actual > *b {
                        return false;
                    }
                }
                true
            }
            Self::IsNull { key } => matches!(payload.get(key), Some(Value::Null)),
            Self::Or(subs) => subs.iter().any(|c| c.matches(payload)),
        }
    }

    /// Render into a Qdrant REST condition object.
    pub fn to_qdrant_json(&self) -> Value {
        match self {
            Self::Eq { key, value } => json!({ "key": key, "match": { "value": value } }),
            Self::Range { key, gt, gte, lt, lte } => {
                let mut range = Map::new();
                if let Some(b) = gt {
                    range.insert("gt".into(), json!(b));
                }
                if let Some(b) = gte {
                    range.insert("gte".into(), json!(b));
                }
                if let Some(b) = lt {
                    range.insert("lt".into(), json!(b));
                }
                if let Some(b) = lte {
                    range.insert("lte".into(), json!(b));
                }
                json!({ "key": key, "range": range })
            }
            Self::IsNull { key } => json!({ "is_null": { "key": key } }),
            Self::Or(subs) => {
                let should: Vec<Value> = subs.iter().map(Condition::to_qdrant_json).collect();
                json!({ "should": should })
            }
        }
    }
}

/// Conjunction of conditions. Empty means match-all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PayloadFilter {
    /// All conditions must hold.
    pub must: Vec<Condition>,
}

impl PayloadFilter {
    /// Match-all filter.
    pub fn all() -> Self {
        Self::default()
    }

    /// Append a condition.
    pub fn and(mut self, condition: Condition) -> Self {
        self.must.push(condition);
        self
    }

    /// Evaluate against a payload map.
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        self.must.iter().all(|c| c.matches(payload))
    }

    /// Render into a Qdrant REST filter object, or None when match-all.
    pub fn to_qdrant_json(&self) -> Option<Value> {
        if self.must.is_empty() {
            return None;
        }
        let must: Vec<Value> = self.must.iter().map(Condition::to_qdrant_json).collect();
        Some(json!({ "must": must }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_eq_and_range() {
        let p = payload(&[("layer", json!("verified_fact")), ("confidence", json!(0.95))]);
        let f = PayloadFilter::all()
            .and(Condition::eq("layer", "verified_fact"))
            .and(Condition::gt("confidence", 0.9));
        assert!(f.matches(&p));

        let f = PayloadFilter::all().and(Condition::gt("confidence", 0.95));
        assert!(!f.matches(&p));
    }

    #[test]
    fn test_is_null_requires_explicit_null() {
        let with_null = payload(&[("expires_at", Value::Null)]);
        let with_value = payload(&[("expires_at", json!(1700000000))]);
        let absent = payload(&[]);

        let c = Condition::is_null("expires_at");
        assert!(c.matches(&with_null));
        assert!(!c.matches(&with_value));
        assert!(!c.matches(&absent));
    }

    #[test]
    fn test_or_of_null_and_range() {
        // The as-of shape: expired_at is null OR expires_at > t.
        let c = Condition::Or(vec![
            Condition::is_null("expires_at"),
            Condition::gt("expires_at", 100.0),
        ]);
        assert!(c.matches(&payload(&[("expires_at", Value::Null)])));
        assert!(c.matches(&payload(&[("expires_at", json!(200))])));
        assert!(!c.matches(&payload(&[("expires_at", json!(50))])));
    }

    #[test]
    fn test_qdrant_rendering() {
        let f = PayloadFilter::all()
            .and(Condition::eq("layer", "event_log"))
            .and(Condition::Or(vec![
                Condition::is_null("expires_at"),
                Condition::gt("expires_at", 10.0),
            ]));
        let v = f.to_qdrant_json().unwrap();
        assert_eq!(v["must"][0]["key"], "layer");
        assert_eq!(v["must"][1]["should"][0]["is_null"]["key"], "expires_at");
        assert!(PayloadFilter::all().to_qdrant_json().is_none());
    }
}
