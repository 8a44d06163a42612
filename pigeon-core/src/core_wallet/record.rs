//! Storage records and tag queries

use super::errors::{WalletError, WalletResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

pub type Tags = BTreeMap<String, String>;

/// Reserved tag carrying the owning tenant when tenants share a backend
pub const TENANT_TAG: &str = "~tenant_id";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRecord {
    #[serde(rename = "type")]
    pub record_type: String,
    pub id: String,
    /// JSON encoded payload
    pub value: String,
    #[serde(default)]
    pub tags: Tags,
}

impl StorageRecord {
    pub fn new(record_type: impl Into<String>, id: impl Into<String>, value: impl Into<String>) -> Self {
        Self { record_type: record_type.into(), id: id.into(), value: value.into(), tags: Tags::new() }
    }

    /// Record with a serialized `value`
    pub fn from_value<T: Serialize>(
        record_type: impl Into<String>,
        id: impl Into<String>,
        value: &T,
    ) -> WalletResult<Self> {
        Ok(Self::new(record_type, id, serde_json::to_string(value)?))
    }

    pub fn with_tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(name.into(), value.into());
        self
    }

    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }

    pub fn value_as<T: DeserializeOwned>(&self) -> WalletResult<T> {
        serde_json::from_str(&self.value).map_err(|e| {
            WalletError::Serialization(format!("{}/{}: {}", self.record_type, self.id, e))
        })
    }
}

/// Predicate over record tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagFilter {
    All,
    Eq(String, String),
    Prefix(String, String),
    And(Vec<TagFilter>),
}

impl TagFilter {
    pub fn eq(name: impl Into<String>, value: impl Into<String>) -> Self {
        TagFilter::Eq(name.into(), value.into())
    }

    pub fn prefix(name: impl Into<String>, prefix: impl Into<String>) -> Self {
        TagFilter::Prefix(name.into(), prefix.into())
    }

    /// Conjunction, flattening nested `And`s and dropping `All`
    pub fn and(self, other: TagFilter) -> Self {
        let mut parts = Vec::new();
        for filter in [self, other] {
            match filter {
                TagFilter::All => {}
                TagFilter::And(inner) => parts.extend(inner),
                single => parts.push(single),
            }
        }
        match parts.len() {
            0 => TagFilter::All,
            1 => parts.remove(0),
            _ => TagFilter::And(parts),
        }
    }

    pub fn matches(&self, tags: &Tags) -> bool {
        match self {
            TagFilter::All => true,
            TagFilter::Eq(name, value) => tags.get(name) == Some(value),
            TagFilter::Prefix(name, prefix) => {
                tags.get(name).is_some_and(|v| v.starts_with(prefix.as_str()))
            }
            TagFilter::And(parts) => parts.iter().all(|p| p.matches(tags)),
        }
    }

    /// Every (tag, operand) pair the filter constrains
    pub fn constraints(&self) -> Vec<(&str, &str)> {
        match self {
            TagFilter::All => Vec::new(),
            TagFilter::Eq(name, value) | TagFilter::Prefix(name, value) => {
                vec![(name.as_str(), value.as_str())]
            }
            TagFilter::And(parts) => parts.iter().flat_map(TagFilter::constraints).collect(),
        }
    }
}

/// One write in an atomic batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Fails the batch if the record exists
    Insert(StorageRecord),
    /// Fails the batch if the record is missing
    Replace(StorageRecord),
    /// Insert or replace
    Upsert(StorageRecord),
    Delete { record_type: String, id: String },
}

impl WriteOp {
    pub fn record_type(&self) -> &str {
        match self {
            WriteOp::Insert(r) | WriteOp::Replace(r) | WriteOp::Upsert(r) => &r.record_type,
            WriteOp::Delete { record_type, .. } => record_type,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Insert(r) | WriteOp::Replace(r) | WriteOp::Upsert(r) => &r.id,
            WriteOp::Delete { id, .. } => id,
        }
    }

    pub(crate) fn record_mut(&mut self) -> Option<&mut StorageRecord> {
        match self {
            WriteOp::Insert(r) | WriteOp::Replace(r) | WriteOp::Upsert(r) => Some(r),
            WriteOp::Delete { .. } => None,
        }
    }
}

/// Milliseconds since the Unix epoch
pub fn current_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(pairs: &[(&str, &str)]) -> Tags {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_filter_matching() {
        let t = tags(&[("state", "request-sent"), ("role", "holder")]);

        assert!(TagFilter::All.matches(&t));
        assert!(TagFilter::eq("state", "request-sent").matches(&t));
        assert!(!TagFilter::eq("state", "done").matches(&t));
        assert!(TagFilter::prefix("state", "request").matches(&t));
        assert!(!TagFilter::prefix("missing", "").matches(&t));
        assert!(TagFilter::eq("role", "holder").and(TagFilter::prefix("state", "req")).matches(&t));
        assert!(!TagFilter::eq("role", "issuer").and(TagFilter::All).matches(&t));
    }

    #[test]
    fn test_and_flattens() {
        let filter = TagFilter::All
            .and(TagFilter::eq("a", "1"))
            .and(TagFilter::eq("b", "2"))
            .and(TagFilter::eq("c", "3"));
        assert_eq!(filter.constraints(), vec![("a", "1"), ("b", "2"), ("c", "3")]);
        assert!(matches!(filter, TagFilter::And(ref parts) if parts.len() == 3));
        assert_eq!(TagFilter::All.and(TagFilter::All), TagFilter::All);
    }

    #[test]
    fn test_value_round_trip() {
        #[derive(Serialize, Deserialize, PartialEq, Debug)]
        struct Payload {
            label: String,
        }
        let record =
            StorageRecord::from_value("connection", "c1", &Payload { label: "bob".into() }).unwrap();
        assert_eq!(record.value_as::<Payload>().unwrap().label, "bob");

        let bad = StorageRecord::new("connection", "c2", "{");
        assert!(matches!(bad.value_as::<Payload>(), Err(WalletError::Serialization(_))));
    }
}
