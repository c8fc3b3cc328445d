// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Business record and artifact data structures.
//!
//! A [`BusinessRecord`] is the structured unit that the orchestrator keeps
//! durable across backends. An [`Artifact`] is a binary rendering of one
//! record revision (for example a PDF) that is replicated, never partitioned,
//! across the artifact backends.
//!
//! # Example
//!
//! ```
//! use multistore_sync::{BusinessRecord, LineItem};
//!
//! let mut record = BusinessRecord::new("X-001");
//! record.general.client = Some("Acme Ltd".into());
//! record.line_items.push(LineItem::new("Install", 2.0, 150.0));
//! record.conditions.insert("payment".into(), "30 days".into());
//!
//! assert_eq!(record.revision, 1);
//! assert_eq!(record.line_items[0].total(), 300.0);
//! ```

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Schema tag written into every record.
pub const SCHEMA_VERSION: &str = "2";

/// General attributes of a record.
///
/// Known fields are typed; `extra` holds only genuinely open-ended attributes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Open-ended attributes with no fixed schema
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

/// One ordered line of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub description: String,
    pub quantity: f64,
    pub unit_price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
}

impl LineItem {
    pub fn new(description: impl Into<String>, quantity: f64, unit_price: f64) -> Self {
        Self {
            code: None,
            description: description.into(),
            quantity,
            unit_price,
            unit: None,
        }
    }

    #[must_use]
    pub fn total(&self) -> f64 {
        self.quantity * self.unit_price
    }
}

/// A structured business record identified by an immutable business key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusinessRecord {
    /// Globally unique business key (supplied by the key-numbering service)
    pub key: String,
    #[serde(default)]
    pub general: GeneralInfo,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
    #[serde(default)]
    pub conditions: BTreeMap<String, String>,
    /// Monotonic per key lineage
    pub revision: u64,
    /// Strictly increasing per write to the same key; arbitrates conflicts
    pub last_modified: DateTime<Utc>,
    pub schema_version: String,
}

impl BusinessRecord {
    /// Create an empty record at revision 1.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            general: GeneralInfo::default(),
            line_items: Vec::new(),
            conditions: BTreeMap::new(),
            revision: 1,
            last_modified: Utc::now(),
            schema_version: SCHEMA_VERSION.to_string(),
        }
    }

    /// Sum of all line totals.
    #[must_use]
    pub fn total(&self) -> f64 {
        self.line_items.iter().map(LineItem::total).sum()
    }

    /// Serialize to the canonical byte form stored on durable backends.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Flattened text used for search relevance scoring.
    #[must_use]
    pub fn search_text(&self) -> String {
        let mut parts: Vec<String> = vec![self.key.clone()];
        let g = &self.general;
        for field in [&g.client, &g.contact, &g.project, &g.currency, &g.notes]
            .into_iter()
            .flatten()
        {
            parts.push(field.clone());
        }
        for value in g.extra.values() {
            match value {
                Value::String(s) => parts.push(s.clone()),
                other => parts.push(other.to_string()),
            }
        }
        for line in &self.line_items {
            parts.push(line.description.clone());
            if let Some(code) = &line.code {
                parts.push(code.clone());
            }
        }
        parts.extend(self.conditions.values().cloned());
        parts.join(" ").to_lowercase()
    }
}

/// Binary output tied 1:1 to a record revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub record_key: String,
    pub revision: u64,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Artifact {
    pub fn new(record_key: impl Into<String>, revision: u64, bytes: Vec<u8>) -> Self {
        Self {
            record_key: record_key.into(),
            revision,
            content_type: "application/pdf".to_string(),
            bytes,
        }
    }

    /// Storage key shared by every artifact backend.
    #[must_use]
    pub fn storage_key(&self) -> String {
        artifact_key(&self.record_key, self.revision)
    }
}

/// Build the artifact storage key for a record revision.
#[must_use]
pub fn artifact_key(record_key: &str, revision: u64) -> String {
    format!("{record_key}@r{revision}")
}

/// SHA-256 of a payload, hex encoded.
#[must_use]
pub fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Checksum over (business key + payload), the operation dedup key.
#[must_use]
pub fn intent_checksum(key: &str, bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hasher.update([0u8]);
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Top-level and nested field paths whose values differ between two records.
///
/// Paths are dotted (`general.project`, `conditions.payment`), sorted.
#[must_use]
pub fn diverging_fields(left: &Value, right: &Value) -> Vec<String> {
    let mut out = Vec::new();
    diff_values("", left, right, &mut out);
    out.sort();
    out
}

fn diff_values(path: &str, left: &Value, right: &Value, out: &mut Vec<String>) {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => {
            let mut keys: Vec<&String> = l.keys().chain(r.keys()).collect();
            keys.sort();
            keys.dedup();
            for k in keys {
                // last_modified always differs between versions and is the arbiter
                if path.is_empty() && k == "last_modified" {
                    continue;
                }
                let child = if path.is_empty() { k.clone() } else { format!("{path}.{k}") };
                match (l.get(k), r.get(k)) {
                    (Some(a), Some(b)) => diff_values(&child, a, b, out),
                    _ => out.push(child),
                }
            }
        }
        (a, b) if a != b => out.push(if path.is_empty() { "$".to_string() } else { path.to_string() }),
        _ => {}
    }
}

/// Serde adapter storing byte payloads as hex strings in JSON snapshots.
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_record_defaults() {
        let record = BusinessRecord::new("Q-100");
        assert_eq!(record.key, "Q-100");
        assert_eq!(record.revision, 1);
        assert_eq!(record.schema_version, SCHEMA_VERSION);
        assert!(record.line_items.is_empty());
    }

    #[test]
    fn test_bytes_roundtrip_preserves_line_order() {
        let mut record = BusinessRecord::new("Q-101");
        record.line_items.push(LineItem::new("first", 1.0, 10.0));
        record.line_items.push(LineItem::new("second", 3.0, 5.0));

        let bytes = record.to_bytes().unwrap();
        let back = BusinessRecord::from_bytes(&bytes).unwrap();

        assert_eq!(back, record);
        assert_eq!(back.line_items[1].description, "second");
        assert_eq!(back.total(), 25.0);
    }

    #[test]
    fn test_extra_bag_is_omitted_when_empty() {
        let record = BusinessRecord::new("Q-102");
        let text = serde_json::to_string(&record).unwrap();
        assert!(!text.contains("extra"));
    }

    #[test]
    fn test_checksum_is_stable_and_key_sensitive() {
        assert_eq!(checksum(b"abc"), checksum(b"abc"));
        assert_ne!(intent_checksum("A", b"x"), intent_checksum("B", b"x"));
        assert_eq!(checksum(b"").len(), 64);
    }

    #[test]
    fn test_diverging_fields_reports_nested_paths() {
        let left = json!({"key": "Y-002", "general": {"project": "north"}, "revision": 1,
                          "last_modified": "2026-01-01T00:00:00Z"});
        let right = json!({"key": "Y-002", "general": {"project": "south"}, "revision": 1,
                           "last_modified": "2026-01-02T00:00:00Z"});
        assert_eq!(diverging_fields(&left, &right), vec!["general.project".to_string()]);
    }

    #[test]
    fn test_diverging_fields_missing_key() {
        let left = json!({"conditions": {"payment": "30 days"}});
        let right = json!({"conditions": {}});
        assert_eq!(diverging_fields(&left, &right), vec!["conditions.payment".to_string()]);
    }

    #[test]
    fn test_artifact_key_format() {
        let artifact = Artifact::new("X-001", 3, vec![1, 2, 3]);
        assert_eq!(artifact.storage_key(), "X-001@r3");
        assert_eq!(artifact_key("X-001", 3), artifact.storage_key());
    }

    #[test]
    fn test_search_text_includes_lines_and_conditions() {
        let mut record = BusinessRecord::new("Q-103");
        record.general.project = Some("Harbour Bridge".into());
        record.line_items.push(LineItem::new("Steel beams", 1.0, 1.0));
        record.conditions.insert("delivery".into(), "On site".into());
        let text = record.search_text();
        assert!(text.contains("harbour bridge"));
        assert!(text.contains("steel beams"));
        assert!(text.contains("on site"));
    }
}
