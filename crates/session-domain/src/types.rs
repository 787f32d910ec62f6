//! Shared primitives: dynamic metadata values, ids, and persisted metadata keys.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a new time-sortable opaque id (UUIDv7) for primary keys.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Identifies which agent owns a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub String);

impl AgentId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A dynamic, JSON-compatible value for session/message `metadata` maps.
///
/// Implemented as a tagged sum rather than `serde_json::Value` directly so
/// that callers get exhaustive matching over the documented shapes. Every
/// variant round-trips losslessly through `serde_json::Value`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

/// Convert a decoded `Value` tree to `serde_json::Value` for storage in a
/// JSON column or JSONL record.
impl From<&Value> for serde_json::Value {
    fn from(v: &Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::List(l) => serde_json::Value::Array(l.iter().map(Into::into).collect()),
            Value::Map(m) => {
                serde_json::Value::Object(m.iter().map(|(k, v)| (k.clone(), v.into())).collect())
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(a) => Value::List(a.into_iter().map(Into::into).collect()),
            serde_json::Value::Object(o) => {
                Value::Map(o.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

/// A metadata map, deep-cloned on every read and write per the store's
/// immutability contract (spec §9 "Dynamic values in metadata").
pub type Metadata = BTreeMap<String, Value>;

/// Persisted metadata key constants (spec §6).
pub mod meta_keys {
    pub const PARENT_SESSION_KEY: &str = "parent_session_key";
    pub const CHILD_SESSION_KEYS: &str = "child_session_keys";
    pub const HANDOFF_DEPTH: &str = "handoff_depth";
    pub const ORIGINAL_AGENT_ID: &str = "original_agent_id";
    pub const COMPACTION_INFO: &str = "compaction_info";
    pub const LAST_COMPACTED_AT: &str = "last_compacted_at";
    pub const MESSAGE_COUNT_PRE_COMPACTION: &str = "message_count_pre_compaction";
    pub const IMPORTANT: &str = "important";
    pub const MARKED_IMPORTANT_AT: &str = "marked_important_at";
    pub const PRIORITY: &str = "priority";
    pub const SYNTHETIC: &str = "synthetic";
    pub const TOOL_NAME: &str = "tool_name";
    pub const COMPACTION_SUMMARY: &str = "compaction_summary";
    pub const SUMMARIZED_COUNT: &str = "summarized_count";
    pub const SUMMARIZED_AT: &str = "summarized_at";
    pub const ADAPTIVE_RATIO: &str = "adaptive_ratio";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_json_roundtrip() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert(
            "b".to_string(),
            Value::List(vec![Value::Str("x".into()), Value::Null]),
        );
        let v = Value::Map(map);
        let json: serde_json::Value = (&v).into();
        let back: Value = json.into();
        assert_eq!(v, back);
    }

    #[test]
    fn new_id_is_unique() {
        assert_ne!(new_id(), new_id());
    }
}
