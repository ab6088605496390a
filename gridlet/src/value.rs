//! In-memory currency for materialized objects.
//!
//! Every value that crosses a task boundary is a `RuntimeValue` behind an
//! `Arc`. The tracker keys its bookkeeping on the `Arc` pointer, so container
//! variants hold `Arc`'d elements and can be synchronized element-wise.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// A materialized value handled by the executor, tracker, and cache.
///
/// `NullResult` is the marker returned by synchronization when the producing
/// task was skipped or cancelled and never materialized its output. It is
/// distinct from `Null` so callers can tell "the task returned nothing" from
/// "the task never ran".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum RuntimeValue {
    Null,
    NullResult,
    Bool(bool),
    Int(i32),
    Long(i64),
    Double(f64),
    Str(String),
    List(Vec<Arc<RuntimeValue>>),
    Map(BTreeMap<String, Arc<RuntimeValue>>),
}

impl RuntimeValue {
    /// Ordered sequences and key/value mappings are synchronized element-wise
    /// when the container itself carries no tracked identity.
    pub fn is_container(&self) -> bool {
        matches!(self, Self::List(_) | Self::Map(_))
    }

    pub fn is_null_result(&self) -> bool {
        matches!(self, Self::NullResult)
    }

    /// Reference types are serialized to a backing location and tracked;
    /// primitives travel inline in completion reports.
    pub fn is_reference(&self) -> bool {
        self.is_container()
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::NullResult => "null_result",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Long(_) => "long",
            Self::Double(_) => "double",
            Self::Str(_) => "str",
            Self::List(_) => "list",
            Self::Map(_) => "map",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn containers_are_containers() {
        assert!(RuntimeValue::List(vec![]).is_container());
        assert!(RuntimeValue::Map(BTreeMap::new()).is_container());
        assert!(!RuntimeValue::Int(1).is_container());
        assert!(!RuntimeValue::Str("x".into()).is_container());
    }

    #[test]
    fn null_result_is_distinct_from_null() {
        assert_ne!(RuntimeValue::Null, RuntimeValue::NullResult);
        assert!(RuntimeValue::NullResult.is_null_result());
        assert!(!RuntimeValue::Null.is_null_result());
    }

    #[test]
    fn serde_roundtrip_preserves_numeric_width() {
        let values = [
            RuntimeValue::Int(42),
            RuntimeValue::Long(3_000_000_000),
            RuntimeValue::Double(2.0),
        ];
        for v in values {
            let bytes = serde_json::to_vec(&v).unwrap();
            let back: RuntimeValue = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(v, back);
        }
    }

    #[test]
    fn serde_roundtrip_nested_container() {
        let inner = Arc::new(RuntimeValue::Str("hello".into()));
        let v = RuntimeValue::List(vec![inner, Arc::new(RuntimeValue::Int(7))]);
        let bytes = serde_json::to_vec(&v).unwrap();
        let back: RuntimeValue = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v, back);
    }
}
