//! Pluggable serialize/deserialize contract for tracked objects.
//!
//! The core never assumes universal serializability: anything that crosses a
//! backing location goes through this narrow capability interface. The default
//! implementation is JSON.

use crate::value::RuntimeValue;

#[derive(Debug, thiserror::Error)]
pub enum SerializeError {
    #[error("failed to serialize {type_name} value: {message}")]
    Encode {
        type_name: &'static str,
        message: String,
    },

    #[error("failed to deserialize value: {message}")]
    Decode { message: String },
}

/// Codec for moving a `RuntimeValue` to and from a backing location.
pub trait Serializer: Send + Sync {
    fn serialize(&self, value: &RuntimeValue) -> Result<Vec<u8>, SerializeError>;
    fn deserialize(&self, bytes: &[u8]) -> Result<RuntimeValue, SerializeError>;
}

/// Default serializer backed by serde_json.
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, value: &RuntimeValue) -> Result<Vec<u8>, SerializeError> {
        serde_json::to_vec(value).map_err(|e| SerializeError::Encode {
            type_name: value.type_name(),
            message: e.to_string(),
        })
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<RuntimeValue, SerializeError> {
        serde_json::from_slice(bytes).map_err(|e| SerializeError::Decode {
            message: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn roundtrip_primitives() {
        let ser = JsonSerializer;
        for v in [
            RuntimeValue::Null,
            RuntimeValue::Bool(true),
            RuntimeValue::Int(-3),
            RuntimeValue::Long(1 << 40),
            RuntimeValue::Double(0.25),
            RuntimeValue::Str("hello worker".into()),
        ] {
            let bytes = ser.serialize(&v).unwrap();
            assert_eq!(ser.deserialize(&bytes).unwrap(), v);
        }
    }

    #[test]
    fn roundtrip_container() {
        let ser = JsonSerializer;
        let v = RuntimeValue::List(vec![
            Arc::new(RuntimeValue::Int(1)),
            Arc::new(RuntimeValue::Str("two".into())),
        ]);
        let bytes = ser.serialize(&v).unwrap();
        assert_eq!(ser.deserialize(&bytes).unwrap(), v);
    }

    #[test]
    fn garbage_bytes_fail_decode() {
        let ser = JsonSerializer;
        let err = ser.deserialize(b"not json at all").unwrap_err();
        assert!(matches!(err, SerializeError::Decode { .. }));
    }
}
