//! Object encoding boundary.
//!
//! The store keeps encoded bytes; a [`Serializer`] turns dynamic values
//! into those bytes and back. Typed access goes through [`DataObject`].

use crate::error::{CoreError, CoreResult};
use ciborium::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes and decodes object values for one setup.
pub trait Serializer: Send + Sync {
    /// Short name, used in logs.
    fn name(&self) -> &str;

    /// Encodes `value` of type `type_name`.
    fn encode(&self, type_name: &str, value: &Value) -> CoreResult<Vec<u8>>;

    /// Decodes bytes of type `type_name`.
    fn decode(&self, type_name: &str, bytes: &[u8]) -> CoreResult<Value>;
}

/// CBOR encoding (the default).
#[derive(Debug, Default, Clone, Copy)]
pub struct CborSerializer;

impl Serializer for CborSerializer {
    fn name(&self) -> &str {
        "cbor"
    }

    fn encode(&self, type_name: &str, value: &Value) -> CoreResult<Vec<u8>> {
        let mut out = Vec::new();
        ciborium::into_writer(value, &mut out)
            .map_err(|e| CoreError::serialization(format!("encoding {type_name}: {e}")))?;
        Ok(out)
    }

    fn decode(&self, type_name: &str, bytes: &[u8]) -> CoreResult<Value> {
        ciborium::from_reader(bytes)
            .map_err(|e| CoreError::serialization(format!("decoding {type_name}: {e}")))
    }
}

/// JSON encoding, handy when the store is inspected by other tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn name(&self) -> &str {
        "json"
    }

    fn encode(&self, type_name: &str, value: &Value) -> CoreResult<Vec<u8>> {
        serde_json::to_vec(value)
            .map_err(|e| CoreError::serialization(format!("encoding {type_name}: {e}")))
    }

    fn decode(&self, type_name: &str, bytes: &[u8]) -> CoreResult<Value> {
        serde_json::from_slice(bytes)
            .map_err(|e| CoreError::serialization(format!("decoding {type_name}: {e}")))
    }
}

/// A statically typed object stored under a fixed type name.
pub trait DataObject: Serialize + DeserializeOwned + Send + 'static {
    /// Type name used as the table identifier.
    const TYPE_NAME: &'static str;

    /// The object's key within its type.
    fn key(&self) -> String;
}

pub(crate) fn to_value<T: Serialize>(value: &T) -> CoreResult<Value> {
    Value::serialized(value).map_err(|e| CoreError::serialization(e.to_string()))
}

pub(crate) fn from_value<T: DeserializeOwned>(value: Value) -> CoreResult<T> {
    value
        .deserialized()
        .map_err(|e| CoreError::serialization(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: u32,
        text: String,
    }

    #[test]
    fn cbor_and_json_round_trip() {
        let note = Note {
            id: 42,
            text: "hello".into(),
        };
        let value = to_value(&note).unwrap();
        for serializer in [&CborSerializer as &dyn Serializer, &JsonSerializer] {
            let bytes = serializer.encode("Note", &value).unwrap();
            let back: Note = from_value(serializer.decode("Note", &bytes).unwrap()).unwrap();
            assert_eq!(back, note, "{}", serializer.name());
        }
    }

    #[test]
    fn decode_garbage_is_serialization_error() {
        let err = CborSerializer.decode("Note", &[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::Serialization(_)));
        let err = JsonSerializer.decode("Note", b"{").unwrap_err();
        assert!(err.to_string().contains("decoding Note"));
    }
}
