//! Tagged property values
//!
//! Every document property is a [`Value`]: a tagged union over the scalar
//! and container shapes the store understands. Accessors are type-checked
//! and may widen losslessly within a numeric class (u8 -> u32), but never
//! cross the signed/unsigned or float/integer boundary without an explicit
//! coercion call.

use std::collections::HashMap;

use base64::Engine;
use serde_json::json;

use crate::error::{StorageError, StorageResult};

/// Property map: property name -> value
pub type ValueDict = HashMap<String, Value>;

/// A document property value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    String(String),
    /// Opaque byte blob. Embeds in JSON as a base64 string and does not
    /// round-trip back to this shape.
    Data(Vec<u8>),
    Dictionary(ValueDict),
    ArrayOfStrings(Vec<String>),
    ArrayOfDictionaries(Vec<ValueDict>),
    /// Universal time: seconds since the Unix epoch
    Time(f64),
}

impl Value {
    /// Returns the shape name, used in `WrongValueType` errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Bool(_) => "bool",
            Value::I8(_) => "i8",
            Value::I16(_) => "i16",
            Value::I32(_) => "i32",
            Value::I64(_) => "i64",
            Value::U8(_) => "u8",
            Value::U16(_) => "u16",
            Value::U32(_) => "u32",
            Value::U64(_) => "u64",
            Value::F32(_) => "f32",
            Value::F64(_) => "f64",
            Value::String(_) => "string",
            Value::Data(_) => "data",
            Value::Dictionary(_) => "dictionary",
            Value::ArrayOfStrings(_) => "array of strings",
            Value::ArrayOfDictionaries(_) => "array of dictionaries",
            Value::Time(_) => "time",
        }
    }

    fn wrong_type<T>(&self, expected: &'static str) -> StorageResult<T> {
        Err(StorageError::WrongValueType {
            expected,
            found: self.type_name(),
        })
    }

    pub fn as_bool(&self) -> StorageResult<bool> {
        match self {
            Value::Bool(v) => Ok(*v),
            other => other.wrong_type("bool"),
        }
    }

    pub fn as_i8(&self) -> StorageResult<i8> {
        match self {
            Value::I8(v) => Ok(*v),
            other => other.wrong_type("i8"),
        }
    }

    pub fn as_i16(&self) -> StorageResult<i16> {
        match self {
            Value::I8(v) => Ok(*v as i16),
            Value::I16(v) => Ok(*v),
            other => other.wrong_type("i16"),
        }
    }

    pub fn as_i32(&self) -> StorageResult<i32> {
        match self {
            Value::I8(v) => Ok(*v as i32),
            Value::I16(v) => Ok(*v as i32),
            Value::I32(v) => Ok(*v),
            other => other.wrong_type("i32"),
        }
    }

    pub fn as_i64(&self) -> StorageResult<i64> {
        match self {
            Value::I8(v) => Ok(*v as i64),
            Value::I16(v) => Ok(*v as i64),
            Value::I32(v) => Ok(*v as i64),
            Value::I64(v) => Ok(*v),
            other => other.wrong_type("i64"),
        }
    }

    pub fn as_u8(&self) -> StorageResult<u8> {
        match self {
            Value::U8(v) => Ok(*v),
            other => other.wrong_type("u8"),
        }
    }

    pub fn as_u16(&self) -> StorageResult<u16> {
        match self {
            Value::U8(v) => Ok(*v as u16),
            Value::U16(v) => Ok(*v),
            other => other.wrong_type("u16"),
        }
    }

    pub fn as_u32(&self) -> StorageResult<u32> {
        match self {
            Value::U8(v) => Ok(*v as u32),
            Value::U16(v) => Ok(*v as u32),
            Value::U32(v) => Ok(*v),
            other => other.wrong_type("u32"),
        }
    }

    pub fn as_u64(&self) -> StorageResult<u64> {
        match self {
            Value::U8(v) => Ok(*v as u64),
            Value::U16(v) => Ok(*v as u64),
            Value::U32(v) => Ok(*v as u64),
            Value::U64(v) => Ok(*v),
            other => other.wrong_type("u64"),
        }
    }

    pub fn as_f32(&self) -> StorageResult<f32> {
        match self {
            Value::F32(v) => Ok(*v),
            other => other.wrong_type("f32"),
        }
    }

    pub fn as_f64(&self) -> StorageResult<f64> {
        match self {
            Value::F32(v) => Ok(*v as f64),
            Value::F64(v) => Ok(*v),
            other => other.wrong_type("f64"),
        }
    }

    pub fn as_str(&self) -> StorageResult<&str> {
        match self {
            Value::String(v) => Ok(v),
            other => other.wrong_type("string"),
        }
    }

    pub fn as_data(&self) -> StorageResult<&[u8]> {
        match self {
            Value::Data(v) => Ok(v),
            other => other.wrong_type("data"),
        }
    }

    pub fn as_dictionary(&self) -> StorageResult<&ValueDict> {
        match self {
            Value::Dictionary(v) => Ok(v),
            other => other.wrong_type("dictionary"),
        }
    }

    pub fn as_string_array(&self) -> StorageResult<&[String]> {
        match self {
            Value::ArrayOfStrings(v) => Ok(v),
            other => other.wrong_type("array of strings"),
        }
    }

    pub fn as_dictionary_array(&self) -> StorageResult<&[ValueDict]> {
        match self {
            Value::ArrayOfDictionaries(v) => Ok(v),
            other => other.wrong_type("array of dictionaries"),
        }
    }

    /// Universal time in seconds. Accepts the time shape and, since a JSON
    /// round trip strips the time tag, a plain f64.
    pub fn as_time(&self) -> StorageResult<f64> {
        match self {
            Value::Time(v) => Ok(*v),
            Value::F64(v) => Ok(*v),
            other => other.wrong_type("time"),
        }
    }

    /// Coerce any integer shape to i64, crossing the signed/unsigned
    /// boundary when the value fits
    pub fn coerce_i64(&self) -> StorageResult<i64> {
        match self {
            Value::I8(v) => Ok(*v as i64),
            Value::I16(v) => Ok(*v as i64),
            Value::I32(v) => Ok(*v as i64),
            Value::I64(v) => Ok(*v),
            Value::U8(v) => Ok(*v as i64),
            Value::U16(v) => Ok(*v as i64),
            Value::U32(v) => Ok(*v as i64),
            Value::U64(v) => i64::try_from(*v).map_err(|_| StorageError::WrongValueType {
                expected: "i64",
                found: "u64",
            }),
            other => other.wrong_type("integer"),
        }
    }

    /// Coerce any numeric shape to f64
    pub fn coerce_f64(&self) -> StorageResult<f64> {
        match self {
            Value::F32(v) => Ok(*v as f64),
            Value::F64(v) => Ok(*v),
            Value::Time(v) => Ok(*v),
            other => other.coerce_i64().map(|v| v as f64),
        }
    }

    /// Encode to a JSON value. Total for every shape; blobs become base64
    /// strings and the time tag becomes a plain number.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Bool(v) => json!(v),
            Value::I8(v) => json!(v),
            Value::I16(v) => json!(v),
            Value::I32(v) => json!(v),
            Value::I64(v) => json!(v),
            Value::U8(v) => json!(v),
            Value::U16(v) => json!(v),
            Value::U32(v) => json!(v),
            Value::U64(v) => json!(v),
            Value::F32(v) => json!(v),
            Value::F64(v) => json!(v),
            Value::String(v) => json!(v),
            Value::Data(v) => {
                json!(base64::engine::general_purpose::STANDARD.encode(v))
            }
            Value::Dictionary(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
            Value::ArrayOfStrings(items) => json!(items),
            Value::ArrayOfDictionaries(items) => serde_json::Value::Array(
                items
                    .iter()
                    .map(|d| Value::Dictionary(d.clone()).to_json())
                    .collect(),
            ),
            Value::Time(v) => json!(v),
        }
    }

    /// Decode from a JSON value. Non-negative integers in u32 range come
    /// back as u32, larger ones as u64; negative integers as i32/i64;
    /// fractional numbers as f64.
    pub fn from_json(json: &serde_json::Value) -> StorageResult<Value> {
        match json {
            serde_json::Value::Bool(v) => Ok(Value::Bool(*v)),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    if u <= u32::MAX as u64 {
                        Ok(Value::U32(u as u32))
                    } else {
                        Ok(Value::U64(u))
                    }
                } else if let Some(i) = n.as_i64() {
                    if i >= i32::MIN as i64 {
                        Ok(Value::I32(i as i32))
                    } else {
                        Ok(Value::I64(i))
                    }
                } else if let Some(f) = n.as_f64() {
                    Ok(Value::F64(f))
                } else {
                    Err(StorageError::SerializationFailure(format!(
                        "unrepresentable number: {}",
                        n
                    )))
                }
            }
            serde_json::Value::String(v) => Ok(Value::String(v.clone())),
            serde_json::Value::Array(items) => {
                if items.iter().all(|item| item.is_string()) {
                    Ok(Value::ArrayOfStrings(
                        items
                            .iter()
                            .map(|item| item.as_str().unwrap_or_default().to_string())
                            .collect(),
                    ))
                } else if items.iter().all(|item| item.is_object()) {
                    let mut dicts = Vec::with_capacity(items.len());
                    for item in items {
                        match Value::from_json(item)? {
                            Value::Dictionary(d) => dicts.push(d),
                            _ => unreachable!("object decodes to dictionary"),
                        }
                    }
                    Ok(Value::ArrayOfDictionaries(dicts))
                } else {
                    Err(StorageError::SerializationFailure(
                        "array must hold all strings or all dictionaries".to_string(),
                    ))
                }
            }
            serde_json::Value::Object(map) => {
                let mut dict = ValueDict::with_capacity(map.len());
                for (k, v) in map {
                    dict.insert(k.clone(), Value::from_json(v)?);
                }
                Ok(Value::Dictionary(dict))
            }
            serde_json::Value::Null => Err(StorageError::SerializationFailure(
                "null is not a property value".to_string(),
            )),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i8> for Value {
    fn from(v: i8) -> Self {
        Value::I8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::I16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::U8(v)
    }
}

impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::U16(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::U32(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::U64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Data(v)
    }
}

/// Encode a property map to a JSON object
pub fn dict_to_json(dict: &ValueDict) -> serde_json::Value {
    Value::Dictionary(dict.clone()).to_json()
}

/// Decode a property map from a JSON object
pub fn dict_from_json(json: &serde_json::Value) -> StorageResult<ValueDict> {
    match Value::from_json(json)? {
        Value::Dictionary(dict) => Ok(dict),
        other => Err(StorageError::SerializationFailure(format!(
            "expected dictionary, found {}",
            other.type_name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessor_matches_shape() {
        assert_eq!(Value::Bool(true).as_bool().unwrap(), true);
        assert_eq!(Value::U32(7).as_u32().unwrap(), 7);
        assert_eq!(Value::String("hi".into()).as_str().unwrap(), "hi");
    }

    #[test]
    fn test_wrong_accessor_fails_without_mutation() {
        let value = Value::String("hi".into());
        let err = value.as_u32().unwrap_err();
        assert!(matches!(err, StorageError::WrongValueType { .. }));
        // The value is untouched
        assert_eq!(value.as_str().unwrap(), "hi");
    }

    #[test]
    fn test_lossless_widening() {
        assert_eq!(Value::U8(9).as_u32().unwrap(), 9);
        assert_eq!(Value::I16(-3).as_i64().unwrap(), -3);
        assert_eq!(Value::F32(1.5).as_f64().unwrap(), 1.5);
    }

    #[test]
    fn test_no_cross_class_widening() {
        assert!(Value::U32(1).as_i64().is_err());
        assert!(Value::I32(1).as_u64().is_err());
        assert!(Value::I32(1).as_f64().is_err());
    }

    #[test]
    fn test_explicit_coercion() {
        assert_eq!(Value::U32(5).coerce_i64().unwrap(), 5);
        assert_eq!(Value::I8(-2).coerce_f64().unwrap(), -2.0);
        assert!(Value::U64(u64::MAX).coerce_i64().is_err());
    }

    #[test]
    fn test_structural_equality() {
        let mut a = ValueDict::new();
        a.insert("x".into(), Value::U32(1));
        let mut b = ValueDict::new();
        b.insert("x".into(), Value::U32(1));
        assert_eq!(Value::Dictionary(a), Value::Dictionary(b));
    }

    #[test]
    fn test_json_round_trip() {
        let mut dict = ValueDict::new();
        dict.insert("flag".into(), Value::Bool(true));
        dict.insert("count".into(), Value::U32(42));
        dict.insert("name".into(), Value::String("thing".into()));
        dict.insert("tags".into(), Value::ArrayOfStrings(vec!["a".into(), "b".into()]));

        let json = dict_to_json(&dict);
        let decoded = dict_from_json(&json).unwrap();
        assert_eq!(decoded, dict);
    }

    #[test]
    fn test_data_encodes_as_base64_string() {
        let value = Value::Data(b"hello".to_vec());
        let json = value.to_json();
        assert_eq!(json, serde_json::json!("aGVsbG8="));
        // Blobs do not round-trip: they come back as strings
        assert_eq!(
            Value::from_json(&json).unwrap(),
            Value::String("aGVsbG8=".into())
        );
    }

    #[test]
    fn test_negative_numbers_decode_signed() {
        let decoded = Value::from_json(&serde_json::json!(-4)).unwrap();
        assert_eq!(decoded, Value::I32(-4));
        let decoded = Value::from_json(&serde_json::json!(3)).unwrap();
        assert_eq!(decoded, Value::U32(3));
    }
}
