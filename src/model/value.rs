//! Attribute values and their configuration-side representation.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::Snafu;

/// A typed attribute value as carried on spans and resources.
///
/// Serializes untagged, so attribute maps render as plain JSON objects in the
/// dry-run output.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttrValue {
    /// A string value.
    String(String),
    /// A 64-bit signed integer value.
    Int(i64),
    /// A 64-bit floating point value.
    Float(f64),
    /// A boolean value.
    Bool(bool),
}

impl AttrValue {
    /// Returns the value as a string slice if it is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        AttrValue::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        AttrValue::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        AttrValue::Int(value)
    }
}

impl From<f64> for AttrValue {
    fn from(value: f64) -> Self {
        AttrValue::Float(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        AttrValue::Bool(value)
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::String(s) => f.write_str(s),
            AttrValue::Int(i) => write!(f, "{}", i),
            AttrValue::Float(v) => write!(f, "{}", v),
            AttrValue::Bool(b) => write!(f, "{}", b),
        }
    }
}

/// Error produced when a configured value cannot be interpreted.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum ValueError {
    /// The `type` field was empty.
    #[snafu(display("value type is required"))]
    MissingType,

    /// The `type` field named a type this crate does not support.
    #[snafu(display("unsupported value type {:?}", value_type))]
    UnsupportedType {
        /// The offending type name.
        value_type: String,
    },

    /// The `value` field did not hold a value of the declared type.
    #[snafu(display("expected {} value", expected))]
    MismatchedValue {
        /// The type the configuration declared.
        expected: &'static str,
    },
}

/// A tagged value as written in configuration files.
///
/// The wire shape is `{"type": "string" | "int" | "float" | "bool", "value": ...}`.
/// The type name is matched case-insensitively, and integer/float values
/// coerce between JSON number representations only when lossless.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TypedValue {
    /// Declared type of the value.
    #[serde(rename = "type")]
    pub value_type: String,
    /// The raw value.
    pub value: serde_json::Value,
}

impl TypedValue {
    /// Validates that the declared type is known and the value matches it.
    pub fn validate(&self) -> Result<(), ValueError> {
        self.to_attr_value().map(|_| ())
    }

    /// Converts the configured value into an attribute value.
    pub fn to_attr_value(&self) -> Result<AttrValue, ValueError> {
        let normalized = self.value_type.trim().to_ascii_lowercase();
        match normalized.as_str() {
            "" => MissingType.fail(),
            "string" => match self.value.as_str() {
                Some(s) => Ok(AttrValue::String(s.to_string())),
                None => MismatchedValue { expected: "string" }.fail(),
            },
            "bool" => match self.value.as_bool() {
                Some(b) => Ok(AttrValue::Bool(b)),
                None => MismatchedValue { expected: "bool" }.fail(),
            },
            "int" => match to_i64(&self.value) {
                Some(i) => Ok(AttrValue::Int(i)),
                None => MismatchedValue { expected: "int" }.fail(),
            },
            "float" => match to_f64(&self.value) {
                Some(v) => Ok(AttrValue::Float(v)),
                None => MismatchedValue { expected: "float" }.fail(),
            },
            _ => UnsupportedType {
                value_type: self.value_type.clone(),
            }
            .fail(),
        }
    }
}

/// Interprets a JSON value as a signed 64-bit integer.
///
/// Floating point numbers are accepted only when the conversion is lossless.
fn to_i64(value: &serde_json::Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    if let Some(f) = value.as_f64() {
        let i = f as i64;
        if i as f64 == f {
            return Some(i);
        }
    }
    None
}

/// Interprets a JSON value as a 64-bit float. Integers always convert.
fn to_f64(value: &serde_json::Value) -> Option<f64> {
    value.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typed(value_type: &str, value: serde_json::Value) -> TypedValue {
        TypedValue {
            value_type: value_type.to_string(),
            value,
        }
    }

    #[test]
    fn test_string_value() {
        let value = typed("string", serde_json::json!("hello"));
        assert_eq!(value.to_attr_value().unwrap(), AttrValue::String("hello".to_string()));
    }

    #[test]
    fn test_type_name_is_case_insensitive() {
        let value = typed(" Int ", serde_json::json!(42));
        assert_eq!(value.to_attr_value().unwrap(), AttrValue::Int(42));
    }

    #[test]
    fn test_int_accepts_lossless_float() {
        let value = typed("int", serde_json::json!(500.0));
        assert_eq!(value.to_attr_value().unwrap(), AttrValue::Int(500));

        let value = typed("int", serde_json::json!(500.5));
        assert!(value.to_attr_value().is_err());
    }

    #[test]
    fn test_float_accepts_int() {
        let value = typed("float", serde_json::json!(3));
        assert_eq!(value.to_attr_value().unwrap(), AttrValue::Float(3.0));
    }

    #[test]
    fn test_bool_rejects_string() {
        let value = typed("bool", serde_json::json!("true"));
        assert!(value.to_attr_value().is_err());
    }

    #[test]
    fn test_unknown_type_rejected() {
        let value = typed("bytes", serde_json::json!("aa"));
        assert!(matches!(value.to_attr_value(), Err(ValueError::UnsupportedType { .. })));
    }

    #[test]
    fn test_empty_type_rejected() {
        let value = typed("", serde_json::json!("x"));
        assert!(matches!(value.to_attr_value(), Err(ValueError::MissingType)));
    }

    #[test]
    fn test_attr_value_serializes_untagged() {
        let rendered = serde_json::to_string(&AttrValue::Int(200)).unwrap();
        assert_eq!(rendered, "200");

        let rendered = serde_json::to_string(&AttrValue::String("db".to_string())).unwrap();
        assert_eq!(rendered, "\"db\"");
    }
}
