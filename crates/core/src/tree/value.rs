//! Typed property values.
//!
//! A property holds either a single [`Value`] or an array of values sharing
//! one [`ValueType`]. Equality is by type *and* content: `Long(1)` is not equal
//! to `String("1")`, and an empty `Long` array is not equal to an empty
//! `String` array.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Longest string rendered in full by [`PropertyValue::describe`].
const DESCRIBE_MAX_CHARS: usize = 10;

/// The closed set of property value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    String,
    Binary,
    Long,
    Double,
    Boolean,
    Date,
    Name,
    Path,
    Reference,
    Decimal,
    Uri,
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "string",
            Self::Binary => "binary",
            Self::Long => "long",
            Self::Double => "double",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Name => "name",
            Self::Path => "path",
            Self::Reference => "reference",
            Self::Decimal => "decimal",
            Self::Uri => "uri",
        };
        f.write_str(s)
    }
}

/// A single scalar value.
///
/// Dates, decimals and the string-like JCR types keep their lexical form; the
/// merge core treats them opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    String(String),
    Binary(#[serde(with = "base64_bytes")] Vec<u8>),
    Long(i64),
    Double(f64),
    Boolean(bool),
    Date(String),
    Name(String),
    Path(String),
    Reference(String),
    Decimal(String),
    Uri(String),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Binary(_) => ValueType::Binary,
            Self::Long(_) => ValueType::Long,
            Self::Double(_) => ValueType::Double,
            Self::Boolean(_) => ValueType::Boolean,
            Self::Date(_) => ValueType::Date,
            Self::Name(_) => ValueType::Name,
            Self::Path(_) => ValueType::Path,
            Self::Reference(_) => ValueType::Reference,
            Self::Decimal(_) => ValueType::Decimal,
            Self::Uri(_) => ValueType::Uri,
        }
    }

    /// The textual content of string-like values.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s)
            | Self::Date(s)
            | Self::Name(s)
            | Self::Path(s)
            | Self::Reference(s)
            | Self::Decimal(s)
            | Self::Uri(s) => Some(s),
            _ => None,
        }
    }
}

// Doubles compare bitwise so that equality stays reflexive.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Double(a), Self::Double(b)) => a.to_bits() == b.to_bits(),
            (Self::Long(a), Self::Long(b)) => a == b,
            (Self::Boolean(a), Self::Boolean(b)) => a == b,
            (Self::Binary(a), Self::Binary(b)) => a == b,
            (a, b) => a.value_type() == b.value_type() && a.as_str() == b.as_str(),
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Binary(bytes) => write!(f, "<{} bytes>", bytes.len()),
            Self::Long(v) => write!(f, "{v}"),
            Self::Double(v) => write!(f, "{v}"),
            Self::Boolean(v) => write!(f, "{v}"),
            other => f.write_str(other.as_str().unwrap_or_default()),
        }
    }
}

/// The value of one property: a scalar or a typed array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Array {
        element_type: ValueType,
        values: Vec<Value>,
    },
    Single(Value),
}

impl PropertyValue {
    pub fn string(s: impl Into<String>) -> Self {
        Self::Single(Value::String(s.into()))
    }

    pub fn long(v: i64) -> Self {
        Self::Single(Value::Long(v))
    }

    pub fn boolean(v: bool) -> Self {
        Self::Single(Value::Boolean(v))
    }

    pub fn binary(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Single(Value::Binary(bytes.into()))
    }

    pub fn name(s: impl Into<String>) -> Self {
        Self::Single(Value::Name(s.into()))
    }

    /// A `Name` array, the representation of mixin type lists.
    pub fn names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            element_type: ValueType::Name,
            values: names.into_iter().map(|n| Value::Name(n.into())).collect(),
        }
    }

    pub fn strings<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Array {
            element_type: ValueType::String,
            values: values.into_iter().map(|v| Value::String(v.into())).collect(),
        }
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Array { element_type, .. } => *element_type,
            Self::Single(v) => v.value_type(),
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array { .. })
    }

    /// The scalar, if this is not an array.
    pub fn as_single(&self) -> Option<&Value> {
        match self {
            Self::Single(v) => Some(v),
            Self::Array { .. } => None,
        }
    }

    /// All values as a slice; a scalar is a one-element slice.
    pub fn values(&self) -> &[Value] {
        match self {
            Self::Array { values, .. } => values,
            Self::Single(v) => std::slice::from_ref(v),
        }
    }

    /// Redacted rendering for diagnostics.
    ///
    /// Arrays and binaries collapse to a type marker; strings longer than ten
    /// characters are cut short with an ellipsis.
    pub fn describe(&self) -> String {
        match self {
            Self::Array { .. } => "<ARRAY>".to_string(),
            Self::Single(Value::Binary(_)) => "<BINARY>".to_string(),
            Self::Single(Value::String(s)) if s.chars().count() > DESCRIBE_MAX_CHARS => {
                let head: String = s.chars().take(DESCRIBE_MAX_CHARS).collect();
                format!("{head}...")
            }
            Self::Single(v) => v.to_string(),
        }
    }
}

impl From<Value> for PropertyValue {
    fn from(v: Value) -> Self {
        Self::Single(v)
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_type_sensitive() {
        assert_ne!(
            PropertyValue::long(1),
            PropertyValue::string("1"),
            "long and string must differ"
        );
        assert_ne!(PropertyValue::name("a"), PropertyValue::string("a"));
        assert_eq!(PropertyValue::string("a"), PropertyValue::string("a"));

        let empty_longs = PropertyValue::Array {
            element_type: ValueType::Long,
            values: vec![],
        };
        let empty_strings = PropertyValue::strings(Vec::<String>::new());
        assert_ne!(empty_longs, empty_strings);
    }

    #[test]
    fn test_double_equality_is_reflexive() {
        let nan = PropertyValue::Single(Value::Double(f64::NAN));
        assert_eq!(nan, nan.clone());
        assert_ne!(
            PropertyValue::Single(Value::Double(1.0)),
            PropertyValue::long(1)
        );
    }

    #[test]
    fn test_describe_redacts() {
        assert_eq!(PropertyValue::string("short").describe(), "short");
        assert_eq!(PropertyValue::string("0123456789").describe(), "0123456789");
        assert_eq!(
            PropertyValue::string("0123456789abc").describe(),
            "0123456789..."
        );
        assert_eq!(PropertyValue::binary(vec![1, 2, 3]).describe(), "<BINARY>");
        assert_eq!(PropertyValue::names(["a", "b"]).describe(), "<ARRAY>");
        assert_eq!(PropertyValue::long(42).describe(), "42");
        // Only plain strings are truncated.
        assert_eq!(
            PropertyValue::name("jcr:lastModifiedBy").describe(),
            "jcr:lastModifiedBy"
        );
    }

    #[test]
    fn test_json_shapes() {
        let single = serde_json::to_value(PropertyValue::long(7)).unwrap();
        assert_eq!(single, serde_json::json!({"type": "long", "value": 7}));

        let bin = serde_json::to_value(PropertyValue::binary(b"hi".to_vec())).unwrap();
        assert_eq!(bin, serde_json::json!({"type": "binary", "value": "aGk="}));

        let parsed: PropertyValue = serde_json::from_value(serde_json::json!({
            "element_type": "name",
            "values": [{"type": "name", "value": "rep:MergeConflict"}]
        }))
        .unwrap();
        assert_eq!(parsed, PropertyValue::names(["rep:MergeConflict"]));
    }
}
