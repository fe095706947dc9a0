/*!
 * Leaf values and their wire representation.
 *
 * Device leaves are booleans, integers, floats or strings. On the wire,
 * IEEE infinities travel as the sentinel strings `"Infinity"` and
 * `"-Infinity"` because JSON has no literal for them.
 */
use std::fmt;

use serde::de::{Deserialize, Deserializer, Error as DeError};
use serde::ser::{Serialize, Serializer};
use serde_json::Value as JsonValue;

/// Wire sentinel for positive infinity
pub const INFINITY_SENTINEL: &str = "Infinity";

/// Wire sentinel for negative infinity
pub const NEG_INFINITY_SENTINEL: &str = "-Infinity";

/// A scalar leaf value read from or written to a device
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Integer(i64),
    /// Floating-point value
    Float(f64),
    /// String value
    String(String),
}

/// Type label reported for a leaf in a tree snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeafType {
    /// Boolean leaf
    Boolean,
    /// Integer leaf
    Number,
    /// Floating-point leaf
    Float,
    /// String leaf
    String,
}

impl LeafType {
    /// Get the wire name of the type
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafType::Boolean => "boolean",
            LeafType::Number => "number",
            LeafType::Float => "float",
            LeafType::String => "string",
        }
    }
}

impl fmt::Display for LeafType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// The value substituted when a read fails softly
    pub fn zero() -> Self {
        Value::Integer(0)
    }

    /// Get the snapshot type label of this value
    pub fn leaf_type(&self) -> LeafType {
        match self {
            Value::Bool(_) => LeafType::Boolean,
            Value::Integer(_) => LeafType::Number,
            Value::Float(_) => LeafType::Float,
            Value::String(_) => LeafType::String,
        }
    }

    /// Try to get a boolean value
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Try to get an integer value
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Try to get a float value
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Try to get a string value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value the way tree snapshots carry it in `val`
    pub fn stringify(&self) -> String {
        match self {
            Value::Bool(b) => b.to_string(),
            Value::Integer(i) => i.to_string(),
            Value::Float(f) if *f == f64::INFINITY => INFINITY_SENTINEL.to_string(),
            Value::Float(f) if *f == f64::NEG_INFINITY => NEG_INFINITY_SENTINEL.to_string(),
            // Debug keeps the trailing ".0" so floats stay distinguishable
            Value::Float(f) => format!("{:?}", f),
            Value::String(s) => s.clone(),
        }
    }

    /// Encode the value for the wire, replacing infinities with sentinels
    pub fn to_wire(&self) -> JsonValue {
        match self {
            Value::Bool(b) => JsonValue::Bool(*b),
            Value::Integer(i) => JsonValue::from(*i),
            Value::Float(f) if *f == f64::INFINITY => JsonValue::from(INFINITY_SENTINEL),
            Value::Float(f) if *f == f64::NEG_INFINITY => JsonValue::from(NEG_INFINITY_SENTINEL),
            // NaN has no JSON form and becomes null
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            Value::String(s) => JsonValue::String(s.clone()),
        }
    }

    /// Decode a wire value, mapping the infinity sentinels back to floats
    pub fn from_wire(raw: &JsonValue) -> Option<Self> {
        match raw {
            JsonValue::Bool(b) => Some(Value::Bool(*b)),
            JsonValue::Number(n) => match n.as_i64() {
                Some(i) => Some(Value::Integer(i)),
                None => n.as_f64().map(Value::Float),
            },
            JsonValue::String(s) => Some(match s.as_str() {
                INFINITY_SENTINEL => Value::Float(f64::INFINITY),
                NEG_INFINITY_SENTINEL => Value::Float(f64::NEG_INFINITY),
                _ => Value::String(s.clone()),
            }),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.stringify())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_wire().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = JsonValue::deserialize(deserializer)?;
        Value::from_wire(&raw)
            .ok_or_else(|| D::Error::custom(format!("not a leaf value: {}", raw)))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Integer(i)
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Integer(i as i64)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Value::Float(f as f64)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// The type a client declares alongside a value it wants written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclaredType {
    /// Numeric input, always written as a float
    Number,
    /// Boolean input, written as-is
    Boolean,
    /// String input; only the infinity sentinels are writable
    String,
}

impl DeclaredType {
    /// Parse a declared type name; `"float"` is accepted as an alias of `"number"`
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "number" | "float" => Some(DeclaredType::Number),
            "boolean" => Some(DeclaredType::Boolean),
            "string" => Some(DeclaredType::String),
            _ => None,
        }
    }

    /// Coerce a raw client value into the value to write.
    ///
    /// Returns `None` for combinations that are not writable.
    pub fn coerce(self, raw: &JsonValue) -> Option<Value> {
        match (self, raw) {
            (DeclaredType::Number, JsonValue::Number(n)) => n.as_f64().map(Value::Float),
            (DeclaredType::Number, JsonValue::String(s)) => match s.as_str() {
                INFINITY_SENTINEL => Some(Value::Float(f64::INFINITY)),
                NEG_INFINITY_SENTINEL => Some(Value::Float(f64::NEG_INFINITY)),
                other => other.trim().parse::<f64>().ok().map(Value::Float),
            },
            (DeclaredType::Number, JsonValue::Bool(b)) => Some(Value::Float(if *b { 1.0 } else { 0.0 })),
            (DeclaredType::Boolean, JsonValue::Bool(b)) => Some(Value::Bool(*b)),
            (DeclaredType::String, JsonValue::String(s)) if s == INFINITY_SENTINEL => {
                Some(Value::Float(f64::INFINITY))
            }
            (DeclaredType::String, JsonValue::String(s)) if s == NEG_INFINITY_SENTINEL => {
                Some(Value::Float(f64::NEG_INFINITY))
            }
            _ => None,
        }
    }
}
