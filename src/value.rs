//! The runtime value tree: a tagged union, one node per parsed field.
//! Deliberately a sum type with a variant per primitive family rather than
//! a class hierarchy, so consumers match on `Value` instead of downcasting.

use indexmap::IndexMap;

use crate::stream::BitEndian;

#[cfg_attr(feature = "value-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub struct EnumValue {
    pub enum_name: String,
    pub int_val: i64,
    pub name: Option<String>,
    pub valid: bool,
}

#[cfg_attr(feature = "value-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    UInt { width: u8, val: u64 },
    SInt { width: u8, val: i64 },
    Float { width: u8, val: f64 },
    Bytes(Vec<u8>),
    Str { encoding: String, val: String },
    Bit { width: u8, bit_endian: BitEndianTag, val: u64 },
    Bool(bool),
    Enum(EnumValue),
    Map(Node),
    Array(Vec<Value>),
    Null,
}

/// [`BitEndian`] mirrored so `Value` doesn't need to derive through
/// `stream`'s type when the `value-serde` feature is off.
#[cfg_attr(feature = "value-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitEndianTag {
    Big,
    Little,
}

impl From<BitEndian> for BitEndianTag {
    fn from(b: BitEndian) -> Self {
        match b {
            BitEndian::Big => BitEndianTag::Big,
            BitEndian::Little => BitEndianTag::Little,
        }
    }
}

/// A nested-type node: an ordered map of field id -> child [`Value`], plus
/// the byte range it occupied in its owning stream (used for `_sizeof` and
/// `_io.pos` on substreams).
#[cfg_attr(feature = "value-serde", derive(serde::Serialize, serde::Deserialize))]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Node {
    pub type_name: String,
    pub children: IndexMap<String, Value>,
    pub byte_offset_start: u64,
    pub byte_size: u64,
}

impl Node {
    pub fn new(type_name: impl Into<String>) -> Self {
        Node {
            type_name: type_name.into(),
            children: IndexMap::new(),
            byte_offset_start: 0,
            byte_size: 0,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Value> {
        self.children.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, value: Value) {
        self.children.insert(id.into(), value);
    }
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::UInt { val, .. } => i64::try_from(*val).ok(),
            Value::SInt { val, .. } => Some(*val),
            Value::Bit { val, .. } => i64::try_from(*val).ok(),
            Value::Bool(b) => Some(*b as i64),
            Value::Enum(e) => Some(e.int_val),
            Value::Float { val, .. } => Some(*val as i64),
            _ => None,
        }
    }

    /// Like [`Value::as_i64`] but widened to `u64` without a sign check,
    /// used by the serializer when writing unsigned/bit-field widths that
    /// may not fit in `i64` (e.g. a `u8` field holding a value > i64::MAX).
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt { val, .. } => Some(*val),
            Value::SInt { val, .. } => u64::try_from(*val).ok(),
            Value::Bit { val, .. } => Some(*val),
            Value::Bool(b) => Some(*b as u64),
            Value::Enum(e) => u64::try_from(e.int_val).ok(),
            Value::Float { val, .. } => Some(*val as u64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float { val, .. } => Some(*val),
            other => other.as_i64().map(|v| v as f64),
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str { val, .. } => Some(val),
            _ => None,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Value::Map(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::UInt { val, .. } => *val != 0,
            Value::SInt { val, .. } => *val != 0,
            Value::Float { val, .. } => *val != 0.0,
            Value::Bit { val, .. } => *val != 0,
            Value::Bytes(b) => !b.is_empty(),
            Value::Str { val, .. } => !val.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Enum(e) => e.int_val != 0,
            Value::Map(_) => true,
        }
    }

    /// Byte width for `_sizeof<T>` of a primitive.
    pub fn byte_width(&self) -> Option<u64> {
        match self {
            Value::UInt { width, .. } | Value::SInt { width, .. } | Value::Float { width, .. } => {
                Some(*width as u64)
            }
            Value::Map(n) => Some(n.byte_size),
            Value::Bytes(b) => Some(b.len() as u64),
            _ => None,
        }
    }

    /// The canonical "value projection": converts this node into a plain
    /// JSON value for external consumption. Enum-tagged values become
    /// `{name, value, valid}`; keys preserve schema-declared order.
    pub fn project(&self) -> serde_json::Value {
        match self {
            Value::UInt { val, .. } => serde_json::json!(*val),
            Value::SInt { val, .. } => serde_json::json!(*val),
            Value::Float { val, .. } => serde_json::json!(*val),
            Value::Bytes(b) => serde_json::json!(b),
            Value::Str { val, .. } => serde_json::json!(val),
            Value::Bit { width, val, .. } if *width == 1 => serde_json::json!(*val != 0),
            Value::Bit { val, .. } => serde_json::json!(*val),
            Value::Bool(b) => serde_json::json!(*b),
            Value::Null => serde_json::Value::Null,
            Value::Enum(e) => serde_json::json!({
                "name": e.name.clone().unwrap_or_else(|| "unknown".to_string()),
                "value": e.int_val,
                "valid": e.valid,
            }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::project).collect())
            }
            Value::Map(node) => {
                let mut map = serde_json::Map::new();
                for (k, v) in &node.children {
                    map.insert(k.clone(), v.project());
                }
                serde_json::Value::Object(map)
            }
        }
    }

    pub fn unsigned(width: u8, val: u64) -> Value {
        Value::UInt { width, val }
    }

    pub fn signed(width: u8, val: i64) -> Value {
        Value::SInt { width, val }
    }

    pub fn float(width: u8, val: f64) -> Value {
        Value::Float { width, val }
    }

    pub fn bit(width: u8, bit_endian: BitEndian, val: u64) -> Value {
        if width == 1 {
            Value::Bool(val != 0)
        } else {
            Value::Bit {
                width,
                bit_endian: bit_endian.into(),
                val,
            }
        }
    }
}
