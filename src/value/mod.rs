//! # Value Type System
//!
//! Runtime values flowing through a pipeline: String, Int, Float, Boolean,
//! Unit, List, Map, Record, Union, Some/None. Every composite value carries
//! its static type inline, so a value is self-describing on the wire.
//!
//! ## Wire format
//!
//! JSON with a `tag` discriminator on every value and every type:
//!
//! ```text
//! {"tag": "Int", "value": 5}
//! {"tag": "List", "value": [...], "subtype": {"tag": "Int"}}
//! {"tag": "Map", "value": [{"key": ..., "value": ...}], "keysType": ..., "valuesType": ...}
//! {"tag": "Record", "value": {...}, "structure": {...}}
//! {"tag": "Some", "value": ..., "innerType": ...}
//! {"tag": "None", "innerType": ...}
//! ```
//!
//! Map entries are an array of key/value objects, not a JSON object, so
//! non-string keys survive the round trip. Tags are case-sensitive.

use crate::types::SemType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fmt::Write as _;

/// A runtime value with its static type carried inline
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// UTF-8 text
    String(String),
    /// 64-bit signed integer
    Int(i64),
    /// 64-bit float
    Float(f64),
    /// True/false
    Boolean(bool),
    /// The empty value
    Unit,
    /// Homogeneous list; the element type is kept so empty lists stay typed
    List {
        items: Vec<Value>,
        elem_type: SemType,
    },
    /// Key/value map; keys need not be strings
    Map {
        entries: Vec<(Value, Value)>,
        key_type: SemType,
        value_type: SemType,
    },
    /// Ordered field mapping
    Record(Vec<(String, Value)>),
    /// One variant of a tagged union; `union_type` is the full union
    Union {
        variant: String,
        value: Box<Value>,
        union_type: SemType,
    },
    /// Present optional
    Some(Box<Value>),
    /// Absent optional; the inner type keeps it well-typed
    None(SemType),
}

/// Wire encoding/decoding failure
#[derive(Debug, Clone, thiserror::Error)]
pub enum WireError {
    #[error("unknown value tag '{tag}'")]
    UnknownTag { tag: String },

    #[error("value tag '{tag}' missing field '{field}'")]
    MissingField { tag: String, field: String },

    #[error("malformed value encoding: {detail}")]
    InvalidShape { detail: String },
}

impl Value {
    /// The static type of this value
    pub fn sem_type(&self) -> SemType {
        match self {
            Value::String(_) => SemType::String,
            Value::Int(_) => SemType::Int,
            Value::Float(_) => SemType::Float,
            Value::Boolean(_) => SemType::Boolean,
            Value::Unit => SemType::Unit,
            Value::List { elem_type, .. } => SemType::List(Box::new(elem_type.clone())),
            Value::Map {
                key_type,
                value_type,
                ..
            } => SemType::Map(Box::new(key_type.clone()), Box::new(value_type.clone())),
            Value::Record(fields) => SemType::Record(
                fields
                    .iter()
                    .map(|(name, value)| (name.clone(), value.sem_type()))
                    .collect(),
            ),
            Value::Union { union_type, .. } => union_type.clone(),
            Value::Some(inner) => SemType::Optional(Box::new(inner.sem_type())),
            Value::None(inner) => SemType::Optional(Box::new(inner.clone())),
        }
    }

    /// Check this value against a declared type (structural equivalence)
    pub fn matches_type(&self, ty: &SemType) -> bool {
        self.sem_type().equivalent(ty)
    }

    /// Extract a boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Record field lookup
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Stable serialization used for cache keys: record and map entries are
    /// key-sorted so two equal values always canonicalize identically.
    pub fn canonical_key(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::String(s) => {
                let _ = write!(out, "s:{s:?}");
            }
            Value::Int(i) => {
                let _ = write!(out, "i:{i}");
            }
            Value::Float(x) => {
                let _ = write!(out, "f:{}", x.to_bits());
            }
            Value::Boolean(b) => {
                let _ = write!(out, "b:{b}");
            }
            Value::Unit => out.push('u'),
            Value::List { items, .. } => {
                out.push_str("l[");
                for item in items {
                    item.write_canonical(out);
                    out.push(',');
                }
                out.push(']');
            }
            Value::Map { entries, .. } => {
                let mut keyed: Vec<(String, &Value)> = entries
                    .iter()
                    .map(|(k, v)| (k.canonical_key(), v))
                    .collect();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                out.push_str("m{");
                for (key, value) in keyed {
                    let _ = write!(out, "{key}=>");
                    value.write_canonical(out);
                    out.push(',');
                }
                out.push('}');
            }
            Value::Record(fields) => {
                let mut sorted: Vec<&(String, Value)> = fields.iter().collect();
                sorted.sort_by(|a, b| a.0.cmp(&b.0));
                out.push_str("r{");
                for (name, value) in sorted {
                    let _ = write!(out, "{name}=");
                    value.write_canonical(out);
                    out.push(',');
                }
                out.push('}');
            }
            Value::Union { variant, value, .. } => {
                let _ = write!(out, "v:{variant}(");
                value.write_canonical(out);
                out.push(')');
            }
            Value::Some(inner) => {
                out.push_str("o+");
                inner.write_canonical(out);
            }
            Value::None(_) => out.push_str("o-"),
        }
    }

    /// Tagged JSON encoding (the wire format)
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Map, Value as J};
        match self {
            Value::String(s) => json!({"tag": "String", "value": s}),
            Value::Int(i) => json!({"tag": "Int", "value": i}),
            Value::Float(x) => json!({"tag": "Float", "value": x}),
            Value::Boolean(b) => json!({"tag": "Boolean", "value": b}),
            Value::Unit => json!({"tag": "Unit"}),
            Value::List { items, elem_type } => {
                let values: Vec<J> = items.iter().map(Value::to_json).collect();
                json!({"tag": "List", "value": values, "subtype": elem_type.to_json()})
            }
            Value::Map {
                entries,
                key_type,
                value_type,
            } => {
                let pairs: Vec<J> = entries
                    .iter()
                    .map(|(k, v)| json!({"key": k.to_json(), "value": v.to_json()}))
                    .collect();
                json!({
                    "tag": "Map",
                    "value": pairs,
                    "keysType": key_type.to_json(),
                    "valuesType": value_type.to_json(),
                })
            }
            Value::Record(fields) => {
                let mut value = Map::new();
                let mut structure = Map::new();
                for (name, v) in fields {
                    value.insert(name.clone(), v.to_json());
                    structure.insert(name.clone(), v.sem_type().to_json());
                }
                json!({"tag": "Record", "value": J::Object(value), "structure": J::Object(structure)})
            }
            Value::Union {
                variant,
                value,
                union_type,
            } => json!({
                "tag": "Union",
                "variant": variant,
                "value": value.to_json(),
                "unionType": union_type.to_json(),
            }),
            Value::Some(inner) => json!({
                "tag": "Some",
                "value": inner.to_json(),
                "innerType": inner.sem_type().to_json(),
            }),
            Value::None(inner) => json!({"tag": "None", "innerType": inner.to_json()}),
        }
    }

    /// Decode the tagged JSON encoding
    pub fn from_json(value: &serde_json::Value) -> Result<Value, WireError> {
        let obj = value.as_object().ok_or_else(|| WireError::InvalidShape {
            detail: "value encoding must be an object".to_string(),
        })?;
        let tag = obj
            .get("tag")
            .and_then(|t| t.as_str())
            .ok_or_else(|| WireError::InvalidShape {
                detail: "value encoding missing 'tag'".to_string(),
            })?;

        let field = |name: &str| -> Result<&serde_json::Value, WireError> {
            obj.get(name).ok_or_else(|| WireError::MissingField {
                tag: tag.to_string(),
                field: name.to_string(),
            })
        };
        let decode_type = |v: &serde_json::Value| -> Result<SemType, WireError> {
            SemType::from_json(v).map_err(|e| WireError::InvalidShape {
                detail: e.to_string(),
            })
        };

        match tag {
            "String" => Ok(Value::String(
                field("value")?
                    .as_str()
                    .ok_or_else(|| WireError::InvalidShape {
                        detail: "String value must be a JSON string".to_string(),
                    })?
                    .to_string(),
            )),
            "Int" => Ok(Value::Int(field("value")?.as_i64().ok_or_else(|| {
                WireError::InvalidShape {
                    detail: "Int value must be a JSON integer".to_string(),
                }
            })?)),
            "Float" => Ok(Value::Float(field("value")?.as_f64().ok_or_else(|| {
                WireError::InvalidShape {
                    detail: "Float value must be a JSON number".to_string(),
                }
            })?)),
            "Boolean" => Ok(Value::Boolean(field("value")?.as_bool().ok_or_else(
                || WireError::InvalidShape {
                    detail: "Boolean value must be a JSON boolean".to_string(),
                },
            )?)),
            "Unit" => Ok(Value::Unit),
            "List" => {
                let items = field("value")?
                    .as_array()
                    .ok_or_else(|| WireError::InvalidShape {
                        detail: "List value must be a JSON array".to_string(),
                    })?
                    .iter()
                    .map(Value::from_json)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::List {
                    items,
                    elem_type: decode_type(field("subtype")?)?,
                })
            }
            "Map" => {
                let mut entries = Vec::new();
                for pair in field("value")?
                    .as_array()
                    .ok_or_else(|| WireError::InvalidShape {
                        detail: "Map value must be a JSON array of {key, value}".to_string(),
                    })?
                {
                    let pair = pair.as_object().ok_or_else(|| WireError::InvalidShape {
                        detail: "Map entry must be an object".to_string(),
                    })?;
                    let key = pair.get("key").ok_or_else(|| WireError::MissingField {
                        tag: "Map".to_string(),
                        field: "key".to_string(),
                    })?;
                    let val = pair.get("value").ok_or_else(|| WireError::MissingField {
                        tag: "Map".to_string(),
                        field: "value".to_string(),
                    })?;
                    entries.push((Value::from_json(key)?, Value::from_json(val)?));
                }
                Ok(Value::Map {
                    entries,
                    key_type: decode_type(field("keysType")?)?,
                    value_type: decode_type(field("valuesType")?)?,
                })
            }
            "Record" => {
                let fields = field("value")?
                    .as_object()
                    .ok_or_else(|| WireError::InvalidShape {
                        detail: "Record value must be a JSON object".to_string(),
                    })?;
                let mut decoded = Vec::with_capacity(fields.len());
                for (name, v) in fields {
                    decoded.push((name.clone(), Value::from_json(v)?));
                }
                Ok(Value::Record(decoded))
            }
            "Union" => {
                let variant = field("variant")?
                    .as_str()
                    .ok_or_else(|| WireError::InvalidShape {
                        detail: "Union variant must be a string".to_string(),
                    })?
                    .to_string();
                Ok(Value::Union {
                    variant,
                    value: Box::new(Value::from_json(field("value")?)?),
                    union_type: decode_type(field("unionType")?)?,
                })
            }
            "Some" => Ok(Value::Some(Box::new(Value::from_json(field("value")?)?))),
            "None" => Ok(Value::None(decode_type(field("innerType")?)?)),
            other => Err(WireError::UnknownTag {
                tag: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) => write!(f, "{s:?}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Unit => write!(f, "()"),
            Value::List { items, .. } => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map { entries, .. } => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k} => {v}")?;
                }
                write!(f, "}}")
            }
            Value::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {v}")?;
                }
                write!(f, "}}")
            }
            Value::Union { variant, value, .. } => write!(f, "{variant}({value})"),
            Value::Some(inner) => write!(f, "Some({inner})"),
            Value::None(_) => write!(f, "None"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Value::from_json(&value).map_err(serde::de::Error::custom)
    }
}

/// Convenience constructor for a typed list value
pub fn list_of(items: Vec<Value>, elem_type: SemType) -> Value {
    Value::List { items, elem_type }
}

/// Convenience constructor for a record value
pub fn record_of(fields: Vec<(&str, Value)>) -> Value {
    Value::Record(
        fields
            .into_iter()
            .map(|(name, value)| (name.to_string(), value))
            .collect(),
    )
}
