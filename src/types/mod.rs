//! # Semantic Type System
//!
//! Core pipeline types: String, Int, Float, Boolean, Unit, List, Map,
//! Record, Union, Optional. Equivalence is structural; record fields are
//! order-insensitive for equivalence but order-preserving for display.
//!
//! The type algebra here backs every typing rule in the compiler:
//! merges widen records, projections narrow them, field access looks a
//! single field up. All failures surface as [`TypeError`].
//!
//! ## Usage
//!
//! ```rust
//! use constellation_engine::types::SemType;
//!
//! let user = SemType::Record(vec![
//!     ("id".to_string(), SemType::Int),
//!     ("name".to_string(), SemType::String),
//! ]);
//!
//! assert_eq!(user.field_type("name").unwrap(), SemType::String);
//! ```

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Semantic type of a pipeline value
///
/// Records and unions keep their fields as ordered pairs so display order
/// survives round-trips; [`SemType::equivalent`] compares them as maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SemType {
    /// UTF-8 text
    String,
    /// 64-bit signed integer
    Int,
    /// 64-bit float
    Float,
    /// True/false
    Boolean,
    /// The empty value
    Unit,
    /// Homogeneous list
    List(Box<SemType>),
    /// Homogeneous key/value map (keys need not be strings)
    Map(Box<SemType>, Box<SemType>),
    /// Ordered field mapping
    Record(Vec<(String, SemType)>),
    /// Tagged variant mapping
    Union(Vec<(String, SemType)>),
    /// A value that may be absent
    Optional(Box<SemType>),
}

/// Categories of type failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeErrorKind {
    /// Two types that were required to be equivalent are not
    Mismatch,
    /// A record operation was applied to a non-record
    NotARecord,
    /// A projected or accessed field does not exist
    FieldNotFound,
    /// A shape had the wrong number of parts
    ArityMismatch,
}

impl fmt::Display for TypeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TypeErrorKind::Mismatch => "mismatch",
            TypeErrorKind::NotARecord => "not a record",
            TypeErrorKind::FieldNotFound => "field not found",
            TypeErrorKind::ArityMismatch => "arity mismatch",
        };
        f.write_str(s)
    }
}

/// Structural type error
#[derive(Debug, Clone, thiserror::Error)]
#[error("type error ({kind}): {detail}")]
pub struct TypeError {
    /// What category of failure this is
    pub kind: TypeErrorKind,
    /// Human-readable description
    pub detail: String,
}

impl TypeError {
    pub fn new(kind: TypeErrorKind, detail: impl Into<String>) -> Self {
        TypeError {
            kind,
            detail: detail.into(),
        }
    }
}

impl SemType {
    /// Structural equivalence
    ///
    /// Record and union fields are compared as unordered mappings; every
    /// other shape compares component-wise.
    pub fn equivalent(&self, other: &SemType) -> bool {
        match (self, other) {
            (SemType::String, SemType::String)
            | (SemType::Int, SemType::Int)
            | (SemType::Float, SemType::Float)
            | (SemType::Boolean, SemType::Boolean)
            | (SemType::Unit, SemType::Unit) => true,
            (SemType::List(a), SemType::List(b)) => a.equivalent(b),
            (SemType::Map(ka, va), SemType::Map(kb, vb)) => ka.equivalent(kb) && va.equivalent(vb),
            (SemType::Record(a), SemType::Record(b)) | (SemType::Union(a), SemType::Union(b)) => {
                fields_equivalent(a, b)
            }
            (SemType::Optional(a), SemType::Optional(b)) => a.equivalent(b),
            _ => false,
        }
    }

    /// Disjoint-field union of two records
    ///
    /// Left fields keep their order, right fields append. A field present
    /// on both sides is a conflict even when the types agree.
    pub fn widen_records(&self, other: &SemType) -> Result<SemType, TypeError> {
        let (left, right) = match (self, other) {
            (SemType::Record(l), SemType::Record(r)) => (l, r),
            (SemType::Record(_), other) | (other, _) => {
                return Err(TypeError::new(
                    TypeErrorKind::NotARecord,
                    format!("cannot merge non-record type {other}"),
                ));
            }
        };

        let mut fields = left.clone();
        for (name, ty) in right {
            if left.iter().any(|(n, _)| n == name) {
                return Err(TypeError::new(
                    TypeErrorKind::Mismatch,
                    format!("merge conflict on field '{name}'"),
                ));
            }
            fields.push((name.clone(), ty.clone()));
        }
        Ok(SemType::Record(fields))
    }

    /// Narrow a record to the named subset, in the requested order
    pub fn project(&self, fields: &[String]) -> Result<SemType, TypeError> {
        let record = match self {
            SemType::Record(fields) => fields,
            other => {
                return Err(TypeError::new(
                    TypeErrorKind::NotARecord,
                    format!("cannot project non-record type {other}"),
                ));
            }
        };

        let mut projected = Vec::with_capacity(fields.len());
        for name in fields {
            match record.iter().find(|(n, _)| n == name) {
                Some((n, ty)) => projected.push((n.clone(), ty.clone())),
                None => {
                    return Err(TypeError::new(
                        TypeErrorKind::FieldNotFound,
                        format!("field '{name}' not present in {self}"),
                    ));
                }
            }
        }
        Ok(SemType::Record(projected))
    }

    /// Type of a single record field
    pub fn field_type(&self, field: &str) -> Result<SemType, TypeError> {
        let record = match self {
            SemType::Record(fields) => fields,
            other => {
                return Err(TypeError::new(
                    TypeErrorKind::NotARecord,
                    format!("cannot access field '{field}' of non-record type {other}"),
                ));
            }
        };

        record
            .iter()
            .find(|(n, _)| n == field)
            .map(|(_, ty)| ty.clone())
            .ok_or_else(|| {
                TypeError::new(
                    TypeErrorKind::FieldNotFound,
                    format!("field '{field}' not present in {self}"),
                )
            })
    }

    /// Check if this type is Boolean
    pub fn is_boolean(&self) -> bool {
        matches!(self, SemType::Boolean)
    }

    /// Check if this type is a record
    pub fn is_record(&self) -> bool {
        matches!(self, SemType::Record(_))
    }

    /// Inner type of an Optional, if this is one
    pub fn optional_inner(&self) -> Option<&SemType> {
        match self {
            SemType::Optional(inner) => Some(inner),
            _ => None,
        }
    }

    /// Tagged JSON encoding (the wire format)
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::{json, Map, Value as J};
        match self {
            SemType::String => json!({"tag": "String"}),
            SemType::Int => json!({"tag": "Int"}),
            SemType::Float => json!({"tag": "Float"}),
            SemType::Boolean => json!({"tag": "Boolean"}),
            SemType::Unit => json!({"tag": "Unit"}),
            SemType::List(elem) => json!({"tag": "List", "subtype": elem.to_json()}),
            SemType::Map(k, v) => {
                json!({"tag": "Map", "keysType": k.to_json(), "valuesType": v.to_json()})
            }
            SemType::Record(fields) => {
                let mut structure = Map::new();
                for (name, ty) in fields {
                    structure.insert(name.clone(), ty.to_json());
                }
                json!({"tag": "Record", "structure": J::Object(structure)})
            }
            SemType::Union(variants) => {
                let mut vs = Map::new();
                for (name, ty) in variants {
                    vs.insert(name.clone(), ty.to_json());
                }
                json!({"tag": "Union", "variants": J::Object(vs)})
            }
            SemType::Optional(inner) => json!({"tag": "Optional", "innerType": inner.to_json()}),
        }
    }

    /// Decode the tagged JSON encoding. Tags are case-sensitive.
    pub fn from_json(value: &serde_json::Value) -> Result<SemType, TypeError> {
        let obj = value.as_object().ok_or_else(|| {
            TypeError::new(TypeErrorKind::Mismatch, "type encoding must be an object")
        })?;
        let tag = obj.get("tag").and_then(|t| t.as_str()).ok_or_else(|| {
            TypeError::new(TypeErrorKind::Mismatch, "type encoding missing 'tag'")
        })?;

        let field = |name: &str| -> Result<&serde_json::Value, TypeError> {
            obj.get(name).ok_or_else(|| {
                TypeError::new(
                    TypeErrorKind::ArityMismatch,
                    format!("type tag '{tag}' missing '{name}'"),
                )
            })
        };

        match tag {
            "String" => Ok(SemType::String),
            "Int" => Ok(SemType::Int),
            "Float" => Ok(SemType::Float),
            "Boolean" => Ok(SemType::Boolean),
            "Unit" => Ok(SemType::Unit),
            "List" => Ok(SemType::List(Box::new(SemType::from_json(
                field("subtype")?,
            )?))),
            "Map" => Ok(SemType::Map(
                Box::new(SemType::from_json(field("keysType")?)?),
                Box::new(SemType::from_json(field("valuesType")?)?),
            )),
            "Record" => {
                let structure = field("structure")?.as_object().ok_or_else(|| {
                    TypeError::new(TypeErrorKind::Mismatch, "record structure must be an object")
                })?;
                let mut fields = Vec::with_capacity(structure.len());
                for (name, ty) in structure {
                    fields.push((name.clone(), SemType::from_json(ty)?));
                }
                Ok(SemType::Record(fields))
            }
            "Union" => {
                let variants = field("variants")?.as_object().ok_or_else(|| {
                    TypeError::new(TypeErrorKind::Mismatch, "union variants must be an object")
                })?;
                let mut vs = Vec::with_capacity(variants.len());
                for (name, ty) in variants {
                    vs.push((name.clone(), SemType::from_json(ty)?));
                }
                Ok(SemType::Union(vs))
            }
            "Optional" => Ok(SemType::Optional(Box::new(SemType::from_json(
                field("innerType")?,
            )?))),
            other => Err(TypeError::new(
                TypeErrorKind::Mismatch,
                format!("unknown type tag '{other}'"),
            )),
        }
    }
}

fn fields_equivalent(a: &[(String, SemType)], b: &[(String, SemType)]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().all(|(name, ty)| {
        b.iter()
            .any(|(other_name, other_ty)| name == other_name && ty.equivalent(other_ty))
    })
}

impl fmt::Display for SemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SemType::String => write!(f, "String"),
            SemType::Int => write!(f, "Int"),
            SemType::Float => write!(f, "Float"),
            SemType::Boolean => write!(f, "Boolean"),
            SemType::Unit => write!(f, "Unit"),
            SemType::List(elem) => write!(f, "List<{elem}>"),
            SemType::Map(k, v) => write!(f, "Map<{k}, {v}>"),
            SemType::Record(fields) => {
                write!(f, "{{")?;
                for (i, (name, ty)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{name}: {ty}")?;
                }
                write!(f, "}}")
            }
            SemType::Union(variants) => {
                for (i, (name, ty)) in variants.iter().enumerate() {
                    if i > 0 {
                        write!(f, " | ")?;
                    }
                    write!(f, "{name}({ty})")?;
                }
                Ok(())
            }
            SemType::Optional(inner) => write!(f, "Optional<{inner}>"),
        }
    }
}

impl Serialize for SemType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SemType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        SemType::from_json(&value).map_err(serde::de::Error::custom)
    }
}
