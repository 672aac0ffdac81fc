//! Dynamic, schema-describable value trees used as payload for properties,
//! actions, and configs.
//!
//! [`Meta`] is a recursive tree of named children plus an optional leaf
//! value. It round-trips through JSON by default (§6) but the core does not
//! prescribe the wire codec beyond that structural requirement.

use std::collections::BTreeMap;
use std::fmt;

/// A leaf value carried by a [`Meta`] node.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Leaf {
    Bool(bool),
    Int(i64),
    Long(i64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

impl Leaf {
    pub fn type_name(&self) -> &'static str {
        match self {
            Leaf::Bool(_) => "bool",
            Leaf::Int(_) => "int",
            Leaf::Long(_) => "long",
            Leaf::Double(_) => "double",
            Leaf::String(_) => "string",
            Leaf::Bytes(_) => "bytes",
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Leaf::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Leaf::Double(d) => Some(*d),
            Leaf::Int(i) | Leaf::Long(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Leaf::Int(i) | Leaf::Long(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Leaf::String(s) => Some(s),
            _ => None,
        }
    }
}

impl From<bool> for Leaf {
    fn from(v: bool) -> Self {
        Leaf::Bool(v)
    }
}
impl From<i64> for Leaf {
    fn from(v: i64) -> Self {
        Leaf::Long(v)
    }
}
impl From<f64> for Leaf {
    fn from(v: f64) -> Self {
        Leaf::Double(v)
    }
}
impl From<String> for Leaf {
    fn from(v: String) -> Self {
        Leaf::String(v)
    }
}
impl From<&str> for Leaf {
    fn from(v: &str) -> Self {
        Leaf::String(v.to_string())
    }
}
impl From<Vec<u8>> for Leaf {
    fn from(v: Vec<u8>) -> Self {
        Leaf::Bytes(v)
    }
}

/// A recursive tree of named children plus an optional leaf value.
///
/// `BTreeMap` is used for children so that two `Meta` values with the same
/// content are `Eq` (and hash identically) regardless of insertion order —
/// deterministic key ordering is not required on the wire (§6) but equality
/// must not depend on it either.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Meta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leaf: Option<Leaf>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub children: BTreeMap<String, Meta>,
}

impl Meta {
    /// The empty tree: no leaf, no children.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A leaf-only node.
    pub fn leaf(value: impl Into<Leaf>) -> Self {
        Self {
            leaf: Some(value.into()),
            children: BTreeMap::new(),
        }
    }

    /// Build a struct node from named children.
    pub fn struct_of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = (S, Meta)>,
        S: Into<String>,
    {
        Self {
            leaf: None,
            children: fields.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Meta> {
        self.children.get(name)
    }

    pub fn with_child(mut self, name: impl Into<String>, value: Meta) -> Self {
        self.children.insert(name.into(), value);
        self
    }

    pub fn is_leaf(&self) -> bool {
        self.leaf.is_some()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.leaf.as_ref().and_then(Leaf::as_bool)
    }

    pub fn as_f64(&self) -> Option<f64> {
        self.leaf.as_ref().and_then(Leaf::as_f64)
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.leaf.as_ref().and_then(Leaf::as_i64)
    }

    pub fn as_str(&self) -> Option<&str> {
        self.leaf.as_ref().and_then(Leaf::as_str)
    }

    /// Decode from the default JSON wire codec.
    pub fn from_json(json: &serde_json::Value) -> Meta {
        match json {
            serde_json::Value::Null => Meta::empty(),
            serde_json::Value::Bool(b) => Meta::leaf(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Meta::leaf(i)
                } else {
                    Meta::leaf(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Meta::leaf(s.as_str()),
            serde_json::Value::Array(items) => {
                let children = items
                    .iter()
                    .enumerate()
                    .map(|(i, v)| (i.to_string(), Meta::from_json(v)));
                Meta::struct_of(children)
            }
            serde_json::Value::Object(map) => {
                Meta::struct_of(map.iter().map(|(k, v)| (k.clone(), Meta::from_json(v))))
            }
        }
    }

    /// Encode to the default JSON wire codec.
    pub fn to_json(&self) -> serde_json::Value {
        if let Some(leaf) = &self.leaf {
            return match leaf {
                Leaf::Bool(b) => serde_json::Value::Bool(*b),
                Leaf::Int(i) | Leaf::Long(i) => serde_json::Value::from(*i),
                Leaf::Double(d) => serde_json::Number::from_f64(*d)
                    .map(serde_json::Value::Number)
                    .unwrap_or(serde_json::Value::Null),
                Leaf::String(s) => serde_json::Value::String(s.clone()),
                Leaf::Bytes(b) => {
                    use std::fmt::Write;
                    let mut out = String::with_capacity(b.len() * 2);
                    for byte in b {
                        let _ = write!(out, "{byte:02x}");
                    }
                    serde_json::Value::String(out)
                }
            };
        }
        let map = self
            .children
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        serde_json::Value::Object(map)
    }
}

impl fmt::Display for Meta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}

/// The shape a `LeafType` must take, used by [`MetaDescriptor`] to validate
/// a leaf without pinning down the exact numeric representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum LeafType {
    Bool,
    Int,
    Long,
    Double,
    String,
    Bytes,
}

impl LeafType {
    fn matches(self, leaf: &Leaf) -> bool {
        matches!(
            (self, leaf),
            (LeafType::Bool, Leaf::Bool(_))
                | (LeafType::Int, Leaf::Int(_))
                | (LeafType::Long, Leaf::Long(_))
                | (LeafType::Double, Leaf::Double(_))
                | (LeafType::String, Leaf::String(_))
                | (LeafType::Bytes, Leaf::Bytes(_))
        ) || ((self == LeafType::Long || self == LeafType::Int) && matches!(leaf, Leaf::Int(_) | Leaf::Long(_)))
    }
}

/// Describes the allowed structure of a [`Meta`] tree, used both to validate
/// blueprint-declared configs and action input/output before dispatch.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
pub enum MetaDescriptor {
    /// Any tree is acceptable.
    Any,
    /// A leaf of the given type.
    Leaf(LeafType),
    /// A struct with named, individually-described fields.
    Struct {
        fields: BTreeMap<String, MetaDescriptor>,
        /// Fields that must be present.
        required: Vec<String>,
    },
    /// A homogeneous list, described as children named `"0"`, `"1"`, ...
    List(Box<MetaDescriptor>),
}

/// Error produced when a [`Meta`] value does not conform to a
/// [`MetaDescriptor`].
#[derive(Clone, Debug, thiserror::Error, PartialEq)]
pub enum ValidationError {
    #[error("expected leaf of type {expected:?}, found {found}")]
    LeafTypeMismatch { expected: LeafType, found: String },
    #[error("expected a leaf value, found a struct")]
    ExpectedLeaf,
    #[error("expected a struct, found a leaf")]
    ExpectedStruct,
    #[error("missing required field {0:?}")]
    MissingField(String),
    #[error("field {field:?}: {source}")]
    Field {
        field: String,
        #[source]
        source: Box<ValidationError>,
    },
}

impl MetaDescriptor {
    /// Validate `value` against this descriptor.
    pub fn validate(&self, value: &Meta) -> Result<(), ValidationError> {
        match self {
            MetaDescriptor::Any => Ok(()),
            MetaDescriptor::Leaf(expected) => match &value.leaf {
                Some(leaf) if expected.matches(leaf) => Ok(()),
                Some(leaf) => Err(ValidationError::LeafTypeMismatch {
                    expected: *expected,
                    found: leaf.type_name().to_string(),
                }),
                None => Err(ValidationError::ExpectedLeaf),
            },
            MetaDescriptor::Struct { fields, required } => {
                if value.is_leaf() {
                    return Err(ValidationError::ExpectedStruct);
                }
                for name in required {
                    if !value.children.contains_key(name) {
                        return Err(ValidationError::MissingField(name.clone()));
                    }
                }
                for (name, descriptor) in fields {
                    if let Some(child) = value.children.get(name) {
                        descriptor.validate(child).map_err(|source| ValidationError::Field {
                            field: name.clone(),
                            source: Box::new(source),
                        })?;
                    }
                }
                Ok(())
            }
            MetaDescriptor::List(item) => {
                if value.is_leaf() {
                    return Err(ValidationError::ExpectedStruct);
                }
                for (key, child) in &value.children {
                    item.validate(child).map_err(|source| ValidationError::Field {
                        field: key.clone(),
                        source: Box::new(source),
                    })?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_round_trip_leaf() {
        let m = Meta::leaf(42i64);
        let json = m.to_json();
        assert_eq!(Meta::from_json(&json), m);
    }

    #[test]
    fn json_round_trip_struct() {
        let m = Meta::struct_of([
            ("x", Meta::leaf(1.5)),
            ("label", Meta::leaf("setpoint")),
            ("enabled", Meta::leaf(true)),
        ]);
        let json = m.to_json();
        assert_eq!(Meta::from_json(&json), m);
    }

    #[test]
    fn equality_ignores_insertion_order() {
        let a = Meta::struct_of([("a", Meta::leaf(1i64)), ("b", Meta::leaf(2i64))]);
        let b = Meta::struct_of([("b", Meta::leaf(2i64)), ("a", Meta::leaf(1i64))]);
        assert_eq!(a, b);
    }

    #[test]
    fn descriptor_validates_struct() {
        let descriptor = MetaDescriptor::Struct {
            fields: BTreeMap::from([
                ("setpoint".to_string(), MetaDescriptor::Leaf(LeafType::Double)),
            ]),
            required: vec!["setpoint".to_string()],
        };
        let ok = Meta::struct_of([("setpoint", Meta::leaf(42.0))]);
        assert!(descriptor.validate(&ok).is_ok());

        let missing = Meta::empty();
        assert_eq!(
            descriptor.validate(&missing),
            Err(ValidationError::MissingField("setpoint".to_string()))
        );

        let wrong_type = Meta::struct_of([("setpoint", Meta::leaf("oops"))]);
        assert!(descriptor.validate(&wrong_type).is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_json_round_trip(s in ".{0,16}", n in -1000i64..1000, b in proptest::bool::ANY) {
            let m = Meta::struct_of([
                ("s", Meta::leaf(s)),
                ("n", Meta::leaf(n)),
                ("b", Meta::leaf(b)),
            ]);
            let json = m.to_json();
            proptest::prop_assert_eq!(Meta::from_json(&json), m);
        }
    }
}
