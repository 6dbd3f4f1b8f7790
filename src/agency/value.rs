use crate::encoding;
use crate::errinput;
use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A document value. This is a JSON value, with integers and floats kept
/// apart so that integer counters stay exact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub enum Value {
    /// A JSON null.
    #[default]
    Null,
    /// A boolean.
    Bool(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit floating point number.
    Float(f64),
    /// A UTF-8 string.
    String(String),
    /// An ordered array of values.
    Array(Vec<Value>),
    /// An object. Keys are ordered, so equality is insensitive to the order
    /// keys were inserted in.
    Object(BTreeMap<String, Value>),
}

impl encoding::Value for Value {}

/// Integers and floats compare equal when they hold the same number. This
/// carries through arrays and objects.
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Null, Self::Null) => true,
            (Self::Bool(a), Self::Bool(b)) => a == b,
            (Self::Integer(a), Self::Integer(b)) => a == b,
            (Self::Float(a), Self::Float(b)) => a == b,
            (Self::Integer(a), Self::Float(b)) | (Self::Float(b), Self::Integer(a)) => {
                *a as f64 == *b
            }
            (Self::String(a), Self::String(b)) => a == b,
            (Self::Array(a), Self::Array(b)) => a == b,
            (Self::Object(a), Self::Object(b)) => a == b,
            (_, _) => false,
        }
    }
}

impl Value {
    /// Returns the value as a float, if it is a number.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns true if the value is an array.
    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    /// Adds two values numerically. Non-numeric values count as 0. Integers
    /// stay integers unless the sum overflows, in which case it becomes a
    /// float.
    pub fn add(&self, other: &Value) -> Value {
        let zero = Value::Integer(0);
        let lhs = if self.as_f64().is_some() { self } else { &zero };
        let rhs = if other.as_f64().is_some() { other } else { &zero };
        match (lhs, rhs) {
            (Self::Integer(a), Self::Integer(b)) => match a.checked_add(*b) {
                Some(sum) => Value::Integer(sum),
                None => Value::Float(*a as f64 + *b as f64),
            },
            (a, b) => Value::Float(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)),
        }
    }

    /// Negates a number. Non-numeric values count as 0.
    pub fn negate(&self) -> Value {
        match self {
            Self::Integer(i) => match i.checked_neg() {
                Some(n) => Value::Integer(n),
                None => Value::Float(-(*i as f64)),
            },
            Self::Float(f) => Value::Float(-f),
            _ => Value::Integer(0),
        }
    }

    /// Parses a value from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str::<serde_json::Value>(json)?.into())
    }

    /// Formats the value as compact JSON text.
    pub fn to_json(&self) -> String {
        serde_json::Value::from(self.clone()).to_string()
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.to_json())
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Self::Null,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Integer(i),
                None => Self::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Array(a) => Self::Array(a.into_iter().map(Self::from).collect()),
            serde_json::Value::Object(o) => {
                Self::Object(o.into_iter().map(|(k, v)| (k, Self::from(v))).collect())
            }
        }
    }
}

/// JSON can't represent NaN or infinite floats, which become null.
impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Integer(i) => Self::Number(i.into()),
            Value::Float(f) => serde_json::Number::from_f64(f).map_or(Self::Null, Self::Number),
            Value::String(s) => Self::String(s),
            Value::Array(a) => Self::Array(a.into_iter().map(Self::from).collect()),
            Value::Object(o) => Self::Object(o.into_iter().map(|(k, v)| (k, Self::from(v))).collect()),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Integer(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Integer(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(v: Vec<V>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

/// A path into the document tree, e.g. /arango/Plan/Collections. Paths are
/// slash-delimited, and empty segments are ignored, so /a//b/ is /a/b. The
/// empty path (or /) addresses the root.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Path(Vec<String>);

impl encoding::Value for Path {}

impl Path {
    /// Returns the root path.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns the path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns true if this is the root path.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns the parent path and the last segment, or None for the root.
    pub fn split_last(&self) -> Option<(&[String], &String)> {
        self.0.split_last().map(|(last, parents)| (parents, last))
    }

    /// Returns a child path.
    pub fn join(&self, segment: &str) -> Self {
        let mut child = self.clone();
        child.0.extend(Self::from(segment).0);
        child
    }
}

impl From<&str> for Path {
    fn from(path: &str) -> Self {
        Self(path.split('/').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect())
    }
}

impl From<String> for Path {
    fn from(path: String) -> Self {
        Self::from(path.as_str())
    }
}

impl From<&Path> for Path {
    fn from(path: &Path) -> Self {
        path.clone()
    }
}

impl std::str::FromStr for Path {
    type Err = Error;

    /// Parses a path. Unlike From, this rejects paths that aren't absolute,
    /// which catches typos in user input.
    fn from_str(path: &str) -> Result<Self> {
        if !path.starts_with('/') {
            return errinput!("path {path} must start with /");
        }
        Ok(Self::from(path))
    }
}

impl std::fmt::Display for Path {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.0 {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn equality() {
        assert_eq!(Value::Integer(3), Value::Float(3.0));
        assert_ne!(Value::Integer(3), Value::Float(3.5));
        assert_ne!(Value::Integer(1), Value::Bool(true));
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_eq!(
            Value::from_json(r#"{"a": 1, "b": [1, 2.0]}"#).ok(),
            Value::from_json(r#"{"b": [1.0, 2], "a": 1.0}"#).ok(),
        );
        assert_ne!(Value::from(vec![1i64, 2]), Value::from(vec![2i64, 1]));
    }

    #[test]
    fn add() {
        assert_eq!(Value::Integer(2).add(&Value::Integer(3)), Value::Integer(5));
        assert!(matches!(Value::Integer(2).add(&Value::Integer(3)), Value::Integer(5)));
        assert!(matches!(Value::Integer(2).add(&Value::Float(0.5)), Value::Float(f) if f == 2.5));
        assert!(matches!(Value::Null.add(&Value::Integer(1)), Value::Integer(1)));
        assert!(matches!(Value::from("x").add(&Value::Integer(1)), Value::Integer(1)));
        assert!(matches!(Value::Integer(i64::MAX).add(&Value::Integer(1)), Value::Float(_)));
        assert!(matches!(Value::Integer(i64::MIN).negate(), Value::Float(_)));
        assert!(matches!(Value::Integer(4).negate(), Value::Integer(-4)));
    }

    #[test]
    fn json() -> Result<()> {
        let value = Value::from_json(r#"{"a": [1, 2.5, "x", null, true], "b": {}}"#)?;
        assert_eq!(value.to_json(), r#"{"a":[1,2.5,"x",null,true],"b":{}}"#);
        assert_eq!(Value::Float(f64::INFINITY).to_json(), "null");
        assert!(Value::from_json("{").is_err());
        Ok(())
    }

    #[test]
    fn path() -> Result<()> {
        assert_eq!(Path::from("/a//b/").segments(), ["a", "b"]);
        assert_eq!(Path::from("/a/b"), Path::from("a/b"));
        assert!(Path::from("/").is_root());
        assert!(Path::from("").is_root());
        assert_eq!(Path::root().to_string(), "/");
        assert_eq!(Path::from("a/b").to_string(), "/a/b");
        assert_eq!(Path::from("/a").join("b/c"), Path::from("/a/b/c"));
        assert_eq!("/a/b".parse::<Path>()?, Path::from("/a/b"));
        assert!("a/b".parse::<Path>().is_err());
        Ok(())
    }
}
