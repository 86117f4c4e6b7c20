//! Opaque structured values carried by widget changes.
//!
//! A [`Value`] is a small closed document model: scalars, arrays and
//! string-keyed maps. It serializes as plain JSON (untagged), so clients
//! send ordinary objects and numbers. Maps are `BTreeMap`s, which keeps
//! merge output and serialized form reproducible.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// String-keyed map of values.
pub type ValueMap = BTreeMap<String, Value>;

/// A structured document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(ValueMap),
}

impl Value {
    /// Build a map value from `(key, value)` pairs.
    pub fn map<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Value)>,
    {
        Value::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn is_map(&self) -> bool {
        matches!(self, Value::Map(_))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Look up a key if this is a map.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Shallow merge: keys of `base` overlaid by keys of `top`.
    ///
    /// Returns `None` unless both sides are maps.
    pub fn shallow_merge(base: &Value, top: &Value) -> Option<Value> {
        let (base, top) = (base.as_map()?, top.as_map()?);
        let mut out = base.clone();
        for (k, v) in top {
            out.insert(k.clone(), v.clone());
        }
        Some(Value::Map(out))
    }

    /// Recursive merge of `top` into `base`.
    ///
    /// Nested maps merge key by key. Anything else on the `top` side
    /// (scalars, arrays, null) replaces the `base` value wholesale.
    pub fn deep_merge(base: &Value, top: &Value) -> Value {
        match (base, top) {
            (Value::Map(b), Value::Map(t)) => {
                let mut out = b.clone();
                for (k, tv) in t {
                    let merged = match out.get(k) {
                        Some(bv) => Value::deep_merge(bv, tv),
                        None => tv.clone(),
                    };
                    out.insert(k.clone(), merged);
                }
                Value::Map(out)
            }
            _ => top.clone(),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
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

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}
