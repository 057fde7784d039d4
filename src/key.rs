//! Canonical keys for query arguments.
//!
//! Arguments are reduced to plain data with `serde_json`, normalized, and
//! written out in a deterministic form. Two argument sets produce the same
//! [`CanonicalKey`] exactly when they are deep-equal after normalization:
//!
//! - object key order is irrelevant;
//! - an object entry whose value is `null` is treated as not provided, so
//!   `None` fields and missing fields produce the same key;
//! - array elements keep their position, including `null` elements.

use std::collections::BTreeMap;
use std::fmt;
use std::fmt::Write as _;

use serde::ser::Error as _;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::KeyError;

/// Deterministic string form of a normalized argument map.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalKey(String);

impl CanonicalKey {
    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Consume the key, returning the inner string.
    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Debug for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CanonicalKey({})", self.0)
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// An ordered map of named arguments.
///
/// Any `Serialize` value that serializes to a map can be used as arguments;
/// this type is a convenience for building them ad hoc.
///
/// ```ignore
/// let vars = Variables::new().with("id", 1).with_opt("after", None::<String>);
/// assert_eq!(canonicalize(&vars)?, canonicalize(&Variables::new().with("id", 1))?);
/// ```
///
/// An argument that fails to serialize is remembered, and the whole map then
/// fails to canonicalize with [`KeyError::NotPlainData`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Variables {
    entries: BTreeMap<String, Value>,
    /// First serialization failure, reported when the map is serialized.
    error: Option<String>,
}

impl Variables {
    /// Create an empty argument map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an argument, builder style.
    pub fn with(mut self, name: impl Into<String>, value: impl Serialize) -> Self {
        self.insert(name, value);
        self
    }

    /// Add an argument only if it is `Some`.
    pub fn with_opt<T: Serialize>(self, name: impl Into<String>, value: Option<T>) -> Self {
        match value {
            Some(value) => self.with(name, value),
            None => self,
        }
    }

    /// Insert an argument, returning the previous value if any.
    ///
    /// If `value` fails to serialize, nothing is inserted and the failure is
    /// kept until the map is canonicalized.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Serialize) -> Option<Value> {
        let name = name.into();
        match serde_json::to_value(value) {
            Ok(value) => self.entries.insert(name, value),
            Err(error) => {
                self.error
                    .get_or_insert_with(|| format!("argument `{name}`: {error}"));
                None
            }
        }
    }

    /// Get an argument by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(name)
    }

    /// Number of arguments, including ones set to `null`.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no arguments were set.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The first argument that failed to serialize, if any.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}

impl Serialize for Variables {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match &self.error {
            Some(message) => Err(S::Error::custom(message)),
            None => self.entries.serialize(serializer),
        }
    }
}

/// Normalize arguments to plain data.
///
/// The result is always an object. `null` object entries are removed at
/// every depth; a top-level `null` (e.g. `()` or `None`) becomes the empty map.
pub fn normalize(args: &impl Serialize) -> Result<Value, KeyError> {
    match serde_json::to_value(args)? {
        Value::Null => Ok(Value::Object(Map::new())),
        value @ Value::Object(_) => Ok(strip_nulls(value)),
        other => Err(KeyError::NotAMap {
            found: kind_of(&other),
        }),
    }
}

/// Compute the canonical key for a set of arguments.
pub fn canonicalize(args: &impl Serialize) -> Result<CanonicalKey, KeyError> {
    let normalized = normalize(args)?;
    Ok(canonicalize_value(&normalized))
}

/// Whether two argument sets map to the same canonical key.
pub fn same_key(a: &impl Serialize, b: &impl Serialize) -> Result<bool, KeyError> {
    Ok(canonicalize(a)? == canonicalize(b)?)
}

/// Canonical key of an already normalized value.
pub(crate) fn canonicalize_value(value: &Value) -> CanonicalKey {
    let mut out = String::new();
    write_canonical(value, &mut out);
    CanonicalKey(out)
}

fn strip_nulls(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k, strip_nulls(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(strip_nulls).collect()),
        other => other,
    }
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().filter(|(_, v)| !v.is_null()).collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(k, out);
                out.push(':');
                write_canonical(v, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::String(s) => write_string(s, out),
        Value::Null => out.push_str("null"),
        Value::Bool(b) => {
            let _ = write!(out, "{b}");
        }
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    if let Ok(quoted) = serde_json::to_string(s) {
        out.push_str(&quoted);
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
