//! Structural cache keys and scope matching.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// One element of a cache key.
///
/// Object params are stored in a `BTreeMap`, so two requests built from the
/// same fields in a different order produce equal keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Text(String),
  List(Vec<KeyPart>),
  Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
  /// Normalize a JSON value into a key part.
  ///
  /// Null members of objects are dropped so an absent filter and an explicit
  /// `null` filter key the same request. Non-integer numbers keep their
  /// textual form.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => Self::Null,
      Value::Bool(b) => Self::Bool(*b),
      Value::Number(n) => match n.as_i64() {
        Some(i) => Self::Int(i),
        None => Self::Text(n.to_string()),
      },
      Value::String(s) => Self::Text(s.clone()),
      Value::Array(items) => Self::List(items.iter().map(Self::from_json).collect()),
      Value::Object(fields) => Self::Map(
        fields
          .iter()
          .filter(|(_, v)| !v.is_null())
          .map(|(k, v)| (k.clone(), Self::from_json(v)))
          .collect(),
      ),
    }
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    Self::Text(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    Self::Text(s)
  }
}

impl From<i64> for KeyPart {
  fn from(i: i64) -> Self {
    Self::Int(i)
  }
}

impl From<u64> for KeyPart {
  fn from(i: u64) -> Self {
    i64::try_from(i).map(Self::Int).unwrap_or_else(|_| Self::Text(i.to_string()))
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    Self::Bool(b)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Null => write!(f, "null"),
      Self::Bool(b) => write!(f, "{}", b),
      Self::Int(i) => write!(f, "{}", i),
      Self::Text(s) => write!(f, "{}", s),
      Self::List(items) => {
        write!(f, "[")?;
        for (i, item) in items.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}", item)?;
        }
        write!(f, "]")
      }
      Self::Map(fields) => {
        write!(f, "{{")?;
        for (i, (k, v)) in fields.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}={}", k, v)?;
        }
        write!(f, "}}")
      }
    }
  }
}

/// An ordered `(domain, operation, params…)` tuple identifying a cached result.
///
/// A key also acts as a scope: every key it is a prefix of falls under it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
  /// Start a key (or scope) for a resource domain.
  pub fn new(domain: &str) -> Self {
    Self(vec![KeyPart::from(domain)])
  }

  /// Append a part.
  pub fn push(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  /// Append serialized request params as a normalized map part.
  pub fn with_params(mut self, params: &impl Serialize) -> Self {
    let value = serde_json::to_value(params).unwrap_or_default();
    self.0.push(KeyPart::from_json(&value));
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// The first part, when it is textual.
  pub fn domain(&self) -> Option<&str> {
    match self.0.first() {
      Some(KeyPart::Text(s)) => Some(s),
      _ => None,
    }
  }

  /// Whether this key falls under `scope`.
  pub fn starts_with(&self, scope: &CacheKey) -> bool {
    self.0.starts_with(&scope.0)
  }

  /// Stable fixed-length identifier, used as the persistent storage key.
  pub fn fingerprint(&self) -> String {
    let canonical = serde_json::to_string(&self.0).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, "/")?;
      }
      write!(f, "{}", part)?;
    }
    Ok(())
  }
}
