//! Structured cache keys.
//!
//! A key is an ordered list of parts, e.g. `["tasks", "list", {page: 2, userId: "7"}]`.
//! Two keys are equal when their parts are deeply equal in order, and a key
//! is a prefix of another when its parts are an ordered prefix. Prefixes are
//! what bulk operations (invalidate, cancel, snapshot) match on.

use std::collections::BTreeMap;
use std::fmt;

/// One segment of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  /// Named parameters; ordering of insertion does not matter
  Map(BTreeMap<String, KeyPart>),
}

impl KeyPart {
  /// Build a map part from `(name, value)` pairs.
  pub fn map<I, K, V>(entries: I) -> Self
  where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<KeyPart>,
  {
    KeyPart::Map(
      entries
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect(),
    )
  }
}

impl From<&str> for KeyPart {
  fn from(s: &str) -> Self {
    KeyPart::Str(s.to_string())
  }
}

impl From<String> for KeyPart {
  fn from(s: String) -> Self {
    KeyPart::Str(s)
  }
}

impl From<&String> for KeyPart {
  fn from(s: &String) -> Self {
    KeyPart::Str(s.clone())
  }
}

impl From<i64> for KeyPart {
  fn from(n: i64) -> Self {
    KeyPart::Int(n)
  }
}

impl From<u32> for KeyPart {
  fn from(n: u32) -> Self {
    KeyPart::Int(i64::from(n))
  }
}

impl From<bool> for KeyPart {
  fn from(b: bool) -> Self {
    KeyPart::Bool(b)
  }
}

impl<T: Into<KeyPart>> From<Option<T>> for KeyPart {
  fn from(value: Option<T>) -> Self {
    value.map(Into::into).unwrap_or(KeyPart::Null)
  }
}

impl fmt::Display for KeyPart {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeyPart::Null => write!(f, "null"),
      KeyPart::Bool(b) => write!(f, "{}", b),
      KeyPart::Int(n) => write!(f, "{}", n),
      KeyPart::Str(s) => write!(f, "{:?}", s),
      KeyPart::Map(m) => {
        write!(f, "{{")?;
        for (i, (k, v)) in m.iter().enumerate() {
          if i > 0 {
            write!(f, ",")?;
          }
          write!(f, "{}:{}", k, v)?;
        }
        write!(f, "}}")
      }
    }
  }
}

/// Identifier of a cache entry or mutation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(Vec<KeyPart>);

impl CacheKey {
  pub fn new(parts: Vec<KeyPart>) -> Self {
    Self(parts)
  }

  /// Start a key from its first part.
  pub fn root(part: impl Into<KeyPart>) -> Self {
    Self(vec![part.into()])
  }

  /// Extend the key with one more part.
  pub fn with(mut self, part: impl Into<KeyPart>) -> Self {
    self.0.push(part.into());
    self
  }

  pub fn parts(&self) -> &[KeyPart] {
    &self.0
  }

  /// True if `prefix`'s parts are an ordered prefix of this key's parts.
  /// Every key starts with itself and with the empty key.
  pub fn starts_with(&self, prefix: &CacheKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, part) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ",")?;
      }
      write!(f, "{}", part)?;
    }
    write!(f, "]")
  }
}

/// Build a [`CacheKey`] from anything convertible into [`KeyPart`]s.
///
/// ```
/// use taskq::cache_key;
/// let key = cache_key!["tasks", "list"];
/// assert_eq!(key.to_string(), r#"["tasks","list"]"#);
/// ```
#[macro_export]
macro_rules! cache_key {
  [$($part:expr),* $(,)?] => {
    $crate::query::CacheKey::new(vec![$($crate::query::KeyPart::from($part)),*])
  };
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_structural_equality() {
    let a = cache_key![
      "tasks",
      "list",
      KeyPart::map([("page", KeyPart::from(2u32)), ("userId", "7".into())])
    ];
    let b = cache_key![
      "tasks",
      "list",
      KeyPart::map([("userId", KeyPart::from("7")), ("page", 2u32.into())])
    ];
    assert_eq!(a, b);

    let c = cache_key!["tasks", "list", KeyPart::map([("page", 3u32)])];
    assert_ne!(a, c);
  }

  #[test]
  fn test_prefix_matching() {
    let root = cache_key!["tasks"];
    let list = cache_key!["tasks", "list", KeyPart::map([("page", 1u32)])];
    let users = cache_key!["users", "1"];

    assert!(list.starts_with(&root));
    assert!(list.starts_with(&list));
    assert!(!root.starts_with(&list));
    assert!(!users.starts_with(&root));
    assert!(users.starts_with(&CacheKey::default()));
  }

  #[test]
  fn test_order_matters() {
    assert_ne!(cache_key!["a", "b"], cache_key!["b", "a"]);
    assert!(!cache_key!["list", "tasks"].starts_with(&cache_key!["tasks"]));
  }

  #[test]
  fn test_display() {
    let key = cache_key!["tasks", KeyPart::map([("page", 1u32)]), None::<String>];
    assert_eq!(key.to_string(), r#"["tasks",{page:1},null]"#);
  }
}
