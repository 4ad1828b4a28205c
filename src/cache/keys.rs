//! Cache key definitions.
//!
//! A [`CacheKey`] is an ordered sequence of primitive segments such as
//! `["admin", "articles", "all"]`. Keys form a hierarchy: a shorter key is the
//! prefix of every key that extends it, and invalidating the prefix reaches the
//! whole family.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One element of a [`CacheKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeySegment {
    Int(i64),
    Str(String),
}

impl fmt::Display for KeySegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(value) => write!(f, "{value}"),
            Self::Str(value) => f.write_str(value),
        }
    }
}

impl From<&str> for KeySegment {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

impl From<String> for KeySegment {
    fn from(value: String) -> Self {
        Self::Str(value)
    }
}

impl From<&String> for KeySegment {
    fn from(value: &String) -> Self {
        Self::Str(value.clone())
    }
}

impl From<i64> for KeySegment {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for KeySegment {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<u32> for KeySegment {
    fn from(value: u32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<Uuid> for KeySegment {
    fn from(value: Uuid) -> Self {
        Self::Str(value.to_string())
    }
}

/// Identifies a cacheable resource.
///
/// Two keys are equal iff their segments are element-wise equal. The derived
/// ordering is lexicographic over segments, so every key that starts with a
/// given prefix sorts into one contiguous run directly after the prefix
/// itself. [`CacheStore`](super::CacheStore) relies on this for prefix scans.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct CacheKey(Vec<KeySegment>);

impl CacheKey {
    pub fn new(segments: Vec<KeySegment>) -> Self {
        Self(segments)
    }

    /// The empty key; it prefixes every key.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Returns a new key extended by one segment.
    pub fn child(&self, segment: impl Into<KeySegment>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }

    /// Returns the key without its last segment, or `None` for the root.
    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.0.split_last()?;
        Some(Self(head.to_vec()))
    }

    /// True when `prefix` is equal to, or an ancestor of, this key.
    pub fn starts_with(&self, prefix: &CacheKey) -> bool {
        self.0.starts_with(&prefix.0)
    }

    pub fn segments(&self) -> &[KeySegment] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (index, segment) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{segment}")?;
        }
        f.write_str("]")
    }
}

impl<S: Into<KeySegment>, const N: usize> From<[S; N]> for CacheKey {
    fn from(segments: [S; N]) -> Self {
        segments.into_iter().collect()
    }
}

impl<S: Into<KeySegment>> FromIterator<S> for CacheKey {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Builds a [`CacheKey`] from heterogeneous segments.
///
/// ```
/// use lectern::cache_key;
///
/// let key = cache_key!["admin", "sessions", 42];
/// assert_eq!(key.to_string(), "[admin, sessions, 42]");
/// ```
#[macro_export]
macro_rules! cache_key {
    ($($segment:expr),* $(,)?) => {
        $crate::cache::CacheKey::new(vec![$($crate::cache::KeySegment::from($segment)),*])
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_element_wise() {
        let a = CacheKey::from(["admin", "articles", "all"]);
        let b = cache_key!["admin", "articles", "all"];
        assert_eq!(a, b);

        assert_ne!(a, CacheKey::from(["admin", "articles"]));
        assert_ne!(cache_key!["x", 1], cache_key!["x", "1"]);
    }

    #[test]
    fn prefix_matching() {
        let prefix = CacheKey::from(["admin", "articles"]);

        assert!(CacheKey::from(["admin", "articles", "all"]).starts_with(&prefix));
        assert!(CacheKey::from(["admin", "articles", "123"]).starts_with(&prefix));
        assert!(prefix.starts_with(&prefix));
        assert!(!CacheKey::from(["admin", "categories"]).starts_with(&prefix));
        assert!(!CacheKey::from(["admin"]).starts_with(&prefix));
        assert!(prefix.starts_with(&CacheKey::root()));
    }

    #[test]
    fn prefixed_keys_sort_contiguously() {
        let mut keys = vec![
            cache_key!["admin", "categories"],
            cache_key!["admin", "articles", "all"],
            cache_key!["admin"],
            cache_key!["admin", "articles", 7],
            cache_key!["admin", "articles"],
            cache_key!["public", "blog"],
        ];
        keys.sort();

        let prefix = cache_key!["admin", "articles"];
        let positions: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, key)| key.starts_with(&prefix))
            .map(|(index, _)| index)
            .collect();

        assert_eq!(positions.len(), 3);
        assert_eq!(positions[2] - positions[0], 2);
        assert_eq!(keys[positions[0]], prefix);
    }

    #[test]
    fn child_and_parent() {
        let list = CacheKey::from(["admin", "formations"]).child("all");
        assert_eq!(list, cache_key!["admin", "formations", "all"]);
        assert_eq!(list.parent(), Some(cache_key!["admin", "formations"]));
        assert_eq!(CacheKey::root().parent(), None);
    }

    #[test]
    fn serializes_as_json_array() {
        let key = cache_key!["admin", "sessions", 12];
        let json = serde_json::to_string(&key).expect("serialize key");
        assert_eq!(json, r#"["admin","sessions",12]"#);

        let parsed: CacheKey = serde_json::from_str(&json).expect("deserialize key");
        assert_eq!(parsed, key);
    }
}
