//! Frozen, content-addressed tunable snapshots.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::covariant_group::TunableMap;
use crate::tunable::TunableValue;

/// Immutable name -> value map captured from a [`crate::TunableGroups`].
///
/// There is no mutable access once built, so the content hash computed from
/// the canonical form stays valid for the lifetime of the value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TunableSnapshot {
    values: BTreeMap<String, TunableValue>,
}

impl TunableSnapshot {
    pub fn new(values: TunableMap) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<&TunableValue> {
        self.values.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TunableValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Owned, mutable copy of the values.
    pub fn to_map(&self) -> TunableMap {
        self.values.clone()
    }

    /// JSON object of `name -> [type, value]` with sorted keys. Names and
    /// categorical values are escaped, so distinct snapshots never share a
    /// canonical form.
    pub fn canonical(&self) -> String {
        let entries: serde_json::Map<String, serde_json::Value> = self
            .values
            .iter()
            .map(|(name, value)| (name.clone(), serde_json::json!([value.type_name(), value.canonical()])))
            .collect();
        serde_json::Value::Object(entries).to_string()
    }

    /// `sha256:<hex>` digest of the canonical form.
    pub fn content_hash(&self) -> String {
        let digest = Sha256::digest(self.canonical().as_bytes());
        format!("sha256:{digest:x}")
    }
}

impl PartialEq for TunableSnapshot {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for TunableSnapshot {}

impl Hash for TunableSnapshot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl FromIterator<(String, TunableValue)> for TunableSnapshot {
    fn from_iter<T: IntoIterator<Item = (String, TunableValue)>>(iter: T) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a TunableSnapshot {
    type Item = (&'a String, &'a TunableValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, TunableValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}

impl fmt::Display for TunableSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        write!(f, "{{{}}}", items.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn snap(pairs: &[(&str, TunableValue)]) -> TunableSnapshot {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn hash_ignores_insertion_order() {
        let a = snap(&[("b", TunableValue::Int(2)), ("a", "x".into())]);
        let b = snap(&[("a", "x".into()), ("b", TunableValue::Int(2))]);
        assert_eq!(a, b);
        assert_eq!(a.content_hash(), b.content_hash());
        assert!(a.content_hash().starts_with("sha256:"));

        let set: HashSet<TunableSnapshot> = [a, b].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn int_and_float_do_not_collide() {
        let a = snap(&[("x", TunableValue::Int(1))]);
        let b = snap(&[("x", TunableValue::Float(1.0))]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn separators_inside_values_do_not_collide() {
        let a = snap(&[("a", "x\nb=y".into())]);
        let b = snap(&[("a", "x".into()), ("b", "y".into())]);
        assert_ne!(a, b);
        assert_ne!(a.content_hash(), b.content_hash());

        let c = snap(&[("a=b", "c".into())]);
        let d = snap(&[("a", "b=c".into())]);
        assert_ne!(c.content_hash(), d.content_hash());
    }

    #[test]
    fn int_and_numeric_category_do_not_collide() {
        let a = snap(&[("x", TunableValue::Int(1))]);
        let b = snap(&[("x", "1".into())]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn serializes_as_plain_map() {
        let s = snap(&[("threads", TunableValue::Int(8)), ("mode", "fast".into())]);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json, serde_json::json!({"mode": "fast", "threads": 8}));
        let back: TunableSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, s);
    }
}
