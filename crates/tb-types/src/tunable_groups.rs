//! Ordered collection of covariant tunable groups.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::covariant_group::{CovariantGroupSpec, CovariantTunableGroup, TunableMap};
use crate::errors::{TbResult, TunableError};
use crate::snapshot::TunableSnapshot;
use crate::tunable::{Tunable, TunableValue};

/// All tunables of an experiment, partitioned into covariant groups.
///
/// Tunable names are unique across every group, so values can be addressed
/// by name alone. Equality and hashing only look at the flattened
/// name -> value projection.
#[derive(Debug, Clone, Default)]
pub struct TunableGroups {
    groups: Vec<CovariantTunableGroup>,
    /// tunable name -> index into `groups`
    index: HashMap<String, usize>,
}

impl TunableGroups {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `{ "<group>": { "cost": N, "params": { "<name>": {...} } } }`.
    pub fn from_json(config: &Value) -> TbResult<Self> {
        let specs: BTreeMap<String, CovariantGroupSpec> = serde_json::from_value(config.clone())?;
        let mut groups = Self::new();
        for (name, spec) in &specs {
            groups.add_group(CovariantTunableGroup::from_spec(name.clone(), spec)?)?;
        }
        Ok(groups)
    }

    pub fn to_json(&self) -> Value {
        let specs: BTreeMap<&str, CovariantGroupSpec> = self
            .groups
            .iter()
            .map(|g| (g.name(), g.spec()))
            .collect();
        serde_json::to_value(specs).unwrap_or(Value::Null)
    }

    /// Stable fingerprint of the tunable definitions (not the values).
    pub fn schema_hash(&self) -> String {
        let digest = Sha256::digest(self.to_json().to_string().as_bytes());
        format!("sha256:{digest:x}")
    }

    pub fn with_group(mut self, group: CovariantTunableGroup) -> Result<Self, TunableError> {
        self.add_group(group)?;
        Ok(self)
    }

    pub fn add_group(&mut self, group: CovariantTunableGroup) -> Result<(), TunableError> {
        if let Some(name) = group.names().find(|n| self.index.contains_key(*n)) {
            return Err(TunableError::DuplicateTunable {
                name: name.to_string(),
            });
        }
        if self.group(group.name()).is_some() {
            return Err(TunableError::InvalidTunable {
                name: group.name().to_string(),
                message: "covariant group already present".to_string(),
            });
        }
        let idx = self.groups.len();
        for name in group.names() {
            self.index.insert(name.to_string(), idx);
        }
        self.groups.push(group);
        Ok(())
    }

    /// Union with another collection. Groups already present must have the
    /// same definition; new groups are appended.
    pub fn merge(&mut self, other: &TunableGroups) -> Result<&mut Self, TunableError> {
        for group in &other.groups {
            match self.group(group.name()) {
                Some(existing) if existing.same_shape(group) => continue,
                Some(_) => {
                    return Err(TunableError::InvalidTunable {
                        name: group.name().to_string(),
                        message: "conflicting definitions of covariant group".to_string(),
                    })
                }
                None => self.add_group(group.clone())?,
            }
        }
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(CovariantTunableGroup::name).collect()
    }

    pub fn groups(&self) -> impl Iterator<Item = &CovariantTunableGroup> {
        self.groups.iter()
    }

    pub fn group(&self, name: &str) -> Option<&CovariantTunableGroup> {
        self.groups.iter().find(|g| g.name() == name)
    }

    fn group_index(&self, name: &str) -> Result<usize, TunableError> {
        self.groups
            .iter()
            .position(|g| g.name() == name)
            .ok_or_else(|| TunableError::UnknownGroup {
                name: name.to_string(),
            })
    }

    /// Iterate over every tunable together with its covariant group.
    pub fn iter(&self) -> impl Iterator<Item = (&Tunable, &CovariantTunableGroup)> {
        self.groups
            .iter()
            .flat_map(|g| g.tunables().map(move |t| (t, g)))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn get_tunable(&self, name: &str) -> Result<(&Tunable, &CovariantTunableGroup), TunableError> {
        let group = self
            .index
            .get(name)
            .map(|idx| &self.groups[*idx])
            .ok_or_else(|| TunableError::UnknownTunable {
                name: name.to_string(),
            })?;
        let tunable = group
            .get_tunable(name)
            .ok_or_else(|| TunableError::UnknownTunable {
                name: name.to_string(),
            })?;
        Ok((tunable, group))
    }

    pub fn get(&self, name: &str) -> Result<&TunableValue, TunableError> {
        Ok(self.get_tunable(name)?.0.value())
    }

    /// Set a single tunable. Returns `true` if the value changed.
    pub fn set(&mut self, name: &str, value: impl Into<TunableValue>) -> Result<bool, TunableError> {
        let idx = *self.index.get(name).ok_or_else(|| TunableError::UnknownTunable {
            name: name.to_string(),
        })?;
        self.groups[idx].set(name, &value.into())
    }

    /// Apply a flat name -> value map. Every entry is validated before any
    /// value is changed, so a failing call leaves the collection untouched.
    /// Tunables not named in `values` keep their current value.
    pub fn assign<'a, I>(&mut self, values: I) -> Result<&mut Self, TunableError>
    where
        I: IntoIterator<Item = (&'a String, &'a TunableValue)>,
    {
        let mut validated = Vec::new();
        for (name, value) in values {
            let idx = *self.index.get(name.as_str()).ok_or_else(|| TunableError::UnknownTunable {
                name: name.clone(),
            })?;
            let value = self.groups[idx].validate(name, value)?;
            validated.push((idx, name.as_str(), value));
        }
        for (idx, name, value) in validated {
            self.groups[idx].set_validated(name, value);
        }
        Ok(self)
    }

    /// Restricted copy containing only the named covariant groups.
    pub fn subgroup<S: AsRef<str>>(&self, group_names: &[S]) -> Result<TunableGroups, TunableError> {
        let mut tunables = TunableGroups::new();
        for name in group_names {
            let idx = self.group_index(name.as_ref())?;
            tunables.add_group(self.groups[idx].clone())?;
        }
        Ok(tunables)
    }

    /// Current values of every tunable.
    pub fn values(&self) -> TunableMap {
        self.groups.iter().flat_map(|g| g.values()).collect()
    }

    /// Current values of the tunables in the named groups.
    pub fn values_in<S: AsRef<str>>(&self, group_names: &[S]) -> Result<TunableMap, TunableError> {
        let mut values = TunableMap::new();
        for name in group_names {
            let idx = self.group_index(name.as_ref())?;
            values.extend(self.groups[idx].values());
        }
        Ok(values)
    }

    pub fn is_updated(&self) -> bool {
        self.groups.iter().any(CovariantTunableGroup::is_updated)
    }

    pub fn is_updated_in<S: AsRef<str>>(&self, group_names: &[S]) -> Result<bool, TunableError> {
        let mut updated = false;
        for name in group_names {
            updated |= self.groups[self.group_index(name.as_ref())?].is_updated();
        }
        Ok(updated)
    }

    /// Mark the current values of every group as deployed.
    pub fn reset(&mut self) -> &mut Self {
        for group in &mut self.groups {
            group.reset();
        }
        self
    }

    pub fn reset_groups<S: AsRef<str>>(&mut self, group_names: &[S]) -> Result<&mut Self, TunableError> {
        let indices = group_names
            .iter()
            .map(|name| self.group_index(name.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        for idx in indices {
            self.groups[idx].reset();
        }
        Ok(self)
    }

    /// Sum of the costs of all updated groups.
    pub fn total_cost(&self) -> u64 {
        self.groups.iter().map(CovariantTunableGroup::cost).sum()
    }

    pub fn is_defaults(&self) -> bool {
        self.groups.iter().all(CovariantTunableGroup::is_defaults)
    }

    pub fn restore_defaults(&mut self) -> &mut Self {
        for group in &mut self.groups {
            group.restore_defaults();
        }
        self
    }

    /// Frozen copy of the current values.
    pub fn snapshot(&self) -> TunableSnapshot {
        TunableSnapshot::new(self.values())
    }
}

impl PartialEq for TunableGroups {
    fn eq(&self, other: &Self) -> bool {
        self.snapshot() == other.snapshot()
    }
}

impl Eq for TunableGroups {}

impl Hash for TunableGroups {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.snapshot().hash(state);
    }
}

impl fmt::Display for TunableGroups {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let items: Vec<String> = self
            .iter()
            .map(|(tunable, group)| format!("{}::{}={}", group.name(), tunable.name(), tunable.value()))
            .collect();
        write!(f, "{{ {} }}", items.join(", "))
    }
}
