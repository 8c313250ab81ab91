//! Covariant groups: tunables that share one reconfiguration cost.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::TunableError;
use crate::tunable::{Tunable, TunableSpec, TunableValue};

/// Flat name -> value projection of a set of tunables.
pub type TunableMap = BTreeMap<String, TunableValue>;

/// Declarative description of a covariant group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariantGroupSpec {
    #[serde(default)]
    pub cost: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub params: BTreeMap<String, TunableSpec>,
}

/// A named set of tunables. Changing any of them costs the same as changing
/// all of them.
///
/// The group remembers the values it had at the last [`reset`](Self::reset)
/// (the deployed baseline). It reports itself as updated while any tunable
/// differs from that baseline, and unconditionally before the first reset.
#[derive(Debug, Clone)]
pub struct CovariantTunableGroup {
    name: String,
    cost: u64,
    description: Option<String>,
    tunables: Vec<Tunable>,
    baseline: Option<TunableMap>,
}

impl CovariantTunableGroup {
    pub fn new(name: impl Into<String>, cost: u64) -> Self {
        Self {
            name: name.into(),
            cost,
            description: None,
            tunables: Vec::new(),
            baseline: None,
        }
    }

    pub fn from_spec(name: impl Into<String>, spec: &CovariantGroupSpec) -> Result<Self, TunableError> {
        let mut group = Self::new(name, spec.cost);
        group.description = spec.description.clone();
        for (param, param_spec) in &spec.params {
            group.add_tunable(Tunable::new(param.clone(), param_spec)?)?;
        }
        Ok(group)
    }

    /// Builder-style variant of [`add_tunable`](Self::add_tunable).
    pub fn with_param(mut self, name: impl Into<String>, spec: TunableSpec) -> Result<Self, TunableError> {
        self.add_tunable(Tunable::new(name, &spec)?)?;
        Ok(self)
    }

    pub fn add_tunable(&mut self, tunable: Tunable) -> Result<(), TunableError> {
        if self.contains(tunable.name()) {
            return Err(TunableError::DuplicateTunable {
                name: tunable.name().to_string(),
            });
        }
        self.tunables.push(tunable);
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tunables.iter().any(|t| t.name() == name)
    }

    pub fn get_tunable(&self, name: &str) -> Option<&Tunable> {
        self.tunables.iter().find(|t| t.name() == name)
    }

    pub fn tunables(&self) -> impl Iterator<Item = &Tunable> {
        self.tunables.iter()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tunables.iter().map(Tunable::name)
    }

    pub fn len(&self) -> usize {
        self.tunables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tunables.is_empty()
    }

    /// Current values of all tunables in the group.
    pub fn values(&self) -> TunableMap {
        self.tunables
            .iter()
            .map(|t| (t.name().to_string(), t.value().clone()))
            .collect()
    }

    pub fn is_updated(&self) -> bool {
        match &self.baseline {
            None => true,
            Some(baseline) => self
                .tunables
                .iter()
                .any(|t| baseline.get(t.name()) != Some(t.value())),
        }
    }

    /// Record the current values as the deployed baseline.
    pub fn reset(&mut self) {
        self.baseline = Some(self.values());
    }

    /// Reconfiguration cost given the current values: the group cost if any
    /// tunable moved off the baseline, zero otherwise.
    pub fn cost(&self) -> u64 {
        if self.is_updated() {
            self.cost
        } else {
            0
        }
    }

    pub fn declared_cost(&self) -> u64 {
        self.cost
    }

    /// Validate `value` for tunable `name` without changing anything.
    pub fn validate(&self, name: &str, value: &TunableValue) -> Result<TunableValue, TunableError> {
        self.get_tunable(name)
            .ok_or_else(|| TunableError::UnknownTunable {
                name: name.to_string(),
            })?
            .validate(value)
    }

    /// Set one tunable. Returns `true` if its value changed.
    pub fn set(&mut self, name: &str, value: &TunableValue) -> Result<bool, TunableError> {
        let validated = self.validate(name, value)?;
        Ok(self.set_validated(name, validated))
    }

    pub(crate) fn set_validated(&mut self, name: &str, value: TunableValue) -> bool {
        self.tunables
            .iter_mut()
            .find(|t| t.name() == name)
            .map(|t| t.set_validated(value))
            .unwrap_or(false)
    }

    pub fn is_defaults(&self) -> bool {
        self.tunables.iter().all(Tunable::is_default)
    }

    pub fn restore_defaults(&mut self) {
        for tunable in &mut self.tunables {
            let default = tunable.default_value().clone();
            tunable.set_validated(default);
        }
    }

    pub fn spec(&self) -> CovariantGroupSpec {
        CovariantGroupSpec {
            cost: self.cost,
            description: self.description.clone(),
            params: self
                .tunables
                .iter()
                .map(|t| (t.name().to_string(), t.spec()))
                .collect(),
        }
    }

    /// Same group name and the same tunable definitions (values ignored).
    pub fn same_shape(&self, other: &CovariantTunableGroup) -> bool {
        self.name == other.name && self.spec() == other.spec()
    }
}

impl PartialEq for CovariantTunableGroup {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.cost == other.cost && self.values() == other.values()
    }
}

impl fmt::Display for CovariantTunableGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tunables: Vec<String> = self.tunables.iter().map(ToString::to_string).collect();
        write!(f, "{}: [{}]", self.name, tunables.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kernel_group() -> CovariantTunableGroup {
        CovariantTunableGroup::new("kernel", 10)
            .with_param("sched_migration_cost_ns", TunableSpec::int(500_000, 0, 500_000).with_special([-1i64]))
            .unwrap()
            .with_param("sched_latency_ns", TunableSpec::int(2_000_000, 0, 1_000_000_000))
            .unwrap()
    }

    #[test]
    fn fresh_group_is_updated_until_reset() {
        let mut group = kernel_group();
        assert!(group.is_updated());
        assert_eq!(group.cost(), 10);

        group.reset();
        assert!(!group.is_updated());
        assert_eq!(group.cost(), 0);
    }

    #[test]
    fn assigning_current_value_does_not_flag_update() {
        let mut group = kernel_group();
        group.reset();

        let changed = group
            .set("sched_latency_ns", &TunableValue::Int(2_000_000))
            .unwrap();
        assert!(!changed);
        assert!(!group.is_updated());

        assert!(group.set("sched_latency_ns", &TunableValue::Int(1_000)).unwrap());
        assert!(group.is_updated());
    }

    #[test]
    fn out_of_domain_leaves_value_unchanged() {
        let mut group = kernel_group();
        group.reset();
        let err = group
            .set("sched_migration_cost_ns", &TunableValue::Int(600_000))
            .unwrap_err();
        assert!(matches!(err, TunableError::OutOfDomain { .. }));
        assert_eq!(group.values()["sched_migration_cost_ns"], TunableValue::Int(500_000));
        assert!(!group.is_updated());
    }

    #[test]
    fn duplicate_and_unknown_names() {
        let group = kernel_group();
        assert!(matches!(
            group
                .clone()
                .with_param("sched_latency_ns", TunableSpec::int(1, 0, 2)),
            Err(TunableError::DuplicateTunable { .. })
        ));
        assert!(matches!(
            group.validate("nope", &TunableValue::Int(1)),
            Err(TunableError::UnknownTunable { .. })
        ));
    }

    #[test]
    fn spec_rebuilds_same_shape() {
        let group = kernel_group();
        let rebuilt = CovariantTunableGroup::from_spec("kernel", &group.spec()).unwrap();
        assert!(group.same_shape(&rebuilt));
        assert_eq!(group, rebuilt);
    }
}
