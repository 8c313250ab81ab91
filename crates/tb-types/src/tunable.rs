//! Tunable parameter definitions and their current values.
//!
//! A [`Tunable`] is built from a declarative [`TunableSpec`] and validated
//! once at construction. Values are only changed through the owning
//! [`crate::CovariantTunableGroup`], which keeps the reconfiguration flag in
//! sync.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

use crate::errors::TunableError;

/// Declared type of a tunable parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TunableType {
    Int,
    Float,
    Categorical,
}

impl TunableType {
    pub fn as_str(self) -> &'static str {
        match self {
            TunableType::Int => "int",
            TunableType::Float => "float",
            TunableType::Categorical => "categorical",
        }
    }
}

impl fmt::Display for TunableType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A concrete tunable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TunableValue {
    Int(i64),
    Float(f64),
    Categorical(String),
}

impl TunableValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(v) => Some(*v as f64),
            Self::Float(v) => Some(*v),
            Self::Categorical(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Categorical(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Int(_) => "int",
            Self::Float(_) => "float",
            Self::Categorical(_) => "categorical",
        }
    }

    /// Canonical text form used for content hashing and persistence.
    ///
    /// Floats always carry a fractional part (`1.0`, never `1`) so an int and
    /// a float with the same magnitude never collide.
    pub fn canonical(&self) -> String {
        match self {
            Self::Int(v) => v.to_string(),
            Self::Float(v) => format!("{v:?}"),
            Self::Categorical(s) => s.clone(),
        }
    }
}

impl fmt::Display for TunableValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Categorical(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for TunableValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for TunableValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for TunableValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<&str> for TunableValue {
    fn from(v: &str) -> Self {
        Self::Categorical(v.to_string())
    }
}

impl From<String> for TunableValue {
    fn from(v: String) -> Self {
        Self::Categorical(v)
    }
}

/// Floats below this magnitude convert to `i64` without loss.
const I64_EXACT_LIMIT: f64 = 9_007_199_254_740_992.0;

/// The set of values a tunable may take.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Domain {
    /// Inclusive integer range plus out-of-range sentinel values.
    Int {
        low: i64,
        high: i64,
        #[serde(default)]
        special: Vec<i64>,
    },
    /// Inclusive float range plus out-of-range sentinel values.
    Float {
        low: f64,
        high: f64,
        #[serde(default)]
        special: Vec<f64>,
    },
    /// Enumerated canonical strings.
    Categorical { values: Vec<String> },
}

impl Domain {
    pub fn tunable_type(&self) -> TunableType {
        match self {
            Domain::Int { .. } => TunableType::Int,
            Domain::Float { .. } => TunableType::Float,
            Domain::Categorical { .. } => TunableType::Categorical,
        }
    }

    /// Range membership only, special values excluded.
    pub fn in_range(&self, value: &TunableValue) -> bool {
        match (self, value) {
            (Domain::Int { low, high, .. }, TunableValue::Int(v)) => low <= v && v <= high,
            (Domain::Float { low, high, .. }, TunableValue::Float(v)) => *low <= *v && *v <= *high,
            _ => false,
        }
    }

    pub fn is_special(&self, value: &TunableValue) -> bool {
        match (self, value) {
            (Domain::Int { special, .. }, TunableValue::Int(v)) => special.contains(v),
            (Domain::Float { special, .. }, TunableValue::Float(v)) => special.contains(v),
            _ => false,
        }
    }

    pub fn contains(&self, value: &TunableValue) -> bool {
        match (self, value) {
            (Domain::Categorical { values }, TunableValue::Categorical(s)) => values.contains(s),
            _ => self.in_range(value) || self.is_special(value),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Domain::Int { low, high, special } if special.is_empty() => write!(f, "[{low}, {high}]"),
            Domain::Int { low, high, special } => write!(f, "[{low}, {high}] or {special:?}"),
            Domain::Float { low, high, special } if special.is_empty() => {
                write!(f, "[{low}, {high}]")
            }
            Domain::Float { low, high, special } => write!(f, "[{low}, {high}] or {special:?}"),
            Domain::Categorical { values } => write!(f, "{{{}}}", values.join(", ")),
        }
    }
}

/// Declarative description of a tunable, as found in tunable config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TunableSpec {
    #[serde(rename = "type")]
    pub kind: TunableType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub default: TunableValue,
    /// Inclusive bounds. Integer tunables keep their bounds as exact
    /// integers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<[TunableValue; 2]>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<TunableValue>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub special: Vec<TunableValue>,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub meta: serde_json::Map<String, serde_json::Value>,
}

impl TunableSpec {
    pub fn int(default: i64, low: i64, high: i64) -> Self {
        Self::numeric(TunableType::Int, TunableValue::Int(default), [low.into(), high.into()])
    }

    pub fn float(default: f64, low: f64, high: f64) -> Self {
        Self::numeric(TunableType::Float, TunableValue::Float(default), [low.into(), high.into()])
    }

    pub fn categorical<S: Into<String>>(
        default: impl Into<String>,
        values: impl IntoIterator<Item = S>,
    ) -> Self {
        Self {
            kind: TunableType::Categorical,
            description: None,
            default: TunableValue::Categorical(default.into()),
            range: None,
            values: Some(
                values
                    .into_iter()
                    .map(|v| TunableValue::Categorical(v.into()))
                    .collect(),
            ),
            special: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }

    pub fn with_special<V: Into<TunableValue>>(mut self, special: impl IntoIterator<Item = V>) -> Self {
        self.special = special.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn numeric(kind: TunableType, default: TunableValue, range: [TunableValue; 2]) -> Self {
        Self {
            kind,
            description: None,
            default,
            range: Some(range),
            values: None,
            special: Vec::new(),
            meta: serde_json::Map::new(),
        }
    }
}

/// A tunable parameter definition together with its current value.
#[derive(Debug, Clone, PartialEq)]
pub struct Tunable {
    name: String,
    description: Option<String>,
    domain: Domain,
    default: TunableValue,
    value: TunableValue,
    meta: serde_json::Map<String, serde_json::Value>,
}

fn invalid(name: &str, message: impl Into<String>) -> TunableError {
    TunableError::InvalidTunable {
        name: name.to_string(),
        message: message.into(),
    }
}

impl Tunable {
    /// Build a tunable from its declarative spec. The current value starts at
    /// the default.
    pub fn new(name: impl Into<String>, spec: &TunableSpec) -> Result<Self, TunableError> {
        let name = name.into();
        if name.is_empty() || name.contains('!') {
            return Err(invalid(&name, "name must be non-empty and must not contain '!'"));
        }

        let domain = Self::build_domain(&name, spec)?;
        let mut tunable = Self {
            name,
            description: spec.description.clone(),
            domain,
            default: spec.default.clone(),
            value: spec.default.clone(),
            meta: spec.meta.clone(),
        };

        let default = tunable
            .validate(&spec.default)
            .map_err(|e| invalid(&tunable.name, format!("invalid default: {e}")))?;
        tunable.default = default.clone();
        tunable.value = default;
        Ok(tunable)
    }

    fn build_domain(name: &str, spec: &TunableSpec) -> Result<Domain, TunableError> {
        match spec.kind {
            TunableType::Categorical => {
                if spec.range.is_some() {
                    return Err(invalid(name, "categorical tunable cannot have a range"));
                }
                if !spec.special.is_empty() {
                    return Err(invalid(name, "categorical tunable cannot have special values"));
                }
                let values: Vec<String> = spec
                    .values
                    .as_ref()
                    .filter(|values| !values.is_empty())
                    .ok_or_else(|| invalid(name, "categorical tunable needs a non-empty value list"))?
                    .iter()
                    .map(TunableValue::canonical)
                    .collect();
                let unique: HashSet<&String> = values.iter().collect();
                if unique.len() != values.len() {
                    return Err(invalid(name, "categorical values must be unique"));
                }
                Ok(Domain::Categorical { values })
            }
            TunableType::Int | TunableType::Float => {
                if spec.values.is_some() {
                    return Err(invalid(name, "numerical tunable cannot have a value list"));
                }
                let [low, high] = spec
                    .range
                    .as_ref()
                    .ok_or_else(|| invalid(name, "numerical tunable needs a range"))?;

                if spec.kind == TunableType::Float {
                    let bound = |v: &TunableValue| {
                        v.as_f64()
                            .ok_or_else(|| invalid(name, format!("non-numeric range bound {v}")))
                    };
                    let (low, high) = (bound(low)?, bound(high)?);
                    if !(low < high) {
                        return Err(invalid(name, format!("invalid range [{low}, {high}]")));
                    }
                    let special = spec
                        .special
                        .iter()
                        .map(|v| {
                            v.as_f64()
                                .ok_or_else(|| invalid(name, format!("non-numeric special value {v}")))
                        })
                        .collect::<Result<Vec<_>, _>>()?;
                    return Ok(Domain::Float { low, high, special });
                }

                let whole = |v: &TunableValue, what: &str| match v {
                    TunableValue::Int(i) => Ok(*i),
                    TunableValue::Float(f) if f.fract() == 0.0 && f.abs() < I64_EXACT_LIMIT => Ok(*f as i64),
                    other => Err(invalid(name, format!("non-integer {what} {other}"))),
                };
                let (low, high) = (whole(low, "range bound")?, whole(high, "range bound")?);
                if low >= high {
                    return Err(invalid(name, format!("invalid range [{low}, {high}]")));
                }
                let special = spec
                    .special
                    .iter()
                    .map(|v| whole(v, "special value"))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Domain::Int { low, high, special })
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn tunable_type(&self) -> TunableType {
        self.domain.tunable_type()
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    pub fn default_value(&self) -> &TunableValue {
        &self.default
    }

    pub fn value(&self) -> &TunableValue {
        &self.value
    }

    pub fn meta(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.meta
    }

    pub fn is_default(&self) -> bool {
        self.value == self.default
    }

    pub fn is_special(&self) -> bool {
        self.domain.is_special(&self.value)
    }

    /// Numeric bounds, `None` for categoricals.
    pub fn range(&self) -> Option<(f64, f64)> {
        match &self.domain {
            Domain::Int { low, high, .. } => Some((*low as f64, *high as f64)),
            Domain::Float { low, high, .. } => Some((*low, *high)),
            Domain::Categorical { .. } => None,
        }
    }

    pub fn categories(&self) -> Option<&[String]> {
        match &self.domain {
            Domain::Categorical { values } => Some(values),
            _ => None,
        }
    }

    /// Convert a raw value into this tunable's declared type without checking
    /// the domain.
    pub fn coerce(&self, value: &TunableValue) -> Result<TunableValue, TunableError> {
        let mismatch = || TunableError::TypeMismatch {
            name: self.name.clone(),
            expected: self.tunable_type().to_string(),
            actual: format!("{} {value}", value.type_name()),
        };

        match (&self.domain, value) {
            (Domain::Categorical { .. }, v) => Ok(TunableValue::Categorical(v.canonical())),
            (Domain::Int { .. }, TunableValue::Int(v)) => Ok(TunableValue::Int(*v)),
            // Floats are accepted only when no precision is lost.
            (Domain::Int { .. }, TunableValue::Float(f)) if f.fract() == 0.0 && f.abs() < I64_EXACT_LIMIT => {
                Ok(TunableValue::Int(*f as i64))
            }
            (Domain::Int { .. }, TunableValue::Categorical(s)) => s
                .trim()
                .parse::<i64>()
                .map(TunableValue::Int)
                .map_err(|_| mismatch()),
            (Domain::Float { .. }, TunableValue::Int(v)) => Ok(TunableValue::Float(*v as f64)),
            (Domain::Float { .. }, TunableValue::Float(f)) => Ok(TunableValue::Float(*f)),
            (Domain::Float { .. }, TunableValue::Categorical(s)) => s
                .trim()
                .parse::<f64>()
                .map(TunableValue::Float)
                .map_err(|_| mismatch()),
            _ => Err(mismatch()),
        }
    }

    /// Coerce and domain-check a candidate value.
    pub fn validate(&self, value: &TunableValue) -> Result<TunableValue, TunableError> {
        let coerced = self.coerce(value)?;
        if self.domain.contains(&coerced) {
            Ok(coerced)
        } else {
            Err(TunableError::OutOfDomain {
                name: self.name.clone(),
                value: value.to_string(),
                domain: self.domain.to_string(),
            })
        }
    }

    pub fn is_valid(&self, value: &TunableValue) -> bool {
        self.validate(value).is_ok()
    }

    /// Store an already validated value. Returns `true` if the value changed.
    pub(crate) fn set_validated(&mut self, value: TunableValue) -> bool {
        let changed = value != self.value;
        self.value = value;
        changed
    }

    /// Current value mapped onto `[0, 1]`. Special values are clamped.
    pub fn normalized(&self) -> f64 {
        match &self.domain {
            Domain::Categorical { values } => {
                if values.len() <= 1 {
                    return 0.0;
                }
                let current = self.value.canonical();
                let idx = values.iter().position(|v| *v == current).unwrap_or(0);
                idx as f64 / (values.len() - 1) as f64
            }
            _ => {
                let (low, high) = self.range().unwrap_or((0.0, 1.0));
                let v = self.value.as_f64().unwrap_or(low);
                ((v - low) / (high - low)).clamp(0.0, 1.0)
            }
        }
    }

    /// Rebuild the declarative spec this tunable was created from.
    pub fn spec(&self) -> TunableSpec {
        let (range, values, special) = match &self.domain {
            Domain::Int { low, high, special } => (
                Some([TunableValue::Int(*low), TunableValue::Int(*high)]),
                None,
                special.iter().map(|v| TunableValue::Int(*v)).collect(),
            ),
            Domain::Float { low, high, special } => (
                Some([TunableValue::Float(*low), TunableValue::Float(*high)]),
                None,
                special.iter().map(|v| TunableValue::Float(*v)).collect(),
            ),
            Domain::Categorical { values } => (
                None,
                Some(
                    values
                        .iter()
                        .map(|v| TunableValue::Categorical(v.clone()))
                        .collect(),
                ),
                Vec::new(),
            ),
        };
        TunableSpec {
            kind: self.tunable_type(),
            description: self.description.clone(),
            default: self.default.clone(),
            range,
            values,
            special,
            meta: self.meta.clone(),
        }
    }
}

impl fmt::Display for Tunable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}]({}:{})={}",
            self.name,
            self.tunable_type(),
            self.domain,
            self.default,
            self.value
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_tunable_starts_at_default() {
        let t = Tunable::new("rootfs_readahead_kb", &TunableSpec::int(128, 0, 4096)).unwrap();
        assert_eq!(t.value(), &TunableValue::Int(128));
        assert!(t.is_default());
        assert_eq!(t.tunable_type(), TunableType::Int);
    }

    #[test]
    fn invalid_definitions_are_rejected() {
        let bad_range = TunableSpec::int(5, 10, 1);
        assert!(matches!(
            Tunable::new("x", &bad_range),
            Err(TunableError::InvalidTunable { .. })
        ));

        let bad_default = TunableSpec::float(2.0, 0.0, 1.0);
        assert!(Tunable::new("x", &bad_default).is_err());

        let dup_values = TunableSpec::categorical("a", ["a", "a"]);
        assert!(Tunable::new("x", &dup_values).is_err());

        assert!(Tunable::new("bad!name", &TunableSpec::int(1, 0, 2)).is_err());
    }

    #[test]
    fn special_values_bypass_range() {
        let spec = TunableSpec::int(10, 1, 100).with_special([-1i64, 0]);
        let t = Tunable::new("vm.swappiness", &spec).unwrap();
        assert_eq!(t.validate(&TunableValue::Int(-1)).unwrap(), TunableValue::Int(-1));
        assert!(matches!(
            t.validate(&TunableValue::Int(-2)),
            Err(TunableError::OutOfDomain { .. })
        ));
        assert!(matches!(
            t.validate(&TunableValue::Int(101)),
            Err(TunableError::OutOfDomain { .. })
        ));
    }

    #[test]
    fn int_rejects_precision_loss() {
        let t = Tunable::new("n", &TunableSpec::int(1, 0, 10)).unwrap();
        assert_eq!(t.validate(&TunableValue::Float(3.0)).unwrap(), TunableValue::Int(3));
        assert!(matches!(
            t.validate(&TunableValue::Float(3.5)),
            Err(TunableError::TypeMismatch { .. })
        ));
        assert_eq!(t.validate(&"7".into()).unwrap(), TunableValue::Int(7));
    }

    #[test]
    fn large_int_bounds_stay_exact() {
        let high = (1i64 << 60) + 1;
        let json = serde_json::json!({"type": "int", "default": 0, "range": [0, high]});
        let spec: TunableSpec = serde_json::from_value(json).unwrap();
        let t = Tunable::new("bytes", &spec).unwrap();

        assert_eq!(t.domain(), &Domain::Int { low: 0, high, special: Vec::new() });
        assert!(t.is_valid(&TunableValue::Int(high)));
        assert!(!t.is_valid(&TunableValue::Int(high + 1)));
        assert_eq!(t.spec().range, Some([TunableValue::Int(0), TunableValue::Int(high)]));

        // Float bounds past 2^53 are not exact integers.
        let lossy = serde_json::json!({"type": "int", "default": 0, "range": [0, 1_152_921_504_606_846_976.0_f64]});
        let spec: TunableSpec = serde_json::from_value(lossy).unwrap();
        assert!(Tunable::new("bytes", &spec).is_err());
    }

    #[test]
    fn categorical_values_are_canonical_strings() {
        let spec = TunableSpec {
            values: Some(vec![TunableValue::Int(1), TunableValue::Int(2), "off".into()]),
            default: TunableValue::Int(1),
            ..TunableSpec::categorical("1", ["1"])
        };
        let t = Tunable::new("mode", &spec).unwrap();
        assert_eq!(t.value(), &TunableValue::Categorical("1".into()));
        assert_eq!(t.categories().unwrap(), &["1", "2", "off"]);
        assert_eq!(
            t.validate(&TunableValue::Int(2)).unwrap(),
            TunableValue::Categorical("2".into())
        );
    }

    #[test]
    fn normalized_maps_to_unit_interval() {
        let mut t = Tunable::new("x", &TunableSpec::float(0.5, 0.0, 2.0)).unwrap();
        assert!((t.normalized() - 0.25).abs() < 1e-12);
        t.set_validated(TunableValue::Float(2.0));
        assert!((t.normalized() - 1.0).abs() < 1e-12);

        let c = Tunable::new("c", &TunableSpec::categorical("b", ["a", "b", "c"])).unwrap();
        assert!((c.normalized() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn spec_round_trips_through_json() {
        let spec = TunableSpec::int(50, 0, 100)
            .with_special([-1i64])
            .with_description("idle percentage");
        let t = Tunable::new("idle", &spec).unwrap();
        let json = serde_json::to_value(t.spec()).unwrap();
        let back: TunableSpec = serde_json::from_value(json).unwrap();
        let rebuilt = Tunable::new("idle", &back).unwrap();
        assert_eq!(rebuilt, t);
    }

    #[test]
    fn canonical_float_keeps_fraction() {
        assert_eq!(TunableValue::Float(1.0).canonical(), "1.0");
        assert_eq!(TunableValue::Int(1).canonical(), "1");
        assert_eq!(TunableValue::Float(0.1).canonical(), "0.1");
    }
}
