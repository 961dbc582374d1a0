//! Property groups: validated value storage for one General, Layer or Pedal

use std::fmt;

use super::descriptor::{table, GroupKind, PropertyDescriptor, SiblingValues, Validator};
use super::value::Value;

/// Stable address of a group inside a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupAddress {
    General,
    Layer(usize),
    /// (layer, pedal)
    Pedal(usize, usize),
}

impl GroupAddress {
    pub fn kind(&self) -> GroupKind {
        match self {
            GroupAddress::General => GroupKind::General,
            GroupAddress::Layer(_) => GroupKind::Layer,
            GroupAddress::Pedal(..) => GroupKind::Pedal,
        }
    }

    /// The group that carries the `pending_init` flag for this address
    pub fn init_owner(&self) -> GroupAddress {
        match *self {
            GroupAddress::Pedal(l, _) => GroupAddress::Layer(l),
            other => other,
        }
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupAddress::General => write!(f, "general"),
            GroupAddress::Layer(l) => write!(f, "layer {}", l),
            GroupAddress::Pedal(l, p) => write!(f, "layer {} pedal {}", l, p),
        }
    }
}

/// One atomic property change moving through a transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyChange {
    pub source: GroupAddress,
    pub name: String,
    pub value: Value,
}

/// Values of one group, always the validator output of the last accepted candidate
#[derive(Debug, Clone)]
pub struct PropertyGroup {
    address: GroupAddress,
    descriptors: &'static [PropertyDescriptor],
    values: Vec<Value>,
    /// Next outbound write for this group must be a full push
    pub pending_init: bool,
}

struct Siblings<'a>(&'a PropertyGroup);

impl SiblingValues for Siblings<'_> {
    fn sibling(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }
}

impl PropertyGroup {
    pub fn new(address: GroupAddress) -> Self {
        let descriptors = table(address.kind());
        Self {
            address,
            descriptors,
            values: descriptors.iter().map(|d| d.default.clone()).collect(),
            pending_init: false,
        }
    }

    pub fn address(&self) -> GroupAddress {
        self.address
    }

    fn index_of(&self, name: &str) -> Option<usize> {
        self.descriptors.iter().position(|d| d.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index_of(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.index_of(name).map(|i| &self.values[i])
    }

    /// Run the validator without storing
    pub fn validate(&self, name: &str, candidate: &Value) -> Option<Value> {
        let i = self.index_of(name)?;
        let d = &self.descriptors[i];
        Some(d.validator.validate(&Siblings(self), &self.values[i], candidate))
    }

    /// Validate and store. Returns the new value only when it differs from the stored one.
    ///
    /// Unknown names return `None` and leave the group untouched.
    pub fn set(&mut self, name: &str, candidate: &Value) -> Option<Value> {
        let i = self.index_of(name)?;
        let validated = self.validate(name, candidate)?;
        if self.values[i] == validated {
            return None;
        }
        self.values[i] = validated.clone();
        Some(validated)
    }

    /// Set several values at once, returning the ones that changed
    ///
    /// A lower range bound that would exceed the current upper bound is applied
    /// after its upper sibling, so a consistent pair is never distorted by
    /// clamping against the stale sibling.
    pub fn set_all(&mut self, values: Vec<(String, Value)>) -> Vec<(String, Value)> {
        let (mut deferred, mut ordered): (Vec<_>, Vec<_>) = (Vec::new(), Vec::new());
        for (name, value) in values {
            let defer = match self.index_of(&name).map(|i| self.descriptors[i].validator) {
                Some(Validator::RangeLower { upper }) => {
                    let current_upper = self.get(upper).map(Value::as_int).unwrap_or(127);
                    value.as_int() > current_upper
                }
                _ => false,
            };
            if defer {
                deferred.push((name, value));
            } else {
                ordered.push((name, value));
            }
        }
        ordered.extend(deferred);

        ordered
            .into_iter()
            .filter_map(|(name, value)| self.set(&name, &value).map(|v| (name, v)))
            .collect()
    }

    /// Restore every property to its declared default, returning the changes
    ///
    /// Defaults are stored as declared, without sibling clamping.
    pub fn reset(&mut self) -> Vec<(String, Value)> {
        let mut changed = Vec::new();
        for (d, v) in self.descriptors.iter().zip(self.values.iter_mut()) {
            if *v != d.default {
                *v = d.default.clone();
                changed.push((d.name.clone(), v.clone()));
            }
        }
        changed
    }

    /// All (name, value) pairs in declaration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.descriptors
            .iter()
            .map(|d| d.name.as_str())
            .zip(self.values.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clamps_and_reports_change() {
        let mut g = PropertyGroup::new(GroupAddress::Layer(0));
        assert_eq!(g.set("volume", &Value::Int(-5)), Some(Value::Int(0)));
        assert_eq!(g.get("volume"), Some(&Value::Int(0)));
        assert_eq!(g.set("volume", &Value::Int(200)), Some(Value::Int(127)));
        assert_eq!(g.set("volume", &Value::Int(300)), None);
    }

    #[test]
    fn test_noop_write_is_not_a_change() {
        let mut g = PropertyGroup::new(GroupAddress::Pedal(1, 2));
        assert_eq!(g.set("cc", &Value::Int(0)), None);
        assert_eq!(g.set("unknown", &Value::Int(1)), None);
    }

    #[test]
    fn test_range_lower_clamped_against_upper() {
        let mut g = PropertyGroup::new(GroupAddress::Layer(3));
        g.set("rangeu", &Value::Int(60));
        assert_eq!(g.set("rangel", &Value::Int(80)), Some(Value::Int(60)));
    }

    #[test]
    fn test_set_all_orders_range_pair() {
        let mut g = PropertyGroup::new(GroupAddress::Layer(0));
        let raised = g.set_all(vec![
            ("rangel".to_string(), Value::Int(110)),
            ("rangeu".to_string(), Value::Int(120)),
        ]);
        assert_eq!(raised.len(), 2);
        assert_eq!(g.get("rangel"), Some(&Value::Int(110)));
        assert_eq!(g.get("rangeu"), Some(&Value::Int(120)));

        g.set_all(vec![
            ("rangel".to_string(), Value::Int(10)),
            ("rangeu".to_string(), Value::Int(40)),
        ]);
        assert_eq!(g.get("rangel"), Some(&Value::Int(10)));
        assert_eq!(g.get("rangeu"), Some(&Value::Int(40)));
    }

    #[test]
    fn test_reset_restores_defaults() {
        let mut g = PropertyGroup::new(GroupAddress::Layer(1));
        g.set("volume", &Value::Int(5));
        g.set("program", &Value::from("bass"));
        g.set("rangel", &Value::Int(5));
        g.set("rangeu", &Value::Int(10));
        let changed = g.reset();
        assert_eq!(changed.len(), 4);
        assert_eq!(g.get("rangel"), Some(&Value::Int(21)));
        assert_eq!(g.get("program"), Some(&Value::from("piano")));
    }

    #[test]
    fn test_init_owner() {
        assert_eq!(GroupAddress::Pedal(4, 1).init_owner(), GroupAddress::Layer(4));
        assert_eq!(GroupAddress::General.init_owner(), GroupAddress::General);
    }
}
