use std::{
    collections::BTreeSet,
    fmt::{self, Display},
};

use serde::{Deserialize, Serialize};

/// An opaque causal identifier threaded through log events to correlate a
/// server session, envelope ingress, and the delivery attempts it spawned.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FlowId(String);

impl FlowId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An immutable set of [`FlowId`]s carried by value on records and events.
///
/// All operations are pure: they return a new set and leave the receiver
/// untouched, so a set shared across tasks can never be mutated under a
/// reader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flows(BTreeSet<FlowId>);

impl Flows {
    pub const fn none() -> Self {
        Self(BTreeSet::new())
    }

    pub fn of(id: FlowId) -> Self {
        Self(BTreeSet::from([id]))
    }

    #[must_use]
    pub fn extend(&self, id: FlowId) -> Self {
        let mut set = self.0.clone();
        set.insert(id);
        Self(set)
    }

    #[must_use]
    pub fn union(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn contains(&self, id: &FlowId) -> bool {
        self.0.contains(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowId> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Display for Flows {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            Display::fmt(id, f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_union_are_pure() {
        let a = Flows::of(FlowId::new("session-1"));
        let b = a.extend(FlowId::new("envelope-1"));

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 2);
        assert!(b.contains(&FlowId::new("session-1")));

        let c = Flows::of(FlowId::new("delivery-1"));
        let all = b.union(&c);
        assert_eq!(all.len(), 3);
        assert_eq!(b.len(), 2);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn display_is_sorted_and_comma_separated() {
        let flows = Flows::of(FlowId::new("b")).extend(FlowId::new("a"));
        assert_eq!(flows.to_string(), "a,b");
    }
}
