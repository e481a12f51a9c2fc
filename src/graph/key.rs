//! Composite ownership keys.
//!
//! A shared child record (one tool referenced by two agents) must resolve to
//! one binding per parent. The composite key is the unordered set of ancestor
//! ids that identifies a join slot: `{agent}` owns `{agent, tool}` owns
//! `{agent, tool, datasource}`, and so on.

use std::collections::BTreeSet;
use std::fmt;

use crate::records::RecordId;

/// Unordered set of ancestor identifiers. Two records occupy the same join
/// slot iff their keys are equal as sets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositeKey(BTreeSet<RecordId>);

impl CompositeKey {
    /// Key of a root record: the singleton set of its own id.
    pub fn singleton(id: impl Into<RecordId>) -> Self {
        let mut set = BTreeSet::new();
        set.insert(id.into());
        Self(set)
    }

    /// This key extended with one more ancestor id. Idempotent.
    pub fn with(&self, id: impl Into<RecordId>) -> Self {
        let mut set = self.0.clone();
        set.insert(id.into());
        Self(set)
    }

    /// Set union of two keys. Commutative and idempotent.
    pub fn union(&self, other: &CompositeKey) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.0.contains(id)
    }

    /// Subordinate lookup: a child belongs to a parent when the child's key
    /// contains every id in the parent's key.
    pub fn is_superset(&self, parent: &CompositeKey) -> bool {
        self.0.is_superset(&parent.0)
    }

    pub fn intersection_len(&self, other: &CompositeKey) -> usize {
        self.0.intersection(&other.0).count()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &RecordId> {
        self.0.iter()
    }
}

impl fmt::Display for CompositeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, id) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{id}")?;
        }
        write!(f, "}}")
    }
}

impl FromIterator<RecordId> for CompositeKey {
    fn from_iter<T: IntoIterator<Item = RecordId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}
