//! Snapshot comparison.
//!
//! Works out which capabilities of which object kinds differ between the
//! snapshot that was last applied and a newly received one. The result drives
//! application: one adapter call per changed capability, nothing else.

use crate::kind::{Capability, ObjectKind};
use crate::snapshot::{CategoryData, Snapshot};
use std::collections::{BTreeMap, BTreeSet};

/// Per object kind, the capabilities that need to be (re-)applied.
///
/// Kinds without changes are never present, so [`is_empty`](Self::is_empty)
/// is a reliable "nothing to do".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet(BTreeMap<ObjectKind, BTreeSet<Capability>>);

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, kind: ObjectKind) -> Option<&BTreeSet<Capability>> {
        self.0.get(&kind)
    }

    pub fn contains(&self, kind: ObjectKind, capability: Capability) -> bool {
        self.0.get(&kind).is_some_and(|caps| caps.contains(&capability))
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectKind, &BTreeSet<Capability>)> {
        self.0.iter().map(|(kind, caps)| (*kind, caps))
    }

    /// Total number of capability changes across every kind.
    pub fn len(&self) -> usize {
        self.0.values().map(BTreeSet::len).sum()
    }

    /// Merges `other` into `self`.
    pub fn extend(&mut self, other: &ChangeSet) {
        for (kind, caps) in other.iter() {
            self.0.entry(kind).or_default().extend(caps.iter().copied());
        }
    }

    fn insert(&mut self, kind: ObjectKind, capabilities: BTreeSet<Capability>) {
        if !capabilities.is_empty() {
            self.0.entry(kind).or_default().extend(capabilities);
        }
    }
}

/// Computes what changed between `old` and `new`.
///
/// A capability is changed when `force` is set, when its data differs from
/// `old`, or when `old` has nothing for that object kind. Kinds that vanished
/// from `new` report everything they used to carry, so it gets cleared.
///
/// If both snapshots have the same content hash and `force` is off, nothing
/// is compared at all.
pub fn compare(new: &Snapshot, old: Option<&Snapshot>, force: bool) -> ChangeSet {
    let mut changes = ChangeSet::default();
    if !force && old.is_some_and(|old| old.content_hash() == new.content_hash()) {
        return changes;
    }
    let kinds: BTreeSet<ObjectKind> =
        new.categories().map(|(k, _)| k).chain(old.into_iter().flat_map(|o| o.categories().map(|(k, _)| k))).collect();
    for kind in kinds {
        let current = new.category(kind);
        let previous = old.and_then(|o| o.category(kind));
        changes.insert(kind, compare_category(current, previous, force));
    }
    tracing::trace!(changes = changes.len(), force, "compared snapshots");
    changes
}

fn compare_category(new: Option<&CategoryData>, old: Option<&CategoryData>, force: bool) -> BTreeSet<Capability> {
    let (new, old) = match (new, old) {
        (None, None) => return BTreeSet::new(),
        (Some(new), None) => return new.capabilities(),
        (None, Some(old)) => return old.capabilities(),
        (Some(new), Some(old)) if force => {
            return new.capabilities().union(&old.capabilities()).copied().collect();
        },
        (Some(new), Some(old)) => (new, old),
    };
    let mut changed = BTreeSet::new();
    if new.files != old.files {
        changed.insert(Capability::ModFiles);
    }
    for capability in Capability::ALL.into_iter().filter(|c| c.carries_blob()) {
        if new.blob(capability) != old.blob(capability) {
            changed.insert(capability);
        }
    }
    if changed.iter().any(|c| c.requires_redraw()) {
        changed.insert(Capability::ForcedRedraw);
    }
    changed
}
