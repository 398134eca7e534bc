//! Ordered add/remove changesets and the batched sync that applies them.

use std::collections::HashSet;

use indexmap::{IndexMap, IndexSet};

use crate::identity::ResourceIdentity;

/// A pending membership change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeOp {
    Add,
    Remove,
}

impl ChangeOp {
    fn opposite(self) -> Self {
        match self {
            ChangeOp::Add => ChangeOp::Remove,
            ChangeOp::Remove => ChangeOp::Add,
        }
    }
}

/// Pending membership changes for one collection, in arrival order.
///
/// An op followed by its opposite for the same identity cancels out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    ops: IndexMap<ResourceIdentity, ChangeOp>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, identity: ResourceIdentity) -> bool {
        self.record(identity, ChangeOp::Add)
    }

    pub fn remove(&mut self, identity: ResourceIdentity) -> bool {
        self.record(identity, ChangeOp::Remove)
    }

    /// Queue `op`, collapsing it against a pending opposite op.
    ///
    /// Returns whether the changeset changed.
    pub fn record(&mut self, identity: ResourceIdentity, op: ChangeOp) -> bool {
        match self.ops.get(&identity) {
            Some(&pending) if pending == op.opposite() => {
                self.ops.shift_remove(&identity);
                true
            }
            Some(_) => false,
            None => {
                self.ops.insert(identity, op);
                true
            }
        }
    }

    pub fn get(&self, identity: &ResourceIdentity) -> Option<ChangeOp> {
        self.ops.get(identity).copied()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceIdentity, ChangeOp)> {
        self.ops.iter().map(|(identity, op)| (identity, *op))
    }

    /// Take every pending op, leaving the changeset empty.
    pub fn take(&mut self) -> ChangeSet {
        std::mem::take(self)
    }

    /// Append another changeset's ops in order, collapsing as usual.
    pub fn extend(&mut self, other: ChangeSet) {
        for (identity, op) in other.ops {
            self.record(identity, op);
        }
    }
}

impl IntoIterator for ChangeSet {
    type Item = (ResourceIdentity, ChangeOp);
    type IntoIter = indexmap::map::IntoIter<ResourceIdentity, ChangeOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

/// What a sync did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub added: usize,
    pub removed: usize,
}

impl SyncSummary {
    pub fn is_noop(&self) -> bool {
        self.added == 0 && self.removed == 0
    }
}

/// Apply a changeset to a collection's backing buffer and membership set.
///
/// The buffer is mutated in place and never replaced. Removes are located
/// by index; when they cover every current item the buffer is truncated in
/// one step. Adds are appended with [`push_batched`].
pub fn sync_items(
    items: &mut Vec<ResourceIdentity>,
    members: &mut HashSet<ResourceIdentity>,
    changes: ChangeSet,
    batch_size: usize,
) -> SyncSummary {
    let mut adds = Vec::new();
    let mut removes = IndexSet::new();
    for (identity, op) in changes {
        match op {
            ChangeOp::Add if !members.contains(&identity) => adds.push(identity),
            ChangeOp::Remove if members.contains(&identity) => {
                removes.insert(identity);
            }
            _ => {}
        }
    }

    let removed = removes.len();
    if removed > 0 {
        if removed == items.len() {
            items.clear();
            members.clear();
        } else {
            for identity in &removes {
                if let Some(index) = items.iter().position(|item| item == identity) {
                    items.remove(index);
                }
                members.remove(identity);
            }
        }
    }

    let added = adds.len();
    if added > 0 {
        members.extend(adds.iter().cloned());
        push_batched(items, &adds, batch_size);
    }

    SyncSummary { added, removed }
}

/// Append `source` to `target` in fixed-size chunks.
pub fn push_batched<T: Clone>(target: &mut Vec<T>, source: &[T], batch_size: usize) {
    target.reserve(source.len());
    for chunk in source.chunks(batch_size.max(1)) {
        target.extend_from_slice(chunk);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{IdentityRegistry, ResourceRef};
    use pretty_assertions::assert_eq;

    fn users(n: usize) -> Vec<ResourceIdentity> {
        let registry = IdentityRegistry::default();
        (0..n)
            .map(|i| registry.get_or_create(&ResourceRef::new("user", i.to_string())))
            .collect()
    }

    #[test]
    fn test_opposite_ops_cancel() {
        let u = users(2);
        let mut changes = ChangeSet::new();

        assert!(changes.add(u[0].clone()));
        assert!(changes.remove(u[0].clone()));
        assert!(changes.is_empty());

        assert!(changes.remove(u[1].clone()));
        assert!(!changes.remove(u[1].clone()));
        assert!(changes.add(u[1].clone()));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_changeset_keeps_arrival_order() {
        let u = users(3);
        let mut changes = ChangeSet::new();
        changes.add(u[2].clone());
        changes.add(u[0].clone());
        changes.remove(u[1].clone());

        let order: Vec<_> = changes.iter().map(|(i, op)| (i.clone(), op)).collect();
        assert_eq!(
            order,
            vec![
                (u[2].clone(), ChangeOp::Add),
                (u[0].clone(), ChangeOp::Add),
                (u[1].clone(), ChangeOp::Remove)
            ]
        );
    }

    #[test]
    fn test_sync_applies_adds_and_removes() {
        let u = users(4);
        let mut items = Vec::new();
        let mut members = HashSet::new();

        let mut changes = ChangeSet::new();
        for identity in &u {
            changes.add(identity.clone());
        }
        let summary = sync_items(&mut items, &mut members, changes, 2);
        assert_eq!(summary, SyncSummary { added: 4, removed: 0 });
        assert_eq!(items, u);

        let mut changes = ChangeSet::new();
        changes.remove(u[1].clone());
        changes.add(u[0].clone());
        let summary = sync_items(&mut items, &mut members, changes, 2);
        assert_eq!(summary, SyncSummary { added: 0, removed: 1 });
        assert_eq!(items, vec![u[0].clone(), u[2].clone(), u[3].clone()]);
    }

    #[test]
    fn test_sync_is_idempotent() {
        let u = users(3);
        let mut changes = ChangeSet::new();
        changes.add(u[0].clone());
        changes.add(u[1].clone());
        changes.remove(u[2].clone());

        let mut once = Vec::new();
        let mut once_members = HashSet::new();
        sync_items(&mut once, &mut once_members, changes.clone(), 1200);

        let mut twice = Vec::new();
        let mut twice_members = HashSet::new();
        sync_items(&mut twice, &mut twice_members, changes.clone(), 1200);
        let second = sync_items(&mut twice, &mut twice_members, changes, 1200);

        assert!(second.is_noop());
        assert_eq!(once, twice);
        assert_eq!(once_members, twice_members);
    }

    #[test]
    fn test_remove_all_truncates() {
        let u = users(5);
        let mut items = u.clone();
        let mut members: HashSet<_> = u.iter().cloned().collect();
        let capacity = items.capacity();

        let mut changes = ChangeSet::new();
        for identity in u.iter().rev() {
            changes.remove(identity.clone());
        }
        let summary = sync_items(&mut items, &mut members, changes, 1200);

        assert_eq!(summary.removed, 5);
        assert_eq!(items.len(), 0);
        assert!(members.is_empty());
        assert_eq!(items.capacity(), capacity);
    }

    #[test]
    fn test_push_batched_preserves_order() {
        let source: Vec<u32> = (0..10_007).collect();
        let mut target = vec![u32::MAX];
        push_batched(&mut target, &source, 1200);

        assert_eq!(target.len(), 10_008);
        assert_eq!(&target[1..], &source[..]);
    }
}
