//! Adapter for resource-only caches.
//!
//! Older cache implementations know nothing about documents, structural
//! patches or relationship origins, and they do not notify. The adapter
//! supplies those on top of a [`LegacyCache`] so the rest of the store only
//! ever talks to [`Cache`]. It is chosen once when the store is built.

use std::collections::HashMap;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::cache::{
    Cache, CacheCapabilities, CacheDocument, DocumentData, EdgeOrigin, Mutation, Operation,
    RelationshipEdge, ResourceDocument,
};
use crate::identity::{DocumentIdentity, ResourceIdentity, ResourceRef};
use crate::notify::NotificationKind;
use crate::payload::{self, Primary};

/// A cache that only stores resources.
pub trait LegacyCache: Send + Sync {
    /// Merge a resource object. Returns changed attribute names when
    /// `calculate_changes` is set.
    fn push_data(&self, identity: &ResourceIdentity, data: &Value, calculate_changes: bool)
    -> Vec<String>;

    fn peek_data(&self, identity: &ResourceIdentity) -> Option<Value>;

    fn client_did_create(&self, identity: &ResourceIdentity, attributes: Map<String, Value>);

    fn set_dirty_attribute(&self, identity: &ResourceIdentity, field: &str, value: Value);

    fn set_is_deleted(&self, identity: &ResourceIdentity, deleted: bool);

    fn will_commit(&self, identity: &ResourceIdentity);

    fn did_commit(&self, identity: &ResourceIdentity, data: Option<&Value>);

    fn commit_was_rejected(&self, identity: &ResourceIdentity, errors: Option<&Value>);

    fn unload_record(&self, identity: &ResourceIdentity);

    fn is_empty(&self, identity: &ResourceIdentity) -> bool;

    fn is_new(&self, identity: &ResourceIdentity) -> bool;

    fn is_deleted(&self, identity: &ResourceIdentity) -> bool;

    fn is_deletion_committed(&self, identity: &ResourceIdentity) -> bool;

    /// Current relationship linkage by field.
    fn relationship_refs(&self, identity: &ResourceIdentity) -> Vec<(String, Vec<ResourceRef>)>;

    fn set_relationship(&self, identity: &ResourceIdentity, field: &str, refs: Vec<ResourceRef>);
}

/// Presents a [`LegacyCache`] as a [`Cache`].
pub struct LegacyCacheAdapter<C> {
    inner: C,
    capabilities: CacheCapabilities,
    documents: DashMap<DocumentIdentity, ResourceDocument>,
    /// Remote linkage per edited field, captured on the first local edit.
    remote_snapshots: Mutex<HashMap<ResourceIdentity, HashMap<String, Vec<ResourceIdentity>>>>,
}

impl<C: LegacyCache> LegacyCacheAdapter<C> {
    pub fn new(inner: C, capabilities: CacheCapabilities) -> Self {
        Self {
            inner,
            capabilities,
            documents: DashMap::new(),
            remote_snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    fn resolve(&self, reference: &ResourceRef) -> Option<ResourceIdentity> {
        if reference.resource_type.is_some() {
            Some(self.capabilities.identity_for(reference))
        } else {
            self.capabilities.registry.peek(reference)
        }
    }

    fn push(&self, value: &Value) -> Option<ResourceIdentity> {
        let identity = self.resolve(&payload::resource_ref(value)?)?;
        self.push_resource(&identity, value);
        Some(identity)
    }

    fn push_resource(&self, identity: &ResourceIdentity, value: &Value) -> Vec<String> {
        let was_empty = self.inner.is_empty(identity);
        let changed = self.inner.push_data(identity, value, !was_empty);
        if was_empty {
            self.capabilities
                .notify_change(identity.clone(), NotificationKind::Added, None);
        } else {
            for field in &changed {
                self.capabilities.notify_change(
                    identity.clone(),
                    NotificationKind::Attributes,
                    Some(field),
                );
            }
        }
        changed
    }

    fn linkage(&self, identity: &ResourceIdentity, field: &str) -> Vec<ResourceIdentity> {
        self.inner
            .relationship_refs(identity)
            .into_iter()
            .find(|(f, _)| f == field)
            .map(|(_, refs)| refs.iter().filter_map(|r| self.resolve(r)).collect())
            .unwrap_or_default()
    }

    fn write_linkage(&self, identity: &ResourceIdentity, field: &str, targets: Vec<ResourceIdentity>) {
        let refs = targets.iter().map(ResourceIdentity::to_ref).collect();
        self.inner.set_relationship(identity, field, refs);
        self.capabilities.notify_change(
            identity.clone(),
            NotificationKind::Relationships,
            Some(field),
        );
    }
}

impl<C: LegacyCache> Cache for LegacyCacheAdapter<C> {
    fn put(&self, document: CacheDocument) -> ResourceDocument {
        let content = &document.content;
        let data = match payload::primary(content) {
            Primary::Absent => DocumentData::Empty,
            Primary::Single(None) => DocumentData::Single(None),
            Primary::Single(Some(value)) => DocumentData::Single(self.push(value)),
            Primary::Many(values) => {
                DocumentData::Collection(values.iter().filter_map(|v| self.push(v)).collect())
            }
        };
        let included = payload::included(content)
            .iter()
            .filter_map(|v| self.push(v))
            .collect();

        let stored = ResourceDocument {
            identity: document.identity.clone(),
            data,
            included,
            meta: content.get("meta").cloned(),
            links: content.get("links").cloned(),
            errors: content
                .get("errors")
                .cloned()
                .or_else(|| document.is_error.then(|| Value::Array(Vec::new()))),
        };

        if let Some(identity) = &document.identity {
            let kind = match self.documents.insert(identity.clone(), stored.clone()) {
                Some(_) => NotificationKind::Updated,
                None => NotificationKind::Added,
            };
            self.capabilities
                .notify_change(identity.clone(), kind, None);
        }
        stored
    }

    fn patch(&self, operation: Operation) {
        match operation {
            Operation::MergeIdentifiers { record, value } => {
                if let Some(data) = self.inner.peek_data(&record) {
                    self.inner.push_data(&value, &data, false);
                }
                self.inner.unload_record(&record);
                let snapshot = self.remote_snapshots.lock().remove(&record);
                if let Some(snapshot) = snapshot {
                    self.remote_snapshots
                        .lock()
                        .entry(value.clone())
                        .or_default()
                        .extend(snapshot);
                }
                for mut document in self.documents.iter_mut() {
                    document.rewrite_identity(&record, &value);
                }
                debug!(stale = %record, survivor = %value, "legacy cache merged identities");
            }
            Operation::RemoveDocument(identity) => {
                if self.documents.remove(&identity).is_some() {
                    self.capabilities
                        .notify_change(identity, NotificationKind::Removed, None);
                }
            }
        }
    }

    fn mutate(&self, mutation: Mutation) {
        let record = mutation.record().clone();
        let (field, current) = match &mutation {
            Mutation::AddToRelationship { field, .. }
            | Mutation::RemoveFromRelationship { field, .. }
            | Mutation::ReplaceRelatedRecord { field, .. } => {
                (field.clone(), self.linkage(&record, field))
            }
        };

        self.remote_snapshots
            .lock()
            .entry(record.clone())
            .or_default()
            .entry(field.clone())
            .or_insert_with(|| current.clone());

        let mut next = current;
        match mutation {
            Mutation::AddToRelationship { value, index, .. } => {
                let mut at = index.unwrap_or(next.len()).min(next.len());
                for target in value {
                    if !next.contains(&target) {
                        next.insert(at, target);
                        at += 1;
                    }
                }
            }
            Mutation::RemoveFromRelationship { value, .. } => {
                next.retain(|t| !value.contains(t));
            }
            Mutation::ReplaceRelatedRecord { value, .. } => {
                next = value.into_iter().collect();
            }
        }
        self.write_linkage(&record, &field, next);
    }

    fn peek(&self, identity: &ResourceIdentity) -> Option<Value> {
        self.inner.peek_data(identity)
    }

    fn peek_request(&self, identity: &DocumentIdentity) -> Option<ResourceDocument> {
        self.documents.get(identity).map(|d| d.clone())
    }

    fn upsert(
        &self,
        identity: &ResourceIdentity,
        data: Value,
        has_record: bool,
    ) -> Option<Vec<String>> {
        let was_empty = self.inner.is_empty(identity);
        let changed = self.push_resource(identity, &data);
        (has_record && !was_empty).then_some(changed)
    }

    fn client_did_create(&self, identity: &ResourceIdentity, attributes: Map<String, Value>) {
        self.inner.client_did_create(identity, attributes);
        self.capabilities
            .notify_change(identity.clone(), NotificationKind::Added, None);
    }

    fn set_attr(&self, identity: &ResourceIdentity, field: &str, value: Value) {
        self.inner.set_dirty_attribute(identity, field, value);
        self.capabilities
            .notify_change(identity.clone(), NotificationKind::Attributes, Some(field));
    }

    fn set_is_deleted(&self, identity: &ResourceIdentity, deleted: bool) {
        if self.inner.is_deleted(identity) != deleted {
            self.inner.set_is_deleted(identity, deleted);
            self.capabilities
                .notify_change(identity.clone(), NotificationKind::State, None);
        }
    }

    fn will_commit(&self, identity: &ResourceIdentity) {
        self.inner.will_commit(identity);
    }

    fn did_commit(&self, identity: &ResourceIdentity, data: Option<Value>) -> Option<ResourceRef> {
        self.inner.did_commit(identity, data.as_ref());
        self.capabilities
            .notify_change(identity.clone(), NotificationKind::State, None);
        data.as_ref().and_then(payload::resource_ref)
    }

    fn commit_was_rejected(&self, identity: &ResourceIdentity, errors: Option<Value>) {
        self.inner.commit_was_rejected(identity, errors.as_ref());
        self.capabilities
            .notify_change(identity.clone(), NotificationKind::Errors, None);
        self.capabilities
            .notify_change(identity.clone(), NotificationKind::State, None);
    }

    fn unload_record(&self, identity: &ResourceIdentity) {
        let was_present = !self.inner.is_empty(identity);
        self.inner.unload_record(identity);
        self.remote_snapshots.lock().remove(identity);
        if was_present {
            trace!(lid = %identity, "legacy resource unloaded");
            self.capabilities
                .notify_change(identity.clone(), NotificationKind::Removed, None);
        }
    }

    fn is_empty(&self, identity: &ResourceIdentity) -> bool {
        self.inner.is_empty(identity)
    }

    fn is_new(&self, identity: &ResourceIdentity) -> bool {
        self.inner.is_new(identity)
    }

    fn is_deleted(&self, identity: &ResourceIdentity) -> bool {
        self.inner.is_deleted(identity)
    }

    fn is_deletion_committed(&self, identity: &ResourceIdentity) -> bool {
        self.inner.is_deletion_committed(identity)
    }

    /// Legacy caches cannot enumerate inverse edges, so none are implicit.
    fn relationships(&self, identity: &ResourceIdentity) -> Vec<RelationshipEdge> {
        let snapshots = self.remote_snapshots.lock();
        let remote = snapshots.get(identity);

        let mut edges = Vec::new();
        for (field, refs) in self.inner.relationship_refs(identity) {
            let snapshot = remote.and_then(|fields| fields.get(&field));
            for target in refs.iter().filter_map(|r| self.resolve(r)) {
                let origin = match snapshot {
                    Some(before) if !before.contains(&target) => EdgeOrigin::Mutation,
                    _ => EdgeOrigin::Remote,
                };
                edges.push(RelationshipEdge {
                    field: field.clone(),
                    target,
                    origin,
                });
            }
        }
        edges
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::identity::{IdentityRegistry, RequestRef};
    use crate::notify::{Channel, NotificationBroker};
    use crate::scope::WorkScope;

    #[derive(Default)]
    struct Record {
        data: Map<String, Value>,
        relationships: Vec<(String, Vec<ResourceRef>)>,
        is_new: bool,
        is_deleted: bool,
        deletion_committed: bool,
    }

    /// Resource-only cache backed by a plain map.
    #[derive(Default)]
    struct MapCache {
        records: Mutex<HashMap<ResourceIdentity, Record>>,
    }

    impl LegacyCache for MapCache {
        fn push_data(&self, identity: &ResourceIdentity, data: &Value, calculate: bool) -> Vec<String> {
            let mut records = self.records.lock();
            let record = records.entry(identity.clone()).or_default();
            let mut changed = Vec::new();
            for (k, v) in payload::attributes(data) {
                if calculate && record.data.get(&k) != Some(&v) {
                    changed.push(k.clone());
                }
                record.data.insert(k, v);
            }
            let linkage = payload::relationships(data);
            if !linkage.is_empty() {
                record.relationships = linkage;
            }
            changed
        }

        fn peek_data(&self, identity: &ResourceIdentity) -> Option<Value> {
            self.records
                .lock()
                .get(identity)
                .map(|r| json!({"attributes": r.data}))
        }

        fn client_did_create(&self, identity: &ResourceIdentity, attributes: Map<String, Value>) {
            let mut records = self.records.lock();
            let record = records.entry(identity.clone()).or_default();
            record.is_new = true;
            record.data = attributes;
        }

        fn set_dirty_attribute(&self, identity: &ResourceIdentity, field: &str, value: Value) {
            if let Some(r) = self.records.lock().get_mut(identity) {
                r.data.insert(field.into(), value);
            }
        }

        fn set_is_deleted(&self, identity: &ResourceIdentity, deleted: bool) {
            if let Some(r) = self.records.lock().get_mut(identity) {
                r.is_deleted = deleted;
            }
        }

        fn will_commit(&self, _identity: &ResourceIdentity) {}

        fn did_commit(&self, identity: &ResourceIdentity, _data: Option<&Value>) {
            if let Some(r) = self.records.lock().get_mut(identity) {
                r.is_new = false;
                r.deletion_committed = r.is_deleted;
            }
        }

        fn commit_was_rejected(&self, _identity: &ResourceIdentity, _errors: Option<&Value>) {}

        fn unload_record(&self, identity: &ResourceIdentity) {
            self.records.lock().remove(identity);
        }

        fn is_empty(&self, identity: &ResourceIdentity) -> bool {
            !self.records.lock().contains_key(identity)
        }

        fn is_new(&self, identity: &ResourceIdentity) -> bool {
            self.records.lock().get(identity).is_some_and(|r| r.is_new)
        }

        fn is_deleted(&self, identity: &ResourceIdentity) -> bool {
            self.records.lock().get(identity).is_some_and(|r| r.is_deleted)
        }

        fn is_deletion_committed(&self, identity: &ResourceIdentity) -> bool {
            self.records
                .lock()
                .get(identity)
                .is_some_and(|r| r.deletion_committed)
        }

        fn relationship_refs(&self, identity: &ResourceIdentity) -> Vec<(String, Vec<ResourceRef>)> {
            self.records
                .lock()
                .get(identity)
                .map(|r| r.relationships.clone())
                .unwrap_or_default()
        }

        fn set_relationship(&self, identity: &ResourceIdentity, field: &str, refs: Vec<ResourceRef>) {
            if let Some(r) = self.records.lock().get_mut(identity) {
                match r.relationships.iter_mut().find(|(f, _)| f == field) {
                    Some((_, existing)) => *existing = refs,
                    None => r.relationships.push((field.to_string(), refs)),
                }
            }
        }
    }

    fn adapter() -> (LegacyCacheAdapter<MapCache>, CacheCapabilities) {
        let registry = Arc::new(IdentityRegistry::default());
        let notifications = NotificationBroker::new(Arc::clone(&registry), Arc::new(WorkScope::new()));
        let capabilities = CacheCapabilities {
            registry,
            notifications,
        };
        (
            LegacyCacheAdapter::new(MapCache::default(), capabilities.clone()),
            capabilities,
        )
    }

    #[test]
    fn test_adapter_tracks_documents() {
        let (cache, caps) = adapter();
        let added = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&added);
        caps.notifications.subscribe(Channel::Resource, move |n| {
            if n.kind == NotificationKind::Added {
                *sink.lock() += 1;
            }
        });

        let identity = caps.document_for(&RequestRef {
            url: Some("/users".into()),
            ..Default::default()
        });
        let stored = cache.put(CacheDocument {
            identity: identity.clone(),
            content: json!({"data": [{"type": "user", "id": "1"}, {"type": "user", "id": "2"}]}),
            is_error: false,
        });

        assert_eq!(stored.primary().len(), 2);
        assert_eq!(cache.peek_request(&identity.unwrap()), Some(stored));
        assert_eq!(*added.lock(), 2);
    }

    #[test]
    fn test_adapter_marks_mutation_edges() {
        let (cache, caps) = adapter();
        cache.put(CacheDocument {
            identity: None,
            content: json!({"data": [
                {"type": "user", "id": "1", "relationships": {"pets": {"data": [{"type": "pet", "id": "a"}]}}},
            ]}),
            is_error: false,
        });
        let owner = caps.registry.peek(&ResourceRef::new("user", "1")).unwrap();
        let a = caps.identity_for(&ResourceRef::new("pet", "a"));
        let b = caps.identity_for(&ResourceRef::new("pet", "b"));

        cache.mutate(Mutation::AddToRelationship {
            record: owner.clone(),
            field: "pets".into(),
            value: vec![b.clone()],
            index: None,
        });

        let edges: Vec<_> = cache
            .relationships(&owner)
            .into_iter()
            .map(|e| (e.target, e.origin))
            .collect();
        assert_eq!(edges, vec![(a, EdgeOrigin::Remote), (b, EdgeOrigin::Mutation)]);
    }

    #[test]
    fn test_adapter_merge_moves_data() {
        let (cache, caps) = adapter();
        let draft = caps.identity_for(&ResourceRef::client("user"));
        cache.client_did_create(&draft, json!({"name": "x"}).as_object().cloned().unwrap());
        let remote = caps.identity_for(&ResourceRef::new("user", "2"));

        cache.patch(Operation::MergeIdentifiers {
            record: draft.clone(),
            value: remote.clone(),
        });

        assert!(cache.is_empty(&draft));
        assert_eq!(cache.peek(&remote).unwrap()["attributes"]["name"], "x");
        assert!(cache.dump().is_err());
    }
}
