//! UI-facing records and references, one per identity.
//!
//! Records are created lazily through a [`RecordFactory`]. Alongside each
//! identity the manager keeps a GC candidate flag and the set of cached
//! documents that include it; the collector itself lives in `gc.rs`.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexSet;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::cache::{Cache, Operation, ResourceDocument, record_is_loaded};
use crate::collections::CollectionManager;
use crate::error::StoreError;
use crate::identity::{DocumentIdentity, Identifier, IdentityRegistry, ResourceIdentity, ResourceRef};
use crate::notify::{Channel, NotificationBroker, NotificationKind, SubscriptionToken};
use crate::scope::{Phase, WorkScope};

/// A materialized record, opaque to the store.
pub type RecordObject = Arc<dyn Any + Send + Sync>;

/// Creates and destroys UI-facing records.
pub trait RecordFactory: Send + Sync {
    fn instantiate_record(
        &self,
        identity: &ResourceIdentity,
        properties: &Map<String, Value>,
    ) -> RecordObject;

    fn teardown_record(&self, record: &RecordObject);
}

/// A lightweight handle to a resource that does not materialize it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordReference {
    identity: ResourceIdentity,
}

impl RecordReference {
    pub fn identity(&self) -> &ResourceIdentity {
        &self.identity
    }

    pub fn id(&self) -> Option<Arc<str>> {
        self.identity.id()
    }

    pub fn resource_type(&self) -> Arc<str> {
        self.identity.resource_type()
    }

    pub fn lid(&self) -> &str {
        self.identity.lid()
    }
}

#[derive(Default)]
pub(crate) struct Entry {
    pub(crate) record: Option<RecordObject>,
    pub(crate) reference: Option<RecordReference>,
    /// Possibly unreachable; examined by the next GC pass.
    pub(crate) candidate: bool,
    /// The UI let go of the record.
    pub(crate) released: bool,
    /// Last kept alive only through a mutation edge.
    pub(crate) kept: bool,
}

impl Entry {
    fn is_unheld(&self) -> bool {
        self.record.is_none() || self.released
    }
}

/// A cached document acting as a GC root.
#[derive(Default)]
pub(crate) struct DocumentRoot {
    pub(crate) members: IndexSet<ResourceIdentity>,
    pub(crate) retained: bool,
}

#[derive(Default)]
pub(crate) struct MaterializedState {
    pub(crate) entries: HashMap<ResourceIdentity, Entry>,
    pub(crate) documents: HashMap<DocumentIdentity, DocumentRoot>,
    /// Identity -> documents that include it.
    pub(crate) membership: HashMap<ResourceIdentity, IndexSet<DocumentIdentity>>,
    /// Merges awaiting the coalesce phase.
    pending_merges: Vec<(ResourceIdentity, ResourceIdentity)>,
}

impl MaterializedState {
    pub(crate) fn is_retained(&self, identity: &ResourceIdentity) -> bool {
        self.membership.get(identity).is_some_and(|documents| {
            documents
                .iter()
                .any(|d| self.documents.get(d).is_some_and(|root| root.retained))
        })
    }

    pub(crate) fn attach(&mut self, document: &DocumentIdentity, identity: &ResourceIdentity) {
        self.documents
            .entry(document.clone())
            .or_default()
            .members
            .insert(identity.clone());
        self.membership
            .entry(identity.clone())
            .or_default()
            .insert(document.clone());
    }

    fn detach_all(&mut self, identity: &ResourceIdentity) -> IndexSet<DocumentIdentity> {
        let documents = self.membership.remove(identity).unwrap_or_default();
        for document in &documents {
            if let Some(root) = self.documents.get_mut(document) {
                root.members.shift_remove(identity);
            }
        }
        documents
    }

    /// Mark `identity` as a candidate if nothing holds it.
    pub(crate) fn mark_if_unheld(&mut self, identity: &ResourceIdentity) {
        let retained = self.is_retained(identity);
        let entry = self.entries.entry(identity.clone()).or_default();
        if !retained && entry.is_unheld() {
            entry.candidate = true;
        }
    }

    /// Make resources kept through mutation edges candidates again when
    /// nothing else holds them, so a removed edge cannot pin them.
    pub(crate) fn requeue_kept(&mut self) {
        let kept: Vec<ResourceIdentity> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.kept && !entry.candidate)
            .map(|(identity, _)| identity.clone())
            .collect();
        for identity in &kept {
            self.mark_if_unheld(identity);
            if let Some(entry) = self.entries.get_mut(identity)
                && entry.candidate
            {
                entry.kept = false;
            }
        }
    }
}

/// Maps identities to records and owns the GC bookkeeping.
pub struct MaterializedObjects {
    this: Weak<Self>,
    pub(crate) registry: Arc<IdentityRegistry>,
    pub(crate) cache: Arc<dyn Cache>,
    pub(crate) scope: Arc<WorkScope>,
    notifications: Arc<NotificationBroker>,
    collections: Arc<CollectionManager>,
    factory: Arc<dyn RecordFactory>,
    pub(crate) state: Mutex<MaterializedState>,
    subscription: Mutex<Option<SubscriptionToken>>,
    destroyed: AtomicBool,
}

impl MaterializedObjects {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        cache: Arc<dyn Cache>,
        notifications: Arc<NotificationBroker>,
        scope: Arc<WorkScope>,
        collections: Arc<CollectionManager>,
        factory: Arc<dyn RecordFactory>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            cache,
            scope,
            notifications: Arc::clone(&notifications),
            collections,
            factory,
            state: Mutex::new(MaterializedState::default()),
            subscription: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&manager);
        let token = notifications.subscribe(Channel::Resource, move |notification| {
            if notification.kind != NotificationKind::Added {
                return;
            }
            if let (Some(manager), Identifier::Resource(identity)) =
                (weak.upgrade(), &notification.identifier)
            {
                manager.identifier_created(identity);
            }
        });
        *manager.subscription.lock() = Some(token);
        manager
    }

    /// The record for `identity`, instantiating it on first access.
    pub fn get_record(
        &self,
        identity: &ResourceIdentity,
        properties: Option<&Map<String, Value>>,
    ) -> RecordObject {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get_mut(identity)
                && let Some(record) = &entry.record
            {
                entry.candidate = false;
                entry.released = false;
                return Arc::clone(record);
            }
        }

        let empty = Map::new();
        let created = self
            .factory
            .instantiate_record(identity, properties.unwrap_or(&empty));

        let raced = {
            let mut state = self.state.lock();
            let entry = state.entries.entry(identity.clone()).or_default();
            entry.candidate = false;
            entry.released = false;
            match &entry.record {
                Some(existing) => Some(Arc::clone(existing)),
                None => {
                    entry.record = Some(Arc::clone(&created));
                    None
                }
            }
        };

        match raced {
            Some(existing) => {
                self.factory.teardown_record(&created);
                existing
            }
            None => {
                trace!(lid = %identity, "record materialized");
                created
            }
        }
    }

    /// The record for `identity` if it is materialized.
    pub fn peek_record(&self, identity: &ResourceIdentity) -> Option<RecordObject> {
        self.state
            .lock()
            .entries
            .get(identity)
            .and_then(|entry| entry.record.clone())
    }

    pub fn get_reference(&self, identity: &ResourceIdentity) -> RecordReference {
        let mut state = self.state.lock();
        let entry = state.entries.entry(identity.clone()).or_default();
        entry
            .reference
            .get_or_insert_with(|| RecordReference {
                identity: identity.clone(),
            })
            .clone()
    }

    /// The UI no longer holds the record. It becomes a GC candidate unless a
    /// retained document includes it.
    pub fn release_record(&self, identity: &ResourceIdentity) {
        let mut state = self.state.lock();
        let retained = state.is_retained(identity);
        if let Some(entry) = state.entries.get_mut(identity) {
            entry.released = true;
            entry.candidate = !retained;
        }
    }

    /// Tear down the record, drop the cached resource and forget the identity.
    pub fn unload_record(&self, identity: &ResourceIdentity) {
        self.scope.join(|| {
            self.teardown(identity);
            self.cache.unload_record(identity);
            self.disconnect(identity);
        });
        debug!(lid = %identity, "record unloaded");
    }

    /// Drop bookkeeping for an identity and forget it.
    ///
    /// # Panics
    ///
    /// Panics if the identity still has a materialized record.
    pub fn disconnect(&self, identity: &ResourceIdentity) {
        {
            let mut state = self.state.lock();
            if let Some(entry) = state.entries.get(identity) {
                assert!(
                    entry.record.is_none(),
                    "cannot disconnect {identity}: its record has not been torn down"
                );
            }
            state.entries.remove(identity);
            state.detach_all(identity);
        }
        self.registry.forget(identity);
    }

    pub fn record_is_loaded(&self, identity: &ResourceIdentity, filter_deleted: bool) -> bool {
        record_is_loaded(self.cache.as_ref(), identity, filter_deleted)
    }

    /// Whether the identity will be examined by the next GC pass.
    pub fn is_candidate(&self, identity: &ResourceIdentity) -> bool {
        self.state
            .lock()
            .entries
            .get(identity)
            .is_some_and(|entry| entry.candidate)
    }

    /// Number of materialized records.
    pub fn record_count(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| entry.record.is_some())
            .count()
    }

    /// Root a freshly cached document. Its resources stop being candidates;
    /// resources it no longer includes may become candidates again.
    pub fn document_loaded(&self, document: &ResourceDocument) {
        let Some(identity) = &document.identity else {
            return;
        };
        let resources = document.resources();

        let mut state = self.state.lock();
        let previous = state
            .documents
            .get(identity)
            .map(|root| root.members.clone())
            .unwrap_or_default();
        for member in &previous {
            if let Some(documents) = state.membership.get_mut(member) {
                documents.shift_remove(identity);
            }
        }

        let root = state.documents.entry(identity.clone()).or_default();
        root.members = resources.iter().cloned().collect();
        root.retained = true;

        for resource in &resources {
            state
                .membership
                .entry(resource.clone())
                .or_default()
                .insert(identity.clone());
            state.entries.entry(resource.clone()).or_default().candidate = false;
        }
        for dropped in previous.iter().filter(|m| !resources.contains(m)) {
            state.mark_if_unheld(dropped);
        }
        trace!(document = %identity, count = resources.len(), "document rooted");
    }

    /// Un-root a document. Members nothing else holds become candidates.
    pub fn release_document(&self, document: &DocumentIdentity) {
        let mut state = self.state.lock();
        let Some(root) = state.documents.remove(document) else {
            return;
        };
        for member in &root.members {
            if let Some(documents) = state.membership.get_mut(member) {
                documents.shift_remove(document);
                if documents.is_empty() {
                    state.membership.remove(member);
                }
            }
            state.mark_if_unheld(member);
        }
        debug!(document = %document, count = root.members.len(), "document released");
    }

    /// Resolve two identities that turned out to be the same resource.
    ///
    /// Fails with [`StoreError::DuplicateId`] when both are materialized.
    /// Otherwise the registry picks a survivor, the cache folds the stale
    /// state into it, any stale record is torn down and collections are
    /// rewritten in the coalesce phase.
    pub fn merge_identities(
        &self,
        primary: &ResourceIdentity,
        secondary: &ResourceIdentity,
        incoming: &ResourceRef,
    ) -> Result<ResourceIdentity, StoreError> {
        {
            let state = self.state.lock();
            let materialized =
                |identity| state.entries.get(identity).is_some_and(|e: &Entry| e.record.is_some());
            if materialized(primary) && materialized(secondary) {
                return Err(StoreError::DuplicateId {
                    resource_type: incoming
                        .resource_type
                        .clone()
                        .unwrap_or_else(|| primary.resource_type().to_string()),
                    id: incoming.id.clone().unwrap_or_default(),
                    lid: primary.lid().to_string(),
                    existing_lid: secondary.lid().to_string(),
                });
            }
        }

        let outcome = self.registry.merge(primary, secondary, incoming);
        let (survivor, stale) = (outcome.survivor, outcome.stale);

        self.scope.join(|| {
            self.cache.patch(Operation::MergeIdentifiers {
                record: stale.clone(),
                value: survivor.clone(),
            });

            let stale_record = {
                let mut state = self.state.lock();
                let stale_entry = state.entries.remove(&stale).unwrap_or_default();
                let documents = state.detach_all(&stale);
                for document in &documents {
                    state.attach(document, &survivor);
                }
                let survivor_entry = state.entries.entry(survivor.clone()).or_default();
                survivor_entry.candidate &= stale_entry.candidate;
                state.pending_merges.push((stale.clone(), survivor.clone()));
                stale_entry.record
            };
            if let Some(record) = stale_record {
                self.factory.teardown_record(&record);
            }

            let this = self.this.clone();
            self.scope.schedule(
                Phase::Coalesce,
                Box::new(move || {
                    if let Some(manager) = this.upgrade() {
                        manager.apply_merges();
                    }
                }),
            );
        });

        debug!(survivor = %survivor, stale = %stale, "identities merged");
        Ok(survivor)
    }

    /// Tear down every record and stop listening.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(token) = self.subscription.lock().take() {
            self.notifications.unsubscribe(token);
        }
        let records: Vec<RecordObject> = {
            let mut state = self.state.lock();
            let records = state
                .entries
                .values_mut()
                .filter_map(|entry| entry.record.take())
                .collect();
            *state = MaterializedState::default();
            records
        };
        for record in &records {
            self.factory.teardown_record(record);
        }
        debug!(count = records.len(), "materialized objects destroyed");
    }

    /// Tear down the record for `identity` if there is one.
    pub(crate) fn teardown(&self, identity: &ResourceIdentity) {
        let record = self
            .state
            .lock()
            .entries
            .get_mut(identity)
            .and_then(|entry| entry.record.take());
        if let Some(record) = record {
            self.factory.teardown_record(&record);
        }
    }

    fn identifier_created(&self, identity: &ResourceIdentity) {
        self.state.lock().mark_if_unheld(identity);
    }

    fn apply_merges(&self) {
        let merges = std::mem::take(&mut self.state.lock().pending_merges);
        for (stale, survivor) in merges {
            self.collections.identifier_merged(&stale, &survivor);
        }
    }
}

impl fmt::Debug for MaterializedObjects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MaterializedObjects")
            .field("entries", &state.entries.len())
            .field("documents", &state.documents.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::{CacheCapabilities, CacheDocument};
    use crate::identity::RequestRef;
    use crate::memory::MemoryCache;
    use serde_json::json;

    /// Factory that records instantiations and teardowns by lid.
    #[derive(Default)]
    pub(crate) struct CountingFactory {
        pub(crate) created: Mutex<Vec<String>>,
        pub(crate) torn_down: Mutex<Vec<String>>,
    }

    impl RecordFactory for CountingFactory {
        fn instantiate_record(
            &self,
            identity: &ResourceIdentity,
            _properties: &Map<String, Value>,
        ) -> RecordObject {
            self.created.lock().push(identity.lid().to_string());
            Arc::new(identity.lid().to_string())
        }

        fn teardown_record(&self, record: &RecordObject) {
            if let Some(lid) = record.downcast_ref::<String>() {
                self.torn_down.lock().push(lid.clone());
            }
        }
    }

    pub(crate) struct Fixture {
        pub(crate) registry: Arc<IdentityRegistry>,
        pub(crate) scope: Arc<WorkScope>,
        pub(crate) cache: Arc<dyn Cache>,
        pub(crate) factory: Arc<CountingFactory>,
        pub(crate) objects: Arc<MaterializedObjects>,
        pub(crate) collections: Arc<CollectionManager>,
    }

    pub(crate) fn fixture() -> Fixture {
        let registry = Arc::new(IdentityRegistry::default());
        let scope = Arc::new(WorkScope::new());
        let notifications = NotificationBroker::new(Arc::clone(&registry), Arc::clone(&scope));
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new(CacheCapabilities {
            registry: Arc::clone(&registry),
            notifications: Arc::clone(&notifications),
        }));
        let collections = CollectionManager::new(
            Arc::clone(&cache),
            Arc::clone(&notifications),
            Arc::clone(&scope),
            1200,
        );
        let factory = Arc::new(CountingFactory::default());
        let objects = MaterializedObjects::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            notifications,
            Arc::clone(&scope),
            Arc::clone(&collections),
            factory.clone(),
        );
        Fixture {
            registry,
            scope,
            cache,
            factory,
            objects,
            collections,
        }
    }

    /// Put a document listing `ids` of `resource_type` and root it.
    pub(crate) fn load(
        f: &Fixture,
        url: &str,
        resources: Value,
    ) -> (DocumentIdentity, ResourceDocument) {
        let identity = f
            .registry
            .get_or_create_document(&RequestRef {
                url: Some(url.into()),
                ..Default::default()
            })
            .unwrap();
        let stored = f.scope.run(|| {
            let stored = f.cache.put(CacheDocument {
                identity: Some(identity.clone()),
                content: json!({ "data": resources }),
                is_error: false,
            });
            f.objects.document_loaded(&stored);
            stored
        });
        (identity, stored)
    }

    pub(crate) fn user(f: &Fixture, id: &str) -> ResourceIdentity {
        f.registry.get_or_create(&ResourceRef::new("user", id))
    }

    #[test]
    fn test_get_record_is_stable() {
        let f = fixture();
        load(&f, "/users/1", json!({"type": "user", "id": "1"}));
        let one = user(&f, "1");

        let a = f.objects.get_record(&one, None);
        let b = f.objects.get_record(&one, None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.factory.created.lock().len(), 1);
        assert!(f.objects.peek_record(&one).is_some());
        assert_eq!(f.objects.get_reference(&one).lid(), one.lid());
    }

    #[test]
    fn test_unrooted_resources_start_as_candidates() {
        let f = fixture();
        let one = user(&f, "1");
        f.scope
            .run(|| f.cache.upsert(&one, json!({"attributes": {}}), false));
        assert!(f.objects.is_candidate(&one));

        f.objects.get_record(&one, None);
        assert!(!f.objects.is_candidate(&one));

        f.objects.release_record(&one);
        assert!(f.objects.is_candidate(&one));
    }

    #[test]
    fn test_rooted_resources_are_not_candidates() {
        let f = fixture();
        let (document, _) = load(&f, "/users", json!([{"type": "user", "id": "1"}]));
        let one = user(&f, "1");
        assert!(!f.objects.is_candidate(&one));

        f.objects.get_record(&one, None);
        f.objects.release_record(&one);
        assert!(!f.objects.is_candidate(&one));

        f.objects.release_document(&document);
        assert!(f.objects.is_candidate(&one));
    }

    #[test]
    fn test_unload_record_tears_down_and_forgets() {
        let f = fixture();
        load(&f, "/users/1", json!({"type": "user", "id": "1"}));
        let one = user(&f, "1");
        f.objects.get_record(&one, None);

        f.objects.unload_record(&one);

        assert_eq!(*f.factory.torn_down.lock(), vec![one.lid().to_string()]);
        assert!(!f.registry.is_registered(&Identifier::Resource(one.clone())));
        assert!(!f.objects.record_is_loaded(&one, false));
    }

    #[test]
    #[should_panic(expected = "has not been torn down")]
    fn test_disconnect_requires_teardown() {
        let f = fixture();
        load(&f, "/users/1", json!({"type": "user", "id": "1"}));
        let one = user(&f, "1");
        f.objects.get_record(&one, None);
        f.objects.disconnect(&one);
    }

    #[test]
    fn test_merge_tears_down_stale_record_once() {
        let f = fixture();
        let draft = f.registry.get_or_create(&ResourceRef::client("user"));
        f.scope
            .run(|| f.cache.client_did_create(&draft, Map::new()));
        f.objects.get_record(&draft, None);
        let remote = user(&f, "5");
        let live = f.collections.live_array_for("user");

        let survivor = f
            .objects
            .merge_identities(&draft, &remote, &ResourceRef::new("user", "5"))
            .unwrap();

        assert!(survivor.ptr_eq(&remote));
        assert_eq!(*f.factory.torn_down.lock(), vec![draft.lid().to_string()]);
        assert!(f.objects.peek_record(&draft).is_none());
        assert_eq!(live.items(), vec![remote]);
    }

    #[test]
    fn test_merge_of_two_materialized_records_fails() {
        let f = fixture();
        let draft = f.registry.get_or_create(&ResourceRef::client("user"));
        let remote = user(&f, "5");
        f.objects.get_record(&draft, None);
        f.objects.get_record(&remote, None);

        let result = f
            .objects
            .merge_identities(&draft, &remote, &ResourceRef::new("user", "5"));
        assert!(matches!(result, Err(StoreError::DuplicateId { ref id, .. }) if id == "5"));
        assert!(f.factory.torn_down.lock().is_empty());
        assert!(!draft.is_stale());
    }

    #[test]
    fn test_destroy_tears_down_everything() {
        let f = fixture();
        let one = user(&f, "1");
        let two = user(&f, "2");
        f.objects.get_record(&one, None);
        f.objects.get_record(&two, None);

        f.objects.destroy();
        assert_eq!(f.factory.torn_down.lock().len(), 2);
        assert_eq!(f.objects.record_count(), 0);
    }
}
