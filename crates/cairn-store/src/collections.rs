//! Reactive collections kept in step with the cache.
//!
//! There is one live collection per resource type and one keyed collection
//! per document (plus unkeyed query collections). Notifications only queue
//! add/remove ops on the affected collections and signal their `changes()`
//! channel; the backing buffer is touched on the next read.
//!
//! Lock order is manager state, then collection state. Collections never take
//! the manager lock while holding their own.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use indexmap::{IndexMap, IndexSet};
use parking_lot::{Mutex, MutexGuard};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, trace};

use crate::cache::{Cache, record_is_loaded};
use crate::changeset::{ChangeOp, ChangeSet, SyncSummary, push_batched, sync_items};
use crate::identity::{DocumentIdentity, Identifier, ResourceIdentity};
use crate::notify::{Channel, NotificationBroker, NotificationKind, SubscriptionToken};
use crate::scope::{Phase, WorkScope};

/// Unique id of a collection within its manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CollectionId(u64);

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "collection-{}", self.0)
    }
}

/// What a collection reflects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    /// Every known resource of one type.
    Live(Arc<str>),
    /// The primary data of one cached document.
    Keyed(DocumentIdentity),
    /// An ad-hoc query result with no document behind it.
    Query,
}

/// Options for [`CollectionManager::get_collection`].
#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    /// Backing document. Collections without one are query collections.
    pub identity: Option<DocumentIdentity>,
    /// The query that produced the collection, kept for callers.
    pub query: Option<Value>,
    /// Initial contents.
    pub seed: Vec<ResourceIdentity>,
}

#[derive(Default)]
struct CollectionState {
    /// Backing buffer. Mutated in place, never replaced.
    items: Vec<ResourceIdentity>,
    members: HashSet<ResourceIdentity>,
    pending: ChangeSet,
    needs_resync: bool,
    version: u64,
    destroyed: bool,
}

struct CollectionInner {
    id: CollectionId,
    kind: CollectionKind,
    query: Option<Value>,
    batch_size: usize,
    state: Mutex<CollectionState>,
    changes: watch::Sender<u64>,
    cache: Arc<dyn Cache>,
    manager: Weak<CollectionManager>,
}

/// Shared handle to a derived collection.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

impl Collection {
    pub fn id(&self) -> CollectionId {
        self.inner.id
    }

    pub fn kind(&self) -> &CollectionKind {
        &self.inner.kind
    }

    pub fn query(&self) -> Option<&Value> {
        self.inner.query.as_ref()
    }

    /// Current contents, resolving pending changes first.
    pub fn items(&self) -> Vec<ResourceIdentity> {
        self.resolve().items.clone()
    }

    pub fn len(&self) -> usize {
        self.resolve().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &ResourceIdentity) -> bool {
        self.resolve().members.contains(identity)
    }

    /// Receiver bumped whenever the collection has unresolved changes.
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.inner.changes.subscribe()
    }

    /// Number of resolutions that changed the contents.
    pub fn version(&self) -> u64 {
        self.inner.state.lock().version
    }

    /// Whether a read would do work.
    pub fn is_dirty(&self) -> bool {
        let state = self.inner.state.lock();
        state.needs_resync || !state.pending.is_empty()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    fn ptr_eq(&self, other: &Collection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Queue an op. Returns whether the pending changeset changed.
    fn queue(&self, identity: &ResourceIdentity, op: ChangeOp) -> bool {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return false;
        }
        let relevant = match op {
            ChangeOp::Add => {
                !state.members.contains(identity) || state.pending.get(identity).is_some()
            }
            ChangeOp::Remove => {
                state.members.contains(identity) || state.pending.get(identity).is_some()
            }
        };
        relevant && state.pending.record(identity.clone(), op)
    }

    fn mark_resync(&self) -> bool {
        let mut state = self.inner.state.lock();
        if state.destroyed {
            return false;
        }
        state.needs_resync = true;
        true
    }

    fn signal(&self) {
        self.inner.changes.send_modify(|generation| *generation += 1);
    }

    fn destroy(&self) {
        let mut state = self.inner.state.lock();
        state.destroyed = true;
        state.items.clear();
        state.members.clear();
        state.pending = ChangeSet::new();
    }

    /// Apply pending work and return the locked state.
    ///
    /// # Panics
    ///
    /// Panics if the collection was destroyed, or if a keyed collection
    /// needs a resync and its document is no longer cached.
    fn resolve(&self) -> MutexGuard<'_, CollectionState> {
        let resync = {
            let state = self.inner.state.lock();
            assert!(!state.destroyed, "{} has been destroyed", self.inner.id);
            match &self.inner.kind {
                CollectionKind::Keyed(document) if state.needs_resync => Some(document.clone()),
                _ => None,
            }
        };

        let fresh = resync.map(|document| {
            let Some(stored) = self.inner.cache.peek_request(&document) else {
                panic!(
                    "{} is keyed by document {} which is no longer cached",
                    self.inner.id, document
                );
            };
            let primary = stored.primary();
            if let Some(manager) = self.inner.manager.upgrade() {
                manager.associate(&primary, self.inner.id);
            }
            primary
        });

        let mut state = self.inner.state.lock();
        let mut summary = SyncSummary::default();

        if let Some(fresh) = fresh {
            let state = &mut *state;
            summary.removed = state.items.len();
            state.items.clear();
            state.members.clear();
            push_batched(&mut state.items, &fresh, self.inner.batch_size);
            state.members.extend(fresh.iter().cloned());
            state.needs_resync = false;
            summary.added = fresh.len();
            trace!(collection = %self.inner.id, count = fresh.len(), "collection resynced");
        }

        if !state.pending.is_empty() {
            let changes = state.pending.take();
            let state = &mut *state;
            let applied = sync_items(
                &mut state.items,
                &mut state.members,
                changes,
                self.inner.batch_size,
            );
            summary.added += applied.added;
            summary.removed += applied.removed;
        }

        if !summary.is_noop() {
            state.version += 1;
        }
        state
    }
}

/// Manager bookkeeping, guarded by one lock.
#[derive(Default)]
struct ManagerState {
    /// Live collection per resource type.
    live: HashMap<Arc<str>, Collection>,
    /// Ops for types whose live collection does not exist yet.
    staged: HashMap<Arc<str>, ChangeSet>,
    /// Keyed collection per document.
    keyed: HashMap<DocumentIdentity, Collection>,
    /// Keyed and query collections by id.
    derived: HashMap<CollectionId, Collection>,
    /// Derived collections each identity has belonged to.
    associations: HashMap<ResourceIdentity, IndexSet<CollectionId>>,
    /// Last known visibility of each identity.
    visible: HashMap<ResourceIdentity, bool>,
    /// Collections with unsignalled changes.
    dirty: IndexMap<CollectionId, Collection>,
}

/// Owns every derived collection.
pub struct CollectionManager {
    this: Weak<Self>,
    cache: Arc<dyn Cache>,
    notifications: Arc<NotificationBroker>,
    scope: Arc<WorkScope>,
    batch_size: usize,
    state: Mutex<ManagerState>,
    subscriptions: Mutex<Vec<SubscriptionToken>>,
    next_id: AtomicU64,
    destroyed: AtomicBool,
}

impl CollectionManager {
    /// Create a manager and subscribe it to the resource and document channels.
    pub fn new(
        cache: Arc<dyn Cache>,
        notifications: Arc<NotificationBroker>,
        scope: Arc<WorkScope>,
        batch_size: usize,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            this: this.clone(),
            cache,
            notifications: Arc::clone(&notifications),
            scope,
            batch_size,
            state: Mutex::new(ManagerState::default()),
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&manager);
        let resources = notifications.subscribe(Channel::Resource, move |notification| {
            let (Some(manager), Identifier::Resource(identity)) =
                (weak.upgrade(), &notification.identifier)
            else {
                return;
            };
            match notification.kind {
                NotificationKind::Added => manager.identifier_added(identity),
                NotificationKind::Removed => manager.identifier_removed(identity),
                NotificationKind::State => manager.identifier_changed(identity),
                _ => {}
            }
        });

        let weak = Arc::downgrade(&manager);
        let documents = notifications.subscribe(Channel::Document, move |notification| {
            let (Some(manager), Identifier::Document(document)) =
                (weak.upgrade(), &notification.identifier)
            else {
                return;
            };
            manager.document_changed(document);
        });

        manager.subscriptions.lock().extend([resources, documents]);
        manager
    }

    /// The live collection for `resource_type`, created on first access.
    pub fn live_array_for(&self, resource_type: &str) -> Collection {
        let mut state = self.state.lock();
        if let Some(existing) = state.live.get(resource_type) {
            return existing.clone();
        }

        let key: Arc<str> = Arc::from(resource_type);
        let collection = self.create(CollectionKind::Live(Arc::clone(&key)), None, &[]);
        if let Some(staged) = state.staged.remove(resource_type) {
            trace!(resource_type, count = staged.len(), "flushing staged ops into live collection");
            collection.inner.state.lock().pending = staged;
        }
        state.live.insert(key, collection.clone());
        collection
    }

    /// The keyed collection for a document, or a new query collection.
    pub fn get_collection(&self, config: CollectionConfig) -> Collection {
        let mut state = self.state.lock();
        if let Some(document) = &config.identity
            && let Some(existing) = state.keyed.get(document)
        {
            return existing.clone();
        }

        let kind = match &config.identity {
            Some(document) => CollectionKind::Keyed(document.clone()),
            None => CollectionKind::Query,
        };
        let collection = self.create(kind, config.query, &config.seed);
        for identity in &config.seed {
            state
                .associations
                .entry(identity.clone())
                .or_default()
                .insert(collection.id());
        }
        if let Some(document) = config.identity {
            state.keyed.insert(document, collection.clone());
        }
        state.derived.insert(collection.id(), collection.clone());
        debug!(collection = %collection.id(), kind = ?collection.kind(), "collection created");
        collection
    }

    /// The keyed collection for a document, if one exists.
    pub fn keyed_for(&self, document: &DocumentIdentity) -> Option<Collection> {
        self.state.lock().keyed.get(document).cloned()
    }

    /// Route an add to the live collection and associated collections.
    pub fn identifier_added(&self, identity: &ResourceIdentity) {
        self.route(identity, ChangeOp::Add);
    }

    /// Route a remove to the live collection and associated collections.
    ///
    /// The identity left the cache, so its derived-collection associations
    /// are dropped once the removal is queued.
    pub fn identifier_removed(&self, identity: &ResourceIdentity) {
        self.route(identity, ChangeOp::Remove);
        self.state.lock().associations.remove(identity);
    }

    /// Re-derive membership from the identity's current visibility.
    pub fn identifier_changed(&self, identity: &ResourceIdentity) {
        let visible = record_is_loaded(self.cache.as_ref(), identity, true);
        let previous = self.state.lock().visible.get(identity).copied().unwrap_or(false);
        match (previous, visible) {
            (false, true) => self.identifier_added(identity),
            (true, false) => self.identifier_removed(identity),
            _ => {}
        }
    }

    /// Replace `stale` with `survivor` in every collection that holds it.
    pub fn identifier_merged(&self, stale: &ResourceIdentity, survivor: &ResourceIdentity) {
        let mut dirty = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let mut targets = Vec::new();
            if let Some(live) = state.live.get(&*stale.resource_type()) {
                targets.push(live.clone());
            }
            let associated = state.associations.remove(stale).unwrap_or_default();
            for id in &associated {
                if let Some(collection) = state.derived.get(id) {
                    targets.push(collection.clone());
                }
            }

            for collection in targets {
                if collection.queue(stale, ChangeOp::Remove) {
                    collection.queue(survivor, ChangeOp::Add);
                    dirty.push(collection);
                }
            }

            if let Some(staged) = state.staged.get_mut(&*stale.resource_type())
                && staged.get(stale) == Some(ChangeOp::Add)
            {
                staged.remove(stale.clone());
                staged.add(survivor.clone());
            }

            state
                .associations
                .entry(survivor.clone())
                .or_default()
                .extend(associated);
            if let Some(visible) = state.visible.remove(stale) {
                state.visible.entry(survivor.clone()).or_insert(visible);
            }
        }
        debug!(stale = %stale, survivor = %survivor, "collections rewritten for merge");
        self.mark_dirty(dirty);
    }

    /// Destroy a collection and drop the manager's references to it.
    pub fn release(&self, collection: &Collection) {
        let mut state = self.state.lock();
        let id = collection.id();
        match collection.kind() {
            CollectionKind::Live(resource_type) => {
                if state
                    .live
                    .get(resource_type)
                    .is_some_and(|c| c.ptr_eq(collection))
                {
                    state.live.remove(resource_type);
                }
            }
            CollectionKind::Keyed(document) => {
                if state.keyed.get(document).is_some_and(|c| c.ptr_eq(collection)) {
                    state.keyed.remove(document);
                }
            }
            CollectionKind::Query => {}
        }
        state.derived.remove(&id);
        state.dirty.shift_remove(&id);
        state.associations.retain(|_, ids| {
            ids.shift_remove(&id);
            !ids.is_empty()
        });
        collection.destroy();
        debug!(collection = %id, "collection released");
    }

    /// Number of collections the manager owns.
    pub fn collection_count(&self) -> usize {
        let state = self.state.lock();
        state.live.len() + state.derived.len()
    }

    /// Unsubscribe and destroy every collection.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        for token in self.subscriptions.lock().drain(..) {
            self.notifications.unsubscribe(token);
        }
        let mut state = self.state.lock();
        for collection in state.live.values().chain(state.derived.values()) {
            collection.destroy();
        }
        *state = ManagerState::default();
        debug!("collection manager destroyed");
    }

    fn create(
        &self,
        kind: CollectionKind,
        query: Option<Value>,
        seed: &[ResourceIdentity],
    ) -> Collection {
        let id = CollectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut state = CollectionState::default();
        push_batched(&mut state.items, seed, self.batch_size);
        state.members.extend(seed.iter().cloned());
        let (changes, _) = watch::channel(0);

        Collection {
            inner: Arc::new(CollectionInner {
                id,
                kind,
                query,
                batch_size: self.batch_size,
                state: Mutex::new(state),
                changes,
                cache: Arc::clone(&self.cache),
                manager: self.this.clone(),
            }),
        }
    }

    fn route(&self, identity: &ResourceIdentity, op: ChangeOp) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        let mut dirty = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            match op {
                ChangeOp::Add => {
                    state.visible.insert(identity.clone(), true);
                }
                ChangeOp::Remove => {
                    state.visible.remove(identity);
                }
            }

            let resource_type = identity.resource_type();
            match state.live.get(&resource_type) {
                Some(live) => {
                    if live.queue(identity, op) {
                        dirty.push(live.clone());
                    }
                }
                None => {
                    state
                        .staged
                        .entry(resource_type)
                        .or_default()
                        .record(identity.clone(), op);
                }
            }

            if let Some(ids) = state.associations.get(identity) {
                for id in ids {
                    if let Some(collection) = state.derived.get(id)
                        && collection.queue(identity, op)
                    {
                        dirty.push(collection.clone());
                    }
                }
            }
        }
        self.mark_dirty(dirty);
    }

    fn document_changed(&self, document: &DocumentIdentity) {
        let collection = self.state.lock().keyed.get(document).cloned();
        if let Some(collection) = collection
            && collection.mark_resync()
        {
            trace!(document = %document, "keyed collection needs resync");
            self.mark_dirty(vec![collection]);
        }
    }

    /// Record derived-collection membership for identities.
    fn associate(&self, identities: &[ResourceIdentity], id: CollectionId) {
        let mut state = self.state.lock();
        if !state.derived.contains_key(&id) {
            return;
        }
        for identity in identities {
            state
                .associations
                .entry(identity.clone())
                .or_default()
                .insert(id);
        }
    }

    fn mark_dirty(&self, collections: Vec<Collection>) {
        if collections.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock();
            for collection in collections {
                state.dirty.insert(collection.id(), collection);
            }
        }
        let this = self.this.clone();
        self.scope.schedule(
            Phase::Sync,
            Box::new(move || {
                if let Some(manager) = this.upgrade() {
                    manager.signal_dirty();
                }
            }),
        );
    }

    fn signal_dirty(&self) {
        let dirty = std::mem::take(&mut self.state.lock().dirty);
        for collection in dirty.into_values() {
            collection.signal();
        }
    }
}
