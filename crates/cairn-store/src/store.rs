//! The store facade.
//!
//! Wires one registry, work scope, broker, cache, collection manager and
//! materialized-object manager together and exposes the operations callers
//! use. Every cache-affecting operation runs inside a unit of work.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{Cache, CacheCapabilities, CacheDocument, Operation, ResourceDocument};
use crate::collections::{Collection, CollectionConfig, CollectionManager};
use crate::config::{GcMode, StoreConfig};
use crate::error::StoreError;
use crate::gc::GcReport;
use crate::identity::{
    DocumentIdentity, IdentityRegistry, IdentityUpdate, ResourceIdentity, ResourceRef,
};
use crate::legacy::{LegacyCache, LegacyCacheAdapter};
use crate::materialize::{MaterializedObjects, RecordFactory, RecordObject, RecordReference};
use crate::memory::MemoryCache;
use crate::notify::{NotificationBroker, NotificationKind};
use crate::scope::WorkScope;

type CacheConstructor = Box<dyn FnOnce(CacheCapabilities) -> Arc<dyn Cache> + Send>;

/// Builder for [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    config: StoreConfig,
    factory: Option<Arc<dyn RecordFactory>>,
    cache: Option<CacheConstructor>,
}

impl StoreBuilder {
    pub fn config(mut self, config: StoreConfig) -> Self {
        self.config = config;
        self
    }

    /// Hook used to instantiate and tear down records. Required.
    pub fn record_factory(mut self, factory: impl RecordFactory + 'static) -> Self {
        self.factory = Some(Arc::new(factory));
        self
    }

    /// Use a custom cache. Defaults to [`MemoryCache`].
    pub fn cache_with<C, F>(mut self, constructor: F) -> Self
    where
        C: Cache + 'static,
        F: FnOnce(CacheCapabilities) -> C + Send + 'static,
    {
        self.cache = Some(Box::new(move |capabilities| {
            Arc::new(constructor(capabilities)) as Arc<dyn Cache>
        }));
        self
    }

    /// Use a resource-only cache behind the legacy adapter.
    pub fn legacy_cache_with<C, F>(mut self, constructor: F) -> Self
    where
        C: LegacyCache + 'static,
        F: FnOnce() -> C + Send + 'static,
    {
        self.cache = Some(Box::new(move |capabilities| {
            Arc::new(LegacyCacheAdapter::new(constructor(), capabilities)) as Arc<dyn Cache>
        }));
        self
    }

    pub fn build(self) -> Result<Arc<Store>, StoreError> {
        self.config.validate()?;
        let factory = self
            .factory
            .ok_or_else(|| StoreError::InvalidConfig("a record factory is required".into()))?;

        let registry = Arc::new(IdentityRegistry::new(self.config.lid_prefix.clone()));
        let scope = Arc::new(WorkScope::new());
        let notifications = NotificationBroker::new(Arc::clone(&registry), Arc::clone(&scope));
        let capabilities = CacheCapabilities {
            registry: Arc::clone(&registry),
            notifications: Arc::clone(&notifications),
        };
        let cache = match self.cache {
            Some(constructor) => constructor(capabilities),
            None => Arc::new(MemoryCache::new(capabilities)),
        };
        let collections = CollectionManager::new(
            Arc::clone(&cache),
            Arc::clone(&notifications),
            Arc::clone(&scope),
            self.config.collection_batch_size,
        );
        let objects = MaterializedObjects::new(
            Arc::clone(&registry),
            Arc::clone(&cache),
            Arc::clone(&notifications),
            Arc::clone(&scope),
            Arc::clone(&collections),
            factory,
        );

        debug!(gc_mode = ?self.config.gc.mode, "store built");
        Ok(Arc::new(Store {
            config: self.config,
            registry,
            scope,
            notifications,
            cache,
            collections,
            objects,
            destroyed: AtomicBool::new(false),
        }))
    }
}

/// A normalized cache with its coordination layer.
pub struct Store {
    config: StoreConfig,
    registry: Arc<IdentityRegistry>,
    scope: Arc<WorkScope>,
    notifications: Arc<NotificationBroker>,
    cache: Arc<dyn Cache>,
    collections: Arc<CollectionManager>,
    objects: Arc<MaterializedObjects>,
    destroyed: AtomicBool,
}

impl Store {
    pub fn builder() -> StoreBuilder {
        StoreBuilder::default()
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn scope(&self) -> &Arc<WorkScope> {
        &self.scope
    }

    pub fn notifications(&self) -> &Arc<NotificationBroker> {
        &self.notifications
    }

    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.cache
    }

    pub fn collections(&self) -> &Arc<CollectionManager> {
        &self.collections
    }

    pub fn objects(&self) -> &Arc<MaterializedObjects> {
        &self.objects
    }

    /// Run `f` as one unit of work, or inside the current one.
    pub fn batch<R>(&self, f: impl FnOnce() -> R) -> R {
        self.scope.join(f)
    }

    /// Write a document through the cache and root it for GC.
    pub fn put(&self, document: CacheDocument) -> Result<ResourceDocument, StoreError> {
        self.ensure_live()?;
        Ok(self.scope.join(|| {
            let stored = self.cache.put(document);
            self.objects.document_loaded(&stored);
            stored
        }))
    }

    /// Create a client-side resource with no id yet.
    pub fn create_record(
        &self,
        resource_type: &str,
        attributes: Map<String, Value>,
    ) -> Result<ResourceIdentity, StoreError> {
        self.ensure_live()?;
        let identity = self.registry.get_or_create(&ResourceRef::client(resource_type));
        self.scope
            .join(|| self.cache.client_did_create(&identity, attributes));
        Ok(identity)
    }

    /// Bind incoming key data to an identity, merging on collision.
    ///
    /// Returns the identity that represents the resource afterwards.
    pub fn update_identity(
        &self,
        identity: &ResourceIdentity,
        incoming: &ResourceRef,
    ) -> Result<ResourceIdentity, StoreError> {
        self.ensure_live()?;
        match self.registry.update_identity(identity, incoming) {
            IdentityUpdate::Unchanged => Ok(identity.clone()),
            IdentityUpdate::Updated => {
                self.scope.join(|| {
                    self.notifications
                        .notify(identity.clone(), NotificationKind::Identity, None)
                });
                Ok(identity.clone())
            }
            IdentityUpdate::Collision(existing) => {
                self.objects.merge_identities(identity, &existing, incoming)
            }
        }
    }

    /// Mark a save as in flight.
    pub fn will_commit(&self, identity: &ResourceIdentity) {
        self.scope.join(|| self.cache.will_commit(identity));
    }

    /// Apply a successful save and adopt the key the origin assigned.
    pub fn did_commit(
        &self,
        identity: &ResourceIdentity,
        data: Option<Value>,
    ) -> Result<ResourceIdentity, StoreError> {
        self.ensure_live()?;
        let assigned = self.scope.join(|| self.cache.did_commit(identity, data));
        match assigned {
            Some(incoming) => self.update_identity(identity, &incoming),
            None => Ok(identity.clone()),
        }
    }

    /// Record a rejected save without touching any document.
    pub fn commit_was_rejected(&self, identity: &ResourceIdentity, errors: Option<Value>) {
        self.scope
            .join(|| self.cache.commit_was_rejected(identity, errors));
    }

    pub fn get_record(
        &self,
        identity: &ResourceIdentity,
        properties: Option<&Map<String, Value>>,
    ) -> RecordObject {
        self.objects.get_record(identity, properties)
    }

    pub fn peek_record(&self, identity: &ResourceIdentity) -> Option<RecordObject> {
        self.objects.peek_record(identity)
    }

    pub fn get_reference(&self, identity: &ResourceIdentity) -> RecordReference {
        self.objects.get_reference(identity)
    }

    pub fn release_record(&self, identity: &ResourceIdentity) {
        self.objects.release_record(identity);
    }

    pub fn unload_record(&self, identity: &ResourceIdentity) {
        self.objects.unload_record(identity);
    }

    pub fn record_is_loaded(&self, identity: &ResourceIdentity, filter_deleted: bool) -> bool {
        self.objects.record_is_loaded(identity, filter_deleted)
    }

    pub fn live_array_for(&self, resource_type: &str) -> Collection {
        self.collections.live_array_for(resource_type)
    }

    pub fn get_collection(&self, config: CollectionConfig) -> Collection {
        self.collections.get_collection(config)
    }

    /// The keyed collection for a cached document, seeded from its primary data.
    pub fn collection_for_document(&self, document: &DocumentIdentity) -> Option<Collection> {
        let stored = self.cache.peek_request(document)?;
        Some(self.collections.get_collection(CollectionConfig {
            identity: Some(document.clone()),
            query: None,
            seed: stored.primary(),
        }))
    }

    /// Drop a document: un-root it, release its keyed collection and remove it
    /// from the cache.
    pub fn release_document(&self, document: &DocumentIdentity) {
        self.objects.release_document(document);
        if let Some(collection) = self.collections.keyed_for(document) {
            self.collections.release(&collection);
        }
        self.scope
            .join(|| self.cache.patch(Operation::RemoveDocument(document.clone())));
    }

    pub fn collect_garbage(&self) -> GcReport {
        self.objects.collect_garbage()
    }

    /// Run GC on the configured interval until `shutdown` flips to true.
    ///
    /// Returns `None` in manual mode. Must be called from within a tokio
    /// runtime.
    pub fn spawn_gc(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        if self.config.gc.mode != GcMode::Auto {
            return None;
        }
        let period = self.config.gc.interval();
        let store = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            info!(interval_ms = period.as_millis() as u64, "gc ticker started");
            let mut interval = tokio::time::interval(period);
            // The first tick completes immediately
            interval.tick().await;

            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }

                    _ = interval.tick() => {
                        let Some(store) = store.upgrade() else {
                            break;
                        };
                        if store.is_destroyed() {
                            break;
                        }
                        let report = store.collect_garbage();
                        debug!(examined = report.examined, removed = report.removed.len(), "gc tick");
                    }
                }
            }
            info!("gc ticker stopped");
        }))
    }

    pub fn fork(&self) -> Result<Arc<dyn Cache>, StoreError> {
        self.cache.fork()
    }

    pub fn merge(&self, cache: Arc<dyn Cache>) -> Result<(), StoreError> {
        self.cache.merge(cache)
    }

    pub fn diff(&self) -> Result<Value, StoreError> {
        self.cache.diff()
    }

    pub fn dump(&self) -> Result<Value, StoreError> {
        self.cache.dump()
    }

    pub fn hydrate(&self, snapshot: Value) -> Result<(), StoreError> {
        self.ensure_live()?;
        self.scope.join(|| self.cache.hydrate(snapshot))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Tear down every component. Later calls are no-ops.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            warn!("store destroyed twice");
            return;
        }
        self.objects.destroy();
        self.collections.destroy();
        self.notifications.destroy();
        info!("store destroyed");
    }

    fn ensure_live(&self) -> Result<(), StoreError> {
        if self.is_destroyed() {
            Err(StoreError::Destroyed)
        } else {
            Ok(())
        }
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("config", &self.config)
            .field("identities", &self.registry.len())
            .field("objects", &self.objects)
            .finish()
    }
}
