//! Coordination layer for a normalized in-memory cache.
//!
//! This crate provides:
//! - An identity registry interning one token per resource and per document
//! - A notification broker that batches and coalesces change events
//! - Reactive collections that apply pending changes lazily and in bulk
//! - A materialized-object manager with a tracing GC over the request graph
//! - A [`Store`] facade wiring them together around a pluggable [`Cache`]

mod cache;
mod changeset;
mod collections;
mod config;
mod error;
mod gc;
mod identity;
mod legacy;
mod materialize;
mod memory;
mod notify;
mod payload;
mod scope;
mod store;

pub use cache::{
    Cache, CacheCapabilities, CacheDocument, DocumentData, EdgeOrigin, Mutation, Operation,
    RelationshipEdge, ResourceDocument, record_is_loaded,
};
pub use changeset::{ChangeOp, ChangeSet, SyncSummary, push_batched, sync_items};
pub use collections::{Collection, CollectionConfig, CollectionId, CollectionKind, CollectionManager};
pub use config::{
    DEFAULT_BATCH_SIZE, DEFAULT_GC_INTERVAL_MS, DEFAULT_LID_PREFIX, GcConfig, GcMode, StoreConfig,
    StoreConfigBuilder,
};
pub use error::StoreError;
pub use gc::GcReport;
pub use identity::{
    DocumentIdentity, Identifier, IdentityRegistry, IdentityUpdate, MergeOutcome, RequestRef,
    ResourceIdentity, ResourceRef,
};
pub use legacy::{LegacyCache, LegacyCacheAdapter};
pub use materialize::{MaterializedObjects, RecordFactory, RecordObject, RecordReference};
pub use memory::MemoryCache;
pub use notify::{
    Channel, Notification, NotificationBroker, NotificationKind, SubscriptionTarget,
    SubscriptionToken,
};
pub use scope::{Deferred, Phase, WorkGuard, WorkScope};
pub use store::{Store, StoreBuilder};
