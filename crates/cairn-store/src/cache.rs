//! The cache interface the coordination layer drives.
//!
//! The cache owns resource and document content. The coordination layer only
//! asks it questions (`peek`, `is_new`, `relationships`) and tells it about
//! lifecycle events (`put`, `did_commit`, `unload_record`). Implementations
//! report structural changes through the [`CacheCapabilities`] they are
//! constructed with.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::StoreError;
use crate::identity::{
    DocumentIdentity, Identifier, IdentityRegistry, RequestRef, ResourceIdentity, ResourceRef,
};
use crate::notify::{NotificationBroker, NotificationKind};

/// A response (or locally built content) to be written into the cache.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheDocument {
    /// Document identity, if the request is addressable.
    pub identity: Option<DocumentIdentity>,
    /// Raw JSON:API-shaped content: `data`, `included`, `meta`, `links`, `errors`.
    pub content: Value,
    /// Whether this content came from a failed request.
    pub is_error: bool,
}

/// Primary data of a document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DocumentData {
    /// No `data` member (error or meta-only documents).
    #[default]
    Empty,
    Single(Option<ResourceIdentity>),
    Collection(Vec<ResourceIdentity>),
}

/// A document as stored in the cache, with resources replaced by identities.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceDocument {
    pub identity: Option<DocumentIdentity>,
    pub data: DocumentData,
    pub included: Vec<ResourceIdentity>,
    pub meta: Option<Value>,
    pub links: Option<Value>,
    pub errors: Option<Value>,
}

impl ResourceDocument {
    /// Identities in the primary data, in order.
    pub fn primary(&self) -> Vec<ResourceIdentity> {
        match &self.data {
            DocumentData::Empty | DocumentData::Single(None) => Vec::new(),
            DocumentData::Single(Some(identity)) => vec![identity.clone()],
            DocumentData::Collection(identities) => identities.clone(),
        }
    }

    /// Every identity the document directly includes (primary data first).
    pub fn resources(&self) -> Vec<ResourceIdentity> {
        let mut all = self.primary();
        for identity in &self.included {
            if !all.contains(identity) {
                all.push(identity.clone());
            }
        }
        all
    }

    pub fn is_error(&self) -> bool {
        self.errors.is_some()
    }

    /// Replace `stale` with `survivor` everywhere in the document.
    pub fn rewrite_identity(&mut self, stale: &ResourceIdentity, survivor: &ResourceIdentity) {
        let swap = |identity: &mut ResourceIdentity| {
            if identity == stale {
                *identity = survivor.clone();
            }
        };
        match &mut self.data {
            DocumentData::Single(Some(identity)) => swap(identity),
            DocumentData::Collection(identities) => {
                identities.iter_mut().for_each(swap);
                dedup_in_order(identities);
            }
            _ => {}
        }
        self.included.iter_mut().for_each(swap);
        dedup_in_order(&mut self.included);
    }
}

fn dedup_in_order(identities: &mut Vec<ResourceIdentity>) {
    let mut seen = std::collections::HashSet::new();
    identities.retain(|identity| seen.insert(identity.clone()));
}

/// Structural operations applied with [`Cache::patch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// Fold the state of `record` (the stale identity) into `value` (the survivor).
    MergeIdentifiers {
        record: ResourceIdentity,
        value: ResourceIdentity,
    },
    /// Drop a cached document.
    RemoveDocument(DocumentIdentity),
}

/// Local relationship edits applied with [`Cache::mutate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    AddToRelationship {
        record: ResourceIdentity,
        field: String,
        value: Vec<ResourceIdentity>,
        index: Option<usize>,
    },
    RemoveFromRelationship {
        record: ResourceIdentity,
        field: String,
        value: Vec<ResourceIdentity>,
    },
    ReplaceRelatedRecord {
        record: ResourceIdentity,
        field: String,
        value: Option<ResourceIdentity>,
    },
}

impl Mutation {
    /// The resource whose relationship is being edited.
    pub fn record(&self) -> &ResourceIdentity {
        match self {
            Mutation::AddToRelationship { record, .. }
            | Mutation::RemoveFromRelationship { record, .. }
            | Mutation::ReplaceRelatedRecord { record, .. } => record,
        }
    }
}

/// How a relationship edge came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeOrigin {
    /// Present in a payload received from the origin.
    Remote,
    /// Created by a local mutation.
    Mutation,
    /// The inverse side of another resource's edge.
    Implicit,
}

/// One outgoing relationship edge of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RelationshipEdge {
    pub field: String,
    pub target: ResourceIdentity,
    pub origin: EdgeOrigin,
}

/// The normalized cache.
pub trait Cache: Send + Sync {
    /// Write a document and every resource it contains. Returns the stored document.
    fn put(&self, document: CacheDocument) -> ResourceDocument;

    fn patch(&self, operation: Operation);

    fn mutate(&self, mutation: Mutation);

    /// The resource object for an identity, if any data is cached.
    fn peek(&self, identity: &ResourceIdentity) -> Option<Value>;

    fn peek_request(&self, identity: &DocumentIdentity) -> Option<ResourceDocument>;

    /// Merge a single resource object. Returns changed attribute names when
    /// `has_record` is set and the resource already existed.
    fn upsert(&self, identity: &ResourceIdentity, data: Value, has_record: bool)
    -> Option<Vec<String>>;

    /// Register a client-created resource.
    fn client_did_create(&self, identity: &ResourceIdentity, attributes: Map<String, Value>);

    /// Set a local attribute value.
    fn set_attr(&self, identity: &ResourceIdentity, field: &str, value: Value);

    /// Mark (or unmark) a resource as locally deleted.
    fn set_is_deleted(&self, identity: &ResourceIdentity, deleted: bool);

    fn will_commit(&self, identity: &ResourceIdentity);

    /// Apply a successful save. Returns the key the origin assigned, if the
    /// response carried one.
    fn did_commit(&self, identity: &ResourceIdentity, data: Option<Value>) -> Option<ResourceRef>;

    fn commit_was_rejected(&self, identity: &ResourceIdentity, errors: Option<Value>);

    fn unload_record(&self, identity: &ResourceIdentity);

    /// Whether nothing is cached for the identity.
    fn is_empty(&self, identity: &ResourceIdentity) -> bool;

    fn is_new(&self, identity: &ResourceIdentity) -> bool;

    fn is_deleted(&self, identity: &ResourceIdentity) -> bool;

    fn is_deletion_committed(&self, identity: &ResourceIdentity) -> bool;

    /// Outgoing edges, including implicit inverse edges.
    fn relationships(&self, identity: &ResourceIdentity) -> Vec<RelationshipEdge>;

    fn fork(&self) -> Result<Arc<dyn Cache>, StoreError> {
        Err(StoreError::Unsupported("fork"))
    }

    fn merge(&self, _cache: Arc<dyn Cache>) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("merge"))
    }

    fn diff(&self) -> Result<Value, StoreError> {
        Err(StoreError::Unsupported("diff"))
    }

    fn dump(&self) -> Result<Value, StoreError> {
        Err(StoreError::Unsupported("dump"))
    }

    fn hydrate(&self, _snapshot: Value) -> Result<(), StoreError> {
        Err(StoreError::Unsupported("hydrate"))
    }
}

/// Whether the cache holds a usable resource for `identity`.
///
/// New resources count as loaded unless deleted. Otherwise a committed
/// deletion hides the resource when `filter_deleted` is set, and anything
/// with cached data is loaded.
pub fn record_is_loaded(cache: &dyn Cache, identity: &ResourceIdentity, filter_deleted: bool) -> bool {
    if cache.is_new(identity) {
        return !cache.is_deleted(identity);
    }
    if filter_deleted && cache.is_deletion_committed(identity) {
        return false;
    }
    !cache.is_empty(identity)
}

/// Handles a cache implementation needs from the store.
#[derive(Clone)]
pub struct CacheCapabilities {
    pub registry: Arc<IdentityRegistry>,
    pub notifications: Arc<NotificationBroker>,
}

impl CacheCapabilities {
    pub fn identity_for(&self, reference: &ResourceRef) -> ResourceIdentity {
        self.registry.get_or_create(reference)
    }

    pub fn document_for(&self, request: &RequestRef) -> Option<DocumentIdentity> {
        self.registry.get_or_create_document(request)
    }

    /// Report a change. Must not be called while holding a cache lock.
    pub fn notify_change(
        &self,
        identifier: impl Into<Identifier>,
        kind: NotificationKind,
        field: Option<&str>,
    ) -> bool {
        self.notifications.notify(identifier, kind, field)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(registry: &IdentityRegistry, n: usize) -> Vec<ResourceIdentity> {
        (0..n)
            .map(|i| registry.get_or_create(&ResourceRef::new("user", i.to_string())))
            .collect()
    }

    #[test]
    fn test_resources_lists_primary_then_included() {
        let registry = IdentityRegistry::default();
        let users = ids(&registry, 3);
        let document = ResourceDocument {
            data: DocumentData::Collection(vec![users[0].clone(), users[1].clone()]),
            included: vec![users[1].clone(), users[2].clone()],
            ..Default::default()
        };

        assert_eq!(document.primary(), vec![users[0].clone(), users[1].clone()]);
        assert_eq!(document.resources(), users);
    }

    #[test]
    fn test_rewrite_identity_dedups() {
        let registry = IdentityRegistry::default();
        let users = ids(&registry, 2);
        let mut document = ResourceDocument {
            data: DocumentData::Collection(vec![users[0].clone(), users[1].clone()]),
            ..Default::default()
        };

        document.rewrite_identity(&users[0], &users[1]);
        assert_eq!(document.primary(), vec![users[1].clone()]);
    }
}
