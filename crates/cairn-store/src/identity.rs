//! Identity tokens and the registry that interns them.
//!
//! Every logical resource gets exactly one live [`ResourceIdentity`], and
//! every addressable request gets exactly one [`DocumentIdentity`]. Tokens are
//! cheap handles compared by lid, which is assigned at creation and never
//! changes.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::DEFAULT_LID_PREFIX;

/// A reference to a resource as seen in a payload or passed by a caller.
///
/// Any subset of the fields may be present; lookups prefer `lid`, then
/// `type` + `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lid: Option<String>,
}

impl ResourceRef {
    /// A reference to a remote resource by type and id.
    pub fn new(resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            id: Some(id.into()),
            lid: None,
        }
    }

    /// A reference to a client-created resource that has no id yet.
    pub fn client(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: Some(resource_type.into()),
            id: None,
            lid: None,
        }
    }

    /// A reference by lid only.
    pub fn lid(lid: impl Into<String>) -> Self {
        Self {
            resource_type: None,
            id: None,
            lid: Some(lid.into()),
        }
    }

    pub fn with_lid(mut self, lid: impl Into<String>) -> Self {
        self.lid = Some(lid.into());
        self
    }
}

#[derive(Debug)]
struct IdentityKey {
    resource_type: Arc<str>,
    id: Option<Arc<str>>,
    /// Set once an id has been bound; the key is immutable afterwards.
    confirmed: bool,
}

struct IdentityInner {
    lid: Arc<str>,
    key: RwLock<IdentityKey>,
    stale: AtomicBool,
}

/// Canonical token for one logical resource.
#[derive(Clone)]
pub struct ResourceIdentity {
    inner: Arc<IdentityInner>,
}

impl ResourceIdentity {
    fn new(lid: Arc<str>, resource_type: Arc<str>, id: Option<Arc<str>>) -> Self {
        let confirmed = id.is_some();
        Self {
            inner: Arc::new(IdentityInner {
                lid,
                key: RwLock::new(IdentityKey {
                    resource_type,
                    id,
                    confirmed,
                }),
                stale: AtomicBool::new(false),
            }),
        }
    }

    pub fn lid(&self) -> &str {
        &self.inner.lid
    }

    pub fn resource_type(&self) -> Arc<str> {
        Arc::clone(&self.inner.key.read().resource_type)
    }

    pub fn id(&self) -> Option<Arc<str>> {
        self.inner.key.read().id.clone()
    }

    /// Whether this token lost a merge and has been retired.
    pub fn is_stale(&self) -> bool {
        self.inner.stale.load(Ordering::SeqCst)
    }

    /// Whether both handles are the very same token.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the token's current type and id agree with the incoming data.
    ///
    /// Fields absent from `incoming` are not compared.
    pub fn matches(&self, incoming: &ResourceRef) -> bool {
        let key = self.inner.key.read();
        let id_matches = match &incoming.id {
            Some(id) => key.id.as_deref() == Some(id.as_str()),
            None => true,
        };
        let type_matches = match &incoming.resource_type {
            Some(t) => &*key.resource_type == t.as_str(),
            None => true,
        };
        id_matches && type_matches
    }

    /// A reference carrying every field of this token.
    pub fn to_ref(&self) -> ResourceRef {
        let key = self.inner.key.read();
        ResourceRef {
            resource_type: Some(key.resource_type.to_string()),
            id: key.id.as_deref().map(String::from),
            lid: Some(self.inner.lid.to_string()),
        }
    }

    fn type_and_id(&self) -> (Arc<str>, Option<Arc<str>>) {
        let key = self.inner.key.read();
        (Arc::clone(&key.resource_type), key.id.clone())
    }
}

impl PartialEq for ResourceIdentity {
    fn eq(&self, other: &Self) -> bool {
        self.inner.lid == other.inner.lid
    }
}

impl Eq for ResourceIdentity {}

impl Hash for ResourceIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.lid.hash(state);
    }
}

impl fmt::Debug for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let key = self.inner.key.read();
        f.debug_struct("ResourceIdentity")
            .field("type", &key.resource_type)
            .field("id", &key.id)
            .field("lid", &self.inner.lid)
            .finish()
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.lid)
    }
}

/// Canonical token for an addressable request/response document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentIdentity {
    lid: Arc<str>,
}

impl DocumentIdentity {
    pub fn lid(&self) -> &str {
        &self.lid
    }
}

impl fmt::Display for DocumentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.lid)
    }
}

/// The parts of a request that determine its document identity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestRef {
    pub url: Option<String>,
    pub method: Option<String>,
    pub cache_key: Option<String>,
}

/// Either kind of identity token.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Resource(ResourceIdentity),
    Document(DocumentIdentity),
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Resource(identity) => identity.fmt(f),
            Identifier::Document(identity) => identity.fmt(f),
        }
    }
}

impl From<ResourceIdentity> for Identifier {
    fn from(identity: ResourceIdentity) -> Self {
        Identifier::Resource(identity)
    }
}

impl From<DocumentIdentity> for Identifier {
    fn from(identity: DocumentIdentity) -> Self {
        Identifier::Document(identity)
    }
}

/// Result of binding new key data to an existing identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityUpdate {
    /// The identity already carried this key.
    Unchanged,
    /// The id was bound to the identity.
    Updated,
    /// Another live identity already owns the incoming key; a merge is required.
    Collision(ResourceIdentity),
}

/// Outcome of merging two identities.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub survivor: ResourceIdentity,
    pub stale: ResourceIdentity,
}

/// A retired lid (and key) that now resolves to its survivor.
#[derive(Debug)]
struct Alias {
    lid: Arc<str>,
    key: Option<(Arc<str>, Arc<str>)>,
}

#[derive(Default)]
struct RegistryState {
    /// lid -> identity. Aliased lids point at their survivor.
    by_lid: HashMap<Arc<str>, ResourceIdentity>,
    /// type -> id -> identity.
    by_key: HashMap<Arc<str>, HashMap<Arc<str>, ResourceIdentity>>,
    /// survivor lid -> retired aliases.
    aliases: HashMap<Arc<str>, Vec<Alias>>,
    /// cache key -> document identity.
    documents: HashMap<Arc<str>, DocumentIdentity>,
}

impl RegistryState {
    fn lookup(&self, reference: &ResourceRef) -> Option<ResourceIdentity> {
        if let Some(lid) = reference.lid.as_deref()
            && let Some(found) = self.by_lid.get(lid)
        {
            return Some(found.clone());
        }

        match (reference.resource_type.as_deref(), reference.id.as_deref()) {
            (Some(resource_type), Some(id)) => self
                .by_key
                .get(resource_type)
                .and_then(|ids| ids.get(id))
                .cloned(),
            _ => None,
        }
    }

    fn bind_key(&mut self, resource_type: Arc<str>, id: Arc<str>, identity: ResourceIdentity) {
        self.by_key
            .entry(resource_type)
            .or_default()
            .insert(id, identity);
    }

    fn unbind_key(&mut self, resource_type: &str, id: &str) {
        if let Some(ids) = self.by_key.get_mut(resource_type) {
            ids.remove(id);
            if ids.is_empty() {
                self.by_key.remove(resource_type);
            }
        }
    }
}

/// Interns identity tokens for resources and documents.
pub struct IdentityRegistry {
    lid_prefix: String,
    state: Mutex<RegistryState>,
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_LID_PREFIX)
    }
}

impl IdentityRegistry {
    /// Create an empty registry that generates lids with the given prefix.
    pub fn new(lid_prefix: impl Into<String>) -> Self {
        Self {
            lid_prefix: lid_prefix.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Return the token for a resource, creating it on first reference.
    ///
    /// # Panics
    ///
    /// Panics if no identity exists and the reference carries no type.
    pub fn get_or_create(&self, reference: &ResourceRef) -> ResourceIdentity {
        let mut state = self.state.lock();
        if let Some(found) = state.lookup(reference) {
            return found;
        }

        let Some(resource_type) = reference.resource_type.as_deref() else {
            panic!("cannot create an identity without a type: {reference:?}");
        };

        let lid: Arc<str> = match &reference.lid {
            Some(lid) => Arc::from(lid.as_str()),
            None => Arc::from(self.generate_lid(resource_type)),
        };
        let resource_type: Arc<str> = Arc::from(resource_type);
        let id: Option<Arc<str>> = reference.id.as_deref().map(Arc::from);

        let identity = ResourceIdentity::new(Arc::clone(&lid), Arc::clone(&resource_type), id.clone());
        state.by_lid.insert(lid, identity.clone());
        if let Some(id) = id {
            state.bind_key(resource_type, id, identity.clone());
        }

        trace!(lid = %identity, "identity created");
        identity
    }

    /// Non-creating lookup. Retired lids resolve to their survivor.
    pub fn peek(&self, reference: &ResourceRef) -> Option<ResourceIdentity> {
        self.state.lock().lookup(reference)
    }

    /// Return the document token for a request, creating it on first use.
    ///
    /// An explicit cache key always produces an identity. Without one, only
    /// GET requests with a url are addressable; mutations return `None`.
    pub fn get_or_create_document(&self, request: &RequestRef) -> Option<DocumentIdentity> {
        let key = document_key(request)?;
        let mut state = self.state.lock();
        let identity = state
            .documents
            .entry(Arc::from(key))
            .or_insert_with_key(|key| DocumentIdentity {
                lid: Arc::clone(key),
            })
            .clone();
        Some(identity)
    }

    /// Non-creating document lookup.
    pub fn peek_document(&self, request: &RequestRef) -> Option<DocumentIdentity> {
        let key = document_key(request)?;
        self.state.lock().documents.get(key).cloned()
    }

    /// Bind incoming key data (typically an origin-confirmed id) to an identity.
    ///
    /// # Panics
    ///
    /// Panics when trying to change the id of an identity whose id is
    /// already confirmed.
    pub fn update_identity(
        &self,
        identity: &ResourceIdentity,
        incoming: &ResourceRef,
    ) -> IdentityUpdate {
        let Some(new_id) = incoming.id.as_deref() else {
            return IdentityUpdate::Unchanged;
        };

        let mut state = self.state.lock();
        let (current_type, current_id) = identity.type_and_id();
        let new_type: Arc<str> = match incoming.resource_type.as_deref() {
            Some(t) => Arc::from(t),
            None => Arc::clone(&current_type),
        };

        if current_id.as_deref() == Some(new_id) && current_type == new_type {
            return IdentityUpdate::Unchanged;
        }

        if let Some(current_id) = &current_id {
            panic!(
                "cannot change the id of {} from {}:{} to {}:{}",
                identity, current_type, current_id, new_type, new_id
            );
        }

        if let Some(existing) = state.by_key.get(&*new_type).and_then(|ids| ids.get(new_id))
            && existing != identity
        {
            debug!(lid = %identity, existing = %existing, id = new_id, "identity collision");
            return IdentityUpdate::Collision(existing.clone());
        }

        let new_id: Arc<str> = Arc::from(new_id);
        {
            let mut key = identity.inner.key.write();
            key.resource_type = Arc::clone(&new_type);
            key.id = Some(Arc::clone(&new_id));
            key.confirmed = true;
        }
        state.bind_key(new_type, new_id, identity.clone());

        trace!(lid = %identity, "identity updated");
        IdentityUpdate::Updated
    }

    /// Merge two tokens discovered to denote the same resource.
    ///
    /// The survivor is the token whose existing key already matches the
    /// incoming data; when both or neither match, `primary` survives. The
    /// loser is marked stale and its lid and key resolve to the survivor from
    /// now on.
    ///
    /// # Panics
    ///
    /// Panics if both arguments are the same identity.
    pub fn merge(
        &self,
        primary: &ResourceIdentity,
        secondary: &ResourceIdentity,
        incoming: &ResourceRef,
    ) -> MergeOutcome {
        assert!(
            primary != secondary,
            "cannot merge identity {primary} with itself"
        );

        let (survivor, stale) = if secondary.matches(incoming) && !primary.matches(incoming) {
            (secondary.clone(), primary.clone())
        } else {
            (primary.clone(), secondary.clone())
        };

        let mut state = self.state.lock();
        stale.inner.stale.store(true, Ordering::SeqCst);

        let (stale_type, stale_id) = stale.type_and_id();
        let stale_key = stale_id.map(|id| (stale_type, id));
        if let Some((t, id)) = &stale_key {
            state.bind_key(Arc::clone(t), Arc::clone(id), survivor.clone());
        }

        let survivor_lid: Arc<str> = Arc::from(survivor.lid());
        let stale_lid: Arc<str> = Arc::from(stale.lid());
        state.by_lid.insert(Arc::clone(&stale_lid), survivor.clone());

        // Aliases of the stale token follow it to the survivor.
        let mut moved = state.aliases.remove(&stale_lid).unwrap_or_default();
        for alias in &moved {
            state.by_lid.insert(Arc::clone(&alias.lid), survivor.clone());
            if let Some((t, id)) = &alias.key {
                state.bind_key(Arc::clone(t), Arc::clone(id), survivor.clone());
            }
        }
        moved.push(Alias {
            lid: stale_lid,
            key: stale_key,
        });
        state.aliases.entry(survivor_lid).or_default().extend(moved);

        // An unconfirmed survivor adopts the incoming key.
        if let Some(new_id) = incoming.id.as_deref() {
            let mut key = survivor.inner.key.write();
            if !key.confirmed {
                if let Some(t) = incoming.resource_type.as_deref() {
                    key.resource_type = Arc::from(t);
                }
                let new_id: Arc<str> = Arc::from(new_id);
                key.id = Some(Arc::clone(&new_id));
                key.confirmed = true;
                let resource_type = Arc::clone(&key.resource_type);
                drop(key);
                state.bind_key(resource_type, new_id, survivor.clone());
            } else if key.id.as_deref() != Some(new_id) {
                debug!(
                    survivor = %survivor,
                    id = new_id,
                    "merge survivor keeps its confirmed id over incoming data"
                );
            }
        }

        debug!(survivor = %survivor, stale = %stale, "identities merged");
        MergeOutcome { survivor, stale }
    }

    /// Drop an identity (and every alias resolving to it) from the registry.
    pub fn forget(&self, identity: &ResourceIdentity) {
        let mut state = self.state.lock();
        let lid: Arc<str> = Arc::from(identity.lid());

        match state.by_lid.get(&lid) {
            Some(found) if found.ptr_eq(identity) => {}
            _ => {
                trace!(lid = %identity, "forget ignored for unknown or retired identity");
                return;
            }
        }

        state.by_lid.remove(&lid);
        let (resource_type, id) = identity.type_and_id();
        if let Some(id) = id {
            state.unbind_key(&resource_type, &id);
        }
        for alias in state.aliases.remove(&lid).unwrap_or_default() {
            state.by_lid.remove(&alias.lid);
            if let Some((t, id)) = alias.key {
                state.unbind_key(&t, &id);
            }
        }

        trace!(lid = %identity, "identity forgotten");
    }

    /// Drop a document identity.
    pub fn forget_document(&self, identity: &DocumentIdentity) {
        self.state.lock().documents.remove(&identity.lid);
    }

    /// Whether the identifier is still live (not forgotten, not retired).
    pub fn is_registered(&self, identifier: &Identifier) -> bool {
        let state = self.state.lock();
        match identifier {
            Identifier::Resource(identity) => state
                .by_lid
                .get(identity.lid())
                .is_some_and(|found| found.ptr_eq(identity)),
            Identifier::Document(identity) => state.documents.contains_key(&identity.lid),
        }
    }

    /// Number of live resource identities.
    pub fn len(&self) -> usize {
        let state = self.state.lock();
        state
            .by_lid
            .iter()
            .filter(|(lid, identity)| identity.lid() == &***lid)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn generate_lid(&self, resource_type: &str) -> String {
        format!("{}{}-{}", self.lid_prefix, resource_type, Uuid::new_v4())
    }
}

fn document_key(request: &RequestRef) -> Option<&str> {
    if let Some(key) = request.cache_key.as_deref() {
        return Some(key);
    }
    let is_get = request
        .method
        .as_deref()
        .is_none_or(|m| m.eq_ignore_ascii_case("GET"));
    if is_get { request.url.as_deref() } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_create_returns_same_token() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::new("user", "1"));
        let b = registry.get_or_create(&ResourceRef::new("user", "1"));
        let c = registry.get_or_create(&ResourceRef::lid(a.lid()));

        assert!(a.ptr_eq(&b));
        assert!(a.ptr_eq(&c));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_generated_lid_uses_prefix_and_type() {
        let registry = IdentityRegistry::new("@test:");
        let identity = registry.get_or_create(&ResourceRef::client("post"));
        assert!(identity.lid().starts_with("@test:post-"));
        assert!(identity.id().is_none());
    }

    #[test]
    fn test_explicit_lid_is_kept() {
        let registry = IdentityRegistry::default();
        let identity =
            registry.get_or_create(&ResourceRef::new("user", "1").with_lid("user-one"));
        assert_eq!(identity.lid(), "user-one");
        assert!(registry.peek(&ResourceRef::new("user", "1")).is_some());
    }

    #[test]
    #[should_panic(expected = "without a type")]
    fn test_create_without_type_panics() {
        let registry = IdentityRegistry::default();
        registry.get_or_create(&ResourceRef::lid("nothing"));
    }

    #[test]
    fn test_peek_does_not_create() {
        let registry = IdentityRegistry::default();
        assert!(registry.peek(&ResourceRef::new("user", "1")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update_identity_binds_id() {
        let registry = IdentityRegistry::default();
        let identity = registry.get_or_create(&ResourceRef::client("user"));

        let update = registry.update_identity(&identity, &ResourceRef::new("user", "9"));
        assert_eq!(update, IdentityUpdate::Updated);
        assert_eq!(identity.id().as_deref(), Some("9"));

        let found = registry.peek(&ResourceRef::new("user", "9")).unwrap();
        assert!(found.ptr_eq(&identity));

        let again = registry.update_identity(&identity, &ResourceRef::new("user", "9"));
        assert_eq!(again, IdentityUpdate::Unchanged);
    }

    #[test]
    fn test_update_identity_reports_collision() {
        let registry = IdentityRegistry::default();
        let client = registry.get_or_create(&ResourceRef::client("user"));
        let remote = registry.get_or_create(&ResourceRef::new("user", "5"));

        let update = registry.update_identity(&client, &ResourceRef::new("user", "5"));
        assert_eq!(update, IdentityUpdate::Collision(remote));
        assert!(client.id().is_none());
    }

    #[test]
    #[should_panic(expected = "cannot change the id")]
    fn test_confirmed_id_is_immutable() {
        let registry = IdentityRegistry::default();
        let identity = registry.get_or_create(&ResourceRef::new("user", "1"));
        registry.update_identity(&identity, &ResourceRef::new("user", "2"));
    }

    #[test]
    fn test_merge_prefers_matching_identity() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::client("user"));
        let b = registry.get_or_create(&ResourceRef::new("user", "5"));

        let outcome = registry.merge(&a, &b, &ResourceRef::new("user", "5"));
        assert!(outcome.survivor.ptr_eq(&b));
        assert!(outcome.stale.ptr_eq(&a));
        assert!(a.is_stale());

        // The stale lid resolves to the survivor
        let peeked = registry.peek(&ResourceRef::lid(a.lid())).unwrap();
        assert!(peeked.ptr_eq(&b));
        let created = registry.get_or_create(&ResourceRef::lid(a.lid()));
        assert!(created.ptr_eq(&b));

        assert!(!registry.is_registered(&Identifier::Resource(a)));
        assert!(registry.is_registered(&Identifier::Resource(b)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_merge_falls_back_to_primary() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::new("user", "1"));
        let b = registry.get_or_create(&ResourceRef::new("user", "2"));

        let outcome = registry.merge(&a, &b, &ResourceRef::new("user", "3"));
        assert!(outcome.survivor.ptr_eq(&a));
        assert_eq!(a.id().as_deref(), Some("1"));

        // The retired key resolves to the survivor
        let peeked = registry.peek(&ResourceRef::new("user", "2")).unwrap();
        assert!(peeked.ptr_eq(&a));
    }

    #[test]
    fn test_unconfirmed_survivor_adopts_incoming_id() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::client("user"));
        let b = registry.get_or_create(&ResourceRef::client("user"));

        let outcome = registry.merge(&a, &b, &ResourceRef::new("user", "7"));
        assert!(outcome.survivor.ptr_eq(&a));
        assert_eq!(a.id().as_deref(), Some("7"));
        assert!(registry.peek(&ResourceRef::new("user", "7")).unwrap().ptr_eq(&a));
    }

    #[test]
    fn test_chained_merges_follow_survivor() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::client("user"));
        let b = registry.get_or_create(&ResourceRef::new("user", "5"));
        let c = registry.get_or_create(&ResourceRef::client("user"));

        registry.merge(&a, &b, &ResourceRef::new("user", "5"));
        registry.merge(&b, &c, &ResourceRef::new("user", "5"));

        let peeked = registry.peek(&ResourceRef::lid(a.lid())).unwrap();
        assert!(peeked.ptr_eq(&b));

        registry.forget(&b);
        assert!(registry.peek(&ResourceRef::lid(a.lid())).is_none());
        assert!(registry.peek(&ResourceRef::lid(c.lid())).is_none());
        assert!(registry.peek(&ResourceRef::new("user", "5")).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    #[should_panic(expected = "with itself")]
    fn test_merge_with_self_panics() {
        let registry = IdentityRegistry::default();
        let a = registry.get_or_create(&ResourceRef::new("user", "1"));
        registry.merge(&a, &a, &ResourceRef::new("user", "1"));
    }

    #[test]
    fn test_forget_then_recreate_gets_new_token() {
        let registry = IdentityRegistry::default();
        let first = registry.get_or_create(&ResourceRef::new("user", "1"));
        registry.forget(&first);

        assert!(!registry.is_registered(&Identifier::Resource(first.clone())));
        let second = registry.get_or_create(&ResourceRef::new("user", "1"));
        assert!(!second.ptr_eq(&first));
        assert_ne!(second.lid(), first.lid());
    }

    #[test]
    fn test_document_identity_rules() {
        let registry = IdentityRegistry::default();

        let get = RequestRef {
            url: Some("/api/users".into()),
            method: Some("GET".into()),
            cache_key: None,
        };
        let doc = registry.get_or_create_document(&get).unwrap();
        assert_eq!(doc.lid(), "/api/users");
        assert_eq!(registry.get_or_create_document(&get), Some(doc.clone()));

        let post = RequestRef {
            url: Some("/api/users".into()),
            method: Some("POST".into()),
            cache_key: None,
        };
        assert!(registry.get_or_create_document(&post).is_none());

        let keyed = RequestRef {
            cache_key: Some("users:mine".into()),
            ..post
        };
        assert_eq!(
            registry.get_or_create_document(&keyed).unwrap().lid(),
            "users:mine"
        );

        registry.forget_document(&doc);
        assert!(!registry.is_registered(&Identifier::Document(doc)));
        assert!(registry.peek_document(&get).is_none());
    }
}
