//! Reference in-memory normalized cache.
//!
//! Stores resource objects (`{type, id, lid, attributes, relationships}`)
//! keyed by identity and documents keyed by document identity. Remote state
//! and local edits are kept apart so relationship edges can report whether
//! they came from a payload or from a local mutation.
//!
//! Notifications are collected while the resource lock is held and emitted
//! only after it is released.

use std::collections::HashMap;

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use crate::cache::{
    Cache, CacheCapabilities, CacheDocument, DocumentData, EdgeOrigin, Mutation, Operation,
    RelationshipEdge, ResourceDocument,
};
use crate::error::StoreError;
use crate::identity::{DocumentIdentity, Identifier, RequestRef, ResourceIdentity, ResourceRef};
use crate::notify::NotificationKind;
use crate::payload::{self, Primary};

type Relationships = IndexMap<String, Vec<ResourceIdentity>>;

#[derive(Debug, Default)]
struct ResourceEntry {
    remote: Map<String, Value>,
    local: Map<String, Value>,
    remote_relationships: Relationships,
    local_relationships: Relationships,
    has_remote: bool,
    is_new: bool,
    is_deleted: bool,
    deletion_committed: bool,
    in_flight: bool,
    errors: Option<Value>,
}

impl ResourceEntry {
    fn is_empty(&self) -> bool {
        !self.has_remote && !self.is_new
    }

    fn attributes(&self) -> Map<String, Value> {
        let mut merged = self.remote.clone();
        merged.extend(self.local.clone());
        merged
    }

    /// Current relationship state: local edits override remote linkage.
    fn effective_relationships(&self) -> impl Iterator<Item = (&String, &Vec<ResourceIdentity>)> {
        let fields: IndexSet<&String> = self
            .remote_relationships
            .keys()
            .chain(self.local_relationships.keys())
            .collect();
        fields.into_iter().filter_map(|field| {
            self.local_relationships
                .get(field)
                .or_else(|| self.remote_relationships.get(field))
                .map(|targets| (field, targets))
        })
    }

    fn edges(&self) -> Vec<RelationshipEdge> {
        let mut edges = Vec::new();
        for (field, targets) in self.effective_relationships() {
            let remote = self.remote_relationships.get(field);
            for target in targets {
                let origin = if remote.is_some_and(|r| r.contains(target)) {
                    EdgeOrigin::Remote
                } else {
                    EdgeOrigin::Mutation
                };
                edges.push(RelationshipEdge {
                    field: field.clone(),
                    target: target.clone(),
                    origin,
                });
            }
        }
        edges
    }

    /// Local relationship state for `field`, seeded from remote linkage.
    fn local_field(&mut self, field: &str) -> &mut Vec<ResourceIdentity> {
        let remote = &self.remote_relationships;
        self.local_relationships
            .entry(field.to_string())
            .or_insert_with(|| remote.get(field).cloned().unwrap_or_default())
    }

    fn rewrite_identity(&mut self, stale: &ResourceIdentity, survivor: &ResourceIdentity) {
        for targets in self
            .remote_relationships
            .values_mut()
            .chain(self.local_relationships.values_mut())
        {
            if !targets.contains(stale) {
                continue;
            }
            let mut seen = IndexSet::new();
            for target in targets.drain(..) {
                seen.insert(if &target == stale { survivor.clone() } else { target });
            }
            targets.extend(seen);
        }
    }
}

struct StoredDocument {
    document: ResourceDocument,
    content: Value,
    is_error: bool,
}

/// A resource object with its references resolved to identities.
struct ParsedResource {
    identity: ResourceIdentity,
    attributes: Map<String, Value>,
    relationships: Vec<(String, Vec<ResourceIdentity>)>,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    lid: String,
    content: Value,
    #[serde(default)]
    is_error: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    resources: Vec<Value>,
    #[serde(default)]
    documents: Vec<SnapshotDocument>,
}

type Pending = Vec<(Identifier, NotificationKind, Option<String>)>;

/// In-memory [`Cache`] implementation.
pub struct MemoryCache {
    capabilities: CacheCapabilities,
    resources: Mutex<HashMap<ResourceIdentity, ResourceEntry>>,
    documents: DashMap<DocumentIdentity, StoredDocument>,
}

impl MemoryCache {
    pub fn new(capabilities: CacheCapabilities) -> Self {
        Self {
            capabilities,
            resources: Mutex::new(HashMap::new()),
            documents: DashMap::new(),
        }
    }

    /// Number of cached resources.
    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    /// Number of cached documents.
    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    fn emit(&self, pending: Pending) {
        for (identifier, kind, field) in pending {
            self.capabilities
                .notify_change(identifier, kind, field.as_deref());
        }
    }

    fn resolve(&self, reference: &ResourceRef) -> Option<ResourceIdentity> {
        if reference.resource_type.is_some() {
            Some(self.capabilities.identity_for(reference))
        } else {
            self.capabilities.registry.peek(reference)
        }
    }

    fn parse_with(&self, identity: ResourceIdentity, value: &Value) -> ParsedResource {
        let relationships = payload::relationships(value)
            .into_iter()
            .map(|(field, refs)| {
                let targets = refs.iter().filter_map(|r| self.resolve(r)).collect();
                (field, targets)
            })
            .collect();
        ParsedResource {
            identity,
            attributes: payload::attributes(value),
            relationships,
        }
    }

    fn parse(&self, value: &Value) -> Option<ParsedResource> {
        let reference = payload::resource_ref(value)?;
        let identity = self.resolve(&reference)?;
        Some(self.parse_with(identity, value))
    }

    /// Merge a parsed resource. Returns changed attribute names and whether
    /// the resource was new to the cache.
    fn apply(
        entries: &mut HashMap<ResourceIdentity, ResourceEntry>,
        parsed: ParsedResource,
        pending: &mut Pending,
    ) -> (Vec<String>, bool) {
        let entry = entries.entry(parsed.identity.clone()).or_default();
        let added = entry.is_empty();

        let mut changed = Vec::new();
        for (field, value) in parsed.attributes {
            if entry.remote.get(&field) != Some(&value) {
                changed.push(field.clone());
                entry.remote.insert(field, value);
            }
        }
        for (field, targets) in parsed.relationships {
            if entry.remote_relationships.get(&field) != Some(&targets) {
                if !added {
                    pending.push((
                        parsed.identity.clone().into(),
                        NotificationKind::Relationships,
                        Some(field.clone()),
                    ));
                }
                entry.remote_relationships.insert(field, targets);
            }
        }
        entry.has_remote = true;

        if added {
            pending.push((parsed.identity.into(), NotificationKind::Added, None));
        } else {
            for field in &changed {
                pending.push((
                    parsed.identity.clone().into(),
                    NotificationKind::Attributes,
                    Some(field.clone()),
                ));
            }
        }
        (changed, added)
    }

    fn render(identity: &ResourceIdentity, entry: &ResourceEntry) -> Value {
        let relationships: Map<String, Value> = entry
            .effective_relationships()
            .map(|(field, targets)| {
                let data: Vec<Value> = targets
                    .iter()
                    .map(|t| serde_json::to_value(t.to_ref()).unwrap_or(Value::Null))
                    .collect();
                (field.clone(), json!({ "data": data }))
            })
            .collect();

        let mut object = Map::new();
        object.insert("type".into(), json!(&*identity.resource_type()));
        if let Some(id) = identity.id() {
            object.insert("id".into(), json!(&*id));
        }
        object.insert("lid".into(), json!(identity.lid()));
        object.insert("attributes".into(), Value::Object(entry.attributes()));
        if !relationships.is_empty() {
            object.insert("relationships".into(), Value::Object(relationships));
        }
        if let Some(errors) = &entry.errors {
            object.insert("errors".into(), errors.clone());
        }
        Value::Object(object)
    }

    fn with_entry<R>(
        &self,
        identity: &ResourceIdentity,
        f: impl FnOnce(&ResourceEntry) -> R,
    ) -> Option<R> {
        self.resources.lock().get(identity).map(f)
    }
}

impl Cache for MemoryCache {
    fn put(&self, document: CacheDocument) -> ResourceDocument {
        let content = &document.content;

        let (data, primary) = match payload::primary(content) {
            Primary::Absent => (DocumentData::Empty, Vec::new()),
            Primary::Single(None) => (DocumentData::Single(None), Vec::new()),
            Primary::Single(Some(value)) => {
                let parsed: Vec<_> = self.parse(value).into_iter().collect();
                let identity = parsed.first().map(|p| p.identity.clone());
                (DocumentData::Single(identity), parsed)
            }
            Primary::Many(values) => {
                let parsed: Vec<_> = values.iter().filter_map(|v| self.parse(v)).collect();
                let identities = parsed.iter().map(|p| p.identity.clone()).collect();
                (DocumentData::Collection(identities), parsed)
            }
        };
        let included: Vec<ParsedResource> = payload::included(content)
            .iter()
            .filter_map(|v| self.parse(v))
            .collect();
        let included_identities = included.iter().map(|p| p.identity.clone()).collect();

        let mut pending = Pending::new();
        {
            let mut entries = self.resources.lock();
            for parsed in primary.into_iter().chain(included) {
                Self::apply(&mut entries, parsed, &mut pending);
            }
        }

        let errors = match content.get("errors") {
            Some(errors) => Some(errors.clone()),
            None if document.is_error => Some(Value::Array(Vec::new())),
            None => None,
        };

        let stored = ResourceDocument {
            identity: document.identity.clone(),
            data,
            included: included_identities,
            meta: content.get("meta").cloned(),
            links: content.get("links").cloned(),
            errors,
        };

        if let Some(identity) = &document.identity {
            let previous = self.documents.insert(
                identity.clone(),
                StoredDocument {
                    document: stored.clone(),
                    content: document.content.clone(),
                    is_error: document.is_error,
                },
            );
            let kind = if previous.is_some() {
                NotificationKind::Updated
            } else {
                NotificationKind::Added
            };
            pending.push((identity.clone().into(), kind, None));
            trace!(document = %identity, "document cached");
        }

        self.emit(pending);
        stored
    }

    fn patch(&self, operation: Operation) {
        match operation {
            Operation::MergeIdentifiers { record, value } => {
                {
                    let mut entries = self.resources.lock();
                    if let Some(stale) = entries.remove(&record) {
                        match entries.get_mut(&value) {
                            None => {
                                entries.insert(value.clone(), stale);
                            }
                            Some(survivor) => {
                                for (field, v) in stale.local {
                                    survivor.local.entry(field).or_insert(v);
                                }
                                for (field, targets) in stale.local_relationships {
                                    survivor.local_relationships.entry(field).or_insert(targets);
                                }
                                survivor.has_remote |= stale.has_remote;
                            }
                        }
                    }
                    for entry in entries.values_mut() {
                        entry.rewrite_identity(&record, &value);
                    }
                }
                for mut stored in self.documents.iter_mut() {
                    stored.document.rewrite_identity(&record, &value);
                }
                debug!(stale = %record, survivor = %value, "cache merged identities");
            }
            Operation::RemoveDocument(identity) => {
                if self.documents.remove(&identity).is_some() {
                    self.emit(vec![(identity.into(), NotificationKind::Removed, None)]);
                }
            }
        }
    }

    fn mutate(&self, mutation: Mutation) {
        let record = mutation.record().clone();
        let field = {
            let mut entries = self.resources.lock();
            let entry = entries.entry(record.clone()).or_default();
            match mutation {
                Mutation::AddToRelationship {
                    field, value, index, ..
                } => {
                    let targets = entry.local_field(&field);
                    let mut at = index.unwrap_or(targets.len()).min(targets.len());
                    for target in value {
                        if !targets.contains(&target) {
                            targets.insert(at, target);
                            at += 1;
                        }
                    }
                    field
                }
                Mutation::RemoveFromRelationship { field, value, .. } => {
                    entry.local_field(&field).retain(|t| !value.contains(t));
                    field
                }
                Mutation::ReplaceRelatedRecord { field, value, .. } => {
                    let targets = entry.local_field(&field);
                    targets.clear();
                    targets.extend(value);
                    field
                }
            }
        };
        self.emit(vec![(record.into(), NotificationKind::Relationships, Some(field))]);
    }

    fn peek(&self, identity: &ResourceIdentity) -> Option<Value> {
        let entries = self.resources.lock();
        let entry = entries.get(identity).filter(|e| !e.is_empty())?;
        Some(Self::render(identity, entry))
    }

    fn peek_request(&self, identity: &DocumentIdentity) -> Option<ResourceDocument> {
        self.documents.get(identity).map(|stored| stored.document.clone())
    }

    fn upsert(
        &self,
        identity: &ResourceIdentity,
        data: Value,
        has_record: bool,
    ) -> Option<Vec<String>> {
        let parsed = self.parse_with(identity.clone(), &data);
        let mut pending = Pending::new();
        let (changed, added) = {
            let mut entries = self.resources.lock();
            Self::apply(&mut entries, parsed, &mut pending)
        };
        self.emit(pending);
        (has_record && !added).then_some(changed)
    }

    fn client_did_create(&self, identity: &ResourceIdentity, attributes: Map<String, Value>) {
        {
            let mut entries = self.resources.lock();
            let entry = entries.entry(identity.clone()).or_default();
            entry.is_new = true;
            entry.local.extend(attributes);
        }
        self.emit(vec![(identity.clone().into(), NotificationKind::Added, None)]);
    }

    fn set_attr(&self, identity: &ResourceIdentity, field: &str, value: Value) {
        self.resources
            .lock()
            .entry(identity.clone())
            .or_default()
            .local
            .insert(field.to_string(), value);
        self.emit(vec![(
            identity.clone().into(),
            NotificationKind::Attributes,
            Some(field.to_string()),
        )]);
    }

    fn set_is_deleted(&self, identity: &ResourceIdentity, deleted: bool) {
        let changed = {
            let mut entries = self.resources.lock();
            match entries.get_mut(identity) {
                Some(entry) if entry.is_deleted != deleted => {
                    entry.is_deleted = deleted;
                    true
                }
                _ => false,
            }
        };
        if changed {
            self.emit(vec![(identity.clone().into(), NotificationKind::State, None)]);
        }
    }

    fn will_commit(&self, identity: &ResourceIdentity) {
        if let Some(entry) = self.resources.lock().get_mut(identity) {
            entry.in_flight = true;
        }
    }

    fn did_commit(&self, identity: &ResourceIdentity, data: Option<Value>) -> Option<ResourceRef> {
        let key = data.as_ref().and_then(payload::resource_ref);
        let parsed = data.as_ref().map(|value| self.parse_with(identity.clone(), value));

        {
            let mut entries = self.resources.lock();
            let entry = entries.entry(identity.clone()).or_default();
            entry.in_flight = false;
            entry.errors = None;
            entry.is_new = false;
            if entry.is_deleted {
                entry.deletion_committed = true;
            }
            let local = std::mem::take(&mut entry.local);
            entry.remote.extend(local);
            if let Some(parsed) = parsed {
                entry.remote.extend(parsed.attributes);
                entry.remote_relationships.extend(parsed.relationships);
            }
            entry.has_remote = true;
        }

        self.emit(vec![(identity.clone().into(), NotificationKind::State, None)]);
        key
    }

    fn commit_was_rejected(&self, identity: &ResourceIdentity, errors: Option<Value>) {
        if let Some(entry) = self.resources.lock().get_mut(identity) {
            entry.in_flight = false;
            entry.errors = errors;
        }
        self.emit(vec![
            (identity.clone().into(), NotificationKind::Errors, None),
            (identity.clone().into(), NotificationKind::State, None),
        ]);
    }

    fn unload_record(&self, identity: &ResourceIdentity) {
        let removed = self.resources.lock().remove(identity).is_some();
        if removed {
            trace!(lid = %identity, "resource unloaded");
            self.emit(vec![(identity.clone().into(), NotificationKind::Removed, None)]);
        }
    }

    fn is_empty(&self, identity: &ResourceIdentity) -> bool {
        self.with_entry(identity, ResourceEntry::is_empty)
            .unwrap_or(true)
    }

    fn is_new(&self, identity: &ResourceIdentity) -> bool {
        self.with_entry(identity, |e| e.is_new).unwrap_or(false)
    }

    fn is_deleted(&self, identity: &ResourceIdentity) -> bool {
        self.with_entry(identity, |e| e.is_deleted).unwrap_or(false)
    }

    fn is_deletion_committed(&self, identity: &ResourceIdentity) -> bool {
        self.with_entry(identity, |e| e.deletion_committed)
            .unwrap_or(false)
    }

    fn relationships(&self, identity: &ResourceIdentity) -> Vec<RelationshipEdge> {
        let entries = self.resources.lock();
        let mut edges = entries.get(identity).map(ResourceEntry::edges).unwrap_or_default();

        // Inverse side of every edge pointing at this identity.
        for (other, entry) in entries.iter() {
            if other == identity || edges.iter().any(|e| &e.target == other) {
                continue;
            }
            for (field, targets) in entry.effective_relationships() {
                if targets.contains(identity) {
                    edges.push(RelationshipEdge {
                        field: field.clone(),
                        target: other.clone(),
                        origin: EdgeOrigin::Implicit,
                    });
                    break;
                }
            }
        }
        edges
    }

    fn diff(&self) -> Result<Value, StoreError> {
        let entries = self.resources.lock();
        let dirty: Vec<Value> = entries
            .iter()
            .filter(|(_, e)| {
                e.is_new || e.is_deleted || !e.local.is_empty() || !e.local_relationships.is_empty()
            })
            .map(|(identity, entry)| {
                json!({
                    "lid": identity.lid(),
                    "attributes": entry.local,
                    "isNew": entry.is_new,
                    "isDeleted": entry.is_deleted,
                    "inFlight": entry.in_flight,
                    "errors": entry.errors,
                })
            })
            .collect();
        Ok(Value::Array(dirty))
    }

    fn dump(&self) -> Result<Value, StoreError> {
        let resources = {
            let entries = self.resources.lock();
            entries
                .iter()
                .filter(|(_, e)| e.has_remote)
                .map(|(identity, entry)| Self::render(identity, entry))
                .collect()
        };
        let documents = self
            .documents
            .iter()
            .map(|stored| SnapshotDocument {
                lid: stored.key().lid().to_string(),
                content: stored.content.clone(),
                is_error: stored.is_error,
            })
            .collect();
        Ok(serde_json::to_value(Snapshot {
            resources,
            documents,
        })?)
    }

    fn hydrate(&self, snapshot: Value) -> Result<(), StoreError> {
        let snapshot: Snapshot = serde_json::from_value(snapshot)?;
        for value in &snapshot.resources {
            if let Some(parsed) = self.parse(value) {
                let identity = parsed.identity.clone();
                self.upsert(&identity, value.clone(), false);
            }
        }
        for stored in snapshot.documents {
            let identity = self.capabilities.document_for(&RequestRef {
                cache_key: Some(stored.lid),
                ..Default::default()
            });
            self.put(CacheDocument {
                identity,
                content: stored.content,
                is_error: stored.is_error,
            });
        }
        Ok(())
    }
}
