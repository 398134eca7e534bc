//! Readers for JSON:API-shaped resource objects.
//!
//! Payloads are already normalized by the time they reach the cache; these
//! helpers only pick fields out of them and never validate shape.

use serde_json::{Map, Value};

use crate::identity::ResourceRef;

/// Primary data member of a document.
pub(crate) enum Primary<'a> {
    Absent,
    Single(Option<&'a Value>),
    Many(&'a [Value]),
}

pub(crate) fn primary(content: &Value) -> Primary<'_> {
    match content.get("data") {
        None => Primary::Absent,
        Some(Value::Null) => Primary::Single(None),
        Some(Value::Array(items)) => Primary::Many(items),
        Some(item) => Primary::Single(Some(item)),
    }
}

pub(crate) fn included(content: &Value) -> &[Value] {
    content
        .get("included")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default()
}

/// The `type`/`id`/`lid` of a resource object or resource identifier object.
pub(crate) fn resource_ref(value: &Value) -> Option<ResourceRef> {
    let object = value.as_object()?;
    let read = |key: &str| -> Option<String> {
        match object.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    };
    let reference = ResourceRef {
        resource_type: read("type"),
        id: read("id"),
        lid: read("lid"),
    };
    if reference.resource_type.is_none() && reference.lid.is_none() {
        return None;
    }
    Some(reference)
}

pub(crate) fn attributes(value: &Value) -> Map<String, Value> {
    value
        .get("attributes")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// Relationship linkage, in payload order. Fields without a `data` member
/// (links-only relationships) are skipped.
pub(crate) fn relationships(value: &Value) -> Vec<(String, Vec<ResourceRef>)> {
    let Some(fields) = value.get("relationships").and_then(Value::as_object) else {
        return Vec::new();
    };

    fields
        .iter()
        .filter_map(|(field, relationship)| {
            let refs = match relationship.get("data")? {
                Value::Null => Vec::new(),
                Value::Array(items) => items.iter().filter_map(resource_ref).collect(),
                item => resource_ref(item).into_iter().collect(),
            };
            Some((field.clone(), refs))
        })
        .collect()
}
