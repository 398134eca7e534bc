//! Request and response shapes seen by the pipeline.

use cairn_store::{RequestRef, ResourceIdentity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

/// Operations that write to the origin and are never served from cache.
const MUTATION_OPS: [&str; 3] = ["createRecord", "updateRecord", "deleteRecord"];

/// Per-request cache overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheOptions {
    /// Explicit cache key; takes precedence over url and method.
    #[serde(default)]
    pub key: Option<String>,

    /// Always fetch, even with a fresh cached response.
    #[serde(default)]
    pub reload: bool,

    /// Serve the cached response and refresh it in the background.
    #[serde(default)]
    pub background_reload: bool,

    /// Bypass the document cache entirely.
    #[serde(default)]
    pub skip_cache: bool,
}

/// An inbound request.
#[derive(Debug, Clone, Default)]
pub struct RequestInfo {
    /// Operation name such as `findRecord` or `updateRecord`.
    pub op: Option<String>,
    pub url: Option<String>,
    pub method: Option<String>,
    pub cache_options: CacheOptions,
    /// Resources a mutation saves.
    pub records: Vec<ResourceIdentity>,
    pub body: Option<Value>,
    /// Aborts the fetch when cancelled.
    pub signal: Option<CancellationToken>,
}

impl RequestInfo {
    /// A GET request for `url`.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            method: Some("GET".to_string()),
            ..Default::default()
        }
    }

    /// A save of `record` through `op`.
    pub fn mutation(op: impl Into<String>, record: ResourceIdentity) -> Self {
        Self {
            op: Some(op.into()),
            method: Some("POST".to_string()),
            records: vec![record],
            ..Default::default()
        }
    }

    pub fn with_op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    pub fn with_cache_options(mut self, options: CacheOptions) -> Self {
        self.cache_options = options;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn is_mutation(&self) -> bool {
        self.op
            .as_deref()
            .is_some_and(|op| MUTATION_OPS.contains(&op))
    }

    /// The fields that determine this request's document identity.
    pub fn request_ref(&self) -> RequestRef {
        RequestRef {
            url: self.url.clone(),
            method: self.method.clone(),
            cache_key: self.cache_options.key.clone(),
        }
    }
}

/// A successful downstream response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    pub content: Value,
}

impl Response {
    pub fn ok(content: Value) -> Self {
        Self {
            status: 200,
            content,
        }
    }
}
