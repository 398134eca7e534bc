//! Error types for the request pipeline.

use cairn_store::{ResourceDocument, StoreError};
use serde_json::Value;
use thiserror::Error;

/// A failure reported by the downstream handler.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("request failed{}: {message}", .status.map(|s| format!(" with status {s}")).unwrap_or_default())]
pub struct FetchError {
    /// HTTP-like status code, if there was a response.
    pub status: Option<u16>,
    pub message: String,
    /// Error body, usually `{"errors": [...]}`.
    pub body: Option<Value>,
}

impl FetchError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    /// Reconstruct an error from a cached error document.
    pub fn from_document(document: &ResourceDocument) -> Self {
        let first = document
            .errors
            .as_ref()
            .and_then(|errors| errors.as_array())
            .and_then(|errors| errors.first());
        let status = first.and_then(|error| match error.get("status") {
            Some(Value::String(s)) => s.parse().ok(),
            Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
            _ => None,
        });
        let message = first
            .and_then(|error| error.get("detail").or_else(|| error.get("title")))
            .and_then(Value::as_str)
            .unwrap_or("cached error document")
            .to_string();
        Self {
            status,
            message,
            body: None,
        }
    }

    /// The error content to cache when the downstream gave no body.
    pub(crate) fn to_content(&self) -> Value {
        match &self.body {
            Some(body) => body.clone(),
            None => serde_json::json!({
                "errors": [{
                    "status": self.status.map(|s| s.to_string()),
                    "detail": self.message,
                }]
            }),
        }
    }

    /// The `errors` member of the body, if any.
    pub(crate) fn errors(&self) -> Option<Value> {
        self.body.as_ref().and_then(|body| body.get("errors")).cloned()
    }
}

/// Errors surfaced by [`CacheHandler::request`](crate::CacheHandler::request).
#[derive(Debug, Error)]
pub enum RequestError {
    /// The request's cancellation signal fired before it settled.
    #[error("request aborted")]
    Aborted,

    /// A mutation was rejected. The error is the downstream one, unchanged.
    #[error(transparent)]
    Fetch(FetchError),

    /// A query failed and its error document was written to the cache.
    #[error("{source}")]
    Cached {
        source: FetchError,
        content: Box<ResourceDocument>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl RequestError {
    /// The best-known content for the failed request.
    pub fn content(&self) -> Option<&ResourceDocument> {
        match self {
            RequestError::Cached { content, .. } => Some(content),
            _ => None,
        }
    }

    /// The downstream error, if the failure came from the handler.
    pub fn fetch_error(&self) -> Option<&FetchError> {
        match self {
            RequestError::Fetch(error) | RequestError::Cached { source: error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::DocumentData;
    use serde_json::json;

    #[test]
    fn test_display_includes_status() {
        let error = FetchError::new(Some(404), "not found");
        assert_eq!(error.to_string(), "request failed with status 404: not found");
        assert_eq!(FetchError::new(None, "offline").to_string(), "request failed: offline");
    }

    #[test]
    fn test_default_content_carries_status() {
        let content = FetchError::new(Some(500), "boom").to_content();
        assert_eq!(content["errors"][0]["status"], json!("500"));
        assert_eq!(content["errors"][0]["detail"], json!("boom"));
    }

    #[test]
    fn test_from_cached_document() {
        let document = ResourceDocument {
            data: DocumentData::Empty,
            errors: Some(json!([{"status": "404", "detail": "missing"}])),
            ..Default::default()
        };
        let error = FetchError::from_document(&document);
        assert_eq!(error.status, Some(404));
        assert_eq!(error.message, "missing");
    }
}
