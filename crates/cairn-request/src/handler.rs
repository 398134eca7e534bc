//! The cache-aware request handler.
//!
//! Every request is classified before anything is sent downstream:
//! - `Fetch`: no usable cached document, a mutation, or an explicit reload.
//!   The caller waits for the downstream handler and the result is written
//!   through the store.
//! - `ServeCached`: a fresh cached document answers the request.
//! - `BackgroundRevalidate`: the cached document is served immediately and
//!   the same fetch runs in the background, refreshing the cache so that
//!   subscribers see the new content.

use std::sync::Arc;

use async_trait::async_trait;
use cairn_store::{CacheDocument, DocumentData, DocumentIdentity, ResourceDocument, Store};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::{FetchError, RequestError};
use crate::lifetimes::{Lifetimes, TtlLifetimes};
use crate::types::{RequestInfo, Response};

/// The next stage of the request pipeline, usually the network.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn request(&self, request: &RequestInfo) -> Result<Response, FetchError>;
}

/// How a request will be satisfied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Fetch,
    ServeCached,
    BackgroundRevalidate,
}

/// Issues a request downstream and writes the outcome through the store.
#[derive(Clone)]
struct Fetcher {
    store: Arc<Store>,
    next: Arc<dyn Handler>,
    lifetimes: Arc<dyn Lifetimes>,
}

impl Fetcher {
    async fn fetch(
        &self,
        request: &RequestInfo,
        document: Option<&DocumentIdentity>,
    ) -> Result<ResourceDocument, RequestError> {
        let mutation = request.is_mutation();
        if mutation {
            for record in &request.records {
                self.store.will_commit(record);
            }
        }

        let outcome = match &request.signal {
            Some(signal) => tokio::select! {
                biased;
                _ = signal.cancelled() => None,
                outcome = self.next.request(request) => Some(outcome),
            },
            None => Some(self.next.request(request).await),
        };
        let Some(outcome) = outcome else {
            debug!(op = request.op.as_deref(), "request aborted");
            return Err(RequestError::Aborted);
        };

        if let Some(document) = document {
            self.lifetimes.did_request(document);
        }

        // Skipping the cache still normalizes resources, but stores no document
        let identity = if request.cache_options.skip_cache {
            None
        } else {
            document.cloned()
        };

        match outcome {
            Ok(response) if mutation => self.commit(request, response.content),
            Ok(response) => Ok(self.store.put(CacheDocument {
                identity,
                content: response.content,
                is_error: false,
            })?),
            Err(error) if mutation => {
                let errors = error.errors();
                self.store.batch(|| {
                    for record in &request.records {
                        self.store.commit_was_rejected(record, errors.clone());
                    }
                });
                Err(RequestError::Fetch(error))
            }
            Err(error) => {
                let content = self.store.put(CacheDocument {
                    identity,
                    content: error.to_content(),
                    is_error: true,
                })?;
                Err(RequestError::Cached {
                    source: error,
                    content: Box::new(content),
                })
            }
        }
    }

    /// Apply a successful save. The response's primary data belongs to the
    /// first record.
    fn commit(&self, request: &RequestInfo, content: Value) -> Result<ResourceDocument, RequestError> {
        let data = content.get("data").filter(|data| !data.is_null()).cloned();
        let mut survivors = self.store.batch(|| {
            request
                .records
                .iter()
                .enumerate()
                .map(|(index, record)| {
                    let data = if index == 0 { data.clone() } else { None };
                    self.store.did_commit(record, data)
                })
                .collect::<Result<Vec<_>, _>>()
        })?;

        let data = match survivors.len() {
            0 => DocumentData::Empty,
            1 => DocumentData::Single(survivors.pop()),
            _ => DocumentData::Collection(survivors),
        };
        Ok(ResourceDocument {
            identity: None,
            data,
            included: Vec::new(),
            meta: content.get("meta").cloned(),
            links: content.get("links").cloned(),
            errors: None,
        })
    }
}

/// Request handler that answers from the store's cache when it can.
pub struct CacheHandler {
    fetcher: Fetcher,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl CacheHandler {
    /// Wrap `next` with default [`TtlLifetimes`].
    pub fn new(store: Arc<Store>, next: impl Handler + 'static) -> Self {
        Self {
            fetcher: Fetcher {
                store,
                next: Arc::new(next),
                lifetimes: Arc::new(TtlLifetimes::default()),
            },
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_lifetimes(mut self, lifetimes: impl Lifetimes + 'static) -> Self {
        self.fetcher.lifetimes = Arc::new(lifetimes);
        self
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.fetcher.store
    }

    /// Classify a request without sending it.
    pub fn decide(&self, request: &RequestInfo) -> (Option<DocumentIdentity>, Decision) {
        if request.is_mutation() {
            return (None, Decision::Fetch);
        }

        let document = self
            .fetcher
            .store
            .registry()
            .get_or_create_document(&request.request_ref());
        let Some(identity) = document.as_ref() else {
            return (None, Decision::Fetch);
        };

        let options = &request.cache_options;
        let lifetimes = &self.fetcher.lifetimes;
        let decision = if options.reload || options.skip_cache {
            Decision::Fetch
        } else if self.fetcher.store.cache().peek_request(identity).is_none()
            || lifetimes.is_hard_expired(identity)
        {
            Decision::Fetch
        } else if options.background_reload || lifetimes.is_soft_expired(identity) {
            Decision::BackgroundRevalidate
        } else {
            Decision::ServeCached
        };
        (document, decision)
    }

    /// Satisfy a request from cache, the network, or both.
    #[tracing::instrument(
        skip(self, request),
        fields(op = request.op.as_deref(), url = request.url.as_deref())
    )]
    pub async fn request(&self, request: RequestInfo) -> Result<ResourceDocument, RequestError> {
        let (document, decision) = self.decide(&request);
        debug!(?decision, "request classified");

        let cached = match (&document, decision) {
            (Some(identity), Decision::ServeCached | Decision::BackgroundRevalidate) => {
                self.fetcher.store.cache().peek_request(identity)
            }
            _ => None,
        };
        // The document can be dropped between deciding and reading it
        let Some(cached) = cached else {
            return self.fetcher.fetch(&request, document.as_ref()).await;
        };

        if decision == Decision::BackgroundRevalidate
            && let Some(identity) = document
        {
            self.revalidate(request, identity);
        }

        if cached.is_error() {
            return Err(RequestError::Cached {
                source: FetchError::from_document(&cached),
                content: Box::new(cached),
            });
        }
        Ok(cached)
    }

    fn revalidate(&self, mut request: RequestInfo, document: DocumentIdentity) {
        // The caller already has its answer, its signal no longer applies
        request.signal = None;
        let fetcher = self.fetcher.clone();
        let shutdown = self.shutdown.clone();

        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    debug!(document = %document, "background revalidation cancelled");
                }
                result = fetcher.fetch(&request, Some(&document)) => {
                    match result {
                        Ok(_) => debug!(document = %document, "background revalidation complete"),
                        Err(error) => warn!(document = %document, error = %error, "background revalidation failed"),
                    }
                }
            }
        });
    }

    /// Wait for every background revalidation started so far.
    pub async fn settled(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Cancel background revalidations and wait for them to stop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Number of background revalidations still running.
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }
}

impl std::fmt::Debug for CacheHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandler")
            .field("in_flight", &self.tasks.len())
            .field("shut_down", &self.shutdown.is_cancelled())
            .finish()
    }
}
