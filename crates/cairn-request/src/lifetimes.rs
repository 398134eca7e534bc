//! Expiration policy for cached documents.

use cairn_store::DocumentIdentity;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use tracing::trace;

/// Default age after which a cached document is refreshed in the background.
pub const DEFAULT_SOFT_TTL_SECS: i64 = 30;

/// Default age after which a cached document must be refetched.
pub const DEFAULT_HARD_TTL_SECS: i64 = 300;

/// Decides whether cached documents are still usable.
pub trait Lifetimes: Send + Sync {
    /// The document must be refetched before it is served.
    fn is_hard_expired(&self, document: &DocumentIdentity) -> bool;

    /// The document may be served but should be refreshed.
    fn is_soft_expired(&self, document: &DocumentIdentity) -> bool;

    /// A fetch for the document just completed.
    fn did_request(&self, _document: &DocumentIdentity) {}
}

/// Age-based expiration keyed on the last completed fetch.
///
/// Documents with no recorded fetch (hydrated from a snapshot, say) are
/// treated as fresh.
#[derive(Debug)]
pub struct TtlLifetimes {
    soft: Duration,
    hard: Duration,
    fetched: DashMap<DocumentIdentity, DateTime<Utc>>,
}

impl Default for TtlLifetimes {
    fn default() -> Self {
        Self::new(
            Duration::seconds(DEFAULT_SOFT_TTL_SECS),
            Duration::seconds(DEFAULT_HARD_TTL_SECS),
        )
    }
}

impl TtlLifetimes {
    pub fn new(soft: Duration, hard: Duration) -> Self {
        Self {
            soft,
            hard,
            fetched: DashMap::new(),
        }
    }

    /// Record a fetch at a specific time.
    pub fn record_at(&self, document: &DocumentIdentity, at: DateTime<Utc>) {
        self.fetched.insert(document.clone(), at);
    }

    /// When the document was last fetched.
    pub fn fetched_at(&self, document: &DocumentIdentity) -> Option<DateTime<Utc>> {
        self.fetched.get(document).map(|at| *at)
    }

    fn age(&self, document: &DocumentIdentity) -> Option<Duration> {
        self.fetched_at(document).map(|at| Utc::now() - at)
    }
}

impl Lifetimes for TtlLifetimes {
    fn is_hard_expired(&self, document: &DocumentIdentity) -> bool {
        self.age(document).is_some_and(|age| age >= self.hard)
    }

    fn is_soft_expired(&self, document: &DocumentIdentity) -> bool {
        self.age(document).is_some_and(|age| age >= self.soft)
    }

    fn did_request(&self, document: &DocumentIdentity) {
        trace!(document = %document, "fetch recorded");
        self.record_at(document, Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cairn_store::{IdentityRegistry, RequestRef};

    fn document() -> DocumentIdentity {
        IdentityRegistry::default()
            .get_or_create_document(&RequestRef {
                url: Some("/users".into()),
                ..Default::default()
            })
            .unwrap()
    }

    #[test]
    fn test_unknown_documents_are_fresh() {
        let lifetimes = TtlLifetimes::default();
        let doc = document();
        assert!(!lifetimes.is_soft_expired(&doc));
        assert!(!lifetimes.is_hard_expired(&doc));
    }

    #[test]
    fn test_ages_through_soft_then_hard() {
        let lifetimes = TtlLifetimes::new(Duration::seconds(10), Duration::seconds(60));
        let doc = document();

        lifetimes.did_request(&doc);
        assert!(!lifetimes.is_soft_expired(&doc));

        lifetimes.record_at(&doc, Utc::now() - Duration::seconds(30));
        assert!(lifetimes.is_soft_expired(&doc));
        assert!(!lifetimes.is_hard_expired(&doc));

        lifetimes.record_at(&doc, Utc::now() - Duration::seconds(90));
        assert!(lifetimes.is_hard_expired(&doc));
    }
}
