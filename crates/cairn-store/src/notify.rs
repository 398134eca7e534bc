//! Batching notification broker.
//!
//! Observers subscribe to a single identity or to one of the broadcast
//! channels. Notifications are buffered, deduplicated by
//! `(identifier, kind, field)`, and delivered once per unit of work during its
//! notify phase. Outside a unit of work, `notify` flushes synchronously.
//!
//! Each thread buffers separately. A unit of work belongs to one thread, so a
//! flush only ever delivers notifications from the unit that scheduled it,
//! never from a unit another thread still has open.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::identity::{Identifier, IdentityRegistry};
use crate::scope::{Phase, WorkScope};

/// What changed about an identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    /// A resource or document entered the cache.
    Added,
    /// A resource or document left the cache.
    Removed,
    /// Cached content was replaced.
    Updated,
    /// Cached content was marked as needing a refetch.
    Invalidated,
    /// Lifecycle state (new, deleted, committed) changed.
    State,
    /// A specific attribute changed.
    Attributes,
    /// A specific relationship changed.
    Relationships,
    /// The identity's key (id/type) changed.
    Identity,
    /// Validation or request errors changed.
    Errors,
    /// Meta information changed.
    Meta,
}

impl NotificationKind {
    /// Whether this is a structural cache-operation kind.
    ///
    /// Broadcast kinds are buffered even without direct subscribers and are
    /// delivered to channel subscribers.
    pub fn is_broadcast(self) -> bool {
        matches!(
            self,
            NotificationKind::Added
                | NotificationKind::Removed
                | NotificationKind::Updated
                | NotificationKind::Invalidated
                | NotificationKind::State
        )
    }
}

/// Broadcast channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Structural events about resources.
    Resource,
    /// Structural events about documents.
    Document,
}

impl Channel {
    fn for_identifier(identifier: &Identifier) -> Self {
        match identifier {
            Identifier::Resource(_) => Channel::Resource,
            Identifier::Document(_) => Channel::Document,
        }
    }
}

/// What a subscription listens to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SubscriptionTarget {
    Identifier(Identifier),
    Channel(Channel),
}

impl From<Identifier> for SubscriptionTarget {
    fn from(identifier: Identifier) -> Self {
        SubscriptionTarget::Identifier(identifier)
    }
}

impl From<Channel> for SubscriptionTarget {
    fn from(channel: Channel) -> Self {
        SubscriptionTarget::Channel(channel)
    }
}

/// A delivered notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Notification {
    pub identifier: Identifier,
    pub kind: NotificationKind,
    pub field: Option<Arc<str>>,
}

/// Opaque handle returned by [`NotificationBroker::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(u64);

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Removes the current thread from the flushing set, even on unwind.
struct FlushMark<'a> {
    flushing: &'a Mutex<HashSet<ThreadId>>,
    thread: ThreadId,
}

impl Drop for FlushMark<'_> {
    fn drop(&mut self) {
        self.flushing.lock().remove(&self.thread);
    }
}

/// Pub/sub keyed by identifier or broadcast channel.
pub struct NotificationBroker {
    this: Weak<Self>,
    registry: Arc<IdentityRegistry>,
    scope: Arc<WorkScope>,
    subscribers: DashMap<SubscriptionTarget, IndexMap<SubscriptionToken, Callback>>,
    tokens: DashMap<SubscriptionToken, SubscriptionTarget>,
    /// Pending notifications per producing thread.
    buffers: DashMap<ThreadId, IndexSet<Notification>>,
    /// Threads currently inside `flush`.
    flushing: Mutex<HashSet<ThreadId>>,
    next_token: AtomicU64,
    destroyed: AtomicBool,
}

impl NotificationBroker {
    pub fn new(registry: Arc<IdentityRegistry>, scope: Arc<WorkScope>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            scope,
            subscribers: DashMap::new(),
            tokens: DashMap::new(),
            buffers: DashMap::new(),
            flushing: Mutex::new(HashSet::new()),
            next_token: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Register `callback` for `target`.
    ///
    /// # Panics
    ///
    /// Panics if the broker has been destroyed.
    pub fn subscribe<F>(&self, target: impl Into<SubscriptionTarget>, callback: F) -> SubscriptionToken
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        assert!(
            !self.is_destroyed(),
            "cannot subscribe to a destroyed notification broker"
        );

        let target = target.into();
        let token = SubscriptionToken(self.next_token.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .entry(target.clone())
            .or_default()
            .insert(token, Arc::new(callback));
        trace!(?target, token = token.0, "subscribed");
        self.tokens.insert(token, target);
        token
    }

    /// Remove a subscription. Unknown tokens and destroyed brokers are a no-op.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if self.is_destroyed() {
            return;
        }
        let Some((_, target)) = self.tokens.remove(&token) else {
            return;
        };
        if let Some(mut callbacks) = self.subscribers.get_mut(&target) {
            callbacks.shift_remove(&token);
        }
        self.subscribers
            .remove_if(&target, |_, callbacks| callbacks.is_empty());
        trace!(?target, token = token.0, "unsubscribed");
    }

    /// Queue a notification and make sure a flush is scheduled.
    ///
    /// Returns whether anyone will hear about it. Notifications for
    /// identifiers that are not registered are logged and dropped.
    pub fn notify(
        &self,
        identifier: impl Into<Identifier>,
        kind: NotificationKind,
        field: Option<&str>,
    ) -> bool {
        if self.is_destroyed() {
            return false;
        }

        let identifier = identifier.into();
        if !self.registry.is_registered(&identifier) {
            warn!(identifier = %identifier, ?kind, "notify for unregistered identifier dropped");
            return false;
        }

        let has_direct = self.has_subscribers(&SubscriptionTarget::Identifier(identifier.clone()));
        let has_listeners = if kind.is_broadcast() {
            has_direct
                || self.has_subscribers(&SubscriptionTarget::Channel(Channel::for_identifier(
                    &identifier,
                )))
        } else {
            has_direct
        };

        if !kind.is_broadcast() && !has_direct {
            return false;
        }

        let inserted = self
            .buffers
            .entry(thread::current().id())
            .or_default()
            .insert(Notification {
                identifier,
                kind,
                field: field.map(Arc::from),
            });
        if inserted {
            self.schedule_flush();
        }
        has_listeners
    }

    /// Deliver every notification the current thread has buffered.
    ///
    /// Notifications queued by callbacks on this thread are delivered in a
    /// follow-up cycle before this returns.
    pub fn flush(&self) {
        let thread = thread::current().id();
        if !self.flushing.lock().insert(thread) {
            // Re-entrant: the outer loop picks up anything new.
            return;
        }
        let _mark = FlushMark {
            flushing: &self.flushing,
            thread,
        };

        loop {
            let batch = self
                .buffers
                .remove(&thread)
                .map(|(_, batch)| batch)
                .unwrap_or_default();
            if batch.is_empty() {
                break;
            }
            trace!(count = batch.len(), "flushing notifications");
            for notification in &batch {
                self.deliver(notification);
            }
        }
    }

    /// Number of pending notifications across all threads.
    pub fn pending(&self) -> usize {
        self.buffers.iter().map(|batch| batch.len()).sum()
    }

    /// Drop every subscription and pending notification.
    pub fn destroy(&self) {
        self.destroyed.store(true, Ordering::SeqCst);
        self.subscribers.clear();
        self.tokens.clear();
        self.buffers.clear();
        debug!("notification broker destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn has_subscribers(&self, target: &SubscriptionTarget) -> bool {
        self.subscribers
            .get(target)
            .is_some_and(|callbacks| !callbacks.is_empty())
    }

    /// Outside a unit of work the scope runs the flush immediately.
    fn schedule_flush(&self) {
        let this = self.this.clone();
        self.scope.schedule(
            Phase::Notify,
            Box::new(move || {
                if let Some(broker) = this.upgrade() {
                    broker.flush();
                }
            }),
        );
    }

    fn deliver(&self, notification: &Notification) {
        let mut callbacks: Vec<Callback> = Vec::new();

        if self.registry.is_registered(&notification.identifier) {
            if let Some(direct) = self
                .subscribers
                .get(&SubscriptionTarget::Identifier(notification.identifier.clone()))
            {
                callbacks.extend(direct.values().cloned());
            }
        } else {
            debug!(
                identifier = %notification.identifier,
                kind = ?notification.kind,
                "identifier forgotten before flush, skipping direct subscribers"
            );
        }

        if notification.kind.is_broadcast() {
            let channel = Channel::for_identifier(&notification.identifier);
            if let Some(listeners) = self.subscribers.get(&SubscriptionTarget::Channel(channel)) {
                callbacks.extend(listeners.values().cloned());
            }
        }

        for callback in callbacks {
            callback(notification);
        }
    }
}
