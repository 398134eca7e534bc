//! Non-reentrant unit-of-work scope with ordered deferred phases.
//!
//! All cache-affecting work runs inside a unit of work. Entering returns a
//! [`WorkGuard`]; dropping the guard releases the scope and then runs the
//! deferred phases in order: coalesce, sync, notify. Each phase holds at most
//! one callback per unit of work, so callers keep their own pending state and
//! schedule a single drain.

use std::thread::{self, ThreadId};

use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

/// A deferred callback.
pub type Deferred = Box<dyn FnOnce() + Send>;

/// The deferred phases of a unit of work, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Identity-merge bookkeeping.
    Coalesce,
    /// Collection changeset signalling.
    Sync,
    /// Notification flush.
    Notify,
}

impl Phase {
    fn slot(self) -> usize {
        match self {
            Phase::Coalesce => 0,
            Phase::Sync => 1,
            Phase::Notify => 2,
        }
    }
}

/// Serializes units of work and holds their deferred phases.
#[derive(Default)]
pub struct WorkScope {
    /// Held for the lifetime of a unit of work.
    work: Mutex<()>,
    owner: Mutex<Option<ThreadId>>,
    slots: Mutex<[Option<Deferred>; 3]>,
}

impl WorkScope {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a unit of work.
    ///
    /// Blocks while another thread is inside one.
    ///
    /// # Panics
    ///
    /// Panics if the current thread is already inside a unit of work.
    pub fn enter(&self) -> WorkGuard<'_> {
        let me = thread::current().id();
        if *self.owner.lock() == Some(me) {
            panic!("nested unit of work: the current thread is already inside one");
        }

        let lock = self.work.lock();
        *self.owner.lock() = Some(me);
        trace!("unit of work entered");

        WorkGuard {
            scope: self,
            lock: Some(lock),
        }
    }

    /// Run `f` inside a unit of work.
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Enter a unit of work unless the current thread is already inside one.
    ///
    /// Returns the guard only when a new unit of work was entered; the outer
    /// guard keeps owning the deferred phases otherwise.
    pub fn acquire(&self) -> Option<WorkGuard<'_>> {
        (!self.is_active()).then(|| self.enter())
    }

    /// Run `f` in the current thread's unit of work, entering a new one if
    /// there is none.
    pub fn join<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.acquire();
        f()
    }

    /// Whether the current thread is inside a unit of work.
    pub fn is_active(&self) -> bool {
        *self.owner.lock() == Some(thread::current().id())
    }

    /// Schedule `callback` for the given phase of the current unit of work.
    ///
    /// Returns `true` if the callback was accepted or executed, `false` if
    /// the phase already had a callback this unit of work (the new one is
    /// dropped). Outside a unit of work the callback runs immediately.
    pub fn schedule(&self, phase: Phase, callback: Deferred) -> bool {
        if !self.is_active() {
            callback();
            return true;
        }

        let mut slots = self.slots.lock();
        let slot = &mut slots[phase.slot()];
        if slot.is_some() {
            return false;
        }
        *slot = Some(callback);
        true
    }

    /// Whether a callback is pending for `phase`.
    pub fn is_scheduled(&self, phase: Phase) -> bool {
        self.slots.lock()[phase.slot()].is_some()
    }
}

/// RAII handle for an active unit of work.
pub struct WorkGuard<'a> {
    scope: &'a WorkScope,
    lock: Option<MutexGuard<'a, ()>>,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        *self.scope.owner.lock() = None;
        let deferred = std::mem::take(&mut *self.scope.slots.lock());
        drop(self.lock.take());
        trace!("unit of work exited");

        if thread::panicking() {
            return;
        }

        for callback in deferred.into_iter().flatten() {
            callback();
        }
    }
}
