// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-key fetch state shared by all callers of a cache.

use std::{
    fmt::{self, Debug},
    hash::Hash,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
};

use dashmap::{DashMap, mapref::entry::Entry};
use futures_util::future::{BoxFuture, FutureExt, Shared};

use crate::Result;

/// Identifies one upstream attempt for one key.
///
/// Ids are unique per registry, so a stale attempt can never settle a slot that a later attempt
/// installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct AttemptId(u64);

impl AttemptId {
    pub(crate) fn get(self) -> u64 {
        self.0
    }

    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        Self(id)
    }
}

/// The shared handle of an in-flight attempt.
///
/// Every caller attached to the attempt holds a clone. Whichever of them polls first drives the
/// upstream call; all of them observe the same outcome.
///
/// `interest` tracks the callers handed this attempt by [`Registry::lookup`]. Waiters are only
/// added, and an abandoned attempt only detached or removed, under the shard lock of its key.
pub(crate) struct Attempt<V> {
    id: AttemptId,
    outcome: Shared<BoxFuture<'static, Result<V>>>,
    interest: Arc<Interest>,
}

#[derive(Debug)]
struct Interest {
    waiters: AtomicUsize,
    // Set once something other than a waiter drives the attempt to completion.
    detached: AtomicBool,
}

impl<V> Clone for Attempt<V> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            outcome: self.outcome.clone(),
            interest: Arc::clone(&self.interest),
        }
    }
}

impl<V> Debug for Attempt<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attempt").field("id", &self.id).finish_non_exhaustive()
    }
}

impl<V: Clone> Attempt<V> {
    pub(crate) fn id(&self) -> AttemptId {
        self.id
    }

    /// Waits for the attempt to settle.
    pub(crate) async fn wait(self) -> Result<V> {
        self.outcome.await
    }

    /// Drives the attempt to completion without counting as a waiter.
    pub(crate) async fn finish(self) {
        drop(self.outcome.await);
    }

    /// Returns `true` once the outcome has been published.
    pub(crate) fn is_settled(&self) -> bool {
        self.outcome.peek().is_some()
    }

    /// Gives up one waiter's interest. Returns `true` if it was the last one.
    pub(crate) fn release(&self) -> bool {
        self.interest.waiters.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn join(&self) -> Self {
        self.interest.waiters.fetch_add(1, Ordering::AcqRel);
        self.clone()
    }
}

impl<V> Attempt<V> {
    fn is_abandoned(&self) -> bool {
        self.interest.waiters.load(Ordering::Acquire) == 0 && !self.interest.detached.load(Ordering::Acquire)
    }
}

/// The state of a key that has an entry in the registry.
///
/// A key without an entry has never been fetched, or its last attempt failed.
enum Slot<V> {
    Pending(Attempt<V>),
    Resolved(V),
}

impl<V> Slot<V> {
    fn is_attempt(&self, id: AttemptId) -> bool {
        matches!(self, Self::Pending(attempt) if attempt.id == id)
    }

    fn is_abandoned(&self, id: AttemptId) -> bool {
        matches!(self, Self::Pending(attempt) if attempt.id == id && attempt.is_abandoned())
    }
}

impl<V> Debug for Slot<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending(attempt) => f.debug_tuple("Pending").field(attempt).finish(),
            Self::Resolved(_) => f.write_str("Resolved"),
        }
    }
}

/// What a caller found when it looked up a key.
#[derive(Debug)]
pub(crate) enum Lookup<V> {
    /// The key is resolved.
    Hit(V),
    /// Another caller's attempt is in flight.
    Attached(Attempt<V>),
    /// No entry existed; this caller installed a new attempt and owns it.
    Started(Attempt<V>),
}

impl<V: Clone> Lookup<V> {
    fn observe(slot: &Slot<V>) -> Self {
        match slot {
            Slot::Resolved(value) => Self::Hit(value.clone()),
            Slot::Pending(attempt) => Self::Attached(attempt.join()),
        }
    }
}

pub(crate) struct Registry<K, V> {
    slots: DashMap<K, Slot<V>, ahash::RandomState>,
    next_attempt: AtomicU64,
}

impl<K, V> Debug for Registry<K, V>
where
    K: Eq + Hash,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("slots", &self.slots.len())
            .field("next_attempt", &self.next_attempt.load(Ordering::Relaxed))
            .finish()
    }
}

impl<K, V> Default for Registry<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: DashMap::with_hasher(ahash::RandomState::new()),
            next_attempt: AtomicU64::new(1),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Clone + Eq + Hash,
    V: Clone,
{
    /// Finds the state of `key`, installing a new attempt built by `start` if there is none.
    ///
    /// The check for an existing entry and the installation happen under the same shard lock, so
    /// of any number of concurrent callers for an absent key exactly one gets
    /// [`Lookup::Started`]. `start` only builds the future; nothing is polled while the lock is
    /// held.
    ///
    /// Every returned attempt counts the caller as a waiter. The caller must pair it with
    /// exactly one [`Attempt::release`].
    pub(crate) fn lookup(&self, key: &K, start: impl FnOnce(AttemptId) -> BoxFuture<'static, Result<V>>) -> Lookup<V> {
        if let Some(slot) = self.slots.get(key) {
            return Lookup::observe(slot.value());
        }

        match self.slots.entry(key.clone()) {
            Entry::Occupied(occupied) => Lookup::observe(occupied.get()),
            Entry::Vacant(vacant) => {
                let id = AttemptId(self.next_attempt.fetch_add(1, Ordering::Relaxed));
                let attempt = Attempt {
                    id,
                    outcome: start(id).shared(),
                    interest: Arc::new(Interest {
                        waiters: AtomicUsize::new(1),
                        detached: AtomicBool::new(false),
                    }),
                };
                vacant.insert(Slot::Pending(attempt.clone()));
                Lookup::Started(attempt)
            }
        }
    }

    /// Replaces the pending attempt `id` with its successful value.
    ///
    /// Does nothing if `key` is not pending on `id`.
    pub(crate) fn resolve(&self, key: &K, id: AttemptId, value: &V) {
        let settled = match self.slots.get_mut(key) {
            Some(mut slot) if slot.is_attempt(id) => {
                *slot = Slot::Resolved(value.clone());
                true
            }
            _ => false,
        };
        debug_assert!(settled, "attempt {} no longer owns its slot", id.get());
    }

    /// Removes the pending attempt `id` so the next caller starts a new one.
    ///
    /// Does nothing if `key` is not pending on `id`.
    pub(crate) fn retract(&self, key: &K, id: AttemptId) {
        let settled = self.slots.remove_if(key, |_, slot| slot.is_attempt(id)).is_some();
        debug_assert!(settled, "attempt {} no longer owns its slot", id.get());
    }

    /// Removes the pending attempt `id` if no caller is waiting on it and it was not detached.
    ///
    /// The check runs under the shard lock, so a caller attaching concurrently either keeps the
    /// attempt alive or finds the key absent. Returns `true` if the slot was removed.
    pub(crate) fn retract_abandoned(&self, key: &K, id: AttemptId) -> bool {
        self.slots.remove_if(key, |_, slot| slot.is_abandoned(id)).is_some()
    }

    /// Marks the pending attempt `id` as detached if no caller is waiting on it.
    ///
    /// A detached attempt is never retracted as abandoned; whoever detached it must drive it to
    /// completion. Returns `true` if this call detached it.
    pub(crate) fn detach_abandoned(&self, key: &K, id: AttemptId) -> bool {
        match self.slots.get_mut(key) {
            Some(slot) if slot.is_abandoned(id) => {
                if let Slot::Pending(attempt) = slot.value() {
                    attempt.interest.detached.store(true, Ordering::Release);
                }
                true
            }
            _ => false,
        }
    }

    /// Returns the resolved value of `key`, if any.
    pub(crate) fn peek(&self, key: &K) -> Option<V> {
        match self.slots.get(key)?.value() {
            Slot::Resolved(value) => Some(value.clone()),
            Slot::Pending(_) => None,
        }
    }

    pub(crate) fn is_pending(&self, key: &K) -> bool {
        self.slots.get(key).is_some_and(|slot| matches!(slot.value(), Slot::Pending(_)))
    }

    pub(crate) fn resolved_count(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot.value(), Slot::Resolved(_))).count()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot.value(), Slot::Pending(_))).count()
    }
}
