/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! A typed per-entity subscriber list.
//!
//! Every entity that publishes change events owns an [`Observers`];
//! consumers attach callbacks and receive events inline on the thread
//! that notifies. Delivery is synchronous: a slow callback delays the
//! notifying operation, an accepted tradeoff for simplicity. Detachment
//! is explicit via the [`Subscription`] token returned by
//! [`Observers::attach`]; dropping the token does not detach.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// A token identifying one attached observer. Pass it back to
/// [`Observers::detach`] to stop receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// The set of observers attached to one entity.
pub struct Observers<E> {
    subscribers: Mutex<Vec<(Subscription, Callback<E>)>>,
    next_id: AtomicU64,
}

impl<E> Observers<E> {
    /// Create an empty observer set.
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Attach `callback`; it is invoked for every subsequent
    /// [`Observers::notify`] until detached.
    pub fn attach(&self, callback: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let subscription = Subscription(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .lock()
            .unwrap()
            .push((subscription, Arc::new(callback)));
        subscription
    }

    /// Detach a previously attached observer. Returns false if the
    /// subscription was not (or no longer) attached.
    pub fn detach(&self, subscription: Subscription) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap();
        let before = subscribers.len();
        subscribers.retain(|(id, _)| *id != subscription);
        subscribers.len() != before
    }

    /// The number of currently attached observers.
    pub fn count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Deliver `event` to every attached observer, inline. Callbacks
    /// registered or removed during delivery take effect from the next
    /// notification.
    pub fn notify(&self, event: &E) {
        // Snapshot outside the lock so that callbacks may themselves
        // attach, detach or notify without deadlocking.
        let snapshot: Vec<Callback<E>> = self
            .subscribers
            .lock()
            .unwrap()
            .iter()
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in snapshot {
            callback(event);
        }
    }
}

impl<E> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> fmt::Debug for Observers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("count", &self.count())
            .finish()
    }
}
