//! Ordered, synchronous multi-subscriber broadcast.
//!
//! [`EventStream::dispatch`] delivers a value to every observer subscribed at
//! the moment of dispatch, in subscription order, before returning. Observers
//! added during a dispatch only see later dispatches, and an observer removed
//! during a dispatch does not receive the rest of it.
//!
//! Every subscription owns a [`CancellationAction`] as its teardown, so an
//! explicit [`Subscription::unsubscribe`] and the firing of a bound signal
//! converge on the same one-shot removal.

use crate::action::CancellationAction;
use crate::error::Error;
use crate::{lock, run_handler};
use crate::signal::CancellationSignal;
use indexmap::IndexMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct EventStream<T> {
    inner: Arc<StreamInner<T>>,
}

struct StreamInner<T> {
    observers: Mutex<IndexMap<u64, Entry<T>>>,
    next_id: AtomicU64,
}

struct Entry<T> {
    observer: Observer<T>,
    once: bool,
    teardown: CancellationAction,
}

/// Options accepted by [`EventStream::subscribe`].
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Unsubscribe automatically when this signal triggers.
    pub signal: Option<CancellationSignal>,
    /// Unsubscribe before the first delivery.
    pub once: bool,
}

impl SubscribeOptions {
    pub fn once() -> Self {
        Self {
            signal: None,
            once: true,
        }
    }

    pub fn until(signal: CancellationSignal) -> Self {
        Self {
            signal: Some(signal),
            once: false,
        }
    }
}

/// Handle returned by [`EventStream::subscribe`].
///
/// Dropping the handle does not unsubscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    teardown: CancellationAction,
}

impl Subscription {
    pub fn unsubscribe(&self) {
        // Teardown actions are never abandoned.
        let _ = self.teardown.action();
    }

    pub fn is_active(&self) -> bool {
        !self.teardown.has_fired()
    }
}

impl<T> Default for EventStream<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(StreamInner {
                observers: Mutex::new(IndexMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }
}

impl<T> Clone for EventStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for EventStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("observers", &self.observer_count())
            .finish()
    }
}

impl<T: 'static> EventStream<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an observer.
    ///
    /// Fails when `options.signal` has already triggered.
    pub fn subscribe<F>(&self, observer: F, options: SubscribeOptions) -> Result<Subscription, Error>
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let stream = Arc::downgrade(&self.inner);
        let teardown = CancellationAction::new(options.signal.as_ref(), move || {
            if let Some(stream) = stream.upgrade() {
                lock(&stream.observers).shift_remove(&id);
            }
        })?;

        lock(&self.inner.observers).insert(
            id,
            Entry {
                observer: Arc::new(observer),
                once: options.once,
                teardown: teardown.clone(),
            },
        );
        // The signal may have fired before the entry existed.
        if teardown.has_fired() {
            lock(&self.inner.observers).shift_remove(&id);
        }

        Ok(Subscription { teardown })
    }

    /// Deliver `value` synchronously to the current observers.
    ///
    /// An observer that panics is logged and skipped; the remaining
    /// observers still receive `value`.
    pub fn dispatch(&self, value: &T) {
        let snapshot: Vec<(u64, Observer<T>)> = lock(&self.inner.observers)
            .iter()
            .map(|(id, entry)| (*id, Arc::clone(&entry.observer)))
            .collect();

        for (id, observer) in snapshot {
            let once = {
                let observers = lock(&self.inner.observers);
                match observers.get(&id) {
                    Some(entry) if entry.once => Some(entry.teardown.clone()),
                    Some(_) => None,
                    None => continue,
                }
            };
            if let Some(teardown) = once {
                if !teardown.try_fire() {
                    continue;
                }
            }
            run_handler("event observer", || observer(value));
        }
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }
}
