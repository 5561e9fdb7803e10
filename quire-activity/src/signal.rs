use crate::error::{Error, StopReason};
use crate::{lock, run_handler};
use indexmap::IndexMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

pub(crate) type Listener = Box<dyn FnOnce() + Send>;

/// One-shot "has this been asked to stop" token.
///
/// The signal transitions from not-triggered to triggered exactly once.
/// Async code observes it through [`CancellationSignal::cancelled`] (backed by a
/// [`CancellationToken`]); synchronous code registers one-shot listeners that
/// run in registration order on the triggering call.
#[derive(Clone, Default)]
pub struct CancellationSignal {
    inner: Arc<SignalInner>,
}

#[derive(Default)]
struct SignalInner {
    token: CancellationToken,
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    reason: Option<StopReason>,
    listeners: IndexMap<u64, Listener>,
    next_listener: u64,
}

impl fmt::Debug for CancellationSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CancellationSignal")
            .field("reason", &state.reason)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_triggered(&self) -> bool {
        lock(&self.inner.state).reason.is_some()
    }

    /// The reason recorded by the first [`trigger`](Self::trigger), if any.
    pub fn reason(&self) -> Option<StopReason> {
        lock(&self.inner.state).reason.clone()
    }

    /// Trigger the signal.
    ///
    /// Only the first call has an effect: it records `reason`, cancels the
    /// underlying token and then runs every registered listener once, outside
    /// the internal lock so listeners may re-enter the signal. A panicking
    /// listener is logged and does not prevent the others from running.
    /// Returns whether this call performed the transition.
    pub fn trigger(&self, reason: StopReason) -> bool {
        let listeners = {
            let mut state = lock(&self.inner.state);
            if state.reason.is_some() {
                return false;
            }
            state.reason = Some(reason);
            std::mem::take(&mut state.listeners)
        };

        self.inner.token.cancel();
        for (_, listener) in listeners {
            run_handler("cancellation listener", listener);
        }
        true
    }

    /// Fail with the recorded reason if the signal has been triggered.
    pub fn throw_if_triggered(&self) -> Result<(), Error> {
        match self.reason() {
            Some(reason) => Err(Error::Stopped(reason)),
            None => Ok(()),
        }
    }

    /// Completes once the signal is triggered.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.inner.token.clone().cancelled_owned()
    }

    /// A token cancelled together with this signal, for use with `tokio::select!`.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    pub fn ptr_eq(&self, other: &CancellationSignal) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn downgrade(&self) -> WeakSignal {
        WeakSignal(Arc::downgrade(&self.inner))
    }

    /// Register a one-shot listener.
    ///
    /// Returns `None` without registering when the signal already fired.
    pub(crate) fn add_listener(&self, listener: Listener) -> Option<u64> {
        let mut state = lock(&self.inner.state);
        if state.reason.is_some() {
            return None;
        }
        let id = state.next_listener;
        state.next_listener += 1;
        state.listeners.insert(id, listener);
        Some(id)
    }

    pub(crate) fn remove_listener(&self, id: u64) -> bool {
        lock(&self.inner.state).listeners.shift_remove(&id).is_some()
    }

    #[cfg(test)]
    pub(crate) fn listener_count(&self) -> usize {
        lock(&self.inner.state).listeners.len()
    }
}

/// Non-owning reference to a signal, held by listeners' owners so that a
/// registered listener never keeps its own signal alive.
#[derive(Clone)]
pub(crate) struct WeakSignal(Weak<SignalInner>);

impl WeakSignal {
    pub(crate) fn upgrade(&self) -> Option<CancellationSignal> {
        self.0.upgrade().map(|inner| CancellationSignal { inner })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn trigger_is_one_shot() {
        let signal = CancellationSignal::new();
        assert!(!signal.is_triggered());
        assert!(signal.trigger(StopReason::Message("first".into())));
        assert!(!signal.trigger(StopReason::Stopped));
        assert_eq!(signal.reason(), Some(StopReason::Message("first".into())));
        assert!(signal.token().is_cancelled());
    }

    #[test]
    fn listeners_run_in_registration_order() {
        let signal = CancellationSignal::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for n in 0..3 {
            let order = order.clone();
            signal.add_listener(Box::new(move || order.lock().unwrap().push(n)));
        }
        signal.trigger(StopReason::Stopped);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(signal.listener_count(), 0);
    }

    #[test]
    fn panicking_listener_does_not_skip_the_rest() {
        let signal = CancellationSignal::new();
        let count = Arc::new(AtomicUsize::new(0));
        signal.add_listener(Box::new(|| panic!("listener failure")));
        let c = count.clone();
        signal.add_listener(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        assert!(signal.trigger(StopReason::Stopped));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(signal.token().is_cancelled());
    }

    #[test]
    fn removed_listener_does_not_run() {
        let signal = CancellationSignal::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = signal
            .add_listener(Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        assert!(signal.remove_listener(id));
        assert!(!signal.remove_listener(id));
        signal.trigger(StopReason::Stopped);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn listener_may_reenter_signal() {
        let signal = CancellationSignal::new();
        let inner = signal.clone();
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        signal.add_listener(Box::new(move || {
            *s.lock().unwrap() = Some(inner.is_triggered());
            inner.trigger(StopReason::Stopped);
        }));
        signal.trigger(StopReason::Stopped);
        assert_eq!(*seen.lock().unwrap(), Some(true));
    }

    #[test]
    fn add_listener_after_trigger_is_refused() {
        let signal = CancellationSignal::new();
        signal.trigger(StopReason::Stopped);
        assert!(signal.add_listener(Box::new(|| {})).is_none());
        assert_eq!(
            signal.throw_if_triggered(),
            Err(Error::Stopped(StopReason::Stopped))
        );
    }

    #[tokio::test]
    async fn cancelled_future_completes_on_trigger() {
        let signal = CancellationSignal::new();
        let waiter = tokio::spawn(signal.cancelled());
        tokio::task::yield_now().await;
        signal.trigger(StopReason::Stopped);
        waiter.await.unwrap();
    }
}
