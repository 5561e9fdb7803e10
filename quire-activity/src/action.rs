use crate::error::Error;
use crate::lock;
use crate::signal::{CancellationSignal, WeakSignal};
use std::fmt;
use std::sync::{Arc, Mutex};

type Action = Box<dyn FnOnce() + Send>;

/// An action that runs at most once, either when [`action`](Self::action) is
/// called or when the bound cancellation signal triggers, whichever comes
/// first.
///
/// The signal listener is released on every exit path: after the action fires
/// by either route, and after [`abandon`](Self::abandon).
#[derive(Clone)]
pub struct CancellationAction {
    inner: Arc<ActionInner>,
}

struct ActionInner {
    signal: Option<WeakSignal>,
    state: Mutex<ActionState>,
}

struct ActionState {
    action: Option<Action>,
    listener: Option<u64>,
    fired: bool,
    abandoned: bool,
}

impl fmt::Debug for CancellationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("CancellationAction")
            .field("fired", &state.fired)
            .field("abandoned", &state.abandoned)
            .finish()
    }
}

impl CancellationAction {
    /// Bind `action` to an optional signal.
    ///
    /// Fails with the signal's recorded reason when it has already triggered.
    pub fn new<F>(signal: Option<&CancellationSignal>, action: F) -> Result<Self, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(signal) = signal {
            signal.throw_if_triggered()?;
        }

        let inner = Arc::new(ActionInner {
            signal: signal.map(CancellationSignal::downgrade),
            state: Mutex::new(ActionState {
                action: Some(Box::new(action)),
                listener: None,
                fired: false,
                abandoned: false,
            }),
        });

        if let Some(signal) = signal {
            let listener_inner = Arc::clone(&inner);
            let id = signal.add_listener(Box::new(move || {
                listener_inner.fire();
            }));
            match id {
                Some(id) => {
                    let mut state = lock(&inner.state);
                    if !state.fired {
                        state.listener = Some(id);
                    }
                }
                // Triggered between the check above and registration.
                None => return Err(Error::Stopped(signal.reason().unwrap_or_default())),
            }
        }

        Ok(Self { inner })
    }

    /// Run the action now.
    ///
    /// A no-op when it already ran; fails with [`Error::Abandoned`] after
    /// [`abandon`](Self::abandon).
    pub fn action(&self) -> Result<(), Error> {
        if lock(&self.inner.state).abandoned {
            return Err(Error::Abandoned);
        }
        self.inner.fire();
        Ok(())
    }

    /// Release the signal listener without running the action.
    pub fn abandon(&self) {
        let listener = {
            let mut state = lock(&self.inner.state);
            state.abandoned = true;
            state.action = None;
            state.listener.take()
        };
        self.inner.detach(listener);
    }

    pub fn has_fired(&self) -> bool {
        lock(&self.inner.state).fired
    }

    pub fn is_abandoned(&self) -> bool {
        lock(&self.inner.state).abandoned
    }

    /// Run the action if it has not run yet, returning whether this call ran it.
    pub(crate) fn try_fire(&self) -> bool {
        self.inner.fire()
    }
}

impl ActionInner {
    fn fire(&self) -> bool {
        let (action, listener) = {
            let mut state = lock(&self.state);
            if state.fired || state.abandoned {
                return false;
            }
            state.fired = true;
            (state.action.take(), state.listener.take())
        };
        self.detach(listener);
        if let Some(action) = action {
            action();
        }
        true
    }

    fn detach(&self, listener: Option<u64>) {
        let Some(id) = listener else { return };
        if let Some(signal) = self.signal.as_ref().and_then(WeakSignal::upgrade) {
            signal.remove_listener(id);
        }
    }
}
