use crate::error::{Error, StopReason};
use crate::events::EventStream;
use crate::{lock, panic_message};
use crate::signal::CancellationSignal;
use serde::Serialize;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::{error, trace};

static NEXT_ACTIVITY_ID: AtomicU64 = AtomicU64::new(1);

/// Event dispatched on [`Activity::stop_states`] by every call to [`Activity::stop`].
#[derive(Debug, Clone)]
pub struct StopState {
    pub activity: Activity,
    /// The activity was already stopped before this call.
    pub was_already_stopped: bool,
}

/// A cancellable unit of work.
///
/// Cheap to clone; clones share the same node. An activity owns one
/// [`CancellationSignal`] at a time. Non-restartable activities stay stopped
/// after the first [`stop`](Self::stop); restartable ones install a fresh
/// signal right after each stop event has been dispatched.
///
/// Activities created through [`ActivityManager`](crate::ActivityManager) also
/// own an ordered child list that is drained (last added first) on stop.
#[derive(Clone)]
pub struct Activity {
    pub(crate) inner: Arc<ActivityInner>,
}

pub(crate) struct ActivityInner {
    id: u64,
    label: String,
    allow_restart: bool,
    signal: Mutex<CancellationSignal>,
    stop_states: EventStream<StopState>,
    pub(crate) children: Option<Mutex<Vec<Activity>>>,
    pub(crate) owner: Mutex<Weak<ActivityInner>>,
}

impl fmt::Debug for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activity")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("allow_restart", &self.inner.allow_restart)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for Activity {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Activity {}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        Self::build("activity", false, false)
    }

    pub fn restartable() -> Self {
        Self::build("activity", true, false)
    }

    /// An activity with a descriptive label, shown in [`ActivityTree`] snapshots.
    pub fn labelled(label: impl Into<String>, allow_restart: bool) -> Self {
        Self::build(label, allow_restart, false)
    }

    pub(crate) fn build(label: impl Into<String>, allow_restart: bool, with_children: bool) -> Self {
        Self {
            inner: Arc::new(ActivityInner {
                id: NEXT_ACTIVITY_ID.fetch_add(1, Ordering::Relaxed),
                label: label.into(),
                allow_restart,
                signal: Mutex::new(CancellationSignal::new()),
                stop_states: EventStream::new(),
                children: with_children.then(|| Mutex::new(Vec::new())),
                owner: Mutex::new(Weak::new()),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn allow_restart(&self) -> bool {
        self.inner.allow_restart
    }

    pub fn ptr_eq(&self, other: &Activity) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The signal currently installed.
    ///
    /// For restartable activities this changes after every stop, so callers
    /// interested in one run should capture it before awaiting.
    pub fn signal(&self) -> CancellationSignal {
        lock(&self.inner.signal).clone()
    }

    pub fn is_stopped(&self) -> bool {
        lock(&self.inner.signal).is_triggered()
    }

    /// Completes when the currently installed signal triggers.
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.signal().cancelled()
    }

    pub fn stop_states(&self) -> &EventStream<StopState> {
        &self.inner.stop_states
    }

    /// Cancellation checkpoint: fails with [`Error::Stopped`] once stopped.
    pub fn abort_if_stopped(&self) -> Result<(), Error> {
        self.signal().throw_if_triggered()
    }

    /// Stop this activity.
    ///
    /// Children are stopped first, most recently added first, until the child
    /// list is empty. A child whose stop panics is logged and skipped so the
    /// cascade always reaches the remaining children and this activity. Then
    /// the signal triggers and one [`StopState`] is dispatched; restartable
    /// activities are re-armed last, even when a listener or observer panics.
    pub fn stop(&self) {
        let was_already_stopped = self.is_stopped();
        trace!(activity = self.id(), label = %self.label(), was_already_stopped, "stopping activity");

        if let Some(children) = &self.inner.children {
            loop {
                let Some(child) = lock(children).pop() else {
                    break;
                };
                child.release_owner(self);
                child.stop_best_effort();
            }
        }

        self.signal().trigger(StopReason::Stopped);
        self.inner.stop_states.dispatch(&StopState {
            activity: self.clone(),
            was_already_stopped,
        });

        if self.inner.allow_restart {
            *lock(&self.inner.signal) = CancellationSignal::new();
        }
    }

    /// [`stop`](Self::stop), catching and logging a panic raised by a stop
    /// handler. Returns false when a panic was caught.
    pub fn stop_best_effort(&self) -> bool {
        match catch_unwind(AssertUnwindSafe(|| self.stop())) {
            Ok(()) => true,
            Err(panic) => {
                error!(
                    activity = self.id(),
                    label = %self.label(),
                    "failed to stop activity: {}",
                    panic_message(panic.as_ref())
                );
                false
            }
        }
    }

    /// Recursive snapshot of this activity and its children.
    pub fn tree(&self) -> ActivityTree {
        let children = self
            .inner
            .children
            .as_ref()
            .map(|children| lock(children).clone())
            .unwrap_or_default();
        ActivityTree {
            id: self.id(),
            label: self.label().to_string(),
            allow_restart: self.allow_restart(),
            stopped: self.is_stopped(),
            children: children.iter().map(Activity::tree).collect(),
        }
    }

    pub(crate) fn owner(&self) -> Option<Activity> {
        lock(&self.inner.owner)
            .upgrade()
            .map(|inner| Activity { inner })
    }

    pub(crate) fn release_owner(&self, manager: &Activity) {
        let mut owner = lock(&self.inner.owner);
        if owner.upgrade().is_some_and(|current| Arc::ptr_eq(&current, &manager.inner)) {
            *owner = Weak::new();
        }
    }
}

/// Debugging snapshot produced by [`Activity::tree`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActivityTree {
    pub id: u64,
    pub label: String,
    pub allow_restart: bool,
    pub stopped: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ActivityTree>,
}

impl ActivityTree {
    fn write_indented(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        write!(f, "{:indent$}#{} {}", "", self.id, self.label, indent = depth * 2)?;
        if self.stopped {
            write!(f, " (stopped)")?;
        }
        writeln!(f)?;
        for child in &self.children {
            child.write_indented(f, depth + 1)?;
        }
        Ok(())
    }
}

impl fmt::Display for ActivityTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_indented(f, 0)
    }
}
