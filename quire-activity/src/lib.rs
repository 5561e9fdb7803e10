//! Cancellable activity trees.
//!
//! The building blocks, leaves first:
//! - [`CancellationSignal`]: a one-shot stop token observable from sync and async code
//! - [`CancellationAction`]: runs an action at most once, on demand or when a signal fires
//! - [`EventStream`]: ordered synchronous broadcast with signal-bound subscriptions
//! - [`Activity`]: the smallest cancellable unit, with a stop broadcast
//! - [`ActivityManager`]: an activity that stops its children (last added first) before itself
//!
//! ## Usage
//!
//! ```
//! use quire_activity::{Activity, ActivityManager};
//!
//! let manager = ActivityManager::new();
//! let timer = Activity::new();
//! manager.manage_with(&timer, || println!("timer released")).unwrap();
//!
//! manager.stop();
//! assert!(timer.is_stopped());
//! assert!(manager.children().is_empty());
//! ```
//!
//! Cancellation is cooperative: long-running work calls
//! [`Activity::abort_if_stopped`] at safe points, or races its futures against
//! [`Activity::cancelled`].

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Mutex, MutexGuard, PoisonError};

mod action;
mod activity;
mod error;
mod events;
mod manager;
mod signal;

pub use action::CancellationAction;
pub use activity::{Activity, ActivityTree, StopState};
pub use error::{Error, StopReason};
pub use events::{EventStream, SubscribeOptions, Subscription};
pub use manager::ActivityManager;
pub use signal::CancellationSignal;

/// Stop handlers may panic while a lock is held elsewhere; keep using the data.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

/// Run a stop handler, logging instead of propagating a panic.
pub(crate) fn run_handler(kind: &str, handler: impl FnOnce()) -> bool {
    match catch_unwind(AssertUnwindSafe(handler)) {
        Ok(()) => true,
        Err(panic) => {
            tracing::error!("{} panicked: {}", kind, panic_message(panic.as_ref()));
            false
        }
    }
}
