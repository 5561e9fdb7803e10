//! Sequential evaluation of a document's cells.
//!
//! An [`Evaluator`] owns a [`Document`] and a [`Session`](quire_output::Session).
//! Each cell evaluation renders into its own output context, managed by the
//! evaluator's activity; batches run cells strictly one after another and
//! halt on the first failure or stop.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod batch;
mod commands;
mod document;
mod error;
mod evaluator;
mod settings;

#[cfg(test)]
mod tests;

pub use batch::{BatchCompletion, BatchOutcome};
pub use commands::Command;
pub use document::{Cell, CellSnapshot, Document};
pub use error::Error;
pub use evaluator::{EvalState, Evaluator};
pub use settings::Settings;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
