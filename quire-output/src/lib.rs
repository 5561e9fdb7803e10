//! Output contexts: a render surface tree bound to the activity tree.
//!
//! An [`OutputContext`] pairs one [`Surface`] with one
//! [`ActivityManager`](quire_activity::ActivityManager). Child contexts are
//! managed by their parent, so stopping a context stops everything rendered
//! beneath it. Rendering strategies implement [`Renderer`] and always run
//! through [`invoke`], which owns the cancellation re-check, stop-on-failure
//! and completion bookkeeping.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod context;
mod error;
mod options;
mod registry;
mod renderer;
pub mod renderers;
mod session;
mod surface;
mod tick;

pub use context::{ATTR_SOURCE_ELEMENT, ATTR_SOURCE_MEDIA_TYPE, OutputContext};
pub use error::{Error, Location};
pub use options::{GlobalState, RenderOptions};
pub use registry::{RendererRegistry, TextRenderer};
pub use renderer::{RenderCompletion, Renderer, RendererFamily, RendererInfo, Settle, invoke};
pub use session::{RenderSettings, Session};
pub use surface::{Surface, SurfaceSpec};
pub use tick::CheckTick;

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
