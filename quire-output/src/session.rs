use crate::lock;
use crate::options::GlobalState;
use crate::registry::RendererRegistry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Rendering settings shared by every context of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    /// Render display equations flush left instead of centred.
    pub flush_left: bool,
    /// Default interval for [`OutputContext::check_tick`](crate::OutputContext::check_tick).
    pub check_tick_interval_ms: u64,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            flush_left: false,
            check_tick_interval_ms: 200,
        }
    }
}

/// The document-wide rendering environment.
///
/// Every [`OutputContext`](crate::OutputContext) belongs to exactly one
/// session, and a context tree never spans sessions.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    id: u64,
    renderers: RendererRegistry,
    global_state: Mutex<GlobalState>,
    settings: Mutex<RenderSettings>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("renderers", &self.inner.renderers)
            .finish()
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(RenderSettings::default())
    }
}

impl Session {
    pub fn new(settings: RenderSettings) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
                renderers: RendererRegistry::with_builtin_text_renderers(),
                global_state: Mutex::new(GlobalState::new()),
                settings: Mutex::new(settings),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn ptr_eq(&self, other: &Session) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Session-wide text renderers.
    pub fn renderers(&self) -> &RendererRegistry {
        &self.inner.renderers
    }

    pub fn global_state(&self) -> GlobalState {
        lock(&self.inner.global_state).clone()
    }

    /// Install and return a fresh global state.
    pub fn reset_global_state(&self) -> GlobalState {
        let fresh = GlobalState::new();
        *lock(&self.inner.global_state) = fresh.clone();
        fresh
    }

    pub fn settings(&self) -> RenderSettings {
        lock(&self.inner.settings).clone()
    }

    pub fn set_settings(&self, settings: RenderSettings) {
        *lock(&self.inner.settings) = settings;
    }
}
