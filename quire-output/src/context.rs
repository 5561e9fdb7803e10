use crate::error::Error;
use crate::options::RenderOptions;
use crate::registry::{RendererRegistry, TextRenderer};
use crate::renderer::{RenderCompletion, Settle, invoke};
use crate::renderers::{
    self, ChartRenderer, ErrorRenderOptions, GraphvizRenderer, ImageData, ImageDataRenderer,
    LatexRenderer, MarkdownRenderer, ScriptRenderer, TextRenderer as PlainRenderer,
};
use crate::session::Session;
use crate::surface::{Surface, SurfaceSpec};
use crate::tick::CheckTick;
use quire_activity::{ActivityManager, EventStream};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Attribute naming the media type of the renderer that produced a surface.
pub const ATTR_SOURCE_MEDIA_TYPE: &str = "data-source-media-type";
/// Attribute linking an output surface to the cell it was rendered for.
pub const ATTR_SOURCE_ELEMENT: &str = "data-source-element";

/// A node of the output tree: one [`Surface`] bound to one [`ActivityManager`].
///
/// Contexts form a tree mirroring the activity tree: a context created with a
/// parent is managed by the parent's activity and stopped (last created
/// first) before it. Every mutating operation starts with
/// [`abort_if_stopped`](Self::abort_if_stopped), so a stopped context's
/// surface receives no further output, with the single exception of
/// [`render_error`](Self::render_error).
#[derive(Clone)]
pub struct OutputContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    session: Session,
    surface: Surface,
    parent: Option<OutputContext>,
    activity: ActivityManager,
    keepalive: AtomicBool,
    /// Background tasks started here that have not finished.
    background: AtomicUsize,
    render_completions: EventStream<RenderCompletion>,
    renderers: RendererRegistry,
}

impl fmt::Debug for OutputContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputContext")
            .field("id", &self.id())
            .field("surface", &self.inner.surface)
            .field("parent", &self.parent().map(|parent| parent.id()))
            .field("keepalive", &self.keepalive())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for OutputContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for OutputContext {}

impl OutputContext {
    /// Create a context rendering into `surface`.
    ///
    /// With a parent, the new context is managed by the parent's activity.
    /// The parent must belong to `session` and must not be stopped.
    pub fn new(
        session: &Session,
        surface: Surface,
        parent: Option<&OutputContext>,
    ) -> Result<Self, Error> {
        if let Some(parent) = parent {
            if !parent.session().ptr_eq(session) {
                return Err(Error::SessionMismatch);
            }
            parent.abort_if_stopped()?;
        }

        let ocx = Self {
            inner: Arc::new(ContextInner {
                session: session.clone(),
                surface,
                parent: parent.cloned(),
                activity: ActivityManager::labelled("output-context", false),
                keepalive: AtomicBool::new(false),
                background: AtomicUsize::new(0),
                render_completions: EventStream::new(),
                renderers: RendererRegistry::new(),
            }),
        };
        if let Some(parent) = parent {
            parent.activity().manage(ocx.activity())?;
        }
        Ok(ocx)
    }

    /// A context without parent.
    pub fn root(session: &Session, surface: Surface) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                session: session.clone(),
                surface,
                parent: None,
                activity: ActivityManager::labelled("output-context", false),
                keepalive: AtomicBool::new(false),
                background: AtomicUsize::new(0),
                render_completions: EventStream::new(),
                renderers: RendererRegistry::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.activity.id()
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn surface(&self) -> &Surface {
        &self.inner.surface
    }

    pub fn parent(&self) -> Option<OutputContext> {
        self.inner.parent.clone()
    }

    pub fn activity(&self) -> &ActivityManager {
        &self.inner.activity
    }

    pub fn render_completions(&self) -> &EventStream<RenderCompletion> {
        &self.inner.render_completions
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.activity.is_stopped()
    }

    /// Stop this context and every context created under it.
    pub fn stop(&self) {
        self.inner.activity.stop();
    }

    /// The root of the parent chain.
    pub fn topmost(&self) -> OutputContext {
        const PROBES: usize = 10;

        let mut current = self.clone();
        for _ in 0..PROBES {
            match current.parent() {
                Some(parent) => current = parent,
                None => return current,
            }
        }

        let mut seen = HashSet::from([current.id()]);
        while let Some(parent) = current.parent() {
            if !seen.insert(parent.id()) {
                break;
            }
            current = parent;
        }
        current
    }

    pub fn keepalive(&self) -> bool {
        self.inner.keepalive.load(Ordering::SeqCst)
    }

    /// Set keepalive. `true` also applies to every ancestor; `false` only
    /// affects this context.
    pub fn set_keepalive(&self, keepalive: bool) {
        self.inner.keepalive.store(keepalive, Ordering::SeqCst);
        if !keepalive {
            return;
        }
        let mut seen = HashSet::from([self.id()]);
        let mut current = self.parent();
        while let Some(ocx) = current {
            if !seen.insert(ocx.id()) {
                break;
            }
            ocx.inner.keepalive.store(true, Ordering::SeqCst);
            current = ocx.parent();
        }
    }

    // === cancellation checkpoints ===

    pub fn abort_if_stopped(&self) -> Result<(), Error> {
        Ok(self.inner.activity.abort_if_stopped()?)
    }

    /// Check, await `work`, check again.
    pub async fn run_checked<F, T>(&self, work: F) -> Result<T, Error>
    where
        F: Future<Output = Result<T, Error>>,
    {
        self.abort_if_stopped()?;
        let value = work.await?;
        self.abort_if_stopped()?;
        Ok(value)
    }

    /// Sleep for `duration`, returning early with a stopped error when the
    /// context stops meanwhile.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Error> {
        self.abort_if_stopped()?;
        let cancelled = self.inner.activity.cancelled();
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = cancelled => {}
        }
        self.abort_if_stopped()
    }

    pub async fn delay(&self, ms: u64) -> Result<(), Error> {
        self.sleep(Duration::from_millis(ms)).await
    }

    /// Yield one scheduling turn.
    pub async fn next_tick(&self) -> Result<(), Error> {
        self.abort_if_stopped()?;
        tokio::task::yield_now().await;
        self.abort_if_stopped()
    }

    /// A cooperative-yield helper for CPU-heavy work; `None` uses the
    /// session's configured interval.
    pub fn check_tick(&self, interval: Option<Duration>) -> Result<CheckTick, Error> {
        self.abort_if_stopped()?;
        let interval = interval.unwrap_or_else(|| {
            Duration::from_millis(self.session().settings().check_tick_interval_ms)
        });
        Ok(CheckTick::new(self.clone(), interval))
    }

    // === surface operations ===

    pub fn clear(&self) -> Result<(), Error> {
        self.abort_if_stopped()?;
        self.inner.surface.clear();
        Ok(())
    }

    pub fn set_attrs<K, V>(&self, attrs: impl IntoIterator<Item = (K, V)>) -> Result<(), Error>
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.abort_if_stopped()?;
        self.inner.surface.set_attrs(attrs);
        Ok(())
    }

    pub fn update_style<K>(
        &self,
        properties: impl IntoIterator<Item = (K, Option<String>)>,
    ) -> Result<(), Error>
    where
        K: Into<String>,
    {
        self.abort_if_stopped()?;
        self.inner.surface.update_style(properties);
        Ok(())
    }

    pub fn create_child(&self, spec: SurfaceSpec) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        Ok(self.inner.surface.create_child(spec))
    }

    /// Create a child surface and a context for it, managed by this context.
    ///
    /// The child inherits this surface's style; properties in `spec` win.
    pub fn create_child_ocx(&self, mut spec: SurfaceSpec) -> Result<OutputContext, Error> {
        self.abort_if_stopped()?;
        let mut style: BTreeMap<String, String> = self.inner.surface.style();
        style.append(&mut spec.style);
        spec.style = style;
        let surface = self.create_child(spec)?;
        OutputContext::new(self.session(), surface, Some(self))
    }

    /// Create a context for a surface created elsewhere.
    pub fn create_new_ocx(
        &self,
        surface: Surface,
        parent: Option<&OutputContext>,
    ) -> Result<OutputContext, Error> {
        self.abort_if_stopped()?;
        OutputContext::new(self.session(), surface, parent)
    }

    /// This context when its surface suits `options`, otherwise a child
    /// context whose surface does.
    pub fn ocx_for_options(
        &self,
        options: &RenderOptions,
        always_create: bool,
    ) -> Result<OutputContext, Error> {
        self.abort_if_stopped()?;
        match options.creation_spec(always_create)? {
            None => Ok(self.clone()),
            Some(spec) => self.create_child_ocx(spec),
        }
    }

    /// Like [`ocx_for_options`](Self::ocx_for_options) for a bare surface.
    pub fn surface_for_options(
        &self,
        options: &RenderOptions,
        always_create: bool,
    ) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        match options.creation_spec(always_create)? {
            None => Ok(self.inner.surface.clone()),
            Some(spec) => self.create_child(spec),
        }
    }

    // === renderer wrappers ===

    /// Render a JSON value as text: strings verbatim, anything else serialised.
    pub async fn render_value(
        &self,
        value: &serde_json::Value,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        match value {
            serde_json::Value::String(text) => self.print(text, options).await,
            other => self.print(&other.to_string(), options).await,
        }
    }

    pub async fn print(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&PlainRenderer, self, text, options, Settle::Leave).await
    }

    pub async fn println(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.print(&format!("{}\n", text), options).await
    }

    /// Print in a monospace font unless `options` names a font family.
    pub async fn tty(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        let mut options = options.clone();
        options
            .style
            .entry("font-family".to_string())
            .or_insert_with(|| "monospace".to_string());
        invoke(&PlainRenderer, self, text, &options, Settle::Leave).await
    }

    pub async fn ttyln(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.tty(&format!("{}\n", text), options).await
    }

    /// A horizontal rule.
    pub async fn print_rule(&self, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        self.ocx_for_options(options, false)?
            .create_child(SurfaceSpec::new("hr"))
    }

    pub async fn markdown(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&MarkdownRenderer, self, text, options, Settle::Leave).await
    }

    pub async fn latex(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&LatexRenderer, self, text, options, Settle::Leave).await
    }

    pub async fn script(&self, text: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&ScriptRenderer, self, text, options, Settle::Leave).await
    }

    pub async fn image_data(
        &self,
        images: &[ImageData],
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&ImageDataRenderer, self, images, options, Settle::Leave).await
    }

    pub async fn graphviz(&self, dot: &str, options: &RenderOptions) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&GraphvizRenderer, self, dot, options, Settle::Leave).await
    }

    pub async fn chart(
        &self,
        spec: &serde_json::Value,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        invoke(&ChartRenderer, self, spec, options, Settle::Leave).await
    }

    /// Render `error` into this context without a cancellation checkpoint,
    /// so failures can be shown in stopped contexts. Cancellation failures
    /// are always abbreviated.
    pub fn render_error(&self, error: &Error, options: &ErrorRenderOptions) -> Surface {
        let mut options = options.clone();
        if error.is_stopped() {
            options.abbreviated = true;
        }
        renderers::error::render_sync(self, &renderers::ErrorReport::from_error(error), &options)
    }

    // === renderer extensibility ===

    /// Renderers local to this context, consulted before its ancestors' and
    /// the session's.
    pub fn renderers(&self) -> &RendererRegistry {
        &self.inner.renderers
    }

    pub fn renderer_for_type(&self, type_name: &str) -> Option<TextRenderer> {
        let mut current = Some(self.clone());
        while let Some(ocx) = current {
            if let Some(renderer) = ocx.inner.renderers.get(type_name) {
                return Some(renderer);
            }
            current = ocx.parent();
        }
        self.session().renderers().get(type_name)
    }

    /// Render `text` with the strategy registered for `type_name`, leaving
    /// this context running.
    pub async fn render(
        &self,
        type_name: &str,
        text: &str,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        self.abort_if_stopped()?;
        let renderer = self
            .renderer_for_type(type_name)
            .ok_or_else(|| Error::RendererNotFound(type_name.to_string()))?;
        invoke(renderer.as_ref(), self, text, options, Settle::Leave).await
    }

    /// Top-level rendering of `text` by type: failures are rendered into
    /// this context (abbreviated) and returned, and the context is stopped
    /// afterwards unless keepalive is set.
    pub async fn invoke_renderer_for_type(
        &self,
        type_name: &str,
        text: &str,
        options: &RenderOptions,
    ) -> Result<Surface, Error> {
        let renderer = self
            .renderer_for_type(type_name)
            .ok_or_else(|| Error::RendererNotFound(type_name.to_string()))?;
        let result = invoke(
            renderer.as_ref(),
            self,
            text,
            options,
            Settle::StopUnlessKeepalive,
        )
        .await;
        if let Err(error) = &result {
            self.render_error(error, &ErrorRenderOptions::abbreviated());
        }
        result
    }

    // === background work ===

    /// Run `work` detached from the current invocation.
    ///
    /// Sets keepalive so the initiating invocation leaves this context
    /// running. The work is dropped when the context stops; other failures
    /// are rendered into the context. When the last pending background task
    /// of this context finishes, its background ends as with
    /// [`end_background`](Self::end_background).
    pub fn background<F>(&self, work: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), Error>> + Send + 'static,
    {
        self.set_keepalive(true);
        self.inner.background.fetch_add(1, Ordering::SeqCst);
        let ocx = self.clone();
        let cancelled = self.inner.activity.cancelled();
        tokio::spawn(async move {
            let result = tokio::select! {
                result = work => result,
                _ = cancelled => {
                    ocx.inner.background.fetch_sub(1, Ordering::SeqCst);
                    debug!(context = ocx.id(), "background work cancelled");
                    return;
                }
            };
            let remaining = ocx.inner.background.fetch_sub(1, Ordering::SeqCst) - 1;
            match result {
                Ok(()) => {}
                Err(error) if error.is_stopped() => {
                    debug!(context = ocx.id(), "background work stopped");
                    return;
                }
                Err(error) => {
                    warn!(context = ocx.id(), "background work failed: {}", error);
                    ocx.render_error(&error, &ErrorRenderOptions::default());
                }
            }
            if remaining == 0 && !ocx.is_stopped() {
                debug!(context = ocx.id(), "background work finished");
                ocx.end_background(false);
            }
        })
    }

    /// Background tasks started from this context that are still running.
    pub fn pending_background(&self) -> usize {
        self.inner.background.load(Ordering::SeqCst)
    }

    /// End background work started from this context.
    ///
    /// Stops the outermost ancestor whose only running child is on the path
    /// to this context, or the topmost context when `aggressive`.
    pub fn end_background(&self, aggressive: bool) {
        let mut ancestor = self.clone();
        while let Some(parent) = ancestor.parent() {
            if !aggressive
                && parent
                    .activity()
                    .children()
                    .iter()
                    .any(|child| !child.is_stopped() && !child.ptr_eq(ancestor.activity()))
            {
                break;
            }
            ancestor = parent;
        }
        ancestor.stop();
    }
}
