use crate::batch::{BatchCompletion, BatchOutcome};
use crate::document::{Cell, Document};
use crate::error::Error;
use crate::lock;
use crate::settings::Settings;
use quire_activity::{ActivityManager, ActivityTree, EventStream, StopState, SubscribeOptions};
use quire_output::{
    ATTR_SOURCE_ELEMENT, ATTR_SOURCE_MEDIA_TYPE, GlobalState, OutputContext, RenderOptions,
    RendererRegistry, Session, Surface, SurfaceSpec,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, instrument, warn};

/// Dispatched when a cell gets its first running context (`evaluating`)
/// and when its last running context stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvalState {
    pub cell: String,
    pub evaluating: bool,
}

/// Evaluates the cells of one [`Document`].
///
/// Every evaluation runs in its own [`OutputContext`], managed by the
/// evaluator's restartable activity: [`stop`](Self::stop) cancels everything
/// in flight and leaves the evaluator ready for the next batch.
#[derive(Clone)]
pub struct Evaluator {
    inner: Arc<EvaluatorInner>,
}

struct EvaluatorInner {
    document: Document,
    session: Session,
    activity: ActivityManager,
    settings: Mutex<Settings>,
    contexts: Mutex<HashMap<String, Vec<OutputContext>>>,
    eval_states: EventStream<EvalState>,
    last_batch: Mutex<Option<BatchCompletion>>,
    next_batch: AtomicU64,
}

impl fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Evaluator")
            .field("session", &self.inner.session)
            .field("cells", &self.inner.document.len())
            .field("evaluating", &self.is_evaluating())
            .finish()
    }
}

impl Evaluator {
    pub fn new(document: Document, settings: Settings) -> Self {
        let session = Session::new(settings.render.clone());
        Self {
            inner: Arc::new(EvaluatorInner {
                document,
                session,
                activity: ActivityManager::labelled("evaluator", true),
                settings: Mutex::new(settings),
                contexts: Mutex::new(HashMap::new()),
                eval_states: EventStream::new(),
                last_batch: Mutex::new(None),
                next_batch: AtomicU64::new(1),
            }),
        }
    }

    pub fn document(&self) -> &Document {
        &self.inner.document
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn activity(&self) -> &ActivityManager {
        &self.inner.activity
    }

    pub fn eval_states(&self) -> &EventStream<EvalState> {
        &self.inner.eval_states
    }

    pub fn global_state(&self) -> GlobalState {
        self.inner.session.global_state()
    }

    pub fn settings(&self) -> Settings {
        lock(&self.inner.settings).clone()
    }

    pub fn update_settings(&self, settings: Settings) {
        self.inner.session.set_settings(settings.render.clone());
        *lock(&self.inner.settings) = settings;
    }

    /// Evaluate one cell into a fresh output surface.
    ///
    /// Failures are rendered (abbreviated) into that surface and returned.
    #[instrument(skip_all, fields(cell = %cell.id()))]
    pub async fn evaluate_cell(&self, cell: &Cell) -> Result<Surface, Error> {
        if self.settings().reset_before_render {
            self.reset_cell(cell);
        }

        let kind = cell.kind();
        let renderer = self
            .inner
            .session
            .renderers()
            .get(&kind)
            .ok_or_else(|| quire_output::Error::RendererNotFound(kind.clone()))?;
        let output = cell.output().create_child(
            SurfaceSpec::default()
                .class("output")
                .attr(ATTR_SOURCE_ELEMENT, cell.id())
                .attr(ATTR_SOURCE_MEDIA_TYPE, renderer.media_type()),
        );

        let ocx = OutputContext::root(&self.inner.session, output);
        let evaluator = Arc::downgrade(&self.inner);
        let cell_id = cell.id().to_string();
        let ocx_id = ocx.id();
        self.inner
            .activity
            .manage_with(ocx.activity(), move || dissociate(&evaluator, &cell_id, ocx_id))?;
        self.associate(cell.id(), &ocx);

        let options = RenderOptions::default().with_global_state(self.global_state());
        debug!(context = ocx.id(), kind = %kind, "evaluating cell");
        Ok(ocx
            .invoke_renderer_for_type(&kind, &cell.text(), &options)
            .await?)
    }

    /// Evaluate `units` in order, one at a time.
    ///
    /// Stops whatever is running and resets the global state first. Halts
    /// before `stop_before`, on the first failing unit, and when the
    /// evaluator is stopped meanwhile. On success the returned completion
    /// resolves one scheduling turn later; after a failure or stop it never
    /// resolves, and [`BatchCompletion::settled`] reports why.
    #[instrument(skip_all, fields(units = units.len(), stop_before = stop_before.map(Cell::id)))]
    pub async fn evaluate_batch(
        &self,
        units: &[Cell],
        stop_before: Option<&Cell>,
    ) -> Result<BatchCompletion, Error> {
        if let Some(limit) = stop_before {
            if !units.contains(limit) {
                return Err(Error::CellNotFound(limit.id().to_string()));
            }
        }

        let completion = BatchCompletion::new(self.inner.next_batch.fetch_add(1, Ordering::Relaxed));
        *lock(&self.inner.last_batch) = Some(completion.clone());

        self.stop();
        self.inner.session.reset_global_state();

        let stopped = Arc::new(AtomicBool::new(false));
        let flag = stopped.clone();
        let subscription = self.inner.activity.stop_states().subscribe(
            move |_: &StopState| flag.store(true, Ordering::SeqCst),
            SubscribeOptions::default(),
        )?;

        let result = self.run_units(units, stop_before, &stopped).await;
        subscription.unsubscribe();

        match result {
            Ok(()) => {
                let settle = completion.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    settle.settle(BatchOutcome::Succeeded);
                });
                Ok(completion)
            }
            Err(error) => {
                completion.settle(if error.is_stopped() {
                    BatchOutcome::Stopped
                } else {
                    BatchOutcome::Failed(error.to_string())
                });
                Err(error)
            }
        }
    }

    async fn run_units(
        &self,
        units: &[Cell],
        stop_before: Option<&Cell>,
        stopped: &AtomicBool,
    ) -> Result<(), Error> {
        for cell in units {
            if stopped.load(Ordering::SeqCst) {
                info!(cell = %cell.id(), "batch stopped");
                return Err(Error::stopped());
            }
            if stop_before == Some(cell) {
                debug!(cell = %cell.id(), "batch reached its limit");
                break;
            }
            if let Err(error) = self.evaluate_cell(cell).await {
                if error.is_stopped() {
                    info!(cell = %cell.id(), "batch stopped while evaluating cell");
                } else {
                    warn!(cell = %cell.id(), "stopped batch after error evaluating cell: {}", error);
                }
                return Err(error);
            }
        }
        Ok(())
    }

    /// Evaluate the whole document.
    pub async fn evaluate_all(&self) -> Result<BatchCompletion, Error> {
        let cells = self.inner.document.cells();
        self.evaluate_batch(&cells, None).await
    }

    /// Evaluate every cell above `id`.
    pub async fn evaluate_before(&self, id: &str) -> Result<BatchCompletion, Error> {
        let cell = self.cell(id)?;
        let cells = self.inner.document.cells();
        self.evaluate_batch(&cells, Some(&cell)).await
    }

    pub fn cell(&self, id: &str) -> Result<Cell, Error> {
        self.inner
            .document
            .cell(id)
            .ok_or_else(|| Error::CellNotFound(id.to_string()))
    }

    /// Stop every running evaluation.
    pub fn stop(&self) {
        if !self.inner.activity.stop_best_effort() {
            warn!("error while stopping evaluator activities");
        }
    }

    pub fn stop_cell(&self, cell: &Cell) {
        for ocx in self.contexts_of(cell) {
            if !ocx.activity().stop_best_effort() {
                warn!(cell = %cell.id(), context = ocx.id(), "error while stopping output context");
            }
        }
    }

    pub fn can_stop_cell(&self, cell: &Cell) -> bool {
        self.contexts_of(cell).iter().any(|ocx| !ocx.is_stopped())
    }

    /// Stop everything, restore the built-in renderers, reset the global
    /// state and clear every cell's output.
    pub fn reset(&self) -> Result<(), Error> {
        self.stop();
        self.inner
            .session
            .renderers()
            .reset(RendererRegistry::builtin_text_renderers())?;
        self.inner.session.reset_global_state();
        for cell in self.inner.document.cells() {
            self.reset_cell(&cell);
        }
        Ok(())
    }

    pub fn reset_cell(&self, cell: &Cell) {
        self.stop_cell(cell);
        cell.output().clear();
    }

    /// True while a batch is running or any cell has a running context.
    pub fn is_evaluating(&self) -> bool {
        let batch_running = lock(&self.inner.last_batch)
            .as_ref()
            .is_some_and(|batch| !batch.is_settled());
        batch_running
            || lock(&self.inner.contexts)
                .values()
                .flatten()
                .any(|ocx| !ocx.is_stopped())
    }

    pub fn last_batch_completion(&self) -> Option<BatchCompletion> {
        lock(&self.inner.last_batch).clone()
    }

    pub fn activity_tree(&self) -> ActivityTree {
        self.inner.activity.tree()
    }

    fn contexts_of(&self, cell: &Cell) -> Vec<OutputContext> {
        lock(&self.inner.contexts)
            .get(cell.id())
            .cloned()
            .unwrap_or_default()
    }

    fn associate(&self, cell_id: &str, ocx: &OutputContext) {
        let first = {
            let mut contexts = lock(&self.inner.contexts);
            let entry = contexts.entry(cell_id.to_string()).or_default();
            entry.push(ocx.clone());
            entry.len() == 1
        };
        if first {
            self.inner.eval_states.dispatch(&EvalState {
                cell: cell_id.to_string(),
                evaluating: true,
            });
        }
    }
}

fn dissociate(evaluator: &Weak<EvaluatorInner>, cell_id: &str, ocx_id: u64) {
    let Some(inner) = evaluator.upgrade() else {
        return;
    };
    let last = {
        let mut contexts = lock(&inner.contexts);
        let Some(entry) = contexts.get_mut(cell_id) else {
            return;
        };
        entry.retain(|ocx| ocx.id() != ocx_id);
        let last = entry.is_empty();
        if last {
            contexts.remove(cell_id);
        }
        last
    };
    if last {
        inner.eval_states.dispatch(&EvalState {
            cell: cell_id.to_string(),
            evaluating: false,
        });
    }
}
