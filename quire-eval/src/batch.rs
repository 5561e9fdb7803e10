use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

/// How a batch ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOutcome {
    /// Every unit up to the end (or up to `stop_before`) succeeded.
    Succeeded,
    /// A unit failed; evaluation halted there.
    Failed(String),
    /// The batch or one of its units was stopped.
    Stopped,
}

/// Completion signal of one [`Evaluator::evaluate_batch`](crate::Evaluator::evaluate_batch) run.
///
/// [`resolved`](Self::resolved) completes only when the batch succeeded and
/// stays pending forever otherwise. Callers that must also learn about
/// failures wait on [`settled`](Self::settled) instead.
#[derive(Clone)]
pub struct BatchCompletion {
    id: u64,
    state: Arc<watch::Sender<Option<BatchOutcome>>>,
}

impl fmt::Debug for BatchCompletion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchCompletion")
            .field("id", &self.id)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl BatchCompletion {
    pub(crate) fn new(id: u64) -> Self {
        let (state, _) = watch::channel(None);
        Self {
            id,
            state: Arc::new(state),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// `None` while the batch is running.
    pub fn outcome(&self) -> Option<BatchOutcome> {
        self.state.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Record the outcome; only the first call has an effect.
    pub(crate) fn settle(&self, outcome: BatchOutcome) -> bool {
        self.state.send_if_modified(|state| {
            if state.is_some() {
                return false;
            }
            *state = Some(outcome);
            true
        })
    }

    pub async fn settled(&self) -> BatchOutcome {
        let mut receiver = self.state.subscribe();
        match receiver.wait_for(Option::is_some).await {
            Ok(state) => state.clone().unwrap_or(BatchOutcome::Stopped),
            // The sender lives as long as `self`.
            Err(_) => BatchOutcome::Stopped,
        }
    }

    pub async fn resolved(&self) {
        if self.settled().await != BatchOutcome::Succeeded {
            std::future::pending::<()>().await;
        }
    }
}
