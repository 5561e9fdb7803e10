use crate::context::OutputContext;
use crate::error::Error;
use std::time::Duration;
use tokio::time::Instant;

/// Cooperative-yield helper returned by [`OutputContext::check_tick`].
///
/// Long-running loops call [`check`](Self::check) once per iteration: it is
/// always a cancellation checkpoint, and yields a scheduling turn whenever
/// `interval` has elapsed since the previous yield so that other tasks (and
/// stop requests) can interleave.
#[derive(Debug)]
pub struct CheckTick {
    ocx: OutputContext,
    interval: Duration,
    last_tick: Instant,
}

impl CheckTick {
    pub(crate) fn new(ocx: OutputContext, interval: Duration) -> Self {
        Self {
            ocx,
            interval,
            last_tick: Instant::now(),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns whether this call yielded.
    pub async fn check(&mut self) -> Result<bool, Error> {
        self.ocx.abort_if_stopped()?;
        let now = Instant::now();
        if now.duration_since(self.last_tick) < self.interval {
            return Ok(false);
        }
        self.last_tick = now;
        self.ocx.next_tick().await?;
        Ok(true)
    }
}
