//! Perpetual supervisor for the segmented encoder.
//!
//! One background loop runs the segmented pipeline over and over: whenever a
//! run ends without the caller asking for it, the loop waits a fixed backoff
//! and starts again. A restart request arriving while the loop is winding
//! down is queued and fires exactly once, after the old loop has finished.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::pipeline::PipelineError;

/// Delay before a failed run is retried.
pub const RETRY_DELAY: Duration = Duration::from_secs(1);

/// One run of the segmented pipeline; returns when cancelled or when the pipeline ends.
pub type RunFn =
    Arc<dyn Fn(CancellationToken) -> BoxFuture<'static, Result<(), PipelineError>> + Send + Sync>;

#[derive(Default)]
struct LoopState {
    /// Bumped for every loop started.
    loop_id: u64,
    cancel: Option<CancellationToken>,
    /// Cancelled when the loop task has returned.
    done: Option<CancellationToken>,
    restart_queued: bool,
}

impl LoopState {
    fn is_running(&self) -> bool {
        self.done.as_ref().is_some_and(|done| !done.is_cancelled())
    }

    fn is_winding_down(&self) -> bool {
        self.is_running() && self.cancel.as_ref().is_some_and(|c| c.is_cancelled())
    }
}

/// Keeps the segmented output running.
pub struct ContinuousOutput {
    runner: RunFn,
    retry_delay: Duration,
    state: Mutex<LoopState>,
    runs_started: AtomicU64,
}

impl ContinuousOutput {
    #[cfg(test)]
    pub fn new(runner: RunFn) -> Self {
        Self::with_retry_delay(runner, RETRY_DELAY)
    }

    pub fn with_retry_delay(runner: RunFn, retry_delay: Duration) -> Self {
        Self {
            runner,
            retry_delay,
            state: Mutex::new(LoopState::default()),
            runs_started: AtomicU64::new(0),
        }
    }

    /// Start the loop, or queue a single restart if it is winding down.
    pub fn ensure_running(self: &Arc<Self>) {
        let mut state = self.state.lock();
        if state.is_winding_down() {
            if !state.restart_queued {
                state.restart_queued = true;
                let expected = state.loop_id;
                let done = state.done.clone();
                let this = Arc::clone(self);
                tokio::spawn(async move {
                    if let Some(done) = done {
                        done.cancelled().await;
                    }
                    this.fire_queued_restart(expected);
                });
                debug!("[Hls] restart queued");
            }
            return;
        }
        if state.is_running() {
            return;
        }
        self.spawn_loop(&mut state);
    }

    fn fire_queued_restart(self: &Arc<Self>, expected_loop: u64) {
        let mut state = self.state.lock();
        if !state.restart_queued {
            // Cleared by stop() in the meantime.
            return;
        }
        state.restart_queued = false;
        if state.loop_id != expected_loop && state.is_running() {
            return;
        }
        self.spawn_loop(&mut state);
    }

    fn spawn_loop(self: &Arc<Self>, state: &mut LoopState) {
        let cancel = CancellationToken::new();
        let done = CancellationToken::new();
        state.loop_id += 1;
        state.cancel = Some(cancel.clone());
        state.done = Some(done.clone());

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let _done = done.drop_guard();
            this.run_loop(cancel).await;
        });
    }

    async fn run_loop(&self, cancel: CancellationToken) {
        info!("[Hls] continuous output started");
        while !cancel.is_cancelled() {
            self.runs_started.fetch_add(1, Ordering::SeqCst);
            let result = (self.runner)(cancel.clone()).await;
            if cancel.is_cancelled() {
                break;
            }
            match result {
                Ok(()) => warn!("[Hls] pipeline ended, restarting"),
                Err(e) => warn!("[Hls] pipeline failed: {}; retrying in {:?}", e, self.retry_delay),
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.retry_delay) => {}
            }
        }
        info!("[Hls] continuous output stopped");
    }

    /// Cancel the current run; a queued restart still fires.
    pub fn cancel_current(&self) {
        if let Some(cancel) = &self.state.lock().cancel {
            cancel.cancel();
        }
    }

    /// Cancel the current run and drop any queued restart.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        state.restart_queued = false;
        if let Some(cancel) = &state.cancel {
            cancel.cancel();
        }
    }

    /// The loop task has not finished yet.
    pub fn is_running(&self) -> bool {
        self.state.lock().is_running()
    }

    /// Running and not asked to stop; such a loop keeps the device.
    pub fn is_active(&self) -> bool {
        let state = self.state.lock();
        state.is_running() && !state.is_winding_down()
    }

    #[cfg(test)]
    pub fn restart_queued(&self) -> bool {
        self.state.lock().restart_queued
    }

    /// Number of pipeline runs started since creation.
    #[cfg(test)]
    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;

    /// Runner that idles until cancelled.
    fn idle_runner() -> RunFn {
        Arc::new(|cancel: CancellationToken| {
            async move {
                cancel.cancelled().await;
                Ok(())
            }
            .boxed()
        })
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_ensure_running_is_idempotent() {
        let output = Arc::new(ContinuousOutput::new(idle_runner()));
        output.ensure_running();
        output.ensure_running();
        settle().await;
        output.ensure_running();
        settle().await;

        assert!(output.is_running());
        assert_eq!(output.runs_started(), 1);

        output.stop();
        settle().await;
        assert!(!output.is_running());
    }

    #[tokio::test]
    async fn test_restart_requests_coalesce() {
        let output = Arc::new(ContinuousOutput::new(idle_runner()));
        output.ensure_running();
        settle().await;
        assert_eq!(output.runs_started(), 1);

        // Three restart requests while the first loop is still winding down.
        output.cancel_current();
        output.ensure_running();
        output.ensure_running();
        output.ensure_running();
        assert!(output.restart_queued());

        settle().await;
        assert!(output.is_running());
        assert!(!output.restart_queued());
        assert_eq!(output.runs_started(), 2);

        output.stop();
        settle().await;
        assert!(!output.is_running());
        assert_eq!(output.runs_started(), 2);
    }

    #[tokio::test]
    async fn test_stop_discards_queued_restart() {
        let output = Arc::new(ContinuousOutput::new(idle_runner()));
        output.ensure_running();
        settle().await;

        output.cancel_current();
        output.ensure_running();
        output.stop();

        settle().await;
        assert!(!output.is_running());
        assert_eq!(output.runs_started(), 1);
    }

    #[tokio::test]
    async fn test_failed_runs_are_retried() {
        let runner: RunFn = Arc::new(|_cancel: CancellationToken| {
            async move {
                Err(PipelineError::OutputClosed)
            }
            .boxed()
        });
        let output = Arc::new(ContinuousOutput::with_retry_delay(
            runner,
            Duration::from_millis(10),
        ));
        output.ensure_running();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(output.is_running());
        assert!(output.runs_started() >= 3);

        output.stop();
        settle().await;
        assert!(!output.is_running());
    }
}
