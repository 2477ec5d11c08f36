//! [MODULE C4] Queue Processor — the supervising loop. Single-threaded with
//! respect to executor invocations; cooperates with the control plane (C6)
//! through the shared state lock.
//!
//! Grounded in the *shape* of the teacher's `ReviewExecutor::execute` loop
//! (`review.rs`): a long-running orchestration over shared state with a
//! cutoff timer and per-item status tracking, generalized here from "fan
//! out to N models once" to "loop forever over one prompt at a time".

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::QueueError;
use crate::executor::{ExecutorAdapter, PromptSubmission};
use crate::queue::{ExecutionOutcome, Prompt, QueueState, DEFAULT_LOG_LINES};
use crate::server::broadcast::{BroadcastEvent, Broadcaster};
use crate::store::StateStore;

/// Handle the control plane uses to cancel whichever prompt is currently
/// executing, if it matches the requested id (spec.md §5: "C6 signals the
/// processor's per-iteration cancel handle").
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<Mutex<Option<(String, CancellationToken)>>>,
}

impl CancelHandle {
    fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    async fn set(&self, id: String, token: CancellationToken) {
        *self.inner.lock().await = Some((id, token));
    }

    async fn clear(&self) {
        *self.inner.lock().await = None;
    }

    /// Cancel the in-flight execution if its id matches. Returns true if a
    /// cancellation was actually signalled.
    pub async fn cancel_if_matches(&self, id: &str) -> bool {
        if let Some((current_id, token)) = self.inner.lock().await.as_ref() {
            if current_id == id {
                token.cancel();
                return true;
            }
        }
        false
    }
}

pub struct Processor {
    state: Arc<Mutex<QueueState>>,
    store: Arc<StateStore>,
    executor: ExecutorAdapter,
    broadcaster: Broadcaster,
    tick_interval: Duration,
    cancel_handle: CancelHandle,
}

impl Processor {
    pub fn new(
        state: Arc<Mutex<QueueState>>,
        store: Arc<StateStore>,
        executor: ExecutorAdapter,
        broadcaster: Broadcaster,
        tick_interval: Duration,
    ) -> Self {
        Self {
            state,
            store,
            executor,
            broadcaster,
            tick_interval,
            cancel_handle: CancelHandle::new(),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel_handle.clone()
    }

    /// Run until `shutdown` fires. Probes the executor once before entering
    /// the loop; a failed probe aborts startup (spec.md §4.2).
    pub async fn run(self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let (ok, message) = self.executor.test_connection().await;
        if !ok {
            anyhow::bail!("executor connection test failed: {message}");
        }
        tracing::info!(message, "executor connection verified");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.pick_and_start().await {
                Some(prompt) => {
                    self.execute_one(prompt, &shutdown).await;
                }
                None => {
                    self.broadcaster.publish(BroadcastEvent::IdleTick { at: Utc::now() });
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.tick_interval) => {}
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Steps 1-4 of §4.4: heartbeat reload, promote expired rate limits,
    /// pick the next prompt, transition it to EXECUTING, persist, broadcast.
    async fn pick_and_start(&self) -> Option<Prompt> {
        let disk = self.store.load_queue_state().await;

        let mut guard = self.state.lock().await;
        guard.merge_counters_max(&disk.counters());
        let promoted = guard.promote_expired_rate_limits(Utc::now());

        let Some(candidate) = guard.next().cloned() else {
            if !promoted.is_empty() {
                if let Err(e) = self.store.save_queue_state(&guard).await {
                    tracing::error!(error = %e, "failed to persist after promoting rate-limited prompts");
                }
            }
            return None;
        };

        let is_resume = candidate.rate_limit_reset.is_some();
        if let Err(e) = guard.start_execution(&candidate.id) {
            tracing::error!(error = %e, prompt_id = %candidate.id, "failed to start execution of picked prompt");
            return None;
        }
        if let Some(p) = guard.find_mut(&candidate.id) {
            p.rate_limit_reset = None;
            if is_resume {
                p.original_content = Some(p.content.clone());
            }
        }

        if let Err(e) = self.store.save_queue_state(&guard).await {
            tracing::error!(error = %e, "failed to persist after starting execution");
        }
        let snapshot = guard.find(&candidate.id).cloned();
        drop(guard);

        if let Some(ref prompt) = snapshot {
            self.broadcaster.publish(BroadcastEvent::ExecutionStarted {
                prompt_id: prompt.id.clone(),
                at: Utc::now(),
            });
        }
        snapshot
    }

    /// Step 5-6 of §4.4: invoke the executor without holding the state
    /// lock, then apply the resulting transition under the lock.
    async fn execute_one(&self, prompt: Prompt, shutdown: &CancellationToken) {
        let submission = if prompt.original_content.is_some() {
            PromptSubmission::Resume
        } else {
            PromptSubmission::Original
        };

        let cancel = CancellationToken::new();
        self.cancel_handle.set(prompt.id.clone(), cancel.clone()).await;

        let shutdown_for_watch = shutdown.clone();
        let cancel_for_watch = cancel.clone();
        let watcher = tokio::spawn(async move {
            shutdown_for_watch.cancelled().await;
            cancel_for_watch.cancel();
        });

        let result = self.executor.execute_prompt(&prompt, submission, cancel).await;
        watcher.abort();
        self.cancel_handle.clear().await;

        // Shutdown (not an explicit per-prompt cancel request) raced the
        // execution and won: leave the prompt EXECUTING rather than
        // applying a terminal CANCELLED transition. `shutdown()`'s
        // `demote_executing()` requeues it with `retry_count` unchanged
        // (spec.md §8: "every prompt that was EXECUTING is in QUEUED with
        // retry_count unchanged").
        if matches!(result.outcome, ExecutionOutcome::Cancelled) && shutdown.is_cancelled() {
            tracing::info!(
                prompt_id = %prompt.id,
                "execution interrupted by shutdown, leaving EXECUTING for requeue"
            );
            return;
        }

        let mut guard = self.state.lock().await;
        for line in &result.captured_lines {
            if let Some(p) = guard.find_mut(&prompt.id) {
                p.push_log_line(line.clone(), Utc::now(), DEFAULT_LOG_LINES);
            }
        }
        if let Some(p) = guard.find_mut(&prompt.id) {
            p.original_content = None;
        }

        match guard.apply_outcome(&prompt.id, result.outcome, Utc::now()) {
            Ok(status) => {
                if let Err(e) = self.store.save_queue_state(&guard).await {
                    tracing::error!(error = %e, "failed to persist after applying outcome");
                }
                drop(guard);
                self.broadcaster.publish(BroadcastEvent::ExecutionCompleted {
                    prompt_id: prompt.id.clone(),
                    status,
                    at: Utc::now(),
                });
            }
            Err(QueueError::NotFound(_)) => {
                tracing::warn!(prompt_id = %prompt.id, "prompt vanished before outcome could be applied");
            }
            Err(e) => {
                tracing::error!(error = %e, prompt_id = %prompt.id, "failed to apply execution outcome");
            }
        }
    }

    /// Shutdown sequence of §4.4: stop picking work (already true, the loop
    /// exited), demote any EXECUTING prompt back to QUEUED, persist once.
    async fn shutdown(&self) {
        let mut guard = self.state.lock().await;
        guard.demote_executing();
        if let Err(e) = self.store.save_queue_state(&guard).await {
            tracing::error!(error = %e, "failed to persist final state on shutdown");
        }
        tracing::info!("processor shut down cleanly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounts::AccountsStore;
    use std::sync::Arc as StdArc;

    fn test_executor(executable: &str, accounts_root: &std::path::Path) -> ExecutorAdapter {
        ExecutorAdapter {
            executable: executable.to_string(),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(2),
            output_capture_bytes: 1024 * 1024,
            execution_log_lines: 200,
            rate_limit_signals: crate::executor::rate_limit::DEFAULT_SIGNALS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            rate_limit_backoff_seconds: 60,
            cancel_grace: Duration::from_millis(100),
            accounts: StdArc::new(AccountsStore::new(accounts_root.to_path_buf())),
        }
    }

    #[tokio::test]
    async fn one_tick_runs_a_queued_prompt_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().to_path_buf()));

        let mut state = QueueState::default();
        state.prompts.push(Prompt::new(
            "p1".to_string(),
            "hello".to_string(),
            0,
            ".".to_string(),
            vec![],
            3,
            None,
            Utc::now(),
        ));
        let state = Arc::new(Mutex::new(state));

        let processor = Processor::new(
            state.clone(),
            store,
            test_executor("true", dir.path()),
            Broadcaster::new(16),
            Duration::from_millis(10),
        );

        let started = processor.pick_and_start().await.expect("should pick p1");
        assert_eq!(started.id, "p1");
        processor.execute_one(started, &CancellationToken::new()).await;

        let guard = state.lock().await;
        assert_eq!(guard.find("p1").unwrap().status, crate::queue::PromptStatus::Completed);
        assert_eq!(guard.total_processed, 1);
    }

    #[tokio::test]
    async fn shutdown_demotes_executing_prompt() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().to_path_buf()));
        let mut state = QueueState::default();
        state.prompts.push(Prompt::new(
            "p1".to_string(),
            "hello".to_string(),
            0,
            ".".to_string(),
            vec![],
            3,
            None,
            Utc::now(),
        ));
        state.start_execution("p1").unwrap();
        let state = Arc::new(Mutex::new(state));

        let processor = Processor::new(
            state.clone(),
            store,
            test_executor("true", dir.path()),
            Broadcaster::new(16),
            Duration::from_millis(10),
        );
        processor.shutdown().await;

        let guard = state.lock().await;
        assert_eq!(guard.find("p1").unwrap().status, crate::queue::PromptStatus::Queued);
    }

    #[tokio::test]
    async fn shutdown_racing_an_in_flight_execution_requeues_it_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::new(dir.path().to_path_buf()));

        let mut state = QueueState::default();
        state.prompts.push(Prompt::new(
            "p1".to_string(),
            "hello".to_string(),
            0,
            ".".to_string(),
            vec![],
            3,
            None,
            Utc::now(),
        ));
        let state = Arc::new(Mutex::new(state));

        let mut executor = test_executor("sleep", dir.path());
        executor.extra_args = vec!["5".to_string()];
        executor.cancel_grace = Duration::from_millis(50);

        let processor = Processor::new(
            state.clone(),
            store,
            executor,
            Broadcaster::new(16),
            Duration::from_millis(10),
        );

        let started = processor.pick_and_start().await.expect("should pick p1");
        assert_eq!(started.id, "p1");

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        processor.execute_one(started, &shutdown).await;

        // execute_one must not have applied a terminal CANCELLED outcome;
        // it leaves the prompt EXECUTING for shutdown()'s demote_executing.
        let guard = state.lock().await;
        let p = guard.find("p1").unwrap();
        assert_eq!(p.status, crate::queue::PromptStatus::Executing);
        assert_eq!(p.retry_count, 0);
        drop(guard);

        processor.shutdown().await;
        let guard = state.lock().await;
        let p = guard.find("p1").unwrap();
        assert_eq!(p.status, crate::queue::PromptStatus::Queued);
        assert_eq!(p.retry_count, 0);
    }
}
