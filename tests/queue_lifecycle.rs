//! Drives the processor across several ticks against real temp-directory
//! persistence, the way the teacher's `tests/cli_persistence.rs` exercised
//! `dispatch::cli` against a real filesystem rather than mocking it out.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cuti_queue::accounts::AccountsStore;
use cuti_queue::executor::rate_limit;
use cuti_queue::executor::ExecutorAdapter;
use cuti_queue::processor::Processor;
use cuti_queue::queue::{Prompt, PromptStatus, QueueState};
use cuti_queue::server::broadcast::Broadcaster;
use cuti_queue::store::StateStore;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

fn executor_for(executable: &str, accounts_root: &std::path::Path) -> ExecutorAdapter {
    ExecutorAdapter {
        executable: executable.to_string(),
        extra_args: Vec::new(),
        timeout: Duration::from_secs(2),
        output_capture_bytes: 1024 * 1024,
        execution_log_lines: 200,
        rate_limit_signals: rate_limit::DEFAULT_SIGNALS.iter().map(|s| s.to_string()).collect(),
        rate_limit_backoff_seconds: 60,
        cancel_grace: Duration::from_millis(100),
        accounts: Arc::new(AccountsStore::new(accounts_root.to_path_buf())),
    }
}

#[tokio::test]
async fn a_queued_prompt_survives_a_reload_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = StateStore::new(dir.path().to_path_buf());

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
    store.save_queue_state(&state).await.unwrap();

    let reloaded = store.load_queue_state().await;
    assert_eq!(reloaded.prompts.len(), 1);
    assert_eq!(reloaded.prompts[0].status, PromptStatus::Queued);
}

#[tokio::test]
async fn processor_completes_a_prompt_and_persists_the_outcome() {
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
        store.clone(),
        executor_for("true", dir.path()),
        Broadcaster::new(16),
        Duration::from_millis(10),
    );

    let shutdown = CancellationToken::new();
    let shutdown_for_run = shutdown.clone();
    let task = tokio::spawn(processor.run(shutdown_for_run));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let on_disk = store.load_queue_state().await;
    assert_eq!(on_disk.prompts[0].status, PromptStatus::Completed);
    assert_eq!(on_disk.total_processed, 1);
}

#[tokio::test]
async fn a_failing_executor_marks_the_prompt_failed_after_exhausting_retries() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(StateStore::new(dir.path().to_path_buf()));

    let mut state = QueueState::default();
    state.prompts.push(Prompt::new(
        "p1".to_string(),
        "hello".to_string(),
        0,
        ".".to_string(),
        vec![],
        0,
        None,
        Utc::now(),
    ));
    let state = Arc::new(Mutex::new(state));

    let processor = Processor::new(
        state.clone(),
        store.clone(),
        executor_for("false", dir.path()),
        Broadcaster::new(16),
        Duration::from_millis(10),
    );

    let shutdown = CancellationToken::new();
    let shutdown_for_run = shutdown.clone();
    let task = tokio::spawn(processor.run(shutdown_for_run));

    tokio::time::sleep(Duration::from_millis(200)).await;
    shutdown.cancel();
    task.await.unwrap().unwrap();

    let on_disk = store.load_queue_state().await;
    assert_eq!(on_disk.prompts[0].status, PromptStatus::Failed);
    assert_eq!(on_disk.failed_count, 1);
}
