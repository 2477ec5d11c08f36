//! [MODULE C3] Queue State Machine — pure rules over the queue state.
//!
//! No I/O here; `Processor` (C4) and the control plane (C6) own the
//! `Arc<Mutex<QueueState>>` and persistence.

pub mod prompt;
pub mod state;

pub use prompt::{LogLine, Prompt, PromptStatus, DEFAULT_LOG_LINES};
pub use state::{ExecutionOutcome, QueueCounters, QueueState, StatusCounts};

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};

    fn mk_prompt(id: &str, priority: i64, created_offset_secs: i64) -> Prompt {
        Prompt::new(
            id.to_string(),
            "say hi".to_string(),
            priority,
            ".".to_string(),
            vec![],
            3,
            None,
            Utc::now() + ChronoDuration::seconds(created_offset_secs),
        )
    }

    #[test]
    fn selection_order_by_priority_then_creation() {
        let mut state = QueueState::default();
        state.prompts.push(mk_prompt("a", 5, 0));
        state.prompts.push(mk_prompt("b", 1, 1));
        state.prompts.push(mk_prompt("c", 1, 2));

        assert_eq!(state.next().unwrap().id, "b");
        state.find_mut("b").unwrap().status = PromptStatus::Completed;
        assert_eq!(state.next().unwrap().id, "c");
        state.find_mut("c").unwrap().status = PromptStatus::Completed;
        assert_eq!(state.next().unwrap().id, "a");
    }

    #[test]
    fn happy_path_completion_increments_total_processed() {
        let mut state = QueueState::default();
        state.prompts.push(mk_prompt("p1", 0, 0));
        state.start_execution("p1").unwrap();
        let status = state
            .apply_outcome("p1", ExecutionOutcome::Success, Utc::now())
            .unwrap();
        assert_eq!(status, PromptStatus::Completed);
        assert_eq!(state.total_processed, 1);
        assert_eq!(state.find("p1").unwrap().retry_count, 0);
    }

    #[test]
    fn first_failure_is_not_terminal_and_not_auto_requeued() {
        let mut state = QueueState::default();
        let mut p = mk_prompt("p1", 0, 0);
        p.max_retries = 3;
        state.prompts.push(p);
        state.start_execution("p1").unwrap();
        state
            .apply_outcome(
                "p1",
                ExecutionOutcome::Failure {
                    error: "boom".to_string(),
                },
                Utc::now(),
            )
            .unwrap();

        let p = state.find("p1").unwrap();
        assert_eq!(p.status, PromptStatus::Failed);
        assert_eq!(p.retry_count, 1);
        assert_eq!(state.failed_count, 1);
        assert!(p.can_retry());
        // no automatic re-queue in the same tick
        assert!(state.next().is_none());
    }

    #[test]
    fn max_retries_exhausted_becomes_terminal() {
        let mut state = QueueState::default();
        let mut p = mk_prompt("p1", 0, 0);
        p.max_retries = 2;
        p.retry_count = 2;
        state.prompts.push(p);
        state.start_execution("p1").unwrap();
        state
            .apply_outcome(
                "p1",
                ExecutionOutcome::Failure {
                    error: "boom".to_string(),
                },
                Utc::now(),
            )
            .unwrap();

        let p = state.find("p1").unwrap();
        assert_eq!(p.status, PromptStatus::Failed);
        assert_eq!(p.retry_count, 3);
        assert!(!p.can_retry());
        assert!(p.status.is_terminal(p.retry_count, p.max_retries));
    }

    #[test]
    fn rate_limited_then_promoted_after_reset() {
        let mut state = QueueState::default();
        state.prompts.push(mk_prompt("p1", 0, 0));
        state.start_execution("p1").unwrap();
        let reset_at = Utc::now() - ChronoDuration::seconds(1);
        state
            .apply_outcome(
                "p1",
                ExecutionOutcome::RateLimited { reset_at },
                Utc::now(),
            )
            .unwrap();

        assert_eq!(state.find("p1").unwrap().status, PromptStatus::RateLimited);
        assert_eq!(state.find("p1").unwrap().retry_count, 1);
        assert_eq!(state.rate_limited_count, 1);

        let promoted = state.promote_expired_rate_limits(Utc::now());
        assert_eq!(promoted, vec!["p1".to_string()]);
        assert_eq!(state.find("p1").unwrap().status, PromptStatus::Queued);
    }

    #[test]
    fn at_most_one_executing_at_a_time() {
        let mut state = QueueState::default();
        state.prompts.push(mk_prompt("p1", 0, 0));
        state.prompts.push(mk_prompt("p2", 1, 1));
        state.start_execution("p1").unwrap();
        assert!(matches!(
            state.start_execution("p2"),
            Err(crate::error::QueueError::AlreadyExecuting)
        ));
    }

    #[test]
    fn counters_merge_never_regresses() {
        let mut in_memory = QueueState::default();
        in_memory.total_processed = 5;
        in_memory.failed_count = 2;
        in_memory.rate_limited_count = 1;

        let disk = QueueCounters {
            total_processed: 0,
            failed_count: 0,
            rate_limited_count: 0,
        };
        in_memory.merge_counters_max(&disk);

        assert_eq!(in_memory.total_processed, 5);
        assert_eq!(in_memory.failed_count, 2);
        assert_eq!(in_memory.rate_limited_count, 1);
    }

    #[test]
    fn cancel_non_executing_prompt() {
        let mut state = QueueState::default();
        state.prompts.push(mk_prompt("p1", 0, 0));
        state.cancel("p1").unwrap();
        assert_eq!(state.find("p1").unwrap().status, PromptStatus::Cancelled);
    }

    #[test]
    fn demote_executing_on_shutdown_preserves_retry_count() {
        let mut state = QueueState::default();
        let mut p = mk_prompt("p1", 0, 0);
        p.retry_count = 2;
        state.prompts.push(p);
        state.start_execution("p1").unwrap();
        state.demote_executing();
        let p = state.find("p1").unwrap();
        assert_eq!(p.status, PromptStatus::Queued);
        assert_eq!(p.retry_count, 2);
    }
}
