use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::prompt::{Prompt, PromptStatus};
use crate::error::QueueError;

/// Global counters for the queue. Monotonic within a process lifetime and
/// preserved across in-memory reloads by taking the per-counter maximum.
/// Not serialized directly (see `QueueState`'s flat on-disk schema);
/// used as a detached snapshot for merge arithmetic.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueueCounters {
    pub total_processed: u64,
    pub failed_count: u64,
    pub rate_limited_count: u64,
}

impl QueueCounters {
    /// Merge two counter snapshots by taking the per-field maximum, so a
    /// heartbeat reload can never regress a counter (Testable Properties,
    /// spec.md §8: "every counter in S2 >= the corresponding counter in S1").
    pub fn merged_max(&self, other: &Self) -> Self {
        Self {
            total_processed: self.total_processed.max(other.total_processed),
            failed_count: self.failed_count.max(other.failed_count),
            rate_limited_count: self.rate_limited_count.max(other.rate_limited_count),
        }
    }
}

/// An ordered collection of prompts plus global counters. Schema matches
/// spec.md §6's `queue_state.json`: a flat object, not a nested counters
/// block — unknown top-level fields are rejected.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueueState {
    pub prompts: Vec<Prompt>,
    pub total_processed: u64,
    pub failed_count: u64,
    pub rate_limited_count: u64,
    pub last_processed: Option<DateTime<Utc>>,
}

/// The outcome of an execution attempt, as reported by the executor adapter.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Success,
    RateLimited { reset_at: DateTime<Utc> },
    Failure { error: String },
    Cancelled,
}

impl QueueState {
    pub fn counters(&self) -> QueueCounters {
        QueueCounters {
            total_processed: self.total_processed,
            failed_count: self.failed_count,
            rate_limited_count: self.rate_limited_count,
        }
    }

    /// Merge counters by per-field maximum; used on processor heartbeat
    /// reload (spec.md §4.4 step 1).
    pub fn merge_counters_max(&mut self, disk: &QueueCounters) {
        let merged = self.counters().merged_max(disk);
        self.total_processed = merged.total_processed;
        self.failed_count = merged.failed_count;
        self.rate_limited_count = merged.rate_limited_count;
    }

    /// Select the next prompt to execute: among `QUEUED` prompts, the one
    /// with the lowest priority value, ties broken by earliest creation
    /// timestamp. Deterministic for a given snapshot.
    pub fn next(&self) -> Option<&Prompt> {
        self.prompts
            .iter()
            .filter(|p| p.status == PromptStatus::Queued)
            .min_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
    }

    pub fn find(&self, id: &str) -> Option<&Prompt> {
        self.prompts.iter().find(|p| p.id == id)
    }

    pub fn find_mut(&mut self, id: &str) -> Option<&mut Prompt> {
        self.prompts.iter_mut().find(|p| p.id == id)
    }

    pub fn count_executing(&self) -> usize {
        self.prompts
            .iter()
            .filter(|p| p.status == PromptStatus::Executing)
            .count()
    }

    /// Promote any `RATE_LIMITED` prompt whose reset time has passed to
    /// `QUEUED` (spec.md §4.3, §4.4 step 2).
    pub fn promote_expired_rate_limits(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut promoted = Vec::new();
        for p in self.prompts.iter_mut() {
            if p.status == PromptStatus::RateLimited
                && p.rate_limit_reset.is_some_and(|reset| reset <= now)
            {
                p.status = PromptStatus::Queued;
                promoted.push(p.id.clone());
            }
        }
        promoted
    }

    /// QUEUED -> EXECUTING. Rejects if another prompt is already executing
    /// (spec.md §3 invariant: at most one EXECUTING prompt at a time).
    pub fn start_execution(&mut self, id: &str) -> Result<(), QueueError> {
        if self.count_executing() > 0 {
            return Err(QueueError::AlreadyExecuting);
        }
        let p = self
            .find_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if p.status != PromptStatus::Queued {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: p.status,
            });
        }
        p.status = PromptStatus::Executing;
        Ok(())
    }

    /// Apply the transition for an EXECUTING prompt's result, per the
    /// table in spec.md §4.3.
    pub fn apply_outcome(
        &mut self,
        id: &str,
        outcome: ExecutionOutcome,
        now: DateTime<Utc>,
    ) -> Result<PromptStatus, QueueError> {
        let p = self
            .find_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if p.status != PromptStatus::Executing {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: p.status,
            });
        }

        let new_status = match outcome {
            ExecutionOutcome::Success => {
                p.status = PromptStatus::Completed;
                p.last_error = None;
                PromptStatus::Completed
            }
            ExecutionOutcome::RateLimited { reset_at } => {
                p.status = PromptStatus::RateLimited;
                p.rate_limit_reset = Some(reset_at);
                p.retry_count += 1;
                PromptStatus::RateLimited
            }
            ExecutionOutcome::Failure { error } => {
                p.status = PromptStatus::Failed;
                p.last_error = Some(error);
                p.retry_count += 1;
                PromptStatus::Failed
            }
            ExecutionOutcome::Cancelled => {
                p.status = PromptStatus::Cancelled;
                PromptStatus::Cancelled
            }
        };

        match new_status {
            PromptStatus::Completed => {
                self.total_processed += 1;
                self.last_processed = Some(now);
            }
            PromptStatus::RateLimited => self.rate_limited_count += 1,
            PromptStatus::Failed => self.failed_count += 1,
            _ => {}
        }

        Ok(new_status)
    }

    /// Re-queue a FAILED or RATE_LIMITED prompt that `can_retry()`.
    pub fn requeue(&mut self, id: &str) -> Result<(), QueueError> {
        let p = self
            .find_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if !p.can_retry() {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: p.status,
            });
        }
        p.status = PromptStatus::Queued;
        Ok(())
    }

    /// Cancel a prompt that is not currently executing. Executing prompts
    /// go through the processor's cancellation handle instead (spec.md §5).
    pub fn cancel(&mut self, id: &str) -> Result<(), QueueError> {
        let p = self
            .find_mut(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        if matches!(
            p.status,
            PromptStatus::Completed | PromptStatus::Cancelled
        ) {
            return Err(QueueError::InvalidTransition {
                id: id.to_string(),
                from: p.status,
            });
        }
        p.status = PromptStatus::Cancelled;
        Ok(())
    }

    /// On clean shutdown, demote any EXECUTING prompt back to QUEUED with
    /// retry count unchanged (spec.md §3 invariant, §4.4 shutdown step c).
    pub fn demote_executing(&mut self) {
        for p in self.prompts.iter_mut() {
            if p.status == PromptStatus::Executing {
                p.status = PromptStatus::Queued;
            }
        }
    }

    pub fn status_counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for p in &self.prompts {
            match p.status {
                PromptStatus::Queued => counts.queued += 1,
                PromptStatus::Executing => counts.executing += 1,
                PromptStatus::Completed => counts.completed += 1,
                PromptStatus::Failed => counts.failed += 1,
                PromptStatus::Cancelled => counts.cancelled += 1,
                PromptStatus::RateLimited => counts.rate_limited += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatusCounts {
    pub queued: u64,
    pub executing: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rate_limited: u64,
}
