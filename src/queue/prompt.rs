use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Maximum number of lines retained in a prompt's execution log.
pub const DEFAULT_LOG_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(deny_unknown_fields)]
pub enum PromptStatus {
    Queued,
    Executing,
    Completed,
    Failed,
    Cancelled,
    RateLimited,
}

impl PromptStatus {
    pub fn is_terminal(self, retry_count: u32, max_retries: u32) -> bool {
        match self {
            Self::Completed | Self::Cancelled => true,
            Self::Failed => retry_count >= max_retries,
            Self::Queued | Self::Executing | Self::RateLimited => false,
        }
    }
}

/// A single timestamped line in a prompt's bounded execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogLine {
    pub at: DateTime<Utc>,
    pub text: String,
}

/// A unit of work submitted by a client, carrying content plus execution parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Prompt {
    pub id: String,
    pub content: String,
    /// Bookkeeping only: set by the processor when a rate-limited prompt
    /// is picked up for resumption, cleared once the outcome is applied.
    /// `content` itself is never mutated — the resumption token is
    /// substituted at submission time by `PromptSubmission::Resume`. This
    /// field exists so a crash mid-resume can still be told apart from a
    /// fresh submission on reload.
    pub original_content: Option<String>,
    pub priority: i64,
    pub working_directory: String,
    pub context_files: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: PromptStatus,
    #[serde(default)]
    pub execution_log: VecDeque<LogLine>,
    pub rate_limit_reset: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub estimated_tokens: Option<u64>,
}

impl Prompt {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        content: String,
        priority: i64,
        working_directory: String,
        context_files: Vec<String>,
        max_retries: u32,
        estimated_tokens: Option<u64>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            content,
            original_content: None,
            priority,
            working_directory,
            context_files,
            created_at: now,
            retry_count: 0,
            max_retries,
            status: PromptStatus::Queued,
            execution_log: VecDeque::new(),
            rate_limit_reset: None,
            last_error: None,
            estimated_tokens,
        }
    }

    pub fn can_retry(&self) -> bool {
        matches!(self.status, PromptStatus::Failed | PromptStatus::RateLimited)
            && self.retry_count < self.max_retries
    }

    /// Append a line to the bounded execution log, evicting the oldest line
    /// once `cap` is exceeded.
    pub fn push_log_line(&mut self, text: String, at: DateTime<Utc>, cap: usize) {
        self.execution_log.push_back(LogLine { at, text });
        while self.execution_log.len() > cap {
            self.execution_log.pop_front();
        }
    }
}
