use thiserror::Error;

use crate::queue::PromptStatus;

/// Errors from the persistent store (C1).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors from the queue state machine (C3) and processor (C4).
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("prompt not found: {0}")]
    NotFound(String),

    #[error("prompt {id} is in status {from:?}, which does not permit this transition")]
    InvalidTransition { id: String, from: PromptStatus },

    #[error("another prompt is already executing")]
    AlreadyExecuting,

    #[error("persistence failed: {0}")]
    Store(#[from] StoreError),
}

/// Errors from the account store (C5).
#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("account already exists: {0}")]
    AlreadyExists(String),

    #[error("account name is invalid: {0}")]
    InvalidName(String),

    #[error("no active credentials found")]
    NoActiveCredentials,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl QueueError {
    /// Sanitized message safe for returning over the control plane (C6).
    /// Never leaks internal paths or executor stderr.
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(id) => format!("prompt not found: {id}"),
            Self::InvalidTransition { id, .. } => {
                format!("prompt {id} cannot transition from its current status")
            }
            Self::AlreadyExecuting => "another prompt is already executing".to_string(),
            Self::Store(_) => "failed to persist queue state".to_string(),
        }
    }
}

impl AccountError {
    pub fn user_message(&self) -> String {
        match self {
            Self::NotFound(name) => format!("account not found: {name}"),
            Self::AlreadyExists(name) => format!("account already exists: {name}"),
            Self::InvalidName(_) => "account name must be filesystem-safe".to_string(),
            Self::NoActiveCredentials => "no active credentials to save".to_string(),
            Self::Io(_) | Self::Serde(_) => "account store operation failed".to_string(),
        }
    }
}
