//! Error types shared across the orchestration engine.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::crawler::task::TaskStatus;

/// Configuration-related errors. These are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Invalid task URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &str, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.to_string(),
            message: message.into(),
        }
    }
}

/// Why a submission was not accepted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("Task queue is full")]
    QueueFull,

    #[error("Task {0} is already queued")]
    Duplicate(String),

    #[error("Task {0} cannot be queued from its current status")]
    InvalidState(String),

    #[error("Orchestrator is not running")]
    NotRunning,
}

/// A task status change that the lifecycle state machine does not allow.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid transition for task {task_id}: {from} -> {to}")]
pub struct InvalidTransition {
    pub task_id: String,
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Classification of a failed execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    Network,
    Browser,
    Proxy,
    Captcha,
    BotDetected,
    CircuitOpen,
    Extraction,
    Output,
    Cancelled,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Network => "network",
            ErrorKind::Browser => "browser",
            ErrorKind::Proxy => "proxy",
            ErrorKind::Captcha => "captcha",
            ErrorKind::BotDetected => "bot_detected",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Extraction => "extraction",
            ErrorKind::Output => "output",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of a single execution attempt, as reported by a `TaskExecutor`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ExecutionError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
    /// Minimum wait before the next attempt makes sense (e.g. an open circuit).
    pub retry_after: Option<Duration>,
}

impl ExecutionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        let retryable = !matches!(kind, ErrorKind::Cancelled | ErrorKind::Internal);
        Self {
            kind,
            message: message.into(),
            retryable,
            retry_after: None,
        }
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            retryable: false,
            ..Self::new(kind, message)
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }

    pub fn timeout(after: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("Task timed out after {}ms", after.as_millis()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "Task was cancelled")
    }
}

/// Error returned by `CircuitBreaker::call`.
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The circuit rejected the call without attempting it.
    #[error("Circuit '{name}' is open")]
    Open { name: String, retry_after: Duration },

    /// The wrapped operation ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl<E: fmt::Display> BreakerError<E> {
    /// Convert into an execution failure, mapping the inner error with `kind`.
    pub fn into_execution(self, kind: ErrorKind) -> ExecutionError {
        match self {
            BreakerError::Open { name, retry_after } => ExecutionError::new(
                ErrorKind::CircuitOpen,
                format!("Circuit '{}' is open", name),
            )
            .with_retry_after(retry_after),
            BreakerError::Inner(e) => ExecutionError::new(kind, e.to_string()),
        }
    }
}
